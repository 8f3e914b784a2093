//! Result Evaluator：全部步骤执行完后判定任务是否完成
//!
//! 推理能力返回 ```is_done``` 与 ```explanation``` 两个标签块；缺失时视为未完成、说明为空。
//! 推理失败时退回中性判定（未完成 + 固定说明），同样经过强制终止策略，评估永远不会中断工作流。

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};

use crate::config::{AppConfig, SamplingSection};
use crate::core::AgentError;
use crate::llm::parse::{extract_tagged_block, parse_truthy};
use crate::llm::{complete_with_timeout, CompletionRequest, LlmClient};
use crate::memory::StateStore;
use crate::workflow::types::{
    Evaluation, EvaluationStatus, ExecutionRecord, ExecutionStatus, NextAction, TaskState,
    TaskStatus, FORCED_DONE_THRESHOLD,
};

const EVALUATOR_SYSTEM_PROMPT: &str = "You are an expert in Anti-Money Laundering (AML) analysis. Provide detailed evaluations of financial transactions and entities to identify potential money laundering activities.";

pub const NEUTRAL_EXPLANATION: &str =
    "Not enough information to determine whether the task is complete.";

const SUMMARY_LIST_LIMIT: usize = 10;

/// 一轮评估应用强制终止策略后的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminationVerdict {
    pub is_done: bool,
    pub is_done_false_count: u32,
    pub forced_done: bool,
}

/// is_done=true 清零计数；is_done=false 计数加一（在阈值处饱和），达到阈值即强制完成
pub fn apply_termination_policy(raw_is_done: bool, previous_false_count: u32) -> TerminationVerdict {
    if raw_is_done {
        return TerminationVerdict {
            is_done: true,
            is_done_false_count: 0,
            forced_done: false,
        };
    }
    let count = previous_false_count
        .saturating_add(1)
        .min(FORCED_DONE_THRESHOLD);
    let forced = count >= FORCED_DONE_THRESHOLD;
    TerminationVerdict {
        is_done: forced,
        is_done_false_count: count,
        forced_done: forced,
    }
}

/// 解析推理回复中的 is_done / explanation 块
pub fn parse_verdict(reply: &str) -> (bool, String) {
    let is_done = extract_tagged_block(reply, "is_done")
        .map(|token| parse_truthy(&token))
        .unwrap_or(false);
    let explanation = extract_tagged_block(reply, "explanation").unwrap_or_default();
    (is_done, explanation)
}

pub struct ResultEvaluator {
    store: Arc<StateStore>,
    llm: Arc<dyn LlmClient>,
    sampling: SamplingSection,
    llm_timeout: Duration,
}

impl ResultEvaluator {
    pub fn new(store: Arc<StateStore>, llm: Arc<dyn LlmClient>, cfg: &AppConfig) -> Self {
        Self {
            store,
            llm,
            sampling: cfg.llm.evaluator,
            llm_timeout: cfg.llm.request_timeout(),
        }
    }

    /// 执行未完成时返回 incomplete（不落库）；否则完成一轮评估并写回 evaluation
    pub async fn evaluate(&self, task_id: &str) -> Result<Evaluation, AgentError> {
        let state = self.store.load_existing(task_id)?;
        if state.execution.status != ExecutionStatus::Completed {
            return Ok(Evaluation::incomplete());
        }

        let (raw_is_done, explanation) = self.judge(task_id, &state).await;
        let verdict = apply_termination_policy(raw_is_done, state.evaluation.is_done_false_count);

        let mut extra = Map::new();
        if let Some(level) = latest_result_field(&state.execution.steps, "risk_level") {
            extra.insert("risk_level".into(), level);
        }
        if let Some(score) = latest_result_field(&state.execution.steps, "overall_score")
            .or_else(|| latest_result_field(&state.execution.steps, "risk_score"))
        {
            extra.insert("risk_score".into(), score);
        }

        let evaluation = Evaluation {
            status: EvaluationStatus::Completed,
            is_done: verdict.is_done,
            is_done_false_count: verdict.is_done_false_count,
            forced_done: verdict.forced_done,
            explanation,
            next_action: verdict.is_done.then_some(NextAction::Complete),
            message: None,
            steps_summary: Some(steps_summary(&state.execution.steps)),
            extra,
        };

        let mut delta = Map::new();
        delta.insert("evaluation".into(), serde_json::to_value(&evaluation)?);
        if evaluation.is_done && state.task.status != TaskStatus::Aborted {
            delta.insert("task".into(), json!({ "status": "completed" }));
        }
        self.store.update_state(task_id, delta)?;

        tracing::info!(
            task_id,
            is_done = evaluation.is_done,
            forced_done = evaluation.forced_done,
            false_count = evaluation.is_done_false_count,
            "evaluation round finished"
        );
        if evaluation.forced_done {
            tracing::warn!(task_id, threshold = FORCED_DONE_THRESHOLD, "task forced to done after repeated negative verdicts");
        }
        Ok(evaluation)
    }

    async fn judge(&self, task_id: &str, state: &TaskState) -> (bool, String) {
        let request = CompletionRequest::new(EVALUATOR_SYSTEM_PROMPT, evaluation_context(state))
            .with_sampling(self.sampling.max_tokens, self.sampling.temperature);
        match complete_with_timeout(self.llm.as_ref(), &request, self.llm_timeout).await {
            Ok(reply) => parse_verdict(&reply),
            Err(e) => {
                tracing::warn!(task_id, error = %e, "evaluation call failed, using neutral verdict");
                (false, NEUTRAL_EXPLANATION.to_string())
            }
        }
    }
}

/// 最后一个含该字段的步骤结果中的值
fn latest_result_field(steps: &[ExecutionRecord], key: &str) -> Option<Value> {
    steps
        .iter()
        .rev()
        .find_map(|s| s.result.get(key).filter(|v| !v.is_null()).cloned())
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn array_len(result: &Value, key: &str) -> Option<usize> {
    result.get(key).and_then(Value::as_array).map(Vec::len)
}

/// 步骤结果的一句话摘要
pub fn summarize_result(result: &Value) -> String {
    let Some(obj) = result.as_object().filter(|o| !o.is_empty()) else {
        return "No results".to_string();
    };

    let mut parts = Vec::new();
    if let Some(n) = array_len(result, "transactions") {
        parts.push(format!("Found {} transactions", n));
    }
    if let Some(n) = array_len(result, "entities") {
        parts.push(format!("Found {} entities", n));
    }
    if let Some(score) = obj.get("risk_score") {
        parts.push(format!("Risk score: {}", render_value(score)));
    }
    if let Some(level) = obj.get("risk_level") {
        parts.push(format!("Risk level: {}", render_value(level)));
    }
    if let Some(n) = array_len(result, "suspicious_patterns") {
        parts.push(format!("Found {} suspicious patterns", n));
    }

    if parts.is_empty() {
        let keys: Vec<&str> = obj.keys().map(String::as_str).collect();
        format!("Result keys: {}", keys.join(", "))
    } else {
        parts.join("; ")
    }
}

/// 步骤结果的多行可读文本
pub fn format_step_output(output: &Value) -> String {
    let is_empty = match output {
        Value::Null => true,
        Value::Object(o) => o.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::String(s) => s.is_empty(),
        _ => false,
    };
    if is_empty {
        return "No output.".to_string();
    }

    let mut lines = Vec::new();
    match output {
        Value::Object(obj) => {
            for (key, value) in obj {
                match value {
                    Value::Array(items) => {
                        lines.push(format!("{}:", key));
                        for item in items {
                            match item {
                                Value::Object(fields) => lines.extend(
                                    fields
                                        .iter()
                                        .map(|(k, v)| format!("    {}: {}", k, render_value(v))),
                                ),
                                other => lines.push(format!("  - {}", render_value(other))),
                            }
                        }
                    }
                    Value::Object(fields) => {
                        lines.push(format!("{}:", key));
                        lines.extend(
                            fields
                                .iter()
                                .map(|(k, v)| format!("    {}: {}", k, render_value(v))),
                        );
                    }
                    other => lines.push(format!("{}: {}", key, render_value(other))),
                }
            }
        }
        Value::Array(items) => {
            lines.extend(items.iter().map(|item| format!("  - {}", render_value(item))));
        }
        other => lines.push(render_value(other)),
    }
    lines.join("\n")
}

/// 供展示的全部步骤概要
pub fn steps_summary(steps: &[ExecutionRecord]) -> String {
    let mut lines = vec!["[Agent Summary of Actions]".to_string()];
    for step in steps {
        lines.push(format!("[Step {}] {}", step.step_id, step.description));
        lines.push(format!("  Tool: {}", step.tool));
        lines.push(format!(
            "  Parameters: {}",
            Value::Object(step.parameters.clone())
        ));
        lines.push(format!("  Output:\n{}\n", format_step_output(&step.result)));
    }
    lines.join("\n")
}

fn collect_from_results(steps: &[ExecutionRecord], keys: &[&str]) -> Vec<Value> {
    steps
        .iter()
        .flat_map(|s| {
            keys.iter()
                .filter_map(|k| s.result.get(*k).and_then(Value::as_array))
                .flatten()
                .cloned()
                .collect::<Vec<_>>()
        })
        .collect()
}

fn field_or<'a>(item: &'a Value, key: &str, default: &'a str) -> String {
    item.get(key).map(render_value).unwrap_or_else(|| default.to_string())
}

fn limited_lines(items: &[Value], render: impl Fn(&Value) -> String, noun: &str) -> String {
    let mut lines: Vec<String> = items.iter().take(SUMMARY_LIST_LIMIT).map(render).collect();
    if items.len() > SUMMARY_LIST_LIMIT {
        lines.push(format!("...and {} more {}", items.len() - SUMMARY_LIST_LIMIT, noun));
    }
    lines.join("\n")
}

/// 评估 prompt：任务描述、步骤摘要、交易与实体摘要、原始数据、输出格式要求
pub fn evaluation_context(state: &TaskState) -> String {
    let steps = &state.execution.steps;
    let step_lines: Vec<String> = steps
        .iter()
        .map(|s| {
            format!(
                "Step {}: {} - {}\n{}",
                s.step_id,
                s.tool,
                summarize_result(&s.result),
                format_step_output(&s.result)
            )
        })
        .collect();

    let transactions = collect_from_results(steps, &["transactions"]);
    let entities = collect_from_results(steps, &["entities", "profiles"]);
    let tx_summary = limited_lines(
        &transactions,
        |tx| {
            format!(
                "Transaction {}: {} -> {}, Amount: {}",
                field_or(tx, "id", "unknown"),
                field_or(tx, "sender", "unknown"),
                field_or(tx, "receiver", "unknown"),
                field_or(tx, "amount", "0"),
            )
        },
        "transactions",
    );
    let entity_summary = limited_lines(
        &entities,
        |e| {
            let risk = e
                .get("risk_score")
                .or_else(|| e.get("risk_level"))
                .map(render_value)
                .unwrap_or_else(|| "unknown".to_string());
            format!(
                "Entity {}: Type: {}, Risk: {}",
                field_or(e, "id", "unknown"),
                field_or(e, "type", "unknown"),
                risk
            )
        },
        "entities",
    );

    let raw_steps = serde_json::to_string_pretty(steps).unwrap_or_default();
    format!(
        "# AML Detection Task Evaluation\n\n\
## Task Description\n{}\n\n\
## Execution Steps Summary\n{}\n\n\
## Transaction Data\n{}\n\n\
## Entity Data\n{}\n\n\
## Raw Data for Analysis\nExecution Steps: {}\n\n\
## Evaluation Instructions\n\
As an AML expert, please analyze the above data and provide:\n\
1. Whether the task is complete. Return only True or False in a code block labeled 'is_done'.\n\
2. A detailed explanation of your reasoning in a code block labeled 'explanation'.\n\n\
Example output:\n```is_done\nTrue\n```\n```explanation\n# Your explanation here\n```\n\
Return only these two code blocks, nothing else.\n",
        state.task.description,
        step_lines.join("\n"),
        tx_summary,
        entity_summary,
        raw_steps,
    )
}
