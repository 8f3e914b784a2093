//! Plan Generator：为任务生成有序步骤列表
//!
//! 先收集参考资料（检索能力）与工具目录（分析能力）写入 context，再调用推理能力生成计划。
//! 推理失败、回复无法解析或计划为空时，退回单步计划（ai_model 回答任务描述）；任务永远不会没有计划。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use schemars::{schema_for, JsonSchema};
use serde_json::{json, Map, Value};
use tokio::time::timeout;

use crate::config::{AppConfig, SamplingSection};
use crate::core::AgentError;
use crate::llm::parse::extract_json_payload;
use crate::llm::{complete_with_timeout, CompletionRequest, LlmClient};
use crate::memory::StateStore;
use crate::tools::{AnalysisClient, RetrievalClient, RetrievalQuery, ToolSpec};
use crate::workflow::types::{Step, StepId, FALLBACK_TOOL};

const PLANNER_SYSTEM_PROMPT: &str = "You are an expert AML investigator. Create a detailed step-by-step plan for investigating potential money laundering activities.";

/// 计划 JSON 的格式（仅用于生成 Schema 拼入 prompt）
#[allow(dead_code)]
#[derive(JsonSchema)]
struct PlanFormat {
    /// 按执行顺序排列的步骤
    plan: Vec<PlanStepFormat>,
}

#[allow(dead_code)]
#[derive(JsonSchema)]
struct PlanStepFormat {
    step_id: u32,
    /// 本步动作的简短描述
    description: String,
    /// 工具名：可用工具之一，或 ai_model 表示通用推理
    tool: String,
    parameters: HashMap<String, Value>,
}

fn plan_schema_json() -> String {
    let schema = schema_for!(PlanFormat);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

/// 规划失败时的兜底：一步 ai_model，直接回答任务描述
pub fn fallback_plan(task_description: &str) -> Vec<Step> {
    let mut parameters = Map::new();
    parameters.insert("question".into(), json!(task_description));
    vec![Step {
        step_id: 1,
        description: format!("Answer the following question: {}", task_description),
        tool: FALLBACK_TOOL.to_string(),
        parameters,
    }]
}

/// 解析推理回复中的计划：接受 {"plan": [...]} 或裸数组；step_id 按返回顺序从 1 重新编号
pub fn parse_plan(reply: &str) -> Result<Vec<Step>, AgentError> {
    let payload = extract_json_payload(reply);
    let parsed: Value = serde_json::from_str(payload)
        .map_err(|e| AgentError::JsonParseError(format!("plan is not valid JSON: {}", e)))?;

    let items = match parsed {
        Value::Object(mut obj) => match obj.remove("plan") {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(AgentError::JsonParseError(
                    "plan JSON has no 'plan' array".to_string(),
                ))
            }
        },
        Value::Array(items) => items,
        _ => {
            return Err(AgentError::JsonParseError(
                "plan JSON is neither an object nor an array".to_string(),
            ))
        }
    };

    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| {
            let Value::Object(step) = item else {
                return Err(AgentError::JsonParseError(format!(
                    "plan entry {} is not an object",
                    i + 1
                )));
            };
            Ok(Step {
                step_id: (i + 1) as StepId,
                description: step
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                tool: step
                    .get("tool")
                    .and_then(Value::as_str)
                    .filter(|t| !t.trim().is_empty())
                    .unwrap_or(FALLBACK_TOOL)
                    .to_string(),
                parameters: step
                    .get("parameters")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default(),
            })
        })
        .collect()
}

pub struct PlanGenerator {
    store: Arc<StateStore>,
    llm: Arc<dyn LlmClient>,
    retrieval: Option<Arc<dyn RetrievalClient>>,
    analysis: Option<Arc<dyn AnalysisClient>>,
    sampling: SamplingSection,
    llm_timeout: Duration,
    retrieval_timeout: Duration,
    analysis_timeout: Duration,
    top_k: usize,
}

impl PlanGenerator {
    pub fn new(
        store: Arc<StateStore>,
        llm: Arc<dyn LlmClient>,
        retrieval: Option<Arc<dyn RetrievalClient>>,
        analysis: Option<Arc<dyn AnalysisClient>>,
        cfg: &AppConfig,
    ) -> Self {
        Self {
            store,
            llm,
            retrieval,
            analysis,
            sampling: cfg.llm.planner,
            llm_timeout: cfg.llm.request_timeout(),
            retrieval_timeout: Duration::from_secs(cfg.retrieval.timeout_secs),
            analysis_timeout: Duration::from_secs(cfg.analysis.timeout_secs),
            top_k: cfg.retrieval.top_k,
        }
    }

    /// 生成计划并写入 TaskState.plan（以及本轮收集到的 context）后返回
    pub async fn create_plan(&self, task_id: &str) -> Result<Vec<Step>, AgentError> {
        let state = self.store.load_existing(task_id)?;
        let description = state.task.description.clone();

        let mut gathered = Map::new();
        if let Some(rag_context) = self.gather_reference(&description).await {
            gathered.insert("rag_context".into(), rag_context);
        }
        if let Some(tools) = self.gather_catalog().await {
            gathered.insert("tools".into(), tools);
        }

        let mut context = state.context.clone();
        context.extend(gathered.clone());

        let plan = match self.generate(&description, &context).await {
            Ok(steps) if !steps.is_empty() => steps,
            Ok(_) => {
                tracing::warn!(task_id, "planner returned an empty plan, using single-step fallback");
                fallback_plan(&description)
            }
            Err(e) => {
                tracing::warn!(task_id, error = %e, "plan generation failed, using single-step fallback");
                fallback_plan(&description)
            }
        };

        let mut delta = Map::new();
        delta.insert("plan".into(), serde_json::to_value(&plan)?);
        if !gathered.is_empty() {
            delta.insert("context".into(), Value::Object(gathered));
        }
        self.store.update_state(task_id, delta)?;

        tracing::info!(task_id, steps = plan.len(), "plan created");
        for step in &plan {
            tracing::debug!(task_id, step_id = step.step_id, tool = %step.tool, description = %step.description, "plan step");
        }
        Ok(plan)
    }

    async fn generate(
        &self,
        description: &str,
        context: &Map<String, Value>,
    ) -> Result<Vec<Step>, AgentError> {
        let request = CompletionRequest::new(PLANNER_SYSTEM_PROMPT, planning_prompt(description, context))
            .with_sampling(self.sampling.max_tokens, self.sampling.temperature);
        let reply = complete_with_timeout(self.llm.as_ref(), &request, self.llm_timeout)
            .await
            .map_err(|e| AgentError::LlmError(e.to_string()))?;
        parse_plan(&reply)
    }

    /// 以任务描述查询检索能力；失败只记录日志
    async fn gather_reference(&self, description: &str) -> Option<Value> {
        let client = self.retrieval.as_ref()?;
        let query = RetrievalQuery::new(description, self.top_k);
        match timeout(self.retrieval_timeout, client.query(&query)).await {
            Ok(Ok(matches)) => {
                tracing::debug!(matches = matches.len(), "reference material gathered");
                Some(json!({ "matches": matches, "query": description }))
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "retrieval for planning context failed");
                None
            }
            Err(_) => {
                tracing::warn!(timeout = ?self.retrieval_timeout, "retrieval for planning context timed out");
                None
            }
        }
    }

    async fn gather_catalog(&self) -> Option<Value> {
        let client = self.analysis.as_ref()?;
        match timeout(self.analysis_timeout, client.list_tools()).await {
            Ok(Ok(tools)) => serde_json::to_value(tools).ok(),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "tool catalog unavailable");
                None
            }
            Err(_) => {
                tracing::warn!(timeout = ?self.analysis_timeout, "tool catalog request timed out");
                None
            }
        }
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// 规划 prompt：任务、历史 context、参考资料、可用工具、格式说明
pub fn planning_prompt(description: &str, context: &Map<String, Value>) -> String {
    let history: Vec<String> = context
        .iter()
        .filter(|(k, _)| k.as_str() != "rag_context" && k.as_str() != "tools")
        .map(|(k, v)| format!("{}: {}", k, render_value(v)))
        .collect();
    let history = if history.is_empty() {
        "No history provided.".to_string()
    } else {
        history.join("\n")
    };

    let reference = match context.get("rag_context") {
        Some(rag) => {
            let query = rag.get("query").and_then(Value::as_str).unwrap_or_default();
            let matches: Vec<&str> = rag
                .get("matches")
                .and_then(Value::as_array)
                .map(|m| m.iter().filter_map(Value::as_str).collect())
                .unwrap_or_default();
            if matches.is_empty() {
                format!("Query: {}\nNo relevant matches found.", query)
            } else {
                let mut out = format!("Query: {}\nMatches:\n", query);
                for (i, m) in matches.iter().enumerate() {
                    out.push_str(&format!("  {}. Content: {}\n", i + 1, m));
                }
                out
            }
        }
        None => "No RAG data available.".to_string(),
    };

    let tools: Vec<ToolSpec> = context
        .get("tools")
        .cloned()
        .and_then(|t| serde_json::from_value(t).ok())
        .unwrap_or_default();
    let tools = if tools.is_empty() {
        "No tools available.".to_string()
    } else {
        tools
            .iter()
            .map(|tool| {
                let params = if tool.parameters.is_empty() {
                    "None".to_string()
                } else {
                    tool.parameters
                        .iter()
                        .map(|p| format!("{} ({})", p.name, p.kind))
                        .collect::<Vec<_>>()
                        .join(", ")
                };
                format!("- {}: {} | Parameters: {}", tool.name, tool.description, params)
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        "# Task: {description}\n\n# History:\n{history}\n\n# Additional Data from RAG:\n{reference}\n\n# Available Tools:\n{tools}\n\n\
# Instructions:\n\
Create a clear, step-by-step plan to resolve the above task. You may use any of the available tools listed above. \
Each step must give a concise description of the action, the tool to use (one of the available tools, 'rag' for reference lookup, or 'ai_model' for general reasoning), and the parameters the tool needs.\n\
Usually the plan first gathers knowledge, then acts on it, and finally summarizes the findings, so it should have at least 3 steps.\n\n\
The plan must match this JSON Schema:\n{schema}\n\n\
Return ONLY the plan JSON inside a ```json code block. Do not include any explanation outside the code block.\n",
        schema = plan_schema_json(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmError, MockLlmClient};
    use crate::tools::MockAnalysisClient;
    use crate::workflow::TaskState;

    fn new_task(store: &StateStore, description: &str) -> String {
        store
            .create_task(TaskState::initial(description, Map::new()).to_document().unwrap())
            .unwrap()
    }

    #[test]
    fn test_parse_plan_renumbers_densely() {
        let reply = "Here you go:\n```json\n{\"plan\": [\
            {\"step_id\": 7, \"description\": \"look up\", \"tool\": \"rag\", \"parameters\": {\"query\": \"mixers\"}},\
            {\"description\": \"score\", \"tool\": \"risk_checker\"},\
            {\"step_id\": 2, \"description\": \"sum up\"}\
        ]}\n```";
        let plan = parse_plan(reply).unwrap();
        let ids: Vec<_> = plan.iter().map(|s| s.step_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(plan[0].parameters["query"], json!("mixers"));
        assert!(plan[1].parameters.is_empty());
        assert_eq!(plan[2].tool, FALLBACK_TOOL);
    }

    #[test]
    fn test_parse_plan_accepts_bare_array() {
        let plan = parse_plan("[{\"description\": \"a\", \"tool\": \"llm\"}]").unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].tool, "llm");
    }

    #[test]
    fn test_parse_plan_rejects_garbage() {
        assert!(parse_plan("I cannot help with that").is_err());
        assert!(parse_plan("{\"steps\": []}").is_err());
        assert!(parse_plan("[1, 2]").is_err());
    }

    #[tokio::test]
    async fn test_reasoning_failure_yields_fallback_plan() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let task_id = new_task(&store, "Investigate address X");
        let llm = Arc::new(MockLlmClient::scripted(vec![Err(LlmError::Request("down".into()))]));
        let planner = PlanGenerator::new(store.clone(), llm, None, None, &AppConfig::default());

        let plan = planner.create_plan(&task_id).await.unwrap();
        assert_eq!(plan, fallback_plan("Investigate address X"));
        assert_eq!(store.load(&task_id).unwrap().plan, plan);
    }

    #[tokio::test]
    async fn test_empty_plan_yields_fallback() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let task_id = new_task(&store, "Check 0xabc");
        let llm = Arc::new(MockLlmClient::scripted(vec![Ok("{\"plan\": []}".into())]));
        let planner = PlanGenerator::new(store, llm, None, None, &AppConfig::default());
        let plan = planner.create_plan(&task_id).await.unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].parameters["question"], json!("Check 0xabc"));
    }

    #[tokio::test]
    async fn test_catalog_lands_in_prompt_and_context() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let task_id = new_task(&store, "Check 0xabc");
        let llm = Arc::new(MockLlmClient::scripted(vec![Ok(
            "```json\n{\"plan\": [{\"description\": \"fetch\", \"tool\": \"fetch_transaction\", \"parameters\": {\"limit\": 5}}]}\n```".into(),
        )]));
        let planner = PlanGenerator::new(
            store.clone(),
            llm.clone(),
            None,
            Some(Arc::new(MockAnalysisClient::new())),
            &AppConfig::default(),
        );

        let plan = planner.create_plan(&task_id).await.unwrap();
        assert_eq!(plan[0].tool, "fetch_transaction");

        let prompt = &llm.requests()[0].user;
        assert!(prompt.contains("- fetch_transaction: Fetch transaction data from the blockchain. | Parameters: limit (int)"));
        assert!(prompt.contains("No RAG data available."));
        assert_eq!(llm.requests()[0].max_tokens, 1000);

        let state = store.load(&task_id).unwrap();
        assert_eq!(state.context["tools"][0]["name"], json!("fetch_transaction"));
    }

    #[test]
    fn test_prompt_lists_history_and_matches() {
        let mut ctx = Map::new();
        ctx.insert("analyst".into(), json!("alice"));
        ctx.insert(
            "rag_context".into(),
            json!({ "query": "mixers", "matches": ["doc one", "doc two"] }),
        );
        let prompt = planning_prompt("Check mixers", &ctx);
        assert!(prompt.contains("# Task: Check mixers"));
        assert!(prompt.contains("analyst: alice"));
        assert!(prompt.contains("  2. Content: doc two"));
        assert!(prompt.contains("No tools available."));
        assert!(prompt.contains("\"plan\""));
    }
}
