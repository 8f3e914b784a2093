//! 工具分派器
//!
//! 按 ToolKind 把一个计划步骤交给检索、分析或推理能力执行。dispatch 从不返回错误：
//! 能力失败或超时都会变成 `{"error": "..."}` 作为该步骤的结果；每次调用输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Map, Value};
use tokio::time::timeout;

use crate::config::{AppConfig, SamplingSection};
use crate::core::AgentError;
use crate::llm::{complete_with_timeout, CompletionRequest, LlmClient};
use crate::observability::preview;
use crate::tools::analysis::AnalysisClient;
use crate::tools::kind::{AnalysisTool, ToolKind};
use crate::tools::retrieval::{RetrievalClient, RetrievalQuery};
use crate::workflow::types::Step;

const REASONING_SYSTEM_PROMPT: &str = "You are an expert AML agent. Given the following step and parameters, perform the required analysis or action and return your findings as a JSON object.";

const UNPARSED_REPLY_WARNING: &str = "Could not parse model response as JSON.";

/// 工具分派器：持有三种能力与各自的超时
pub struct ToolDispatcher {
    llm: Arc<dyn LlmClient>,
    retrieval: Option<Arc<dyn RetrievalClient>>,
    analysis: Option<Arc<dyn AnalysisClient>>,
    sampling: SamplingSection,
    llm_timeout: Duration,
    retrieval_timeout: Duration,
    analysis_timeout: Duration,
    default_top_k: usize,
}

impl ToolDispatcher {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        retrieval: Option<Arc<dyn RetrievalClient>>,
        analysis: Option<Arc<dyn AnalysisClient>>,
        cfg: &AppConfig,
    ) -> Self {
        Self {
            llm,
            retrieval,
            analysis,
            sampling: cfg.llm.executor,
            llm_timeout: cfg.llm.request_timeout(),
            retrieval_timeout: Duration::from_secs(cfg.retrieval.timeout_secs),
            analysis_timeout: Duration::from_secs(cfg.analysis.timeout_secs),
            default_top_k: cfg.retrieval.top_k,
        }
    }

    /// 执行一个步骤并返回其结果
    pub async fn dispatch(&self, step: &Step) -> Value {
        let start = Instant::now();
        let kind = ToolKind::resolve(&step.tool);
        let outcome = match kind {
            ToolKind::Retrieval => self.run_retrieval(&step.parameters).await,
            ToolKind::Analysis(tool) => self.run_analysis(tool, &step.parameters).await,
            ToolKind::Reasoning => self.run_reasoning(step).await,
        };

        let ok = outcome.is_ok();
        let audit = json!({
            "event": "tool_audit",
            "tool": step.tool,
            "step_id": step.step_id,
            "kind": kind_label(kind),
            "ok": ok,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": preview(&Value::Object(step.parameters.clone()), 200),
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        match outcome {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(tool = %step.tool, step_id = step.step_id, error = %e, "step capability failed");
                json!({ "error": e.to_string() })
            }
        }
    }

    async fn run_retrieval(&self, params: &Map<String, Value>) -> Result<Value, AgentError> {
        let client = self
            .retrieval
            .as_ref()
            .ok_or_else(|| AgentError::NotConfigured("retrieval".to_string()))?;
        let query = params
            .get("query")
            .and_then(Value::as_str)
            .filter(|q| !q.trim().is_empty())
            .ok_or_else(|| AgentError::ToolExecutionFailed("Missing 'query' in payload".to_string()))?;
        let top_k = params
            .get("top_k")
            .and_then(Value::as_u64)
            .map(|k| k as usize)
            .unwrap_or(self.default_top_k);

        let request = RetrievalQuery::new(query, top_k);
        let matches = timeout(self.retrieval_timeout, client.query(&request))
            .await
            .map_err(|_| {
                AgentError::CapabilityTimeout(format!("retrieval after {:?}", self.retrieval_timeout))
            })?
            .map_err(AgentError::ToolExecutionFailed)?;
        Ok(json!({ "matches": matches }))
    }

    async fn run_analysis(
        &self,
        tool: AnalysisTool,
        params: &Map<String, Value>,
    ) -> Result<Value, AgentError> {
        let client = self
            .analysis
            .as_ref()
            .ok_or_else(|| AgentError::NotConfigured("analysis".to_string()))?;
        timeout(self.analysis_timeout, client.call_tool(tool.as_str(), params))
            .await
            .map_err(|_| {
                AgentError::CapabilityTimeout(format!("{} after {:?}", tool, self.analysis_timeout))
            })?
            .map_err(AgentError::ToolExecutionFailed)
    }

    async fn run_reasoning(&self, step: &Step) -> Result<Value, AgentError> {
        let request = CompletionRequest::new(REASONING_SYSTEM_PROMPT, step_prompt(step))
            .with_sampling(self.sampling.max_tokens, self.sampling.temperature);
        let reply = complete_with_timeout(self.llm.as_ref(), &request, self.llm_timeout)
            .await
            .map_err(|e| AgentError::LlmError(e.to_string()))?;
        Ok(parse_reasoning_reply(&reply))
    }
}

fn kind_label(kind: ToolKind) -> &'static str {
    match kind {
        ToolKind::Retrieval => "retrieval",
        ToolKind::Analysis(_) => "analysis",
        ToolKind::Reasoning => "reasoning",
    }
}

/// 推理步骤的 user prompt：描述、工具、参数（缩进 JSON）、指令
pub fn step_prompt(step: &Step) -> String {
    let params = serde_json::to_string_pretty(&step.parameters).unwrap_or_else(|_| "{}".to_string());
    format!(
        "# AML Agent Step\n\n## Step Description\n{}\n\n## Tool\n{}\n\n## Parameters\n{}\n\n## Instructions\nPerform the above step as an expert AML agent. If analysis is required, provide a summary, findings, and recommended next actions. Return your response as a JSON object.\n",
        step.description, step.tool, params
    )
}

/// 整段回复能解析为 JSON 时原样采用，否则包装为 {result, warning}
fn parse_reasoning_reply(reply: &str) -> Value {
    match serde_json::from_str::<Value>(reply.trim()) {
        Ok(value) => value,
        Err(_) => json!({ "result": reply, "warning": UNPARSED_REPLY_WARNING }),
    }
}
