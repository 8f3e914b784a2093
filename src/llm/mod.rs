//! LLM 层：推理能力抽象与实现（OpenAI 兼容 / Mock）

pub mod mock;
pub mod openai;
pub mod parse;
pub mod traits;

use std::sync::Arc;

use crate::config::AppConfig;

pub use mock::MockLlmClient;
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::{complete_with_timeout, CompletionRequest, LlmClient, LlmError};

/// 根据配置选择推理后端：配置的 API Key 环境变量存在则用 OpenAI 兼容客户端，否则退回 Mock
/// （Mock 的每次调用都会失败，各组件走各自的兜底逻辑）
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    match std::env::var(&cfg.llm.api_key_env) {
        Ok(key) if !key.trim().is_empty() => {
            tracing::info!(model = %cfg.llm.model, "Using OpenAI-compatible LLM");
            Arc::new(OpenAiClient::new(
                cfg.llm.base_url.as_deref(),
                &cfg.llm.model,
                &key,
            ))
        }
        _ => {
            tracing::warn!(
                env = %cfg.llm.api_key_env,
                "No API key set, using Mock LLM (all reasoning calls fall back)"
            );
            Arc::new(MockLlmClient::new())
        }
    }
}
