//! 推理能力抽象
//!
//! 所有后端实现 LlmClient::complete(system, user, max_tokens, temperature) -> text。
//! 调用方统一经 complete_with_timeout 施加超时，超时与失败都视为能力失败。

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::timeout;

/// 一次补全请求
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub system: String,
    pub user: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl CompletionRequest {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
            max_tokens: 1000,
            temperature: 0.2,
        }
    }

    pub fn with_sampling(mut self, max_tokens: u32, temperature: f32) -> Self {
        self.max_tokens = max_tokens;
        self.temperature = temperature;
        self
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("LLM request failed: {0}")]
    Request(String),

    #[error("LLM request timed out after {0:?}")]
    Timeout(Duration),

    #[error("No LLM backend configured")]
    NotConfigured,
}

/// 推理客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError>;

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}

/// 在超时内完成一次推理调用
pub async fn complete_with_timeout(
    llm: &dyn LlmClient,
    request: &CompletionRequest,
    limit: Duration,
) -> Result<String, LlmError> {
    match timeout(limit, llm.complete(request)).await {
        Ok(result) => result,
        Err(_) => Err(LlmError::Timeout(limit)),
    }
}
