//! Mock LLM 客户端（无 API Key 时的退化后端，也用于测试）
//!
//! 三种模式：无脚本（每次调用都失败）、按顺序弹出脚本响应、按请求内容路由的处理函数。
//! 每次调用都会记录请求，测试可据此断言 prompt 内容与采样参数。

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::llm::{CompletionRequest, LlmClient, LlmError};

type Handler = Box<dyn Fn(&CompletionRequest) -> Result<String, LlmError> + Send + Sync>;

enum Mode {
    Unconfigured,
    Scripted(Mutex<VecDeque<Result<String, LlmError>>>),
    Handler(Handler),
}

/// Mock 客户端
pub struct MockLlmClient {
    mode: Mode,
    delay: Option<Duration>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl Default for MockLlmClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLlmClient {
    /// 所有调用返回 NotConfigured
    pub fn new() -> Self {
        Self {
            mode: Mode::Unconfigured,
            delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// 按顺序返回给定响应；用尽后返回 NotConfigured
    pub fn scripted(responses: Vec<Result<String, LlmError>>) -> Self {
        Self {
            mode: Mode::Scripted(Mutex::new(responses.into())),
            ..Self::new()
        }
    }

    pub fn with_handler<F>(handler: F) -> Self
    where
        F: Fn(&CompletionRequest) -> Result<String, LlmError> + Send + Sync + 'static,
    {
        Self {
            mode: Mode::Handler(Box::new(handler)),
            ..Self::new()
        }
    }

    /// 每次调用前先睡眠，用于超时测试
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match &self.mode {
            Mode::Unconfigured => Err(LlmError::NotConfigured),
            Mode::Scripted(queue) => queue
                .lock()
                .ok()
                .and_then(|mut q| q.pop_front())
                .unwrap_or(Err(LlmError::NotConfigured)),
            Mode::Handler(handler) => handler(request),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unconfigured_always_fails() {
        let llm = MockLlmClient::new();
        let req = CompletionRequest::new("s", "u");
        assert_eq!(llm.complete(&req).await, Err(LlmError::NotConfigured));
        assert_eq!(llm.call_count(), 1);
    }

    #[tokio::test]
    async fn test_scripted_pops_in_order_then_fails() {
        let llm = MockLlmClient::scripted(vec![
            Ok("first".to_string()),
            Err(LlmError::Request("503".to_string())),
        ]);
        let req = CompletionRequest::new("s", "u");
        assert_eq!(llm.complete(&req).await.unwrap(), "first");
        assert!(matches!(llm.complete(&req).await, Err(LlmError::Request(_))));
        assert_eq!(llm.complete(&req).await, Err(LlmError::NotConfigured));
    }

    #[tokio::test]
    async fn test_handler_routes_on_request() {
        let llm = MockLlmClient::with_handler(|req| Ok(format!("echo: {}", req.user)));
        let req = CompletionRequest::new("s", "hello");
        assert_eq!(llm.complete(&req).await.unwrap(), "echo: hello");
        assert_eq!(llm.requests()[0].system, "s");
    }
}
