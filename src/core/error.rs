//! 错误类型
//!
//! 分两类：致命（任务/步骤不存在、存储不可用）直接返回给调用方；
//! 能力失败（LLM、检索、分析工具、外部载荷解析）只在组件内部出现，由组件转为确定性的兜底值。

use thiserror::Error;

/// 工作流运行过程中可能出现的错误
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Step {step_id} not found in the plan of task {task_id}")]
    StepNotFound { task_id: String, step_id: u32 },

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Storage I/O error: {0}")]
    StorageIo(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("Capability timeout: {0}")]
    CapabilityTimeout(String),

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("JSON parse error: {0}")]
    JsonParseError(String),

    #[error("Capability not configured: {0}")]
    NotConfigured(String),
}

impl AgentError {
    /// 不存在的任务/步骤与存储故障必须交给调用方；其余都有本地兜底
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AgentError::TaskNotFound(_)
                | AgentError::StepNotFound { .. }
                | AgentError::Storage(_)
                | AgentError::StorageIo(_)
                | AgentError::Serialization(_)
        )
    }
}
