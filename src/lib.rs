//! AML Agent：调查任务工作流引擎
//!
//! 模块划分：
//! - **agent**: 无头 Agent 运行时（装配组件、investigate、chat）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型
//! - **llm**: 推理能力抽象与实现（OpenAI 兼容 / Mock）与输出解析
//! - **memory**: SQLite 状态库与会话
//! - **observability**: tracing 初始化与审计日志
//! - **tools**: 检索、分析能力与按工具名分派的 ToolDispatcher
//! - **workflow**: 任务状态模型与规划 → 执行 → 评估状态机

pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod tools;
pub mod workflow;

pub use agent::Agent;
pub use core::AgentError;
