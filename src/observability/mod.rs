//! 可观测性：tracing 订阅器与审计日志辅助

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 默认 info，可通过 RUST_LOG 覆盖
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// 状态机迁移审计
pub fn log_transition(task_id: &str, from: &str, to: &str, reason: &str) {
    tracing::info!(task_id, from, to, "workflow transition");
    tracing::debug!(task_id, reason, "transition reason");
}

/// 截断参数/结果预览，避免审计日志过长
pub fn preview(value: &serde_json::Value, max_chars: usize) -> String {
    let s = value.to_string();
    if s.chars().count() > max_chars {
        format!("{}...", s.chars().take(max_chars).collect::<String>())
    } else {
        s
    }
}
