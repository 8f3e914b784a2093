//! Orchestrator：创建任务与处理外部反馈
//!
//! 反馈只追加到 feedback 序列；由工作流的 Orchestrate 状态在下一次遍历时按顺序应用到任务状态。

use std::sync::Arc;

use serde_json::{json, Map, Value};

use crate::core::AgentError;
use crate::memory::StateStore;
use crate::workflow::types::{FeedbackEvent, TaskId, TaskState, TaskStatus};

pub struct Orchestrator {
    store: Arc<StateStore>,
}

impl Orchestrator {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self { store }
    }

    /// 新建任务：计划、执行、评估均为空，状态 started
    pub fn start_task(
        &self,
        description: &str,
        context: Map<String, Value>,
    ) -> Result<TaskId, AgentError> {
        let initial = TaskState::initial(description, context).to_document()?;
        let task_id = self.store.create_task(initial)?;
        tracing::info!(task_id = %task_id, description, "task started");
        Ok(task_id)
    }

    /// 追加一条反馈（读-追加-整体提交）；在下一次 run 的 Orchestrate 状态生效
    pub fn submit_feedback(&self, task_id: &str, event: FeedbackEvent) -> Result<(), AgentError> {
        let mut state = self.store.load_existing(task_id)?;
        tracing::info!(task_id, action = %event.action, "feedback received");
        state.feedback.push(event);

        let mut delta = Map::new();
        delta.insert("feedback".into(), serde_json::to_value(&state.feedback)?);
        self.store.update_state(task_id, delta)
    }

    /// 按顺序应用游标之后的反馈，返回应用后的任务状态
    pub fn apply_pending_feedback(&self, task_id: &str) -> Result<TaskStatus, AgentError> {
        let state = self.store.load_existing(task_id)?;
        let pending = state.feedback.get(state.task.feedback_applied..).unwrap_or_default();
        if pending.is_empty() {
            return Ok(state.task.status);
        }

        let mut status = state.task.status;
        for event in pending {
            match event.target_status() {
                Some(next) => {
                    tracing::info!(task_id, action = %event.action, from = status.as_str(), to = next.as_str(), "feedback applied");
                    status = next;
                }
                None => {
                    tracing::debug!(task_id, action = %event.action, "feedback recorded without status change");
                }
            }
        }

        let mut delta = Map::new();
        delta.insert(
            "task".into(),
            json!({ "status": status, "feedback_applied": state.feedback.len() }),
        );
        self.store.update_state(task_id, delta)?;
        Ok(status)
    }
}
