//! Step Executor：每次推进计划中的一步
//!
//! 未指定 step_id 时选计划中尚未执行的最小 id；执行记录与 tool_calls 审计记录在同一个 delta 中写回。
//! 写入覆盖最后一个未执行步骤的记录时，同一 delta 把 execution.status 置为 completed。

use std::sync::Arc;

use serde_json::{json, Map, Value};

use crate::core::AgentError;
use crate::memory::StateStore;
use crate::tools::ToolDispatcher;
use crate::workflow::types::{
    ExecutionRecord, ExecutionStatus, StepId, TaskState, ToolCallRecord,
};

/// execute_step 的结果
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// 本次新执行的步骤（时间戳已由状态库写入）
    Executed(ExecutionRecord),
    /// 请求的步骤此前已执行，未做任何修改
    AlreadyExecuted(ExecutionRecord),
    /// 计划中已没有待执行步骤
    AllStepsCompleted,
}

impl StepOutcome {
    pub fn record(&self) -> Option<&ExecutionRecord> {
        match self {
            StepOutcome::Executed(r) | StepOutcome::AlreadyExecuted(r) => Some(r),
            StepOutcome::AllStepsCompleted => None,
        }
    }
}

pub struct StepExecutor {
    store: Arc<StateStore>,
    dispatcher: Arc<ToolDispatcher>,
}

impl StepExecutor {
    pub fn new(store: Arc<StateStore>, dispatcher: Arc<ToolDispatcher>) -> Self {
        Self { store, dispatcher }
    }

    /// 执行指定步骤或下一个待执行步骤
    ///
    /// 指定的 step_id 不在计划中时返回 StepNotFound，且不修改状态。
    pub async fn execute_step(
        &self,
        task_id: &str,
        step_id: Option<StepId>,
    ) -> Result<StepOutcome, AgentError> {
        let state = self.store.load_existing(task_id)?;

        let step = match step_id {
            Some(id) => {
                let step = state.plan.iter().find(|s| s.step_id == id).ok_or_else(|| {
                    AgentError::StepNotFound {
                        task_id: task_id.to_string(),
                        step_id: id,
                    }
                })?;
                if let Some(existing) = state.execution.record(id) {
                    tracing::debug!(task_id, step_id = id, "step already executed, skipping");
                    return Ok(StepOutcome::AlreadyExecuted(existing.clone()));
                }
                step.clone()
            }
            None => match state.next_pending_step() {
                Some(step) => step.clone(),
                None => {
                    self.mark_completed(task_id, &state)?;
                    return Ok(StepOutcome::AllStepsCompleted);
                }
            },
        };

        tracing::info!(task_id, step_id = step.step_id, tool = %step.tool, "executing step");
        let result = self.dispatcher.dispatch(&step).await;

        let record = ExecutionRecord::from_step(&step, result.clone());
        let mut next = state.clone();
        next.execution.steps.push(record);
        next.tool_calls.push(ToolCallRecord {
            tool: step.tool.clone(),
            parameters: step.parameters.clone(),
            result,
            timestamp: None,
        });
        if next.all_steps_executed() {
            next.execution.status = ExecutionStatus::Completed;
        }

        let mut delta = Map::new();
        delta.insert("execution".into(), serde_json::to_value(&next.execution)?);
        delta.insert("tool_calls".into(), serde_json::to_value(&next.tool_calls)?);
        self.store.update_state(task_id, delta)?;

        if next.execution.status == ExecutionStatus::Completed {
            tracing::info!(task_id, steps = next.execution.steps.len(), "all plan steps executed");
        }

        let stored = self
            .store
            .load(task_id)?
            .execution
            .record(step.step_id)
            .cloned();
        Ok(StepOutcome::Executed(stored.unwrap_or_else(|| {
            ExecutionRecord::from_step(&step, Value::Null)
        })))
    }

    fn mark_completed(&self, task_id: &str, state: &TaskState) -> Result<(), AgentError> {
        if state.execution.status == ExecutionStatus::Completed {
            return Ok(());
        }
        let mut delta = Map::new();
        delta.insert("execution".into(), json!({ "status": "completed" }));
        self.store.update_state(task_id, delta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::llm::MockLlmClient;
    use crate::tools::MockAnalysisClient;
    use crate::workflow::types::Step;

    fn step(id: StepId, tool: &str) -> Step {
        Step {
            step_id: id,
            description: format!("step {id}"),
            tool: tool.to_string(),
            parameters: Map::new(),
        }
    }

    fn setup(plan: Vec<Step>) -> (Arc<StateStore>, StepExecutor, String) {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let mut state = TaskState::initial("Investigate address X", Map::new());
        state.plan = plan;
        let task_id = store.create_task(state.to_document().unwrap()).unwrap();
        let dispatcher = Arc::new(ToolDispatcher::new(
            Arc::new(MockLlmClient::new()),
            None,
            Some(Arc::new(MockAnalysisClient::new())),
            &AppConfig::default(),
        ));
        let executor = StepExecutor::new(store.clone(), dispatcher);
        (store, executor, task_id)
    }

    #[tokio::test]
    async fn test_steps_run_in_ascending_order_and_complete_eagerly() {
        let (store, executor, task_id) =
            setup(vec![step(2, "risk_checker"), step(1, "fetch_transaction")]);

        let first = executor.execute_step(&task_id, None).await.unwrap();
        assert_eq!(first.record().unwrap().step_id, 1);
        assert!(first.record().unwrap().timestamp.is_some());
        assert_eq!(store.load(&task_id).unwrap().execution.status, ExecutionStatus::Pending);

        let second = executor.execute_step(&task_id, None).await.unwrap();
        assert_eq!(second.record().unwrap().step_id, 2);
        let state = store.load(&task_id).unwrap();
        assert_eq!(state.execution.status, ExecutionStatus::Completed);
        assert_eq!(state.tool_calls.len(), 2);
        assert_eq!(state.tool_calls[1].result["risk_level"], json!("medium"));

        assert_eq!(
            executor.execute_step(&task_id, None).await.unwrap(),
            StepOutcome::AllStepsCompleted
        );
    }

    #[tokio::test]
    async fn test_unknown_step_is_not_found_without_mutation() {
        let (store, executor, task_id) = setup(vec![
            step(1, "fetch_transaction"),
            step(2, "risk_checker"),
            step(3, "report_generator"),
        ]);
        let before = store.get_state(&task_id).unwrap();

        let err = executor.execute_step(&task_id, Some(99)).await.unwrap_err();
        assert!(matches!(err, AgentError::StepNotFound { step_id: 99, .. }));
        assert_eq!(store.get_state(&task_id).unwrap(), before);
    }

    #[tokio::test]
    async fn test_repeated_explicit_step_is_a_no_op() {
        let (store, executor, task_id) =
            setup(vec![step(1, "fetch_transaction"), step(2, "risk_checker")]);

        let first = executor.execute_step(&task_id, Some(2)).await.unwrap();
        assert!(matches!(first, StepOutcome::Executed(_)));
        let before = store.get_state(&task_id).unwrap();

        let again = executor.execute_step(&task_id, Some(2)).await.unwrap();
        assert_eq!(again, StepOutcome::AlreadyExecuted(first.record().unwrap().clone()));
        assert_eq!(store.get_state(&task_id).unwrap(), before);
        assert_eq!(store.load(&task_id).unwrap().execution.steps.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_plan_marks_execution_completed() {
        let (store, executor, task_id) = setup(Vec::new());
        let outcome = executor.execute_step(&task_id, None).await.unwrap();
        assert_eq!(outcome, StepOutcome::AllStepsCompleted);
        let state = store.load(&task_id).unwrap();
        assert_eq!(state.execution.status, ExecutionStatus::Completed);
        assert!(state.execution.steps.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_task_is_not_found() {
        let (_store, executor, _task_id) = setup(Vec::new());
        let err = executor.execute_step("nope", None).await.unwrap_err();
        assert!(matches!(err, AgentError::TaskNotFound(_)));
    }
}
