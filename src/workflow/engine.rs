//! 工作流引擎
//!
//! 状态机：Orchestrate → Plan → Execute → Evaluate → {Execute | Plan | Complete}。
//! 一次 run 从 Orchestrate 同步驱动到 Complete，每个状态只通过状态库读写任务状态。

use std::fmt;
use std::sync::Arc;

use crate::core::AgentError;
use crate::memory::StateStore;
use crate::observability::log_transition;
use crate::workflow::evaluator::ResultEvaluator;
use crate::workflow::executor::{StepExecutor, StepOutcome};
use crate::workflow::orchestrator::Orchestrator;
use crate::workflow::planner::PlanGenerator;
use crate::workflow::types::{Evaluation, EvaluationStatus, NextAction, TaskState};

/// 状态机的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Orchestrate,
    Plan,
    Execute,
    Evaluate,
    Complete,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Orchestrate => "orchestrate",
            Phase::Plan => "plan",
            Phase::Execute => "execute",
            Phase::Evaluate => "evaluate",
            Phase::Complete => "complete",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 评估后的路由：completed → Complete；否则按 next_action，缺省为 Complete
pub fn route_after_evaluation(evaluation: &Evaluation) -> Phase {
    if evaluation.status == EvaluationStatus::Completed {
        return Phase::Complete;
    }
    match evaluation.next_action {
        Some(NextAction::ContinueExecution) => Phase::Execute,
        Some(NextAction::Replan) => Phase::Plan,
        Some(NextAction::Complete) | None => Phase::Complete,
    }
}

pub struct WorkflowEngine {
    store: Arc<StateStore>,
    orchestrator: Arc<Orchestrator>,
    planner: Arc<PlanGenerator>,
    executor: Arc<StepExecutor>,
    evaluator: Arc<ResultEvaluator>,
}

impl WorkflowEngine {
    pub fn new(
        store: Arc<StateStore>,
        orchestrator: Arc<Orchestrator>,
        planner: Arc<PlanGenerator>,
        executor: Arc<StepExecutor>,
        evaluator: Arc<ResultEvaluator>,
    ) -> Self {
        Self {
            store,
            orchestrator,
            planner,
            executor,
            evaluator,
        }
    }

    /// 从 Orchestrate 驱动到 Complete 并返回最终状态
    ///
    /// 仅在任务不存在或状态库不可用时返回错误；能力失败都由各组件就地兜底。
    pub async fn run(&self, task_id: &str) -> Result<TaskState, AgentError> {
        if !self.store.task_exists(task_id)? {
            return Err(AgentError::TaskNotFound(task_id.to_string()));
        }

        let mut phase = Phase::Orchestrate;
        while phase != Phase::Complete {
            let (next, reason) = self.step(task_id, phase).await?;
            log_transition(task_id, phase.as_str(), next.as_str(), &reason);
            phase = next;
        }

        self.store.load(task_id)
    }

    async fn step(&self, task_id: &str, phase: Phase) -> Result<(Phase, String), AgentError> {
        match phase {
            Phase::Orchestrate => {
                let status = self.orchestrator.apply_pending_feedback(task_id)?;
                Ok((Phase::Plan, format!("task status {}", status.as_str())))
            }
            Phase::Plan => {
                let state = self.store.load(task_id)?;
                if state.plan.is_empty() {
                    let plan = self.planner.create_plan(task_id).await?;
                    Ok((Phase::Execute, format!("planned {} steps", plan.len())))
                } else {
                    Ok((Phase::Execute, "plan already present".to_string()))
                }
            }
            Phase::Execute => {
                let reason = match self.executor.execute_step(task_id, None).await? {
                    StepOutcome::Executed(record) => format!("executed step {}", record.step_id),
                    StepOutcome::AlreadyExecuted(record) => {
                        format!("step {} already executed", record.step_id)
                    }
                    StepOutcome::AllStepsCompleted => "all steps executed".to_string(),
                };
                Ok((Phase::Evaluate, reason))
            }
            Phase::Evaluate => {
                let evaluation = self.evaluator.evaluate(task_id).await?;
                let next = route_after_evaluation(&evaluation);
                let reason = match evaluation.status {
                    EvaluationStatus::Completed => format!(
                        "verdict is_done={} forced_done={}",
                        evaluation.is_done, evaluation.forced_done
                    ),
                    _ => evaluation
                        .message
                        .clone()
                        .unwrap_or_else(|| "evaluation pending".to_string()),
                };
                Ok((next, reason))
            }
            Phase::Complete => Ok((Phase::Complete, "terminal".to_string())),
        }
    }
}
