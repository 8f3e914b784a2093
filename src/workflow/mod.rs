//! 任务工作流：状态模型、编排、规划、执行、评估与驱动它们的状态机

pub mod engine;
pub mod evaluator;
pub mod executor;
pub mod orchestrator;
pub mod planner;
pub mod types;

pub use engine::{route_after_evaluation, Phase, WorkflowEngine};
pub use evaluator::{apply_termination_policy, ResultEvaluator, TerminationVerdict};
pub use executor::{StepExecutor, StepOutcome};
pub use orchestrator::Orchestrator;
pub use planner::{fallback_plan, PlanGenerator};
pub use types::*;
