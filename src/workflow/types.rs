//! 任务状态模型
//!
//! 持久化的 TaskState 由状态库按 JSON 文档保存；各组件读到的是反序列化后的副本，
//! 写回时提交 delta（见 `memory::store::shallow_merge`），从不共享可变引用。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type TaskId = String;
pub type StepId = u32;

/// 连续 is_done=false 达到此轮数后强制判定完成，保证循环必然终止
pub const FORCED_DONE_THRESHOLD: u32 = 2;

/// 规划失败时兜底步骤使用的通用推理工具
pub const FALLBACK_TOOL: &str = "ai_model";

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Started,
    InProgress,
    Completed,
    Aborted,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Started => "started",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Aborted => "aborted",
        }
    }
}

/// 任务本身：描述、状态、创建时间；id 与 created_at 由状态库写入
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Task {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<TaskId>,
    pub description: String,
    pub status: TaskStatus,
    pub created_at: Option<String>,
    /// 已应用到 status 的 feedback 条数
    pub feedback_applied: usize,
}

/// 计划中的一步
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub step_id: StepId,
    pub description: String,
    pub tool: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    #[default]
    Pending,
    Completed,
}

/// 一步的执行记录：源 Step 的镜像 + 结果 + 时间戳（由状态库填写）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub step_id: StepId,
    pub description: String,
    pub tool: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl ExecutionRecord {
    pub fn from_step(step: &Step, result: Value) -> Self {
        Self {
            step_id: step.step_id,
            description: step.description.clone(),
            tool: step.tool.clone(),
            parameters: step.parameters.clone(),
            result,
            timestamp: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Execution {
    pub status: ExecutionStatus,
    pub steps: Vec<ExecutionRecord>,
}

impl Execution {
    pub fn is_executed(&self, step_id: StepId) -> bool {
        self.steps.iter().any(|s| s.step_id == step_id)
    }

    pub fn record(&self, step_id: StepId) -> Option<&ExecutionRecord> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }
}

/// tool_calls 审计记录，跨重新规划保留
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub tool: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationStatus {
    #[default]
    Pending,
    Incomplete,
    Completed,
}

/// 评估后的路由建议
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextAction {
    ContinueExecution,
    Replan,
    Complete,
}

/// 一轮评估结果；风险、摘要等自由字段保存在 extra
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Evaluation {
    pub status: EvaluationStatus,
    pub is_done: bool,
    pub is_done_false_count: u32,
    pub forced_done: bool,
    pub explanation: String,
    /// 始终序列化（含 null），浅合并时不会残留上一轮的路由建议
    pub next_action: Option<NextAction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub steps_summary: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Evaluation {
    /// 执行尚未完成时的判定：不落库，路由回执行器
    pub fn incomplete() -> Self {
        Self {
            status: EvaluationStatus::Incomplete,
            message: Some("Not all steps have been executed yet".to_string()),
            next_action: Some(NextAction::ContinueExecution),
            ..Self::default()
        }
    }

    /// extra 中的字符串字段（如 summary、risk_level）
    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(Value::as_str)
    }
}

/// 外部提交的反馈事件；action 之外的字段原样保存
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackEvent {
    pub action: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl FeedbackEvent {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            extra: Map::new(),
        }
    }

    /// continue / complete / abort 映射到任务状态，其余动作只记录
    pub fn target_status(&self) -> Option<TaskStatus> {
        match self.action.as_str() {
            "continue" => Some(TaskStatus::InProgress),
            "complete" => Some(TaskStatus::Completed),
            "abort" => Some(TaskStatus::Aborted),
            _ => None,
        }
    }
}

/// 任务的完整持久化记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TaskState {
    pub task: Task,
    pub plan: Vec<Step>,
    pub execution: Execution,
    pub evaluation: Evaluation,
    pub tool_calls: Vec<ToolCallRecord>,
    pub context: Map<String, Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub feedback: Vec<FeedbackEvent>,
    pub messages: Vec<Value>,
}

impl TaskState {
    /// 新任务的初始状态：计划/执行/评估均为空
    pub fn initial(description: impl Into<String>, context: Map<String, Value>) -> Self {
        Self {
            task: Task {
                description: description.into(),
                ..Task::default()
            },
            context,
            ..Self::default()
        }
    }

    /// 从状态库文档反序列化；未知任务得到的空文档对应默认状态
    pub fn from_document(doc: Map<String, Value>) -> Result<Self, serde_json::Error> {
        serde_json::from_value(Value::Object(doc))
    }

    pub fn to_document(&self) -> Result<Map<String, Value>, serde_json::Error> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            _ => Ok(Map::new()),
        }
    }

    /// 计划中尚未执行的最小 step_id
    pub fn next_pending_step(&self) -> Option<&Step> {
        self.plan
            .iter()
            .filter(|step| !self.execution.is_executed(step.step_id))
            .min_by_key(|step| step.step_id)
    }

    /// 计划中每个 step_id 都已有执行记录
    pub fn all_steps_executed(&self) -> bool {
        self.plan
            .iter()
            .all(|step| self.execution.is_executed(step.step_id))
    }
}

/// 状态库的任务列表条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub task_id: TaskId,
    pub description: String,
    pub status: TaskStatus,
    pub created_at: String,
    pub updated_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(id: StepId) -> Step {
        Step {
            step_id: id,
            description: format!("step {id}"),
            tool: "rag".to_string(),
            parameters: Map::new(),
        }
    }

    #[test]
    fn test_empty_document_is_default_state() {
        let state = TaskState::from_document(Map::new()).unwrap();
        assert_eq!(state, TaskState::default());
        assert_eq!(state.execution.status, ExecutionStatus::Pending);
        assert_eq!(state.evaluation.is_done_false_count, 0);
    }

    #[test]
    fn test_next_pending_step_uses_lowest_id_not_plan_order() {
        let mut state = TaskState::default();
        state.plan = vec![step(3), step(1), step(2)];
        assert_eq!(state.next_pending_step().unwrap().step_id, 1);

        state.execution.steps.push(ExecutionRecord::from_step(&step(1), json!({})));
        assert_eq!(state.next_pending_step().unwrap().step_id, 2);
        assert!(!state.all_steps_executed());

        state.execution.steps.push(ExecutionRecord::from_step(&step(2), json!({})));
        state.execution.steps.push(ExecutionRecord::from_step(&step(3), json!({})));
        assert!(state.next_pending_step().is_none());
        assert!(state.all_steps_executed());
    }

    #[test]
    fn test_evaluation_keeps_free_form_fields() {
        let doc = json!({
            "status": "completed",
            "is_done": true,
            "explanation": "ok",
            "risk_level": "medium",
            "summary": "Analysis complete."
        });
        let eval: Evaluation = serde_json::from_value(doc).unwrap();
        assert_eq!(eval.status, EvaluationStatus::Completed);
        assert_eq!(eval.extra_str("risk_level"), Some("medium"));
        assert_eq!(eval.extra_str("summary"), Some("Analysis complete."));
        assert!(!eval.forced_done);
    }

    #[test]
    fn test_feedback_actions_map_to_status() {
        assert_eq!(
            FeedbackEvent::new("abort").target_status(),
            Some(TaskStatus::Aborted)
        );
        assert_eq!(
            FeedbackEvent::new("continue").target_status(),
            Some(TaskStatus::InProgress)
        );
        assert_eq!(FeedbackEvent::new("note").target_status(), None);
    }

    #[test]
    fn test_initial_state_document_shape() {
        let mut ctx = Map::new();
        ctx.insert("hint".into(), json!("x"));
        let doc = TaskState::initial("Investigate address X", ctx)
            .to_document()
            .unwrap();
        assert_eq!(doc["task"]["description"], json!("Investigate address X"));
        assert_eq!(doc["task"]["status"], json!("started"));
        assert_eq!(doc["plan"], json!([]));
        assert_eq!(doc["execution"], json!({"status": "pending", "steps": []}));
        assert_eq!(doc["tool_calls"], json!([]));
        assert_eq!(doc["context"]["hint"], json!("x"));
        assert!(doc.get("feedback").is_none());
    }
}
