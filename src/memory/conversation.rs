//! 会话：按轮追加的对话历史
//!
//! 历史由状态库的 conversations 表保存，只追加、不合并、不改写。

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::AgentError;
use crate::memory::StateStore;

/// 消息角色
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// 单轮对话；assistant 轮次可关联产生它的任务
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            task_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            task_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            task_id: None,
        }
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }
}

/// 会话管理：开始会话、记录输入与回复、读取历史
pub struct ConversationManager {
    store: Arc<StateStore>,
}

impl ConversationManager {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self { store }
    }

    pub fn start_session(&self) -> Result<String, AgentError> {
        let session_id = Uuid::new_v4().to_string();
        self.store
            .append_turn(&session_id, Message::system("Conversation started."))?;
        tracing::info!(session_id = %session_id, "conversation started");
        Ok(session_id)
    }

    pub fn process_input(&self, session_id: &str, input: &str) -> Result<(), AgentError> {
        self.store.append_turn(session_id, Message::user(input))
    }

    pub fn add_response(&self, session_id: &str, response: Message) -> Result<(), AgentError> {
        self.store.append_turn(session_id, response)
    }

    pub fn history(&self, session_id: &str) -> Result<Vec<Message>, AgentError> {
        self.store.get_conversation(session_id)
    }

    /// 没有任何轮次的会话视为不存在
    pub fn load_session(&self, session_id: &str) -> Result<Option<Vec<Message>>, AgentError> {
        let history = self.history(session_id)?;
        Ok(if history.is_empty() { None } else { Some(history) })
    }
}
