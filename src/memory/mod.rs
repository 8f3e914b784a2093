//! 记忆层：任务状态库与会话历史

pub mod conversation;
pub mod store;

pub use conversation::{ConversationManager, Message, Role};
pub use store::{shallow_merge, StateStore};
