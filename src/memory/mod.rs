//! 记忆层：单 Agent 对话存储与结果记录持久化

pub mod conversation;
pub mod persistence;

pub use conversation::{ConversationStore, Message, Role};
pub use persistence::{record_schema_json, AgentRecord, RecordStore};
