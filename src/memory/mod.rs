//! 记忆层：群聊消息、记忆窗口、会话消息存储

pub mod conversation;
pub mod store;
pub mod window;

pub use conversation::{Message, Role};
pub use store::{InMemoryMessageStore, MessageStore};
pub use window::{slice, UNLIMITED};
