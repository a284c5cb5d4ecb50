//! 会话消息存储接口
//!
//! 只追加、有序的会话日志。核心只读取有界切片，并在每个角色完成发言后追加其回复；
//! 持久化格式由外部实现决定，这里只提供内存实现。

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::core::StoreError;
use crate::memory::{window, Message};

/// 会话消息存储
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// 追加一条消息
    async fn append(&self, session_id: &str, message: Message) -> Result<(), StoreError>;

    /// 读取最后 window 条消息（window ≤ 0 读全部），旧到新
    async fn tail(&self, session_id: &str, window: i64) -> Result<Vec<Message>, StoreError>;

    /// 会话日志长度
    async fn len(&self, session_id: &str) -> Result<usize, StoreError>;
}

/// 内存实现：session_id -> 消息列表
#[derive(Default)]
pub struct InMemoryMessageStore {
    logs: RwLock<HashMap<String, Vec<Message>>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 预置历史（测试或从外部导入）
    pub async fn seed(&self, session_id: &str, messages: Vec<Message>) {
        self.logs
            .write()
            .await
            .entry(session_id.to_string())
            .or_default()
            .extend(messages);
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn append(&self, session_id: &str, message: Message) -> Result<(), StoreError> {
        self.logs
            .write()
            .await
            .entry(session_id.to_string())
            .or_default()
            .push(message);
        Ok(())
    }

    async fn tail(&self, session_id: &str, window: i64) -> Result<Vec<Message>, StoreError> {
        let logs = self.logs.read().await;
        Ok(logs
            .get(session_id)
            .map(|log| window::slice(log, window))
            .unwrap_or_default())
    }

    async fn len(&self, session_id: &str) -> Result<usize, StoreError> {
        Ok(self.logs.read().await.get(session_id).map_or(0, Vec::len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_and_tail() {
        let store = InMemoryMessageStore::new();
        for i in 0..5 {
            store
                .append("s1", Message::user("u", format!("m{i}")))
                .await
                .unwrap();
        }
        store.append("s2", Message::user("u", "other")).await.unwrap();

        let tail = store.tail("s1", 2).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].content, "m3");
        assert_eq!(store.tail("s1", -1).await.unwrap().len(), 5);
        assert_eq!(store.len("s2").await.unwrap(), 1);
        assert!(store.tail("missing", 3).await.unwrap().is_empty());
    }
}
