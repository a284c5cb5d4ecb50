//! 会话路由
//!
//! 同一 session_id 的所有消息都交给同一个 RuntimeSession actor（粘性路由），
//! 不同会话之间互不共享可变状态。空闲超时的会话可被回收。

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::info;

use crate::core::SessionError;
use crate::memory::Message;
use crate::runtime::session::{EventStream, RuntimeSession, SessionHandle, SessionServices};

pub struct SessionRouter {
    services: SessionServices,
    sessions: RwLock<HashMap<String, SessionHandle>>,
    idle_timeout: Duration,
}

impl SessionRouter {
    pub fn new(services: SessionServices) -> Self {
        let idle_timeout = Duration::from_secs(services.settings.idle_session_secs);
        Self {
            services,
            sessions: RwLock::new(HashMap::new()),
            idle_timeout,
        }
    }

    /// 取得会话句柄，不存在（或已关闭）时启动新的 actor
    pub async fn get_or_start(&self, session_id: &str) -> Result<SessionHandle, SessionError> {
        if let Some(handle) = self.sessions.read().await.get(session_id) {
            if !handle.is_closed() {
                return Ok(handle.clone());
            }
        }

        let mut sessions = self.sessions.write().await;
        if let Some(handle) = sessions.get(session_id) {
            if !handle.is_closed() {
                return Ok(handle.clone());
            }
        }
        let handle = RuntimeSession::start(session_id, self.services.clone()).await?;
        sessions.insert(session_id.to_string(), handle.clone());
        Ok(handle)
    }

    pub async fn submit(&self, session_id: &str, message: Message) -> Result<EventStream, SessionError> {
        self.get_or_start(session_id).await?.submit(message).await
    }

    /// 停止会话当前轮次；会话不存在时返回 false
    pub async fn stop(&self, session_id: &str, reason: &str) -> bool {
        let handle = self.sessions.read().await.get(session_id).cloned();
        match handle {
            Some(h) => h.stop(reason).await,
            None => false,
        }
    }

    pub async fn shutdown(&self, session_id: &str) -> bool {
        match self.sessions.write().await.remove(session_id) {
            Some(handle) => {
                handle.shutdown();
                true
            }
            None => false,
        }
    }

    pub async fn shutdown_all(&self) {
        let mut sessions = self.sessions.write().await;
        for (_, handle) in sessions.drain() {
            handle.shutdown();
        }
    }

    /// 回收空闲超时且没有进行中轮次的会话
    pub async fn reap_idle(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, h)| h.is_closed() || (!h.is_busy() && h.idle_for() > self.idle_timeout))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            if let Some(handle) = sessions.remove(id) {
                handle.shutdown();
            }
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "idle sessions reaped");
        }
        expired.len()
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}
