//! 会话监管：轮次取消信号
//!
//! 每个轮次开始时从会话级根 token 派生一个子 token，`stop(reason)` 只取消当前轮次；
//! 之后排队的新消息拿到新的子 token，不受影响。关闭会话时取消根 token。

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// 当前轮次的取消令牌与停止原因
#[derive(Debug, Default)]
struct ActiveCycle {
    token: Option<CancellationToken>,
    reason: Option<String>,
}

/// 会话级生命周期管理：根 token + 当前轮次子 token
#[derive(Debug)]
pub struct SessionSupervisor {
    root: CancellationToken,
    active: Mutex<ActiveCycle>,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self {
            root: CancellationToken::new(),
            active: Mutex::new(ActiveCycle::default()),
        }
    }

    /// 开始新轮次，返回本轮的子 token
    pub async fn begin_cycle(&self) -> CancellationToken {
        let token = self.root.child_token();
        let mut active = self.active.lock().await;
        active.token = Some(token.clone());
        active.reason = None;
        token
    }

    /// 结束当前轮次，返回停止原因（若本轮被 stop）
    pub async fn end_cycle(&self) -> Option<String> {
        let mut active = self.active.lock().await;
        active.token = None;
        active.reason.take()
    }

    /// 取消当前轮次；返回 false 表示当前没有进行中的轮次
    pub async fn stop(&self, reason: impl Into<String>) -> bool {
        let mut guard = self.active.lock().await;
        let active = &mut *guard;
        match active.token.as_ref() {
            Some(token) if !token.is_cancelled() => {
                active.reason = Some(reason.into());
                token.cancel();
                true
            }
            Some(_) => true,
            None => false,
        }
    }

    /// 关闭整个会话（所有现存与未来的子 token 均被取消）
    pub fn shutdown(&self) {
        self.root.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.root.is_cancelled()
    }
}

impl Default for SessionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stop_only_cancels_active_cycle() {
        let sup = SessionSupervisor::new();
        assert!(!sup.stop("idle").await);

        let first = sup.begin_cycle().await;
        assert!(sup.stop("user pressed stop").await);
        assert!(first.is_cancelled());
        assert_eq!(sup.end_cycle().await.as_deref(), Some("user pressed stop"));

        let second = sup.begin_cycle().await;
        assert!(!second.is_cancelled());
        assert_eq!(sup.end_cycle().await, None);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_children() {
        let sup = SessionSupervisor::new();
        let token = sup.begin_cycle().await;
        sup.shutdown();
        assert!(token.is_cancelled());
        assert!(sup.is_shutdown());
    }
}
