//! 执行许可：限制并行模式下同时运行的角色数
//!
//! 顺序模式下 permits = 1，等价于串行；并行模式下最多 P 个 Agent Executor 同时生成。

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// 轮次内的分发模式
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// 逐个发言，保持阅读顺序
    Sequential,
    /// 最多 P 个角色并发，只保证单角色内 chunk 有序
    Parallel,
}

impl Default for DispatchMode {
    fn default() -> Self {
        Self::Sequential
    }
}

/// 执行许可池
#[derive(Clone, Debug)]
pub struct TaskScheduler {
    permits: Arc<Semaphore>,
    limit: usize,
}

impl TaskScheduler {
    pub fn new(max_concurrent: usize) -> Self {
        let limit = max_concurrent.max(1);
        Self {
            permits: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    pub fn for_mode(mode: DispatchMode, parallelism: usize) -> Self {
        match mode {
            DispatchMode::Sequential => Self::new(1),
            DispatchMode::Parallel => Self::new(parallelism),
        }
    }

    /// 获取一个执行许可；信号量被关闭时返回 None
    pub async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.permits.clone().acquire_owned().await.ok()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_permits_are_bounded() {
        let sched = TaskScheduler::for_mode(DispatchMode::Parallel, 2);
        let a = sched.acquire().await.unwrap();
        let _b = sched.acquire().await.unwrap();
        assert_eq!(sched.available(), 0);
        drop(a);
        assert_eq!(sched.available(), 1);
    }

    #[test]
    fn test_sequential_has_single_permit() {
        assert_eq!(TaskScheduler::for_mode(DispatchMode::Sequential, 8).limit(), 1);
        assert_eq!(TaskScheduler::new(0).limit(), 1);
    }
}
