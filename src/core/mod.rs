//! 核心层：错误分类、会话监管（取消信号）、执行许可

pub mod error;
pub mod session_supervisor;
pub mod task_scheduler;

pub use error::{
    AgentExecutionError, LlmError, SchedulerSkip, SessionError, StoreError, ToolError,
};
pub use session_supervisor::SessionSupervisor;
pub use task_scheduler::{DispatchMode, TaskScheduler};

/// 配置加载错误
pub type ConfigError = config::ConfigError;
