//! 单个角色的一次发言：事件、prompt 组装、执行器（流式生成 + 工具循环 + 取消）

pub mod events;
pub mod executor;
pub mod prompt;

pub use events::{AgentStatus, EventSink, StreamEvent};
pub use executor::{AgentExecutor, AgentOutcome};
pub use prompt::build_prompt;
