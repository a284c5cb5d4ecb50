//! 运行时：每会话一个编排 actor，以及按 session_id 的粘性路由

pub mod router;
pub mod session;

pub use router::SessionRouter;
pub use session::{
    is_stop_command, EventStream, RuntimeSession, SessionHandle, SessionServices, EXPLICIT_STOP_REASON,
};
