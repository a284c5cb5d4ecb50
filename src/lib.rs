//! Chorus - 多角色群聊的轮次调度与对话编排运行时
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、会话监管（取消）、执行许可
//! - **memory**: 群聊消息、记忆窗口、会话消息存储
//! - **persona**: 角色模型与名册存储
//! - **scheduler**: 参与者状态、提及解析、相关度、发言人选择
//! - **llm**: 流式生成抽象、内嵌工具调用解码、Mock
//! - **tools**: 工具注册表与分发（知识检索、Web 搜索）
//! - **agent**: 单个角色一次发言的执行器
//! - **runtime**: 每会话一个编排 actor 与会话路由

pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod persona;
pub mod runtime;
pub mod scheduler;
pub mod tools;

pub use agent::{AgentStatus, StreamEvent};
pub use config::{load_config, AppConfig};
pub use memory::Message;
pub use persona::{Persona, PersonaRoster};
pub use runtime::{SessionHandle, SessionRouter, SessionServices};
