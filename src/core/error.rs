//! 错误分类
//!
//! - `ToolError`：工具调用失败，非致命，转成 observation 回灌给模型
//! - `AgentExecutionError`：单个角色本轮失败，只影响该角色
//! - `SessionError`：会话级错误，只有结构性配置错误会中止会话启动
//! - `SchedulerSkip`：调度时跳过某个角色的通知（不是错误，不会向上传播）

use std::time::Duration;

use thiserror::Error;

/// 工具调用错误（NotFound / Timeout / UpstreamError）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ToolError {
    #[error("tool not found: {0}")]
    NotFound(String),

    #[error("tool {tool} timed out after {}s", .after.as_secs_f32())]
    Timeout { tool: String, after: Duration },

    #[error("upstream error from {tool}: {message}")]
    UpstreamError { tool: String, message: String },

    #[error("invalid arguments for {tool}: {message}")]
    InvalidArguments { tool: String, message: String },
}

impl ToolError {
    pub fn upstream(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::UpstreamError {
            tool: tool.into(),
            message: message.into(),
        }
    }

    pub fn invalid_args(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidArguments {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// 审计日志里的 outcome 字段
    pub fn outcome(&self) -> &'static str {
        match self {
            ToolError::NotFound(_) => "not_found",
            ToolError::Timeout { .. } => "timeout",
            ToolError::UpstreamError { .. } => "error",
            ToolError::InvalidArguments { .. } => "invalid_args",
        }
    }
}

/// LLM 协作者返回的错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("LLM request failed: {0}")]
    Request(String),

    #[error("LLM stream error: {0}")]
    Stream(String),
}

/// 单个角色本轮执行失败
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AgentExecutionError {
    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error("no chunk received for {}s", .0.as_secs())]
    IdleTimeout(Duration),

    #[error("tool-call budget of {0} exhausted without usable output")]
    ToolBudgetExhausted(usize),
}

/// 外部存储（角色名册 / 消息日志）错误
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse roster: {0}")]
    Parse(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// 会话级错误
#[derive(Error, Debug)]
pub enum SessionError {
    /// 结构性配置错误（空名册、重复 handle 等），中止会话启动
    #[error("invalid session configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// 会话 actor 已退出
    #[error("session {0} is closed")]
    Closed(String),
}

/// 调度跳过通知：配置有问题的角色被排除出候选，但不影响本轮其它角色
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerSkip {
    pub persona: String,
    pub reason: String,
}

impl SchedulerSkip {
    pub fn new(persona: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            persona: persona.into(),
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for SchedulerSkip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "persona '{}' skipped: {}", self.persona, self.reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_error_outcome() {
        assert_eq!(ToolError::NotFound("x".into()).outcome(), "not_found");
        let err = ToolError::Timeout {
            tool: "web_search".into(),
            after: Duration::from_secs(10),
        };
        assert_eq!(err.outcome(), "timeout");
        assert!(err.to_string().contains("web_search"));
    }

    #[test]
    fn test_llm_error_converts() {
        let err: AgentExecutionError = LlmError::Request("boom".into()).into();
        assert!(err.to_string().contains("boom"));
    }
}
