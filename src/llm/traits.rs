//! LLM 协作者抽象
//!
//! 核心不实现模型客户端本身，只依赖 `LlmBackend::stream_generate`：
//! 输入 prompt 与工具定义，输出由文本增量和工具调用请求组成的异步序列。
//! 只能输出纯文本的后端实现 `TextLlm`，再用 `InlineToolCallBackend` 包装（见 inline 模块）。

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::LlmError;
use crate::persona::PersonaId;

/// 发给模型的对话角色
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

/// 工作上下文中的一条
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    /// 发言者 / 工具名
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub content: String,
}

impl ChatTurn {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            name: None,
            content: content.into(),
        }
    }

    pub fn named(role: ChatRole, name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role,
            name: Some(name.into()),
            content: content.into(),
        }
    }
}

/// 一次生成请求
#[derive(Clone, Debug, PartialEq)]
pub struct Prompt {
    pub persona: PersonaId,
    pub system: String,
    pub turns: Vec<ChatTurn>,
}

/// 声明给模型的工具
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema
    pub parameters: Value,
}

/// 模型发出的工具调用请求
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    #[serde(default)]
    pub id: String,
    #[serde(alias = "tool")]
    pub name: String,
    #[serde(default, alias = "args")]
    pub arguments: Value,
}

impl ToolCallRequest {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            arguments,
        }
    }
}

/// 生成流中的一项
#[derive(Clone, Debug, PartialEq)]
pub enum GenerationEvent {
    TextDelta(String),
    ToolCall(ToolCallRequest),
}

pub type GenerationStream = Pin<Box<dyn Stream<Item = Result<GenerationEvent, LlmError>> + Send>>;

/// 支持工具调用的流式后端
#[async_trait]
pub trait LlmBackend: Send + Sync {
    async fn stream_generate(
        &self,
        prompt: &Prompt,
        tools: &[ToolDefinition],
    ) -> Result<GenerationStream, LlmError>;
}

pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

/// 只能输出文本 token 的后端
#[async_trait]
pub trait TextLlm: Send + Sync {
    async fn complete_stream(&self, system: &str, turns: &[ChatTurn]) -> Result<TextStream, LlmError>;
}
