//! 群聊消息
//!
//! 会话日志中的一条消息：谁说的、说给谁（@ 或私聊，群聊为 None）、何时说的。
//! 角色被中途 stop 时，已生成的半截回复以 `partial = true` 保留。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    /// 发言者：用户名或角色 handle
    pub speaker: String,
    pub content: String,
    /// 指定接收者（群聊时为 None）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    /// 显式指定要回应的角色 handle（由前端 @ 选择器给出）
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub target_personas: Vec<String>,
    /// 被 stop 打断的半截回复
    #[serde(default)]
    pub partial: bool,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn user(speaker: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(Role::User, speaker, content)
    }

    pub fn assistant(speaker: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, speaker, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, "system", content)
    }

    fn new(role: Role, speaker: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role,
            speaker: speaker.into(),
            content: content.into(),
            recipient: None,
            target_personas: Vec::new(),
            partial: false,
            timestamp: Utc::now(),
        }
    }

    pub fn with_recipient(mut self, recipient: impl Into<String>) -> Self {
        self.recipient = Some(recipient.into());
        self
    }

    pub fn with_targets(mut self, targets: Vec<String>) -> Self {
        self.target_personas = targets;
        self
    }

    pub fn mark_partial(mut self) -> Self {
        self.partial = true;
        self
    }

    /// 渲染进 prompt 的一行：`speaker: content`
    pub fn transcript_line(&self) -> String {
        if self.partial {
            format!("{}: {} [interrupted]", self.speaker, self.content)
        } else {
            format!("{}: {}", self.speaker, self.content)
        }
    }
}
