//! Mock LLM（用于测试与演示，无需 API）
//!
//! - `ScriptedLlm`：按角色排队的脚本，每次 stream_generate 取出下一段脚本逐步播放，
//!   并记录收到的 prompt，供执行器 / 编排器测试断言。
//! - `MockLlmClient`：纯文本回显后端，演示程序配合 `InlineToolCallBackend` 使用。

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream;
use serde_json::Value;

use crate::core::LlmError;
use crate::llm::traits::{
    ChatRole, ChatTurn, GenerationEvent, GenerationStream, LlmBackend, Prompt, TextLlm,
    TextStream, ToolCallRequest, ToolDefinition,
};

/// 脚本中的一步
#[derive(Clone, Debug)]
pub enum Step {
    Text(String),
    ToolCall { name: String, arguments: Value },
    /// 流中途报错
    Fail(String),
    /// 等待一段时间再继续
    Delay(Duration),
    /// 永远不再产出（测试取消与空闲超时）
    Pending,
}

impl Step {
    pub fn text(t: impl Into<String>) -> Self {
        Step::Text(t.into())
    }

    pub fn tool(name: impl Into<String>, arguments: Value) -> Self {
        Step::ToolCall {
            name: name.into(),
            arguments,
        }
    }
}

/// 一次 stream_generate 的剧本
#[derive(Clone, Debug)]
pub enum Script {
    Stream(Vec<Step>),
    /// 请求阶段直接失败
    Reject(String),
}

#[derive(Default)]
pub struct ScriptedLlm {
    scripts: Mutex<HashMap<String, VecDeque<Script>>>,
    prompts: Mutex<Vec<Prompt>>,
    fallback: Option<String>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    /// 脚本耗尽时回复固定文本而不是报错
    pub fn with_fallback(mut self, reply: impl Into<String>) -> Self {
        self.fallback = Some(reply.into());
        self
    }

    pub fn push(&self, persona: &str, steps: Vec<Step>) -> &Self {
        self.push_script(persona, Script::Stream(steps))
    }

    pub fn push_script(&self, persona: &str, script: Script) -> &Self {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts
                .entry(persona.to_string())
                .or_default()
                .push_back(script);
        }
        self
    }

    /// 收到的全部 prompt（按调用顺序）
    pub fn prompts(&self) -> Vec<Prompt> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn calls_for(&self, persona: &str) -> usize {
        self.prompts().iter().filter(|p| p.persona == persona).count()
    }
}

#[async_trait]
impl LlmBackend for ScriptedLlm {
    async fn stream_generate(
        &self,
        prompt: &Prompt,
        _tools: &[ToolDefinition],
    ) -> Result<GenerationStream, LlmError> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.clone());
        }
        let next = self
            .scripts
            .lock()
            .ok()
            .and_then(|mut s| s.get_mut(&prompt.persona).and_then(VecDeque::pop_front));

        let steps = match next {
            Some(Script::Stream(steps)) => steps,
            Some(Script::Reject(msg)) => return Err(LlmError::Request(msg)),
            None => match &self.fallback {
                Some(reply) => vec![Step::Text(reply.clone())],
                None => {
                    return Err(LlmError::Request(format!(
                        "no script left for {}",
                        prompt.persona
                    )))
                }
            },
        };

        Ok(Box::pin(stream::unfold(
            VecDeque::from(steps),
            |mut steps| async move {
                loop {
                    match steps.pop_front()? {
                        Step::Text(t) => return Some((Ok(GenerationEvent::TextDelta(t)), steps)),
                        Step::ToolCall { name, arguments } => {
                            let call = ToolCallRequest::new(name, arguments);
                            return Some((Ok(GenerationEvent::ToolCall(call)), steps));
                        }
                        Step::Fail(msg) => {
                            steps.clear();
                            return Some((Err(LlmError::Stream(msg)), steps));
                        }
                        Step::Delay(d) => tokio::time::sleep(d).await,
                        Step::Pending => futures_util::future::pending::<()>().await,
                    }
                }
            },
        )))
    }
}

/// 回显客户端：按词流式回显最后一条用户消息
#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl TextLlm for MockLlmClient {
    async fn complete_stream(&self, system: &str, turns: &[ChatTurn]) -> Result<TextStream, LlmError> {
        let last_user = turns
            .iter()
            .rev()
            .find(|t| t.role == ChatRole::User)
            .map(|t| t.content.as_str())
            .unwrap_or("(no input)");
        let who = system.lines().next().unwrap_or_default();
        let reply = format!("({}) 收到：{}", who.chars().take(24).collect::<String>(), last_user);
        let words: Vec<Result<String, LlmError>> = reply
            .split_inclusive(' ')
            .map(|w| Ok(w.to_string()))
            .collect();
        Ok(Box::pin(stream::iter(words)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    fn prompt(persona: &str) -> Prompt {
        Prompt {
            persona: persona.into(),
            system: String::new(),
            turns: vec![],
        }
    }

    #[tokio::test]
    async fn test_scripts_play_in_order_per_persona() {
        let llm = ScriptedLlm::new();
        llm.push("a", vec![Step::text("one"), Step::text("two")]);
        llm.push("a", vec![Step::text("three")]);

        let first: Vec<_> = llm
            .stream_generate(&prompt("a"), &[])
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(first.len(), 2);
        let second: Vec<_> = llm
            .stream_generate(&prompt("a"), &[])
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(second, vec![Ok(GenerationEvent::TextDelta("three".into()))]);
        assert!(llm.stream_generate(&prompt("a"), &[]).await.is_err());
        assert_eq!(llm.calls_for("a"), 3);
    }

    #[tokio::test]
    async fn test_fail_step_ends_stream() {
        let llm = ScriptedLlm::new();
        llm.push("a", vec![Step::Fail("boom".into()), Step::text("never")]);
        let items: Vec<_> = llm
            .stream_generate(&prompt("a"), &[])
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(items, vec![Err(LlmError::Stream("boom".into()))]);
    }
}
