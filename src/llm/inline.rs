//! 文本内嵌工具调用
//!
//! 纯文本后端用 `<tool_call>{"name": "...", "arguments": {...}}</tool_call>` 表示工具调用。
//! 解码器逐 chunk 切出其中的调用，只在 chunk 末尾可能是起始标记前缀时暂扣那几个字符，
//! 其余文本立即放行，保证输出顺序与生成顺序一致。

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use tracing::warn;

use crate::core::LlmError;
use crate::llm::traits::{
    ChatRole, ChatTurn, GenerationEvent, GenerationStream, LlmBackend, Prompt, TextLlm,
    TextStream, ToolCallRequest, ToolDefinition,
};

const OPEN: &str = "<tool_call>";
const CLOSE: &str = "</tool_call>";

/// 增量解码器
#[derive(Debug, Default)]
pub struct InlineToolCallDecoder {
    buffer: String,
    inside: bool,
}

impl InlineToolCallDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 喂入一个文本 chunk，返回可以立即放行的事件
    pub fn push(&mut self, chunk: &str) -> Vec<GenerationEvent> {
        self.buffer.push_str(chunk);
        let mut out = Vec::new();
        loop {
            if self.inside {
                let Some(end) = self.buffer.find(CLOSE) else { break };
                let body: String = self.buffer.drain(..end + CLOSE.len()).collect();
                let json = &body[..end];
                match serde_json::from_str::<ToolCallRequest>(json.trim()) {
                    Ok(mut call) => {
                        if call.id.is_empty() {
                            call.id = uuid::Uuid::new_v4().to_string();
                        }
                        out.push(GenerationEvent::ToolCall(call));
                    }
                    Err(e) => {
                        warn!(error = %e, "malformed inline tool call, passing through as text");
                        push_text(&mut out, format!("{OPEN}{body}"));
                    }
                }
                self.inside = false;
            } else if let Some(start) = self.buffer.find(OPEN) {
                let text: String = self.buffer.drain(..start).collect();
                push_text(&mut out, text);
                self.buffer.drain(..OPEN.len());
                self.inside = true;
            } else {
                let keep = partial_open_suffix(&self.buffer);
                let split = self.buffer.len() - keep;
                let text: String = self.buffer.drain(..split).collect();
                push_text(&mut out, text);
                break;
            }
        }
        out
    }

    /// 流结束：未闭合的调用按原文放行
    pub fn finish(&mut self) -> Vec<GenerationEvent> {
        let mut out = Vec::new();
        let rest = std::mem::take(&mut self.buffer);
        if self.inside {
            push_text(&mut out, format!("{OPEN}{rest}"));
        } else {
            push_text(&mut out, rest);
        }
        self.inside = false;
        out
    }
}

fn push_text(out: &mut Vec<GenerationEvent>, text: String) {
    if !text.is_empty() {
        out.push(GenerationEvent::TextDelta(text));
    }
}

/// buffer 末尾与起始标记前缀重合的最大长度
fn partial_open_suffix(buffer: &str) -> usize {
    (1..OPEN.len())
        .rev()
        .find(|&k| buffer.ends_with(&OPEN[..k]))
        .unwrap_or(0)
}

/// 把文本流解码为生成事件流
pub fn decode_inline(text: TextStream) -> GenerationStream {
    struct State {
        inner: TextStream,
        decoder: InlineToolCallDecoder,
        ready: VecDeque<Result<GenerationEvent, LlmError>>,
        done: bool,
    }

    let init = State {
        inner: text,
        decoder: InlineToolCallDecoder::new(),
        ready: VecDeque::new(),
        done: false,
    };

    Box::pin(stream::unfold(init, |mut st| async move {
        loop {
            if let Some(item) = st.ready.pop_front() {
                return Some((item, st));
            }
            if st.done {
                return None;
            }
            match st.inner.next().await {
                Some(Ok(chunk)) => st.ready.extend(st.decoder.push(&chunk).into_iter().map(Ok)),
                Some(Err(e)) => {
                    st.ready.push_back(Err(e));
                    st.done = true;
                }
                None => {
                    st.ready.extend(st.decoder.finish().into_iter().map(Ok));
                    st.done = true;
                }
            }
        }
    }))
}

/// 工具说明写进 system prompt，模型输出经解码器切分
pub struct InlineToolCallBackend {
    inner: Arc<dyn TextLlm>,
}

impl InlineToolCallBackend {
    pub fn new(inner: Arc<dyn TextLlm>) -> Self {
        Self { inner }
    }
}

fn tool_instructions(tools: &[ToolDefinition]) -> String {
    let mut out = String::from(
        "\n\n可用工具（需要时输出 <tool_call>{\"name\": 工具名, \"arguments\": {...}}</tool_call>，结果会以 tool 消息返回）：",
    );
    for t in tools {
        out.push_str(&format!("\n- {}: {} 参数: {}", t.name, t.description, t.parameters));
    }
    out
}

#[async_trait]
impl LlmBackend for InlineToolCallBackend {
    async fn stream_generate(
        &self,
        prompt: &Prompt,
        tools: &[ToolDefinition],
    ) -> Result<GenerationStream, LlmError> {
        let mut system = prompt.system.clone();
        if !tools.is_empty() {
            system.push_str(&tool_instructions(tools));
        }
        // 上一次的调用以原文形式留在上下文里，模型能看到自己调过什么
        let turns: Vec<ChatTurn> = prompt
            .turns
            .iter()
            .map(|t| match t.role {
                ChatRole::Tool => ChatTurn::new(
                    ChatRole::User,
                    format!("[tool {} result]\n{}", t.name.as_deref().unwrap_or("?"), t.content),
                ),
                _ => t.clone(),
            })
            .collect();
        let text = self.inner.complete_stream(&system, &turns).await?;
        Ok(decode_inline(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn texts(events: &[GenerationEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                GenerationEvent::TextDelta(t) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_plain_text_passes_immediately() {
        let mut d = InlineToolCallDecoder::new();
        let out = d.push("hello world");
        assert_eq!(out, vec![GenerationEvent::TextDelta("hello world".into())]);
    }

    #[test]
    fn test_delimiter_split_across_chunks() {
        let mut d = InlineToolCallDecoder::new();
        let mut events = d.push("look <tool");
        assert_eq!(texts(&events), "look ");
        events.extend(d.push("_call>{\"name\": \"web_search\", \"arguments\": {\"query\": \"rust\"}}</tool"));
        events.extend(d.push("_call> done"));
        events.extend(d.finish());

        let calls: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                GenerationEvent::ToolCall(c) => Some(c),
                _ => None,
            })
            .collect();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "web_search");
        assert_eq!(calls[0].arguments, json!({"query": "rust"}));
        assert!(!calls[0].id.is_empty());
        assert_eq!(texts(&events), "look  done");
    }

    #[test]
    fn test_lone_angle_bracket_released_on_finish() {
        let mut d = InlineToolCallDecoder::new();
        assert_eq!(texts(&d.push("a <")), "a ");
        assert_eq!(texts(&d.push("b")), "<b");
        assert!(d.finish().is_empty());
    }

    #[test]
    fn test_malformed_call_becomes_text() {
        let mut d = InlineToolCallDecoder::new();
        let out = d.push("<tool_call>not json</tool_call>");
        assert_eq!(texts(&out), "<tool_call>not json</tool_call>");
    }

    #[test]
    fn test_unterminated_call_flushed_as_text() {
        let mut d = InlineToolCallDecoder::new();
        assert!(d.push("<tool_call>{\"name\"").is_empty());
        assert_eq!(texts(&d.finish()), "<tool_call>{\"name\"");
    }

    #[tokio::test]
    async fn test_decode_inline_stream() {
        let chunks: Vec<Result<String, LlmError>> = vec![
            Ok("hi <tool_call>{\"tool\": \"rag_query\", \"args\": {}}".into()),
            Ok("</tool_call>".into()),
        ];
        let events: Vec<_> = decode_inline(Box::pin(stream::iter(chunks)))
            .collect::<Vec<_>>()
            .await;
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[1], Ok(GenerationEvent::ToolCall(c)) if c.name == "rag_query"));
    }
}
