//! Agent Executor：执行一个角色的一次发言
//!
//! 流程：（可选）预检索 -> 组装 prompt -> 流式生成 -> 遇到工具调用则分发、回灌 observation、
//! 重新生成，工具调用次数上限为 K。第 K+1 次请求到来时结束本轮：已有文本则以 Truncated
//! 返回，否则记为错误。
//!
//! 空闲超时 T 同时约束请求阶段和每个 chunk 的间隔。
//!
//! 取消只在固定边界检查：每个 chunk 到来前后、每次工具分发前后。触发后立即以 Cancelled
//! 结束，已输出的部分保留在 `content` 中。
//!
//! 所有错误在这里收敛为 `agent.end` 的状态，不会向编排器抛出。

use std::sync::Arc;

use futures_util::StreamExt;
use serde_json::json;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::events::{AgentStatus, EventSink, StreamEvent};
use crate::agent::prompt::build_prompt;
use crate::config::ExecutorSection;
use crate::core::AgentExecutionError;
use crate::llm::{ChatRole, ChatTurn, GenerationEvent, LlmProfiles, ToolCallRequest};
use crate::persona::{Persona, PersonaId, PersonaRoster};
use crate::scheduler::TurnContext;
use crate::tools::{rag_query, render_observation, ToolContext, ToolDispatcher};

/// 一次发言的结果
#[derive(Debug, Clone, PartialEq)]
pub struct AgentOutcome {
    pub persona: PersonaId,
    /// 已输出的全部文本（被取消 / 出错时为部分文本）
    pub content: String,
    pub status: AgentStatus,
    /// 实际分发的工具调用次数
    pub tool_calls: usize,
}

pub struct AgentExecutor {
    llm: LlmProfiles,
    tools: Arc<dyn ToolDispatcher>,
    settings: ExecutorSection,
}

/// 单次生成（一段流）的结束方式
enum Segment {
    Finished,
    ToolCall(ToolCallRequest),
}

/// 执行中的状态
struct Run<'a> {
    persona: &'a Persona,
    sink: &'a EventSink,
    cancel: &'a CancellationToken,
    content: String,
    tool_calls: usize,
}

impl<'a> Run<'a> {
    fn finish(self, status: AgentStatus) -> AgentOutcome {
        match &status {
            AgentStatus::Cancelled => {
                debug!(persona = %self.persona.handle, chars = self.content.chars().count(), "turn cancelled")
            }
            AgentStatus::Errored { reason } => {
                warn!(persona = %self.persona.handle, reason = %reason, "turn failed")
            }
            _ => info!(persona = %self.persona.handle, tool_calls = self.tool_calls, status = ?status, "turn finished"),
        }
        self.sink.emit(StreamEvent::AgentEnd {
            persona: self.persona.handle.clone(),
            content: self.content.clone(),
            status: status.clone(),
        });
        AgentOutcome {
            persona: self.persona.handle.clone(),
            content: self.content,
            status,
            tool_calls: self.tool_calls,
        }
    }

    fn fail(self, err: AgentExecutionError) -> AgentOutcome {
        self.finish(AgentStatus::Errored {
            reason: err.to_string(),
        })
    }

    fn cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl AgentExecutor {
    pub fn new(llm: LlmProfiles, tools: Arc<dyn ToolDispatcher>, settings: ExecutorSection) -> Self {
        Self {
            llm,
            tools,
            settings,
        }
    }

    pub fn settings(&self) -> &ExecutorSection {
        &self.settings
    }

    pub async fn execute(
        &self,
        persona: &Persona,
        roster: &PersonaRoster,
        ctx: &TurnContext,
        cancel: &CancellationToken,
        sink: &EventSink,
    ) -> AgentOutcome {
        // 未开口就被取消：不产出任何事件
        if cancel.is_cancelled() {
            return AgentOutcome {
                persona: persona.handle.clone(),
                content: String::new(),
                status: AgentStatus::Cancelled,
                tool_calls: 0,
            };
        }
        let mut run = Run {
            persona,
            sink,
            cancel,
            content: String::new(),
            tool_calls: 0,
        };

        sink.emit(StreamEvent::AgentStart {
            persona: persona.handle.clone(),
            turn_index: ctx.turn_index,
        });
        info!(session = %ctx.session_id, turn = ctx.turn_index, persona = %persona.handle, "turn started");

        let tool_ctx = ToolContext {
            persona_id: persona.handle.clone(),
            session_id: ctx.session_id.clone(),
        };
        let tool_defs = self.tools.definitions_for(&persona.allowed_tools);
        let backend = self.llm.resolve(persona);

        let mut notes = Vec::new();
        if self.settings.prefetch_retrieval && tool_defs.iter().any(|d| d.name == rag_query::TOOL_NAME) {
            match self.prefetch(&ctx.trigger.content, &tool_ctx, cancel).await {
                Some(note) => notes.push(note),
                None => return run.finish(AgentStatus::Cancelled),
            }
        }
        let mut prompt = build_prompt(persona, roster, ctx, &notes);

        loop {
            if run.cancelled() {
                return run.finish(AgentStatus::Cancelled);
            }
            // 请求阶段同样受空闲超时约束：后端迟迟不返回流也算没有 chunk
            let stream = tokio::select! {
                biased;
                _ = cancel.cancelled() => return run.finish(AgentStatus::Cancelled),
                r = timeout(self.settings.idle_timeout(), backend.stream_generate(&prompt, &tool_defs)) => r,
            };
            let mut stream = match stream {
                Err(_) => return run.fail(AgentExecutionError::IdleTimeout(self.settings.idle_timeout())),
                Ok(Err(e)) => return run.fail(e.into()),
                Ok(Ok(s)) => s,
            };

            let mut segment_text = String::new();
            let segment = loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return run.finish(AgentStatus::Cancelled),
                    r = timeout(self.settings.idle_timeout(), stream.next()) => r,
                };
                match next {
                    Err(_) => {
                        return run.fail(AgentExecutionError::IdleTimeout(self.settings.idle_timeout()))
                    }
                    Ok(None) => break Segment::Finished,
                    Ok(Some(Err(e))) => return run.fail(e.into()),
                    Ok(Some(Ok(GenerationEvent::TextDelta(text)))) => {
                        if text.is_empty() {
                            continue;
                        }
                        if run.cancelled() {
                            return run.finish(AgentStatus::Cancelled);
                        }
                        sink.emit(StreamEvent::AgentChunk {
                            persona: persona.handle.clone(),
                            text: text.clone(),
                        });
                        segment_text.push_str(&text);
                        run.content.push_str(&text);
                    }
                    // 本段剩余输出丢弃，拿到 observation 后重新生成
                    Ok(Some(Ok(GenerationEvent::ToolCall(call)))) => break Segment::ToolCall(call),
                }
            };
            drop(stream);

            let call = match segment {
                Segment::Finished => return run.finish(AgentStatus::Completed),
                Segment::ToolCall(call) => call,
            };

            if run.tool_calls >= self.settings.max_tool_iterations {
                warn!(
                    persona = %persona.handle,
                    limit = self.settings.max_tool_iterations,
                    tool = %call.name,
                    "tool-call budget exhausted"
                );
                return if run.content.trim().is_empty() {
                    run.fail(AgentExecutionError::ToolBudgetExhausted(
                        self.settings.max_tool_iterations,
                    ))
                } else {
                    run.finish(AgentStatus::Truncated)
                };
            }
            run.tool_calls += 1;

            if run.cancelled() {
                return run.finish(AgentStatus::Cancelled);
            }
            let result = if persona.allows_tool(&call.name) {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return run.finish(AgentStatus::Cancelled),
                    r = self.tools.dispatch(&call, &tool_ctx) => r,
                }
            } else {
                debug!(persona = %persona.handle, tool = %call.name, "tool not in allowed set");
                Err(crate::core::ToolError::NotFound(call.name.clone()))
            };
            if run.cancelled() {
                return run.finish(AgentStatus::Cancelled);
            }

            let observation = render_observation(&call.name, &result);
            let call_json = json!({"name": call.name, "arguments": call.arguments});
            prompt.turns.push(ChatTurn::named(
                ChatRole::Assistant,
                &persona.handle,
                format!("{segment_text}<tool_call>{call_json}</tool_call>"),
            ));
            prompt
                .turns
                .push(ChatTurn::named(ChatRole::Tool, &call.name, observation));
        }
    }

    /// 生成前按触发消息检索一次；检索失败时返回“不可用”说明，取消时返回 None
    async fn prefetch(
        &self,
        query: &str,
        tool_ctx: &ToolContext,
        cancel: &CancellationToken,
    ) -> Option<String> {
        let request = ToolCallRequest::new(
            rag_query::TOOL_NAME,
            json!({"query": query, "top_k": self.settings.retrieval_top_k}),
        );
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            r = self.tools.dispatch(&request, tool_ctx) => r,
        };
        Some(match result {
            Ok(resp) => format!(
                "以下是知识库中与当前话题相关的资料，可参考但不要照抄：\n{}",
                render_observation(rag_query::TOOL_NAME, &Ok(resp))
            ),
            Err(e) => {
                warn!(persona = %tool_ctx.persona_id, error = %e, "retrieval prefetch failed");
                "（知识库暂时不可用，请基于已有信息回答。）".to_string()
            }
        })
    }
}
