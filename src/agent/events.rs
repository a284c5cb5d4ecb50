//! 对外事件
//!
//! 核心只产出事件，不关心传输：序列化后形如
//! `{"event": "agent.chunk", "persona": "alice", "text": "..."}`。

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};

use crate::persona::PersonaId;

/// 角色本轮的结束状态
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentStatus {
    Completed,
    /// 工具调用次数用尽，返回已有的部分文本
    Truncated,
    Errored { reason: String },
    Cancelled,
}

impl AgentStatus {
    pub fn is_completed(&self) -> bool {
        matches!(self, AgentStatus::Completed | AgentStatus::Truncated)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event")]
pub enum StreamEvent {
    #[serde(rename = "agent.start")]
    AgentStart { persona: PersonaId, turn_index: u64 },

    #[serde(rename = "agent.chunk")]
    AgentChunk { persona: PersonaId, text: String },

    #[serde(rename = "agent.end")]
    AgentEnd {
        persona: PersonaId,
        content: String,
        status: AgentStatus,
    },

    #[serde(rename = "session.stopped")]
    SessionStopped { reason: String },
}

impl StreamEvent {
    pub fn persona(&self) -> Option<&str> {
        match self {
            StreamEvent::AgentStart { persona, .. }
            | StreamEvent::AgentChunk { persona, .. }
            | StreamEvent::AgentEnd { persona, .. } => Some(persona),
            StreamEvent::SessionStopped { .. } => None,
        }
    }
}

/// 事件出口：提交方的专属通道 + 会话观察者广播
///
/// 接收方断开不影响生成，回复照常写入会话日志。
#[derive(Clone, Default)]
pub struct EventSink {
    direct: Option<mpsc::UnboundedSender<StreamEvent>>,
    observers: Option<broadcast::Sender<StreamEvent>>,
}

impl EventSink {
    pub fn new(
        direct: Option<mpsc::UnboundedSender<StreamEvent>>,
        observers: Option<broadcast::Sender<StreamEvent>>,
    ) -> Self {
        Self { direct, observers }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<StreamEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(Some(tx), None), rx)
    }

    pub fn emit(&self, event: StreamEvent) {
        if let Some(observers) = &self.observers {
            let _ = observers.send(event.clone());
        }
        if let Some(direct) = &self.direct {
            let _ = direct.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let ev = StreamEvent::AgentEnd {
            persona: "alice".into(),
            content: "hi".into(),
            status: AgentStatus::Errored {
                reason: "boom".into(),
            },
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["event"], "agent.end");
        assert_eq!(v["status"]["kind"], "errored");
        assert_eq!(v["status"]["reason"], "boom");

        let stopped = serde_json::to_value(StreamEvent::SessionStopped {
            reason: "user".into(),
        })
        .unwrap();
        assert_eq!(stopped["event"], "session.stopped");
    }

    #[tokio::test]
    async fn test_sink_fans_out() {
        let (btx, mut brx) = broadcast::channel(8);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(Some(tx), Some(btx));
        sink.emit(StreamEvent::SessionStopped { reason: "x".into() });
        assert!(rx.recv().await.is_some());
        assert!(brx.recv().await.is_ok());
    }
}
