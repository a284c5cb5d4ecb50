//! 工具分发
//!
//! 把模型发出的工具调用路由到注册表中的工具，每次调用独立超时；
//! 每次调用输出一条结构化审计日志（JSON）。所有结果（含错误）都可渲染成 observation
//! 回灌给模型，分发失败不会中断所在角色的发言。

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::time::timeout;

use crate::core::ToolError;
use crate::llm::{ToolCallRequest, ToolDefinition};
use crate::tools::registry::{SourceRef, ToolContext, ToolRegistry};

/// 一次工具调用的结果
#[derive(Clone, Debug, PartialEq)]
pub struct ToolCallResponse {
    pub call_id: String,
    pub tool: String,
    pub text: String,
    pub sources: Vec<SourceRef>,
}

#[async_trait]
pub trait ToolDispatcher: Send + Sync {
    async fn dispatch(
        &self,
        request: &ToolCallRequest,
        ctx: &ToolContext,
    ) -> Result<ToolCallResponse, ToolError>;

    /// 声明给模型的工具（按角色允许集过滤）
    fn definitions_for(&self, allowed: &[String]) -> Vec<ToolDefinition>;
}

/// 基于注册表的分发器
pub struct RegistryDispatcher {
    registry: ToolRegistry,
    timeout: Duration,
}

impl RegistryDispatcher {
    pub fn new(registry: ToolRegistry, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }
}

#[async_trait]
impl ToolDispatcher for RegistryDispatcher {
    async fn dispatch(
        &self,
        request: &ToolCallRequest,
        ctx: &ToolContext,
    ) -> Result<ToolCallResponse, ToolError> {
        let start = Instant::now();
        let result = match self.registry.get(&request.name) {
            None => Err(ToolError::NotFound(request.name.clone())),
            Some(tool) => match timeout(self.timeout, tool.execute(request.arguments.clone(), ctx)).await {
                Ok(r) => r,
                Err(_) => Err(ToolError::Timeout {
                    tool: request.name.clone(),
                    after: self.timeout,
                }),
            },
        };

        let (ok, outcome) = match &result {
            Ok(_) => (true, "ok"),
            Err(e) => (false, e.outcome()),
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": request.name,
            "persona": ctx.persona_id,
            "session": ctx.session_id,
            "ok": ok,
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview(&request.arguments),
        });
        tracing::info!(audit = %audit, "tool");

        result.map(|out| ToolCallResponse {
            call_id: request.id.clone(),
            tool: request.name.clone(),
            text: out.text,
            sources: out.sources,
        })
    }

    fn definitions_for(&self, allowed: &[String]) -> Vec<ToolDefinition> {
        self.registry.definitions_for(allowed)
    }
}

fn args_preview(args: &serde_json::Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

/// 把调用结果渲染成给模型看的 observation
pub fn render_observation(tool: &str, result: &Result<ToolCallResponse, ToolError>) -> String {
    match result {
        Ok(resp) => {
            let mut out = if resp.text.trim().is_empty() {
                "（无结果）".to_string()
            } else {
                resp.text.clone()
            };
            if !resp.sources.is_empty() {
                out.push_str("\n\n来源：");
                for s in &resp.sources {
                    out.push_str(&format!("\n- {} ({})", s.label, s.location));
                }
            }
            out
        }
        Err(ToolError::NotFound(_)) => {
            format!("工具 `{tool}` 不可用。请不要再调用它，直接基于已有信息回答。")
        }
        Err(e) => format!("工具 `{tool}` 调用失败（{}）：{e}。可以换个查询重试，或直接回答。", e.outcome()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::registry::{Tool, ToolOutput};
    use serde_json::{json, Value};

    struct Slow;

    #[async_trait]
    impl Tool for Slow {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "never finishes in time"
        }
        async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(ToolOutput::default())
        }
    }

    struct WhoAmI;

    #[async_trait]
    impl Tool for WhoAmI {
        fn name(&self) -> &str {
            "whoami"
        }
        fn description(&self) -> &str {
            "returns caller persona"
        }
        async fn execute(&self, _args: Value, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
            Ok(ToolOutput {
                text: ctx.persona_id.clone(),
                sources: vec![SourceRef {
                    label: "ctx".into(),
                    location: "local".into(),
                }],
            })
        }
    }

    fn ctx() -> ToolContext {
        ToolContext {
            persona_id: "alice".into(),
            session_id: "s".into(),
        }
    }

    fn dispatcher() -> RegistryDispatcher {
        let mut reg = ToolRegistry::new();
        reg.register(Slow);
        reg.register(WhoAmI);
        RegistryDispatcher::new(reg, Duration::from_millis(50))
    }

    #[tokio::test]
    async fn test_unknown_tool_is_not_found() {
        let err = dispatcher()
            .dispatch(&ToolCallRequest::new("nope", json!({})), &ctx())
            .await
            .unwrap_err();
        assert_eq!(err, ToolError::NotFound("nope".into()));
    }

    #[tokio::test]
    async fn test_timeout() {
        let err = dispatcher()
            .dispatch(&ToolCallRequest::new("slow", json!({})), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Timeout { ref tool, .. } if tool == "slow"));
    }

    #[tokio::test]
    async fn test_context_and_sources_flow_through() {
        let resp = dispatcher()
            .dispatch(&ToolCallRequest::new("whoami", json!({})), &ctx())
            .await
            .unwrap();
        assert_eq!(resp.text, "alice");
        let obs = render_observation("whoami", &Ok(resp));
        assert!(obs.contains("来源"));
        assert!(obs.contains("ctx (local)"));
    }

    #[test]
    fn test_error_observation_mentions_outcome() {
        let err: Result<ToolCallResponse, ToolError> = Err(ToolError::upstream("web_search", "503"));
        let obs = render_observation("web_search", &err);
        assert!(obs.contains("error"));
        assert!(obs.contains("503"));
    }
}
