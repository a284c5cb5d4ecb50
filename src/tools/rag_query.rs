//! 知识检索工具
//!
//! 检索本身由外部的 Retriever 协作者完成（向量库、全文索引等）；这里负责参数校验、
//! 注入调用者的 persona_id、把检索结果排版成带来源的文本。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::RwLock;

use crate::core::ToolError;
use crate::persona::PersonaId;
use crate::tools::registry::{SourceRef, Tool, ToolContext, ToolOutput};

pub const TOOL_NAME: &str = "rag_query";
const DEFAULT_TOP_K: usize = 4;
const MAX_TOP_K: usize = 10;

/// 检索到的段落
#[derive(Clone, Debug, PartialEq)]
pub struct Passage {
    pub text: String,
    pub source: SourceRef,
    pub score: f32,
}

/// 检索协作者
#[async_trait]
pub trait Retriever: Send + Sync {
    async fn retrieve(
        &self,
        query: &str,
        persona_id: &str,
        top_k: usize,
    ) -> Result<Vec<Passage>, ToolError>;
}

pub struct RagQueryTool {
    retriever: Arc<dyn Retriever>,
}

impl RagQueryTool {
    pub fn new(retriever: Arc<dyn Retriever>) -> Self {
        Self { retriever }
    }
}

/// 段落列表排版
pub fn format_passages(passages: &[Passage]) -> ToolOutput {
    if passages.is_empty() {
        return ToolOutput {
            text: "没有找到相关资料。".to_string(),
            sources: Vec::new(),
        };
    }
    let text = passages
        .iter()
        .enumerate()
        .map(|(i, p)| format!("[{}] {}", i + 1, p.text.trim()))
        .collect::<Vec<_>>()
        .join("\n");
    ToolOutput {
        text,
        sources: passages.iter().map(|p| p.source.clone()).collect(),
    }
}

#[async_trait]
impl Tool for RagQueryTool {
    fn name(&self) -> &str {
        TOOL_NAME
    }

    fn description(&self) -> &str {
        "在当前角色的知识库中检索与问题相关的资料，返回带来源的段落。"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "检索问题"},
                "top_k": {"type": "integer", "minimum": 1, "maximum": MAX_TOP_K, "default": DEFAULT_TOP_K}
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let query = args
            .get("query")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .ok_or_else(|| ToolError::invalid_args(TOOL_NAME, "missing 'query'"))?;
        let top_k = match args.get("top_k") {
            None | Some(Value::Null) => DEFAULT_TOP_K,
            Some(v) => v
                .as_u64()
                .map(|k| (k as usize).clamp(1, MAX_TOP_K))
                .ok_or_else(|| ToolError::invalid_args(TOOL_NAME, "'top_k' must be an integer"))?,
        };
        let passages = self.retriever.retrieve(query, &ctx.persona_id, top_k).await?;
        Ok(format_passages(&passages))
    }
}

/// 内存检索：按角色分库，词重叠打分（演示与测试用）
#[derive(Default)]
pub struct InMemoryRetriever {
    docs: RwLock<HashMap<PersonaId, Vec<(SourceRef, String)>>>,
}

impl InMemoryRetriever {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, persona_id: &str, label: &str, text: &str) {
        self.docs
            .write()
            .await
            .entry(persona_id.to_string())
            .or_default()
            .push((
                SourceRef {
                    label: label.to_string(),
                    location: format!("kb://{persona_id}/{label}"),
                },
                text.to_string(),
            ));
    }
}

fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

#[async_trait]
impl Retriever for InMemoryRetriever {
    async fn retrieve(
        &self,
        query: &str,
        persona_id: &str,
        top_k: usize,
    ) -> Result<Vec<Passage>, ToolError> {
        let docs = self.docs.read().await;
        let Some(entries) = docs.get(persona_id) else {
            return Ok(Vec::new());
        };
        let q = words(query);
        let mut hits: Vec<Passage> = entries
            .iter()
            .filter_map(|(source, text)| {
                let lower = text.to_lowercase();
                let matched = q.iter().filter(|w| lower.contains(w.as_str())).count();
                (matched > 0).then(|| Passage {
                    text: text.clone(),
                    source: source.clone(),
                    score: matched as f32 / q.len().max(1) as f32,
                })
            })
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(top_k);
        Ok(hits)
    }
}
