//! 工具箱：注册表、分发器（超时 + 审计）、知识检索、Web 搜索

pub mod dispatcher;
pub mod rag_query;
pub mod registry;
pub mod web_search;

use std::sync::Arc;

pub use dispatcher::{render_observation, RegistryDispatcher, ToolCallResponse, ToolDispatcher};
pub use rag_query::{InMemoryRetriever, Passage, RagQueryTool, Retriever};
pub use registry::{SourceRef, Tool, ToolContext, ToolOutput, ToolRegistry};
#[cfg(feature = "web-search")]
pub use web_search::DuckDuckGoSearcher;
pub use web_search::{SearchHit, WebSearchTool, WebSearcher};

use crate::config::ToolsSection;

/// 按配置组装默认工具集：知识检索（需提供 Retriever）+ Web 搜索（启用时）
pub fn create_default_dispatcher(
    cfg: &ToolsSection,
    retriever: Option<Arc<dyn Retriever>>,
    searcher: Option<Arc<dyn WebSearcher>>,
) -> RegistryDispatcher {
    let mut registry = ToolRegistry::new();
    if let Some(retriever) = retriever {
        registry.register(RagQueryTool::new(retriever));
    }
    if cfg.web_search.enabled {
        #[cfg(feature = "web-search")]
        let searcher = searcher
            .or_else(|| Some(Arc::new(DuckDuckGoSearcher::new(&cfg.web_search)) as Arc<dyn WebSearcher>));
        if let Some(searcher) = searcher {
            registry.register(WebSearchTool::new(searcher, cfg.web_search.top_k));
        }
    }
    tracing::info!(tools = ?registry.tool_names(), "tool registry ready");
    RegistryDispatcher::new(registry, cfg.tool_timeout())
}
