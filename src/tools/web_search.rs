//! Web 搜索工具
//!
//! 搜索由 WebSearcher 协作者完成；默认实现请求 DuckDuckGo 的 HTML 端点，用正则切出结果链接，
//! 标题与摘要经 html2text 转成纯文本；可选抓取结果页提取摘要（按字符数截断）。HTTP 超时独立于工具分发超时。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::core::ToolError;
use crate::tools::registry::{SourceRef, Tool, ToolContext, ToolOutput};

pub const TOOL_NAME: &str = "web_search";

/// 一条搜索结果
#[derive(Clone, Debug, PartialEq)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

/// 搜索协作者
#[async_trait]
pub trait WebSearcher: Send + Sync {
    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<SearchHit>, ToolError>;
}

pub struct WebSearchTool {
    searcher: Arc<dyn WebSearcher>,
    default_top_k: usize,
}

impl WebSearchTool {
    pub fn new(searcher: Arc<dyn WebSearcher>, default_top_k: usize) -> Self {
        Self {
            searcher,
            default_top_k: default_top_k.max(1),
        }
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        TOOL_NAME
    }

    fn description(&self) -> &str {
        "搜索互联网上的最新信息，返回标题、链接和摘要。"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "搜索关键词"},
                "top_k": {"type": "integer", "minimum": 1, "maximum": 10}
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let query = args
            .get("query")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .ok_or_else(|| ToolError::invalid_args(TOOL_NAME, "missing 'query'"))?;
        let top_k = args
            .get("top_k")
            .and_then(Value::as_u64)
            .map_or(self.default_top_k, |k| (k as usize).clamp(1, 10));

        tracing::debug!(query = %query, top_k, "web search");
        let hits = self.searcher.search(query, top_k).await?;
        if hits.is_empty() {
            return Ok(ToolOutput {
                text: "没有搜索到结果。".to_string(),
                sources: Vec::new(),
            });
        }
        let text = hits
            .iter()
            .enumerate()
            .map(|(i, h)| {
                if h.snippet.is_empty() {
                    format!("[{}] {}", i + 1, h.title)
                } else {
                    format!("[{}] {}\n{}", i + 1, h.title, h.snippet)
                }
            })
            .collect::<Vec<_>>()
            .join("\n\n");
        Ok(ToolOutput {
            text,
            sources: hits
                .into_iter()
                .map(|h| SourceRef {
                    label: h.title,
                    location: h.url,
                })
                .collect(),
        })
    }
}

#[cfg(feature = "web-search")]
pub use duckduckgo::DuckDuckGoSearcher;

#[cfg(feature = "web-search")]
mod duckduckgo {
    use std::sync::OnceLock;
    use std::time::Duration;

    use async_trait::async_trait;
    use html2text::from_read;
    use regex::Regex;
    use reqwest::{Client, Url};

    use super::{SearchHit, WebSearcher, TOOL_NAME};
    use crate::config::WebSearchSection;
    use crate::core::ToolError;

    const ENDPOINT: &str = "https://duckduckgo.com/html/";
    const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

    static RESULT_RE: OnceLock<Regex> = OnceLock::new();
    static SNIPPET_RE: OnceLock<Regex> = OnceLock::new();

    /// 片段渲染宽度，足够宽以免标题 / 摘要被折行
    const FRAGMENT_WIDTH: usize = 4096;

    fn result_re() -> &'static Regex {
        RESULT_RE.get_or_init(|| {
            Regex::new(r#"(?s)<a[^>]*class="result__a"[^>]*href="([^"]+)"[^>]*>(.*?)</a>"#).unwrap()
        })
    }

    fn snippet_re() -> &'static Regex {
        SNIPPET_RE.get_or_init(|| {
            Regex::new(r#"(?s)<a[^>]*class="result__snippet"[^>]*>(.*?)</a>"#).unwrap()
        })
    }

    /// HTML 片段转纯文本：去标签、解码实体（含数字实体），压成单行
    fn html_text(fragment: &str) -> String {
        let text = html2text::config::plain_no_decorate()
            .string_from_read(fragment.as_bytes(), FRAGMENT_WIDTH)
            .unwrap_or_else(|_| fragment.to_string());
        text.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    /// DuckDuckGo 跳转链接 `//duckduckgo.com/l/?uddg=<真实地址>` 还原为真实地址
    fn resolve_href(href: &str) -> String {
        let href = html_text(href);
        let absolute = if href.starts_with("//") {
            format!("https:{href}")
        } else {
            href.clone()
        };
        if let Ok(url) = Url::parse(&absolute) {
            if let Some((_, target)) = url.query_pairs().find(|(k, _)| k == "uddg") {
                return target.into_owned();
            }
        }
        absolute
    }

    /// 解析结果页 HTML
    pub(super) fn parse_results(html: &str, top_k: usize) -> Vec<SearchHit> {
        let snippets: Vec<String> = snippet_re()
            .captures_iter(html)
            .map(|c| html_text(&c[1]))
            .collect();
        result_re()
            .captures_iter(html)
            .take(top_k)
            .enumerate()
            .map(|(i, c)| SearchHit {
                title: html_text(&c[2]),
                url: resolve_href(&c[1]),
                snippet: snippets.get(i).cloned().unwrap_or_default(),
            })
            .collect()
    }

    pub struct DuckDuckGoSearcher {
        client: Client,
        fetch_snippets: bool,
        max_fetch_chars: usize,
    }

    impl DuckDuckGoSearcher {
        pub fn new(cfg: &WebSearchSection) -> Self {
            let client = Client::builder()
                .timeout(Duration::from_secs(cfg.timeout_secs))
                .user_agent(USER_AGENT)
                .build()
                .unwrap_or_default();
            Self {
                client,
                fetch_snippets: cfg.fetch_snippets,
                max_fetch_chars: cfg.max_fetch_chars,
            }
        }

        async fn fetch_page(&self, url: &str) -> Option<String> {
            let resp = self.client.get(url).send().await.ok()?;
            if !resp.status().is_success() {
                return None;
            }
            let body = resp.text().await.ok()?;
            let text = from_read(body.as_bytes(), 120).ok()?;
            let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
            if text.is_empty() {
                return None;
            }
            if text.chars().count() > self.max_fetch_chars {
                Some(text.chars().take(self.max_fetch_chars).collect::<String>() + "...")
            } else {
                Some(text)
            }
        }
    }

    #[async_trait]
    impl WebSearcher for DuckDuckGoSearcher {
        async fn search(&self, query: &str, top_k: usize) -> Result<Vec<SearchHit>, ToolError> {
            let resp = self
                .client
                .get(ENDPOINT)
                .query(&[("q", query)])
                .send()
                .await
                .map_err(|e| ToolError::upstream(TOOL_NAME, format!("request failed: {e}")))?;
            if !resp.status().is_success() {
                return Err(ToolError::upstream(TOOL_NAME, format!("HTTP {}", resp.status())));
            }
            let html = resp
                .text()
                .await
                .map_err(|e| ToolError::upstream(TOOL_NAME, format!("read body: {e}")))?;

            let mut hits = parse_results(&html, top_k);
            if self.fetch_snippets {
                for hit in hits.iter_mut() {
                    if let Some(page) = self.fetch_page(&hit.url).await {
                        hit.snippet = page;
                    }
                }
            }
            Ok(hits)
        }
    }
}
