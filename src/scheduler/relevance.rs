//! 相关度打分策略
//!
//! 默认实现为关键词重叠：最近几条消息的词集合与角色资料（名字、设定、语气、常用语）
//! 的词集合求交，按消息词数归一化到 [0, 1]。中文走 jieba 搜索模式分词，其它按空白切分。

use std::collections::HashSet;
use std::sync::OnceLock;

use jieba_rs::Jieba;

use crate::memory::Message;
use crate::persona::Persona;

/// 相关度策略
pub trait RelevanceScorer: Send + Sync {
    /// 返回 [0, 1]
    fn score(&self, history: &[Message], persona: &Persona) -> f64;
}

/// 固定分值（关闭相关度或测试用）
#[derive(Debug, Clone, Copy, Default)]
pub struct ConstantRelevance(pub f64);

impl RelevanceScorer for ConstantRelevance {
    fn score(&self, _history: &[Message], _persona: &Persona) -> f64 {
        self.0.clamp(0.0, 1.0)
    }
}

/// 关键词重叠
#[derive(Debug, Clone, Copy)]
pub struct KeywordOverlapScorer {
    /// 参与比较的最近消息条数
    recent: usize,
}

impl KeywordOverlapScorer {
    pub fn new(recent: usize) -> Self {
        Self {
            recent: recent.max(1),
        }
    }
}

impl Default for KeywordOverlapScorer {
    fn default() -> Self {
        Self::new(3)
    }
}

impl RelevanceScorer for KeywordOverlapScorer {
    fn score(&self, history: &[Message], persona: &Persona) -> f64 {
        let start = history.len().saturating_sub(self.recent);
        let recent: Vec<&str> = history[start..]
            .iter()
            .map(|m| m.content.as_str())
            .collect();
        let query = tokenize(&recent.join(" "));
        if query.is_empty() {
            return 0.0;
        }

        let mut profile_text = format!(
            "{} {} {} {}",
            persona.handle, persona.name, persona.prompt, persona.tone
        );
        for phrase in &persona.catchphrases {
            profile_text.push(' ');
            profile_text.push_str(phrase);
        }
        let profile = tokenize(&profile_text);

        let hits = query.intersection(&profile).count() as f64;
        (hits / query.len() as f64).min(1.0)
    }
}

static JIEBA: OnceLock<Jieba> = OnceLock::new();

fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}' |
        '\u{3400}'..='\u{4DBF}' |
        '\u{F900}'..='\u{FAFF}' |
        '\u{3040}'..='\u{30FF}'
    )
}

/// 中英文混合分词，去标点、小写、去掉单字母英文词
fn tokenize(text: &str) -> HashSet<String> {
    let text = text.trim();
    if text.is_empty() {
        return HashSet::new();
    }
    let keep = |w: &str| {
        let w = w.trim_matches(|c: char| !c.is_alphanumeric() && !is_cjk(c));
        let first_cjk = w.chars().next().map_or(false, is_cjk);
        if w.chars().count() > 1 || first_cjk {
            Some(w.to_lowercase())
        } else {
            None
        }
    };
    if text.chars().any(is_cjk) {
        JIEBA
            .get_or_init(Jieba::new)
            .cut_for_search(text, true)
            .into_iter()
            .filter_map(keep)
            .collect()
    } else {
        text.split_whitespace().filter_map(keep).collect()
    }
}
