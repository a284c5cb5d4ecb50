//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `CHORUS__*` 覆盖（双下划线表示嵌套，如
//! `CHORUS__SCHEDULER__ACTIVATION_THRESHOLD=0.4`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::{ConfigError, DispatchMode};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub scheduler: SchedulerSection,
    pub executor: ExecutorSection,
    pub tools: ToolsSection,
    pub session: SessionSection,
}

/// [scheduler] 段：打分权重与常量
///
/// score = α·proactivity + β·relevance − γ·cooldown_penalty + δ·mention_bonus
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    /// α
    pub proactivity_weight: f64,
    /// β
    pub relevance_weight: f64,
    /// γ
    pub cooldown_weight: f64,
    /// δ
    pub mention_weight: f64,
    /// 冷却中的惩罚常量
    pub cooldown_penalty: f64,
    /// 被 @ 时的加分常量
    pub mention_bonus: f64,
    /// 入选所需最低分
    pub activation_threshold: f64,
    /// 冷场时（无人过线）是否将冷却惩罚减半后重试一次
    pub cold_room_retry: bool,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            proactivity_weight: 1.0,
            relevance_weight: 0.5,
            cooldown_weight: 1.0,
            mention_weight: 1.0,
            cooldown_penalty: 10.0,
            mention_bonus: 100.0,
            activation_threshold: 0.3,
            cold_room_retry: true,
        }
    }
}

/// [executor] 段：单个角色一轮发言的限制
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorSection {
    /// 工具调用循环上限 K
    pub max_tool_iterations: usize,
    /// 流空闲超时（秒）：T 秒内没有新 chunk 判定本轮失败
    pub idle_timeout_secs: u64,
    /// 生成前是否先按触发消息检索一次背景资料
    pub prefetch_retrieval: bool,
    /// 预检索条数
    pub retrieval_top_k: usize,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            max_tool_iterations: 4,
            idle_timeout_secs: 60,
            prefetch_retrieval: true,
            retrieval_top_k: 4,
        }
    }
}

impl ExecutorSection {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// [tools] 段：工具超时与 Web 搜索参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
    pub web_search: WebSearchSection,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: 10,
            web_search: WebSearchSection::default(),
        }
    }
}

impl ToolsSection {
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }
}

/// [tools.web_search] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebSearchSection {
    pub enabled: bool,
    pub top_k: usize,
    /// 是否抓取结果页生成摘要
    pub fetch_snippets: bool,
    /// 摘要最大字符数
    pub max_fetch_chars: usize,
    /// HTTP 超时（秒）
    pub timeout_secs: u64,
}

impl Default for WebSearchSection {
    fn default() -> Self {
        Self {
            enabled: true,
            top_k: 3,
            fetch_snippets: true,
            max_fetch_chars: 1200,
            timeout_secs: 8,
        }
    }
}

/// [session] 段：轮次编排
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub dispatch_mode: DispatchMode,
    /// 并行模式下同时生成的角色数 P
    pub parallelism: usize,
    /// 一条用户消息最多触发的交流轮数（1 = 只有用户触发的那一轮）
    pub max_exchanges: usize,
    /// 角色名册未指定时的默认记忆窗口
    pub default_memory_window: i64,
    /// 角色名册未指定时的默认每轮发言人数上限
    pub default_max_agents_per_turn: i64,
    /// 角色名册文件（TOML）
    pub persona_file: Option<PathBuf>,
    /// 空闲会话回收时间（秒）
    pub idle_session_secs: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            dispatch_mode: DispatchMode::Sequential,
            parallelism: 2,
            max_exchanges: 1,
            default_memory_window: 8,
            default_max_agents_per_turn: 2,
            persona_file: None,
            idle_session_secs: 3600,
        }
    }
}

impl AppConfig {
    /// 校验结构性配置错误
    pub fn validate(&self) -> Result<(), String> {
        let s = &self.scheduler;
        let weights = [
            ("proactivity_weight", s.proactivity_weight),
            ("relevance_weight", s.relevance_weight),
            ("cooldown_weight", s.cooldown_weight),
            ("mention_weight", s.mention_weight),
            ("cooldown_penalty", s.cooldown_penalty),
            ("mention_bonus", s.mention_bonus),
        ];
        for (name, value) in weights {
            if !value.is_finite() || value < 0.0 {
                return Err(format!("scheduler.{name} must be a non-negative number"));
            }
        }
        if !s.activation_threshold.is_finite() {
            return Err("scheduler.activation_threshold must be finite".to_string());
        }
        if self.executor.max_tool_iterations == 0 {
            return Err("executor.max_tool_iterations must be at least 1".to_string());
        }
        if self.executor.idle_timeout_secs == 0 {
            return Err("executor.idle_timeout_secs must be at least 1".to_string());
        }
        if self.tools.tool_timeout_secs == 0 {
            return Err("tools.tool_timeout_secs must be at least 1".to_string());
        }
        if self.session.max_exchanges == 0 {
            return Err("session.max_exchanges must be at least 1".to_string());
        }
        if self.session.default_memory_window < -1 {
            return Err("session.default_memory_window must be -1 or >= 0".to_string());
        }
        if self.session.default_max_agents_per_turn < -1 || self.session.default_max_agents_per_turn == 0 {
            return Err("session.default_max_agents_per_turn must be -1 or >= 1".to_string());
        }
        Ok(())
    }
}

/// 从 config 目录加载配置，环境变量 CHORUS__* 可覆盖
///
/// 1. 查找 config/default.toml 或 ../config/default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 CHORUS__*
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default"] {
        if std::path::Path::new(&format!("{}.toml", name)).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("CHORUS")
            .separator("__")
            .try_parsing(true),
    );

    let cfg: AppConfig = builder.build()?.try_deserialize()?;
    cfg.validate().map_err(ConfigError::Message)?;
    Ok(cfg)
}
