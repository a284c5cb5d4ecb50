//! 角色（Persona）模型
//!
//! 角色在每个轮次开始时从 PersonaStore 读取一次快照，轮次内只读。
//! `validate()` 发现的问题分两级：单个角色参数非法 -> 调度时跳过（SchedulerSkip）；
//! 名册结构非法（空名册、重复 handle）-> 会话无法启动（SessionError::InvalidConfig）。

pub mod store;

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

pub use store::{parse_roster, FilePersonaStore, InMemoryPersonaStore, PersonaStore, RosterDefaults};

/// 角色 ID：使用 handle
pub type PersonaId = String;

/// 角色配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Persona {
    pub handle: PersonaId,
    /// 显示名
    pub name: String,
    /// 语气倾向
    pub tone: String,
    /// 主动性 [0, 1]
    pub proactivity: f64,
    /// 记忆窗口：-1 表示不限
    pub memory_window: i64,
    /// 每轮最多发言人数：-1 表示不限
    pub max_agents_per_turn: i64,
    /// 发言后冷却的轮数
    pub cooldown_turns: u32,
    /// 角色设定
    pub prompt: String,
    /// 常用语
    #[serde(default)]
    pub catchphrases: Vec<String>,
    /// 允许调用的工具名
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    /// 绑定的 LLM 配置名，None 使用默认后端
    #[serde(default)]
    pub api_profile: Option<String>,
}

impl Persona {
    pub fn new(handle: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            handle: handle.into(),
            name: name.into(),
            tone: "neutral".to_string(),
            proactivity: 0.5,
            memory_window: 8,
            max_agents_per_turn: -1,
            cooldown_turns: 1,
            prompt: String::new(),
            catchphrases: Vec::new(),
            allowed_tools: Vec::new(),
            api_profile: None,
        }
    }

    pub fn with_proactivity(mut self, proactivity: f64) -> Self {
        self.proactivity = proactivity;
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    pub fn with_tone(mut self, tone: impl Into<String>) -> Self {
        self.tone = tone.into();
        self
    }

    pub fn with_memory_window(mut self, window: i64) -> Self {
        self.memory_window = window;
        self
    }

    pub fn with_max_agents(mut self, max: i64) -> Self {
        self.max_agents_per_turn = max;
        self
    }

    pub fn with_cooldown(mut self, turns: u32) -> Self {
        self.cooldown_turns = turns;
        self
    }

    pub fn with_tools(mut self, tools: &[&str]) -> Self {
        self.allowed_tools = tools.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_api_profile(mut self, profile: impl Into<String>) -> Self {
        self.api_profile = Some(profile.into());
        self
    }

    pub fn allows_tool(&self, tool: &str) -> bool {
        self.allowed_tools.iter().any(|t| t == tool)
    }

    /// 设定 + 语气 + 常用语
    pub fn system_prompt(&self) -> String {
        let mut out = self.prompt.trim().to_string();
        if !self.tone.trim().is_empty() {
            out.push_str(&format!("\n语气倾向：{}", self.tone.trim()));
        }
        if !self.catchphrases.is_empty() {
            out.push_str(&format!("\n常用语：{}", self.catchphrases.join("；")));
        }
        out.trim().to_string()
    }

    /// 单个角色的参数检查；返回 Err(原因) 时该角色会被调度器跳过
    pub fn validate(&self) -> Result<(), String> {
        if self.handle.trim().is_empty() {
            return Err("empty handle".to_string());
        }
        if !self.proactivity.is_finite() || !(0.0..=1.0).contains(&self.proactivity) {
            return Err(format!("proactivity {} outside [0, 1]", self.proactivity));
        }
        if self.memory_window < -1 {
            return Err(format!("memory_window {} must be -1 or >= 0", self.memory_window));
        }
        if self.max_agents_per_turn < -1 || self.max_agents_per_turn == 0 {
            return Err(format!(
                "max_agents_per_turn {} must be -1 or >= 1",
                self.max_agents_per_turn
            ));
        }
        Ok(())
    }
}

/// 名册快照：某个会话可用的全部角色，按注册顺序
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersonaRoster {
    pub personas: Vec<Persona>,
}

impl PersonaRoster {
    pub fn new(personas: Vec<Persona>) -> Self {
        Self { personas }
    }

    pub fn get(&self, handle: &str) -> Option<&Persona> {
        self.personas.iter().find(|p| p.handle == handle)
    }

    pub fn handles(&self) -> impl Iterator<Item = &str> {
        self.personas.iter().map(|p| p.handle.as_str())
    }

    /// 名册的结构性检查
    pub fn validate_structure(&self) -> Result<(), String> {
        if self.personas.is_empty() {
            return Err("roster has no personas".to_string());
        }
        let mut seen = HashSet::new();
        for p in &self.personas {
            let key = p.handle.to_lowercase();
            if !key.is_empty() && !seen.insert(key) {
                return Err(format!("duplicate persona handle '{}'", p.handle));
            }
        }
        Ok(())
    }
}
