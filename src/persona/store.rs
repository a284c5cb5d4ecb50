//! 角色名册存储
//!
//! 编排器在每个轮次开始时调用一次 `load_roster`，拿到只读快照。
//! 文件格式（TOML）：
//!
//! ```toml
//! [settings]
//! memory_window = 8
//! max_agents_per_turn = 2
//!
//! [[personas]]
//! handle = "historian"
//! name = "Ada"
//! proactivity = 0.8
//! prompt = "..."
//! ```
//!
//! 角色未写 memory_window / max_agents_per_turn 时由 `[settings]` 补齐，
//! `[settings]` 也没写时使用配置里的 session 默认值。

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::config::SessionSection;
use crate::core::StoreError;
use crate::persona::{Persona, PersonaRoster};

/// 角色名册来源
#[async_trait]
pub trait PersonaStore: Send + Sync {
    async fn load_roster(&self, session_id: &str) -> Result<PersonaRoster, StoreError>;
}

/// 内存名册：按会话覆盖，否则用共享名册
#[derive(Default)]
pub struct InMemoryPersonaStore {
    shared: RwLock<PersonaRoster>,
    per_session: RwLock<HashMap<String, PersonaRoster>>,
}

impl InMemoryPersonaStore {
    pub fn new(personas: Vec<Persona>) -> Self {
        Self {
            shared: RwLock::new(PersonaRoster::new(personas)),
            per_session: RwLock::new(HashMap::new()),
        }
    }

    /// 替换共享名册（下一轮次生效）
    pub async fn replace(&self, personas: Vec<Persona>) {
        *self.shared.write().await = PersonaRoster::new(personas);
    }

    pub async fn set_session_roster(&self, session_id: &str, personas: Vec<Persona>) {
        self.per_session
            .write()
            .await
            .insert(session_id.to_string(), PersonaRoster::new(personas));
    }
}

#[async_trait]
impl PersonaStore for InMemoryPersonaStore {
    async fn load_roster(&self, session_id: &str) -> Result<PersonaRoster, StoreError> {
        if let Some(roster) = self.per_session.read().await.get(session_id) {
            return Ok(roster.clone());
        }
        Ok(self.shared.read().await.clone())
    }
}

/// 名册级默认值
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RosterDefaults {
    pub memory_window: i64,
    pub max_agents_per_turn: i64,
}

impl Default for RosterDefaults {
    fn default() -> Self {
        Self {
            memory_window: 8,
            max_agents_per_turn: 2,
        }
    }
}

impl From<&SessionSection> for RosterDefaults {
    fn from(s: &SessionSection) -> Self {
        Self {
            memory_window: s.default_memory_window,
            max_agents_per_turn: s.default_max_agents_per_turn,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RosterFile {
    #[serde(default)]
    settings: RosterSettings,
    #[serde(default)]
    personas: Vec<PersonaEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct RosterSettings {
    memory_window: Option<i64>,
    max_agents_per_turn: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct PersonaEntry {
    handle: String,
    name: Option<String>,
    #[serde(default)]
    tone: String,
    #[serde(default = "default_proactivity")]
    proactivity: f64,
    memory_window: Option<i64>,
    max_agents_per_turn: Option<i64>,
    #[serde(default = "default_cooldown")]
    cooldown_turns: u32,
    #[serde(default, alias = "system_prompt")]
    prompt: String,
    #[serde(default)]
    catchphrases: Vec<String>,
    #[serde(default)]
    allowed_tools: Vec<String>,
    api_profile: Option<String>,
}

fn default_proactivity() -> f64 {
    0.5
}

fn default_cooldown() -> u32 {
    1
}

/// 解析名册文本
pub fn parse_roster(text: &str, defaults: RosterDefaults) -> Result<PersonaRoster, StoreError> {
    let file: RosterFile = toml::from_str(text).map_err(|e| StoreError::Parse(e.to_string()))?;
    let window = file.settings.memory_window.unwrap_or(defaults.memory_window);
    let max_agents = file
        .settings
        .max_agents_per_turn
        .unwrap_or(defaults.max_agents_per_turn);

    let personas = file
        .personas
        .into_iter()
        .map(|entry| Persona {
            name: entry.name.unwrap_or_else(|| entry.handle.clone()),
            handle: entry.handle,
            tone: entry.tone,
            proactivity: entry.proactivity,
            memory_window: entry.memory_window.unwrap_or(window),
            max_agents_per_turn: entry.max_agents_per_turn.unwrap_or(max_agents),
            cooldown_turns: entry.cooldown_turns,
            prompt: entry.prompt,
            catchphrases: entry.catchphrases,
            allowed_tools: entry.allowed_tools,
            api_profile: entry.api_profile,
        })
        .collect();
    Ok(PersonaRoster::new(personas))
}

/// TOML 文件名册：每次 load 都重新读文件，编辑后下一轮次生效
pub struct FilePersonaStore {
    path: PathBuf,
    defaults: RosterDefaults,
}

impl FilePersonaStore {
    pub fn new(path: impl AsRef<Path>, defaults: RosterDefaults) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            defaults,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl PersonaStore for FilePersonaStore {
    async fn load_roster(&self, _session_id: &str) -> Result<PersonaRoster, StoreError> {
        let text = tokio::fs::read_to_string(&self.path).await?;
        parse_roster(&text, self.defaults)
    }
}
