//! 按角色选择后端
//!
//! 角色的 `api_profile` 命中已注册的配置时使用对应后端，否则回落到默认后端。

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use crate::llm::traits::LlmBackend;
use crate::persona::Persona;

#[derive(Clone)]
pub struct LlmProfiles {
    default: Arc<dyn LlmBackend>,
    profiles: HashMap<String, Arc<dyn LlmBackend>>,
}

impl LlmProfiles {
    pub fn new(default: Arc<dyn LlmBackend>) -> Self {
        Self {
            default,
            profiles: HashMap::new(),
        }
    }

    pub fn with_profile(mut self, name: impl Into<String>, backend: Arc<dyn LlmBackend>) -> Self {
        self.profiles.insert(name.into(), backend);
        self
    }

    pub fn resolve(&self, persona: &Persona) -> Arc<dyn LlmBackend> {
        match persona.api_profile.as_deref() {
            None => Arc::clone(&self.default),
            Some(name) => match self.profiles.get(name) {
                Some(backend) => Arc::clone(backend),
                None => {
                    warn!(persona = %persona.handle, profile = name, "unknown api profile, using default backend");
                    Arc::clone(&self.default)
                }
            },
        }
    }

    pub fn profile_names(&self) -> impl Iterator<Item = &str> {
        self.profiles.keys().map(String::as_str)
    }
}
