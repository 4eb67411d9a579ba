//! Backend selection and configuration.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::backends::local::{LocalBackend, ModelCache, ModelKey, ModelLoader, DEFAULT_MAX_NEW_TOKENS};
use crate::backends::ollama::{OllamaBackend, DEFAULT_HOST, DEFAULT_MODEL};
use crate::{BackendError, BackendResult, ChatBackend};

pub const DEFAULT_BASE_MODEL: &str = "Qwen/Qwen2.5-7B-Instruct";
pub const DEFAULT_ADAPTER: &str = "Pk3112/medmcqa-lora-qwen2.5-7b-instruct";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    #[default]
    Ollama,
    Local,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Ollama => "ollama",
            BackendKind::Local => "local",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = BackendError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ollama" => Ok(BackendKind::Ollama),
            "local" | "hf" => Ok(BackendKind::Local),
            _ => Err(BackendError::InvalidConfig(format!(
                "unsupported backend '{value}', expected one of: ollama, local"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub ollama_host: String,
    /// Model name as known to the daemon.
    pub model: String,
    pub base_model: String,
    pub adapter: Option<String>,
    pub load_in_4bit: bool,
    pub max_new_tokens: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            ollama_host: DEFAULT_HOST.to_string(),
            model: DEFAULT_MODEL.to_string(),
            base_model: DEFAULT_BASE_MODEL.to_string(),
            adapter: Some(DEFAULT_ADAPTER.to_string()),
            load_in_4bit: true,
            max_new_tokens: DEFAULT_MAX_NEW_TOKENS,
        }
    }
}

impl BackendConfig {
    pub fn from_env() -> BackendResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source. Unset or blank variables keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> BackendResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let mut config = Self::default();

        if let Some(kind) = get("PARLANCE_BACKEND") {
            config.kind = kind.parse()?;
        }
        if let Some(host) = get("PARLANCE_OLLAMA_HOST") {
            config.ollama_host = host;
        }
        if let Some(model) = get("PARLANCE_MODEL") {
            config.model = model;
        }
        if let Some(base_model) = get("PARLANCE_BASE_MODEL") {
            config.base_model = base_model;
        }
        if let Some(adapter) = get("PARLANCE_ADAPTER") {
            config.adapter = (!adapter.eq_ignore_ascii_case("none")).then_some(adapter);
        }
        if let Some(flag) = get("PARLANCE_LOAD_IN_4BIT") {
            config.load_in_4bit = parse_flag("PARLANCE_LOAD_IN_4BIT", &flag)?;
        }
        if let Some(tokens) = get("PARLANCE_MAX_NEW_TOKENS") {
            config.max_new_tokens = match tokens.parse::<usize>() {
                Ok(value) if value > 0 => value,
                _ => {
                    return Err(BackendError::InvalidConfig(format!(
                        "PARLANCE_MAX_NEW_TOKENS must be a positive integer, got '{tokens}'"
                    )))
                }
            };
        }

        Ok(config)
    }

    pub fn model_key(&self) -> ModelKey {
        ModelKey::new(self.base_model.clone(), self.adapter.clone(), self.load_in_4bit)
    }

    pub fn ollama(&self) -> OllamaBackend {
        OllamaBackend::from_config(self)
    }

    /// Construct the selected backend.
    ///
    /// The local backend needs a model runtime; without a loader it is reported
    /// as unsupported.
    pub fn build(&self, loader: Option<Arc<dyn ModelLoader>>) -> BackendResult<Arc<dyn ChatBackend>> {
        match self.kind {
            BackendKind::Ollama => Ok(Arc::new(self.ollama())),
            BackendKind::Local => {
                let loader = loader.ok_or_else(|| {
                    BackendError::Unsupported(
                        "the local backend needs an embedded model runtime; use --backend ollama"
                            .to_string(),
                    )
                })?;
                let cache = Arc::new(ModelCache::new(loader));
                let backend = LocalBackend::new(cache, self.model_key())
                    .with_max_new_tokens(self.max_new_tokens);
                Ok(Arc::new(backend))
            }
        }
    }
}

fn parse_flag(name: &str, value: &str) -> BackendResult<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(BackendError::InvalidConfig(format!(
            "{name} must be a boolean, got '{value}'"
        ))),
    }
}
