use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::RelayError;

/// Environment variable naming the TOML config file.
pub const CONFIG_ENV: &str = "PALAVER_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "palaver.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub relay: RelayConfig,
    pub billing: BillingConfig,
    pub providers: HashMap<String, ProviderConfig>,
    pub models: Vec<ModelConfig>,
    /// Model asked whether a turn needs a web search.
    pub routing_model: Option<String>,
    /// Model that describes images for text-only models.
    pub vision_model: Option<String>,
    /// Model that names conversations.
    pub title_model: Option<String>,
    pub search: SearchConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// How long a consumer waits on the queue before emitting a heartbeat.
    pub poll_wait_secs: u64,
    /// How long a finished slot stays reconnectable.
    pub cleanup_grace_secs: u64,
    pub stop_join_timeout_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_wait_secs: 10,
            cleanup_grace_secs: 600,
            stop_join_timeout_ms: 1000,
        }
    }
}

impl RelayConfig {
    /// Poll wait clamped to 1..=30 seconds.
    pub fn poll_wait(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.poll_wait_secs.clamp(1, 30))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BillingConfig {
    /// Deny anonymous callers. When false, anonymous generations are free.
    pub enforce: bool,
    pub standard_discount: f64,
    pub premium_discount: f64,
    pub standard_free_multiplier: u64,
    pub max_tokens: MaxTokens,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            enforce: true,
            standard_discount: 0.5,
            premium_discount: 0.0,
            standard_free_multiplier: 3,
            max_tokens: MaxTokens::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct MaxTokens {
    pub free: u64,
    pub standard: u64,
    pub premium: u64,
}

impl Default for MaxTokens {
    fn default() -> Self {
        Self {
            free: 1024,
            standard: 2048,
            premium: 8192,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    /// Full chat-completions endpoint URL.
    pub base_url: String,
    /// Environment variable holding the bearer token.
    pub api_key_env: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    /// Display name clients select and that appears in `<model="…"/>`.
    pub name: String,
    /// Upstream model identifier sent in the request body.
    pub id: String,
    pub provider: String,
    #[serde(default)]
    pub vision: bool,
    #[serde(default)]
    pub reasoning: bool,
    #[serde(default = "default_free_daily")]
    pub free_daily: u64,
    /// Flat points charged per metered generation.
    #[serde(default = "default_points")]
    pub points: f64,
    /// When set the model is billed from the balance by tokens instead of points.
    #[serde(default)]
    pub price_per_1k_tokens: Option<f64>,
}

fn default_free_daily() -> u64 {
    20
}

fn default_points() -> f64 {
    1.0
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// SearXNG-compatible JSON endpoint. Web search is disabled when unset.
    pub base_url: Option<String>,
    pub max_results: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub duckdb_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            relay: RelayConfig::default(),
            billing: BillingConfig::default(),
            providers: default_providers(),
            models: default_models(),
            routing_model: Some("DeepSeek-V3".to_string()),
            vision_model: Some("QvQ".to_string()),
            title_model: Some("GLM-4".to_string()),
            search: SearchConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl Config {
    /// Load from `$PALAVER_CONFIG` (or `palaver.toml` in the working
    /// directory). A missing file yields the built-in defaults.
    pub fn load() -> Result<Self, RelayError> {
        let path = std::env::var(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE));
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self, RelayError> {
        match std::fs::read_to_string(path) {
            Ok(raw) => {
                let config = Self::from_toml_str(&raw)?;
                tracing::info!(path = %path.display(), models = config.models.len(), "config loaded");
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "config file not found, using built-in defaults");
                Ok(Self::default())
            }
            Err(e) => Err(RelayError::Config(format!(
                "cannot read {}: {e}",
                path.display()
            ))),
        }
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, RelayError> {
        let config: Self = toml::from_str(raw).map_err(|e| RelayError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), RelayError> {
        let mut seen = std::collections::HashSet::new();
        for model in &self.models {
            if !seen.insert(model.name.as_str()) {
                return Err(RelayError::Config(format!(
                    "duplicate model name: {}",
                    model.name
                )));
            }
            if !self.providers.contains_key(&model.provider) {
                return Err(RelayError::Config(format!(
                    "model {} references unknown provider {}",
                    model.name, model.provider
                )));
            }
        }
        Ok(())
    }
}

fn default_providers() -> HashMap<String, ProviderConfig> {
    [
        (
            "siliconflow",
            "https://api.siliconflow.cn/v1/chat/completions",
            "SILICONFLOW_API_KEY",
        ),
        (
            "volcano",
            "https://ark.cn-beijing.volces.com/api/v3/chat/completions",
            "VOLCANO_API_KEY",
        ),
        (
            "gemini",
            "https://generativelanguage.googleapis.com/v1beta/openai/chat/completions",
            "GEMINI_API_KEY",
        ),
    ]
    .into_iter()
    .map(|(name, url, env)| {
        (
            name.to_string(),
            ProviderConfig {
                base_url: url.to_string(),
                api_key_env: env.to_string(),
            },
        )
    })
    .collect()
}

fn default_models() -> Vec<ModelConfig> {
    // (name, upstream id, provider, vision, reasoning, free_daily, points)
    let table: &[(&str, &str, &str, bool, bool, u64, f64)] = &[
        ("DeepSeek-R1", "deepseek-ai/DeepSeek-R1", "siliconflow", false, true, 25, 10.0),
        ("DeepSeek-V3", "deepseek-ai/DeepSeek-V3", "siliconflow", false, false, 50, 5.0),
        ("Doubao-1.5-Lite", "doubao-1-5-lite-32k-250115", "volcano", false, false, 10, 10.0),
        ("Doubao-1.5-Pro", "doubao-1-5-pro-32k-250115", "volcano", false, false, 10, 10.0),
        ("Doubao-1.5-Pro-256k", "doubao-1-5-pro-256k-250115", "volcano", false, false, 10, 10.0),
        ("Doubao-1.5-vision-Pro", "doubao-1-5-vision-pro-32k-250115", "volcano", true, false, 10, 10.0),
        ("Doubao-1.5-Thinking-Pro", "doubao-1-5-thinking-pro-250415", "volcano", false, true, 20, 10.0),
        ("Doubao-1.5-Thinking-vision-Pro", "doubao-1-5-thinking-vision-pro-250428", "volcano", true, true, 20, 10.0),
        ("Gemini-2.5-Flash", "gemini-2.5-flash-preview-04-17", "gemini", true, true, 25, 5.0),
        ("Gemini-2.0-Flash", "gemini-2.0-flash", "gemini", true, false, 50, 5.0),
        ("Qwen3", "Qwen/Qwen3-235B-A22B", "siliconflow", false, true, 45, 2.0),
        ("QwQ", "Qwen/QwQ-32B", "siliconflow", false, true, 60, 2.0),
        ("QwQ-Preview", "Qwen/QwQ-32B-Preview", "siliconflow", false, true, 80, 1.0),
        ("QvQ", "Qwen/QVQ-72B-Preview", "siliconflow", true, true, 45, 1.0),
        ("Qwen2.5-Instruct", "Qwen/Qwen2.5-72B-Instruct", "siliconflow", false, false, 60, 1.0),
        ("GLM-4", "THUDM/GLM-4-32B-0414", "siliconflow", false, false, 20, 2.0),
        ("GLM-Z1", "THUDM/GLM-Z1-32B-0414", "siliconflow", false, true, 20, 5.0),
    ];
    table
        .iter()
        .map(
            |&(name, id, provider, vision, reasoning, free_daily, points)| ModelConfig {
                name: name.to_string(),
                id: id.to_string(),
                provider: provider.to_string(),
                vision,
                reasoning,
                free_daily,
                points,
                price_per_1k_tokens: None,
            },
        )
        .collect()
}
