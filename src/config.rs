//! Configuration file support for mdchat
//!
//! Config is loaded from `~/.mdchat/config.toml` (or `$MDCHAT_HOME/config.toml`).
//! Environment variables override config file settings.

use crate::storage::mdchat_dir;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Get the global config instance (loaded once on first access)
pub fn config() -> &'static Config {
    CONFIG.get_or_init(Config::load)
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Backend service configuration
    pub server: ServerConfig,

    /// Chat defaults
    pub chat: ChatConfig,

    /// Local history configuration
    pub history: HistoryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Base URL of the chat service (default: "http://127.0.0.1:5000")
    pub base_url: String,
    /// Optional bearer token sent with every request
    pub api_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:5000".to_string(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Default chat model (default: "gemini-2.5-flash")
    pub model: String,
    /// Model that produces images instead of streamed text
    pub image_model: String,
    /// How many trailing messages to send with an image request
    pub image_context: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            model: "gemini-2.5-flash".to_string(),
            image_model: "gemini-3-pro-image-preview".to_string(),
            image_context: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Conversations older than this are evicted on every load and save
    /// (default: 30 days)
    pub retention_days: i64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { retention_days: 30 }
    }
}

impl Config {
    /// Load config from disk, falling back to defaults on any problem.
    pub fn load() -> Self {
        let mut config = Self::load_file().unwrap_or_default();
        config.apply_env_overrides();
        config
    }

    fn load_file() -> Option<Self> {
        let path = mdchat_dir().ok()?.join("config.toml");
        let content = std::fs::read_to_string(path).ok()?;
        match toml::from_str(&content) {
            Ok(config) => Some(config),
            Err(e) => {
                crate::logging::warn(&format!("config.toml parse error: {}", e));
                None
            }
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("MDCHAT_BASE_URL") {
            self.server.base_url = url;
        }
        if let Ok(key) = std::env::var("MDCHAT_API_KEY") {
            self.server.api_key = Some(key);
        }
        if let Ok(model) = std::env::var("MDCHAT_MODEL") {
            self.chat.model = model;
        }
    }
}
