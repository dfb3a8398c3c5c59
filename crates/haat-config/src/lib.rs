use std::collections::HashSet;

use haat_contracts::Role;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(String),
    #[error("parse config failed: {0}")]
    Parse(String),
    #[error("schema load failed: {0}")]
    SchemaLoad(String),
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: Server,
    pub store: Store,
    #[serde(default)]
    pub chat: Chat,
    #[serde(default)]
    pub live: Live,
    #[serde(default)]
    pub notifications: Notifications,
    #[serde(default)]
    pub logging: Logging,
    #[serde(default)]
    pub directory: Directory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub listen_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Store {
    #[serde(rename = "type")]
    pub kind: String,
    pub sqlite_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chat {
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
    #[serde(default = "default_max_text_len")]
    pub max_text_len: usize,
    #[serde(default = "default_preview_len")]
    pub preview_len: usize,
    #[serde(default = "default_subject_len")]
    pub subject_len: usize,
    #[serde(default = "default_page_limit")]
    pub default_page_limit: u32,
    #[serde(default = "default_max_page_limit")]
    pub max_page_limit: u32,
    #[serde(default = "default_list_limit")]
    pub list_limit: usize,
}

impl Default for Chat {
    fn default() -> Self {
        Self {
            max_messages: default_max_messages(),
            max_text_len: default_max_text_len(),
            preview_len: default_preview_len(),
            subject_len: default_subject_len(),
            default_page_limit: default_page_limit(),
            max_page_limit: default_max_page_limit(),
            list_limit: default_list_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Live {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for Live {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notifications {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub jsonl_path: Option<String>,
}

impl Default for Notifications {
    fn default() -> Self {
        Self {
            enabled: true,
            jsonl_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Logging {
    #[serde(default = "default_log_filter")]
    pub filter: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            format: default_log_format(),
        }
    }
}

/// Static seed for the identity, catalog and order collaborators.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Directory {
    #[serde(default)]
    pub principals: Vec<PrincipalSeed>,
    #[serde(default)]
    pub products: Vec<ProductSeed>,
    #[serde(default)]
    pub orders: Vec<OrderSeed>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrincipalSeed {
    pub id: String,
    pub name: String,
    pub role: Role,
    pub token: String,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub blocked: bool,
    #[serde(default = "default_true")]
    pub notify_chat: bool,
    #[serde(default = "default_true")]
    pub notify_in_app: bool,
    #[serde(default)]
    pub subscribed_farmers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductSeed {
    pub id: String,
    pub name: String,
    pub owner: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderSeed {
    pub buyer: String,
    pub farmers: Vec<String>,
}

fn default_max_messages() -> usize {
    1500
}

fn default_max_text_len() -> usize {
    1000
}

fn default_preview_len() -> usize {
    240
}

fn default_subject_len() -> usize {
    160
}

fn default_page_limit() -> u32 {
    40
}

fn default_max_page_limit() -> u32 {
    100
}

fn default_list_limit() -> usize {
    120
}

fn default_channel_capacity() -> usize {
    64
}

fn default_true() -> bool {
    true
}

fn default_log_filter() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    let config_text =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    let value: serde_yaml::Value =
        serde_yaml::from_str(&config_text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let instance = serde_json::to_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_against_schema(&instance)?;

    let cfg: Config =
        serde_json::from_value(instance).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

fn validate_against_schema(instance: &serde_json::Value) -> Result<(), ConfigError> {
    let schema_path = [
        std::path::PathBuf::from("config/config.schema.json"),
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("config/config.schema.json"),
    ]
    .into_iter()
    .find(|p| p.exists())
    .ok_or_else(|| {
        ConfigError::SchemaLoad(
            "config schema not found at config/config.schema.json or workspace config path"
                .to_string(),
        )
    })?;

    let schema_text =
        std::fs::read_to_string(schema_path).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    let schema: serde_json::Value =
        serde_json::from_str(&schema_text).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;

    let validator =
        jsonschema::validator_for(&schema).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    if let Err(first) = validator.validate(instance) {
        return Err(ConfigError::SchemaValidation(first.to_string()));
    }
    Ok(())
}

pub fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.store.kind != "memory" && cfg.store.kind != "sqlite" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "store.type={} is not implemented; supported: memory, sqlite",
            cfg.store.kind
        )));
    }
    if cfg.store.kind == "memory" && cfg.store.sqlite_path.is_some() {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is not supported when store.type=memory".to_string(),
        ));
    }
    if cfg.store.kind == "sqlite"
        && cfg
            .store
            .sqlite_path
            .as_ref()
            .map(|v| v.trim().is_empty())
            .unwrap_or(true)
    {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is required when store.type=sqlite".to_string(),
        ));
    }
    if cfg.chat.max_messages == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "chat.max_messages must be >= 1".to_string(),
        ));
    }
    if cfg.chat.max_text_len == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "chat.max_text_len must be >= 1".to_string(),
        ));
    }
    if cfg.chat.default_page_limit == 0 || cfg.chat.default_page_limit > cfg.chat.max_page_limit {
        return Err(ConfigError::UnsupportedConfig(
            "chat.default_page_limit must be between 1 and chat.max_page_limit".to_string(),
        ));
    }
    if cfg.live.channel_capacity == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "live.channel_capacity must be >= 1".to_string(),
        ));
    }
    if cfg.logging.format != "text" && cfg.logging.format != "json" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "logging.format={} is not implemented; supported: text, json",
            cfg.logging.format
        )));
    }

    let mut ids = HashSet::new();
    let mut tokens = HashSet::new();
    for p in &cfg.directory.principals {
        if !ids.insert(p.id.as_str()) {
            return Err(ConfigError::UnsupportedConfig(format!(
                "directory.principals has duplicate id {}",
                p.id
            )));
        }
        if p.token.trim().is_empty() || !tokens.insert(p.token.as_str()) {
            return Err(ConfigError::UnsupportedConfig(format!(
                "directory.principals[{}].token must be non-empty and unique",
                p.id
            )));
        }
    }
    Ok(())
}
