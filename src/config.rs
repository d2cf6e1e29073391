use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::errors::{AppError, AppResult};

/// Keys that must be present in every config file
pub const REQUIRED_FIELDS: [&str; 5] = [
    "db_path",
    "api_key",
    "api_secret",
    "access_token",
    "access_secret",
];

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Local path of the catalog, or its object key when `db_bucket` is set
    pub db_path: String,
    #[serde(default)]
    pub db_bucket: Option<String>,
    #[serde(default)]
    pub storage_region: Option<String>,
    #[serde(default)]
    pub storage_endpoint: Option<String>,

    pub api_key: String,
    pub api_secret: String,
    pub access_token: String,
    pub access_secret: String,

    #[serde(default = "default_upload_url")]
    pub upload_url: String,
    #[serde(default = "default_status_url")]
    pub status_url: String,
    #[serde(default = "default_public_url_base")]
    pub public_url_base: String,
    #[serde(default = "default_media_category")]
    pub media_category: String,

    #[serde(default = "default_chunk_size_bytes")]
    pub chunk_size_bytes: u64,
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: u64,
    #[serde(default = "default_max_caption_chars")]
    pub max_caption_chars: usize,
    #[serde(default = "default_poll_budget_secs")]
    pub poll_budget_secs: u64,
    #[serde(default = "default_poll_margin_ms")]
    pub poll_margin_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,
    #[serde(default)]
    pub claim_lease_secs: Option<u64>,
}

fn default_upload_url() -> String {
    "https://upload.twitter.com/1.1/media/upload.json".to_string()
}

fn default_status_url() -> String {
    "https://api.twitter.com/1.1/statuses/update.json".to_string()
}

fn default_public_url_base() -> String {
    "https://twitter.com/i/web/status/".to_string()
}

fn default_media_category() -> String {
    "tweet_image".to_string()
}

fn default_chunk_size_bytes() -> u64 {
    3 * MIB
}

fn default_max_payload_bytes() -> u64 {
    5 * MIB
}

fn default_max_caption_chars() -> usize {
    280
}

fn default_poll_budget_secs() -> u64 {
    60
}

fn default_poll_margin_ms() -> u64 {
    200
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_attempt_timeout_secs() -> u64 {
    600
}

impl Config {
    /// Builds a config from a parsed JSON document, reporting every
    /// missing required key at once.
    pub fn from_value(value: serde_json::Value) -> AppResult<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| AppError::Config("Config must be a JSON object".to_string()))?;

        let mut missing: Vec<String> = REQUIRED_FIELDS
            .iter()
            .filter(|field| object.get(**field).map_or(true, |v| v.is_null()))
            .map(|field| field.to_string())
            .collect();

        if !missing.is_empty() {
            missing.sort();
            return Err(AppError::MissingConfigFields { fields: missing });
        }

        let config: Config = serde_json::from_value(value)
            .map_err(|e| AppError::Config(format!("Invalid config: {}", e)))?;
        validate_config(&config)?;
        Ok(config)
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size_bytes as usize
    }

    pub fn poll_budget(&self) -> Duration {
        Duration::from_secs(self.poll_budget_secs)
    }

    pub fn poll_margin(&self) -> Duration {
        Duration::from_millis(self.poll_margin_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn claim_lease(&self) -> Option<Duration> {
        self.claim_lease_secs.map(Duration::from_secs)
    }
}

pub fn load_config(config_path: &Path) -> AppResult<Config> {
    let config_str = fs::read_to_string(config_path).map_err(|e| {
        AppError::Config(format!(
            "Could not read config file {}: {}",
            config_path.display(),
            e
        ))
    })?;

    let value: serde_json::Value = serde_json::from_str(&config_str)
        .map_err(|e| AppError::Config(format!("Config is not valid JSON: {}", e)))?;

    let config = Config::from_value(value)?;
    log::debug!("Loaded configuration from {}", config_path.display());
    Ok(config)
}

pub fn validate_config(config: &Config) -> AppResult<()> {
    let credentials = [
        ("db_path", &config.db_path),
        ("api_key", &config.api_key),
        ("api_secret", &config.api_secret),
        ("access_token", &config.access_token),
        ("access_secret", &config.access_secret),
    ];
    let mut blank: Vec<String> = credentials
        .iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| name.to_string())
        .collect();
    if !blank.is_empty() {
        blank.sort();
        return Err(AppError::MissingConfigFields { fields: blank });
    }

    if config.chunk_size_bytes == 0 || config.chunk_size_bytes > 5 * MIB {
        return Err(AppError::Config(
            "chunk_size_bytes must be between 1 byte and 5 MiB".to_string(),
        ));
    }

    if config.max_payload_bytes == 0 {
        return Err(AppError::Config(
            "max_payload_bytes must be greater than 0".to_string(),
        ));
    }

    if config.max_caption_chars == 0 {
        return Err(AppError::Config(
            "max_caption_chars must be greater than 0".to_string(),
        ));
    }

    if config.poll_budget_secs == 0 {
        return Err(AppError::Config(
            "poll_budget_secs must be greater than 0".to_string(),
        ));
    }

    if config.claim_lease_secs == Some(0) {
        return Err(AppError::Config(
            "claim_lease_secs must be greater than 0 when set".to_string(),
        ));
    }

    for (name, url) in [
        ("upload_url", &config.upload_url),
        ("status_url", &config.status_url),
    ] {
        if !(url.starts_with("https://") || url.starts_with("http://")) {
            return Err(AppError::Config(format!("{} must be an http(s) URL", name)));
        }
    }

    Ok(())
}
