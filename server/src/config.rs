use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use tracing::info;

use crate::engine::chat::MAX_CHAT_LENGTH;
use crate::engine::persistence::MAX_SNAPSHOT_BYTES;
use crate::engine::services::ChannelSettings;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid reserved_pagetitles pattern: {0}")]
    ReservedPattern(#[from] regex::Error),
}

/// Top-level server configuration, loaded from marquee.toml.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    pub server: ServerSection,
    pub database: DatabaseSection,
    pub channels: ChannelsSection,
    pub metadata: MetadataSection,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub web_address: String,
    /// Honour X-Forwarded-For / X-Real-IP from loopback peers.
    pub trust_proxy: bool,
    /// Allowed CORS origin. Empty allows any origin.
    pub public_url: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            web_address: "0.0.0.0:8080".into(),
            trust_proxy: true,
            public_url: String::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    pub url: String,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            url: "sqlite:marquee.db?mode=rwc".into(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ChannelsSection {
    pub dump_dir: String,
    /// Empty disables per-room log files.
    pub log_dir: String,
    pub max_snapshot_bytes: u64,
    pub save_interval_secs: u64,
    /// Page titles matching this pattern are refused by setOptions.
    pub reserved_pagetitles: Option<String>,
    pub max_chat_length: usize,
}

impl Default for ChannelsSection {
    fn default() -> Self {
        Self {
            dump_dir: "chandump".into(),
            log_dir: "chanlogs".into(),
            max_snapshot_bytes: MAX_SNAPSHOT_BYTES,
            save_interval_secs: 300,
            reserved_pagetitles: None,
            max_chat_length: MAX_CHAT_LENGTH,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MetadataSection {
    /// Lookup service root. Unset resolves every id to a placeholder.
    pub base_url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for MetadataSection {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_secs: 10,
        }
    }
}

impl ServerConfig {
    /// Load config from a TOML file. Falls back to defaults if the file doesn't exist.
    /// Environment variables override TOML values.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let mut config = if Path::new(path).exists() {
            let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_string(),
                source,
            })?;
            Self::parse(path, &contents)?
        } else {
            info!("No config file found at {}, using defaults", path);
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    fn parse(path: &str, contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("WEB_ADDRESS") {
            self.server.web_address = v;
        }
        if let Ok(v) = std::env::var("TRUST_PROXY") {
            self.server.trust_proxy = matches!(v.as_str(), "1" | "true" | "yes");
        }
        if let Ok(v) = std::env::var("PUBLIC_URL") {
            self.server.public_url = v;
        }
        if let Ok(v) = std::env::var("DATABASE_URL") {
            self.database.url = v;
        }
        if let Ok(v) = std::env::var("CHANNEL_DUMP_DIR") {
            self.channels.dump_dir = v;
        }
        if let Ok(v) = std::env::var("CHANNEL_LOG_DIR") {
            self.channels.log_dir = v;
        }
        if let Ok(v) = std::env::var("SAVE_INTERVAL_SECS")
            && let Ok(secs) = v.parse()
        {
            self.channels.save_interval_secs = secs;
        }
        if let Ok(v) = std::env::var("MAX_CHAT_LENGTH")
            && let Ok(len) = v.parse()
        {
            self.channels.max_chat_length = len;
        }
        if let Ok(v) = std::env::var("METADATA_URL") {
            self.metadata.base_url = Some(v).filter(|u| !u.is_empty());
        }
    }

    /// Convert into the settings shared by every room.
    pub fn to_settings(&self) -> Result<ChannelSettings, ConfigError> {
        let reserved_pagetitles = self
            .channels
            .reserved_pagetitles
            .as_deref()
            .filter(|p| !p.is_empty())
            .map(Regex::new)
            .transpose()?;
        let log_dir = Some(self.channels.log_dir.as_str())
            .filter(|d| !d.is_empty())
            .map(PathBuf::from);
        Ok(ChannelSettings {
            dump_dir: PathBuf::from(&self.channels.dump_dir),
            log_dir,
            max_snapshot_bytes: self.channels.max_snapshot_bytes,
            reserved_pagetitles,
            max_chat_length: self.channels.max_chat_length,
        })
    }

    pub fn save_interval(&self) -> Duration {
        Duration::from_secs(self.channels.save_interval_secs.max(1))
    }

    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_secs(self.metadata.timeout_secs.max(1))
    }
}
