//! lrt.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::duration::parse_duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LrtConfig {
    pub server: ServerConfig,
    pub credentials: Option<CredentialsConfig>,
    pub archive: Option<ArchiveConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Base URL of the CouchDB server, e.g. `https://picas.example.org:6984`.
    pub url: String,
    pub database: String,
    /// Request timeout such as "30s" or "500ms".
    pub timeout: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsConfig {
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    pub dir: Option<String>,
    pub compress: Option<bool>,
}

impl LrtConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: LrtConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Scaffold a minimal lrt.toml pointing at a local CouchDB.
    pub fn scaffold(database: &str) -> Self {
        LrtConfig {
            server: ServerConfig {
                url: "http://localhost:5984".to_string(),
                database: database.to_string(),
                timeout: Some("30s".to_string()),
            },
            credentials: None,
            archive: Some(ArchiveConfig {
                dir: Some(".".to_string()),
                compress: Some(false),
            }),
        }
    }

    /// Request timeout, falling back to 30 seconds when unset or unparsable.
    pub fn timeout(&self) -> Duration {
        self.server
            .timeout
            .as_deref()
            .and_then(parse_duration)
            .unwrap_or(Duration::from_secs(30))
    }
}
