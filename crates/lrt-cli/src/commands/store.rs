//! Resolve which document store a command talks to.
//!
//! Flags and `PICAS_*` environment variables win over lrt.toml. `--local`
//! bypasses the server entirely.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use lrt_core::LrtConfig;
use lrt_store::{CouchClient, CouchConfig, DocumentStore, EmbeddedStore};
use lrt_token::TokenHandler;
use tracing::debug;

use crate::StoreArgs;

const DEFAULT_CONFIG: &str = "lrt.toml";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Settings {
    args: StoreArgs,
    file: Option<LrtConfig>,
}

impl Settings {
    pub fn load(args: &StoreArgs) -> anyhow::Result<Self> {
        let file = match &args.config {
            Some(path) => Some(
                LrtConfig::from_file(path).with_context(|| format!("reading {}", path.display()))?,
            ),
            None if Path::new(DEFAULT_CONFIG).exists() => {
                Some(LrtConfig::from_file(Path::new(DEFAULT_CONFIG))?)
            }
            None => None,
        };
        Ok(Self {
            args: args.clone(),
            file,
        })
    }

    pub fn open(&self) -> anyhow::Result<Arc<dyn DocumentStore>> {
        if let Some(path) = &self.args.local {
            debug!(path = %path.display(), "opening embedded store");
            return Ok(Arc::new(EmbeddedStore::open(path)?));
        }
        Ok(Arc::new(CouchClient::new(self.couch_config()?)?))
    }

    fn couch_config(&self) -> anyhow::Result<CouchConfig> {
        let server = self.file.as_ref().map(|c| &c.server);
        let url = self
            .args
            .url
            .clone()
            .or_else(|| server.map(|s| s.url.clone()))
            .context("no server url: pass --url, set PICAS_URL or write lrt.toml")?;
        let database = self
            .args
            .db
            .clone()
            .or_else(|| server.map(|s| s.database.clone()))
            .context("no database: pass --db, set PICAS_DB or write lrt.toml")?;

        let timeout = self.file.as_ref().map_or(DEFAULT_TIMEOUT, LrtConfig::timeout);
        let mut config = CouchConfig::new(&url, &database).with_timeout(timeout);
        if let Some((user, password)) = self.credentials() {
            config = config.with_credentials(&user, &password);
        }
        debug!(%url, %database, "using CouchDB");
        Ok(config)
    }

    fn credentials(&self) -> Option<(String, String)> {
        match (&self.args.user, &self.args.password) {
            (Some(user), Some(password)) => Some((user.clone(), password.clone())),
            _ => self
                .file
                .as_ref()
                .and_then(|c| c.credentials.as_ref())
                .map(|c| (c.user.clone(), c.password.clone())),
        }
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.file
            .as_ref()
            .and_then(|c| c.archive.as_ref())
            .and_then(|a| a.dir.clone())
            .map_or_else(|| PathBuf::from("."), PathBuf::from)
    }

    pub fn archive_compress(&self) -> bool {
        self.file
            .as_ref()
            .and_then(|c| c.archive.as_ref())
            .and_then(|a| a.compress)
            .unwrap_or(false)
    }
}

pub fn handler(settings: &Settings, token_type: &str) -> anyhow::Result<TokenHandler> {
    Ok(TokenHandler::new(token_type, settings.open()?)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_file(dir: &Path) -> PathBuf {
        let path = dir.join("lrt.toml");
        std::fs::write(
            &path,
            r#"
[server]
url = "https://picas.example.org:6984"
database = "tokens"
timeout = "5s"

[credentials]
user = "lofar"
password = "secret"

[archive]
dir = "/data/archive"
compress = true
"#,
        )
        .unwrap();
        path
    }

    #[test]
    fn flags_override_file() {
        let dir = tempfile::tempdir().unwrap();
        let args = StoreArgs {
            config: Some(config_file(dir.path())),
            db: Some("other_db".to_string()),
            ..Default::default()
        };
        let settings = Settings::load(&args).unwrap();
        let config = settings.couch_config().unwrap();
        assert_eq!(config.url, "https://picas.example.org:6984");
        assert_eq!(config.database, "other_db");
        assert_eq!(config.username.as_deref(), Some("lofar"));
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(settings.archive_dir(), PathBuf::from("/data/archive"));
        assert!(settings.archive_compress());
    }

    #[test]
    fn missing_url_is_an_error() {
        let settings = Settings::load(&StoreArgs {
            config: None,
            db: Some("tokens".to_string()),
            ..Default::default()
        })
        .unwrap();
        let err = settings.couch_config().unwrap_err();
        assert!(err.to_string().contains("PICAS_URL"));
    }

    #[test]
    fn local_store_needs_no_server() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(&StoreArgs {
            local: Some(dir.path().join("tokens.redb")),
            ..Default::default()
        })
        .unwrap();
        let store = settings.open().unwrap();
        assert_eq!(store.name(), "tokens");
        assert!(!settings.archive_compress());
        assert_eq!(settings.archive_dir(), PathBuf::from("."));
    }
}
