//! Builders that turn a job configuration into token fields.
//!
//! A configuration looks like
//!
//! ```json
//! {
//!   "PicasApiVersion": 0.5,
//!   "Token": {"OBSID": "L123456", "variables": {"_cal": "3C196"}},
//!   "Job": {"variables": {"NCPU": 4}},
//!   "variables": {"_avg": 4},
//!   "container": {"singularity": {"SIMG": "lofar.simg"}},
//!   "sandbox": {"scripts": [{"prefactor": {"branch": "master"}}]}
//! }
//! ```
//!
//! `Token` keys and `Job.variables` become top level token fields; the
//! launcher settings go into a nested `config.json` field.

use std::path::Path;

use lrt_core::MIN_CONFIG_API_VERSION;
use serde_json::{Map, Value};

use crate::error::{TokenError, TokenResult};

/// Anything that can provide token data.
pub trait TokenBuilder {
    fn data(&self) -> &Map<String, Value>;
}

/// Builds token data from an in-memory configuration.
#[derive(Debug, Clone, Default)]
pub struct TokenDictBuilder {
    data: Map<String, Value>,
}

fn check_api_version(config: &Map<String, Value>) -> TokenResult<()> {
    let Some(version) = config.get("PicasApiVersion") else {
        return Ok(());
    };
    let parsed = match version {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match parsed {
        Some(v) if v < MIN_CONFIG_API_VERSION => Err(TokenError::UnsupportedApiVersion(v)),
        Some(_) => Ok(()),
        None => Err(TokenError::InvalidApiVersion(version.to_string())),
    }
}

fn object(value: Value, what: &str) -> TokenResult<Map<String, Value>> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(TokenError::InvalidConfig(format!(
            "{what} must be an object, got {other}"
        ))),
    }
}

impl TokenDictBuilder {
    /// Flatten a configuration. Consumes it: `Token.variables` is moved into
    /// the top level `variables`.
    pub fn new(mut config: Map<String, Value>) -> TokenResult<Self> {
        check_api_version(&config)?;
        let mut data = Map::new();

        if let Some(token) = config.remove("Token") {
            let mut token = object(token, "Token")?;
            if let Some(vars) = token.remove("variables") {
                let vars = object(vars, "Token.variables")?;
                match config.get_mut("variables") {
                    Some(Value::Object(top)) => top.extend(vars),
                    _ => {
                        config.insert("variables".to_string(), Value::Object(vars));
                    }
                }
            }
            data.extend(token);
        }

        if let Some(Value::Object(job)) = config.get("Job") {
            if let Some(vars) = job.get("variables") {
                data.extend(object(vars.clone(), "Job.variables")?);
            }
        }

        let mut launcher = Map::new();
        for key in ["variables", "container", "sandbox"] {
            if let Some(value) = config.remove(key) {
                launcher.insert(key.to_string(), value);
            }
        }
        data.insert("config.json".to_string(), Value::Object(launcher));

        Ok(Self { data })
    }

    /// Like [`new`](Self::new) for a JSON value that must be an object.
    pub fn from_value(config: Value) -> TokenResult<Self> {
        Self::new(object(config, "token configuration")?)
    }
}

impl TokenBuilder for TokenDictBuilder {
    fn data(&self) -> &Map<String, Value> {
        &self.data
    }
}

/// Builds token data from a JSON configuration file.
#[derive(Debug, Clone)]
pub struct TokenJsonBuilder {
    inner: TokenDictBuilder,
}

impl TokenJsonBuilder {
    pub fn from_path(path: &Path) -> TokenResult<Self> {
        let content = std::fs::read(path)?;
        let config: Value = serde_json::from_slice(&content)?;
        Ok(Self {
            inner: TokenDictBuilder::from_value(config)?,
        })
    }
}

impl TokenBuilder for TokenJsonBuilder {
    fn data(&self) -> &Map<String, Value> {
        self.inner.data()
    }
}
