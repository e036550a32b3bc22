//! Token: one unit of grid work.
//!
//! The PiCaS fields a launcher reads and writes are typed struct fields;
//! everything else a builder or a worker adds lives in an open extension map
//! and is written back untouched. `_id` and `type` are fixed at creation.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use lrt_core::PICAS_API_VERSION;
use lrt_store::{AttachmentStub, Document, DocumentStore};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::builder::TokenBuilder;
use crate::error::{TokenError, TokenResult};

/// A PiCaS token document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "type")]
    token_type: String,
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    #[serde(
        rename = "PICAS_API_VERSION",
        default = "default_api_version",
        deserialize_with = "version_string"
    )]
    pub picas_api_version: String,
    /// Claim timestamp; 0 means unlocked.
    #[serde(default, deserialize_with = "timestamp")]
    pub lock: i64,
    /// Completion timestamp; 0 means not done.
    #[serde(default, deserialize_with = "timestamp")]
    pub done: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "count")]
    pub scrub_count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Exit code or message of the last run; `""` when cleared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(rename = "_attachments", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attachments: BTreeMap<String, AttachmentStub>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

fn default_api_version() -> String {
    PICAS_API_VERSION.to_string()
}

/// Lock and done are timestamps; workers write integers or floats.
pub(crate) fn timestamp_of(value: &Value) -> i64 {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(0),
        Value::String(s) => s.trim().parse::<f64>().map(|f| f as i64).unwrap_or(0),
        Value::Bool(b) => i64::from(*b),
        _ => 0,
    }
}

fn timestamp<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    Ok(timestamp_of(&Value::deserialize(deserializer)?))
}

fn count<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => None,
        other => Some(timestamp_of(&other)),
    })
}

fn version_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Null => default_api_version(),
        other => other.to_string(),
    })
}

impl Token {
    /// A fresh, unlocked token. The id defaults to the token type.
    pub fn new(token_type: &str, token_id: Option<&str>) -> Self {
        let id = token_id.filter(|id| !id.is_empty()).unwrap_or(token_type);
        Self {
            id: id.to_string(),
            token_type: token_type.to_string(),
            rev: None,
            picas_api_version: default_api_version(),
            lock: 0,
            done: 0,
            status: None,
            scrub_count: None,
            hostname: None,
            output: None,
            attachments: BTreeMap::new(),
            extra: Map::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn token_type(&self) -> &str {
        &self.token_type
    }

    /// Custom (non-PiCaS) fields.
    pub fn extra(&self) -> &Map<String, Value> {
        &self.extra
    }

    /// A custom field by name.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }

    /// Remove a custom field.
    pub fn remove_field(&mut self, key: &str) -> Option<Value> {
        self.extra.remove(key)
    }

    /// Any field by its document key, typed fields included.
    pub fn get(&self, key: &str) -> Option<Value> {
        match key {
            "_id" => Some(Value::String(self.id.clone())),
            "type" => Some(Value::String(self.token_type.clone())),
            "_rev" => self.rev.clone().map(Value::String),
            "PICAS_API_VERSION" => Some(Value::String(self.picas_api_version.clone())),
            "lock" => Some(Value::from(self.lock)),
            "done" => Some(Value::from(self.done)),
            "status" => self.status.clone().map(Value::String),
            "scrub_count" => self.scrub_count.map(Value::from),
            "hostname" => self.hostname.clone().map(Value::String),
            "output" => self.output.clone(),
            "_attachments" if self.attachments.is_empty() => None,
            "_attachments" => serde_json::to_value(&self.attachments).ok(),
            _ => self.extra.get(key).cloned(),
        }
    }

    /// Set any field by its document key. `_id` and `type` are rejected.
    pub fn set_field(&mut self, key: &str, value: Value) -> TokenResult<()> {
        match key {
            "_id" | "type" => return Err(TokenError::ImmutableField(key.to_string())),
            "_rev" => self.rev = serde_json::from_value(value)?,
            "PICAS_API_VERSION" => {
                self.picas_api_version = match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                }
            }
            "lock" => self.lock = timestamp_of(&value),
            "done" => self.done = timestamp_of(&value),
            "status" => self.status = serde_json::from_value(value)?,
            "scrub_count" => {
                self.scrub_count = match value {
                    Value::Null => None,
                    other => Some(timestamp_of(&other)),
                }
            }
            "hostname" => self.hostname = serde_json::from_value(value)?,
            "output" => self.output = Some(value).filter(|v| !v.is_null()),
            "_attachments" => self.attachments = serde_json::from_value(value)?,
            _ => {
                self.extra.insert(key.to_string(), value);
            }
        }
        Ok(())
    }

    /// Put the token back in the todo state. Local only; save to persist.
    pub fn reset(&mut self) {
        self.lock = 0;
        self.done = 0;
        self.scrub_count = Some(self.scrub_count.unwrap_or(0) + 1);
        self.hostname = Some(String::new());
        self.output = Some(Value::String(String::new()));
        self.status = Some("reset".to_string());
    }

    /// Merge a builder's data into the token; builder keys win.
    pub fn build(&mut self, builder: &dyn TokenBuilder) -> TokenResult<()> {
        for (key, value) in builder.data() {
            if key == "_id" || key == "type" {
                warn!(token = %self.id, %key, "builder tried to overwrite an immutable field, ignored");
                continue;
            }
            self.set_field(key, value.clone())?;
        }
        debug!(token = %self.id, keys = builder.data().len(), "token built");
        Ok(())
    }

    /// Reconcile with the stored copy.
    ///
    /// Every key present on either side is kept. The preferred side wins
    /// where it has the key and the other side fills the gaps; the stored
    /// `_rev` is always adopted. With `upload` the result is written back.
    pub async fn synchronize(
        &mut self,
        store: &dyn DocumentStore,
        prefer_local: bool,
        upload: bool,
    ) -> TokenResult<()> {
        let remote = store.get_document(&self.id).await?;
        let local = self.to_document()?;
        let (preferred, fallback) = if prefer_local {
            (local.as_map(), remote.as_map())
        } else {
            (remote.as_map(), local.as_map())
        };

        let keys: BTreeSet<&String> = preferred.keys().chain(fallback.keys()).collect();
        let mut merged = Map::new();
        for key in keys {
            if let Some(value) = preferred.get(key.as_str()).or_else(|| fallback.get(key.as_str())) {
                merged.insert(key.clone(), value.clone());
            }
        }
        if let Some(rev) = remote.rev() {
            merged.insert("_rev".to_string(), Value::String(rev.to_string()));
        }

        let merged = Token::from_document(Document::from_map(merged))?;
        if merged.token_type != self.token_type {
            return Err(TokenError::WrongTokenType {
                found: merged.token_type,
                expected: self.token_type.clone(),
            });
        }
        *self = merged;

        if upload {
            let rev = store.put_document(&self.to_document()?).await?;
            self.rev = Some(rev);
        }
        debug!(token = %self.id, prefer_local, upload, "token synchronized");
        Ok(())
    }

    /// The id made safe for use as a file name.
    pub fn filename(&self) -> String {
        self.id.replace('/', "_")
    }

    /// Write the token as `{filename}.json` into `dir`.
    pub fn dump(&self, dir: &Path) -> TokenResult<PathBuf> {
        let path = dir.join(format!("{}.json", self.filename()));
        std::fs::write(&path, serde_json::to_vec_pretty(self)?)?;
        Ok(path)
    }

    pub fn to_document(&self) -> TokenResult<Document> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(Document::from_map(map)),
            _ => Err(TokenError::InvalidConfig("token did not serialize to an object".to_string())),
        }
    }

    pub fn from_document(doc: Document) -> TokenResult<Self> {
        Ok(serde_json::from_value(Value::Object(doc.into_map()))?)
    }
}

/// Backends that can store files next to a token.
#[async_trait]
pub trait AttachmentSink {
    /// Upload the file at `filename` as attachment `attachment_name`.
    async fn add_attachment(&mut self, filename: &Path, attachment_name: &str) -> TokenResult<()>;
}

#[async_trait]
impl AttachmentSink for Token {
    async fn add_attachment(&mut self, _filename: &Path, _attachment_name: &str) -> TokenResult<()> {
        Err(TokenError::NotImplemented("add_attachment"))
    }
}
