//! Document types shared by every store backend.
//!
//! Documents are plain JSON objects on the wire. `Document` keeps them that
//! way and only exposes the CouchDB reserved fields (`_id`, `_rev`,
//! `_attachments`) through accessors. Design documents get a typed form
//! because the token layer edits their views.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{StoreError, StoreResult};
use crate::query::ViewSpec;

/// Prefix shared by all design document ids.
pub const DESIGN_PREFIX: &str = "_design/";

/// A JSON document as stored in the database.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(Map<String, Value>);

impl Document {
    /// Create an empty document with the given `_id`.
    pub fn new(id: &str) -> Self {
        let mut map = Map::new();
        map.insert("_id".to_string(), Value::String(id.to_string()));
        Self(map)
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn as_map_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.0
    }

    pub fn id(&self) -> Option<&str> {
        self.0.get("_id").and_then(Value::as_str)
    }

    /// The document id, or `InvalidDocument` when `_id` is missing.
    pub fn require_id(&self) -> StoreResult<&str> {
        self.id()
            .ok_or_else(|| StoreError::InvalidDocument("document has no _id".to_string()))
    }

    pub fn rev(&self) -> Option<&str> {
        self.0.get("_rev").and_then(Value::as_str)
    }

    pub fn set_rev(&mut self, rev: &str) {
        self.0.insert("_rev".to_string(), Value::String(rev.to_string()));
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: &str, value: Value) -> Option<Value> {
        self.0.insert(key.to_string(), value)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn is_design(&self) -> bool {
        self.id().is_some_and(|id| id.starts_with(DESIGN_PREFIX))
    }

    /// Attachment stubs keyed by attachment name. Malformed stubs are skipped.
    pub fn attachments(&self) -> BTreeMap<String, AttachmentStub> {
        self.0
            .get("_attachments")
            .and_then(Value::as_object)
            .map(|atts| {
                atts.iter()
                    .filter_map(|(name, stub)| {
                        serde_json::from_value(stub.clone())
                            .ok()
                            .map(|stub| (name.clone(), stub))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl From<Map<String, Value>> for Document {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl TryFrom<Value> for Document {
    type Error = StoreError;

    fn try_from(value: Value) -> StoreResult<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(StoreError::InvalidDocument(format!(
                "expected a JSON object, got {other}"
            ))),
        }
    }
}

/// Metadata CouchDB keeps for an attachment inside `_attachments`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttachmentStub {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revpos: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stub: Option<bool>,
}

/// Map/reduce source for one view, as CouchDB stores it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewCode {
    pub map: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reduce: Option<String>,
}

/// A design document: a named set of views for one token type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesignDocument {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub views: BTreeMap<String, ViewCode>,
    /// Data description of each view, for stores that cannot run JavaScript.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub view_specs: BTreeMap<String, ViewSpec>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_language() -> String {
    "javascript".to_string()
}

impl DesignDocument {
    /// A new, unsaved design document `_design/{name}`.
    pub fn new(name: &str) -> Self {
        Self {
            id: format!("{DESIGN_PREFIX}{name}"),
            rev: None,
            language: default_language(),
            views: BTreeMap::new(),
            view_specs: BTreeMap::new(),
            extra: Map::new(),
        }
    }

    /// The part of the id after `_design/`.
    pub fn name(&self) -> &str {
        self.id.strip_prefix(DESIGN_PREFIX).unwrap_or(&self.id)
    }

    /// Install a view, replacing any view with the same name.
    pub fn add_view(&mut self, name: &str, code: ViewCode, spec: Option<ViewSpec>) {
        self.delete_view(name);
        self.views.insert(name.to_string(), code);
        if let Some(spec) = spec {
            self.view_specs.insert(name.to_string(), spec);
        }
    }

    /// Remove a view. Returns true if it existed.
    pub fn delete_view(&mut self, name: &str) -> bool {
        self.view_specs.remove(name);
        self.views.remove(name).is_some()
    }

    pub fn get_view(&self, name: &str) -> Option<&ViewCode> {
        self.views.get(name)
    }

    pub fn list_views(&self) -> Vec<String> {
        self.views.keys().cloned().collect()
    }

    pub fn from_document(doc: Document) -> StoreResult<Self> {
        serde_json::from_value(Value::Object(doc.into_map()))
            .map_err(|e| StoreError::Deserialize(e.to_string()))
    }

    pub fn to_document(&self) -> StoreResult<Document> {
        let value = serde_json::to_value(self).map_err(|e| StoreError::Serialize(e.to_string()))?;
        Document::try_from(value)
    }
}

/// One row of a view result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewRow {
    /// Source document id; absent on reduced rows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub key: Value,
    #[serde(default)]
    pub value: Value,
}

/// One row of `_all_docs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocRow {
    pub id: String,
    pub rev: String,
}

/// Per-document outcome of a bulk write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkResult {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl BulkResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// How a view should be queried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ViewQuery {
    /// Apply the view's reduce function (ignored for map-only views).
    pub reduce: bool,
    /// Group reduced rows by key.
    pub group: bool,
}

impl ViewQuery {
    /// Plain map rows, one per emitted key.
    pub fn rows() -> Self {
        Self { reduce: false, group: false }
    }

    /// Reduced rows grouped by key.
    pub fn grouped() -> Self {
        Self { reduce: true, group: true }
    }
}
