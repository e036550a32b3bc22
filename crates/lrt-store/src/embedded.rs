//! EmbeddedStore: redb-backed document store.
//!
//! Stores CouchDB-shaped JSON documents and attachments in two redb tables
//! and answers views from the [`ViewSpec`](crate::query::ViewSpec) each
//! design document carries. Revisions follow CouchDB's `N-hash` form and
//! stale writes are rejected, so code written against a real CouchDB sees the
//! same conflict behavior here. Supports on-disk and in-memory backends (the
//! latter for testing).

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableDatabase, ReadableTable};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::query::collate;
use crate::store::{DocumentStore, not_found};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StoreError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StoreError::$variant(e.to_string())
    };
}

/// Thread-safe document store backed by redb.
#[derive(Clone)]
pub struct EmbeddedStore {
    db: Arc<Database>,
    name: String,
}

impl std::fmt::Debug for EmbeddedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddedStore").field("name", &self.name).finish()
    }
}

fn decode(bytes: &[u8]) -> StoreResult<Document> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

fn encode(doc: &Document) -> StoreResult<Vec<u8>> {
    serde_json::to_vec(doc).map_err(map_err!(Serialize))
}

fn generation(rev: Option<&str>) -> u64 {
    rev.and_then(|r| r.split('-').next())
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}

/// Next revision string: bumped generation plus a content hash.
fn next_rev(previous: Option<&str>, doc: &Document) -> StoreResult<String> {
    let mut body = doc.clone();
    body.remove("_rev");
    let digest = Sha256::digest(encode(&body)?);
    let hash = hex::encode(digest);
    Ok(format!("{}-{}", generation(previous) + 1, &hash[..32]))
}

fn check_revision(id: &str, current: Option<&str>, supplied: Option<&str>) -> StoreResult<()> {
    match (current, supplied) {
        (None, None) => Ok(()),
        (Some(current), Some(supplied)) if current == supplied => Ok(()),
        _ => Err(StoreError::Conflict(id.to_string())),
    }
}

impl EmbeddedStore {
    /// Open (or create) a persistent store at the given path. The database
    /// name is the file stem.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "tokens".to_string());
        let store = Self { db: Arc::new(db), name };
        store.ensure_tables()?;
        debug!(?path, "embedded store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory(name: &str) -> StoreResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self {
            db: Arc::new(db),
            name: name.to_string(),
        };
        store.ensure_tables()?;
        debug!(%name, "in-memory embedded store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(DOCUMENTS).map_err(map_err!(Table))?;
        txn.open_table(ATTACHMENTS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Read a document, `None` if absent.
    pub fn read(&self, id: &str) -> StoreResult<Option<Document>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DOCUMENTS).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// Every stored document, design documents included, in id order.
    pub fn read_all(&self) -> StoreResult<Vec<Document>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DOCUMENTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(decode(value.value())?);
        }
        Ok(results)
    }

    /// Insert or update a document, enforcing revisions.
    pub fn write(&self, doc: &Document) -> StoreResult<String> {
        let id = doc.require_id()?.to_string();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let rev;
        {
            let mut docs = txn.open_table(DOCUMENTS).map_err(map_err!(Table))?;
            let mut atts = txn.open_table(ATTACHMENTS).map_err(map_err!(Table))?;

            let existing = match docs.get(id.as_str()).map_err(map_err!(Read))? {
                Some(guard) => Some(decode(guard.value())?),
                None => None,
            };
            let current_rev = existing.as_ref().and_then(Document::rev);
            check_revision(&id, current_rev, doc.rev())?;

            // Attachments survive only while the incoming document still lists them.
            let requested: BTreeSet<String> = doc
                .get("_attachments")
                .and_then(Value::as_object)
                .map(|atts| atts.keys().cloned().collect())
                .unwrap_or_default();
            let previous = existing.as_ref().map(Document::attachments).unwrap_or_default();
            let mut kept = Map::new();
            for (name, stub) in previous {
                if requested.contains(&name) {
                    let stub = serde_json::to_value(stub).map_err(map_err!(Serialize))?;
                    kept.insert(name, stub);
                } else {
                    atts.remove(attachment_key(&id, &name).as_str())
                        .map_err(map_err!(Write))?;
                }
            }

            let mut stored = doc.clone();
            if kept.is_empty() {
                stored.remove("_attachments");
            } else {
                stored.insert("_attachments", Value::Object(kept));
            }
            rev = next_rev(current_rev, &stored)?;
            stored.set_rev(&rev);
            let value = encode(&stored)?;
            docs.insert(id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%id, %rev, "document stored");
        Ok(rev)
    }

    /// Delete a document and its attachments at revision `rev`.
    pub fn remove(&self, id: &str, rev: &str) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut docs = txn.open_table(DOCUMENTS).map_err(map_err!(Table))?;
            let mut atts = txn.open_table(ATTACHMENTS).map_err(map_err!(Table))?;

            let existing = match docs.get(id).map_err(map_err!(Read))? {
                Some(guard) => decode(guard.value())?,
                None => return Err(not_found(id)),
            };
            check_revision(id, existing.rev(), Some(rev))?;
            docs.remove(id).map_err(map_err!(Write))?;

            let prefix = attachment_prefix(id);
            let keys: Vec<String> = atts
                .iter()
                .map_err(map_err!(Read))?
                .filter_map(|entry| {
                    let (key, _) = entry.ok()?;
                    let k = key.value().to_string();
                    k.starts_with(&prefix).then_some(k)
                })
                .collect();
            for key in &keys {
                atts.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%id, "document deleted");
        Ok(())
    }

    /// Store attachment bytes and record the stub on the document.
    pub fn attach(
        &self,
        id: &str,
        rev: Option<&str>,
        name: &str,
        content_type: &str,
        data: &[u8],
    ) -> StoreResult<String> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let new_rev;
        {
            let mut docs = txn.open_table(DOCUMENTS).map_err(map_err!(Table))?;
            let mut atts = txn.open_table(ATTACHMENTS).map_err(map_err!(Table))?;

            let mut doc = match docs.get(id).map_err(map_err!(Read))? {
                Some(guard) => decode(guard.value())?,
                None => return Err(not_found(id)),
            };
            let current_rev = doc.rev().map(str::to_string);
            check_revision(id, current_rev.as_deref(), rev)?;

            let stub = AttachmentStub {
                content_type: Some(content_type.to_string()),
                length: Some(data.len() as u64),
                digest: Some(format!("sha256-{}", hex::encode(Sha256::digest(data)))),
                revpos: Some(generation(current_rev.as_deref()) + 1),
                stub: Some(true),
            };
            let stub = serde_json::to_value(stub).map_err(map_err!(Serialize))?;
            let mut stubs = doc
                .get("_attachments")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            stubs.insert(name.to_string(), stub);
            doc.insert("_attachments", Value::Object(stubs));

            new_rev = next_rev(current_rev.as_deref(), &doc)?;
            doc.set_rev(&new_rev);
            let value = encode(&doc)?;
            docs.insert(id, value.as_slice()).map_err(map_err!(Write))?;
            atts.insert(attachment_key(id, name).as_str(), data)
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%id, %name, len = data.len(), "attachment stored");
        Ok(new_rev)
    }

    /// Read attachment bytes.
    pub fn read_attachment(&self, id: &str, name: &str) -> StoreResult<Vec<u8>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ATTACHMENTS).map_err(map_err!(Table))?;
        match table.get(attachment_key(id, name).as_str()).map_err(map_err!(Read))? {
            Some(guard) => Ok(guard.value().to_vec()),
            None => Err(not_found(format!("{id}/{name}"))),
        }
    }

    /// Evaluate a view from its stored spec.
    pub fn evaluate_view(&self, ddoc: &str, view: &str, query: ViewQuery) -> StoreResult<Vec<ViewRow>> {
        let design_id = format!("{DESIGN_PREFIX}{ddoc}");
        let design = self.read(&design_id)?.ok_or_else(|| not_found(&design_id))?;
        let design = DesignDocument::from_document(design)?;
        if !design.views.contains_key(view) {
            return Err(not_found(format!("{design_id}/_view/{view}")));
        }
        let spec = design
            .view_specs
            .get(view)
            .ok_or_else(|| StoreError::UnsupportedView(format!("{ddoc}/{view}")))?;

        let mut rows = Vec::new();
        for doc in self.read_all()? {
            if doc.is_design() {
                continue;
            }
            let id = doc.id().map(str::to_string);
            let body = Value::Object(doc.into_map());
            for (key, value) in spec.emit(&body) {
                rows.push(ViewRow { id: id.clone(), key, value });
            }
        }
        rows.sort_by(|a, b| collate(&a.key, &b.key).then_with(|| a.id.cmp(&b.id)));

        let reducer = match (query.reduce, spec.reduce) {
            (true, Some(reducer)) => reducer,
            _ => return Ok(rows),
        };
        if rows.is_empty() {
            return Ok(rows);
        }
        if !query.group {
            let values: Vec<Value> = rows.into_iter().map(|r| r.value).collect();
            return Ok(vec![ViewRow {
                id: None,
                key: Value::Null,
                value: reducer.reduce(&values),
            }]);
        }

        let mut grouped: Vec<(Value, Vec<Value>)> = Vec::new();
        for row in rows {
            match grouped.last_mut() {
                Some((key, values)) if collate(key, &row.key).is_eq() => values.push(row.value),
                _ => grouped.push((row.key, vec![row.value])),
            }
        }
        Ok(grouped
            .into_iter()
            .map(|(key, values)| ViewRow {
                id: None,
                key,
                value: reducer.reduce(&values),
            })
            .collect())
    }
}

#[async_trait]
impl DocumentStore for EmbeddedStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_document(&self, id: &str) -> StoreResult<Document> {
        self.read(id)?.ok_or_else(|| not_found(id))
    }

    async fn put_document(&self, doc: &Document) -> StoreResult<String> {
        self.write(doc)
    }

    async fn delete_document(&self, id: &str, rev: &str) -> StoreResult<()> {
        self.remove(id, rev)
    }

    async fn bulk_put(&self, docs: &[Document]) -> StoreResult<Vec<BulkResult>> {
        let mut results = Vec::with_capacity(docs.len());
        for doc in docs {
            let id = doc.id().unwrap_or_default().to_string();
            results.push(match self.write(doc) {
                Ok(rev) => BulkResult { id, rev: Some(rev), error: None, reason: None },
                Err(StoreError::Conflict(_)) => BulkResult {
                    id,
                    rev: None,
                    error: Some("conflict".to_string()),
                    reason: Some("Document update conflict.".to_string()),
                },
                Err(e) => BulkResult {
                    id,
                    rev: None,
                    error: Some("error".to_string()),
                    reason: Some(e.to_string()),
                },
            });
        }
        Ok(results)
    }

    async fn put_attachment(
        &self,
        id: &str,
        rev: Option<&str>,
        name: &str,
        content_type: &str,
        data: Vec<u8>,
    ) -> StoreResult<String> {
        self.attach(id, rev, name, content_type, &data)
    }

    async fn get_attachment(&self, id: &str, name: &str) -> StoreResult<Vec<u8>> {
        self.read_attachment(id, name)
    }

    async fn all_docs(&self) -> StoreResult<Vec<DocRow>> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter_map(|doc| {
                Some(DocRow {
                    id: doc.id()?.to_string(),
                    rev: doc.rev().unwrap_or_default().to_string(),
                })
            })
            .collect())
    }

    async fn query_view(&self, ddoc: &str, view: &str, query: ViewQuery) -> StoreResult<Vec<ViewRow>> {
        self.evaluate_view(ddoc, view, query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{EmitRule, Operand, Predicate, Reducer, ViewSpec};
    use serde_json::json;

    fn store() -> EmbeddedStore {
        EmbeddedStore::open_in_memory("test_db").unwrap()
    }

    fn doc(value: Value) -> Document {
        Document::try_from(value).unwrap()
    }

    fn token(id: &str, lock: i64, done: i64) -> Document {
        doc(json!({"_id": id, "type": "job", "lock": lock, "done": done}))
    }

    // ── Document CRUD ──────────────────────────────────────────────

    #[test]
    fn put_and_get() {
        let store = store();
        let rev = store.write(&token("t1", 0, 0)).unwrap();
        assert!(rev.starts_with("1-"));

        let fetched = store.read("t1").unwrap().unwrap();
        assert_eq!(fetched.rev(), Some(rev.as_str()));
        assert_eq!(fetched.get("type"), Some(&json!("job")));
    }

    #[test]
    fn get_nonexistent_returns_none() {
        assert!(store().read("nope").unwrap().is_none());
    }

    #[test]
    fn update_requires_current_revision() {
        let store = store();
        let rev1 = store.write(&token("t1", 0, 0)).unwrap();

        // No revision on an existing document.
        let err = store.write(&token("t1", 1, 0)).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        let mut update = token("t1", 1, 0);
        update.set_rev(&rev1);
        let rev2 = store.write(&update).unwrap();
        assert!(rev2.starts_with("2-"));

        // The old revision is now stale.
        let err = store.write(&update).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn create_with_revision_conflicts() {
        let mut d = token("t1", 0, 0);
        d.set_rev("3-abc");
        assert!(matches!(store().write(&d), Err(StoreError::Conflict(_))));
    }

    #[test]
    fn delete_checks_revision() {
        let store = store();
        let rev = store.write(&token("t1", 0, 0)).unwrap();

        assert!(matches!(store.remove("t1", "1-bogus"), Err(StoreError::Conflict(_))));
        store.remove("t1", &rev).unwrap();
        assert!(store.read("t1").unwrap().is_none());
        assert!(matches!(store.remove("t1", &rev), Err(StoreError::NotFound(_))));
    }

    // ── Attachments ────────────────────────────────────────────────

    #[test]
    fn attachment_round_trip() {
        let store = store();
        let rev = store.write(&token("t1", 0, 0)).unwrap();
        let rev2 = store
            .attach("t1", Some(&rev), "srm.txt", "text/plain", b"srm://a")
            .unwrap();

        assert_eq!(store.read_attachment("t1", "srm.txt").unwrap(), b"srm://a");
        let d = store.read("t1").unwrap().unwrap();
        assert_eq!(d.rev(), Some(rev2.as_str()));
        let stubs = d.attachments();
        assert_eq!(stubs["srm.txt"].length, Some(7));
        assert_eq!(stubs["srm.txt"].stub, Some(true));
    }

    #[test]
    fn attachment_on_missing_document_is_not_found() {
        let err = store()
            .attach("ghost", None, "a.txt", "text/plain", b"x")
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn saving_without_stub_drops_attachment() {
        let store = store();
        let rev = store.write(&token("t1", 0, 0)).unwrap();
        let rev = store
            .attach("t1", Some(&rev), "a.txt", "text/plain", b"a")
            .unwrap();

        // Keeping the stub keeps the attachment.
        let mut d = store.read("t1").unwrap().unwrap();
        d.insert("status", json!("launched"));
        let rev = store.write(&d).unwrap();
        assert!(store.read_attachment("t1", "a.txt").is_ok());

        // Dropping the stub drops it.
        let mut d = token("t1", 0, 0);
        d.set_rev(&rev);
        store.write(&d).unwrap();
        assert!(store.read_attachment("t1", "a.txt").is_err());
        assert!(store.read("t1").unwrap().unwrap().attachments().is_empty());
    }

    #[test]
    fn delete_removes_attachments() {
        let store = store();
        let rev = store.write(&token("t1", 0, 0)).unwrap();
        let rev = store
            .attach("t1", Some(&rev), "a.txt", "text/plain", b"a")
            .unwrap();
        store.remove("t1", &rev).unwrap();
        assert!(store.read_attachment("t1", "a.txt").is_err());
    }

    // ── Views ──────────────────────────────────────────────────────

    fn install_views(store: &EmbeddedStore) {
        let mut ddoc = DesignDocument::new("job");
        ddoc.add_view(
            "todo",
            ViewCode { map: "function(doc) {}".to_string(), reduce: None },
            Some(ViewSpec {
                doc_type: "job".to_string(),
                rules: vec![EmitRule {
                    when: Predicate::parse("doc.lock == 0 && doc.done == 0").unwrap(),
                    key: Operand::field("_id"),
                    value: Operand::field("_id"),
                }],
                reduce: None,
            }),
        );
        ddoc.add_view(
            "overview",
            ViewCode { map: "m".to_string(), reduce: Some("r".to_string()) },
            Some(ViewSpec {
                doc_type: "job".to_string(),
                rules: vec![
                    EmitRule {
                        when: Predicate::parse("doc.lock == 0").unwrap(),
                        key: Operand::Literal(json!("todo")),
                        value: Operand::Literal(json!(1)),
                    },
                    EmitRule {
                        when: Predicate::parse("doc.lock > 0").unwrap(),
                        key: Operand::Literal(json!("locked")),
                        value: Operand::Literal(json!(1)),
                    },
                ],
                reduce: Some(Reducer::Sum),
            }),
        );
        ddoc.add_view(
            "raw",
            ViewCode { map: "function(doc) { emit(doc._id, 1); }".to_string(), reduce: None },
            None,
        );
        store.write(&ddoc.to_document().unwrap()).unwrap();
    }

    #[test]
    fn view_rows_sorted_by_key() {
        let store = store();
        install_views(&store);
        store.write(&token("b", 0, 0)).unwrap();
        store.write(&token("a", 0, 0)).unwrap();
        store.write(&token("c", 5, 0)).unwrap();
        store
            .write(&doc(json!({"_id": "x", "type": "other", "lock": 0, "done": 0})))
            .unwrap();

        let rows = store.evaluate_view("job", "todo", ViewQuery::rows()).unwrap();
        let ids: Vec<_> = rows.iter().filter_map(|r| r.id.as_deref()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn reduce_view_grouped_and_total() {
        let store = store();
        install_views(&store);
        store.write(&token("a", 0, 0)).unwrap();
        store.write(&token("b", 0, 0)).unwrap();
        store.write(&token("c", 7, 0)).unwrap();

        let grouped = store.evaluate_view("job", "overview", ViewQuery::grouped()).unwrap();
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[0].key, json!("locked"));
        assert_eq!(grouped[0].value, json!(1));
        assert_eq!(grouped[1].key, json!("todo"));
        assert_eq!(grouped[1].value, json!(2));

        let total = store
            .evaluate_view("job", "overview", ViewQuery { reduce: true, group: false })
            .unwrap();
        assert_eq!(total.len(), 1);
        assert_eq!(total[0].value, json!(3));

        let raw_rows = store.evaluate_view("job", "overview", ViewQuery::rows()).unwrap();
        assert_eq!(raw_rows.len(), 3);
    }

    #[test]
    fn view_errors() {
        let store = store();
        assert!(store.evaluate_view("job", "todo", ViewQuery::rows()).unwrap_err().is_not_found());
        install_views(&store);
        assert!(store.evaluate_view("job", "missing", ViewQuery::rows()).unwrap_err().is_not_found());
        assert!(matches!(
            store.evaluate_view("job", "raw", ViewQuery::rows()),
            Err(StoreError::UnsupportedView(_))
        ));
    }

    // ── Trait surface ──────────────────────────────────────────────

    #[tokio::test]
    async fn bulk_put_reports_per_document() {
        let store = store();
        store.write(&token("exists", 0, 0)).unwrap();
        let results = store
            .bulk_put(&[token("new", 0, 0), token("exists", 1, 0)])
            .await
            .unwrap();
        assert!(results[0].is_ok());
        assert_eq!(results[1].error.as_deref(), Some("conflict"));
    }

    #[tokio::test]
    async fn all_docs_and_contains() {
        let store = store();
        install_views(&store);
        store.write(&token("t1", 0, 0)).unwrap();

        let ids: Vec<_> = store.all_docs().await.unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["_design/job".to_string(), "t1".to_string()]);
        assert!(store.contains("t1").await.unwrap());
        assert!(!store.contains("t2").await.unwrap());
        assert_eq!(store.get_design_document("job").await.unwrap().name(), "job");
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("tokens.redb");

        {
            let store = EmbeddedStore::open(&db_path).unwrap();
            store.write(&token("t1", 0, 0)).unwrap();
        }

        let store = EmbeddedStore::open(&db_path).unwrap();
        assert_eq!(store.name(), "tokens");
        assert!(store.read("t1").unwrap().is_some());
    }
}
