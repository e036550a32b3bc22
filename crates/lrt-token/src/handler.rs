//! TokenHandler: batch operations over the tokens of one type.
//!
//! Unlike [`TokenList`](crate::TokenList), the handler never keeps tokens
//! in memory: every operation lists a view, reads the documents it names and
//! writes them back.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use lrt_store::{BulkResult, DESIGN_PREFIX, DesignDocument, Document, DocumentStore, ViewCode, ViewQuery, ViewRow};
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use crate::error::{TokenError, TokenResult};
use crate::list::zip_dir;
use crate::mime::attachment_content_type;
use crate::token::timestamp_of;
use crate::view::{OVERVIEW_TOTAL, TokenReduceView, TokenView, ViewCodes, status_views};

/// Optional `(field, value)` filter for batch operations.
pub type KeyFilter<'a> = Option<(&'a str, &'a Value)>;

fn matches_filter(doc: &Document, key: KeyFilter<'_>) -> bool {
    match key {
        Some((field, value)) => doc.get(field) == Some(value),
        None => true,
    }
}

fn now_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// Log failed bulk writes and count the successful ones.
fn bulk_outcome(results: &[BulkResult]) -> usize {
    for failed in results.iter().filter(|r| !r.is_ok()) {
        warn!(
            id = %failed.id,
            error = failed.error.as_deref().unwrap_or_default(),
            reason = failed.reason.as_deref().unwrap_or_default(),
            "bulk write rejected"
        );
    }
    results.iter().filter(|r| r.is_ok()).count()
}

/// Creates, inspects and batch-edits tokens of one type.
pub struct TokenHandler {
    token_type: String,
    store: Arc<dyn DocumentStore>,
    views: BTreeMap<String, ViewCode>,
}

impl TokenHandler {
    pub fn new(token_type: &str, store: Arc<dyn DocumentStore>) -> TokenResult<Self> {
        if token_type.is_empty() {
            return Err(TokenError::EmptyTokenType);
        }
        Ok(Self {
            token_type: token_type.to_string(),
            store,
            views: BTreeMap::new(),
        })
    }

    pub fn token_type(&self) -> &str {
        &self.token_type
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Views as of the last [`load_views`](Self::load_views) or edit.
    pub fn views(&self) -> &BTreeMap<String, ViewCode> {
        &self.views
    }

    fn design_id(&self) -> String {
        format!("{DESIGN_PREFIX}{}", self.token_type)
    }

    /// Create a token and return its id.
    ///
    /// The PiCaS defaults (`_id = t_{type}_{append}`, `type`, `lock`, `done`,
    /// `hostname`, `scrub_count`, `output`, `created`) override same-named
    /// keys from `keys`.
    pub async fn create_token(
        &self,
        keys: Option<Map<String, Value>>,
        append: &str,
        attach: Option<(&Path, &str)>,
    ) -> TokenResult<String> {
        let id = format!("t_{}_{}", self.token_type, append);
        let mut doc = keys.unwrap_or_default();
        let defaults = json!({
            "_id": &id,
            "type": self.token_type,
            "lock": 0,
            "done": 0,
            "hostname": "",
            "scrub_count": 0,
            "output": "",
            "created": now_seconds(),
        });
        if let Value::Object(defaults) = defaults {
            doc.extend(defaults);
        }

        let results = self.store.bulk_put(&[Document::from_map(doc)]).await?;
        if let Some(failed) = results.into_iter().find(|r| !r.is_ok()) {
            return Err(TokenError::BulkWrite {
                id: failed.id,
                error: failed.error.unwrap_or_default(),
                reason: failed.reason.unwrap_or_default(),
            });
        }
        info!(token = %id, "token created");

        if let Some((path, name)) = attach {
            self.add_attachment(&id, path, name).await?;
        }
        Ok(id)
    }

    /// Refresh the view list from the design document. A missing design
    /// document leaves the current list untouched.
    pub async fn load_views(&mut self) -> TokenResult<()> {
        match self.store.get_design_document(&self.token_type).await {
            Ok(ddoc) => {
                self.views = ddoc.views;
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                warn!(ddoc = %self.design_id(), "no views found, design document missing");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn install(&mut self, view: &dyn ViewCodes) -> TokenResult<()> {
        let mut ddoc = match self.store.get_design_document(&self.token_type).await {
            Ok(ddoc) => ddoc,
            Err(e) if e.is_not_found() => DesignDocument::new(&self.token_type),
            Err(e) => return Err(e.into()),
        };
        let code = view.view_code(&self.token_type);
        ddoc.add_view(view.name(), code.clone(), Some(view.spec(&self.token_type)?));
        self.store.put_document(&ddoc.to_document()?).await?;
        self.views.insert(view.name().to_string(), code);
        info!(ddoc = %ddoc.id, view = %view.name(), "view installed");
        Ok(())
    }

    /// Install a filter view emitting `emit` for tokens matching `cond`.
    pub async fn add_view(&mut self, view_name: &str, cond: &str, emit: (&str, &str)) -> TokenResult<()> {
        self.install(&TokenView::with_emit(view_name, cond, emit)).await
    }

    /// Install a per-state count view restricted to tokens matching `cond`.
    pub async fn add_mapreduce_view(&mut self, view_name: &str, cond: &str) -> TokenResult<()> {
        self.install(&TokenReduceView::filtered(view_name, cond)).await
    }

    /// Install the `overview_total` per-state count view.
    pub async fn add_overview_view(&mut self) -> TokenResult<()> {
        self.install(&TokenReduceView::new(OVERVIEW_TOTAL)).await
    }

    /// Install `todo`, `locked`, `done` and `error`.
    pub async fn add_status_views(&mut self) -> TokenResult<()> {
        for view in status_views() {
            self.install(&view).await?;
        }
        Ok(())
    }

    /// Remove a view from the design document.
    pub async fn del_view(&mut self, view_name: &str) -> TokenResult<()> {
        let mut ddoc = self.store.get_design_document(&self.token_type).await?;
        ddoc.delete_view(view_name);
        self.store.put_document(&ddoc.to_document()?).await?;
        self.views.remove(view_name);
        debug!(ddoc = %ddoc.id, view = %view_name, "view removed");
        Ok(())
    }

    /// Rows of a view; `None` if the view does not exist.
    ///
    /// Reduce views are grouped, so their rows are per-key counts.
    pub async fn list_tokens_from_view(&mut self, view_name: &str) -> TokenResult<Option<Vec<ViewRow>>> {
        self.load_views().await?;
        let Some(code) = self.views.get(view_name) else {
            warn!(view = %view_name, "view does not exist");
            return Ok(None);
        };
        let query = if code.reduce.is_some() {
            ViewQuery::grouped()
        } else {
            ViewQuery::rows()
        };
        let rows = self.store.query_view(&self.token_type, view_name, query).await?;
        Ok(Some(rows))
    }

    /// Stored documents listed by a view, narrowed by `key`.
    async fn documents_in_view(&mut self, view_name: &str, key: KeyFilter<'_>) -> TokenResult<Vec<Document>> {
        let rows = self.list_tokens_from_view(view_name).await?.unwrap_or_default();
        let ids: BTreeSet<String> = rows.into_iter().filter_map(|row| row.id).collect();
        let mut docs = Vec::with_capacity(ids.len());
        for id in ids {
            let doc = self.store.get_document(&id).await?;
            if matches_filter(&doc, key) {
                docs.push(doc);
            }
        }
        Ok(docs)
    }

    /// Delete the tokens of a view, optionally only those whose `field`
    /// equals `value`. Returns how many were deleted.
    pub async fn delete_tokens(&mut self, view_name: &str, key: KeyFilter<'_>) -> TokenResult<usize> {
        let docs = self.documents_in_view(view_name, key).await?;
        for doc in &docs {
            let id = doc.require_id()?;
            self.store.delete_document(id, doc.rev().unwrap_or_default()).await?;
            debug!(token = %id, "token deleted");
        }
        info!(view = %view_name, count = docs.len(), "tokens deleted");
        Ok(docs.len())
    }

    /// Put the tokens of a view back to `todo`, optionally dropping their
    /// attachments. Returns the documents the store accepted, with their new
    /// revisions.
    pub async fn reset_tokens(
        &mut self,
        view_name: &str,
        key: KeyFilter<'_>,
        del_attach: bool,
    ) -> TokenResult<Vec<Document>> {
        let mut docs = self.documents_in_view(view_name, key).await?;
        for doc in &mut docs {
            let scrubs = doc.get("scrub_count").map_or(0, timestamp_of);
            doc.insert("status", json!("todo"));
            doc.insert("lock", json!(0));
            doc.insert("done", json!(0));
            doc.insert("scrub_count", json!(scrubs + 1));
            doc.insert("hostname", json!(""));
            doc.insert("output", json!(""));
            if del_attach {
                doc.remove("_attachments");
            }
        }
        let results = self.store.bulk_put(&docs).await?;
        bulk_outcome(&results);
        let accepted: BTreeMap<String, Option<String>> = results
            .into_iter()
            .filter(BulkResult::is_ok)
            .map(|r| (r.id, r.rev))
            .collect();
        docs.retain_mut(|doc| {
            let Some(rev) = doc.id().and_then(|id| accepted.get(id)).cloned() else {
                return false;
            };
            if let Some(rev) = rev {
                doc.set_rev(&rev);
            }
            true
        });
        info!(view = %view_name, count = docs.len(), "tokens reset");
        Ok(docs)
    }

    /// Set `status` on every token of a view and lock it.
    pub async fn set_view_to_status(&mut self, view_name: &str, status: &str) -> TokenResult<usize> {
        let mut docs = self.documents_in_view(view_name, None).await?;
        for doc in &mut docs {
            doc.insert("status", json!(status));
            doc.insert("lock", json!(1));
        }
        let written = bulk_outcome(&self.store.bulk_put(&docs).await?);
        info!(view = %view_name, %status, count = written, "token status set");
        Ok(written)
    }

    /// Redefine `error` as finished-with-nonzero-output and delete its tokens.
    pub async fn remove_error(&mut self) -> TokenResult<usize> {
        self.add_view(
            "error",
            "doc.lock > 0 && doc.done > 0 && doc.output > 0",
            ("doc._id", "doc._id"),
        )
        .await?;
        self.delete_tokens("error", None).await
    }

    /// Upload a file as an attachment of a stored token.
    pub async fn add_attachment(&self, token_id: &str, path: &Path, name: &str) -> TokenResult<String> {
        let doc = self.store.get_document(token_id).await?;
        let data = tokio::fs::read(path).await?;
        let rev = self
            .store
            .put_attachment(token_id, doc.rev(), name, attachment_content_type(path), data)
            .await?;
        debug!(token = %token_id, attachment = %name, "attachment uploaded");
        Ok(rev)
    }

    pub async fn list_attachments(&self, token_id: &str) -> TokenResult<Vec<String>> {
        let doc = self.store.get_document(token_id).await?;
        Ok(doc.attachments().into_keys().collect())
    }

    /// Download an attachment into `dir` as `savename` (default: the
    /// attachment name), with `/` replaced by `_`.
    pub async fn get_attachment(
        &self,
        token_id: &str,
        name: &str,
        dir: &Path,
        savename: Option<&str>,
    ) -> TokenResult<PathBuf> {
        let data = self.store.get_attachment(token_id, name).await?;
        let path = dir.join(savename.unwrap_or(name).replace('/', "_"));
        tokio::fs::write(&path, data).await?;
        Ok(path)
    }

    /// Dump a token as `{id}.json` into `dir` with its attachments as
    /// `{id}_attachment_{name}`, then optionally delete it.
    pub async fn archive_a_token(&self, token_id: &str, dir: &Path, delete: bool) -> TokenResult<Vec<PathBuf>> {
        let doc = self.store.get_document(token_id).await?;
        let stem = token_id.replace('/', "_");
        let dump = dir.join(format!("{stem}.json"));
        tokio::fs::write(&dump, serde_json::to_vec_pretty(&doc)?).await?;

        let mut archived = vec![dump];
        for name in doc.attachments().into_keys() {
            let savename = format!("{stem}_attachment_{}", name.replace('/', "-"));
            archived.push(self.get_attachment(token_id, &name, dir, Some(&savename)).await?);
        }
        if delete {
            self.store
                .delete_document(token_id, doc.rev().unwrap_or_default())
                .await?;
        }
        Ok(archived)
    }

    /// Archive every token of a view into `dir`.
    pub async fn archive_tokens_from_view(
        &mut self,
        view_name: &str,
        dir: &Path,
        delete: bool,
    ) -> TokenResult<Vec<PathBuf>> {
        let rows = self.list_tokens_from_view(view_name).await?.unwrap_or_default();
        let ids: BTreeSet<String> = rows.into_iter().filter_map(|row| row.id).collect();
        let mut archived = Vec::new();
        for id in ids {
            archived.extend(self.archive_a_token(&id, dir, delete).await?);
        }
        Ok(archived)
    }

    /// Archive every token of every map view into `{base_dir}/{token_type}`,
    /// optionally packed into `{base_dir}/tokens_{token_type}.zip`. With
    /// `delete` the tokens and the design document are purged afterwards.
    pub async fn archive_tokens(&mut self, base_dir: &Path, delete: bool, compress: bool) -> TokenResult<PathBuf> {
        let dir = base_dir.join(&self.token_type);
        tokio::fs::create_dir_all(&dir).await?;

        self.load_views().await?;
        let view_names: Vec<String> = self
            .views
            .iter()
            .filter(|(_, code)| code.reduce.is_none())
            .map(|(name, _)| name.clone())
            .collect();

        let mut seen = BTreeSet::new();
        for view in view_names {
            let rows = self.list_tokens_from_view(&view).await?.unwrap_or_default();
            for id in rows.into_iter().filter_map(|row| row.id) {
                if seen.insert(id.clone()) {
                    self.archive_a_token(&id, &dir, delete).await?;
                }
            }
        }

        let result = if compress {
            let zip_path = base_dir.join(format!("tokens_{}.zip", self.token_type));
            zip_dir(&dir, &self.token_type, &zip_path)?;
            tokio::fs::remove_dir_all(&dir).await?;
            zip_path
        } else {
            dir
        };
        if delete {
            self.purge_tokens().await?;
        }
        info!(token_type = %self.token_type, tokens = seen.len(), path = ?result, "tokens archived");
        Ok(result)
    }

    /// Delete the tokens of every map view, then every view.
    pub async fn clear_all_views(&mut self) -> TokenResult<&BTreeMap<String, ViewCode>> {
        self.load_views().await?;
        let views: Vec<(String, bool)> = self
            .views
            .iter()
            .map(|(name, code)| (name.clone(), code.reduce.is_some()))
            .collect();
        for (view, reduces) in views {
            if !reduces {
                self.delete_tokens(&view, None).await?;
            }
            self.del_view(&view).await?;
        }
        self.load_views().await?;
        Ok(&self.views)
    }

    /// Delete every token of this type and the design document itself.
    pub async fn purge_tokens(&mut self) -> TokenResult<()> {
        self.clear_all_views().await?;
        match self.store.get_document(&self.design_id()).await {
            Ok(ddoc) => {
                self.store
                    .delete_document(&self.design_id(), ddoc.rev().unwrap_or_default())
                    .await?;
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
        self.views.clear();
        info!(token_type = %self.token_type, "tokens purged");
        Ok(())
    }
}

/// Ids of every design document in the store.
pub async fn get_all_design_docs(store: &dyn DocumentStore) -> TokenResult<Vec<String>> {
    Ok(store
        .all_docs()
        .await?
        .into_iter()
        .filter(|row| row.id.starts_with(DESIGN_PREFIX))
        .map(|row| row.id)
        .collect())
}

/// Reset the tokens of every map view of `token_type`.
pub async fn reset_all_tokens(store: Arc<dyn DocumentStore>, token_type: &str) -> TokenResult<usize> {
    let mut handler = TokenHandler::new(token_type, store)?;
    handler.load_views().await?;
    let views: Vec<String> = handler
        .views()
        .iter()
        .filter(|(name, code)| name.as_str() != OVERVIEW_TOTAL && code.reduce.is_none())
        .map(|(name, _)| name.clone())
        .collect();
    let mut total = 0;
    for view in views {
        total += handler.reset_tokens(&view, None, false).await?.len();
    }
    Ok(total)
}

/// Delete every token of `token_type` together with its design document.
pub async fn purge_tokens(store: Arc<dyn DocumentStore>, token_type: &str) -> TokenResult<()> {
    let mut handler = TokenHandler::new(token_type, store)?;
    handler.load_views().await?;
    handler.purge_tokens().await
}
