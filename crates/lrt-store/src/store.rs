//! The capability every document store backend provides.

use async_trait::async_trait;

use crate::error::{StoreError, StoreResult};
use crate::types::*;

/// CRUD over JSON documents, their attachments, and design-document views.
///
/// All calls are single request/response operations. Failures surface as
/// [`StoreError`]; nothing here retries.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Name of the database this store is bound to.
    fn name(&self) -> &str;

    /// Whether a document with this id exists.
    async fn contains(&self, id: &str) -> StoreResult<bool> {
        match self.get_document(id).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Fetch a document. Missing documents are `StoreError::NotFound`.
    async fn get_document(&self, id: &str) -> StoreResult<Document>;

    /// Create or update a document and return its new revision.
    ///
    /// Updating requires the current `_rev`; a stale or missing revision on
    /// an existing document is a `StoreError::Conflict`.
    async fn put_document(&self, doc: &Document) -> StoreResult<String>;

    /// Delete the document at revision `rev`.
    async fn delete_document(&self, id: &str, rev: &str) -> StoreResult<()>;

    /// Write several documents; each gets its own outcome.
    async fn bulk_put(&self, docs: &[Document]) -> StoreResult<Vec<BulkResult>>;

    /// Upload an attachment and return the document's new revision.
    async fn put_attachment(
        &self,
        id: &str,
        rev: Option<&str>,
        name: &str,
        content_type: &str,
        data: Vec<u8>,
    ) -> StoreResult<String>;

    /// Download an attachment's bytes.
    async fn get_attachment(&self, id: &str, name: &str) -> StoreResult<Vec<u8>>;

    /// Ids and revisions of every document, design documents included.
    async fn all_docs(&self) -> StoreResult<Vec<DocRow>>;

    /// Query view `view` of design document `_design/{ddoc}`.
    async fn query_view(&self, ddoc: &str, view: &str, query: ViewQuery) -> StoreResult<Vec<ViewRow>>;

    /// Fetch and decode a design document.
    async fn get_design_document(&self, name: &str) -> StoreResult<DesignDocument> {
        let doc = self.get_document(&format!("{DESIGN_PREFIX}{name}")).await?;
        DesignDocument::from_document(doc)
    }
}

/// Shorthand for [`StoreError::NotFound`].
pub(crate) fn not_found(what: impl Into<String>) -> StoreError {
    StoreError::NotFound(what.into())
}
