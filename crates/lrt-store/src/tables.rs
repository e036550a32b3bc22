//! redb table definitions for the embedded document store.
//!
//! Both tables use `&str` keys. Attachment keys are `{doc_id}\0{name}` so a
//! prefix scan on `{doc_id}\0` finds every attachment of one document.

use redb::TableDefinition;

/// JSON documents (design documents included) keyed by `_id`.
pub const DOCUMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("documents");

/// Raw attachment bytes keyed by `{doc_id}\0{attachment_name}`.
pub const ATTACHMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("attachments");

/// Build the composite key for the attachments table.
pub fn attachment_key(doc_id: &str, name: &str) -> String {
    format!("{doc_id}\0{name}")
}

/// Prefix shared by every attachment key of one document.
pub fn attachment_prefix(doc_id: &str) -> String {
    format!("{doc_id}\0")
}
