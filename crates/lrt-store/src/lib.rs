//! lrt-store: document store access for PiCaS tokens.
//!
//! Tokens live as JSON documents in a CouchDB-compatible store. This crate
//! defines the [`DocumentStore`] capability the token layer is written
//! against and ships two backends:
//!
//! - [`CouchClient`] talks to a CouchDB server over HTTP (reqwest).
//! - [`EmbeddedStore`] keeps documents in [redb](https://docs.rs/redb), on
//!   disk or in memory, and answers views by evaluating their
//!   [`ViewSpec`](query::ViewSpec) instead of JavaScript.
//!
//! # Architecture
//!
//! ```text
//! lrt-token ──> dyn DocumentStore
//!                 ├── CouchClient    (GET/PUT/DELETE /{db}/{id}, _view, _bulk_docs)
//!                 └── EmbeddedStore  (documents + attachments tables)
//! ```

pub mod couch;
pub mod embedded;
pub mod error;
pub mod query;
pub mod store;
pub mod tables;
pub mod types;

pub use couch::{CouchClient, CouchConfig};
pub use embedded::EmbeddedStore;
pub use error::{StoreError, StoreResult};
pub use query::{EmitRule, Operand, Predicate, QueryError, Reducer, ViewSpec};
pub use store::DocumentStore;
pub use types::*;
