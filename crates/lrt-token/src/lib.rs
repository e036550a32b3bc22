//! lrt-token: the PiCaS token model.
//!
//! A token is one unit of grid work stored as a JSON document. Workers claim
//! tokens by setting `lock`, finish them by setting `done`, and report
//! through `status` and `output`. Views in the design document
//! `_design/{token_type}` bucket tokens into todo, locked, done and error.
//!
//! # Layers
//!
//! ```text
//! TokenHandler ──┐            (batch edits straight on documents)
//! TokenList ─────┼──> CaToken ──> Token    (typed fields + extras)
//!                └──> dyn DocumentStore    (lrt-store)
//! ```

pub mod builder;
pub mod ca_token;
pub mod error;
pub mod handler;
pub mod list;
pub mod mime;
pub mod token;
pub mod view;

pub use builder::{TokenBuilder, TokenDictBuilder, TokenJsonBuilder};
pub use ca_token::CaToken;
pub use error::{TokenError, TokenResult};
pub use handler::{KeyFilter, TokenHandler, get_all_design_docs, purge_tokens, reset_all_tokens};
pub use list::{TokenEntry, TokenList};
pub use token::{AttachmentSink, Token};
pub use view::{OVERVIEW_TOTAL, OVERVIEW_VIEW, TokenReduceView, TokenView, ViewCodes, status_views, token_views};
