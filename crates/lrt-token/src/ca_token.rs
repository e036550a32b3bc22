//! CaToken: a token bound to a document store.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use lrt_store::DocumentStore;
use tracing::{debug, info};

use crate::error::{TokenError, TokenResult};
use crate::mime::attachment_content_type;
use crate::token::{AttachmentSink, Token};

/// A [`Token`] plus the store it is saved to.
#[derive(Clone)]
pub struct CaToken {
    token: Token,
    store: Arc<dyn DocumentStore>,
}

impl fmt::Debug for CaToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaToken")
            .field("token", &self.token)
            .field("database", &self.store.name())
            .finish()
    }
}

impl Deref for CaToken {
    type Target = Token;

    fn deref(&self) -> &Token {
        &self.token
    }
}

impl DerefMut for CaToken {
    fn deref_mut(&mut self) -> &mut Token {
        &mut self.token
    }
}

impl CaToken {
    pub fn new(store: Arc<dyn DocumentStore>, token_type: &str, token_id: Option<&str>) -> Self {
        Self {
            token: Token::new(token_type, token_id),
            store,
        }
    }

    pub fn from_token(token: Token, store: Arc<dyn DocumentStore>) -> Self {
        Self { token, store }
    }

    pub fn token(&self) -> &Token {
        &self.token
    }

    pub fn into_token(self) -> Token {
        self.token
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Write the token and adopt the new revision.
    pub async fn save(&mut self) -> TokenResult<String> {
        let rev = self.store.put_document(&self.token.to_document()?).await?;
        debug!(token = %self.id(), %rev, "token saved");
        self.token.rev = Some(rev.clone());
        Ok(rev)
    }

    /// Replace the local fields with the stored document.
    pub async fn fetch(&mut self) -> TokenResult<()> {
        let doc = self.store.get_document(self.id()).await?;
        let remote = Token::from_document(doc)?;
        if remote.token_type() != self.token_type() {
            return Err(TokenError::WrongTokenType {
                found: remote.token_type().to_string(),
                expected: self.token_type().to_string(),
            });
        }
        self.token = remote;
        Ok(())
    }

    /// Delete the stored document. Looks up the revision if none is known.
    pub async fn delete(&mut self) -> TokenResult<()> {
        let rev = match &self.token.rev {
            Some(rev) => rev.clone(),
            None => {
                let doc = self.store.get_document(self.id()).await?;
                doc.rev().unwrap_or_default().to_string()
            }
        };
        self.store.delete_document(self.id(), &rev).await?;
        debug!(token = %self.id(), "token deleted");
        self.token.rev = None;
        Ok(())
    }

    pub async fn exists(&self) -> TokenResult<bool> {
        Ok(self.store.contains(self.id()).await?)
    }

    /// [`Token::synchronize`] against this token's own store.
    pub async fn synchronize(&mut self, prefer_local: bool, upload: bool) -> TokenResult<()> {
        let store = Arc::clone(&self.store);
        self.token.synchronize(store.as_ref(), prefer_local, upload).await
    }

    /// Download every attachment into `dir` as `{filename}-{attachment}`.
    pub async fn get_all_attachments(&mut self, dir: &Path) -> TokenResult<Vec<PathBuf>> {
        self.fetch().await?;
        let mut written = Vec::new();
        for (name, stub) in &self.token.attachments {
            let content_type = stub.content_type.as_deref().unwrap_or("text/plain");
            let data = self.store.get_attachment(self.token.id(), name).await?;
            let path = dir.join(format!("{}-{}", self.token.filename(), name.replace('/', "_")));
            tokio::fs::write(&path, &data).await?;
            debug!(token = %self.token.id(), attachment = %name, %content_type, "attachment downloaded");
            written.push(path);
        }
        Ok(written)
    }

    /// Save attachments and the token JSON into `dir`, then optionally delete
    /// the stored document.
    pub async fn archive(&mut self, dir: &Path, delete: bool) -> TokenResult<Vec<PathBuf>> {
        let mut files = self.get_all_attachments(dir).await?;
        files.push(self.token.dump(dir)?);
        if delete {
            self.delete().await?;
        }
        info!(token = %self.id(), files = files.len(), delete, "token archived");
        Ok(files)
    }
}

#[async_trait]
impl AttachmentSink for CaToken {
    async fn add_attachment(&mut self, filename: &Path, attachment_name: &str) -> TokenResult<()> {
        let content_type = attachment_content_type(filename);
        let data = tokio::fs::read(filename).await?;
        // CouchDB creates a bare document for a rev-less attachment PUT, so
        // an unknown token must fail here with NotFound on every backend.
        let current = match &self.token.rev {
            Some(rev) => rev.clone(),
            None => {
                let doc = self.store.get_document(self.token.id()).await?;
                doc.rev().unwrap_or_default().to_string()
            }
        };
        let rev = self
            .store
            .put_attachment(
                self.token.id(),
                Some(&current),
                attachment_name,
                content_type,
                data,
            )
            .await?;
        debug!(token = %self.token.id(), attachment = %attachment_name, %rev, "attachment uploaded");
        // Pick up the new revision and attachment stub.
        self.fetch().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lrt_store::EmbeddedStore;
    use serde_json::json;

    fn store() -> Arc<dyn DocumentStore> {
        Arc::new(EmbeddedStore::open_in_memory("tokens").unwrap())
    }

    #[tokio::test]
    async fn save_fetch_delete() {
        let store = store();
        let mut token = CaToken::new(store.clone(), "job", Some("job1"));
        assert!(!token.exists().await.unwrap());

        token.status = Some("queued".to_string());
        token.save().await.unwrap();
        assert!(token.exists().await.unwrap());
        assert!(token.rev.is_some());

        let mut copy = CaToken::new(store.clone(), "job", Some("job1"));
        copy.fetch().await.unwrap();
        assert_eq!(copy.status.as_deref(), Some("queued"));

        copy.delete().await.unwrap();
        assert!(!token.exists().await.unwrap());
    }

    #[tokio::test]
    async fn fetch_rejects_other_type() {
        let store = store();
        CaToken::new(store.clone(), "other", Some("t1")).save().await.unwrap();
        let mut token = CaToken::new(store, "job", Some("t1"));
        assert!(matches!(
            token.fetch().await,
            Err(TokenError::WrongTokenType { .. })
        ));
    }

    #[tokio::test]
    async fn second_save_without_revision_conflicts() {
        let store = store();
        CaToken::new(store.clone(), "job", Some("job1")).save().await.unwrap();
        let err = CaToken::new(store, "job", Some("job1")).save().await.unwrap_err();
        assert!(matches!(err, TokenError::Store(lrt_store::StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn attachments_round_trip_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("srm.txt");
        std::fs::write(&src, "srm://lofar/L123/SB001.MS\n").unwrap();
        let parset = dir.path().join("pref.parset");
        std::fs::write(&parset, "msin=SB001.MS\n").unwrap();

        let mut token = CaToken::new(store(), "job", Some("L123/SB001"));
        token.save().await.unwrap();
        token.add_attachment(&src, "srm.txt").await.unwrap();
        token.add_attachment(&parset, "parsets/pref.parset").await.unwrap();
        assert_eq!(token.attachments.len(), 2);
        assert_eq!(
            token.attachments["parsets/pref.parset"].content_type.as_deref(),
            Some("text/plain")
        );

        let out = tempfile::tempdir().unwrap();
        let files = token.get_all_attachments(out.path()).await.unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(
            std::fs::read_to_string(out.path().join("L123_SB001-srm.txt")).unwrap(),
            "srm://lofar/L123/SB001.MS\n"
        );
        assert!(out.path().join("L123_SB001-parsets_pref.parset").exists());
    }

    #[tokio::test]
    async fn attach_to_unsaved_token_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.txt");
        std::fs::write(&src, "a").unwrap();

        let mut token = CaToken::new(store(), "job", Some("job1"));
        let err = token.add_attachment(&src, "a.txt").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn archive_with_and_without_delete() {
        let store = store();
        let out = tempfile::tempdir().unwrap();

        let mut kept = CaToken::new(store.clone(), "job", Some("kept"));
        kept.set_field("OBSID", json!("L1")).unwrap();
        kept.save().await.unwrap();
        kept.archive(out.path(), false).await.unwrap();
        assert!(out.path().join("kept.json").exists());
        assert!(kept.exists().await.unwrap());

        let mut gone = CaToken::new(store.clone(), "job", Some("gone"));
        gone.save().await.unwrap();
        gone.archive(out.path(), true).await.unwrap();
        assert!(out.path().join("gone.json").exists());
        assert!(!store.contains("gone").await.unwrap());
    }

    #[tokio::test]
    async fn synchronize_uses_own_store() {
        let store = store();
        let mut token = CaToken::new(store.clone(), "job", Some("job1"));
        token.save().await.unwrap();

        let mut remote = CaToken::new(store.clone(), "job", Some("job1"));
        remote.fetch().await.unwrap();
        remote.lock = 1_700_000_000;
        remote.save().await.unwrap();

        token.synchronize(false, false).await.unwrap();
        assert_eq!(token.lock, 1_700_000_000);
        assert_eq!(token.rev, remote.rev);
    }
}
