//! TokenList: tokens of one type sharing a database and design document.

use std::fmt;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lrt_core::PICAS_API_VERSION;
use lrt_store::{DESIGN_PREFIX, DesignDocument, DocumentStore, ViewQuery};
use serde_json::Value;
use tracing::{debug, info, warn};
use zip::write::SimpleFileOptions;

use crate::ca_token::CaToken;
use crate::error::{TokenError, TokenResult};
use crate::token::AttachmentSink;
use crate::view::{OVERVIEW_TOTAL, ViewCodes, token_views};

/// A list member: a token or a nested list.
#[derive(Debug, Clone)]
pub enum TokenEntry {
    Token(CaToken),
    List(TokenList),
}

impl From<CaToken> for TokenEntry {
    fn from(token: CaToken) -> Self {
        TokenEntry::Token(token)
    }
}

impl From<TokenList> for TokenEntry {
    fn from(list: TokenList) -> Self {
        TokenEntry::List(list)
    }
}

/// An ordered collection of tokens of one type.
///
/// The database is set at most once, explicitly or by the first appended
/// entry. The design document `_design/{token_type}` is created on first use.
#[derive(Clone, Default)]
pub struct TokenList {
    token_type: Option<String>,
    database: Option<Arc<dyn DocumentStore>>,
    entries: Vec<TokenEntry>,
    token_ids: Vec<String>,
    design_doc: Option<DesignDocument>,
}

impl fmt::Debug for TokenList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenList")
            .field("token_type", &self.token_type)
            .field("database", &self.database.as_ref().map(|db| db.name()))
            .field("token_ids", &self.token_ids)
            .finish()
    }
}

fn collect<'a>(entries: &'a [TokenEntry], out: &mut Vec<&'a CaToken>) {
    for entry in entries {
        match entry {
            TokenEntry::Token(token) => out.push(token),
            TokenEntry::List(list) => collect(&list.entries, out),
        }
    }
}

fn collect_mut<'a>(entries: &'a mut [TokenEntry], out: &mut Vec<&'a mut CaToken>) {
    for entry in entries {
        match entry {
            TokenEntry::Token(token) => out.push(token),
            TokenEntry::List(list) => collect_mut(&mut list.entries, out),
        }
    }
}

impl TokenList {
    /// An empty, unbound list.
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty list of `token_type` bound to `database`.
    pub fn with_database(token_type: &str, database: Arc<dyn DocumentStore>) -> Self {
        Self {
            token_type: Some(token_type.to_string()),
            database: Some(database),
            ..Self::default()
        }
    }

    pub fn token_type(&self) -> Option<&str> {
        self.token_type.as_deref()
    }

    pub fn database(&self) -> Option<&Arc<dyn DocumentStore>> {
        self.database.as_ref()
    }

    /// Bind the list to a database. Fails if it is already bound.
    pub fn set_database(&mut self, database: Arc<dyn DocumentStore>) -> TokenResult<()> {
        if let Some(current) = &self.database {
            return Err(TokenError::DatabaseAlreadySet(current.name().to_string()));
        }
        self.database = Some(database);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[TokenEntry] {
        &self.entries
    }

    /// Ids of every token, nested lists included, in append order.
    pub fn token_ids(&self) -> &[String] {
        &self.token_ids
    }

    pub fn contains(&self, id: &str) -> bool {
        self.token_ids.iter().any(|known| known == id)
    }

    /// Every token, flattened through nested lists.
    pub fn tokens(&self) -> Vec<&CaToken> {
        let mut out = Vec::new();
        collect(&self.entries, &mut out);
        out
    }

    pub fn tokens_mut(&mut self) -> Vec<&mut CaToken> {
        let mut out = Vec::new();
        collect_mut(&mut self.entries, &mut out);
        out
    }

    /// Append a token or a nested list.
    ///
    /// Type and id checks run before anything changes, so a rejected entry
    /// leaves the list as it was.
    pub fn append(&mut self, entry: impl Into<TokenEntry>) -> TokenResult<()> {
        let entry = entry.into();
        let (entry_type, ids, database) = match &entry {
            TokenEntry::Token(token) => (
                Some(token.token_type().to_string()),
                vec![token.id().to_string()],
                Some(Arc::clone(token.store())),
            ),
            TokenEntry::List(list) => (
                list.token_type.clone(),
                list.token_ids.clone(),
                list.database.clone(),
            ),
        };

        if let (Some(expected), Some(found)) = (&self.token_type, &entry_type) {
            if expected != found {
                return Err(TokenError::WrongTokenType {
                    found: found.clone(),
                    expected: expected.clone(),
                });
            }
        }
        for (i, id) in ids.iter().enumerate() {
            if self.contains(id) || ids[..i].contains(id) {
                return Err(TokenError::DuplicateId(id.clone()));
            }
        }

        if self.database.is_none() {
            self.database = database;
        }
        if self.token_type.is_none() {
            self.token_type = entry_type;
        }
        self.token_ids.extend(ids);
        self.entries.push(entry);
        Ok(())
    }

    fn bound(&self) -> TokenResult<(Arc<dyn DocumentStore>, String)> {
        let database = self.database.clone().ok_or(TokenError::NoDatabase)?;
        let token_type = self.token_type.clone().ok_or(TokenError::NoTokenType)?;
        Ok((database, token_type))
    }

    /// Load the design document, creating it and stamping the API version
    /// when it is missing or unstamped.
    async fn load_design_doc(&mut self) -> TokenResult<&mut DesignDocument> {
        let (database, token_type) = self.bound()?;
        let mut ddoc = match database.get_design_document(&token_type).await {
            Ok(ddoc) => ddoc,
            Err(e) if e.is_not_found() => DesignDocument::new(&token_type),
            Err(e) => return Err(e.into()),
        };
        let stamp = Value::String(PICAS_API_VERSION.to_string());
        if ddoc.rev.is_none() || ddoc.extra.get("PICAS_API_VERSION") != Some(&stamp) {
            ddoc.extra.insert("PICAS_API_VERSION".to_string(), stamp);
            let rev = database.put_document(&ddoc.to_document()?).await?;
            debug!(ddoc = %ddoc.id, %rev, "design document stamped");
            ddoc.rev = Some(rev);
        }
        Ok(self.design_doc.insert(ddoc))
    }

    /// The cached design document, if one has been loaded.
    pub fn design_doc(&self) -> Option<&DesignDocument> {
        self.design_doc.as_ref()
    }

    /// Install a view, replacing any view with the same name.
    pub async fn add_view(&mut self, view: &dyn ViewCodes) -> TokenResult<()> {
        let (database, token_type) = self.bound()?;
        let spec = view.spec(&token_type)?;
        let code = view.view_code(&token_type);
        let ddoc = self.load_design_doc().await?;
        ddoc.add_view(view.name(), code, Some(spec));
        let rev = database.put_document(&ddoc.to_document()?).await?;
        ddoc.rev = Some(rev);
        info!(ddoc = %ddoc.id, view = %view.name(), "view installed");
        Ok(())
    }

    /// Install `todo`, `locked`, `done`, `error` and `overview_view`.
    pub async fn add_token_views(&mut self) -> TokenResult<()> {
        for view in token_views() {
            self.add_view(view.as_ref()).await?;
        }
        Ok(())
    }

    /// Tokens listed by a view, fetched from the store.
    ///
    /// A missing view or a reduce view yields a copy of this list.
    pub async fn list_view_tokens(&mut self, view_name: &str) -> TokenResult<TokenList> {
        let (database, token_type) = self.bound()?;
        let ddoc = self.load_design_doc().await?;
        let is_map_view = matches!(ddoc.get_view(view_name), Some(code) if code.reduce.is_none());
        if !is_map_view {
            debug!(view = %view_name, "not a map view, returning the list itself");
            return Ok(self.clone());
        }

        let rows = database
            .query_view(&token_type, view_name, ViewQuery::rows())
            .await?;
        let mut view_list = TokenList::with_database(&token_type, Arc::clone(&database));
        for id in rows.into_iter().filter_map(|row| row.id) {
            if view_list.contains(&id) {
                continue;
            }
            view_list.append(CaToken::new(Arc::clone(&database), &token_type, Some(&id)))?;
        }
        view_list.fetch().await?;
        debug!(view = %view_name, tokens = view_list.len(), "view tokens listed");
        Ok(view_list)
    }

    /// Names of the views in the design document.
    pub async fn get_views(&mut self) -> TokenResult<Vec<String>> {
        Ok(self.load_design_doc().await?.list_views())
    }

    /// Remove every view from the design document.
    pub async fn delete_views(&mut self) -> TokenResult<()> {
        let (database, _) = self.bound()?;
        let ddoc = self.load_design_doc().await?;
        for view in ddoc.list_views() {
            ddoc.delete_view(&view);
        }
        let rev = database.put_document(&ddoc.to_document()?).await?;
        ddoc.rev = Some(rev);
        info!(ddoc = %ddoc.id, "views deleted");
        Ok(())
    }

    /// Delete the design document from the store.
    pub async fn delete_ddoc(&mut self) -> TokenResult<()> {
        let (database, token_type) = self.bound()?;
        let ddoc = database.get_design_document(&token_type).await?;
        database
            .delete_document(&ddoc.id, ddoc.rev.as_deref().unwrap_or_default())
            .await?;
        self.design_doc = None;
        info!(ddoc = %ddoc.id, "design document deleted");
        Ok(())
    }

    /// Save every token.
    pub async fn upload_all(&mut self) -> TokenResult<()> {
        for token in self.tokens_mut() {
            token.save().await?;
        }
        Ok(())
    }

    pub async fn save(&mut self) -> TokenResult<()> {
        self.upload_all().await
    }

    /// Refresh every token and the design document from the store.
    pub async fn fetch(&mut self) -> TokenResult<()> {
        for token in self.tokens_mut() {
            token.fetch().await?;
        }
        if self.design_doc.is_some() {
            self.load_design_doc().await?;
        }
        Ok(())
    }

    /// Reset every token locally.
    pub fn reset(&mut self) {
        for token in self.tokens_mut() {
            token.reset();
        }
    }

    /// Delete every token from the store.
    pub async fn delete_all(&mut self) -> TokenResult<()> {
        for token in self.tokens_mut() {
            token.delete().await?;
        }
        Ok(())
    }

    pub async fn delete(&mut self) -> TokenResult<()> {
        self.delete_all().await
    }

    /// Attach a file to every token.
    ///
    /// A token the store does not know yet is saved and the upload tried
    /// once more.
    pub async fn add_attachment(&mut self, filename: &Path, attachment_name: &str) -> TokenResult<()> {
        for token in self.tokens_mut() {
            match token.add_attachment(filename, attachment_name).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    warn!(token = %token.id(), error = %e, "token not in store, saving and retrying attachment");
                    token.save().await?;
                    token.add_attachment(filename, attachment_name).await?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Set a field on every token and save each one.
    pub async fn set_field(&mut self, key: &str, value: Value) -> TokenResult<()> {
        for token in self.tokens_mut() {
            token.set_field(key, value.clone())?;
            token.save().await?;
        }
        Ok(())
    }

    /// Append every stored token listed by a map view that is not already
    /// in the list.
    pub async fn get_all_remote_tokens(&mut self) -> TokenResult<()> {
        for view in self.get_views().await? {
            if view == OVERVIEW_TOTAL {
                continue;
            }
            let listed = self.list_view_tokens(&view).await?;
            for token in listed.tokens() {
                if !self.contains(token.id()) {
                    self.append(token.clone())?;
                }
            }
        }
        Ok(())
    }

    /// Archive every token into `{base_dir}/{token_type}`.
    ///
    /// With `compress` the directory is also packed into
    /// `{base_dir}/{token_type}.zip`. The design document is deleted
    /// afterwards in every case. Returns the directory or the zip file.
    pub async fn archive(&mut self, base_dir: &Path, compress: bool, delete: bool) -> TokenResult<PathBuf> {
        let (_, token_type) = self.bound()?;
        let name = self
            .design_doc
            .as_ref()
            .map(|ddoc| ddoc.name().to_string())
            .unwrap_or_else(|| token_type.clone());
        let save_dir = base_dir.join(&name);
        tokio::fs::create_dir_all(&save_dir).await?;

        for token in self.tokens_mut() {
            token.archive(&save_dir, delete).await?;
        }

        let result = if compress {
            let zip_path = base_dir.join(format!("{name}.zip"));
            zip_dir(&save_dir, &name, &zip_path)?;
            zip_path
        } else {
            save_dir
        };

        match self.delete_ddoc().await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!(ddoc = %format!("{DESIGN_PREFIX}{token_type}"), "no design document to delete"),
            Err(e) => return Err(e),
        }
        info!(tokens = self.token_ids.len(), path = ?result, "token list archived");
        Ok(result)
    }
}

/// Pack the files of `dir` into a zip at `dest`, under `prefix/`.
pub(crate) fn zip_dir(dir: &Path, prefix: &str, dest: &Path) -> TokenResult<()> {
    let mut writer = zip::ZipWriter::new(File::create(dest)?);
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file())
        .collect();
    entries.sort();

    for path in entries {
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        writer.start_file(format!("{prefix}/{file_name}"), options)?;
        writer.write_all(&std::fs::read(&path)?)?;
    }
    writer.finish()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::view::TokenView;
    use lrt_store::EmbeddedStore;

    fn store() -> Arc<dyn DocumentStore> {
        Arc::new(EmbeddedStore::open_in_memory("tokens").unwrap())
    }

    #[test]
    fn append_inherits_type_and_database() {
        let db = store();
        let mut list = TokenList::new();
        list.append(CaToken::new(db.clone(), "job", Some("t1"))).unwrap();
        assert_eq!(list.token_type(), Some("job"));
        assert_eq!(list.database().map(|d| d.name()), Some("tokens"));
    }

    #[test]
    fn duplicate_id_rejected_without_change() {
        let db = store();
        let mut list = TokenList::with_database("job", db.clone());
        list.append(CaToken::new(db.clone(), "job", Some("t1"))).unwrap();

        let err = list.append(CaToken::new(db, "job", Some("t1"))).unwrap_err();
        assert!(matches!(err, TokenError::DuplicateId(id) if id == "t1"));
        assert_eq!(list.len(), 1);
        assert_eq!(list.token_ids(), ["t1".to_string()]);
    }

    #[test]
    fn wrong_type_rejected_without_change() {
        let db = store();
        let mut list = TokenList::with_database("job", db.clone());
        let err = list.append(CaToken::new(db, "other", Some("t1"))).unwrap_err();
        assert!(matches!(err, TokenError::WrongTokenType { .. }));
        assert!(list.is_empty());
        assert!(list.token_ids().is_empty());
    }

    #[test]
    fn database_is_write_once() {
        let mut list = TokenList::new();
        list.set_database(store()).unwrap();
        assert!(matches!(
            list.set_database(store()),
            Err(TokenError::DatabaseAlreadySet(_))
        ));
    }

    #[test]
    fn nested_lists_contribute_ids() {
        let db = store();
        let mut inner = TokenList::with_database("job", db.clone());
        inner.append(CaToken::new(db.clone(), "job", Some("a"))).unwrap();
        inner.append(CaToken::new(db.clone(), "job", Some("b"))).unwrap();

        let mut outer = TokenList::new();
        outer.append(CaToken::new(db.clone(), "job", Some("c"))).unwrap();
        outer.append(inner.clone()).unwrap();
        assert_eq!(outer.token_ids(), ["c", "a", "b"].map(String::from));
        assert_eq!(outer.tokens().len(), 3);

        assert!(matches!(outer.append(inner), Err(TokenError::DuplicateId(_))));
        assert_eq!(outer.len(), 2);
    }

    #[test]
    fn reset_fans_out() {
        let db = store();
        let mut list = TokenList::with_database("job", db.clone());
        let mut token = CaToken::new(db.clone(), "job", Some("t1"));
        token.lock = 5;
        list.append(token).unwrap();
        let mut nested = TokenList::new();
        nested.append(CaToken::new(db, "job", Some("t2"))).unwrap();
        list.append(nested).unwrap();

        list.reset();
        for token in list.tokens() {
            assert_eq!(token.lock, 0);
            assert_eq!(token.status.as_deref(), Some("reset"));
            assert_eq!(token.scrub_count, Some(1));
        }
    }

    #[tokio::test]
    async fn unbound_list_cannot_add_views() {
        let mut list = TokenList::new();
        let view = TokenView::new("todo", "doc.lock == 0");
        assert!(matches!(list.add_view(&view).await, Err(TokenError::NoDatabase)));
    }

    #[tokio::test]
    async fn design_doc_is_stamped() {
        let db = store();
        let mut list = TokenList::with_database("job", db.clone());
        list.add_view(&TokenView::new("todo", "doc.lock == 0")).await.unwrap();

        let ddoc = db.get_design_document("job").await.unwrap();
        assert_eq!(ddoc.extra["PICAS_API_VERSION"], Value::String(PICAS_API_VERSION.to_string()));
        assert_eq!(ddoc.list_views(), vec!["todo".to_string()]);
    }

    #[tokio::test]
    async fn add_view_replaces_same_name() {
        let db = store();
        let mut list = TokenList::with_database("job", db.clone());
        list.add_view(&TokenView::new("todo", "doc.lock == 0")).await.unwrap();
        list.add_view(&TokenView::new("todo", "doc.done == 0")).await.unwrap();

        let ddoc = db.get_design_document("job").await.unwrap();
        assert_eq!(ddoc.views.len(), 1);
        assert!(ddoc.views["todo"].map.contains("doc.done == 0"));
    }

    #[tokio::test]
    async fn zip_dir_packs_files() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("job");
        std::fs::create_dir(&src).unwrap();
        std::fs::write(src.join("t1.json"), "{}").unwrap();
        std::fs::write(src.join("t1-srm.txt"), "srm").unwrap();

        let dest = dir.path().join("job.zip");
        zip_dir(&src, "job", &dest).unwrap();

        let archive = zip::ZipArchive::new(File::open(&dest).unwrap()).unwrap();
        let mut names: Vec<&str> = archive.file_names().collect();
        names.sort();
        assert_eq!(names, vec!["job/t1-srm.txt", "job/t1.json"]);
    }
}
