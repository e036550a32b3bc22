//! CouchClient: HTTP access to a CouchDB database.
//!
//! One request per call, no retries. Error bodies (`{"error", "reason"}`)
//! are decoded into [`StoreError`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::store::DocumentStore;
use crate::types::*;

/// Connection settings for one CouchDB database.
#[derive(Debug, Clone)]
pub struct CouchConfig {
    /// Server base URL, e.g. `https://picas-lofar.grid.surfsara.nl:6984`.
    pub url: String,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout: Duration,
}

impl CouchConfig {
    pub fn new(url: &str, database: &str) -> Self {
        Self {
            url: url.to_string(),
            database: database.to_string(),
            username: None,
            password: None,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.username = Some(username.to_string());
        self.password = Some(password.to_string());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// A CouchDB database reached over HTTP.
#[derive(Debug, Clone)]
pub struct CouchClient {
    config: CouchConfig,
    http_client: reqwest::Client,
}

#[derive(Debug, Default, Deserialize)]
struct CouchErrorBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Deserialize)]
struct WriteResponse {
    rev: String,
}

#[derive(Debug, Deserialize)]
struct RowsResponse<R> {
    #[serde(default = "Vec::new")]
    rows: Vec<R>,
}

#[derive(Debug, Deserialize)]
struct AllDocsRow {
    id: String,
    value: AllDocsValue,
}

#[derive(Debug, Deserialize)]
struct AllDocsValue {
    rev: String,
}

/// Percent-encode a document id for use as a path segment. Design document
/// ids keep the slash after `_design`.
fn encode_id(id: &str) -> String {
    match id.strip_prefix(DESIGN_PREFIX) {
        Some(name) => format!("{DESIGN_PREFIX}{}", urlencoding::encode(name)),
        None => urlencoding::encode(id).into_owned(),
    }
}

fn transport(e: reqwest::Error) -> StoreError {
    StoreError::Transport(e.to_string())
}

impl CouchClient {
    pub fn new(config: CouchConfig) -> StoreResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("lrt/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(transport)?;
        Ok(Self { config, http_client })
    }

    pub fn config(&self) -> &CouchConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}/{}",
            self.config.url.trim_end_matches('/'),
            urlencoding::encode(&self.config.database),
            path
        )
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.http_client.request(method, self.url(path));
        match &self.config.username {
            Some(user) => builder.basic_auth(user, self.config.password.as_ref()),
            None => builder,
        }
    }

    /// Send a request and turn non-success statuses into `StoreError`s.
    async fn send(&self, builder: RequestBuilder, what: &str) -> StoreResult<Response> {
        let response = builder.send().await.map_err(transport)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body: CouchErrorBody = response.json().await.unwrap_or_default();
        debug!(status = status.as_u16(), %what, error = %body.error, "couchdb request failed");
        Err(match status {
            StatusCode::NOT_FOUND => StoreError::NotFound(what.to_string()),
            StatusCode::CONFLICT => StoreError::Conflict(what.to_string()),
            _ => StoreError::Http {
                status: status.as_u16(),
                error: body.error,
                reason: body.reason,
            },
        })
    }

    async fn json<T: serde::de::DeserializeOwned>(response: Response) -> StoreResult<T> {
        response
            .json()
            .await
            .map_err(|e| StoreError::Deserialize(e.to_string()))
    }
}

#[async_trait]
impl DocumentStore for CouchClient {
    fn name(&self) -> &str {
        &self.config.database
    }

    async fn get_document(&self, id: &str) -> StoreResult<Document> {
        let response = self.send(self.request(Method::GET, &encode_id(id)), id).await?;
        Self::json(response).await
    }

    async fn put_document(&self, doc: &Document) -> StoreResult<String> {
        let id = doc.require_id()?;
        let builder = self.request(Method::PUT, &encode_id(id)).json(doc);
        let response = self.send(builder, id).await?;
        let written: WriteResponse = Self::json(response).await?;
        debug!(%id, rev = %written.rev, "document stored");
        Ok(written.rev)
    }

    async fn delete_document(&self, id: &str, rev: &str) -> StoreResult<()> {
        let builder = self
            .request(Method::DELETE, &encode_id(id))
            .query(&[("rev", rev)]);
        self.send(builder, id).await?;
        debug!(%id, "document deleted");
        Ok(())
    }

    async fn bulk_put(&self, docs: &[Document]) -> StoreResult<Vec<BulkResult>> {
        let builder = self
            .request(Method::POST, "_bulk_docs")
            .json(&json!({ "docs": docs }));
        let response = self.send(builder, "_bulk_docs").await?;
        let results: Vec<BulkResult> = Self::json(response).await?;
        debug!(count = results.len(), "bulk write finished");
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
        let path = format!("{}/{}", encode_id(id), urlencoding::encode(name));
        let mut builder = self
            .request(Method::PUT, &path)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(data);
        if let Some(rev) = rev {
            builder = builder.query(&[("rev", rev)]);
        }
        let response = self.send(builder, &format!("{id}/{name}")).await?;
        let written: WriteResponse = Self::json(response).await?;
        debug!(%id, %name, rev = %written.rev, "attachment stored");
        Ok(written.rev)
    }

    async fn get_attachment(&self, id: &str, name: &str) -> StoreResult<Vec<u8>> {
        let path = format!("{}/{}", encode_id(id), urlencoding::encode(name));
        let response = self
            .send(self.request(Method::GET, &path), &format!("{id}/{name}"))
            .await?;
        let bytes = response.bytes().await.map_err(transport)?;
        Ok(bytes.to_vec())
    }

    async fn all_docs(&self) -> StoreResult<Vec<DocRow>> {
        let response = self
            .send(self.request(Method::GET, "_all_docs"), "_all_docs")
            .await?;
        let body: RowsResponse<AllDocsRow> = Self::json(response).await?;
        Ok(body
            .rows
            .into_iter()
            .map(|row| DocRow { id: row.id, rev: row.value.rev })
            .collect())
    }

    async fn query_view(&self, ddoc: &str, view: &str, query: ViewQuery) -> StoreResult<Vec<ViewRow>> {
        let path = format!(
            "{DESIGN_PREFIX}{}/_view/{}",
            urlencoding::encode(ddoc),
            urlencoding::encode(view)
        );
        let mut builder = self.request(Method::GET, &path);
        if !query.reduce {
            builder = builder.query(&[("reduce", "false")]);
        } else if query.group {
            builder = builder.query(&[("group", "true")]);
        }
        let response = self.send(builder, &format!("{ddoc}/{view}")).await?;
        let body: RowsResponse<ViewRow> = Self::json(response).await?;
        debug!(%ddoc, %view, rows = body.rows.len(), "view queried");
        Ok(body.rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn design_ids_keep_slash() {
        assert_eq!(encode_id("_design/job"), "_design/job");
        assert_eq!(encode_id("_design/a b"), "_design/a%20b");
        assert_eq!(encode_id("t/1"), "t%2F1");
    }

    #[test]
    fn url_joins_base_and_database() {
        let client = CouchClient::new(CouchConfig::new("http://localhost:5984/", "tokens")).unwrap();
        assert_eq!(client.url("doc"), "http://localhost:5984/tokens/doc");
    }
}
