//! CouchClient against a mocked CouchDB.

use lrt_store::{CouchClient, CouchConfig, Document, DocumentStore, StoreError, ViewQuery};
use serde_json::json;
use wiremock::matchers::{body_bytes, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer) -> CouchClient {
    CouchClient::new(CouchConfig::new(&server.uri(), "tokens")).unwrap()
}

#[tokio::test]
async fn get_document_decodes_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/tokens/t1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "_id": "t1", "_rev": "1-abc", "type": "job", "lock": 0, "done": 0
        })))
        .expect(1)
        .mount(&server)
        .await;

    let doc = client(&server).get_document("t1").await.unwrap();
    assert_eq!(doc.id(), Some("t1"));
    assert_eq!(doc.rev(), Some("1-abc"));
}

#[tokio::test]
async fn missing_document_is_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/tokens/ghost"))
        .respond_with(
            ResponseTemplate::new(404).set_body_json(json!({"error": "not_found", "reason": "missing"})),
        )
        .mount(&server)
        .await;

    let err = client(&server).get_document("ghost").await.unwrap_err();
    assert!(err.is_not_found());
    assert!(!client(&server).contains("ghost").await.unwrap());
}

#[tokio::test]
async fn put_document_returns_revision() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/tokens/t1"))
        .respond_with(
            ResponseTemplate::new(201).set_body_json(json!({"ok": true, "id": "t1", "rev": "1-def"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let rev = client(&server).put_document(&Document::new("t1")).await.unwrap();
    assert_eq!(rev, "1-def");
}

#[tokio::test]
async fn conflict_maps_to_conflict() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/tokens/t1"))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({
            "error": "conflict", "reason": "Document update conflict."
        })))
        .mount(&server)
        .await;

    let err = client(&server).put_document(&Document::new("t1")).await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));
}

#[tokio::test]
async fn other_errors_keep_couch_reason() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/tokens/t1"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": "unauthorized", "reason": "Name or password is incorrect."
        })))
        .mount(&server)
        .await;

    match client(&server).get_document("t1").await.unwrap_err() {
        StoreError::Http { status, error, reason } => {
            assert_eq!(status, 401);
            assert_eq!(error, "unauthorized");
            assert_eq!(reason, "Name or password is incorrect.");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn delete_sends_revision() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/tokens/t1"))
        .and(query_param("rev", "2-xyz"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .expect(1)
        .mount(&server)
        .await;

    client(&server).delete_document("t1", "2-xyz").await.unwrap();
}

#[tokio::test]
async fn attachment_upload_and_download() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/tokens/t1/srm.txt"))
        .and(query_param("rev", "1-abc"))
        .and(header("content-type", "text/plain"))
        .and(body_bytes(b"srm://x".to_vec()))
        .respond_with(
            ResponseTemplate::new(201).set_body_json(json!({"ok": true, "id": "t1", "rev": "2-abc"})),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/tokens/t1/srm.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"srm://x".to_vec()))
        .mount(&server)
        .await;

    let client = client(&server);
    let rev = client
        .put_attachment("t1", Some("1-abc"), "srm.txt", "text/plain", b"srm://x".to_vec())
        .await
        .unwrap();
    assert_eq!(rev, "2-abc");
    assert_eq!(client.get_attachment("t1", "srm.txt").await.unwrap(), b"srm://x");
}

#[tokio::test]
async fn view_query_parameters() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/tokens/_design/job/_view/todo"))
        .and(query_param("reduce", "false"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "total_rows": 1, "offset": 0,
            "rows": [{"id": "t1", "key": "t1", "value": "t1"}]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/tokens/_design/job/_view/overview_view"))
        .and(query_param("group", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "rows": [{"key": "todo", "value": 3}, {"key": "done", "value": 1}]
        })))
        .mount(&server)
        .await;

    let client = client(&server);
    let rows = client.query_view("job", "todo", ViewQuery::rows()).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id.as_deref(), Some("t1"));

    let grouped = client
        .query_view("job", "overview_view", ViewQuery::grouped())
        .await
        .unwrap();
    assert_eq!(grouped.len(), 2);
    assert!(grouped[0].id.is_none());
    assert_eq!(grouped[0].value, json!(3));
}

#[tokio::test]
async fn all_docs_and_bulk() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/tokens/_all_docs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "total_rows": 2, "offset": 0,
            "rows": [
                {"id": "_design/job", "key": "_design/job", "value": {"rev": "1-a"}},
                {"id": "t1", "key": "t1", "value": {"rev": "3-b"}}
            ]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/tokens/_bulk_docs"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!([
            {"ok": true, "id": "t1", "rev": "1-a"},
            {"id": "t2", "error": "conflict", "reason": "Document update conflict."}
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server);
    let rows = client.all_docs().await.unwrap();
    assert_eq!(rows[1].id, "t1");
    assert_eq!(rows[1].rev, "3-b");

    let results = client
        .bulk_put(&[Document::new("t1"), Document::new("t2")])
        .await
        .unwrap();
    assert!(results[0].is_ok());
    assert!(!results[1].is_ok());
}

#[tokio::test]
async fn credentials_sent_as_basic_auth() {
    let server = MockServer::start().await;
    // "user:secret" in base64
    Mock::given(method("GET"))
        .and(path("/tokens/t1"))
        .and(header("authorization", "Basic dXNlcjpzZWNyZXQ="))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"_id": "t1"})))
        .expect(1)
        .mount(&server)
        .await;

    let config = CouchConfig::new(&server.uri(), "tokens").with_credentials("user", "secret");
    let client = CouchClient::new(config).unwrap();
    client.get_document("t1").await.unwrap();
}
