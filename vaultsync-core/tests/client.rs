use serde_json::json;
use vaultsync_core::{
    ApiError, ApiErrorClass, BindVaultRequest, ChangeType, CloudSyncClient, CompletedFile, LocalFileChange,
    SyncActionType, SyncCommitRequest, SyncDiffRequest, VectorizeRequest,
};
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn sync_diff_sends_manifest_and_parses_actions() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/sync/diff"))
        .and(header("authorization", "Bearer test-token"))
        .and(body_partial_json(json!({
            "vaultId": "v1",
            "deviceId": "dev-1",
            "localFiles": [
                {
                    "fileId": "f1",
                    "relativePath": "notes/a.md",
                    "changeType": "upload",
                    "contentHash": "abc"
                }
            ]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "actions": [
                { "type": "upload", "fileId": "f1", "relativePath": "notes/a.md" },
                { "type": "download", "fileId": "f2", "relativePath": "b.md", "contentHash": "def" }
            ]
        })))
        .mount(&server)
        .await;

    let client = CloudSyncClient::with_base_url(&server.uri(), "test-token").unwrap();
    let response = client
        .sync_diff(&SyncDiffRequest {
            vault_id: "v1".into(),
            device_id: "dev-1".into(),
            local_files: vec![LocalFileChange {
                file_id: "f1".into(),
                relative_path: "notes/a.md".into(),
                change_type: ChangeType::Upload,
                content_hash: Some("abc".into()),
                size: Some(3),
                modified_at: None,
            }],
        })
        .await
        .unwrap();

    assert_eq!(response.actions.len(), 2);
    assert_eq!(response.actions[0].action_type, SyncActionType::Upload);
    assert_eq!(response.actions[1].content_hash.as_deref(), Some("def"));
}

#[tokio::test]
async fn sync_diff_tolerates_missing_actions_field() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/sync/diff"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;

    let client = CloudSyncClient::with_base_url(&server.uri(), "test-token").unwrap();
    let response = client
        .sync_diff(&SyncDiffRequest {
            vault_id: "v1".into(),
            device_id: "dev-1".into(),
            local_files: Vec::new(),
        })
        .await
        .unwrap();

    assert!(response.actions.is_empty());
}

#[tokio::test]
async fn sync_commit_reports_conflicts_without_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/sync/commit"))
        .and(body_partial_json(json!({ "vectorizeEnabled": true })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": false,
            "conflicts": [ { "fileId": "f1", "relativePath": "a.md", "reason": "stale" } ]
        })))
        .mount(&server)
        .await;

    let client = CloudSyncClient::with_base_url(&server.uri(), "test-token").unwrap();
    let response = client
        .sync_commit(&SyncCommitRequest {
            vault_id: "v1".into(),
            device_id: "dev-1".into(),
            completed: vec![CompletedFile {
                file_id: "f1".into(),
                relative_path: "a.md".into(),
                action: SyncActionType::Upload,
                content_hash: None,
                size: None,
            }],
            deleted: Vec::new(),
            vectorize_enabled: true,
        })
        .await
        .unwrap();

    assert!(!response.success);
    assert_eq!(response.conflicts.len(), 1);
    assert_eq!(response.conflicts[0].reason.as_deref(), Some("stale"));
}

#[tokio::test]
async fn delete_vector_accepts_no_content() {
    let server = MockServer::start().await;

    Mock::given(method("DELETE"))
        .and(path("/v1/vectors/f1"))
        .and(header("authorization", "Bearer test-token"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let client = CloudSyncClient::with_base_url(&server.uri(), "test-token").unwrap();
    client.delete_vector("f1").await.unwrap();
}

#[tokio::test]
async fn vectorize_file_posts_request() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/vectors"))
        .and(body_partial_json(json!({ "fileId": "f9", "relativePath": "x.md" })))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let client = CloudSyncClient::with_base_url(&server.uri(), "test-token").unwrap();
    client
        .vectorize_file(&VectorizeRequest {
            vault_id: "v1".into(),
            file_id: "f9".into(),
            relative_path: "x.md".into(),
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn bind_vault_returns_remote_vault() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/vaults/bind"))
        .and(body_partial_json(json!({ "vaultName": "Notes", "deviceId": "dev-1" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "v42",
            "name": "Notes",
            "accountId": "acc-1"
        })))
        .mount(&server)
        .await;

    let client = CloudSyncClient::with_base_url(&server.uri(), "test-token").unwrap();
    let vault = client
        .bind_vault(&BindVaultRequest {
            vault_name: "Notes".into(),
            device_id: "dev-1".into(),
        })
        .await
        .unwrap();

    assert_eq!(vault.id, "v42");
    assert_eq!(vault.account_id, "acc-1");
}

#[tokio::test]
async fn get_upload_link_encodes_relative_path() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/vaults/v1/files/f1/upload"))
        .and(query_param("path", "notes/Hello World.md"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "href": "https://upload.example/f1",
            "method": "PUT"
        })))
        .mount(&server)
        .await;

    let client = CloudSyncClient::with_base_url(&server.uri(), "test-token").unwrap();
    let link = client
        .get_upload_link("v1", "f1", "notes/Hello World.md")
        .await
        .unwrap();

    assert_eq!(link.href.as_str(), "https://upload.example/f1");
    assert_eq!(link.method, "PUT");
}

#[tokio::test]
async fn get_download_link_returns_href() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/vaults/v1/files/f2/download"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "href": "https://download.example/f2",
            "method": "GET"
        })))
        .mount(&server)
        .await;

    let client = CloudSyncClient::with_base_url(&server.uri(), "test-token").unwrap();
    let link = client.get_download_link("v1", "f2").await.unwrap();

    assert_eq!(link.href.as_str(), "https://download.example/f2");
}

#[tokio::test]
async fn unauthorized_response_is_classified_as_auth() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/sync/diff"))
        .respond_with(ResponseTemplate::new(401).set_body_string("expired"))
        .mount(&server)
        .await;

    let client = CloudSyncClient::with_base_url(&server.uri(), "test-token").unwrap();
    let err = client
        .sync_diff(&SyncDiffRequest {
            vault_id: "v1".into(),
            device_id: "dev-1".into(),
            local_files: Vec::new(),
        })
        .await
        .unwrap_err();

    assert!(err.is_unauthorized());
    assert!(!err.is_server_error());
    assert!(!err.is_retryable());
    assert_eq!(err.classification(), Some(ApiErrorClass::Auth));
}

#[tokio::test]
async fn server_error_is_transient() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/sync/commit"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let client = CloudSyncClient::with_base_url(&server.uri(), "test-token").unwrap();
    let err = client
        .sync_commit(&SyncCommitRequest {
            vault_id: "v1".into(),
            device_id: "dev-1".into(),
            completed: Vec::new(),
            deleted: Vec::new(),
            vectorize_enabled: false,
        })
        .await
        .unwrap_err();

    assert!(err.is_server_error());
    assert!(err.is_retryable());
    assert_eq!(err.classification(), Some(ApiErrorClass::Transient));
}

#[tokio::test]
async fn connection_refused_is_network_error() {
    let client = CloudSyncClient::with_base_url("http://127.0.0.1:9", "test-token").unwrap();
    let err = client.delete_vector("f1").await.unwrap_err();

    assert!(err.is_network_error());
    assert!(!err.is_unauthorized());
    assert!(err.classification().is_none());
}

#[tokio::test]
async fn connection_dropped_mid_body_is_network_error() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 4096];
        let _ = socket.read(&mut buf).await;
        socket
            .write_all(
                b"HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 200\r\n\r\n{\"href\": \"http",
            )
            .await
            .unwrap();
        socket.shutdown().await.unwrap();
    });

    let client = CloudSyncClient::with_base_url(&format!("http://{addr}"), "test-token").unwrap();
    let err = client.get_download_link("v1", "f1").await.unwrap_err();

    assert!(err.is_network_error());
    assert!(err.is_retryable());
    assert!(err.classification().is_none());
}

#[tokio::test]
async fn malformed_success_body_is_not_network_error() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/vaults/v1/files/f1/download"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&server)
        .await;

    let client = CloudSyncClient::with_base_url(&server.uri(), "test-token").unwrap();
    let err = client.get_download_link("v1", "f1").await.unwrap_err();

    assert!(matches!(err, ApiError::Decode(_)));
    assert!(!err.is_network_error());
    assert!(!err.is_server_error());
}
