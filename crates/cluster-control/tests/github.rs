//! Deploy key client tests against a mock GitHub API.

use cluster_control::github::{DeployKeyRegistry, GithubClient, GithubError};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn client(server: &MockServer) -> GithubClient {
    GithubClient::new("test-token")
        .unwrap()
        .with_base_url(server.uri())
}

#[tokio::test]
async fn test_add_key_registers_read_only_key() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/repos/acme/shop/keys"))
        .and(header("authorization", "Bearer test-token"))
        .and(body_partial_json(json!({
            "title": "cluster-control shop",
            "key": "ssh-ed25519 AAAA cluster-control shop",
            "read_only": true
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": 4242,
            "key": "ssh-ed25519 AAAA",
            "title": "cluster-control shop",
            "read_only": true,
            "verified": true
        })))
        .expect(1)
        .mount(&server)
        .await;

    let id = client(&server)
        .await
        .add_key(
            "acme",
            "shop",
            "cluster-control shop",
            "ssh-ed25519 AAAA cluster-control shop",
        )
        .await
        .unwrap();
    assert_eq!(id, 4242);
}

#[tokio::test]
async fn test_add_key_reports_api_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/repos/acme/shop/keys"))
        .respond_with(
            ResponseTemplate::new(422).set_body_json(json!({"message": "key is already in use"})),
        )
        .mount(&server)
        .await;

    let err = client(&server)
        .await
        .add_key("acme", "shop", "t", "ssh-ed25519 AAAA")
        .await
        .unwrap_err();
    match err {
        GithubError::Api { status, body } => {
            assert_eq!(status, 422);
            assert!(body.contains("already in use"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_delete_key() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/repos/acme/shop/keys/4242"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    client(&server)
        .await
        .delete_key("acme", "shop", 4242)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_delete_missing_key_is_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/repos/acme/shop/keys/7"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({"message": "Not Found"})))
        .mount(&server)
        .await;

    let err = client(&server)
        .await
        .delete_key("acme", "shop", 7)
        .await
        .unwrap_err();
    assert!(matches!(err, GithubError::NotFound(_)));
}
