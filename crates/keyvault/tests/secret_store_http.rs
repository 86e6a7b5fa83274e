//! HTTP secret store client against a mock server.

use std::time::Duration;

use keyvault::secret_store::{HttpSecretStore, RetryPolicy, SecretStore, SecretStoreError, SecretStoreSettings};
use secrecy::{ExposeSecret, SecretBox};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TOKEN: &str = "s.test-token";

fn client(server: &MockServer) -> HttpSecretStore {
    HttpSecretStore::new(SecretStoreSettings {
        addr: server.uri(),
        mount: "secret".into(),
        role_id: "keyvault-role".into(),
        secret_id: SecretBox::new(Box::new("keyvault-secret".into())),
        timeout: Duration::from_secs(5),
        retry: RetryPolicy {
            max_retries: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        },
        renew_margin: Duration::from_secs(30),
    })
    .unwrap()
}

async fn mount_login(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/v1/auth/approle/login"))
        .and(body_partial_json(json!({ "role_id": "keyvault-role", "secret_id": "keyvault-secret" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "auth": { "client_token": TOKEN, "lease_duration": 3600 }
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn login_token_is_reused_across_calls() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/auth/approle/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "auth": { "client_token": TOKEN, "lease_duration": 3600 }
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/secret/data/custodians/c1"))
        .and(header("X-Vault-Token", TOKEN))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "data": { "value": "a2V5LWJ5dGVz" } }
        })))
        .expect(2)
        .mount(&server)
        .await;

    let store = client(&server);
    store.login().await.unwrap();
    let first = store.get_secret("custodians/c1").await.unwrap();
    let second = store.get_secret("custodians/c1").await.unwrap();
    assert_eq!(first.expose_secret().as_slice(), b"key-bytes");
    assert_eq!(second.expose_secret().as_slice(), b"key-bytes");
}

#[tokio::test]
async fn rejected_login_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/auth/approle/login"))
        .respond_with(ResponseTemplate::new(403))
        .expect(1)
        .mount(&server)
        .await;

    let err = client(&server).login().await.unwrap_err();
    assert!(matches!(err, SecretStoreError::Auth(_)));
}

#[tokio::test]
async fn writes_send_base64_values() {
    let server = MockServer::start().await;
    mount_login(&server).await;
    Mock::given(method("POST"))
        .and(path("/v1/secret/data/recovery/r1"))
        .and(body_partial_json(json!({ "data": { "value": "a2V5LWJ5dGVz" } })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": { "version": 1 } })))
        .expect(1)
        .mount(&server)
        .await;

    client(&server).put_secret("recovery/r1", b"key-bytes").await.unwrap();
}

#[tokio::test]
async fn create_only_write_conflicts_on_existing_secret() {
    let server = MockServer::start().await;
    mount_login(&server).await;
    Mock::given(method("POST"))
        .and(path("/v1/secret/data/custodians/c1"))
        .and(body_partial_json(json!({ "options": { "cas": 0 } })))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "errors": ["check-and-set parameter did not match the current version"]
        })))
        .mount(&server)
        .await;

    let err = client(&server)
        .create_secret("custodians/c1", b"key-bytes")
        .await
        .unwrap_err();
    assert!(matches!(err, SecretStoreError::Conflict { ref path } if path == "custodians/c1"));
}

#[tokio::test]
async fn missing_secret_is_not_found() {
    let server = MockServer::start().await;
    mount_login(&server).await;
    Mock::given(method("GET"))
        .and(path("/v1/secret/data/recovery/gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let err = client(&server).get_secret("recovery/gone").await.unwrap_err();
    assert!(matches!(err, SecretStoreError::NotFound { .. }));
}

#[tokio::test]
async fn unavailable_store_is_retried_then_succeeds() {
    let server = MockServer::start().await;
    mount_login(&server).await;
    Mock::given(method("GET"))
        .and(path("/v1/secret/data/custodians/c2"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/secret/data/custodians/c2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "data": { "value": "b2s=" } }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let value = client(&server).get_secret("custodians/c2").await.unwrap();
    assert_eq!(value.expose_secret().as_slice(), b"ok");
}

#[tokio::test]
async fn persistent_outage_surfaces_as_transient() {
    let server = MockServer::start().await;
    mount_login(&server).await;
    Mock::given(method("GET"))
        .and(path("/v1/secret/data/custodians/c3"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let err = client(&server).get_secret("custodians/c3").await.unwrap_err();
    assert!(err.is_transient());
}

#[tokio::test]
async fn revoked_token_forces_a_fresh_login() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/auth/approle/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "auth": { "client_token": TOKEN, "lease_duration": 3600 }
        })))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/secret/data/custodians/c1"))
        .respond_with(ResponseTemplate::new(403))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/secret/data/custodians/c1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "data": { "value": "b2s=" } }
        })))
        .mount(&server)
        .await;

    let store = client(&server);
    let err = store.get_secret("custodians/c1").await.unwrap_err();
    assert!(matches!(err, SecretStoreError::Auth(_)));
    let value = store.get_secret("custodians/c1").await.unwrap();
    assert_eq!(value.expose_secret().as_slice(), b"ok");
}

#[tokio::test]
async fn delete_removes_all_versions_and_ignores_missing() {
    let server = MockServer::start().await;
    mount_login(&server).await;
    Mock::given(method("DELETE"))
        .and(path("/v1/secret/metadata/recovery/r1"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/v1/secret/metadata/recovery/r2"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let store = client(&server);
    store.delete_secret("recovery/r1").await.unwrap();
    store.delete_secret("recovery/r2").await.unwrap();
}
