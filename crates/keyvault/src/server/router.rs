//! Axum router construction.

use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::{compression::CompressionLayer, timeout::TimeoutLayer, trace::TraceLayer};

use super::{handlers, middleware, state::AppState};
use crate::secret_store::SecretStore;

/// Build the application [`Router`] with all routes and middleware attached.
pub fn build<S: SecretStore>(state: AppState<S>) -> Router {
    Router::new()
        .route("/surveys", post(handlers::provision_survey::<S>))
        .route("/surveys/:id/keys", delete(handlers::destroy_keys::<S>))
        .route("/surveys/:id/fields/encrypt", post(handlers::encrypt_field::<S>))
        .route("/surveys/:id/fields/decrypt", post(handlers::decrypt_field::<S>))
        .route("/surveys/:id/recovery", post(handlers::create_recovery::<S>))
        .route("/recovery/:id", get(handlers::get_recovery::<S>))
        .route("/recovery/:id/approve", post(handlers::approve_recovery::<S>))
        .route("/recovery/:id/reject", post(handlers::reject_recovery::<S>))
        .route("/recovery/:id/cancel", post(handlers::cancel_recovery::<S>))
        .route("/escrow/ceremony", post(handlers::init_ceremony::<S>))
        .route("/escrow/unseal", post(handlers::open_unseal::<S>))
        .route("/escrow/unseal/:session/shares", post(handlers::present_share::<S>))
        .route("/health", get(handlers::health::<S>))
        .fallback(handlers::not_found)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(middleware::REQUEST_TIMEOUT))
        .layer(CompressionLayer::new())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::{
        body::Body,
        http::{Request, StatusCode},
        response::Response,
    };
    use chrono::Duration;
    use common::protocol::{
        DecryptFieldResponse, EncryptFieldResponse, ErrorResponse, HealthResponse,
        InitCeremonyResponse, RecoveryRequestView, UnsealProgress, UnsealSessionResponse,
    };
    use serde::de::DeserializeOwned;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::db::Database;
    use crate::events::LogSink;
    use crate::secret_store::MemorySecretStore;
    use crate::server::middleware::ActorHeaders;
    use crate::server::state::ServerSettings;
    use crate::testutil;

    struct Harness {
        app: Router,
        store: MemorySecretStore,
    }

    async fn harness() -> Harness {
        let db = Database::open_in_memory().unwrap();
        let store = MemorySecretStore::new();
        let escrow = testutil::escrow(&db, &store).await;
        let state = AppState::new(
            db,
            Arc::new(store.clone()),
            escrow,
            Arc::new(LogSink),
            ServerSettings {
                headers: ActorHeaders::default(),
                cooling_off: Duration::hours(72),
                kdf_params: testutil::fast_kdf(),
                unseal_session_ttl: Duration::minutes(10),
                master_session_ttl: Duration::minutes(2),
            },
        );
        Harness {
            app: build(state),
            store,
        }
    }

    async fn call(app: &Router, method: &str, uri: &str, who: Option<(&str, &str)>, body: Option<Value>) -> Response {
        let mut req = Request::builder().method(method).uri(uri);
        if let Some((id, role)) = who {
            req = req.header("x-actor-id", id).header("x-actor-role", role);
        }
        let req = match body {
            Some(v) => req
                .header("content-type", "application/json")
                .body(Body::from(v.to_string()))
                .unwrap(),
            None => req.body(Body::empty()).unwrap(),
        };
        app.clone().oneshot(req).await.unwrap()
    }

    async fn json_body<T: DeserializeOwned>(resp: Response) -> T {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    const OWNER: Option<(&str, &str)> = Some(("owner-1", "owner"));
    const REVIEWER: Option<(&str, &str)> = Some(("rev-1", "reviewer"));
    const OPERATOR: Option<(&str, &str)> = Some(("op-1", "operator"));

    async fn provision(app: &Router, survey: &str, tier: &str) -> Response {
        call(
            app,
            "POST",
            "/surveys",
            OWNER,
            Some(json!({"survey_id": survey, "tier": tier, "credential": "owner passphrase"})),
        )
        .await
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let h = harness().await;
        let resp = call(&h.app, "GET", "/unknown", None, None).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn health_reports_database_and_platform() {
        let h = harness().await;
        let resp = call(&h.app, "GET", "/health", None, None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: HealthResponse = json_body(resp).await;
        assert!(body.database_ready);
        assert!(!body.platform_initialised);
    }

    #[tokio::test]
    async fn identity_headers_are_required() {
        let h = harness().await;
        let resp = call(
            &h.app,
            "POST",
            "/surveys",
            None,
            Some(json!({"survey_id": "s1", "tier": "ORGANIZATION", "credential": "pw"})),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let err: ErrorResponse = json_body(resp).await;
        assert_eq!(err.code, "bad_request");
    }

    #[tokio::test]
    async fn field_round_trip_over_http() {
        let h = harness().await;
        assert_eq!(provision(&h.app, "s1", "ORGANIZATION").await.status(), StatusCode::CREATED);

        let resp = call(
            &h.app,
            "POST",
            "/surveys/s1/fields/encrypt",
            OWNER,
            Some(json!({
                "credential": "owner passphrase",
                "response_id": "r1",
                "field_id": "q1",
                "plaintext": "free text answer"
            })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let EncryptFieldResponse { ciphertext } = json_body(resp).await;
        assert!(ciphertext.starts_with("v1."));

        let decrypt = |credential: &'static str, field: &'static str| {
            json!({
                "credential": credential,
                "response_id": "r1",
                "field_id": field,
                "ciphertext": ciphertext.clone()
            })
        };
        let resp = call(&h.app, "POST", "/surveys/s1/fields/decrypt", OWNER, Some(decrypt("owner passphrase", "q1"))).await;
        let DecryptFieldResponse { plaintext } = json_body(resp).await;
        assert_eq!(plaintext, "free text answer");

        // Moved to another field: integrity failure, not plaintext.
        let resp = call(&h.app, "POST", "/surveys/s1/fields/decrypt", OWNER, Some(decrypt("owner passphrase", "q2"))).await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let err: ErrorResponse = json_body(resp).await;
        assert_eq!(err.code, "integrity_error");

        let resp = call(&h.app, "POST", "/surveys/s1/fields/decrypt", OWNER, Some(decrypt("wrong", "q1"))).await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn individual_tier_refuses_recovery() {
        let h = harness().await;
        provision(&h.app, "zk", "INDIVIDUAL").await;
        let resp = call(
            &h.app,
            "POST",
            "/surveys/zk/recovery",
            OWNER,
            Some(json!({"new_credential": "new"})),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let err: ErrorResponse = json_body(resp).await;
        assert_eq!(err.code, "policy_violation");
    }

    #[tokio::test]
    async fn recovery_review_flow() {
        let h = harness().await;
        provision(&h.app, "s1", "ORGANIZATION").await;

        let resp = call(&h.app, "POST", "/surveys/s1/recovery", OWNER, Some(json!({"new_credential": "new"}))).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let view: RecoveryRequestView = json_body(resp).await;
        assert_eq!(view.state, "REQUESTED");

        // A second open request for the same survey conflicts.
        let resp = call(&h.app, "POST", "/surveys/s1/recovery", OWNER, Some(json!({"new_credential": "x"}))).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        // The requester cannot approve their own request.
        let uri = format!("/recovery/{}/approve", view.id);
        let resp = call(&h.app, "POST", &uri, Some(("owner-1", "reviewer")), None).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let resp = call(&h.app, "POST", &uri, REVIEWER, None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let approved: RecoveryRequestView = json_body(resp).await;
        assert_eq!(approved.state, "APPROVED");
        let scheduled = approved.scheduled_execution_at.unwrap();
        assert_eq!(scheduled - approved.reviewed_at.unwrap(), Duration::hours(72));

        let resp = call(&h.app, "POST", &format!("/recovery/{}/cancel", view.id), OWNER, None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let cancelled: RecoveryRequestView = json_body(resp).await;
        assert_eq!(cancelled.state, "CANCELLED");
        assert!(!h.store.contains(&crate::recovery::pending_kek_path(view.id)));

        let resp = call(&h.app, "GET", &format!("/recovery/{}", view.id), REVIEWER, None).await;
        let fetched: RecoveryRequestView = json_body(resp).await;
        assert_eq!(fetched.state, "CANCELLED");

        let resp = call(&h.app, "GET", &format!("/recovery/{}", view.id), OWNER, None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let resp = call(&h.app, "GET", &format!("/recovery/{}", view.id), Some(("owner-2", "owner")), None).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn reject_requires_reason() {
        let h = harness().await;
        provision(&h.app, "s1", "ORGANIZATION").await;
        let resp = call(&h.app, "POST", "/surveys/s1/recovery", OWNER, Some(json!({"new_credential": "new"}))).await;
        let view: RecoveryRequestView = json_body(resp).await;
        let uri = format!("/recovery/{}/reject", view.id);

        let resp = call(&h.app, "POST", &uri, REVIEWER, Some(json!({"reason": "  "}))).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = call(&h.app, "POST", &uri, REVIEWER, Some(json!({"reason": "identity not verified"}))).await;
        let rejected: RecoveryRequestView = json_body(resp).await;
        assert_eq!(rejected.state, "REJECTED");
        assert_eq!(rejected.rejection_reason.as_deref(), Some("identity not verified"));
    }

    #[tokio::test]
    async fn destroy_makes_survey_unknown() {
        let h = harness().await;
        provision(&h.app, "s1", "ORGANIZATION").await;
        let resp = call(&h.app, "DELETE", "/surveys/s1/keys", REVIEWER, None).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        let resp = call(&h.app, "DELETE", "/surveys/s1/keys", OPERATOR, None).await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        let resp = call(&h.app, "DELETE", "/surveys/s1/keys", OPERATOR, None).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unseal_ceremony_over_http() {
        let h = harness().await;
        let resp = call(
            &h.app,
            "POST",
            "/escrow/ceremony",
            OWNER,
            Some(json!({"custodians": ["alice", "bob", "carol"], "threshold": 2})),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let resp = call(
            &h.app,
            "POST",
            "/escrow/ceremony",
            OPERATOR,
            Some(json!({"custodians": ["alice", "bob", "carol"], "threshold": 2})),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let ceremony: InitCeremonyResponse = json_body(resp).await;
        assert_eq!(ceremony.shares.len(), 3);

        let resp = call(&h.app, "POST", "/escrow/unseal", OPERATOR, None).await;
        let session: UnsealSessionResponse = json_body(resp).await;
        let uri = format!("/escrow/unseal/{}/shares", session.session_id);

        // A custodian may only present their own share.
        let resp = call(
            &h.app,
            "POST",
            &uri,
            Some(("mallory", "operator")),
            Some(json!({"share": ceremony.shares[0].share})),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let mut last = None;
        for cs in &ceremony.shares[..2] {
            let resp = call(
                &h.app,
                "POST",
                &uri,
                Some((cs.custodian.as_str(), "operator")),
                Some(json!({"share": cs.share})),
            )
            .await;
            assert_eq!(resp.status(), StatusCode::OK);
            last = Some(json_body::<UnsealProgress>(resp).await);
        }
        assert!(last.unwrap().unsealed);
        assert!(h.store.unsealed_with().is_some());

        let resp = call(&h.app, "GET", "/health", None, None).await;
        let body: HealthResponse = json_body(resp).await;
        assert!(body.platform_initialised);
    }
}
