//! Axum request handlers for all service endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use common::protocol::{
    CreateRecoveryRequest, CustodianShare, DecryptFieldRequest, DecryptFieldResponse,
    EncryptFieldRequest, EncryptFieldResponse, ErrorResponse, HealthResponse, InitCeremonyRequest,
    InitCeremonyResponse, PresentShareRequest, ProvisionSurveyRequest, ProvisionSurveyResponse,
    RecoveryRequestView, RejectRecoveryRequest, UnsealProgress, UnsealSessionResponse,
};
use common::ServiceError;
use tracing::warn;
use uuid::Uuid;
use zeroize::Zeroizing;

use super::state::AppState;
use crate::actor::{Actor, Role};
use crate::escrow::EscrowError;
use crate::field::{FieldContext, FieldError};
use crate::recovery::RecoveryError;
use crate::secret_store::SecretStore;
use crate::survey::{self, SurveyError};

/// A [`ServiceError`] rendered as an [`ErrorResponse`] body.
#[derive(Debug)]
pub struct ApiError(pub ServiceError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(ErrorResponse::from(&self.0))).into_response()
    }
}

macro_rules! api_error_from {
    ($($err:ty),* $(,)?) => {
        $(impl From<$err> for ApiError {
            fn from(err: $err) -> Self {
                ApiError(err.into())
            }
        })*
    };
}

api_error_from!(ServiceError, FieldError, SurveyError, RecoveryError, EscrowError);

type ApiResult<T> = Result<T, ApiError>;

fn require_role(actor: &Actor, role: Role) -> Result<(), ServiceError> {
    if actor.role != role {
        return Err(ServiceError::Forbidden(format!(
            "{} role required, caller is {}",
            role.as_str(),
            actor.role.as_str()
        )));
    }
    Ok(())
}

/// Run CPU-bound key work off the async executor.
async fn blocking<T, E>(f: impl FnOnce() -> Result<T, E> + Send + 'static) -> ApiResult<T>
where
    T: Send + 'static,
    E: Into<ApiError> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result.map_err(Into::into),
        Err(e) => {
            warn!(error = %e, "blocking task failed");
            Err(ApiError(ServiceError::Internal("worker task failed".into())))
        }
    }
}

/// `POST /surveys`: create the survey and its key record.
pub async fn provision_survey<S: SecretStore>(
    State(state): State<AppState<S>>,
    actor: Actor,
    Json(req): Json<ProvisionSurveyRequest>,
) -> ApiResult<(StatusCode, Json<ProvisionSurveyResponse>)> {
    require_role(&actor, Role::Owner)?;
    let credential = Zeroizing::new(req.credential.into_bytes());
    let record = state
        .field
        .provision(&actor, &req.survey_id, req.tier, credential, Utc::now())
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(ProvisionSurveyResponse {
            survey_id: record.survey_id,
            tier: req.tier,
            wrap_version: record.wrap_version,
            escrowed: record.escrow_wrapped_dek.is_some(),
        }),
    ))
}

/// `DELETE /surveys/:id/keys`: crypto-shred a survey.
pub async fn destroy_keys<S: SecretStore>(
    State(state): State<AppState<S>>,
    actor: Actor,
    Path(survey_id): Path<String>,
) -> ApiResult<StatusCode> {
    survey::destroy_survey_keys(&state.db, &actor, &survey_id, Utc::now())?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /surveys/:id/fields/encrypt`
pub async fn encrypt_field<S: SecretStore>(
    State(state): State<AppState<S>>,
    actor: Actor,
    Path(survey_id): Path<String>,
    Json(req): Json<EncryptFieldRequest>,
) -> ApiResult<Json<EncryptFieldResponse>> {
    let credential = Zeroizing::new(req.credential);
    let plaintext = Zeroizing::new(req.plaintext);
    let engine = state.field;
    let ciphertext = blocking(move || {
        let ctx = FieldContext::new(&survey_id, &req.response_id, &req.field_id);
        engine.encrypt_field(&actor, credential.as_bytes(), &ctx, plaintext.as_bytes(), Utc::now())
    })
    .await?;
    Ok(Json(EncryptFieldResponse { ciphertext }))
}

/// `POST /surveys/:id/fields/decrypt`
pub async fn decrypt_field<S: SecretStore>(
    State(state): State<AppState<S>>,
    actor: Actor,
    Path(survey_id): Path<String>,
    Json(req): Json<DecryptFieldRequest>,
) -> ApiResult<Json<DecryptFieldResponse>> {
    let credential = Zeroizing::new(req.credential);
    let engine = state.field;
    let plaintext = blocking(move || {
        let ctx = FieldContext::new(&survey_id, &req.response_id, &req.field_id);
        engine.decrypt_field(&actor, credential.as_bytes(), &ctx, &req.ciphertext, Utc::now())
    })
    .await?;
    let plaintext = String::from_utf8(plaintext.to_vec())
        .map_err(|_| ServiceError::BadRequest("field plaintext is not UTF-8".into()))?;
    Ok(Json(DecryptFieldResponse { plaintext }))
}

/// `POST /surveys/:id/recovery`: open a recovery request.
pub async fn create_recovery<S: SecretStore>(
    State(state): State<AppState<S>>,
    actor: Actor,
    Path(survey_id): Path<String>,
    Json(req): Json<CreateRecoveryRequest>,
) -> ApiResult<(StatusCode, Json<RecoveryRequestView>)> {
    let credential = Zeroizing::new(req.new_credential.into_bytes());
    let request = state
        .recovery
        .create(&actor, &survey_id, credential, Utc::now())
        .await?;
    Ok((StatusCode::CREATED, Json(request.view())))
}

/// `GET /recovery/:id`
pub async fn get_recovery<S: SecretStore>(
    State(state): State<AppState<S>>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<RecoveryRequestView>> {
    Ok(Json(state.recovery.get_as(&actor, id)?.view()))
}

/// `POST /recovery/:id/approve`
pub async fn approve_recovery<S: SecretStore>(
    State(state): State<AppState<S>>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<RecoveryRequestView>> {
    Ok(Json(state.recovery.approve(&actor, id, Utc::now())?.view()))
}

/// `POST /recovery/:id/reject`
pub async fn reject_recovery<S: SecretStore>(
    State(state): State<AppState<S>>,
    actor: Actor,
    Path(id): Path<Uuid>,
    Json(req): Json<RejectRecoveryRequest>,
) -> ApiResult<Json<RecoveryRequestView>> {
    let request = state
        .recovery
        .reject(&actor, id, &req.reason, Utc::now())
        .await?;
    Ok(Json(request.view()))
}

/// `POST /recovery/:id/cancel`
pub async fn cancel_recovery<S: SecretStore>(
    State(state): State<AppState<S>>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<RecoveryRequestView>> {
    Ok(Json(state.recovery.cancel(&actor, id, Utc::now()).await?.view()))
}

/// `POST /escrow/ceremony`: one-time platform key split. Each share is
/// returned in this response only.
pub async fn init_ceremony<S: SecretStore>(
    State(state): State<AppState<S>>,
    actor: Actor,
    Json(req): Json<InitCeremonyRequest>,
) -> ApiResult<(StatusCode, Json<InitCeremonyResponse>)> {
    require_role(&actor, Role::Operator)?;
    let shares = state
        .escrow
        .initialise_platform(&actor, &req.custodians, req.threshold, Utc::now())?;
    let shares = shares
        .into_iter()
        .map(|(custodian, share)| CustodianShare {
            custodian,
            share: share.encode(),
        })
        .collect();
    Ok((
        StatusCode::CREATED,
        Json(InitCeremonyResponse {
            threshold: req.threshold,
            shares,
        }),
    ))
}

/// `POST /escrow/unseal`: open an unseal session.
pub async fn open_unseal<S: SecretStore>(
    State(state): State<AppState<S>>,
    actor: Actor,
) -> ApiResult<(StatusCode, Json<UnsealSessionResponse>)> {
    require_role(&actor, Role::Operator)?;
    let (session_id, threshold, expires_at) = state.escrow.open_unseal_session(
        &state.sessions,
        &actor,
        Utc::now(),
        state.unseal_session_ttl,
    )?;
    Ok((
        StatusCode::CREATED,
        Json(UnsealSessionResponse {
            session_id,
            threshold,
            expires_at,
        }),
    ))
}

/// `POST /escrow/unseal/:session/shares`: a custodian presents their share.
pub async fn present_share<S: SecretStore>(
    State(state): State<AppState<S>>,
    actor: Actor,
    Path(session_id): Path<Uuid>,
    Json(req): Json<PresentShareRequest>,
) -> ApiResult<Json<UnsealProgress>> {
    let share = Zeroizing::new(req.share);
    let status = state
        .escrow
        .present_share(
            &state.sessions,
            session_id,
            &actor,
            &share,
            Utc::now(),
            state.master_session_ttl,
        )
        .await?;
    Ok(Json(UnsealProgress {
        session_id,
        presented: status.presented,
        threshold: status.threshold,
        unsealed: status.unsealed,
    }))
}

/// `GET /health`: liveness and readiness check.
///
/// Returns `200 OK` when the database answers, `503 Service Unavailable`
/// otherwise.
pub async fn health<S: SecretStore>(State(state): State<AppState<S>>) -> Response {
    let database_ready = state.db.ping();
    let platform_initialised = database_ready && state.escrow.is_platform_initialised().unwrap_or(false);

    let (status_code, status_str) = if database_ready {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    let body = HealthResponse {
        status: status_str.into(),
        database_ready,
        platform_initialised,
    };
    (status_code, Json(body)).into_response()
}

/// Catch-all 404 handler.
pub async fn not_found() -> impl IntoResponse {
    let err = ErrorResponse::new("not_found", "the requested resource does not exist");
    (StatusCode::NOT_FOUND, Json(err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_uses_service_status() {
        let resp = ApiError(ServiceError::PolicyViolation("zero-knowledge".into())).into_response();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let resp = ApiError::from(FieldError::NotFound("survey s1".into())).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn role_gate() {
        let op = Actor::new("op", Role::Operator);
        assert!(require_role(&op, Role::Operator).is_ok());
        let owner = Actor::new("o", Role::Owner);
        assert_eq!(require_role(&owner, Role::Operator).unwrap_err().http_status(), 403);
    }
}
