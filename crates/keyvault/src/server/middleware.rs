//! Request-level concerns shared by all routes: timeout and caller identity.
//!
//! Authentication happens upstream; the gateway forwards the principal id
//! and role in two configurable headers which are trusted as-is.

use std::time::Duration;

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::{request::Parts, HeaderMap, HeaderName};
use common::ServiceError;

use super::handlers::ApiError;
use super::state::AppState;
use crate::actor::{Actor, Role};
use crate::secret_store::SecretStore;

/// Default per-request timeout applied to all routes.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Names of the identity headers.
#[derive(Debug, Clone)]
pub struct ActorHeaders {
    pub actor: HeaderName,
    pub role: HeaderName,
}

impl ActorHeaders {
    /// # Errors
    ///
    /// Returns an error if either name is not a valid HTTP header name.
    pub fn new(actor: &str, role: &str) -> anyhow::Result<Self> {
        Ok(Self {
            actor: HeaderName::from_bytes(actor.as_bytes())?,
            role: HeaderName::from_bytes(role.as_bytes())?,
        })
    }
}

impl Default for ActorHeaders {
    fn default() -> Self {
        Self {
            actor: HeaderName::from_static("x-actor-id"),
            role: HeaderName::from_static("x-actor-role"),
        }
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Result<&'a str, ServiceError> {
    let value = headers
        .get(name)
        .ok_or_else(|| ServiceError::BadRequest(format!("missing {name} header")))?;
    let value = value
        .to_str()
        .map_err(|_| ServiceError::BadRequest(format!("{name} header contains non-ASCII characters")))?
        .trim();
    if value.is_empty() {
        return Err(ServiceError::BadRequest(format!("{name} header is empty")));
    }
    Ok(value)
}

/// Resolve the calling [`Actor`] from the identity headers.
///
/// The `system` role is internal and refused when claimed by a caller.
pub fn actor_from_headers(headers: &HeaderMap, names: &ActorHeaders) -> Result<Actor, ServiceError> {
    let id = header(headers, &names.actor)?;
    let role = header(headers, &names.role)?;
    let role = Role::parse(role)
        .ok_or_else(|| ServiceError::BadRequest(format!("unknown role {role:?}")))?;
    if role == Role::System {
        return Err(ServiceError::Forbidden("the system role is not available to callers".into()));
    }
    Ok(Actor::new(id, role))
}

#[async_trait]
impl<S: SecretStore> FromRequestParts<AppState<S>> for Actor {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState<S>) -> Result<Self, Self::Rejection> {
        Ok(actor_from_headers(&parts.headers, &state.headers)?)
    }
}
