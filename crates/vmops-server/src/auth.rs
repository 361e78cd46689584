use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::StatusCode;
use tracing::debug;

use crate::error::ApiError;
use crate::token::{self, ACCESS_TOKEN_TYPE};
use crate::State;

pub const ADMIN_ROLE: &str = "admin";
pub const AGENT_ROLE: &str = "agent";

/// Authenticated principal behind an HTTP request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Caller {
    pub tenant_id: String,
    pub user_id: String,
    pub roles: Vec<String>,
}

impl Caller {
    pub fn new(tenant_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            user_id: user_id.into(),
            roles: Vec::new(),
        }
    }

    pub fn with_role(mut self, role: &str) -> Self {
        self.roles.push(role.to_string());
        self
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    pub fn is_privileged(&self) -> bool {
        self.has_role(ADMIN_ROLE)
    }

    /// Agents authenticate as themselves: their user id is the agent id.
    pub fn agent_id(&self) -> Option<&str> {
        self.has_role(AGENT_ROLE).then_some(self.user_id.as_str())
    }

    pub fn require_agent(&self) -> Result<&str, ApiError> {
        self.agent_id()
            .ok_or_else(|| ApiError::forbidden("AGENT_ONLY", "only agents may call this route"))
    }

    pub fn require_operator(&self) -> Result<(), ApiError> {
        if self.agent_id().is_some() {
            return Err(ApiError::forbidden(
                "OPERATOR_ONLY",
                "agents may not call this route",
            ));
        }
        Ok(())
    }

    pub fn require_privileged(&self) -> Result<(), ApiError> {
        if !self.is_privileged() {
            return Err(ApiError::forbidden(
                "PRIVILEGED_ONLY",
                "this route requires the admin role",
            ));
        }
        Ok(())
    }
}

/// Resolves `Authorization: Bearer <access token>` headers into callers.
pub struct Authenticator {
    secret: Vec<u8>,
}

impl Authenticator {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    pub fn authenticate(&self, authorization: Option<&str>) -> Result<Caller, ApiError> {
        let raw = authorization.ok_or_else(|| {
            ApiError::unauthorized("MISSING_TOKEN", "authorization header is required")
        })?;
        let token = raw
            .strip_prefix("Bearer ")
            .or_else(|| raw.strip_prefix("bearer "))
            .ok_or_else(|| {
                ApiError::unauthorized("MISSING_TOKEN", "expected a bearer token")
            })?;

        let claims = token::verify(token, &self.secret, ACCESS_TOKEN_TYPE).map_err(|rejection| {
            debug!(reason = rejection.as_str(), "access token rejected");
            ApiError::unauthorized("INVALID_TOKEN", "access token rejected")
                .with_details(rejection.as_str())
        })?;

        Ok(Caller {
            tenant_id: claims.tenant_id,
            user_id: claims.user_id.unwrap_or(claims.sub),
            roles: claims.roles,
        })
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let state = parts.extensions.get::<State>().ok_or_else(|| {
            ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "MISSING_STATE",
                "application state is not installed",
            )
        })?;
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok());
        state.auth.authenticate(header)
    }
}
