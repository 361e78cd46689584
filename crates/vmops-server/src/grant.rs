//! Time-bounded grants backed by a signed token and a store row.
//!
//! A token alone is never enough: the row must exist, be `active`, be
//! unexpired, carry the token's `jti`, and pass the kind-specific liveness
//! check. Validation never errors; it reports why a grant was refused.

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::chrono_duration;
use crate::error::ApiError;
use crate::store::{Grant, GrantKind, GrantRenewal, GrantStatus, Store, StoreError};
use crate::token::{self, Claims, TokenRejection};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantRejection {
    Malformed,
    BadSignature,
    UnsupportedAlgorithm,
    WrongType,
    Expired,
    PrincipalMismatch,
    NotFound,
    Superseded,
    Revoked,
    Used,
    NoActiveSubscription,
    HeartbeatStale,
    StoreUnavailable,
}

impl GrantRejection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Malformed => "malformed",
            Self::BadSignature => "bad_signature",
            Self::UnsupportedAlgorithm => "unsupported_algorithm",
            Self::WrongType => "wrong_type",
            Self::Expired => "expired",
            Self::PrincipalMismatch => "principal_mismatch",
            Self::NotFound => "not_found",
            Self::Superseded => "superseded",
            Self::Revoked => "revoked",
            Self::Used => "used",
            Self::NoActiveSubscription => "no_active_subscription",
            Self::HeartbeatStale => "heartbeat_stale",
            Self::StoreUnavailable => "store_unavailable",
        }
    }
}

impl From<TokenRejection> for GrantRejection {
    fn from(rejection: TokenRejection) -> Self {
        match rejection {
            TokenRejection::Malformed => Self::Malformed,
            TokenRejection::BadSignature => Self::BadSignature,
            TokenRejection::UnsupportedAlgorithm => Self::UnsupportedAlgorithm,
            TokenRejection::WrongType => Self::WrongType,
            TokenRejection::Expired => Self::Expired,
        }
    }
}

impl From<GrantRejection> for ApiError {
    fn from(rejection: GrantRejection) -> Self {
        let (status, code) = match rejection {
            GrantRejection::StoreUnavailable => (StatusCode::SERVICE_UNAVAILABLE, "STORE_UNAVAILABLE"),
            _ => (StatusCode::UNAUTHORIZED, "GRANT_REJECTED"),
        };
        ApiError::new(status, code, "grant token rejected").with_details(rejection.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GrantValidation {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<GrantRejection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grant: Option<Grant>,
}

impl GrantValidation {
    fn accepted(grant: Grant) -> Self {
        Self {
            valid: true,
            reason: None,
            grant: Some(grant),
        }
    }

    fn rejected(reason: GrantRejection) -> Self {
        Self {
            valid: false,
            reason: Some(reason),
            grant: None,
        }
    }

    pub fn into_result(self) -> Result<Grant, GrantRejection> {
        match (self.valid, self.grant, self.reason) {
            (true, Some(grant), _) => Ok(grant),
            (_, _, Some(reason)) => Err(reason),
            _ => Err(GrantRejection::NotFound),
        }
    }
}

/// What distinguishes one grant kind from another.
pub trait GrantPolicy: Send + Sync {
    const KIND: GrantKind;
    const TOKEN_TYPE: &'static str;

    /// Whether `last_heartbeat_at` is stamped at issue time.
    const TRACKS_HEARTBEAT: bool = false;

    /// Kind-specific check run after the generic ones pass.
    fn check_liveness(
        &self,
        store: &dyn Store,
        grant: &Grant,
        now: DateTime<Utc>,
    ) -> Result<(), GrantRejection>;
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct IssuedGrant {
    pub token: String,
    pub grant: Grant,
}

pub struct GrantService<P> {
    store: Arc<dyn Store>,
    secret: Vec<u8>,
    policy: P,
}

impl<P: GrantPolicy> GrantService<P> {
    pub fn new(store: Arc<dyn Store>, secret: impl Into<Vec<u8>>, policy: P) -> Self {
        Self {
            store,
            secret: secret.into(),
            policy,
        }
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    /// Mints a fresh token and replaces any previous grant for the principal.
    pub fn issue(
        &self,
        tenant_id: &str,
        user_id: &str,
        principal_id: &str,
        ttl: Duration,
        metadata: Value,
    ) -> Result<IssuedGrant, StoreError> {
        let token_id = new_token_id();
        let claims = Claims::new(P::TOKEN_TYPE, principal_id, tenant_id)
            .with_user(user_id)
            .with_jti(token_id.clone());
        let token = token::sign(claims, &self.secret, ttl);

        let now = Utc::now();
        let grant = Grant {
            kind: P::KIND,
            tenant_id: tenant_id.to_string(),
            principal_id: principal_id.to_string(),
            user_id: user_id.to_string(),
            token_id,
            status: GrantStatus::Active,
            issued_at: now,
            expires_at: now + chrono_duration(ttl),
            last_heartbeat_at: P::TRACKS_HEARTBEAT.then_some(now),
            metadata,
        };
        self.store.upsert_grant(&grant)?;
        debug!(
            kind = P::KIND.as_str(),
            tenant_id,
            principal_id,
            ttl_secs = ttl.as_secs(),
            "issued grant"
        );
        Ok(IssuedGrant { token, grant })
    }

    /// Moves a live grant onto a freshly minted token valid for `ttl` from
    /// now. Returns `None` when the grant changed since `grant` was read.
    pub fn renew(&self, grant: &Grant, ttl: Duration) -> Result<Option<IssuedGrant>, StoreError> {
        let token_id = new_token_id();
        let claims = Claims::new(P::TOKEN_TYPE, &grant.principal_id, &grant.tenant_id)
            .with_user(&grant.user_id)
            .with_jti(token_id.clone());
        let token = token::sign(claims, &self.secret, ttl);

        let now = Utc::now();
        let expires_at = now + chrono_duration(ttl);
        let renewed = self.store.renew_grant(
            P::KIND,
            &grant.tenant_id,
            &grant.principal_id,
            &GrantRenewal {
                previous_token_id: &grant.token_id,
                token_id: &token_id,
                at: now,
                expires_at,
            },
        )?;
        if !renewed {
            return Ok(None);
        }
        debug!(
            kind = P::KIND.as_str(),
            tenant_id = %grant.tenant_id,
            principal_id = %grant.principal_id,
            ttl_secs = ttl.as_secs(),
            "renewed grant"
        );
        Ok(Some(IssuedGrant {
            token,
            grant: Grant {
                token_id,
                expires_at,
                last_heartbeat_at: Some(now),
                ..grant.clone()
            },
        }))
    }

    /// Checks the token and its grant row. `expected_principal` pins the
    /// token's subject when the caller names one.
    pub fn validate(&self, token: &str, expected_principal: Option<&str>) -> GrantValidation {
        match self.check(token, expected_principal) {
            Ok(grant) => GrantValidation::accepted(grant),
            Err(reason) => {
                debug!(kind = P::KIND.as_str(), reason = reason.as_str(), "grant rejected");
                GrantValidation::rejected(reason)
            }
        }
    }

    fn check(&self, token: &str, expected_principal: Option<&str>) -> Result<Grant, GrantRejection> {
        let claims = token::verify(token, &self.secret, P::TOKEN_TYPE)?;
        if let Some(expected) = expected_principal {
            if claims.sub != expected {
                return Err(GrantRejection::PrincipalMismatch);
            }
        }

        let grant = self
            .store
            .find_grant(P::KIND, &claims.tenant_id, &claims.sub)
            .map_err(store_unavailable)?
            .ok_or(GrantRejection::NotFound)?;
        if claims.jti.as_deref() != Some(grant.token_id.as_str()) {
            return Err(GrantRejection::Superseded);
        }
        match grant.status {
            GrantStatus::Active => {}
            GrantStatus::Revoked => return Err(GrantRejection::Revoked),
            GrantStatus::Used => return Err(GrantRejection::Used),
        }

        let now = Utc::now();
        if grant.expires_at <= now {
            return Err(GrantRejection::Expired);
        }
        self.policy.check_liveness(self.store.as_ref(), &grant, now)?;
        Ok(grant)
    }

    /// Moves the grant to `to` if it is currently in one of `from`.
    pub fn transition(
        &self,
        tenant_id: &str,
        principal_id: &str,
        from: &[GrantStatus],
        to: GrantStatus,
    ) -> Result<bool, StoreError> {
        let changed = self
            .store
            .update_grant_status(P::KIND, tenant_id, principal_id, from, to)?;
        if changed {
            debug!(kind = P::KIND.as_str(), tenant_id, principal_id, to = to.as_str(), "grant status changed");
        }
        Ok(changed)
    }

    /// Revokes the grant a token refers to, provided the token is authentic
    /// and still the current one for its principal.
    pub fn revoke_token(&self, token: &str) -> Result<bool, GrantRejection> {
        let claims = token::verify(token, &self.secret, P::TOKEN_TYPE)?;
        let grant = self
            .store
            .find_grant(P::KIND, &claims.tenant_id, &claims.sub)
            .map_err(store_unavailable)?
            .ok_or(GrantRejection::NotFound)?;
        if claims.jti.as_deref() != Some(grant.token_id.as_str()) {
            return Err(GrantRejection::Superseded);
        }
        self.transition(
            &claims.tenant_id,
            &claims.sub,
            &[GrantStatus::Active, GrantStatus::Used],
            GrantStatus::Revoked,
        )
        .map_err(store_unavailable)
    }

    pub fn revoke(&self, tenant_id: &str, principal_id: &str) -> Result<bool, StoreError> {
        self.transition(
            tenant_id,
            principal_id,
            &[GrantStatus::Active, GrantStatus::Used],
            GrantStatus::Revoked,
        )
    }
}

pub(crate) fn store_unavailable(err: StoreError) -> GrantRejection {
    warn!(error = %err, "grant store lookup failed");
    GrantRejection::StoreUnavailable
}

fn new_token_id() -> String {
    let mut rng = rand::thread_rng();
    format!("{:016x}{:016x}", rng.r#gen::<u64>(), rng.r#gen::<u64>())
}
