//! Device bootstrap: provisioning tokens and the setup progress trail.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::info;

use crate::error::ApiError;
use crate::grant::{
    store_unavailable, GrantPolicy, GrantRejection, GrantService, GrantValidation, IssuedGrant,
};
use crate::store::{Grant, GrantKind, GrantStatus, NewProgressEntry, ProgressEntry, Store};
use crate::token::PROVISIONING_TOKEN_TYPE;

pub const DEFAULT_PROVISIONING_TTL: Duration = Duration::from_secs(60 * 60);
pub const MIN_PROVISIONING_TTL: Duration = Duration::from_secs(60);
pub const MAX_PROVISIONING_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Provisioning grants stay live only while the owning user is entitled.
pub struct ProvisioningPolicy;

impl GrantPolicy for ProvisioningPolicy {
    const KIND: GrantKind = GrantKind::Provisioning;
    const TOKEN_TYPE: &'static str = PROVISIONING_TOKEN_TYPE;

    fn check_liveness(
        &self,
        store: &dyn Store,
        grant: &Grant,
        _now: DateTime<Utc>,
    ) -> Result<(), GrantRejection> {
        match store.subscription_status(&grant.tenant_id, &grant.user_id) {
            Ok(Some(status)) if status.is_entitled() => Ok(()),
            Ok(_) => Err(GrantRejection::NoActiveSubscription),
            Err(err) => Err(store_unavailable(err)),
        }
    }
}

/// Where a freshly validated device reports back to.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BootstrapInfo {
    pub vm_uuid: String,
    pub tenant_id: String,
    pub expires_at: DateTime<Utc>,
    pub report_progress_url: String,
    pub complete_url: String,
}

pub struct ProvisioningService {
    grants: GrantService<ProvisioningPolicy>,
    public_base_url: String,
}

impl ProvisioningService {
    pub fn new(store: Arc<dyn Store>, secret: impl Into<Vec<u8>>, public_base_url: &str) -> Self {
        Self {
            grants: GrantService::new(store, secret, ProvisioningPolicy),
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn issue_token(
        &self,
        tenant_id: &str,
        user_id: &str,
        device_id: &str,
        ttl: Option<Duration>,
    ) -> Result<IssuedGrant, ApiError> {
        if device_id.trim().is_empty() {
            return Err(ApiError::bad_request("INVALID_PAYLOAD", "vm_uuid is required"));
        }
        let ttl = ttl
            .unwrap_or(DEFAULT_PROVISIONING_TTL)
            .clamp(MIN_PROVISIONING_TTL, MAX_PROVISIONING_TTL);
        let issued = self
            .grants
            .issue(tenant_id, user_id, device_id, ttl, json!({}))?;
        info!(tenant_id, vm_uuid = device_id, ttl_secs = ttl.as_secs(), "issued provisioning token");
        Ok(issued)
    }

    pub fn validate_token(&self, token: &str, device_id: &str) -> GrantValidation {
        self.grants.validate(token, Some(device_id))
    }

    pub fn bootstrap(&self, grant: &Grant) -> BootstrapInfo {
        BootstrapInfo {
            vm_uuid: grant.principal_id.clone(),
            tenant_id: grant.tenant_id.clone(),
            expires_at: grant.expires_at,
            report_progress_url: format!("{}/provisioning/report-progress", self.public_base_url),
            complete_url: format!("{}/provisioning/complete", self.public_base_url),
        }
    }

    /// Consumes the token. A concurrent revoke or second completion loses.
    pub fn mark_used(&self, token: &str, device_id: &str) -> Result<Grant, GrantRejection> {
        let mut grant = self.validate_token(token, device_id).into_result()?;
        let changed = self
            .grants
            .transition(
                &grant.tenant_id,
                &grant.principal_id,
                &[GrantStatus::Active],
                GrantStatus::Used,
            )
            .map_err(store_unavailable)?;
        if !changed {
            return Err(GrantRejection::Used);
        }
        grant.status = GrantStatus::Used;
        info!(tenant_id = %grant.tenant_id, vm_uuid = device_id, "provisioning completed");
        Ok(grant)
    }

    pub fn revoke_token(&self, token: &str) -> Result<bool, GrantRejection> {
        self.grants.revoke_token(token)
    }

    pub fn revoke_by_device(&self, tenant_id: &str, device_id: &str) -> Result<bool, ApiError> {
        let revoked = self.grants.revoke(tenant_id, device_id)?;
        if revoked {
            info!(tenant_id, vm_uuid = device_id, "revoked provisioning token");
        }
        Ok(revoked)
    }

    pub fn report_progress(
        &self,
        token: &str,
        device_id: &str,
        step: &str,
        status: &str,
        details: Option<Value>,
    ) -> Result<ProgressEntry, ApiError> {
        if step.trim().is_empty() || status.trim().is_empty() {
            return Err(ApiError::bad_request(
                "INVALID_PAYLOAD",
                "step and status are required",
            ));
        }
        let grant = self.validate_token(token, device_id).into_result()?;
        let entry = NewProgressEntry {
            tenant_id: grant.tenant_id,
            device_id: device_id.to_string(),
            step: step.to_string(),
            status: status.to_string(),
            details: details.unwrap_or(Value::Null),
            created_at: Utc::now(),
        };
        Ok(self.grants.store().append_progress(&entry)?)
    }

    pub fn get_progress(&self, tenant_id: &str, device_id: &str) -> Result<Vec<ProgressEntry>, ApiError> {
        Ok(self.grants.store().list_progress(tenant_id, device_id)?)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::store::{MemoryStore, SubscriptionStatus};
    use crate::token::{self, Claims};

    pub(crate) const SECRET: &[u8] = b"provisioning-secret";
    const TENANT: &str = "tenant-a";
    const USER: &str = "user-1";

    fn setup(subscription: Option<SubscriptionStatus>) -> (Arc<MemoryStore>, ProvisioningService) {
        let store = Arc::new(MemoryStore::new());
        if let Some(status) = subscription {
            store.set_subscription(TENANT, USER, status);
        }
        let service = ProvisioningService::new(store.clone(), SECRET, "https://ops.example.com/");
        (store, service)
    }

    fn issue(service: &ProvisioningService) -> String {
        service
            .issue_token(TENANT, USER, "vm-1", None)
            .expect("issued")
            .token
    }

    #[test]
    fn valid_token_yields_bootstrap_urls() {
        let (_, service) = setup(Some(SubscriptionStatus::Active));
        let token = issue(&service);
        let grant = service.validate_token(&token, "vm-1").into_result().unwrap();
        let info = service.bootstrap(&grant);
        assert_eq!(info.vm_uuid, "vm-1");
        assert_eq!(
            info.report_progress_url,
            "https://ops.example.com/provisioning/report-progress"
        );
    }

    #[test]
    fn rejections_carry_distinct_reasons() {
        let (store, service) = setup(Some(SubscriptionStatus::Expiring));
        let token = issue(&service);

        let forged = token::sign(
            Claims::new(PROVISIONING_TOKEN_TYPE, "vm-1", TENANT).with_jti("x"),
            b"wrong",
            Duration::from_secs(60),
        );
        let expired = token::sign(
            Claims::new(PROVISIONING_TOKEN_TYPE, "vm-1", TENANT).with_jti("x"),
            SECRET,
            Duration::ZERO,
        );
        let reason = |token: &str, device: &str| service.validate_token(token, device).reason;

        assert_eq!(reason(&forged, "vm-1"), Some(GrantRejection::BadSignature));
        assert_eq!(reason(&expired, "vm-1"), Some(GrantRejection::Expired));
        assert_eq!(reason(&token, "vm-2"), Some(GrantRejection::PrincipalMismatch));
        assert_eq!(reason("garbage", "vm-1"), Some(GrantRejection::Malformed));
        assert_eq!(reason(&token, "vm-1"), None);

        store.set_subscription(TENANT, USER, SubscriptionStatus::Canceled);
        assert_eq!(
            reason(&token, "vm-1"),
            Some(GrantRejection::NoActiveSubscription)
        );
        store.set_subscription(TENANT, USER, SubscriptionStatus::Active);

        service.mark_used(&token, "vm-1").expect("completes once");
        assert_eq!(reason(&token, "vm-1"), Some(GrantRejection::Used));
        assert_eq!(service.mark_used(&token, "vm-1"), Err(GrantRejection::Used));

        assert!(service.revoke_by_device(TENANT, "vm-1").unwrap());
        assert_eq!(reason(&token, "vm-1"), Some(GrantRejection::Revoked));
    }

    #[test]
    fn missing_subscription_blocks_validation() {
        let (_, service) = setup(None);
        let token = issue(&service);
        assert_eq!(
            service.validate_token(&token, "vm-1").reason,
            Some(GrantRejection::NoActiveSubscription)
        );
    }

    #[test]
    fn progress_requires_valid_token_but_reading_does_not() {
        let (_, service) = setup(Some(SubscriptionStatus::Active));
        let token = issue(&service);

        service
            .report_progress(&token, "vm-1", "download", "started", None)
            .unwrap();
        service
            .report_progress(&token, "vm-1", "download", "done", Some(json!({"bytes": 42})))
            .unwrap();
        let err = service
            .report_progress(&token, "vm-2", "download", "done", None)
            .unwrap_err();
        assert_eq!(err.status, axum::http::StatusCode::UNAUTHORIZED);
        assert_eq!(err.details.as_deref(), Some("principal_mismatch"));

        assert!(service.revoke_token(&token).unwrap());
        assert!(service
            .report_progress(&token, "vm-1", "install", "started", None)
            .is_err());

        let trail = service.get_progress(TENANT, "vm-1").unwrap();
        let statuses: Vec<&str> = trail.iter().map(|e| e.status.as_str()).collect();
        assert_eq!(statuses, vec!["started", "done"]);
        assert_eq!(trail[1].details, json!({"bytes": 42}));
    }
}
