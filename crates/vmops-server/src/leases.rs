use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde_json::{json, Value};
use tracing::info;

use crate::config::chrono_duration;
use crate::error::ApiError;
use crate::grant::{
    store_unavailable, GrantPolicy, GrantRejection, GrantService, GrantValidation, IssuedGrant,
};
use crate::store::{Grant, GrantKind, GrantStatus, Store};
use crate::token::LEASE_TOKEN_TYPE;

pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(300);
pub const MIN_LEASE_TTL: Duration = Duration::from_secs(10);
pub const MAX_LEASE_TTL: Duration = Duration::from_secs(86_400);

/// Leases die when their holder stops heartbeating.
pub struct LeasePolicy {
    heartbeat_timeout: chrono::Duration,
}

impl LeasePolicy {
    pub fn new(heartbeat_timeout: Duration) -> Self {
        Self {
            heartbeat_timeout: chrono_duration(heartbeat_timeout),
        }
    }
}

impl GrantPolicy for LeasePolicy {
    const KIND: GrantKind = GrantKind::Lease;
    const TOKEN_TYPE: &'static str = LEASE_TOKEN_TYPE;
    const TRACKS_HEARTBEAT: bool = true;

    fn check_liveness(
        &self,
        _store: &dyn Store,
        grant: &Grant,
        now: DateTime<Utc>,
    ) -> Result<(), GrantRejection> {
        let fresh = grant
            .last_heartbeat_at
            .is_some_and(|at| now.signed_duration_since(at) <= self.heartbeat_timeout);
        if fresh {
            Ok(())
        } else {
            Err(GrantRejection::HeartbeatStale)
        }
    }
}

pub struct LeaseService {
    grants: GrantService<LeasePolicy>,
}

impl LeaseService {
    pub fn new(store: Arc<dyn Store>, secret: impl Into<Vec<u8>>, heartbeat_timeout: Duration) -> Self {
        Self {
            grants: GrantService::new(store, secret, LeasePolicy::new(heartbeat_timeout)),
        }
    }

    pub fn issue_lease(
        &self,
        tenant_id: &str,
        user_id: &str,
        capability: &str,
        ttl: Option<Duration>,
    ) -> Result<IssuedGrant, ApiError> {
        if capability.trim().is_empty() {
            return Err(ApiError::bad_request("INVALID_PAYLOAD", "capability is required"));
        }
        let ttl = ttl
            .unwrap_or(DEFAULT_LEASE_TTL)
            .clamp(MIN_LEASE_TTL, MAX_LEASE_TTL);
        let lease_id = new_lease_id();
        let issued = self.grants.issue(
            tenant_id,
            user_id,
            &lease_id,
            ttl,
            json!({ "capability": capability, "ttl_secs": ttl.as_secs() }),
        )?;
        info!(tenant_id, lease_id = %lease_id, capability, "issued lease");
        Ok(issued)
    }

    pub fn validate_lease(&self, token: &str) -> GrantValidation {
        self.grants.validate(token, None)
    }

    /// Extends a live lease by its original ttl and hands back a re-minted
    /// token whose `exp` matches the new expiry. The presented token is
    /// superseded.
    pub fn heartbeat(&self, token: &str) -> Result<IssuedGrant, GrantRejection> {
        let grant = self.validate_lease(token).into_result()?;
        let ttl = grant
            .metadata
            .get("ttl_secs")
            .and_then(Value::as_u64)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_LEASE_TTL);
        if let Some(renewed) = self.grants.renew(&grant, ttl).map_err(store_unavailable)? {
            return Ok(renewed);
        }

        // Lost the race to a revoke or a concurrent heartbeat.
        let current = self
            .grants
            .store()
            .find_grant(GrantKind::Lease, &grant.tenant_id, &grant.principal_id)
            .map_err(store_unavailable)?;
        Err(match current {
            Some(current) if current.status == GrantStatus::Active => GrantRejection::Superseded,
            Some(_) => GrantRejection::Revoked,
            None => GrantRejection::NotFound,
        })
    }

    pub fn find_lease(&self, tenant_id: &str, lease_id: &str) -> Result<Option<Grant>, ApiError> {
        Ok(self.grants.store().find_grant(GrantKind::Lease, tenant_id, lease_id)?)
    }

    pub fn revoke_lease(&self, tenant_id: &str, lease_id: &str) -> Result<bool, ApiError> {
        let revoked = self.grants.revoke(tenant_id, lease_id)?;
        if revoked {
            info!(tenant_id, lease_id, "revoked lease");
        }
        Ok(revoked)
    }
}

fn new_lease_id() -> String {
    let mut rng = rand::thread_rng();
    format!("lease-{:08x}{:08x}", rng.r#gen::<u32>(), rng.r#gen::<u32>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::token;

    const TENANT: &str = "tenant-a";

    fn setup() -> (Arc<MemoryStore>, LeaseService) {
        let store = Arc::new(MemoryStore::new());
        let service = LeaseService::new(store.clone(), b"lease-secret".to_vec(), Duration::from_secs(90));
        (store, service)
    }

    #[test]
    fn issued_lease_records_capability_and_heartbeat() {
        let (_, leases) = setup();
        let issued = leases
            .issue_lease(TENANT, "user-1", "gpu", Some(Duration::from_secs(120)))
            .unwrap();
        assert!(issued.grant.principal_id.starts_with("lease-"));
        assert_eq!(issued.grant.metadata["capability"], "gpu");
        assert!(issued.grant.last_heartbeat_at.is_some());
        assert!(leases.validate_lease(&issued.token).valid);
    }

    #[test]
    fn heartbeat_extends_expiry() {
        let (_, leases) = setup();
        let issued = leases
            .issue_lease(TENANT, "user-1", "gpu", Some(Duration::from_secs(10)))
            .unwrap();
        let old_claims = token::verify(&issued.token, b"lease-secret", LEASE_TOKEN_TYPE).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(1100));

        let renewed = leases.heartbeat(&issued.token).unwrap();
        assert_eq!(renewed.grant.principal_id, issued.grant.principal_id);
        assert!(renewed.grant.expires_at > issued.grant.expires_at);
        assert!(renewed.grant.last_heartbeat_at > issued.grant.last_heartbeat_at);

        // the new token outlives the old one and tracks the row's expiry
        let new_claims = token::verify(&renewed.token, b"lease-secret", LEASE_TOKEN_TYPE).unwrap();
        assert!(new_claims.exp > old_claims.exp);
        assert!((new_claims.exp - renewed.grant.expires_at.timestamp()).abs() <= 1);
        assert_eq!(new_claims.jti.as_deref(), Some(renewed.grant.token_id.as_str()));

        assert!(leases.validate_lease(&renewed.token).valid);
        assert_eq!(
            leases.validate_lease(&issued.token).reason,
            Some(GrantRejection::Superseded)
        );
        assert_eq!(leases.heartbeat(&issued.token), Err(GrantRejection::Superseded));
    }

    #[test]
    fn chained_heartbeats_keep_lease_alive() {
        let (_, leases) = setup();
        let issued = leases.issue_lease(TENANT, "user-1", "gpu", None).unwrap();
        let first = leases.heartbeat(&issued.token).unwrap();
        let second = leases.heartbeat(&first.token).unwrap();
        assert!(leases.validate_lease(&second.token).valid);
        assert_eq!(
            leases.validate_lease(&first.token).reason,
            Some(GrantRejection::Superseded)
        );
    }

    #[test]
    fn stale_heartbeat_invalidates_lease() {
        let (store, leases) = setup();
        let issued = leases.issue_lease(TENANT, "user-1", "gpu", None).unwrap();
        store.backdate_grant_heartbeat(
            GrantKind::Lease,
            TENANT,
            &issued.grant.principal_id,
            chrono::Duration::seconds(91),
        );
        assert_eq!(
            leases.validate_lease(&issued.token).reason,
            Some(GrantRejection::HeartbeatStale)
        );
        assert_eq!(leases.heartbeat(&issued.token), Err(GrantRejection::HeartbeatStale));
    }

    #[test]
    fn revoked_lease_cannot_heartbeat() {
        let (_, leases) = setup();
        let issued = leases.issue_lease(TENANT, "user-1", "gpu", None).unwrap();
        assert!(leases.revoke_lease(TENANT, &issued.grant.principal_id).unwrap());
        assert!(!leases.revoke_lease(TENANT, &issued.grant.principal_id).unwrap());
        assert_eq!(leases.heartbeat(&issued.token), Err(GrantRejection::Revoked));

        let stored = leases
            .find_lease(TENANT, &issued.grant.principal_id)
            .unwrap()
            .expect("row kept");
        assert_eq!(stored.status, GrantStatus::Revoked);
    }
}
