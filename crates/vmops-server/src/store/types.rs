use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Active,
    Inactive,
    Revoked,
}

impl AgentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Revoked => "revoked",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "active" => Some(Self::Active),
            "inactive" => Some(Self::Inactive),
            "revoked" => Some(Self::Revoked),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Agent {
    pub id: String,
    pub tenant_id: String,
    pub owner_user_id: Option<String>,
    pub status: AgentStatus,
    pub last_seen_at: Option<DateTime<Utc>>,
}

impl Agent {
    pub fn is_online(&self, now: DateTime<Utc>, offline_after: chrono::Duration) -> bool {
        self.status == AgentStatus::Active
            && self
                .last_seen_at
                .is_some_and(|seen| now.signed_duration_since(seen) <= offline_after)
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantKind {
    Provisioning,
    Lease,
}

impl GrantKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Provisioning => "provisioning",
            Self::Lease => "lease",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "provisioning" => Some(Self::Provisioning),
            "lease" => Some(Self::Lease),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantStatus {
    Active,
    Used,
    Revoked,
}

impl GrantStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Used => "used",
            Self::Revoked => "revoked",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "active" => Some(Self::Active),
            "used" => Some(Self::Used),
            "revoked" => Some(Self::Revoked),
            _ => None,
        }
    }
}

/// Store-side state of a grant. `token_id` is the `jti` of the only token
/// currently honoured for this principal.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Grant {
    pub kind: GrantKind,
    pub tenant_id: String,
    pub principal_id: String,
    pub user_id: String,
    pub token_id: String,
    pub status: GrantStatus,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Expiring,
    Canceled,
    Expired,
}

impl SubscriptionStatus {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "active" => Some(Self::Active),
            "expiring" => Some(Self::Expiring),
            "canceled" => Some(Self::Canceled),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }

    pub fn is_entitled(self) -> bool {
        matches!(self, Self::Active | Self::Expiring)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct NewProgressEntry {
    pub tenant_id: String,
    pub device_id: String,
    pub step: String,
    pub status: String,
    #[serde(default)]
    pub details: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ProgressEntry {
    pub id: i64,
    pub tenant_id: String,
    pub device_id: String,
    pub step: String,
    pub status: String,
    #[serde(default)]
    pub details: Value,
    pub created_at: DateTime<Utc>,
}
