//! Record store abstraction.
//!
//! The control plane treats the relational store as the source of truth. Every
//! mutation that can race (command transitions, grant status changes) is
//! expressed as a conditional update so callers never hold locks across calls.

use chrono::{DateTime, Utc};
use thiserror::Error;
use vmops_control_plane::{Command, CommandStatus, CommandType};

pub mod memory;
pub mod types;

pub use self::memory::MemoryStore;
pub use self::types::*;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The backend could not be reached (pool exhausted, connection refused).
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The backend rejected or failed a query.
    #[error("database error: {0}")]
    Database(String),

    /// A stored row could not be decoded into a domain record.
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Memory,
    Postgres,
}

impl Backend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Postgres => "postgres",
        }
    }
}

/// Lookup for an equivalent read-only command inside the dedupe window.
#[derive(Debug, Clone)]
pub struct DuplicateQuery<'a> {
    pub tenant_id: &'a str,
    pub agent_id: &'a str,
    pub created_by: &'a str,
    pub command_type: CommandType,
    pub dedupe_key: &'a str,
    pub since: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CommandFilter<'a> {
    pub tenant_id: &'a str,
    pub agent_id: &'a str,
    pub status: Option<CommandStatus>,
    pub created_by: Option<&'a str>,
    pub limit: usize,
}

/// Fields written alongside a status transition.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub status: CommandStatus,
    pub at: DateTime<Utc>,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
}

impl StatusChange {
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        (self.status == CommandStatus::Running).then_some(self.at)
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.status.is_terminal().then_some(self.at)
    }
}

/// A heartbeat that moves a grant onto a freshly minted token.
#[derive(Debug, Clone, PartialEq)]
pub struct GrantRenewal<'a> {
    pub previous_token_id: &'a str,
    pub token_id: &'a str,
    pub at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

pub trait Store: Send + Sync {
    fn backend(&self) -> Backend;

    /// Inserts or updates an agent. Registration normally happens elsewhere;
    /// the server only uses this to seed agents at startup.
    fn register_agent(&self, agent: &Agent) -> Result<(), StoreError>;

    fn find_agent(&self, tenant_id: &str, agent_id: &str) -> Result<Option<Agent>, StoreError>;

    /// Records agent contact. Returns false when the agent is unknown.
    fn touch_agent(
        &self,
        tenant_id: &str,
        agent_id: &str,
        seen_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    fn insert_command(&self, command: &Command, dedupe_key: Option<&str>) -> Result<(), StoreError>;

    fn find_command(&self, tenant_id: &str, command_id: &str) -> Result<Option<Command>, StoreError>;

    /// Most recent command matching the query that is either queued since
    /// `since` or succeeded since `since`.
    fn find_recent_duplicate(&self, query: &DuplicateQuery<'_>) -> Result<Option<Command>, StoreError>;

    fn oldest_queued_command(
        &self,
        tenant_id: &str,
        agent_id: &str,
    ) -> Result<Option<Command>, StoreError>;

    /// Applies `change` only if the command is still in `expected`. Returns the
    /// updated command, or `None` when the guard matched nothing.
    fn transition_command(
        &self,
        tenant_id: &str,
        command_id: &str,
        expected: CommandStatus,
        change: &StatusChange,
    ) -> Result<Option<Command>, StoreError>;

    /// Newest first.
    fn list_commands(&self, filter: &CommandFilter<'_>) -> Result<Vec<Command>, StoreError>;

    /// Queued commands whose expiry is at or before `now`, oldest first.
    fn expired_queued_commands(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Command>, StoreError>;

    /// Inserts or replaces the grant for (kind, tenant, principal).
    fn upsert_grant(&self, grant: &Grant) -> Result<(), StoreError>;

    fn find_grant(
        &self,
        kind: GrantKind,
        tenant_id: &str,
        principal_id: &str,
    ) -> Result<Option<Grant>, StoreError>;

    /// Moves a grant to `to` if its current status is one of `from`.
    fn update_grant_status(
        &self,
        kind: GrantKind,
        tenant_id: &str,
        principal_id: &str,
        from: &[GrantStatus],
        to: GrantStatus,
    ) -> Result<bool, StoreError>;

    /// Applies a renewal to an active grant whose current token is still
    /// `renewal.previous_token_id`. Returns false when either no longer holds.
    fn renew_grant(
        &self,
        kind: GrantKind,
        tenant_id: &str,
        principal_id: &str,
        renewal: &GrantRenewal<'_>,
    ) -> Result<bool, StoreError>;

    fn subscription_status(
        &self,
        tenant_id: &str,
        user_id: &str,
    ) -> Result<Option<SubscriptionStatus>, StoreError>;

    fn append_progress(&self, entry: &NewProgressEntry) -> Result<ProgressEntry, StoreError>;

    /// Oldest first.
    fn list_progress(&self, tenant_id: &str, device_id: &str)
        -> Result<Vec<ProgressEntry>, StoreError>;
}
