//! In-memory implementation of [`Store`].
//!
//! Non-persistent: everything is lost when the process exits. Used by the
//! test suite and by local runs without `DATABASE_URL`. A single write lock
//! makes each conditional update atomic, matching row-level atomicity in
//! PostgreSQL.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use vmops_control_plane::{Command, CommandStatus};

use super::{
    Agent, Backend, CommandFilter, DuplicateQuery, Grant, GrantKind, GrantRenewal, GrantStatus,
    NewProgressEntry, ProgressEntry, StatusChange, Store, StoreError, SubscriptionStatus,
};

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    agents: HashMap<(String, String), Agent>,
    commands: HashMap<String, StoredCommand>,
    next_command_seq: u64,
    grants: HashMap<(GrantKind, String, String), Grant>,
    subscriptions: HashMap<(String, String), SubscriptionStatus>,
    progress: Vec<ProgressEntry>,
}

struct StoredCommand {
    seq: u64,
    command: Command,
    dedupe_key: Option<String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_agent(&self, agent: Agent) {
        let key = (agent.tenant_id.clone(), agent.id.clone());
        self.inner.write().agents.insert(key, agent);
    }

    #[cfg(test)]
    pub fn set_subscription(&self, tenant_id: &str, user_id: &str, status: SubscriptionStatus) {
        self.inner
            .write()
            .subscriptions
            .insert((tenant_id.to_string(), user_id.to_string()), status);
    }

    /// Shifts every timestamp of a command into the past.
    #[cfg(test)]
    pub fn backdate_command(&self, command_id: &str, by: chrono::Duration) {
        let mut inner = self.inner.write();
        if let Some(stored) = inner.commands.get_mut(command_id) {
            let command = &mut stored.command;
            command.queued_at -= by;
            command.expires_at -= by;
            command.started_at = command.started_at.map(|at| at - by);
            command.completed_at = command.completed_at.map(|at| at - by);
        }
    }

    #[cfg(test)]
    pub fn backdate_grant_heartbeat(
        &self,
        kind: GrantKind,
        tenant_id: &str,
        principal_id: &str,
        by: chrono::Duration,
    ) {
        let mut inner = self.inner.write();
        let key = (kind, tenant_id.to_string(), principal_id.to_string());
        if let Some(grant) = inner.grants.get_mut(&key) {
            grant.last_heartbeat_at = grant.last_heartbeat_at.map(|at| at - by);
        }
    }
}

impl Store for MemoryStore {
    fn backend(&self) -> Backend {
        Backend::Memory
    }

    fn register_agent(&self, agent: &Agent) -> Result<(), StoreError> {
        self.upsert_agent(agent.clone());
        Ok(())
    }

    fn find_agent(&self, tenant_id: &str, agent_id: &str) -> Result<Option<Agent>, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .agents
            .get(&(tenant_id.to_string(), agent_id.to_string()))
            .cloned())
    }

    fn touch_agent(
        &self,
        tenant_id: &str,
        agent_id: &str,
        seen_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write();
        match inner
            .agents
            .get_mut(&(tenant_id.to_string(), agent_id.to_string()))
        {
            Some(agent) => {
                agent.last_seen_at = Some(seen_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn insert_command(&self, command: &Command, dedupe_key: Option<&str>) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if inner.commands.contains_key(&command.id) {
            return Err(StoreError::Database(format!(
                "duplicate command id {}",
                command.id
            )));
        }
        inner.next_command_seq += 1;
        let seq = inner.next_command_seq;
        inner.commands.insert(
            command.id.clone(),
            StoredCommand {
                seq,
                command: command.clone(),
                dedupe_key: dedupe_key.map(str::to_string),
            },
        );
        Ok(())
    }

    fn find_command(&self, tenant_id: &str, command_id: &str) -> Result<Option<Command>, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .commands
            .get(command_id)
            .map(|stored| &stored.command)
            .filter(|command| command.tenant_id == tenant_id)
            .cloned())
    }

    fn find_recent_duplicate(&self, query: &DuplicateQuery<'_>) -> Result<Option<Command>, StoreError> {
        let inner = self.inner.read();
        let found = inner
            .commands
            .values()
            .filter(|stored| stored.dedupe_key.as_deref() == Some(query.dedupe_key))
            .filter(|stored| {
                let command = &stored.command;
                command.tenant_id == query.tenant_id
                    && command.agent_id == query.agent_id
                    && command.created_by == query.created_by
                    && command.command_type == query.command_type
            })
            .filter(|stored| {
                let command = &stored.command;
                match command.status {
                    CommandStatus::Queued => command.queued_at >= query.since,
                    CommandStatus::Succeeded => {
                        command.completed_at.is_some_and(|at| at >= query.since)
                    }
                    _ => false,
                }
            })
            .max_by_key(|stored| stored.seq)
            .map(|stored| stored.command.clone());
        Ok(found)
    }

    fn oldest_queued_command(
        &self,
        tenant_id: &str,
        agent_id: &str,
    ) -> Result<Option<Command>, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .commands
            .values()
            .filter(|stored| {
                let command = &stored.command;
                command.tenant_id == tenant_id
                    && command.agent_id == agent_id
                    && command.status == CommandStatus::Queued
            })
            .min_by_key(|stored| (stored.command.queued_at, stored.seq))
            .map(|stored| stored.command.clone()))
    }

    fn transition_command(
        &self,
        tenant_id: &str,
        command_id: &str,
        expected: CommandStatus,
        change: &StatusChange,
    ) -> Result<Option<Command>, StoreError> {
        let mut inner = self.inner.write();
        let Some(stored) = inner.commands.get_mut(command_id) else {
            return Ok(None);
        };
        let command = &mut stored.command;
        if command.tenant_id != tenant_id || command.status != expected {
            return Ok(None);
        }
        command.status = change.status;
        if let Some(started_at) = change.started_at() {
            command.started_at = Some(started_at);
        }
        if let Some(completed_at) = change.completed_at() {
            command.completed_at = Some(completed_at);
        }
        if change.result.is_some() {
            command.result = change.result.clone();
        }
        if change.error_message.is_some() {
            command.error_message = change.error_message.clone();
        }
        Ok(Some(command.clone()))
    }

    fn list_commands(&self, filter: &CommandFilter<'_>) -> Result<Vec<Command>, StoreError> {
        let inner = self.inner.read();
        let mut matching: Vec<&StoredCommand> = inner
            .commands
            .values()
            .filter(|stored| {
                let command = &stored.command;
                command.tenant_id == filter.tenant_id
                    && command.agent_id == filter.agent_id
                    && filter.status.map_or(true, |status| command.status == status)
                    && filter
                        .created_by
                        .map_or(true, |creator| command.created_by == creator)
            })
            .collect();
        matching.sort_by(|a, b| {
            b.command
                .queued_at
                .cmp(&a.command.queued_at)
                .then(b.seq.cmp(&a.seq))
        });
        Ok(matching
            .into_iter()
            .take(filter.limit)
            .map(|stored| stored.command.clone())
            .collect())
    }

    fn expired_queued_commands(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Command>, StoreError> {
        let inner = self.inner.read();
        let mut expired: Vec<&StoredCommand> = inner
            .commands
            .values()
            .filter(|stored| stored.command.is_expired(now))
            .collect();
        expired.sort_by_key(|stored| (stored.command.expires_at, stored.seq));
        Ok(expired
            .into_iter()
            .take(limit)
            .map(|stored| stored.command.clone())
            .collect())
    }

    fn upsert_grant(&self, grant: &Grant) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let key = (
            grant.kind,
            grant.tenant_id.clone(),
            grant.principal_id.clone(),
        );
        inner.grants.insert(key, grant.clone());
        Ok(())
    }

    fn find_grant(
        &self,
        kind: GrantKind,
        tenant_id: &str,
        principal_id: &str,
    ) -> Result<Option<Grant>, StoreError> {
        let inner = self.inner.read();
        let key = (kind, tenant_id.to_string(), principal_id.to_string());
        Ok(inner.grants.get(&key).cloned())
    }

    fn update_grant_status(
        &self,
        kind: GrantKind,
        tenant_id: &str,
        principal_id: &str,
        from: &[GrantStatus],
        to: GrantStatus,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write();
        let key = (kind, tenant_id.to_string(), principal_id.to_string());
        match inner.grants.get_mut(&key) {
            Some(grant) if from.contains(&grant.status) => {
                grant.status = to;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn renew_grant(
        &self,
        kind: GrantKind,
        tenant_id: &str,
        principal_id: &str,
        renewal: &GrantRenewal<'_>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write();
        let key = (kind, tenant_id.to_string(), principal_id.to_string());
        match inner.grants.get_mut(&key) {
            Some(grant)
                if grant.status == GrantStatus::Active
                    && grant.token_id == renewal.previous_token_id =>
            {
                grant.token_id = renewal.token_id.to_string();
                grant.last_heartbeat_at = Some(renewal.at);
                grant.expires_at = renewal.expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn subscription_status(
        &self,
        tenant_id: &str,
        user_id: &str,
    ) -> Result<Option<SubscriptionStatus>, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .subscriptions
            .get(&(tenant_id.to_string(), user_id.to_string()))
            .copied())
    }

    fn append_progress(&self, entry: &NewProgressEntry) -> Result<ProgressEntry, StoreError> {
        let mut inner = self.inner.write();
        let stored = ProgressEntry {
            id: inner.progress.len() as i64 + 1,
            tenant_id: entry.tenant_id.clone(),
            device_id: entry.device_id.clone(),
            step: entry.step.clone(),
            status: entry.status.clone(),
            details: entry.details.clone(),
            created_at: entry.created_at,
        };
        inner.progress.push(stored.clone());
        Ok(stored)
    }

    fn list_progress(
        &self,
        tenant_id: &str,
        device_id: &str,
    ) -> Result<Vec<ProgressEntry>, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .progress
            .iter()
            .filter(|entry| entry.tenant_id == tenant_id && entry.device_id == device_id)
            .cloned()
            .collect())
    }
}
