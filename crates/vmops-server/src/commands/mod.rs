//! Command queue: dispatch, status reporting, reads and the expiry sweep.
//!
//! The store holds the authoritative command rows. Every state change that
//! lands is republished on the [`EventBus`] so observers and long-polling
//! agents learn about it without polling the store.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use vmops_control_plane::{
    Command, CommandEventType, CommandStatus, CommandStatusUpdate, CommandType,
};

use crate::auth::Caller;
use crate::config::{chrono_duration, QueueConfig};
use crate::error::ApiError;
use crate::event_bus::{EventBus, EventFilter};
use crate::store::{Agent, AgentStatus, CommandFilter, DuplicateQuery, StatusChange, Store};

pub mod delivery;

pub const MIN_COMMAND_TTL: Duration = Duration::from_secs(10);
pub const MAX_COMMAND_TTL: Duration = Duration::from_secs(86_400);
pub const DEFAULT_LIST_LIMIT: usize = 50;
pub const MAX_LIST_LIMIT: usize = 200;
pub const EXPIRED_BEFORE_PICKUP: &str = "expired before pickup";

const DEFAULT_FAILURE_MESSAGE: &str = "command failed";
const EXPIRY_SWEEP_BATCH: usize = 500;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DispatchOutcome {
    pub command: Command,
    pub deduplicated: bool,
}

pub struct CommandQueue {
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
    config: QueueConfig,
}

impl CommandQueue {
    pub fn new(store: Arc<dyn Store>, bus: Arc<EventBus>, config: QueueConfig) -> Self {
        Self { store, bus, config }
    }

    #[cfg(test)]
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn dispatch_command(
        &self,
        caller: &Caller,
        agent_id: &str,
        command_type: CommandType,
        payload: Value,
        ttl: Option<Duration>,
    ) -> Result<DispatchOutcome, ApiError> {
        let tenant_id = caller.tenant_id.as_str();
        let agent = self.load_agent(tenant_id, agent_id)?;
        if !caller.is_privileged() {
            ensure_owner(caller, &agent)?;
        }

        let now = Utc::now();
        if !agent.is_online(now, chrono_duration(self.config.agent_offline_after)) {
            return Err(ApiError::conflict(
                "AGENT_OFFLINE",
                format!("agent {agent_id} is offline"),
            ));
        }

        command_type.validate_payload(&payload).map_err(|err| {
            ApiError::bad_request("INVALID_PAYLOAD", format!("invalid payload for {command_type}"))
                .with_details(err.to_string())
        })?;

        let dedupe_key = command_type.is_read_only().then(|| dedupe_key(&payload));
        if let Some(key) = dedupe_key.as_deref() {
            let query = DuplicateQuery {
                tenant_id,
                agent_id,
                created_by: &caller.user_id,
                command_type,
                dedupe_key: key,
                since: now - chrono_duration(self.config.dedupe_window),
            };
            match self.store.find_recent_duplicate(&query) {
                Ok(Some(existing)) => {
                    info!(
                        command_id = %existing.id,
                        command_type = %command_type,
                        agent_id,
                        "deduplicated read-only command"
                    );
                    return Ok(DispatchOutcome {
                        command: existing,
                        deduplicated: true,
                    });
                }
                Ok(None) => {}
                Err(err) => warn!(error = %err, agent_id, "dedupe lookup failed; dispatching anyway"),
            }
        }

        let ttl = ttl
            .unwrap_or(self.config.default_command_ttl)
            .clamp(MIN_COMMAND_TTL, MAX_COMMAND_TTL);
        let command = Command {
            id: new_command_id(),
            tenant_id: tenant_id.to_string(),
            agent_id: agent_id.to_string(),
            command_type,
            payload,
            status: CommandStatus::Queued,
            result: None,
            error_message: None,
            queued_at: now,
            started_at: None,
            completed_at: None,
            expires_at: now + chrono_duration(ttl),
            created_by: caller.user_id.clone(),
        };
        self.store.insert_command(&command, dedupe_key.as_deref())?;
        self.bus.publish(CommandEventType::Queued, &command);

        info!(
            command_id = %command.id,
            command_type = %command_type,
            agent_id,
            tenant_id,
            ttl_secs = ttl.as_secs(),
            "queued command"
        );
        Ok(DispatchOutcome {
            command,
            deduplicated: false,
        })
    }

    pub fn update_command_status(
        &self,
        tenant_id: &str,
        caller_agent_id: &str,
        command_id: &str,
        update: CommandStatusUpdate,
    ) -> Result<Command, ApiError> {
        let current = self.load_command(tenant_id, command_id)?;
        if current.agent_id != caller_agent_id {
            return Err(ApiError::forbidden(
                "AGENT_MISMATCH",
                "command is assigned to a different agent",
            ));
        }
        self.load_active_agent(tenant_id, caller_agent_id)?;
        if !current.status.can_transition_to(update.status) {
            return Err(ApiError::conflict(
                "INVALID_TRANSITION",
                format!("cannot move command from {} to {}", current.status, update.status),
            ));
        }

        let change = StatusChange {
            status: update.status,
            at: Utc::now(),
            result: match update.status {
                CommandStatus::Succeeded => update.result,
                _ => None,
            },
            error_message: match update.status {
                CommandStatus::Failed => Some(
                    update
                        .error_message
                        .filter(|message| !message.trim().is_empty())
                        .unwrap_or_else(|| DEFAULT_FAILURE_MESSAGE.to_string()),
                ),
                _ => None,
            },
        };
        let updated = self
            .store
            .transition_command(tenant_id, command_id, current.status, &change)?
            .ok_or_else(|| {
                ApiError::conflict(
                    "COMMAND_STATE_CONFLICT",
                    "command changed state concurrently",
                )
            })?;
        self.bus.publish(update.status.into(), &updated);

        info!(
            command_id,
            agent_id = caller_agent_id,
            from = current.status.as_str(),
            to = updated.status.as_str(),
            "command status updated"
        );
        Ok(updated)
    }

    pub fn get_command_status(&self, caller: &Caller, command_id: &str) -> Result<Command, ApiError> {
        let command = self.load_command(&caller.tenant_id, command_id)?;
        if caller.is_privileged() || caller.agent_id() == Some(command.agent_id.as_str()) {
            return Ok(command);
        }
        let forbidden = || ApiError::forbidden("COMMAND_FORBIDDEN", "not allowed to read this command");
        let agent = self
            .store
            .find_agent(&caller.tenant_id, &command.agent_id)?
            .ok_or_else(forbidden)?;
        ensure_owner(caller, &agent)?;
        if command.created_by != caller.user_id {
            return Err(forbidden());
        }
        Ok(command)
    }

    pub fn list_agent_commands(
        &self,
        caller: &Caller,
        agent_id: &str,
        status: Option<CommandStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<Command>, ApiError> {
        let agent = self.load_agent(&caller.tenant_id, agent_id)?;
        let created_by = if caller.is_privileged() || caller.agent_id() == Some(agent_id) {
            None
        } else {
            ensure_owner(caller, &agent)?;
            Some(caller.user_id.as_str())
        };
        let filter = CommandFilter {
            tenant_id: &caller.tenant_id,
            agent_id,
            status,
            created_by,
            limit: limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT),
        };
        Ok(self.store.list_commands(&filter)?)
    }

    /// Event filter for an observer. Non-privileged callers must name an
    /// agent they own or be that agent.
    pub fn observer_filter(
        &self,
        caller: &Caller,
        agent_id: Option<&str>,
        command_id: Option<&str>,
    ) -> Result<EventFilter, ApiError> {
        let agent_id = match (caller.agent_id(), agent_id) {
            (Some(own), None) => Some(own),
            (Some(own), Some(requested)) if requested != own => {
                return Err(ApiError::forbidden(
                    "AGENT_MISMATCH",
                    "agents may only observe their own commands",
                ));
            }
            (_, requested) => requested,
        };

        if !caller.is_privileged() && caller.agent_id().is_none() {
            let agent_id = agent_id.ok_or_else(|| {
                ApiError::bad_request("AGENT_ID_REQUIRED", "agent_id is required")
            })?;
            let agent = self.load_agent(&caller.tenant_id, agent_id)?;
            ensure_owner(caller, &agent)?;
        }

        let mut filter = EventFilter::tenant(caller.tenant_id.clone());
        if let Some(agent_id) = agent_id {
            filter = filter.agent(agent_id);
        }
        if let Some(command_id) = command_id {
            filter = filter.command(command_id);
        }
        Ok(filter)
    }

    /// Agent contact outside long-polling. Only last-seen changes.
    pub fn record_heartbeat(&self, tenant_id: &str, agent_id: &str) -> Result<DateTime<Utc>, ApiError> {
        self.load_active_agent(tenant_id, agent_id)?;
        let now = Utc::now();
        if !self.store.touch_agent(tenant_id, agent_id, now)? {
            return Err(agent_not_found(agent_id));
        }
        debug!(agent_id, "agent heartbeat");
        Ok(now)
    }

    /// Fails queued commands that were never picked up. Returns how many were
    /// expired; store errors are logged and end the pass early.
    pub fn expire_stale_commands(&self) -> usize {
        let now = Utc::now();
        let stale = match self.store.expired_queued_commands(now, EXPIRY_SWEEP_BATCH) {
            Ok(stale) => stale,
            Err(err) => {
                warn!(error = %err, "expiry sweep could not list stale commands");
                return 0;
            }
        };
        let expired = stale
            .iter()
            .filter(|command| self.mark_expired(command, now).is_some())
            .count();
        if expired > 0 {
            info!(expired, "expired stale commands");
        }
        expired
    }

    /// Moves one queued command to `failed`. Errors are swallowed.
    fn mark_expired(&self, command: &Command, now: DateTime<Utc>) -> Option<Command> {
        let change = StatusChange {
            status: CommandStatus::Failed,
            at: now,
            result: None,
            error_message: Some(EXPIRED_BEFORE_PICKUP.to_string()),
        };
        match self.store.transition_command(
            &command.tenant_id,
            &command.id,
            CommandStatus::Queued,
            &change,
        ) {
            Ok(Some(updated)) => {
                self.bus.publish(CommandEventType::Failed, &updated);
                debug!(command_id = %updated.id, "command expired before pickup");
                Some(updated)
            }
            Ok(None) => None,
            Err(err) => {
                warn!(command_id = %command.id, error = %err, "failed to expire command");
                None
            }
        }
    }

    fn load_agent(&self, tenant_id: &str, agent_id: &str) -> Result<Agent, ApiError> {
        self.store
            .find_agent(tenant_id, agent_id)?
            .ok_or_else(|| agent_not_found(agent_id))
    }

    /// Revoked or inactive agents may no longer poll, heartbeat or report.
    fn load_active_agent(&self, tenant_id: &str, agent_id: &str) -> Result<Agent, ApiError> {
        let agent = self.load_agent(tenant_id, agent_id)?;
        if agent.status != AgentStatus::Active {
            return Err(ApiError::forbidden(
                "AGENT_INACTIVE",
                format!("agent {agent_id} is {}", agent.status.as_str()),
            ));
        }
        Ok(agent)
    }

    fn load_command(&self, tenant_id: &str, command_id: &str) -> Result<Command, ApiError> {
        self.store
            .find_command(tenant_id, command_id)?
            .ok_or_else(|| {
                ApiError::not_found("COMMAND_NOT_FOUND", format!("command {command_id} not found"))
            })
    }
}

fn agent_not_found(agent_id: &str) -> ApiError {
    ApiError::not_found("AGENT_NOT_FOUND", format!("agent {agent_id} not found"))
}

fn ensure_owner(caller: &Caller, agent: &Agent) -> Result<(), ApiError> {
    match agent.owner_user_id.as_deref() {
        None => Err(ApiError::forbidden(
            "AGENT_OWNER_UNASSIGNED",
            "agent has not been claimed by an owner",
        )),
        Some(owner) if owner != caller.user_id => Err(ApiError::forbidden(
            "AGENT_OWNER_MISMATCH",
            "agent belongs to a different user",
        )),
        Some(_) => Ok(()),
    }
}

fn new_command_id() -> String {
    let mut rng = rand::thread_rng();
    format!(
        "cmd-{:08x}{:08x}{:08x}",
        rng.r#gen::<u32>(),
        rng.r#gen::<u32>(),
        rng.r#gen::<u32>()
    )
}

/// SHA-256 over the payload with object keys sorted at every depth.
pub fn dedupe_key(payload: &Value) -> String {
    let mut canonical = String::new();
    write_canonical(payload, &mut canonical);
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
