//! Long-poll delivery of queued commands to agents.

use std::time::Duration;

use chrono::Utc;
use tracing::debug;
use vmops_control_plane::{Command, CommandEventType, CommandStatus};

use super::CommandQueue;
use crate::error::ApiError;
use crate::event_bus::EventFilter;

pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(25);
pub const MIN_POLL_TIMEOUT: Duration = Duration::from_secs(1);
pub const MAX_POLL_TIMEOUT: Duration = Duration::from_secs(60);

const MAX_PICKUP_ATTEMPTS: usize = 50;

/// Caller-supplied `timeout_ms`, defaulted and clamped.
pub fn poll_timeout(timeout_ms: Option<u64>) -> Duration {
    timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_POLL_TIMEOUT)
        .clamp(MIN_POLL_TIMEOUT, MAX_POLL_TIMEOUT)
}

impl CommandQueue {
    /// Oldest deliverable command for the agent, waiting up to `timeout` for
    /// one to be queued. A timeout is `Ok(None)`.
    ///
    /// Dropping the returned future (client disconnect) releases both the
    /// bus subscription and the timer.
    pub async fn wait_for_next_agent_command(
        &self,
        tenant_id: &str,
        agent_id: &str,
        timeout: Duration,
    ) -> Result<Option<Command>, ApiError> {
        let timeout = timeout.clamp(MIN_POLL_TIMEOUT, MAX_POLL_TIMEOUT);
        self.record_heartbeat(tenant_id, agent_id)?;

        // Subscribe before reading the store so a dispatch landing in between
        // is still seen.
        let mut subscription = self.bus.subscribe(
            EventFilter::tenant(tenant_id)
                .agent(agent_id)
                .event_type(CommandEventType::Queued),
        );

        if let Some(command) = self.next_queued_command(tenant_id, agent_id)? {
            return Ok(Some(command));
        }

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => {
                    debug!(agent_id, timeout_ms = timeout.as_millis() as u64, "long-poll timed out");
                    return Ok(None);
                }
                event = subscription.recv() => {
                    let Some(event) = event else {
                        debug!(agent_id, "event bus closed during long-poll");
                        return Ok(None);
                    };
                    let Some(command) = self.store.find_command(tenant_id, &event.command_id)? else {
                        continue;
                    };
                    if command.status == CommandStatus::Queued && !command.is_expired(Utc::now()) {
                        return Ok(Some(command));
                    }
                }
            }
        }
    }

    /// Skips past expired commands, failing each one on the way.
    fn next_queued_command(
        &self,
        tenant_id: &str,
        agent_id: &str,
    ) -> Result<Option<Command>, ApiError> {
        for _ in 0..MAX_PICKUP_ATTEMPTS {
            let Some(command) = self.store.oldest_queued_command(tenant_id, agent_id)? else {
                return Ok(None);
            };
            let now = Utc::now();
            if !command.is_expired(now) {
                return Ok(Some(command));
            }
            self.mark_expired(&command, now);
        }
        Ok(None)
    }
}
