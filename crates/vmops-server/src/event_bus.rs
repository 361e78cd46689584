//! Process-local fan-out of command state changes.
//!
//! Events are best effort: they live in a bounded ring for replay and in the
//! broadcast channel for live subscribers. The command record in the store is
//! the durable copy.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use vmops_control_plane::{Command, CommandEvent, CommandEventType};

pub const DEFAULT_EVENT_BUFFER: usize = 5_000;

pub struct EventBus {
    capacity: usize,
    state: Mutex<BusState>,
}

struct BusState {
    next_id: u64,
    ring: VecDeque<Arc<CommandEvent>>,
    sender: Option<broadcast::Sender<Arc<CommandEvent>>>,
}

/// Which events a subscriber wants. Tenant is always required.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EventFilter {
    pub tenant_id: String,
    pub agent_id: Option<String>,
    pub command_id: Option<String>,
    pub event_type: Option<CommandEventType>,
}

impl EventFilter {
    pub fn tenant(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            ..Self::default()
        }
    }

    pub fn agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn command(mut self, command_id: impl Into<String>) -> Self {
        self.command_id = Some(command_id.into());
        self
    }

    pub fn event_type(mut self, event_type: CommandEventType) -> Self {
        self.event_type = Some(event_type);
        self
    }

    pub fn matches(&self, event: &CommandEvent) -> bool {
        event.tenant_id == self.tenant_id
            && self
                .agent_id
                .as_deref()
                .map_or(true, |agent_id| event.agent_id == agent_id)
            && self
                .command_id
                .as_deref()
                .map_or(true, |command_id| event.command_id == command_id)
            && self
                .event_type
                .map_or(true, |event_type| event.event_type == event_type)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            capacity,
            state: Mutex::new(BusState {
                next_id: 1,
                ring: VecDeque::with_capacity(capacity),
                sender: Some(sender),
            }),
        }
    }

    /// Appends and fans out an event for the command's current state. Returns
    /// `None` once the bus has been shut down.
    pub fn publish(
        &self,
        event_type: CommandEventType,
        command: &Command,
    ) -> Option<Arc<CommandEvent>> {
        let mut state = self.state.lock();
        let sender = state.sender.clone()?;
        let event = Arc::new(CommandEvent {
            id: state.next_id,
            event_type,
            tenant_id: command.tenant_id.clone(),
            agent_id: command.agent_id.clone(),
            command_id: command.id.clone(),
            timestamp: Utc::now(),
            command: command.clone(),
        });
        state.next_id += 1;
        state.ring.push_back(event.clone());
        while state.ring.len() > self.capacity {
            state.ring.pop_front();
        }
        // Sending under the lock keeps channel order identical to id order.
        // An error only means nobody is listening right now.
        let receivers = sender.send(event.clone()).unwrap_or(0);
        debug!(
            event_id = event.id,
            event_type = event_type.as_str(),
            command_id = %event.command_id,
            receivers,
            "published command event"
        );
        Some(event)
    }

    pub fn subscribe(&self, filter: EventFilter) -> EventSubscription {
        let state = self.state.lock();
        EventSubscription::new(receiver_for(&state), filter, state.next_id - 1)
    }

    /// Snapshot of matching buffered events after `last_event_id` plus a live
    /// subscription that starts right after the snapshot. Both are taken under
    /// one lock, so nothing is missed or delivered twice.
    pub fn subscribe_with_replay(
        &self,
        filter: EventFilter,
        last_event_id: u64,
    ) -> (Vec<Arc<CommandEvent>>, EventSubscription) {
        let state = self.state.lock();
        if let Some(oldest) = state.ring.front() {
            if last_event_id + 1 < oldest.id {
                debug!(
                    last_event_id,
                    oldest_buffered = oldest.id,
                    "replay requested from before the buffer; older events are gone"
                );
            }
        }
        let replay: Vec<Arc<CommandEvent>> = state
            .ring
            .iter()
            .filter(|event| event.id > last_event_id && filter.matches(event))
            .cloned()
            .collect();
        let subscription = EventSubscription::new(receiver_for(&state), filter, state.next_id - 1);
        (replay, subscription)
    }

    pub fn last_event_id(&self) -> u64 {
        self.state.lock().next_id - 1
    }

    pub fn subscriber_count(&self) -> usize {
        self.state
            .lock()
            .sender
            .as_ref()
            .map_or(0, |sender| sender.receiver_count())
    }

    /// Drops the buffer and ends every live subscription.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.ring.clear();
        state.sender = None;
    }
}

fn receiver_for(state: &BusState) -> broadcast::Receiver<Arc<CommandEvent>> {
    match &state.sender {
        Some(sender) => sender.subscribe(),
        // Closed bus: hand out a receiver whose sender is already gone.
        None => broadcast::channel(1).1,
    }
}

/// A live, filtered view of the bus. Dropping it unsubscribes.
pub struct EventSubscription {
    receiver: broadcast::Receiver<Arc<CommandEvent>>,
    filter: EventFilter,
    last_seen: u64,
}

impl EventSubscription {
    fn new(
        receiver: broadcast::Receiver<Arc<CommandEvent>>,
        filter: EventFilter,
        last_seen: u64,
    ) -> Self {
        Self {
            receiver,
            filter,
            last_seen,
        }
    }

    /// Next matching event, or `None` once the bus shuts down. A subscriber
    /// that falls behind skips what it missed instead of stalling publishers.
    pub async fn recv(&mut self) -> Option<Arc<CommandEvent>> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if event.id <= self.last_seen {
                        continue;
                    }
                    self.last_seen = event.id;
                    if self.filter.matches(&event) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        skipped,
                        tenant_id = %self.filter.tenant_id,
                        "event subscriber lagged; skipped events"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
