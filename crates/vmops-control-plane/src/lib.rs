use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

pub const PROXMOX_FAMILY: &str = "proxmox";
pub const SYNCTHING_FAMILY: &str = "syncthing";

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandFamily {
    Proxmox,
    Syncthing,
}

impl CommandFamily {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Proxmox => PROXMOX_FAMILY,
            Self::Syncthing => SYNCTHING_FAMILY,
        }
    }

    /// Resolves an action name within this family, e.g. `start` for proxmox.
    pub fn action(self, action: &str) -> Option<CommandType> {
        match self {
            Self::Proxmox => ProxmoxAction::parse(action).map(CommandType::Proxmox),
            Self::Syncthing => SyncthingAction::parse(action).map(CommandType::Syncthing),
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxmoxAction {
    Start,
    Stop,
    Shutdown,
    Reboot,
    Status,
    Snapshot,
    ListVms,
}

impl ProxmoxAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Shutdown => "shutdown",
            Self::Reboot => "reboot",
            Self::Status => "status",
            Self::Snapshot => "snapshot",
            Self::ListVms => "list_vms",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "start" => Some(Self::Start),
            "stop" => Some(Self::Stop),
            "shutdown" => Some(Self::Shutdown),
            "reboot" => Some(Self::Reboot),
            "status" => Some(Self::Status),
            "snapshot" => Some(Self::Snapshot),
            "list_vms" => Some(Self::ListVms),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncthingAction {
    Status,
    ListFolders,
    Rescan,
    Restart,
}

impl SyncthingAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::ListFolders => "list_folders",
            Self::Rescan => "rescan",
            Self::Restart => "restart",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "status" => Some(Self::Status),
            "list_folders" => Some(Self::ListFolders),
            "rescan" => Some(Self::Rescan),
            "restart" => Some(Self::Restart),
            _ => None,
        }
    }
}

/// A supported command, addressed on the wire as `<family>.<action>`.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum CommandType {
    Proxmox(ProxmoxAction),
    Syncthing(SyncthingAction),
}

impl CommandType {
    pub fn family(self) -> CommandFamily {
        match self {
            Self::Proxmox(_) => CommandFamily::Proxmox,
            Self::Syncthing(_) => CommandFamily::Syncthing,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Proxmox(ProxmoxAction::Start) => "proxmox.start",
            Self::Proxmox(ProxmoxAction::Stop) => "proxmox.stop",
            Self::Proxmox(ProxmoxAction::Shutdown) => "proxmox.shutdown",
            Self::Proxmox(ProxmoxAction::Reboot) => "proxmox.reboot",
            Self::Proxmox(ProxmoxAction::Status) => "proxmox.status",
            Self::Proxmox(ProxmoxAction::Snapshot) => "proxmox.snapshot",
            Self::Proxmox(ProxmoxAction::ListVms) => "proxmox.list_vms",
            Self::Syncthing(SyncthingAction::Status) => "syncthing.status",
            Self::Syncthing(SyncthingAction::ListFolders) => "syncthing.list_folders",
            Self::Syncthing(SyncthingAction::Rescan) => "syncthing.rescan",
            Self::Syncthing(SyncthingAction::Restart) => "syncthing.restart",
        }
    }

    /// Read-only commands are idempotent and eligible for dedupe.
    pub fn is_read_only(self) -> bool {
        matches!(
            self,
            Self::Proxmox(ProxmoxAction::Status)
                | Self::Proxmox(ProxmoxAction::ListVms)
                | Self::Syncthing(SyncthingAction::Status)
                | Self::Syncthing(SyncthingAction::ListFolders)
        )
    }

    /// Checks the payload shape each variant expects. Extra keys are allowed.
    pub fn validate_payload(self, payload: &Value) -> Result<(), PayloadError> {
        let Some(map) = payload.as_object() else {
            return Err(PayloadError::new("payload", "must be a JSON object"));
        };
        match self {
            Self::Proxmox(ProxmoxAction::ListVms) => optional_string(map, "node"),
            Self::Proxmox(action) => {
                required_string(map, "node")?;
                let vmid = map.get("vmid").and_then(Value::as_u64).unwrap_or(0);
                if vmid == 0 {
                    return Err(PayloadError::new("vmid", "must be a positive integer"));
                }
                if action == ProxmoxAction::Snapshot {
                    required_string(map, "snapshot_name")?;
                }
                Ok(())
            }
            Self::Syncthing(SyncthingAction::Rescan) => optional_string(map, "folder_id"),
            Self::Syncthing(_) => Ok(()),
        }
    }
}

fn required_string(
    map: &serde_json::Map<String, Value>,
    field: &'static str,
) -> Result<(), PayloadError> {
    match map.get(field).and_then(Value::as_str) {
        Some(value) if !value.trim().is_empty() => Ok(()),
        _ => Err(PayloadError::new(field, "must be a non-empty string")),
    }
}

fn optional_string(
    map: &serde_json::Map<String, Value>,
    field: &'static str,
) -> Result<(), PayloadError> {
    match map.get(field) {
        None | Some(Value::Null) => Ok(()),
        Some(Value::String(_)) => Ok(()),
        Some(_) => Err(PayloadError::new(field, "must be a string")),
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandType {
    type Err = UnknownCommandType;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let unknown = || UnknownCommandType(raw.to_string());
        let (family, action) = raw.split_once('.').ok_or_else(unknown)?;
        let family = match family {
            PROXMOX_FAMILY => CommandFamily::Proxmox,
            SYNCTHING_FAMILY => CommandFamily::Syncthing,
            _ => return Err(unknown()),
        };
        family.action(action).ok_or_else(unknown)
    }
}

impl Serialize for CommandType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for CommandType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UnknownCommandType(pub String);

impl fmt::Display for UnknownCommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown command type: {}", self.0)
    }
}

impl std::error::Error for UnknownCommandType {}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PayloadError {
    pub field: &'static str,
    pub reason: &'static str,
}

impl PayloadError {
    fn new(field: &'static str, reason: &'static str) -> Self {
        Self { field, reason }
    }
}

impl fmt::Display for PayloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.field, self.reason)
    }
}

impl std::error::Error for PayloadError {}

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl CommandStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// `queued -> failed` covers expiry and agents rejecting work they never started.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Running)
                | (Self::Queued, Self::Failed)
                | (Self::Running, Self::Succeeded)
                | (Self::Running, Self::Failed)
        )
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Command {
    pub id: String,
    pub tenant_id: String,
    pub agent_id: String,
    pub command_type: CommandType,
    #[serde(default)]
    pub payload: Value,
    pub status: CommandStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub queued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub created_by: String,
}

impl Command {
    /// Only queued commands expire; once picked up the agent owns the outcome.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == CommandStatus::Queued && self.expires_at <= now
    }
}

/// Body an agent sends when reporting progress on a command.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct CommandStatusUpdate {
    pub status: CommandStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum CommandEventType {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl CommandEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "command.queued",
            Self::Running => "command.running",
            Self::Succeeded => "command.succeeded",
            Self::Failed => "command.failed",
        }
    }
}

impl From<CommandStatus> for CommandEventType {
    fn from(status: CommandStatus) -> Self {
        match status {
            CommandStatus::Queued => Self::Queued,
            CommandStatus::Running => Self::Running,
            CommandStatus::Succeeded => Self::Succeeded,
            CommandStatus::Failed => Self::Failed,
        }
    }
}

impl Serialize for CommandEventType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for CommandEventType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.strip_prefix("command.")
            .and_then(CommandStatus::parse)
            .map(Self::from)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown event type: {raw}")))
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct CommandEvent {
    pub id: u64,
    #[serde(rename = "type")]
    pub event_type: CommandEventType,
    pub tenant_id: String,
    pub agent_id: String,
    pub command_id: String,
    pub timestamp: DateTime<Utc>,
    pub command: Command,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct SuccessEnvelope<T> {
    pub success: bool,
    pub data: T,
}

impl<T> SuccessEnvelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ErrorEnvelope {
    pub success: bool,
    pub error: ErrorBody,
}

impl ErrorEnvelope {
    pub fn new(code: impl Into<String>, message: impl Into<String>, details: Option<String>) -> Self {
        Self {
            success: false,
            error: ErrorBody {
                code: code.into(),
                message: message.into(),
                details,
            },
        }
    }
}
