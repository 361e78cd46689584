use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;

use crate::event_bus::DEFAULT_EVENT_BUFFER;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_DB_POOL_SIZE: u32 = 10;
const DEFAULT_DEDUPE_WINDOW_SECS: u64 = 10;
const DEFAULT_AGENT_OFFLINE_SECS: u64 = 120;
const DEFAULT_COMMAND_TTL_SECS: u64 = 300;
const DEFAULT_COMMAND_SWEEP_SECS: u64 = 30;
const DEFAULT_LEASE_HEARTBEAT_TIMEOUT_SECS: u64 = 90;
const DEFAULT_PUBLIC_BASE_URL: &str = "http://localhost:8080";

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub database_url: Option<String>,
    pub run_migrations: bool,
    pub port: u16,
    pub db_pool_size: u32,
    pub token_secret: String,
    pub lease_secret: String,
    pub public_base_url: String,
    pub queue: QueueConfig,
    pub event_buffer_capacity: usize,
    pub command_sweep_interval: Duration,
    pub lease_heartbeat_timeout: Duration,
    pub seed_agents: Vec<SeedAgent>,
}

/// An agent registered at startup, written `tenant:agent[:owner]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SeedAgent {
    pub tenant_id: String,
    pub agent_id: String,
    pub owner_user_id: Option<String>,
}

impl FromStr for SeedAgent {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let mut parts = raw.trim().split(':').map(str::trim);
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(tenant), Some(agent), owner, None) if !tenant.is_empty() && !agent.is_empty() => {
                Ok(Self {
                    tenant_id: tenant.to_string(),
                    agent_id: agent.to_string(),
                    owner_user_id: owner.filter(|o| !o.is_empty()).map(str::to_string),
                })
            }
            _ => anyhow::bail!("expected tenant:agent[:owner], got {raw:?}"),
        }
    }
}

/// Knobs for the command queue. Process-wide; every tenant shares them.
#[derive(Clone, Copy, Debug)]
pub struct QueueConfig {
    pub dedupe_window: Duration,
    pub agent_offline_after: Duration,
    pub default_command_ttl: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            dedupe_window: Duration::from_secs(DEFAULT_DEDUPE_WINDOW_SECS),
            agent_offline_after: Duration::from_secs(DEFAULT_AGENT_OFFLINE_SECS),
            default_command_ttl: Duration::from_secs(DEFAULT_COMMAND_TTL_SECS),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = env_string("DATABASE_URL");
        let token_secret = env_string("VMOPS_TOKEN_SECRET")
            .context("VMOPS_TOKEN_SECRET must be set")?;
        let lease_secret = env_string("VMOPS_LEASE_SECRET").unwrap_or_else(|| token_secret.clone());

        let queue = QueueConfig {
            dedupe_window: Duration::from_secs(
                env_parse("VMOPS_DEDUPE_WINDOW_SECS")?.unwrap_or(DEFAULT_DEDUPE_WINDOW_SECS),
            ),
            agent_offline_after: Duration::from_secs(
                env_parse("VMOPS_AGENT_OFFLINE_SECS")?.unwrap_or(DEFAULT_AGENT_OFFLINE_SECS),
            ),
            default_command_ttl: Duration::from_secs(
                env_parse("VMOPS_COMMAND_TTL_SECS")?.unwrap_or(DEFAULT_COMMAND_TTL_SECS),
            ),
        };

        let seed_agents = env_string("VMOPS_SEED_AGENTS")
            .map(|csv| {
                csv.split(',')
                    .filter(|entry| !entry.trim().is_empty())
                    .map(SeedAgent::from_str)
                    .collect::<anyhow::Result<Vec<_>>>()
            })
            .transpose()
            .context("parse VMOPS_SEED_AGENTS")?
            .unwrap_or_default();

        Ok(Self {
            database_url,
            run_migrations: env_bool("VMOPS_RUN_MIGRATIONS").unwrap_or(true),
            port: env_parse("VMOPS_PORT")?.unwrap_or(DEFAULT_PORT),
            db_pool_size: env_parse("VMOPS_DB_POOL_SIZE")?.unwrap_or(DEFAULT_DB_POOL_SIZE),
            token_secret,
            lease_secret,
            public_base_url: env_string("VMOPS_PUBLIC_BASE_URL")
                .unwrap_or_else(|| DEFAULT_PUBLIC_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            queue,
            event_buffer_capacity: env_parse::<usize>("VMOPS_EVENT_BUFFER")?
                .unwrap_or(DEFAULT_EVENT_BUFFER)
                .max(1),
            command_sweep_interval: Duration::from_secs(
                env_parse::<u64>("VMOPS_COMMAND_SWEEP_SECS")?
                    .unwrap_or(DEFAULT_COMMAND_SWEEP_SECS)
                    .max(1),
            ),
            lease_heartbeat_timeout: Duration::from_secs(
                env_parse("VMOPS_LEASE_HEARTBEAT_TIMEOUT_SECS")?
                    .unwrap_or(DEFAULT_LEASE_HEARTBEAT_TIMEOUT_SECS),
            ),
            seed_agents,
        })
    }
}

/// `std` to `chrono` for the durations this service configures, saturating at 100 years.
pub fn chrono_duration(duration: Duration) -> chrono::Duration {
    const MAX_SECS: u64 = 100 * 365 * 24 * 60 * 60;
    chrono::Duration::seconds(duration.as_secs().min(MAX_SECS) as i64)
}

#[cfg(test)]
impl ServerConfig {
    pub fn for_tests(token_secret: &str) -> Self {
        Self {
            database_url: None,
            run_migrations: false,
            port: 0,
            db_pool_size: 1,
            token_secret: token_secret.to_string(),
            lease_secret: format!("{token_secret}-lease"),
            public_base_url: "http://vmops.test".to_string(),
            queue: QueueConfig::default(),
            event_buffer_capacity: 64,
            command_sweep_interval: Duration::from_secs(DEFAULT_COMMAND_SWEEP_SECS),
            lease_heartbeat_timeout: Duration::from_secs(DEFAULT_LEASE_HEARTBEAT_TIMEOUT_SECS),
            seed_agents: Vec::new(),
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T>(key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env_string(key)
        .map(|raw| raw.parse::<T>())
        .transpose()
        .with_context(|| format!("parse {key}"))
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key).ok().and_then(|raw| match raw.trim() {
        "1" | "true" | "TRUE" | "yes" | "on" => Some(true),
        "0" | "false" | "FALSE" | "no" | "off" => Some(false),
        _ => None,
    })
}
