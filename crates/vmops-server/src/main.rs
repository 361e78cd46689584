mod auth;
mod commands;
mod config;
mod error;
mod event_bus;
mod grant;
mod leases;
mod models;
mod provisioning;
mod routes;
mod store;
mod token;

use crate::auth::Authenticator;
use crate::commands::CommandQueue;
use crate::config::ServerConfig;
use crate::error::ApiError;
use crate::event_bus::EventBus;
use crate::leases::LeaseService;
use crate::models::PgStore;
use crate::provisioning::ProvisioningService;
use crate::store::{Agent, AgentStatus, MemoryStore, Store};
use crate::routes::{
    agent_heartbeat, command_events, complete_provisioning, dispatch_command, dispatch_proxmox,
    dispatch_syncthing, get_command, health_check, issue_lease, issue_provisioning_token,
    lease_heartbeat, list_commands, next_command, provisioning_progress, report_progress,
    revoke_lease, revoke_provisioning_token, revoke_provisioning_token_by_value, update_command,
    validate_provisioning_token,
};
use anyhow::Context;
use axum::http::Uri;
use axum::routing::{delete, get, post};
use axum::{Extension, Router};
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct State {
    pub store: Arc<dyn Store>,
    pub bus: Arc<EventBus>,
    pub commands: Arc<CommandQueue>,
    pub provisioning: Arc<ProvisioningService>,
    pub leases: Arc<LeaseService>,
    pub auth: Arc<Authenticator>,
}

impl State {
    pub fn new(store: Arc<dyn Store>, config: &ServerConfig) -> Self {
        let bus = Arc::new(EventBus::new(config.event_buffer_capacity));
        let commands = Arc::new(CommandQueue::new(store.clone(), bus.clone(), config.queue));
        let provisioning = Arc::new(ProvisioningService::new(
            store.clone(),
            config.token_secret.as_bytes(),
            &config.public_base_url,
        ));
        let leases = Arc::new(LeaseService::new(
            store.clone(),
            config.lease_secret.as_bytes(),
            config.lease_heartbeat_timeout,
        ));
        Self {
            store,
            bus,
            commands,
            provisioning,
            leases,
            auth: Arc::new(Authenticator::new(config.token_secret.as_bytes())),
        }
    }
}

pub fn app(state: State) -> Router {
    Router::new()
        .route("/health-check", get(health_check))
        .route("/vm-ops/proxmox/:action", post(dispatch_proxmox))
        .route("/vm-ops/syncthing/:action", post(dispatch_syncthing))
        .route("/vm-ops/commands", post(dispatch_command).get(list_commands))
        .route("/vm-ops/commands/next", get(next_command))
        .route("/vm-ops/commands/:id", get(get_command).patch(update_command))
        .route("/vm-ops/agents/heartbeat", post(agent_heartbeat))
        .route("/vm-ops/events", get(command_events))
        .route("/provisioning/tokens", post(issue_provisioning_token))
        .route("/provisioning/tokens/:vm_uuid", delete(revoke_provisioning_token))
        .route("/provisioning/revoke-token", post(revoke_provisioning_token_by_value))
        .route("/provisioning/validate-token", post(validate_provisioning_token))
        .route("/provisioning/report-progress", post(report_progress))
        .route("/provisioning/complete", post(complete_provisioning))
        .route("/provisioning/progress/:vm_uuid", get(provisioning_progress))
        .route("/leases", post(issue_lease))
        .route("/leases/heartbeat", post(lease_heartbeat))
        .route("/leases/:id", delete(revoke_lease))
        .fallback(fallback)
        .layer(Extension(state))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = ServerConfig::from_env()?;

    // DB management
    let store: Arc<dyn Store> = match &config.database_url {
        Some(url) => {
            let pg = PgStore::connect(url, config.db_pool_size)?;
            if config.run_migrations {
                let applied = pg.run_migrations()?;
                info!(applied, "Database migrations applied");
            }
            Arc::new(pg)
        }
        None => {
            warn!("DATABASE_URL not set; using the in-memory store, nothing will persist");
            Arc::new(MemoryStore::new())
        }
    };

    for seed in &config.seed_agents {
        store
            .register_agent(&Agent {
                id: seed.agent_id.clone(),
                tenant_id: seed.tenant_id.clone(),
                owner_user_id: seed.owner_user_id.clone(),
                status: AgentStatus::Active,
                last_seen_at: None,
            })
            .with_context(|| format!("seed agent {}", seed.agent_id))?;
        info!(tenant_id = %seed.tenant_id, agent_id = %seed.agent_id, "Seeded agent");
    }

    let state = State::new(store, &config);

    let addr: std::net::SocketAddr = format!("0.0.0.0:{}", config.port)
        .parse()
        .context("parse bind address")?;

    let server = axum::Server::try_bind(&addr)
        .with_context(|| format!("bind {addr}"))?
        .serve(app(state.clone()).into_make_service());

    info!(
        store = state.store.backend().as_str(),
        "Webserver running on http://{addr}"
    );

    // expire queued commands nobody picked up
    let sweeper = {
        let commands = state.commands.clone();
        let every = config.command_sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                commands.expire_stale_commands();
            }
        })
    };

    let bus = state.bus.clone();
    let graceful = server.with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for Ctrl+C: {e}");
        }
        info!("Shutting down");
        // Ends open event streams and long-polls so connections can drain.
        bus.shutdown();
    });

    if let Err(e) = graceful.await {
        error!("Shutdown error: {e}");
    }
    sweeper.abort();

    Ok(())
}

async fn fallback(uri: Uri) -> ApiError {
    ApiError::not_found("ROUTE_NOT_FOUND", format!("No route for {uri}"))
}
