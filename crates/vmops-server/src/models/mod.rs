use anyhow::Context;
use chrono::{DateTime, Utc};
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel::PgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use vmops_control_plane::{Command, CommandStatus};

use crate::store::{
    Agent, Backend, CommandFilter, DuplicateQuery, Grant, GrantKind, GrantRenewal, GrantStatus,
    NewProgressEntry, ProgressEntry, StatusChange, Store, StoreError, SubscriptionStatus,
};

pub mod agent;
pub mod command;
pub mod grant;
pub mod progress;
mod schema;

use self::agent::AgentRow;
use self::command::CommandRow;
use self::grant::GrantRow;
use self::progress::ProgressRow;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!();

pub type DbPool = Pool<ConnectionManager<PgConnection>>;

impl From<diesel::result::Error> for StoreError {
    fn from(err: diesel::result::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

/// [`Store`] over PostgreSQL. Queries run synchronously on a pooled
/// connection, the same way request handlers use diesel elsewhere.
#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn connect(database_url: &str, pool_size: u32) -> anyhow::Result<Self> {
        let manager = ConnectionManager::<PgConnection>::new(database_url);
        let pool = Pool::builder()
            .max_size(pool_size)
            .test_on_check_out(true)
            .build(manager)
            .context("build database connection pool")?;
        Ok(Self::new(pool))
    }

    pub fn run_migrations(&self) -> anyhow::Result<usize> {
        let mut conn = self.pool.get().context("get connection for migrations")?;
        let applied = conn
            .run_pending_migrations(MIGRATIONS)
            .map_err(|err| anyhow::anyhow!(err))
            .context("run pending migrations")?;
        Ok(applied.len())
    }

    fn conn(&self) -> Result<PooledConnection<ConnectionManager<PgConnection>>, StoreError> {
        self.pool
            .get()
            .map_err(|err| StoreError::Unavailable(err.to_string()))
    }
}

fn decode_commands(rows: Vec<CommandRow>) -> Result<Vec<Command>, StoreError> {
    rows.into_iter().map(Command::try_from).collect()
}

impl Store for PgStore {
    fn backend(&self) -> Backend {
        Backend::Postgres
    }

    fn register_agent(&self, agent: &Agent) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        AgentRow::upsert(&mut conn, agent)?;
        Ok(())
    }

    fn find_agent(&self, tenant_id: &str, agent_id: &str) -> Result<Option<Agent>, StoreError> {
        let mut conn = self.conn()?;
        AgentRow::find(&mut conn, tenant_id, agent_id)?
            .map(Agent::try_from)
            .transpose()
    }

    fn touch_agent(
        &self,
        tenant_id: &str,
        agent_id: &str,
        seen_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn()?;
        Ok(AgentRow::touch(&mut conn, tenant_id, agent_id, seen_at)?)
    }

    fn insert_command(&self, command: &Command, dedupe_key: Option<&str>) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        CommandRow::new(command, dedupe_key).insert(&mut conn)?;
        Ok(())
    }

    fn find_command(&self, tenant_id: &str, command_id: &str) -> Result<Option<Command>, StoreError> {
        let mut conn = self.conn()?;
        CommandRow::find(&mut conn, tenant_id, command_id)?
            .map(Command::try_from)
            .transpose()
    }

    fn find_recent_duplicate(&self, query: &DuplicateQuery<'_>) -> Result<Option<Command>, StoreError> {
        let mut conn = self.conn()?;
        CommandRow::find_recent_duplicate(&mut conn, query)?
            .map(Command::try_from)
            .transpose()
    }

    fn oldest_queued_command(
        &self,
        tenant_id: &str,
        agent_id: &str,
    ) -> Result<Option<Command>, StoreError> {
        let mut conn = self.conn()?;
        CommandRow::oldest_queued(&mut conn, tenant_id, agent_id)?
            .map(Command::try_from)
            .transpose()
    }

    fn transition_command(
        &self,
        tenant_id: &str,
        command_id: &str,
        expected: CommandStatus,
        change: &StatusChange,
    ) -> Result<Option<Command>, StoreError> {
        let mut conn = self.conn()?;
        CommandRow::transition(&mut conn, tenant_id, command_id, expected, change)?
            .map(Command::try_from)
            .transpose()
    }

    fn list_commands(&self, filter: &CommandFilter<'_>) -> Result<Vec<Command>, StoreError> {
        let mut conn = self.conn()?;
        decode_commands(CommandRow::list(&mut conn, filter)?)
    }

    fn expired_queued_commands(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Command>, StoreError> {
        let mut conn = self.conn()?;
        decode_commands(CommandRow::expired_queued(&mut conn, now, limit)?)
    }

    fn upsert_grant(&self, grant: &Grant) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        GrantRow::new(grant).upsert(&mut conn)?;
        Ok(())
    }

    fn find_grant(
        &self,
        kind: GrantKind,
        tenant_id: &str,
        principal_id: &str,
    ) -> Result<Option<Grant>, StoreError> {
        let mut conn = self.conn()?;
        GrantRow::find(&mut conn, kind, tenant_id, principal_id)?
            .map(Grant::try_from)
            .transpose()
    }

    fn update_grant_status(
        &self,
        kind: GrantKind,
        tenant_id: &str,
        principal_id: &str,
        from: &[GrantStatus],
        to: GrantStatus,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn()?;
        Ok(GrantRow::update_status(
            &mut conn,
            kind,
            tenant_id,
            principal_id,
            from,
            to,
        )?)
    }

    fn renew_grant(
        &self,
        kind: GrantKind,
        tenant_id: &str,
        principal_id: &str,
        renewal: &GrantRenewal<'_>,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn()?;
        Ok(GrantRow::renew(&mut conn, kind, tenant_id, principal_id, renewal)?)
    }

    fn subscription_status(
        &self,
        tenant_id: &str,
        user_id: &str,
    ) -> Result<Option<SubscriptionStatus>, StoreError> {
        let mut conn = self.conn()?;
        grant::subscription_status(&mut conn, tenant_id, user_id)
    }

    fn append_progress(&self, entry: &NewProgressEntry) -> Result<ProgressEntry, StoreError> {
        let mut conn = self.conn()?;
        Ok(ProgressRow::append(&mut conn, entry)?.into())
    }

    fn list_progress(
        &self,
        tenant_id: &str,
        device_id: &str,
    ) -> Result<Vec<ProgressEntry>, StoreError> {
        let mut conn = self.conn()?;
        Ok(ProgressRow::list(&mut conn, tenant_id, device_id)?
            .into_iter()
            .map(ProgressEntry::from)
            .collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::AgentStatus;
    use diesel::prelude::*;
    use serde_json::json;
    use vmops_control_plane::{CommandType, ProxmoxAction};

    const TENANT: &str = "tenant-pg";

    fn init_store() -> PgStore {
        dotenv::dotenv().ok();
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let store = PgStore::connect(&url, 2).expect("Could not build connection pool");
        store.run_migrations().expect("migrations could not run");
        store
    }

    fn clear_database(store: &PgStore) {
        let conn = &mut store.pool.get().unwrap();

        conn.transaction::<_, anyhow::Error, _>(|conn| {
            diesel::delete(schema::setup_progress::table).execute(conn)?;
            diesel::delete(schema::grants::table).execute(conn)?;
            diesel::delete(schema::subscriptions::table).execute(conn)?;
            diesel::delete(schema::commands::table).execute(conn)?;
            diesel::delete(schema::agents::table).execute(conn)?;
            Ok(())
        })
        .unwrap();
    }

    fn seed_agent(store: &PgStore) {
        store
            .register_agent(&Agent {
                id: "agent-pg".to_string(),
                tenant_id: TENANT.to_string(),
                owner_user_id: Some("user-1".to_string()),
                status: AgentStatus::Active,
                last_seen_at: None,
            })
            .unwrap();
    }

    fn queued(id: &str) -> Command {
        let now = Utc::now();
        Command {
            id: id.to_string(),
            tenant_id: TENANT.to_string(),
            agent_id: "agent-pg".to_string(),
            command_type: CommandType::Proxmox(ProxmoxAction::Status),
            payload: json!({"node": "pve1", "vmid": 100}),
            status: CommandStatus::Queued,
            result: None,
            error_message: None,
            queued_at: now,
            started_at: None,
            completed_at: None,
            expires_at: now + chrono::Duration::minutes(5),
            created_by: "user-1".to_string(),
        }
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_command_lifecycle() {
        let store = init_store();
        clear_database(&store);
        seed_agent(&store);

        assert!(store.touch_agent(TENANT, "agent-pg", Utc::now()).unwrap());
        let agent = store.find_agent(TENANT, "agent-pg").unwrap().unwrap();
        assert!(agent.last_seen_at.is_some());

        store.insert_command(&queued("cmd-pg-1"), Some("key")).unwrap();
        let oldest = store.oldest_queued_command(TENANT, "agent-pg").unwrap().unwrap();
        assert_eq!(oldest.id, "cmd-pg-1");

        let duplicate = store
            .find_recent_duplicate(&DuplicateQuery {
                tenant_id: TENANT,
                agent_id: "agent-pg",
                created_by: "user-1",
                command_type: CommandType::Proxmox(ProxmoxAction::Status),
                dedupe_key: "key",
                since: Utc::now() - chrono::Duration::seconds(10),
            })
            .unwrap();
        assert_eq!(duplicate.map(|c| c.id), Some("cmd-pg-1".to_string()));

        let change = StatusChange {
            status: CommandStatus::Running,
            at: Utc::now(),
            result: None,
            error_message: None,
        };
        let running = store
            .transition_command(TENANT, "cmd-pg-1", CommandStatus::Queued, &change)
            .unwrap()
            .unwrap();
        assert_eq!(running.status, CommandStatus::Running);
        assert!(running.started_at.is_some());
        assert!(store
            .transition_command(TENANT, "cmd-pg-1", CommandStatus::Queued, &change)
            .unwrap()
            .is_none());

        clear_database(&store);
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_grant_status_guard() {
        let store = init_store();
        clear_database(&store);

        let now = Utc::now();
        let grant = Grant {
            kind: GrantKind::Provisioning,
            tenant_id: TENANT.to_string(),
            principal_id: "vm-1".to_string(),
            user_id: "user-1".to_string(),
            token_id: "jti-1".to_string(),
            status: GrantStatus::Active,
            issued_at: now,
            expires_at: now + chrono::Duration::minutes(5),
            last_heartbeat_at: None,
            metadata: json!({}),
        };
        store.upsert_grant(&grant).unwrap();
        store
            .upsert_grant(&Grant {
                token_id: "jti-2".to_string(),
                ..grant.clone()
            })
            .unwrap();
        let stored = store
            .find_grant(GrantKind::Provisioning, TENANT, "vm-1")
            .unwrap()
            .unwrap();
        assert_eq!(stored.token_id, "jti-2");

        assert!(store
            .update_grant_status(
                GrantKind::Provisioning,
                TENANT,
                "vm-1",
                &[GrantStatus::Active],
                GrantStatus::Used
            )
            .unwrap());
        assert!(!store
            .update_grant_status(
                GrantKind::Provisioning,
                TENANT,
                "vm-1",
                &[GrantStatus::Active],
                GrantStatus::Used
            )
            .unwrap());

        {
            let conn = &mut store.pool.get().unwrap();
            grant::upsert_subscription(conn, TENANT, "user-1", "expiring").unwrap();
        }
        assert_eq!(
            store.subscription_status(TENANT, "user-1").unwrap(),
            Some(SubscriptionStatus::Expiring)
        );

        clear_database(&store);
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_agent_ids_are_per_tenant() {
        let store = init_store();
        clear_database(&store);
        seed_agent(&store);

        store
            .register_agent(&Agent {
                id: "agent-pg".to_string(),
                tenant_id: "tenant-other".to_string(),
                owner_user_id: Some("user-2".to_string()),
                status: AgentStatus::Active,
                last_seen_at: None,
            })
            .unwrap();
        let ours = store.find_agent(TENANT, "agent-pg").unwrap().unwrap();
        let theirs = store.find_agent("tenant-other", "agent-pg").unwrap().unwrap();
        assert_eq!(ours.owner_user_id.as_deref(), Some("user-1"));
        assert_eq!(theirs.owner_user_id.as_deref(), Some("user-2"));

        clear_database(&store);
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_grant_renewal_guard() {
        let store = init_store();
        clear_database(&store);

        let now = Utc::now();
        store
            .upsert_grant(&Grant {
                kind: GrantKind::Lease,
                tenant_id: TENANT.to_string(),
                principal_id: "lease-1".to_string(),
                user_id: "user-1".to_string(),
                token_id: "jti-1".to_string(),
                status: GrantStatus::Active,
                issued_at: now,
                expires_at: now + chrono::Duration::minutes(5),
                last_heartbeat_at: Some(now),
                metadata: json!({}),
            })
            .unwrap();

        let renewal = GrantRenewal {
            previous_token_id: "jti-1",
            token_id: "jti-2",
            at: now,
            expires_at: now + chrono::Duration::minutes(10),
        };
        assert!(store.renew_grant(GrantKind::Lease, TENANT, "lease-1", &renewal).unwrap());
        assert!(!store.renew_grant(GrantKind::Lease, TENANT, "lease-1", &renewal).unwrap());
        let stored = store.find_grant(GrantKind::Lease, TENANT, "lease-1").unwrap().unwrap();
        assert_eq!(stored.token_id, "jti-2");

        clear_database(&store);
    }
}
