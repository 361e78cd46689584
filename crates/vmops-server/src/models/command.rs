use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde_json::Value;
use vmops_control_plane::{Command, CommandStatus};

use crate::models::schema::commands;
use crate::store::{CommandFilter, DuplicateQuery, StatusChange, StoreError};

#[derive(Queryable, Selectable, Insertable, Debug, Clone, PartialEq)]
#[diesel(check_for_backend(diesel::pg::Pg))]
#[diesel(table_name = commands)]
pub struct CommandRow {
    pub id: String,
    pub tenant_id: String,
    pub agent_id: String,
    pub command_type: String,
    pub payload: Value,
    pub status: String,
    pub result: Option<Value>,
    pub error_message: Option<String>,
    pub dedupe_key: Option<String>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub created_by: String,
}

/// Columns written by a status transition. `None` leaves a column untouched.
#[derive(AsChangeset)]
#[diesel(table_name = commands)]
struct CommandTransition<'a> {
    status: &'a str,
    result: Option<&'a Value>,
    error_message: Option<&'a str>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

const QUEUED: &str = "queued";
const SUCCEEDED: &str = "succeeded";

impl CommandRow {
    pub fn new(command: &Command, dedupe_key: Option<&str>) -> Self {
        Self {
            id: command.id.clone(),
            tenant_id: command.tenant_id.clone(),
            agent_id: command.agent_id.clone(),
            command_type: command.command_type.as_str().to_string(),
            payload: command.payload.clone(),
            status: command.status.as_str().to_string(),
            result: command.result.clone(),
            error_message: command.error_message.clone(),
            dedupe_key: dedupe_key.map(str::to_string),
            queued_at: command.queued_at,
            started_at: command.started_at,
            completed_at: command.completed_at,
            expires_at: command.expires_at,
            created_by: command.created_by.clone(),
        }
    }

    pub fn insert(&self, conn: &mut PgConnection) -> QueryResult<()> {
        diesel::insert_into(commands::table)
            .values(self)
            .execute(conn)?;
        Ok(())
    }

    pub fn find(
        conn: &mut PgConnection,
        tenant_id: &str,
        command_id: &str,
    ) -> QueryResult<Option<Self>> {
        commands::table
            .filter(commands::id.eq(command_id))
            .filter(commands::tenant_id.eq(tenant_id))
            .select(Self::as_select())
            .first(conn)
            .optional()
    }

    pub fn find_recent_duplicate(
        conn: &mut PgConnection,
        query: &DuplicateQuery<'_>,
    ) -> QueryResult<Option<Self>> {
        let queued_recently = commands::status
            .eq(QUEUED)
            .and(commands::queued_at.ge(query.since));
        let succeeded_recently = commands::status
            .eq(SUCCEEDED)
            .and(commands::completed_at.is_not_null())
            .and(commands::completed_at.assume_not_null().ge(query.since));

        commands::table
            .filter(commands::tenant_id.eq(query.tenant_id))
            .filter(commands::agent_id.eq(query.agent_id))
            .filter(commands::created_by.eq(query.created_by))
            .filter(commands::command_type.eq(query.command_type.as_str()))
            .filter(commands::dedupe_key.eq(query.dedupe_key))
            .filter(queued_recently.or(succeeded_recently))
            .order(commands::queued_at.desc())
            .select(Self::as_select())
            .first(conn)
            .optional()
    }

    pub fn oldest_queued(
        conn: &mut PgConnection,
        tenant_id: &str,
        agent_id: &str,
    ) -> QueryResult<Option<Self>> {
        commands::table
            .filter(commands::tenant_id.eq(tenant_id))
            .filter(commands::agent_id.eq(agent_id))
            .filter(commands::status.eq(QUEUED))
            .order((commands::queued_at.asc(), commands::id.asc()))
            .select(Self::as_select())
            .first(conn)
            .optional()
    }

    /// `update ... where status = <expected>`; `None` when nothing matched.
    pub fn transition(
        conn: &mut PgConnection,
        tenant_id: &str,
        command_id: &str,
        expected: CommandStatus,
        change: &StatusChange,
    ) -> QueryResult<Option<Self>> {
        let changeset = CommandTransition {
            status: change.status.as_str(),
            result: change.result.as_ref(),
            error_message: change.error_message.as_deref(),
            started_at: change.started_at(),
            completed_at: change.completed_at(),
        };
        diesel::update(
            commands::table
                .filter(commands::id.eq(command_id))
                .filter(commands::tenant_id.eq(tenant_id))
                .filter(commands::status.eq(expected.as_str())),
        )
        .set(&changeset)
        .returning(Self::as_returning())
        .get_result(conn)
        .optional()
    }

    pub fn list(conn: &mut PgConnection, filter: &CommandFilter<'_>) -> QueryResult<Vec<Self>> {
        let mut query = commands::table
            .filter(commands::tenant_id.eq(filter.tenant_id))
            .filter(commands::agent_id.eq(filter.agent_id))
            .into_boxed();
        if let Some(status) = filter.status {
            query = query.filter(commands::status.eq(status.as_str()));
        }
        if let Some(created_by) = filter.created_by {
            query = query.filter(commands::created_by.eq(created_by));
        }
        query
            .order((commands::queued_at.desc(), commands::id.desc()))
            .limit(filter.limit as i64)
            .select(Self::as_select())
            .load(conn)
    }

    pub fn expired_queued(
        conn: &mut PgConnection,
        now: DateTime<Utc>,
        limit: usize,
    ) -> QueryResult<Vec<Self>> {
        commands::table
            .filter(commands::status.eq(QUEUED))
            .filter(commands::expires_at.le(now))
            .order(commands::expires_at.asc())
            .limit(limit as i64)
            .select(Self::as_select())
            .load(conn)
    }
}

impl TryFrom<CommandRow> for Command {
    type Error = StoreError;

    fn try_from(row: CommandRow) -> Result<Self, Self::Error> {
        let command_type = row
            .command_type
            .parse()
            .map_err(|err| StoreError::Corrupt(format!("command {}: {err}", row.id)))?;
        let status = CommandStatus::parse(&row.status).ok_or_else(|| {
            StoreError::Corrupt(format!("command {} has status {:?}", row.id, row.status))
        })?;
        Ok(Command {
            id: row.id,
            tenant_id: row.tenant_id,
            agent_id: row.agent_id,
            command_type,
            payload: row.payload,
            status,
            result: row.result,
            error_message: row.error_message,
            queued_at: row.queued_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            expires_at: row.expires_at,
            created_by: row.created_by,
        })
    }
}
