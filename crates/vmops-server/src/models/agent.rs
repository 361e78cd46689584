use chrono::{DateTime, Utc};
use diesel::prelude::*;

use crate::models::schema::agents;
use crate::store::{Agent, AgentStatus, StoreError};

#[derive(Queryable, Selectable, Debug, Clone, PartialEq)]
#[diesel(check_for_backend(diesel::pg::Pg))]
#[diesel(table_name = agents)]
pub struct AgentRow {
    pub id: String,
    pub tenant_id: String,
    pub owner_user_id: Option<String>,
    pub status: String,
    pub last_seen_at: Option<DateTime<Utc>>,
}

#[derive(Insertable)]
#[diesel(table_name = agents)]
pub struct NewAgentRow<'a> {
    pub id: &'a str,
    pub tenant_id: &'a str,
    pub owner_user_id: Option<&'a str>,
    pub status: &'a str,
    pub last_seen_at: Option<DateTime<Utc>>,
}

impl AgentRow {
    pub fn find(
        conn: &mut PgConnection,
        tenant_id: &str,
        agent_id: &str,
    ) -> QueryResult<Option<Self>> {
        agents::table
            .filter(agents::id.eq(agent_id))
            .filter(agents::tenant_id.eq(tenant_id))
            .select(Self::as_select())
            .first(conn)
            .optional()
    }

    pub fn touch(
        conn: &mut PgConnection,
        tenant_id: &str,
        agent_id: &str,
        seen_at: DateTime<Utc>,
    ) -> QueryResult<bool> {
        let updated = diesel::update(
            agents::table
                .filter(agents::id.eq(agent_id))
                .filter(agents::tenant_id.eq(tenant_id)),
        )
        .set(agents::last_seen_at.eq(Some(seen_at)))
        .execute(conn)?;
        Ok(updated > 0)
    }

    pub fn upsert(conn: &mut PgConnection, agent: &Agent) -> QueryResult<()> {
        let new = NewAgentRow {
            id: &agent.id,
            tenant_id: &agent.tenant_id,
            owner_user_id: agent.owner_user_id.as_deref(),
            status: agent.status.as_str(),
            last_seen_at: agent.last_seen_at,
        };
        diesel::insert_into(agents::table)
            .values(&new)
            .on_conflict((agents::tenant_id, agents::id))
            .do_update()
            .set((
                agents::owner_user_id.eq(new.owner_user_id),
                agents::status.eq(new.status),
                agents::last_seen_at.eq(new.last_seen_at),
            ))
            .execute(conn)?;
        Ok(())
    }
}

impl TryFrom<AgentRow> for Agent {
    type Error = StoreError;

    fn try_from(row: AgentRow) -> Result<Self, Self::Error> {
        let status = AgentStatus::parse(&row.status).ok_or_else(|| {
            StoreError::Corrupt(format!("agent {} has status {:?}", row.id, row.status))
        })?;
        Ok(Agent {
            id: row.id,
            tenant_id: row.tenant_id,
            owner_user_id: row.owner_user_id,
            status,
            last_seen_at: row.last_seen_at,
        })
    }
}
