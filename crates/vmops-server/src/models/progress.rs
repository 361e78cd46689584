use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde_json::Value;

use crate::models::schema::setup_progress;
use crate::store::{NewProgressEntry, ProgressEntry};

#[derive(Queryable, Selectable, Debug, Clone, PartialEq)]
#[diesel(check_for_backend(diesel::pg::Pg))]
#[diesel(table_name = setup_progress)]
pub struct ProgressRow {
    pub id: i64,
    pub tenant_id: String,
    pub device_id: String,
    pub step: String,
    pub status: String,
    pub details: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Insertable)]
#[diesel(table_name = setup_progress)]
pub struct NewProgressRow<'a> {
    pub tenant_id: &'a str,
    pub device_id: &'a str,
    pub step: &'a str,
    pub status: &'a str,
    pub details: &'a Value,
    pub created_at: DateTime<Utc>,
}

impl ProgressRow {
    pub fn append(conn: &mut PgConnection, entry: &NewProgressEntry) -> QueryResult<Self> {
        let new = NewProgressRow {
            tenant_id: &entry.tenant_id,
            device_id: &entry.device_id,
            step: &entry.step,
            status: &entry.status,
            details: &entry.details,
            created_at: entry.created_at,
        };
        diesel::insert_into(setup_progress::table)
            .values(&new)
            .returning(Self::as_returning())
            .get_result(conn)
    }

    pub fn list(conn: &mut PgConnection, tenant_id: &str, device_id: &str) -> QueryResult<Vec<Self>> {
        setup_progress::table
            .filter(setup_progress::tenant_id.eq(tenant_id))
            .filter(setup_progress::device_id.eq(device_id))
            .order(setup_progress::id.asc())
            .select(Self::as_select())
            .load(conn)
    }
}

impl From<ProgressRow> for ProgressEntry {
    fn from(row: ProgressRow) -> Self {
        ProgressEntry {
            id: row.id,
            tenant_id: row.tenant_id,
            device_id: row.device_id,
            step: row.step,
            status: row.status,
            details: row.details,
            created_at: row.created_at,
        }
    }
}
