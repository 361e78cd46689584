use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde_json::Value;

use crate::models::schema::{grants, subscriptions};
use crate::store::{Grant, GrantKind, GrantRenewal, GrantStatus, StoreError, SubscriptionStatus};

#[derive(Queryable, Selectable, Insertable, AsChangeset, Debug, Clone, PartialEq)]
#[diesel(check_for_backend(diesel::pg::Pg))]
#[diesel(table_name = grants)]
#[diesel(primary_key(kind, tenant_id, principal_id))]
#[diesel(treat_none_as_null = true)]
pub struct GrantRow {
    pub kind: String,
    pub tenant_id: String,
    pub principal_id: String,
    pub user_id: String,
    pub token_id: String,
    pub status: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub metadata: Value,
}

impl GrantRow {
    pub fn new(grant: &Grant) -> Self {
        Self {
            kind: grant.kind.as_str().to_string(),
            tenant_id: grant.tenant_id.clone(),
            principal_id: grant.principal_id.clone(),
            user_id: grant.user_id.clone(),
            token_id: grant.token_id.clone(),
            status: grant.status.as_str().to_string(),
            issued_at: grant.issued_at,
            expires_at: grant.expires_at,
            last_heartbeat_at: grant.last_heartbeat_at,
            metadata: grant.metadata.clone(),
        }
    }

    /// Replaces the whole row, so the stored `token_id` always names the
    /// newest token.
    pub fn upsert(&self, conn: &mut PgConnection) -> QueryResult<()> {
        diesel::insert_into(grants::table)
            .values(self)
            .on_conflict((grants::kind, grants::tenant_id, grants::principal_id))
            .do_update()
            .set(self)
            .execute(conn)?;
        Ok(())
    }

    pub fn find(
        conn: &mut PgConnection,
        kind: GrantKind,
        tenant_id: &str,
        principal_id: &str,
    ) -> QueryResult<Option<Self>> {
        grants::table
            .filter(grants::kind.eq(kind.as_str()))
            .filter(grants::tenant_id.eq(tenant_id))
            .filter(grants::principal_id.eq(principal_id))
            .select(Self::as_select())
            .first(conn)
            .optional()
    }

    pub fn update_status(
        conn: &mut PgConnection,
        kind: GrantKind,
        tenant_id: &str,
        principal_id: &str,
        from: &[GrantStatus],
        to: GrantStatus,
    ) -> QueryResult<bool> {
        let from: Vec<&str> = from.iter().map(|status| status.as_str()).collect();
        let updated = diesel::update(
            grants::table
                .filter(grants::kind.eq(kind.as_str()))
                .filter(grants::tenant_id.eq(tenant_id))
                .filter(grants::principal_id.eq(principal_id))
                .filter(grants::status.eq_any(from)),
        )
        .set(grants::status.eq(to.as_str()))
        .execute(conn)?;
        Ok(updated > 0)
    }

    pub fn renew(
        conn: &mut PgConnection,
        kind: GrantKind,
        tenant_id: &str,
        principal_id: &str,
        renewal: &GrantRenewal<'_>,
    ) -> QueryResult<bool> {
        let updated = diesel::update(
            grants::table
                .filter(grants::kind.eq(kind.as_str()))
                .filter(grants::tenant_id.eq(tenant_id))
                .filter(grants::principal_id.eq(principal_id))
                .filter(grants::status.eq(GrantStatus::Active.as_str()))
                .filter(grants::token_id.eq(renewal.previous_token_id)),
        )
        .set((
            grants::token_id.eq(renewal.token_id),
            grants::last_heartbeat_at.eq(Some(renewal.at)),
            grants::expires_at.eq(renewal.expires_at),
        ))
        .execute(conn)?;
        Ok(updated > 0)
    }
}

impl TryFrom<GrantRow> for Grant {
    type Error = StoreError;

    fn try_from(row: GrantRow) -> Result<Self, Self::Error> {
        let kind = GrantKind::parse(&row.kind)
            .ok_or_else(|| StoreError::Corrupt(format!("grant kind {:?}", row.kind)))?;
        let status = GrantStatus::parse(&row.status)
            .ok_or_else(|| StoreError::Corrupt(format!("grant status {:?}", row.status)))?;
        Ok(Grant {
            kind,
            tenant_id: row.tenant_id,
            principal_id: row.principal_id,
            user_id: row.user_id,
            token_id: row.token_id,
            status,
            issued_at: row.issued_at,
            expires_at: row.expires_at,
            last_heartbeat_at: row.last_heartbeat_at,
            metadata: row.metadata,
        })
    }
}

pub fn subscription_status(
    conn: &mut PgConnection,
    tenant_id: &str,
    user_id: &str,
) -> Result<Option<SubscriptionStatus>, StoreError> {
    let raw: Option<String> = subscriptions::table
        .filter(subscriptions::tenant_id.eq(tenant_id))
        .filter(subscriptions::user_id.eq(user_id))
        .select(subscriptions::status)
        .first(conn)
        .optional()?;
    raw.map(|raw| {
        SubscriptionStatus::parse(&raw)
            .ok_or_else(|| StoreError::Corrupt(format!("subscription status {raw:?}")))
    })
    .transpose()
}

/// Subscriptions are owned by billing.
#[cfg(test)]
pub fn upsert_subscription(
    conn: &mut PgConnection,
    tenant_id: &str,
    user_id: &str,
    status: &str,
) -> QueryResult<()> {
    diesel::insert_into(subscriptions::table)
        .values((
            subscriptions::tenant_id.eq(tenant_id),
            subscriptions::user_id.eq(user_id),
            subscriptions::status.eq(status),
        ))
        .on_conflict((subscriptions::tenant_id, subscriptions::user_id))
        .do_update()
        .set(subscriptions::status.eq(status))
        .execute(conn)?;
    Ok(())
}
