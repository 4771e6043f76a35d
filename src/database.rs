use std::collections::HashMap;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use log::info;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::config::Config;
use crate::model::{
    CachedLocation, Connection, ConnectionId, LocationMark, LocationType, Member, MemberStatus, Role,
    TransferRecord, TypeSlots, UserId,
};
use crate::store::{LocationStore, TransferPlan};

const SCHEMA_LOCK_KEY: i64 = 0x6772_6f75_706c_6f63;

fn group_column(location_type: LocationType) -> &'static str {
    match location_type {
        LocationType::Bus => "group_bus",
        LocationType::Hotel => "group_hotel",
    }
}

fn personal_column(location_type: LocationType) -> &'static str {
    match location_type {
        LocationType::Bus => "personal_bus",
        LocationType::Hotel => "personal_hotel",
    }
}

fn active_column(location_type: LocationType) -> &'static str {
    match location_type {
        LocationType::Bus => "active_bus",
        LocationType::Hotel => "active_hotel",
    }
}

fn json_column<T>(row: &PgRow, column: &str) -> Result<Option<T>>
where
    T: serde::de::DeserializeOwned + Send + Unpin,
{
    let value: Option<Json<T>> = row.try_get(column)?;
    Ok(value.map(|Json(inner)| inner))
}

#[derive(Clone)]
pub struct PgStore {
    pub pool: PgPool,
}

impl PgStore {
    pub async fn new(config: &Config) -> Result<Self> {
        let database_url = config.database_url();

        let pool = PgPoolOptions::new()
            .max_connections(config.db_max_connections)
            .connect(&database_url)
            .await?;

        Self::with_pool(pool).await
    }

    /// Wraps an existing pool, bootstrapping the schema first.
    pub async fn with_pool(pool: PgPool) -> Result<Self> {
        Self::init_database(&pool).await?;
        Ok(Self { pool })
    }

    async fn init_database(pool: &PgPool) -> Result<()> {
        info!("🔧 initializing group_locations schema...");

        // concurrent bootstraps race on CREATE ... IF NOT EXISTS without this
        let mut tx = pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(SCHEMA_LOCK_KEY)
            .execute(&mut *tx)
            .await?;

        sqlx::query("CREATE SCHEMA IF NOT EXISTS group_locations")
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS group_locations.connections (
                id UUID PRIMARY KEY,
                group_bus JSONB,
                group_hotel JSONB,
                last_transfer JSONB,
                created_at TIMESTAMP WITH TIME ZONE DEFAULT NOW(),
                updated_at TIMESTAMP WITH TIME ZONE DEFAULT NOW()
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS group_locations.members (
                connection_id UUID NOT NULL REFERENCES group_locations.connections(id) ON DELETE CASCADE,
                user_id UUID NOT NULL,
                role VARCHAR(10) NOT NULL CHECK (role IN ('owner', 'member')),
                status VARCHAR(10) NOT NULL CHECK (status IN ('active', 'left')),
                personal_bus JSONB,
                personal_hotel JSONB,
                active_bus JSONB,
                active_hotel JSONB,
                joined_at TIMESTAMP WITH TIME ZONE DEFAULT NOW(),
                PRIMARY KEY (connection_id, user_id)
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        // at most one active owner per connection
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_members_single_owner ON group_locations.members(connection_id) WHERE role = 'owner' AND status = 'active'",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_members_user_id ON group_locations.members(user_id)")
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS group_locations.pending_resyncs (
                connection_id UUID PRIMARY KEY,
                ticket BIGSERIAL,
                queued_at TIMESTAMP WITH TIME ZONE DEFAULT NOW()
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        let tables: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM information_schema.tables WHERE table_schema = 'group_locations' AND table_name IN ('connections', 'members', 'pending_resyncs')",
        )
        .fetch_one(&mut *tx)
        .await?;
        if tables != 3 {
            bail!("group_locations schema is incomplete ({} of 3 tables)", tables);
        }
        tx.commit().await?;

        info!("✅ group_locations schema ready");
        Ok(())
    }

    /// Creates or replaces a connection and its membership rows. Connections
    /// are owned by the membership provider; this exists for fixtures and
    /// operator tooling.
    pub async fn insert_connection(&self, connection: &Connection) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO group_locations.connections (id, group_bus, group_hotel, last_transfer)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE
            SET group_bus = EXCLUDED.group_bus,
                group_hotel = EXCLUDED.group_hotel,
                last_transfer = EXCLUDED.last_transfer,
                updated_at = NOW()
            "#,
        )
        .bind(connection.id.0)
        .bind(connection.group_locations.bus.clone().map(Json))
        .bind(connection.group_locations.hotel.clone().map(Json))
        .bind(connection.last_transfer.clone().map(Json))
        .execute(&mut *tx)
        .await?;

        for member in &connection.members {
            sqlx::query(
                r#"
                INSERT INTO group_locations.members (connection_id, user_id, role, status)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (connection_id, user_id) DO UPDATE
                SET role = EXCLUDED.role, status = EXCLUDED.status
                "#,
            )
            .bind(connection.id.0)
            .bind(member.user_id.0)
            .bind(member.role.as_str())
            .bind(member.status.as_str())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl LocationStore for PgStore {
    async fn connection(&self, connection_id: ConnectionId) -> Result<Option<Connection>> {
        let row = sqlx::query(
            "SELECT id, group_bus, group_hotel, last_transfer FROM group_locations.connections WHERE id = $1",
        )
        .bind(connection_id.0)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let member_rows = sqlx::query(
            "SELECT user_id, role, status FROM group_locations.members WHERE connection_id = $1 ORDER BY joined_at, user_id",
        )
        .bind(connection_id.0)
        .fetch_all(&self.pool)
        .await?;

        let mut members = Vec::with_capacity(member_rows.len());
        for member_row in member_rows {
            let role: String = member_row.try_get("role")?;
            let status: String = member_row.try_get("status")?;
            members.push(Member {
                user_id: UserId(member_row.try_get("user_id")?),
                role: role.parse::<Role>()?,
                status: status.parse::<MemberStatus>()?,
            });
        }

        Ok(Some(Connection {
            id: connection_id,
            members,
            group_locations: TypeSlots {
                bus: json_column(&row, "group_bus")?,
                hotel: json_column(&row, "group_hotel")?,
            },
            last_transfer: json_column::<TransferRecord>(&row, "last_transfer")?,
        }))
    }

    async fn set_group_mark(
        &self,
        connection_id: ConnectionId,
        location_type: LocationType,
        mark: Option<LocationMark>,
    ) -> Result<Option<LocationMark>> {
        let column = group_column(location_type);
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM group_locations.connections WHERE id = $1 FOR UPDATE",
            column
        ))
        .bind(connection_id.0)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| anyhow!("connection {} does not exist", connection_id))?;
        let previous = json_column::<LocationMark>(&row, column)?;

        sqlx::query(&format!(
            "UPDATE group_locations.connections SET {} = $2, updated_at = NOW() WHERE id = $1",
            column
        ))
        .bind(connection_id.0)
        .bind(mark.map(Json))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(previous)
    }

    async fn personal_mark(
        &self,
        connection_id: ConnectionId,
        user_id: UserId,
        location_type: LocationType,
    ) -> Result<Option<LocationMark>> {
        let column = personal_column(location_type);
        let row = sqlx::query(&format!(
            "SELECT {} FROM group_locations.members WHERE connection_id = $1 AND user_id = $2",
            column
        ))
        .bind(connection_id.0)
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => json_column(&row, column),
            None => Ok(None),
        }
    }

    async fn personal_marks(
        &self,
        connection_id: ConnectionId,
    ) -> Result<HashMap<UserId, TypeSlots<LocationMark>>> {
        let rows = sqlx::query(
            r#"
            SELECT user_id, personal_bus, personal_hotel
            FROM group_locations.members
            WHERE connection_id = $1
              AND (personal_bus IS NOT NULL OR personal_hotel IS NOT NULL)
            "#,
        )
        .bind(connection_id.0)
        .fetch_all(&self.pool)
        .await?;

        let mut marks = HashMap::with_capacity(rows.len());
        for row in rows {
            let user_id: Uuid = row.try_get("user_id")?;
            marks.insert(
                UserId(user_id),
                TypeSlots {
                    bus: json_column(&row, "personal_bus")?,
                    hotel: json_column(&row, "personal_hotel")?,
                },
            );
        }
        Ok(marks)
    }

    async fn set_personal_mark(
        &self,
        connection_id: ConnectionId,
        user_id: UserId,
        location_type: LocationType,
        mark: Option<LocationMark>,
    ) -> Result<Option<LocationMark>> {
        let column = personal_column(location_type);
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM group_locations.members WHERE connection_id = $1 AND user_id = $2 FOR UPDATE",
            column
        ))
        .bind(connection_id.0)
        .bind(user_id.0)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| anyhow!("user {} is not a member of connection {}", user_id, connection_id))?;
        let previous = json_column::<LocationMark>(&row, column)?;

        sqlx::query(&format!(
            "UPDATE group_locations.members SET {} = $3 WHERE connection_id = $1 AND user_id = $2",
            column
        ))
        .bind(connection_id.0)
        .bind(user_id.0)
        .bind(mark.map(Json))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(previous)
    }

    async fn write_cache(
        &self,
        connection_id: ConnectionId,
        user_id: UserId,
        entry: CachedLocation,
    ) -> Result<()> {
        let column = active_column(entry.location.location_type);
        let result = sqlx::query(&format!(
            "UPDATE group_locations.members SET {} = $3 WHERE connection_id = $1 AND user_id = $2",
            column
        ))
        .bind(connection_id.0)
        .bind(user_id.0)
        .bind(Json(entry))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            bail!("user {} is not a member of connection {}", user_id, connection_id);
        }
        Ok(())
    }

    async fn cached_locations(
        &self,
        connection_id: ConnectionId,
        user_id: UserId,
    ) -> Result<TypeSlots<CachedLocation>> {
        let row = sqlx::query(
            "SELECT active_bus, active_hotel FROM group_locations.members WHERE connection_id = $1 AND user_id = $2",
        )
        .bind(connection_id.0)
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(TypeSlots {
                bus: json_column(&row, "active_bus")?,
                hotel: json_column(&row, "active_hotel")?,
            }),
            None => Ok(TypeSlots::default()),
        }
    }

    async fn commit_transfer(&self, connection_id: ConnectionId, plan: &TransferPlan) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let roles = sqlx::query(
            r#"
            SELECT user_id, role FROM group_locations.members
            WHERE connection_id = $1 AND user_id = ANY($2) AND status = 'active'
            FOR UPDATE
            "#,
        )
        .bind(connection_id.0)
        .bind(vec![plan.from.0, plan.to.0])
        .fetch_all(&mut *tx)
        .await?;

        let mut from_is_owner = false;
        let mut to_is_active = false;
        for row in &roles {
            let user_id: Uuid = row.try_get("user_id")?;
            let role: String = row.try_get("role")?;
            if user_id == plan.from.0 && role == Role::Owner.as_str() {
                from_is_owner = true;
            }
            if user_id == plan.to.0 {
                to_is_active = true;
            }
        }
        if !from_is_owner {
            bail!("user {} is not the owner of connection {}", plan.from, connection_id);
        }
        if !to_is_active {
            bail!("user {} is not an active member of connection {}", plan.to, connection_id);
        }

        // demote first so the single-owner index never sees two owners
        sqlx::query("UPDATE group_locations.members SET role = 'member' WHERE connection_id = $1 AND user_id = $2")
            .bind(connection_id.0)
            .bind(plan.from.0)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE group_locations.members SET role = 'owner' WHERE connection_id = $1 AND user_id = $2")
            .bind(connection_id.0)
            .bind(plan.to.0)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            UPDATE group_locations.connections
            SET group_bus = $2, group_hotel = $3, last_transfer = $4, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(connection_id.0)
        .bind(plan.group_locations.bus.clone().map(Json))
        .bind(plan.group_locations.hotel.clone().map(Json))
        .bind(Json(plan.record.clone()))
        .execute(&mut *tx)
        .await?;

        let cleared: Vec<Uuid> = plan.clear_personal_for.iter().map(|user_id| user_id.0).collect();
        sqlx::query(
            r#"
            UPDATE group_locations.members
            SET personal_bus = NULL, personal_hotel = NULL
            WHERE connection_id = $1 AND user_id = ANY($2)
            "#,
        )
        .bind(connection_id.0)
        .bind(cleared)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO group_locations.pending_resyncs (connection_id) VALUES ($1) ON CONFLICT DO NOTHING",
        )
        .bind(connection_id.0)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn enqueue_resync(&self, connection_id: ConnectionId) -> Result<()> {
        sqlx::query(
            "INSERT INTO group_locations.pending_resyncs (connection_id) VALUES ($1) ON CONFLICT DO NOTHING",
        )
        .bind(connection_id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn pending_resyncs(&self) -> Result<Vec<ConnectionId>> {
        let ids: Vec<Uuid> =
            sqlx::query_scalar("SELECT connection_id FROM group_locations.pending_resyncs ORDER BY ticket")
                .fetch_all(&self.pool)
                .await?;
        Ok(ids.into_iter().map(ConnectionId).collect())
    }

    async fn clear_resync(&self, connection_id: ConnectionId) -> Result<()> {
        sqlx::query("DELETE FROM group_locations.pending_resyncs WHERE connection_id = $1")
            .bind(connection_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_type_has_distinct_columns() {
        for location_type in LocationType::ALL {
            let columns = [
                group_column(location_type),
                personal_column(location_type),
                active_column(location_type),
            ];
            assert!(columns.iter().all(|column| column.ends_with(location_type.as_str())));
        }
        assert_ne!(group_column(LocationType::Bus), group_column(LocationType::Hotel));
    }
}
