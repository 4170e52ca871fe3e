//! Postgres catalogue implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use uuid::Uuid;

use memoh_core::config::PostgresConfig;
use memoh_core::{Error, Result};

use crate::catalogue::{Catalogue, VersionTransaction};
use crate::types::{
    ContainerRow, ContainerStatus, EventRow, NewContainer, SnapshotRow, UserRow, VersionRow,
};

/// Catalogue backed by a Postgres pool.
pub struct PgCatalogue {
    pool: PgPool,
}

impl PgCatalogue {
    /// Connect and bootstrap the schema.
    pub async fn connect(config: &PostgresConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(&config.dsn())
            .await
            .map_err(db_err)?;
        let catalogue = Self { pool };
        catalogue.ensure_schema().await?;
        Ok(catalogue)
    }

    /// Wrap an existing pool (shared with collaborator subsystems).
    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn ensure_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        }
        Ok(())
    }

    fn container_from_row(row: &sqlx::postgres::PgRow) -> Result<ContainerRow> {
        Ok(ContainerRow {
            id: row.get("id"),
            user_id: row.get("user_id"),
            container_id: row.get("container_id"),
            container_name: row.get("container_name"),
            image: row.get("image"),
            status: ContainerStatus::parse(row.get::<&str, _>("status"))?,
            namespace: row.get("namespace"),
            auto_start: row.get("auto_start"),
            host_path: row.get("host_path"),
            container_path: row.get("container_path"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            last_started_at: row.get("last_started_at"),
            last_stopped_at: row.get("last_stopped_at"),
        })
    }
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id UUID PRIMARY KEY,
        username TEXT NOT NULL UNIQUE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS containers (
        id UUID PRIMARY KEY,
        user_id TEXT NOT NULL,
        container_id TEXT NOT NULL UNIQUE,
        container_name TEXT NOT NULL UNIQUE,
        image TEXT NOT NULL,
        status TEXT NOT NULL,
        namespace TEXT NOT NULL,
        auto_start BOOLEAN NOT NULL DEFAULT FALSE,
        host_path TEXT,
        container_path TEXT NOT NULL DEFAULT '/data',
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        last_started_at TIMESTAMPTZ,
        last_stopped_at TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS snapshots (
        id UUID PRIMARY KEY,
        container_id TEXT NOT NULL REFERENCES containers(container_id) ON DELETE CASCADE,
        parent_snapshot_id TEXT,
        snapshotter TEXT NOT NULL,
        snapshot_key TEXT NOT NULL,
        digest TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS container_versions (
        id UUID PRIMARY KEY,
        container_id TEXT NOT NULL REFERENCES containers(container_id) ON DELETE CASCADE,
        snapshot_id TEXT NOT NULL,
        version INTEGER NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        UNIQUE (container_id, version)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS lifecycle_events (
        id UUID PRIMARY KEY,
        container_id TEXT NOT NULL REFERENCES containers(container_id) ON DELETE CASCADE,
        event_type TEXT NOT NULL,
        payload JSONB NOT NULL DEFAULT '{}'::jsonb,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
];

fn db_err(err: sqlx::Error) -> Error {
    Error::internal(format!("database error: {err}"))
}

/// Map duplicate-version and serialization failures to `Conflict`.
fn version_conflict(container_id: &str, version: i32, err: sqlx::Error) -> Error {
    match &err {
        sqlx::Error::Database(db)
            if db.is_unique_violation() || db.code().as_deref() == Some("40001") =>
        {
            Error::Conflict(format!(
                "version {version} of {container_id} already recorded"
            ))
        }
        _ => db_err(err),
    }
}

/// An open serializable transaction that has reserved the next version
/// number for one container.
struct PgVersionTransaction {
    tx: sqlx::Transaction<'static, sqlx::Postgres>,
    container_id: String,
    version: i32,
}

#[async_trait]
impl VersionTransaction for PgVersionTransaction {
    fn version(&self) -> i32 {
        self.version
    }

    async fn commit(
        self: Box<Self>,
        snapshot_name: &str,
        parent_snapshot_id: Option<&str>,
        snapshotter: &str,
    ) -> Result<VersionRow> {
        let Self {
            mut tx,
            container_id,
            version,
        } = *self;

        sqlx::query(
            r#"
            INSERT INTO snapshots (id, container_id, parent_snapshot_id, snapshotter, snapshot_key)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&container_id)
        .bind(parent_snapshot_id)
        .bind(snapshotter)
        .bind(snapshot_name)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let row = sqlx::query(
            r#"
            INSERT INTO container_versions (id, container_id, snapshot_id, version)
            VALUES ($1, $2, $3, $4)
            RETURNING id, container_id, snapshot_id, version, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&container_id)
        .bind(snapshot_name)
        .bind(version)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| version_conflict(&container_id, version, e))?;

        let record = VersionRow {
            id: row.get("id"),
            container_id: row.get("container_id"),
            snapshot_id: row.get("snapshot_id"),
            version: row.get("version"),
            created_at: row.get("created_at"),
        };

        tx.commit()
            .await
            .map_err(|e| version_conflict(&container_id, version, e))?;
        Ok(record)
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await.map_err(db_err)
    }
}

#[async_trait]
impl Catalogue for PgCatalogue {
    async fn create_user(&self, username: &str) -> Result<UserRow> {
        self.create_user_with_id(Uuid::new_v4(), username).await
    }

    async fn create_user_with_id(&self, id: Uuid, username: &str) -> Result<UserRow> {
        let row = sqlx::query(
            "INSERT INTO users (id, username) VALUES ($1, $2) RETURNING id, username, created_at",
        )
        .bind(id)
        .bind(username)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Error::Conflict(format!("user {username} already exists"))
            }
            _ => db_err(e),
        })?;
        Ok(UserRow {
            id: row.get("id"),
            username: row.get("username"),
            created_at: row.get("created_at"),
        })
    }

    async fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        let row = sqlx::query("SELECT id, username, created_at FROM users WHERE username = $1")
            .bind(username)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.map(|r| UserRow {
            id: r.get("id"),
            username: r.get("username"),
            created_at: r.get("created_at"),
        }))
    }

    async fn get_user_by_id(&self, id: Uuid) -> Result<Option<UserRow>> {
        let row = sqlx::query("SELECT id, username, created_at FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.map(|r| UserRow {
            id: r.get("id"),
            username: r.get("username"),
            created_at: r.get("created_at"),
        }))
    }

    async fn upsert_user_by_username(&self, username: &str) -> Result<UserRow> {
        let row = sqlx::query(
            r#"
            INSERT INTO users (id, username) VALUES ($1, $2)
            ON CONFLICT (username) DO UPDATE SET username = EXCLUDED.username
            RETURNING id, username, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(username)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(UserRow {
            id: row.get("id"),
            username: row.get("username"),
            created_at: row.get("created_at"),
        })
    }

    async fn count_users(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM users")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.get("count"))
    }

    async fn create_container(&self, new: NewContainer) -> Result<ContainerRow> {
        let row = sqlx::query(
            r#"
            INSERT INTO containers
                (id, user_id, container_id, container_name, image, status,
                 namespace, auto_start, host_path, container_path)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&new.user_id)
        .bind(&new.container_id)
        .bind(&new.container_name)
        .bind(&new.image)
        .bind(ContainerStatus::Created.as_str())
        .bind(&new.namespace)
        .bind(new.auto_start)
        .bind(&new.host_path)
        .bind(&new.container_path)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Error::Conflict(format!("container {} already exists", new.container_id))
            }
            _ => db_err(e),
        })?;
        Self::container_from_row(&row)
    }

    async fn get_container(&self, container_id: &str) -> Result<Option<ContainerRow>> {
        let row = sqlx::query("SELECT * FROM containers WHERE container_id = $1")
            .bind(container_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(|r| Self::container_from_row(&r)).transpose()
    }

    async fn list_containers_by_user(&self, user_id: &str) -> Result<Vec<ContainerRow>> {
        let rows =
            sqlx::query("SELECT * FROM containers WHERE user_id = $1 ORDER BY created_at")
                .bind(user_id)
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?;
        rows.iter().map(Self::container_from_row).collect()
    }

    async fn update_container_status(
        &self,
        container_id: &str,
        status: ContainerStatus,
        started: bool,
        stopped: bool,
    ) -> Result<()> {
        let now: DateTime<Utc> = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE containers SET
                status = $2,
                updated_at = $3,
                last_started_at = CASE WHEN $4 THEN $3 ELSE last_started_at END,
                last_stopped_at = CASE WHEN $5 THEN $3 ELSE last_stopped_at END
            WHERE container_id = $1
            "#,
        )
        .bind(container_id)
        .bind(status.as_str())
        .bind(now)
        .bind(started)
        .bind(stopped)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("container", container_id));
        }
        Ok(())
    }

    async fn delete_container(&self, container_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM containers WHERE container_id = $1")
            .bind(container_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn insert_snapshot(
        &self,
        container_id: &str,
        snapshot_key: &str,
        parent_snapshot_id: Option<&str>,
        snapshotter: &str,
    ) -> Result<SnapshotRow> {
        let row = sqlx::query(
            r#"
            INSERT INTO snapshots (id, container_id, parent_snapshot_id, snapshotter, snapshot_key)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, container_id, parent_snapshot_id, snapshotter, snapshot_key, digest, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(container_id)
        .bind(parent_snapshot_id)
        .bind(snapshotter)
        .bind(snapshot_key)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(SnapshotRow {
            id: row.get("id"),
            container_id: row.get("container_id"),
            parent_snapshot_id: row.get("parent_snapshot_id"),
            snapshotter: row.get("snapshotter"),
            snapshot_key: row.get("snapshot_key"),
            digest: row.get("digest"),
            created_at: row.get("created_at"),
        })
    }

    async fn list_snapshots(&self, container_id: &str) -> Result<Vec<SnapshotRow>> {
        let rows = sqlx::query(
            r#"
            SELECT id, container_id, parent_snapshot_id, snapshotter, snapshot_key, digest, created_at
            FROM snapshots WHERE container_id = $1 ORDER BY created_at
            "#,
        )
        .bind(container_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows
            .into_iter()
            .map(|r| SnapshotRow {
                id: r.get("id"),
                container_id: r.get("container_id"),
                parent_snapshot_id: r.get("parent_snapshot_id"),
                snapshotter: r.get("snapshotter"),
                snapshot_key: r.get("snapshot_key"),
                digest: r.get("digest"),
                created_at: r.get("created_at"),
            })
            .collect())
    }

    async fn delete_snapshot(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM snapshots WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn next_version(&self, container_id: &str) -> Result<i32> {
        let row = sqlx::query(
            "SELECT COALESCE(MAX(version), 0) + 1 AS next FROM container_versions WHERE container_id = $1",
        )
        .bind(container_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.get("next"))
    }

    async fn begin_version(&self, container_id: &str) -> Result<Box<dyn VersionTransaction>> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        let row = sqlx::query(
            "SELECT COALESCE(MAX(version), 0) + 1 AS next FROM container_versions WHERE container_id = $1",
        )
        .bind(container_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;

        Ok(Box::new(PgVersionTransaction {
            tx,
            container_id: container_id.to_string(),
            version: row.get("next"),
        }))
    }

    async fn list_versions(&self, container_id: &str) -> Result<Vec<VersionRow>> {
        let rows = sqlx::query(
            r#"
            SELECT id, container_id, snapshot_id, version, created_at
            FROM container_versions WHERE container_id = $1 ORDER BY version
            "#,
        )
        .bind(container_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows
            .into_iter()
            .map(|r| VersionRow {
                id: r.get("id"),
                container_id: r.get("container_id"),
                snapshot_id: r.get("snapshot_id"),
                version: r.get("version"),
                created_at: r.get("created_at"),
            })
            .collect())
    }

    async fn version_snapshot_id(
        &self,
        container_id: &str,
        version: i32,
    ) -> Result<Option<String>> {
        let row = sqlx::query(
            "SELECT snapshot_id FROM container_versions WHERE container_id = $1 AND version = $2",
        )
        .bind(container_id)
        .bind(version)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.map(|r| r.get("snapshot_id")))
    }

    async fn append_event(
        &self,
        container_id: &str,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<EventRow> {
        let row = sqlx::query(
            r#"
            INSERT INTO lifecycle_events (id, container_id, event_type, payload)
            VALUES ($1, $2, $3, $4)
            RETURNING id, container_id, event_type, payload, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(container_id)
        .bind(event_type)
        .bind(&payload)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(EventRow {
            id: row.get("id"),
            container_id: row.get("container_id"),
            event_type: row.get("event_type"),
            payload: row.get("payload"),
            created_at: row.get("created_at"),
        })
    }

    async fn list_events(&self, container_id: &str) -> Result<Vec<EventRow>> {
        let rows = sqlx::query(
            r#"
            SELECT id, container_id, event_type, payload, created_at
            FROM lifecycle_events WHERE container_id = $1 ORDER BY created_at, id
            "#,
        )
        .bind(container_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows
            .into_iter()
            .map(|r| EventRow {
                id: r.get("id"),
                container_id: r.get("container_id"),
                event_type: r.get("event_type"),
                payload: r.get("payload"),
                created_at: r.get("created_at"),
            })
            .collect())
    }
}
