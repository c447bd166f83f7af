//! Durable tunnel-spec store (spec §4.9, §6 persistence schema).
//!
//! No teacher module covers this — its own `storage/` is an SFTP file
//! browser. Grounded on `duanebester-pgui`'s `sqlx` usage (the pack's only
//! `sqlx`-dependent example) for the crate choice; the schema and upsert/
//! update-status/delete semantics come from the spec itself.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use crate::error::TunnelError;
use crate::model::{Hop, TunnelSpec, TunnelType};

pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    pub async fn connect(path: &std::path::Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create storage directory {}", parent.display()))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open storage database {}", path.display()))?;

        let storage = Storage { pool };
        storage.migrate().await?;
        Ok(storage)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS tunnels (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                owner TEXT NOT NULL,
                type TEXT NOT NULL,
                hops_json TEXT NOT NULL,
                local_port INTEGER NOT NULL,
                local_bind_address TEXT NOT NULL,
                remote_host TEXT NOT NULL,
                remote_port INTEGER NOT NULL,
                auto_reconnect INTEGER NOT NULL,
                keep_alive_interval_secs INTEGER NOT NULL,
                max_retries INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .context("failed to create tunnels table")?;

        // Schema evolution is additive; "column already exists" is success.
        self.add_column_if_missing("tunnels", "status", "TEXT NOT NULL DEFAULT 'pending'")
            .await?;

        Ok(())
    }

    async fn add_column_if_missing(&self, table: &str, column: &str, definition: &str) -> Result<()> {
        let result = sqlx::query(&format!("ALTER TABLE {table} ADD COLUMN {column} {definition}"))
            .execute(&self.pool)
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.message().contains("duplicate column name") => Ok(()),
            Err(e) => Err(e).context("failed to evolve schema"),
        }
    }

    /// Upsert. Fails only on I/O error; a duplicate `name` surfaces as a
    /// unique-constraint violation mapped to `TunnelError::Conflict`.
    pub async fn save(&self, spec: &TunnelSpec) -> Result<(), TunnelError> {
        let hops_json = serde_json::to_string(&spec.hops).map_err(|e| {
            TunnelError::Internal(format!("failed to serialize hops: {e}"))
        })?;

        let result = sqlx::query(
            "INSERT INTO tunnels
                (id, name, owner, type, hops_json, local_port, local_bind_address,
                 remote_host, remote_port, auto_reconnect, keep_alive_interval_secs,
                 max_retries, status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                owner = excluded.owner,
                type = excluded.type,
                hops_json = excluded.hops_json,
                local_port = excluded.local_port,
                local_bind_address = excluded.local_bind_address,
                remote_host = excluded.remote_host,
                remote_port = excluded.remote_port,
                auto_reconnect = excluded.auto_reconnect,
                keep_alive_interval_secs = excluded.keep_alive_interval_secs,
                max_retries = excluded.max_retries,
                updated_at = excluded.updated_at",
        )
        .bind(&spec.id)
        .bind(&spec.name)
        .bind(&spec.owner)
        .bind(spec.tunnel_type.as_str())
        .bind(hops_json)
        .bind(spec.local_port as i64)
        .bind(&spec.local_bind_address)
        .bind(&spec.remote_host)
        .bind(spec.remote_port as i64)
        .bind(spec.auto_reconnect)
        .bind(spec.keep_alive_interval_secs as i64)
        .bind(spec.max_retries as i64)
        .bind(spec.created_at.to_rfc3339())
        .bind(spec.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(TunnelError::Conflict(format!("tunnel name '{}' already exists", spec.name)))
            }
            Err(e) => Err(TunnelError::Internal(e.to_string())),
        }
    }

    /// Updates `status` and `updated_at`. Fails if `id` is absent.
    pub async fn update_status(&self, id: &str, status: &str) -> Result<(), TunnelError> {
        let result = sqlx::query("UPDATE tunnels SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status)
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| TunnelError::Internal(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(TunnelError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Fails if `id` is absent.
    pub async fn delete(&self, id: &str) -> Result<(), TunnelError> {
        let result = sqlx::query("DELETE FROM tunnels WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| TunnelError::Internal(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(TunnelError::NotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<TunnelSpec, TunnelError> {
        let row = sqlx::query("SELECT * FROM tunnels WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| TunnelError::Internal(e.to_string()))?
            .ok_or_else(|| TunnelError::NotFound(id.to_string()))?;

        row_to_spec(&row).map_err(|e| TunnelError::Internal(e.to_string()))
    }

    /// All specs, newest first.
    pub async fn list(&self) -> Result<Vec<TunnelSpec>, TunnelError> {
        let rows = sqlx::query("SELECT * FROM tunnels ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| TunnelError::Internal(e.to_string()))?;

        rows.iter()
            .map(|r| row_to_spec(r).map_err(|e| TunnelError::Internal(e.to_string())))
            .collect()
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

fn row_to_spec(row: &sqlx::sqlite::SqliteRow) -> Result<TunnelSpec> {
    let tunnel_type = match row.try_get::<String, _>("type")?.as_str() {
        "local" => TunnelType::Local,
        "remote" => TunnelType::Remote,
        "dynamic" => TunnelType::Dynamic,
        other => anyhow::bail!("unknown tunnel type in storage: {other}"),
    };

    let hops_json: String = row.try_get("hops_json")?;
    let hops: Vec<Hop> = serde_json::from_str(&hops_json).context("failed to deserialize hops")?;

    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(TunnelSpec {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        owner: row.try_get("owner")?,
        tunnel_type,
        hops,
        local_port: row.try_get::<i64, _>("local_port")? as u16,
        local_bind_address: row.try_get("local_bind_address")?,
        remote_host: row.try_get("remote_host")?,
        remote_port: row.try_get::<i64, _>("remote_port")? as u16,
        auto_reconnect: row.try_get("auto_reconnect")?,
        keep_alive_interval_secs: row.try_get::<i64, _>("keep_alive_interval_secs")? as u64,
        max_retries: row.try_get::<i64, _>("max_retries")? as u32,
        created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
        updated_at: DateTime::parse_from_rfc3339(&updated_at)?.with_timezone(&Utc),
    })
}
