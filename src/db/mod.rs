pub mod models;
pub mod store;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct Database {
    pub pool: Pool<Sqlite>,
}

impl Database {
    /// Create an in-memory SQLite database for tests, with migrations applied.
    #[cfg(test)]
    pub async fn test_db() -> Self {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(1) // critical: multiple connections to :memory: get separate DBs
            .connect_with(options)
            .await
            .expect("connect to in-memory SQLite");

        let db = Self { pool };
        db.migrate().await.expect("run migrations");
        db
    }

    pub async fn connect(db_path: &str) -> Result<Self> {
        if let Some(parent) = std::path::Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        info!(path = %db_path, "Database opened");
        Ok(Self { pool })
    }

    /// Create the schema and apply additive migrations. Safe to run on every
    /// start and against databases created by any prior version: table
    /// creation is IF NOT EXISTS and column additions tolerate the column
    /// already existing.
    pub async fn migrate(&self) -> Result<()> {
        for table in ["instances", "ollama_instances"] {
            sqlx::query(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    id TEXT PRIMARY KEY,
                    kind TEXT NOT NULL,
                    name TEXT NOT NULL,
                    model_ref TEXT,
                    port INTEGER NOT NULL,
                    container_id TEXT,
                    status TEXT NOT NULL DEFAULT 'creating',
                    config TEXT NOT NULL DEFAULT '{{}}',
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                )"
            ))
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to create {table} table"))?;

            // Columns added after the first release.
            self.add_column_if_missing(table, "api_key_hash", "TEXT")
                .await?;
            self.add_column_if_missing(table, "gpu_id", "TEXT").await?;
        }

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS allocated_ports (
                port INTEGER PRIMARY KEY,
                instance_id TEXT NOT NULL,
                allocated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .context("Failed to create allocated_ports table")?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS ollama_models (
                id TEXT PRIMARY KEY,
                instance_id TEXT NOT NULL,
                name TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'downloading',
                size INTEGER,
                digest TEXT,
                modified_at TEXT,
                UNIQUE (instance_id, name)
            )",
        )
        .execute(&self.pool)
        .await
        .context("Failed to create ollama_models table")?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .context("Failed to create settings table")?;

        Ok(())
    }

    /// Additive migration helper: `ALTER TABLE ... ADD COLUMN`, treating
    /// "duplicate column name" as success so re-runs and already-upgraded
    /// databases are fine.
    async fn add_column_if_missing(
        &self,
        table: &str,
        column: &str,
        column_type: &str,
    ) -> Result<()> {
        let sql = format!("ALTER TABLE {table} ADD COLUMN {column} {column_type}");
        match sqlx::query(&sql).execute(&self.pool).await {
            Ok(_) => {
                info!(table, column, "Added column");
                Ok(())
            }
            Err(e) if e.to_string().contains("duplicate column name") => {
                debug!(table, column, "Column already present");
                Ok(())
            }
            Err(e) => Err(anyhow::Error::new(e))
                .with_context(|| format!("Failed to add {table}.{column}")),
        }
    }
}
