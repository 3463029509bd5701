//! Database setup and schema bootstrap.

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

/// SQLite-backed database handle.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the database at `path` and run the schema.
    pub async fn open(path: &Path) -> Result<Self> {
        let url = format!("sqlite://{}", path.display());
        let options = SqliteConnectOptions::from_str(&url)
            .with_context(|| format!("parsing database url: {}", url))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("opening database at {:?}", path))?;
        let db = Self { pool };
        db.bootstrap().await?;
        Ok(db)
    }

    /// In-memory database for tests. Pinned to a single long-lived
    /// connection: SQLite gives every connection its own `:memory:` store,
    /// and an idle-reaped connection would wipe it.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .context("opening in-memory database")?;
        let db = Self { pool };
        db.bootstrap().await?;
        Ok(db)
    }

    /// Access the underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create tables if they do not exist yet.
    async fn bootstrap(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                directory TEXT,
                adapter TEXT NOT NULL,
                runner_session_id TEXT,
                approval_mode TEXT NOT NULL,
                name TEXT NOT NULL,
                summary TEXT,
                exit_code INTEGER,
                runner_header TEXT,
                platform TEXT,
                platform_thread_id TEXT,
                created_at TEXT NOT NULL,
                started_at TEXT,
                ended_at TEXT,
                last_activity_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("creating sessions table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                seq INTEGER NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("creating messages table")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_session ON messages (session_id, seq)",
        )
        .execute(&self.pool)
        .await
        .context("creating messages index")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bootstrap_is_idempotent() {
        let db = Database::in_memory().await.unwrap();
        db.bootstrap().await.unwrap();
        db.bootstrap().await.unwrap();
    }
}
