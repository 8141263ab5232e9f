//! Database connection management and migrations.

use anyhow::Context as _;
use sqlx::SqlitePool;
use std::path::Path;

/// SQLite connection bundle for the dispatcher.
pub struct Db {
    pub pool: SqlitePool,
}

impl Db {
    /// Connect and run embedded migrations.
    pub async fn connect(data_dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data dir: {}", data_dir.display()))?;

        let url = format!("sqlite:{}?mode=rwc", data_dir.join("taskcast.db").display());
        let pool = SqlitePool::connect(&url)
            .await
            .with_context(|| "failed to connect to SQLite")?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .with_context(|| "failed to run database migrations")?;

        Ok(Self { pool })
    }

    /// Close the connection pool gracefully.
    pub async fn close(self) {
        self.pool.close().await;
    }
}
