use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

/// Stable row keys for the persisted credential pair. The two rows are
/// written and deleted together, never independently.
pub const ACCESS_TOKEN_KEY: &str = "access_token";
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCredentials {
    pub access_token: String,
    pub refresh_token: String,
    pub updated_at: DateTime<Utc>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        let storage = Self { pool };
        storage.ensure_credentials_table().await?;
        Ok(storage)
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    async fn ensure_credentials_table(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS client_credentials (
                name       TEXT PRIMARY KEY,
                value      TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure client_credentials table exists")?;
        Ok(())
    }

    /// Loads the persisted token pair. A row set missing either key is
    /// treated as absent; the pair is only meaningful as a whole.
    pub async fn load_credentials(&self) -> Result<Option<StoredCredentials>> {
        let rows = sqlx::query(
            "SELECT name, value, updated_at FROM client_credentials WHERE name IN (?, ?)",
        )
        .bind(ACCESS_TOKEN_KEY)
        .bind(REFRESH_TOKEN_KEY)
        .fetch_all(&self.pool)
        .await
        .context("failed to load client credentials")?;

        let mut access_token = None;
        let mut refresh_token = None;
        let mut updated_at: Option<DateTime<Utc>> = None;
        for row in rows {
            let name: String = row.try_get("name")?;
            let value: String = row.try_get("value")?;
            let row_updated_at: DateTime<Utc> = row.try_get("updated_at")?;
            match name.as_str() {
                ACCESS_TOKEN_KEY => access_token = Some(value),
                REFRESH_TOKEN_KEY => refresh_token = Some(value),
                _ => {}
            }
            if updated_at.is_none_or(|current| row_updated_at > current) {
                updated_at = Some(row_updated_at);
            }
        }

        match (access_token, refresh_token, updated_at) {
            (Some(access_token), Some(refresh_token), Some(updated_at)) => {
                Ok(Some(StoredCredentials {
                    access_token,
                    refresh_token,
                    updated_at,
                }))
            }
            _ => Ok(None),
        }
    }

    pub async fn save_credentials(&self, access_token: &str, refresh_token: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for (name, value) in [
            (ACCESS_TOKEN_KEY, access_token),
            (REFRESH_TOKEN_KEY, refresh_token),
        ] {
            sqlx::query(
                "INSERT INTO client_credentials (name, value, updated_at) VALUES (?, ?, CURRENT_TIMESTAMP)
                 ON CONFLICT(name) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP",
            )
            .bind(name)
            .bind(value)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to save credential row '{name}'"))?;
        }
        tx.commit().await.context("failed to commit credentials")?;
        Ok(())
    }

    /// Deletes both credential rows in one statement.
    pub async fn clear_credentials(&self) -> Result<()> {
        sqlx::query("DELETE FROM client_credentials WHERE name IN (?, ?)")
            .bind(ACCESS_TOKEN_KEY)
            .bind(REFRESH_TOKEN_KEY)
            .execute(&self.pool)
            .await
            .context("failed to clear client credentials")?;
        Ok(())
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:");

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
