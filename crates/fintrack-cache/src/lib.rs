//! Durable per-principal mirror of the canonical message history.
//!
//! One row per principal id holds the full history plus the unread
//! watermark. The reconciler write-throughs on every mutation; a corrupt or
//! missing row is treated as "no history" and never blocks session startup.

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
use tracing::warn;

use fintrack_shared::domain::{Message, UserId};

#[derive(Clone)]
pub struct MessageCache {
    pool: Pool<Sqlite>,
}

impl MessageCache {
    pub async fn open(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(connect_options)
            .await?;
        let cache = Self { pool };
        cache.ensure_conversations_table().await?;
        Ok(cache)
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    async fn ensure_conversations_table(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                principal_id TEXT PRIMARY KEY,
                history      TEXT,
                watermark    TEXT,
                updated_at   TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure conversations table exists")?;
        Ok(())
    }

    /// Full-history overwrite for one principal. Other principals' rows are
    /// untouched, so switching accounts never leaks history across them.
    pub async fn save_history(&self, principal_id: &UserId, history: &[Message]) -> Result<()> {
        let payload = serde_json::to_string(history)?;
        sqlx::query(
            "INSERT INTO conversations (principal_id, history, updated_at)
             VALUES (?, ?, CURRENT_TIMESTAMP)
             ON CONFLICT(principal_id) DO UPDATE SET
                history = excluded.history,
                updated_at = CURRENT_TIMESTAMP",
        )
        .bind(principal_id.as_str())
        .bind(payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Empty history when nothing is stored or the stored payload does not
    /// parse. Corruption is "no history", not a fatal error.
    pub async fn load_history(&self, principal_id: &UserId) -> Result<Vec<Message>> {
        let row = sqlx::query("SELECT history FROM conversations WHERE principal_id = ?")
            .bind(principal_id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        let Some(payload) = row.and_then(|r| r.get::<Option<String>, _>(0)) else {
            return Ok(Vec::new());
        };

        match serde_json::from_str::<Vec<Message>>(&payload) {
            Ok(history) => Ok(history),
            Err(error) => {
                warn!(principal_id = %principal_id, %error, "discarding unparseable cached history");
                Ok(Vec::new())
            }
        }
    }

    pub async fn save_watermark(&self, principal_id: &UserId, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "INSERT INTO conversations (principal_id, watermark, updated_at)
             VALUES (?, ?, CURRENT_TIMESTAMP)
             ON CONFLICT(principal_id) DO UPDATE SET
                watermark = excluded.watermark,
                updated_at = CURRENT_TIMESTAMP",
        )
        .bind(principal_id.as_str())
        .bind(at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_watermark(&self, principal_id: &UserId) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT watermark FROM conversations WHERE principal_id = ?")
            .bind(principal_id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        let Some(raw) = row.and_then(|r| r.get::<Option<String>, _>(0)) else {
            return Ok(None);
        };

        match DateTime::parse_from_rfc3339(&raw) {
            Ok(at) => Ok(Some(at.with_timezone(&Utc))),
            Err(error) => {
                warn!(principal_id = %principal_id, %error, "discarding unparseable watermark");
                Ok(None)
            }
        }
    }

    /// Explicit wipe, used on logout or a user-initiated "clear conversation".
    pub async fn clear(&self, principal_id: &UserId) -> Result<()> {
        sqlx::query("DELETE FROM conversations WHERE principal_id = ?")
            .bind(principal_id.as_str())
            .execute(&self.pool)
            .await?;
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
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
