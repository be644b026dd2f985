//! SQLite database operations
//!
//! All database access goes through this module. Writers are serialized
//! through a single async mutex so WAL mode never sees competing writers;
//! readers go straight to the pool.

use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::path::Path;
use std::str::FromStr;
use tokio::sync::Mutex;

use super::models::*;
use crate::error::AppError;

/// Database connection pool wrapper.
pub struct Database {
    pool: Pool<Sqlite>,
    write_lock: Mutex<()>,
}

impl Database {
    // =========================================================================
    // Connection
    // =========================================================================

    /// Connect to SQLite database
    ///
    /// Creates the database file if it doesn't exist.
    /// Runs pending migrations automatically.
    ///
    /// # Errors
    /// Returns error if connection or migration fails
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(10));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                tracing::error!("Migration failed: {}", e);
                AppError::Internal(anyhow::anyhow!("Migration failed: {}", e))
            })?;

        tracing::info!(path = %path.display(), "Database connected and migrated successfully");

        Ok(Self {
            pool,
            write_lock: Mutex::new(()),
        })
    }

    // =========================================================================
    // Settings
    // =========================================================================

    /// Get setting value
    pub async fn get_setting(&self, key: &str) -> Result<Option<String>, AppError> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(value)
    }

    /// Set setting value
    pub async fn set_setting(&self, key: &str, value: &str) -> Result<(), AppError> {
        let _guard = self.write_lock.lock().await;
        sqlx::query("INSERT OR REPLACE INTO settings (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Delete setting value
    pub async fn delete_setting(&self, key: &str) -> Result<(), AppError> {
        let _guard = self.write_lock.lock().await;
        sqlx::query("DELETE FROM settings WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // =========================================================================
    // Persistent cache (binary blobs)
    // =========================================================================

    pub async fn get_cached(&self, key: &str) -> Result<Option<Vec<u8>>, AppError> {
        let data = sqlx::query_scalar::<_, Vec<u8>>("SELECT data FROM persistent_cache WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(data)
    }

    /// Insert or atomically replace a cached blob
    pub async fn put_cached(&self, key: &str, data: &[u8]) -> Result<(), AppError> {
        let _guard = self.write_lock.lock().await;
        sqlx::query("INSERT OR REPLACE INTO persistent_cache (key, data, date) VALUES (?, ?, ?)")
            .bind(key)
            .bind(data)
            .bind(encode_time(Utc::now()))
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn delete_cached(&self, key: &str) -> Result<(), AppError> {
        let _guard = self.write_lock.lock().await;
        sqlx::query("DELETE FROM persistent_cache WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // =========================================================================
    // Certificate cache
    // =========================================================================

    /// PEM bundle (key first, then chain) for a host
    pub async fn get_cert(&self, host: &str) -> Result<Option<Vec<u8>>, AppError> {
        self.get_cached(&cert_cache_key(host)).await
    }

    pub async fn put_cert(&self, host: &str, bundle: &[u8]) -> Result<(), AppError> {
        self.put_cached(&cert_cache_key(host), bundle).await
    }

    pub async fn delete_cert(&self, host: &str) -> Result<(), AppError> {
        self.delete_cached(&cert_cache_key(host)).await
    }

    // =========================================================================
    // Followers
    // =========================================================================

    /// Insert follower, or refresh inbox/username of an existing row
    pub async fn add_follower(&self, follower: &Follower) -> Result<(), AppError> {
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            r#"
            INSERT INTO activitypub_followers (blog, follower, inbox, username, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(blog, follower) DO UPDATE SET
                inbox = excluded.inbox,
                username = excluded.username
            "#,
        )
        .bind(&follower.blog)
        .bind(&follower.follower)
        .bind(&follower.inbox)
        .bind(&follower.username)
        .bind(encode_time(Utc::now()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Remove a follower; returns whether a row was deleted
    pub async fn remove_follower(&self, blog: &str, follower: &str) -> Result<bool, AppError> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query("DELETE FROM activitypub_followers WHERE blog = ? AND follower = ?")
            .bind(blog)
            .bind(follower)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Remove an actor from the followers of every blog
    pub async fn remove_follower_everywhere(&self, follower: &str) -> Result<u64, AppError> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query("DELETE FROM activitypub_followers WHERE follower = ?")
            .bind(follower)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    /// Remove every follower row pointing at `inbox`, across all blogs
    pub async fn retire_inbox(&self, inbox: &str) -> Result<u64, AppError> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query("DELETE FROM activitypub_followers WHERE inbox = ?")
            .bind(inbox)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    /// Swap a follower row for its moved counterpart in one transaction
    pub async fn replace_follower(
        &self,
        blog: &str,
        old_follower: &str,
        replacement: &Follower,
    ) -> Result<(), AppError> {
        let _guard = self.write_lock.lock().await;
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result: Result<(), AppError> = async {
            sqlx::query("DELETE FROM activitypub_followers WHERE blog = ? AND follower = ?")
                .bind(blog)
                .bind(old_follower)
                .execute(&mut *conn)
                .await?;
            sqlx::query(
                r#"
                INSERT INTO activitypub_followers (blog, follower, inbox, username, created_at)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(blog, follower) DO UPDATE SET
                    inbox = excluded.inbox,
                    username = excluded.username
                "#,
            )
            .bind(blog)
            .bind(&replacement.follower)
            .bind(&replacement.inbox)
            .bind(&replacement.username)
            .bind(encode_time(Utc::now()))
            .execute(&mut *conn)
            .await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(())
            }
            Err(error) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(error)
            }
        }
    }

    pub async fn get_follower(
        &self,
        blog: &str,
        follower: &str,
    ) -> Result<Option<Follower>, AppError> {
        let row = sqlx::query_as::<_, Follower>(
            "SELECT blog, follower, inbox, username FROM activitypub_followers WHERE blog = ? AND follower = ?",
        )
        .bind(blog)
        .bind(follower)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// All followers of a blog, oldest first
    pub async fn list_followers(&self, blog: &str) -> Result<Vec<Follower>, AppError> {
        let rows = sqlx::query_as::<_, Follower>(
            "SELECT blog, follower, inbox, username FROM activitypub_followers WHERE blog = ? ORDER BY created_at, follower",
        )
        .bind(blog)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Distinct delivery inboxes of a blog's followers
    pub async fn follower_inboxes(&self, blog: &str) -> Result<Vec<String>, AppError> {
        let inboxes = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT inbox FROM activitypub_followers WHERE blog = ? ORDER BY inbox",
        )
        .bind(blog)
        .fetch_all(&self.pool)
        .await?;

        Ok(inboxes)
    }

    pub async fn count_followers(&self, blog: &str) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM activitypub_followers WHERE blog = ?",
        )
        .bind(blog)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    pub async fn count_all_followers(&self) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM activitypub_followers")
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    // =========================================================================
    // Notification dedupe
    // =========================================================================

    /// Record `(actor, kind, object)`; returns false if it was already seen
    pub async fn record_notification(
        &self,
        actor: &str,
        kind: &str,
        object: &str,
    ) -> Result<bool, AppError> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query(
            "INSERT OR IGNORE INTO activitypub_notifications (actor, kind, object, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(actor)
        .bind(kind)
        .bind(object)
        .bind(encode_time(Utc::now()))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Forget notifications recorded before `cutoff`; returns rows removed
    pub async fn prune_notifications(&self, cutoff: DateTime<Utc>) -> Result<u64, AppError> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query("DELETE FROM activitypub_notifications WHERE created_at < ?")
            .bind(encode_time(cutoff))
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    // =========================================================================
    // Queue
    // =========================================================================

    /// Insert a queue item visible from `scheduled_at` on
    ///
    /// # Errors
    /// `InvalidArgument` for an empty payload or topic
    pub async fn enqueue(
        &self,
        topic: &str,
        payload: &[u8],
        scheduled_at: DateTime<Utc>,
    ) -> Result<i64, AppError> {
        if topic.is_empty() {
            return Err(AppError::InvalidArgument("empty queue topic".to_string()));
        }
        if payload.is_empty() {
            return Err(AppError::InvalidArgument("empty queue payload".to_string()));
        }

        let _guard = self.write_lock.lock().await;
        let result = sqlx::query("INSERT INTO queue (topic, payload, scheduled) VALUES (?, ?, ?)")
            .bind(topic)
            .bind(payload)
            .bind(encode_time(scheduled_at))
            .execute(&self.pool)
            .await?;

        Ok(result.last_insert_rowid())
    }

    /// Oldest visible item of `topic`, ordered by `(scheduled, id)`
    pub async fn peek(&self, topic: &str) -> Result<Option<QueueItem>, AppError> {
        self.peek_at(topic, Utc::now()).await
    }

    /// Like [`Database::peek`] with an explicit notion of "now"
    pub async fn peek_at(
        &self,
        topic: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueItem>, AppError> {
        let row = sqlx::query(
            r#"
            SELECT id, topic, payload, scheduled FROM queue
            WHERE topic = ? AND scheduled <= ?
            ORDER BY scheduled ASC, id ASC
            LIMIT 1
            "#,
        )
        .bind(topic)
        .bind(encode_time(now))
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let scheduled: String = row.try_get("scheduled")?;
        let scheduled_at = decode_time(&scheduled).ok_or_else(|| {
            AppError::Internal(anyhow::anyhow!("Invalid queue schedule: {}", scheduled))
        })?;

        Ok(Some(QueueItem {
            id: row.try_get("id")?,
            topic: row.try_get("topic")?,
            payload: row.try_get("payload")?,
            scheduled_at,
        }))
    }

    /// Push an item back by `delta`, optionally replacing its payload
    pub async fn reschedule(
        &self,
        item: &QueueItem,
        delta: Duration,
        payload: Option<&[u8]>,
    ) -> Result<(), AppError> {
        if matches!(payload, Some(p) if p.is_empty()) {
            return Err(AppError::InvalidArgument("empty queue payload".to_string()));
        }

        let scheduled = encode_time(item.scheduled_at + delta);
        let _guard = self.write_lock.lock().await;
        match payload {
            Some(payload) => {
                sqlx::query("UPDATE queue SET scheduled = ?, payload = ? WHERE id = ?")
                    .bind(scheduled)
                    .bind(payload)
                    .bind(item.id)
                    .execute(&self.pool)
                    .await?;
            }
            None => {
                sqlx::query("UPDATE queue SET scheduled = ? WHERE id = ?")
                    .bind(scheduled)
                    .bind(item.id)
                    .execute(&self.pool)
                    .await?;
            }
        }

        Ok(())
    }

    /// Remove an item by id
    pub async fn dequeue(&self, item: &QueueItem) -> Result<(), AppError> {
        let _guard = self.write_lock.lock().await;
        sqlx::query("DELETE FROM queue WHERE id = ?")
            .bind(item.id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Number of items in a topic, visible or not
    pub async fn queue_len(&self, topic: &str) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM queue WHERE topic = ?")
            .bind(topic)
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }
}
