//! Tag repository
//!
//! Rows of the shared `tags` table. Name lookups go through the column
//! collation, so they ignore case on both drivers. The connection-level
//! find-or-create functions are reused by the tagging repository inside its
//! transactions.

use crate::config::DatabaseDriver;
use crate::db::query::{self, CountScope, SqlQuery};
use crate::db::DynDatabasePool;
use crate::models::{CountFilter, Tag, TagCount, TagCounts};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{MySqlConnection, MySqlPool, Row, SqliteConnection, SqlitePool};
use std::sync::Arc;

/// Find-or-create gave up: every attempt lost a race for the same name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("tag {name:?} could not be created or read back after {attempts} attempts")]
pub struct TagNameConflict {
    pub name: String,
    pub attempts: u32,
}

/// Tag repository trait
#[async_trait]
pub trait TagRepository: Send + Sync {
    /// Get tag by ID
    async fn get_by_id(&self, id: i64) -> Result<Option<Tag>>;

    /// Get tag by name, ignoring case
    async fn find_by_name(&self, name: &str) -> Result<Option<Tag>>;

    /// Return the tag with this name, creating it if absent.
    ///
    /// Losing a creation race to another writer re-reads the winner's row.
    /// Fails with [`TagNameConflict`] after `max_attempts` rounds.
    async fn find_or_create(&self, name: &str, max_attempts: u32) -> Result<Tag>;

    /// List all tags by name
    async fn list(&self) -> Result<Vec<Tag>>;

    /// Delete a tag and its taggings; false if it did not exist
    async fn delete(&self, id: i64) -> Result<bool>;

    /// Delete every tag without taggings
    async fn delete_unused(&self) -> Result<u64>;

    /// Tag frequencies, most used first
    async fn counts(&self, filter: &CountFilter, scope: &CountScope<'_>) -> Result<TagCounts>;
}

/// Tag repository over a SQLite or MySQL pool
pub struct SqlxTagRepository {
    pool: DynDatabasePool,
}

impl SqlxTagRepository {
    /// Create a new SQLx tag repository
    pub fn new(pool: DynDatabasePool) -> Self {
        Self { pool }
    }

    /// Create a boxed repository for use with dependency injection
    pub fn boxed(pool: DynDatabasePool) -> Arc<dyn TagRepository> {
        Arc::new(Self::new(pool))
    }

    fn sqlite(&self) -> Result<&SqlitePool> {
        self.pool.as_sqlite().context("SQLite pool not available")
    }

    fn mysql(&self) -> Result<&MySqlPool> {
        self.pool.as_mysql().context("MySQL pool not available")
    }
}

#[async_trait]
impl TagRepository for SqlxTagRepository {
    async fn get_by_id(&self, id: i64) -> Result<Option<Tag>> {
        match self.pool.driver() {
            DatabaseDriver::Sqlite => get_tag_by_id_sqlite(self.sqlite()?, id).await,
            DatabaseDriver::Mysql => get_tag_by_id_mysql(self.mysql()?, id).await,
        }
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<Tag>> {
        match self.pool.driver() {
            DatabaseDriver::Sqlite => {
                let mut conn = self.sqlite()?.acquire().await.context("Failed to acquire connection")?;
                find_tag_by_name_sqlite(&mut conn, name).await
            }
            DatabaseDriver::Mysql => {
                let mut conn = self.mysql()?.acquire().await.context("Failed to acquire connection")?;
                find_tag_by_name_mysql(&mut conn, name).await
            }
        }
    }

    async fn find_or_create(&self, name: &str, max_attempts: u32) -> Result<Tag> {
        match self.pool.driver() {
            DatabaseDriver::Sqlite => {
                let mut conn = self.sqlite()?.acquire().await.context("Failed to acquire connection")?;
                find_or_create_sqlite(&mut conn, name, max_attempts).await
            }
            DatabaseDriver::Mysql => {
                let mut conn = self.mysql()?.acquire().await.context("Failed to acquire connection")?;
                find_or_create_mysql(&mut conn, name, max_attempts).await
            }
        }
    }

    async fn list(&self) -> Result<Vec<Tag>> {
        match self.pool.driver() {
            DatabaseDriver::Sqlite => list_tags_sqlite(self.sqlite()?).await,
            DatabaseDriver::Mysql => list_tags_mysql(self.mysql()?).await,
        }
    }

    async fn delete(&self, id: i64) -> Result<bool> {
        match self.pool.driver() {
            DatabaseDriver::Sqlite => delete_tag_sqlite(self.sqlite()?, id).await,
            DatabaseDriver::Mysql => delete_tag_mysql(self.mysql()?, id).await,
        }
    }

    async fn delete_unused(&self) -> Result<u64> {
        match self.pool.driver() {
            DatabaseDriver::Sqlite => delete_unused_tags_sqlite(self.sqlite()?).await,
            DatabaseDriver::Mysql => delete_unused_tags_mysql(self.mysql()?).await,
        }
    }

    async fn counts(&self, filter: &CountFilter, scope: &CountScope<'_>) -> Result<TagCounts> {
        let query = query::tag_counts(filter, scope)?;
        match self.pool.driver() {
            DatabaseDriver::Sqlite => tag_counts_sqlite(self.sqlite()?, &query).await,
            DatabaseDriver::Mysql => tag_counts_mysql(self.mysql()?, &query).await,
        }
    }
}

// ============================================================================
// SQLite implementations
// ============================================================================

async fn get_tag_by_id_sqlite(pool: &SqlitePool, id: i64) -> Result<Option<Tag>> {
    let row = sqlx::query(
        r#"
        SELECT id, name, created_at
        FROM tags
        WHERE id = ?
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("Failed to get tag by ID")?;

    match row {
        Some(row) => Ok(Some(row_to_tag_sqlite(&row)?)),
        None => Ok(None),
    }
}

pub(crate) async fn find_tag_by_name_sqlite(
    conn: &mut SqliteConnection,
    name: &str,
) -> Result<Option<Tag>> {
    let row = sqlx::query(
        r#"
        SELECT id, name, created_at
        FROM tags
        WHERE name = ?
        "#,
    )
    .bind(name)
    .fetch_optional(&mut *conn)
    .await
    .context("Failed to get tag by name")?;

    match row {
        Some(row) => Ok(Some(row_to_tag_sqlite(&row)?)),
        None => Ok(None),
    }
}

pub(crate) async fn find_or_create_sqlite(
    conn: &mut SqliteConnection,
    name: &str,
    max_attempts: u32,
) -> Result<Tag> {
    for attempt in 1..=max_attempts {
        if let Some(tag) = find_tag_by_name_sqlite(conn, name).await? {
            return Ok(tag);
        }

        let now = Utc::now();
        let result = sqlx::query("INSERT OR IGNORE INTO tags (name, created_at) VALUES (?, ?)")
            .bind(name)
            .bind(now)
            .execute(&mut *conn)
            .await
            .context("Failed to create tag")?;

        if result.rows_affected() > 0 {
            tracing::debug!(tag = name, "Created tag");
            return Ok(Tag {
                id: result.last_insert_rowid(),
                name: name.to_string(),
                created_at: now,
            });
        }

        // Another writer created it first
        if let Some(tag) = find_tag_by_name_sqlite(conn, name).await? {
            return Ok(tag);
        }
        tracing::warn!(tag = name, attempt, "Tag vanished after losing creation race, retrying");
    }

    Err(TagNameConflict {
        name: name.to_string(),
        attempts: max_attempts,
    }
    .into())
}

async fn list_tags_sqlite(pool: &SqlitePool) -> Result<Vec<Tag>> {
    let rows = sqlx::query(
        r#"
        SELECT id, name, created_at
        FROM tags
        ORDER BY name
        "#,
    )
    .fetch_all(pool)
    .await
    .context("Failed to list tags")?;

    let mut tags = Vec::new();
    for row in rows {
        tags.push(row_to_tag_sqlite(&row)?);
    }

    Ok(tags)
}

async fn delete_tag_sqlite(pool: &SqlitePool, id: i64) -> Result<bool> {
    // Taggings go with it through ON DELETE CASCADE
    let result = sqlx::query("DELETE FROM tags WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await
        .context("Failed to delete tag")?;

    Ok(result.rows_affected() > 0)
}

async fn delete_unused_tags_sqlite(pool: &SqlitePool) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM tags WHERE NOT EXISTS (SELECT 1 FROM taggings WHERE taggings.tag_id = tags.id)",
    )
    .execute(pool)
    .await
    .context("Failed to delete unused tags")?;

    Ok(result.rows_affected())
}

async fn tag_counts_sqlite(pool: &SqlitePool, query: &SqlQuery) -> Result<TagCounts> {
    let rows = query
        .to_sqlite()
        .fetch_all(pool)
        .await
        .context("Failed to count tags")?;

    Ok(TagCounts::new(
        rows.iter()
            .map(|row| TagCount::new(row.get("name"), row.get("count_all")))
            .collect(),
    ))
}

fn row_to_tag_sqlite(row: &sqlx::sqlite::SqliteRow) -> Result<Tag> {
    Ok(Tag {
        id: row.get("id"),
        name: row.get("name"),
        created_at: row.get("created_at"),
    })
}

// ============================================================================
// MySQL implementations
// ============================================================================

async fn get_tag_by_id_mysql(pool: &MySqlPool, id: i64) -> Result<Option<Tag>> {
    let row = sqlx::query(
        r#"
        SELECT id, name, created_at
        FROM tags
        WHERE id = ?
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("Failed to get tag by ID")?;

    match row {
        Some(row) => Ok(Some(row_to_tag_mysql(&row)?)),
        None => Ok(None),
    }
}

pub(crate) async fn find_tag_by_name_mysql(
    conn: &mut MySqlConnection,
    name: &str,
) -> Result<Option<Tag>> {
    let row = sqlx::query(
        r#"
        SELECT id, name, created_at
        FROM tags
        WHERE name = ?
        "#,
    )
    .bind(name)
    .fetch_optional(&mut *conn)
    .await
    .context("Failed to get tag by name")?;

    match row {
        Some(row) => Ok(Some(row_to_tag_mysql(&row)?)),
        None => Ok(None),
    }
}

pub(crate) async fn find_or_create_mysql(
    conn: &mut MySqlConnection,
    name: &str,
    max_attempts: u32,
) -> Result<Tag> {
    for attempt in 1..=max_attempts {
        let id = match find_tag_by_name_mysql(conn, name).await? {
            Some(tag) => tag.id,
            None => upsert_tag_mysql(conn, name).await?,
        };

        if let Some(tag) = lock_tag_mysql(conn, id).await? {
            return Ok(tag);
        }
        tracing::warn!(tag = name, attempt, "Tag vanished after losing creation race, retrying");
    }

    Err(TagNameConflict {
        name: name.to_string(),
        attempts: max_attempts,
    }
    .into())
}

/// Insert a tag or hit the existing one; returns the row id either way
///
/// The affected row count is 1 in both cases because sqlx connects with
/// `CLIENT_FOUND_ROWS`, so `LAST_INSERT_ID(id)` carries the id of a duplicate.
/// Over-long names are still rejected, unlike `INSERT IGNORE`.
async fn upsert_tag_mysql(conn: &mut MySqlConnection, name: &str) -> Result<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO tags (name, created_at) VALUES (?, ?)
        ON DUPLICATE KEY UPDATE id = LAST_INSERT_ID(id)
        "#,
    )
    .bind(name)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await
    .context("Failed to create tag")?;

    Ok(result.last_insert_id() as i64)
}

/// Read a tag by id with a shared lock
///
/// A locking read sees the latest committed row rather than the snapshot of
/// an open transaction, and keeps the row from being deleted until commit.
async fn lock_tag_mysql(conn: &mut MySqlConnection, id: i64) -> Result<Option<Tag>> {
    let row = sqlx::query(
        r#"
        SELECT id, name, created_at
        FROM tags
        WHERE id = ?
        LOCK IN SHARE MODE
        "#,
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
    .context("Failed to read tag")?;

    match row {
        Some(row) => Ok(Some(row_to_tag_mysql(&row)?)),
        None => Ok(None),
    }
}

async fn list_tags_mysql(pool: &MySqlPool) -> Result<Vec<Tag>> {
    let rows = sqlx::query(
        r#"
        SELECT id, name, created_at
        FROM tags
        ORDER BY name
        "#,
    )
    .fetch_all(pool)
    .await
    .context("Failed to list tags")?;

    let mut tags = Vec::new();
    for row in rows {
        tags.push(row_to_tag_mysql(&row)?);
    }

    Ok(tags)
}

async fn delete_tag_mysql(pool: &MySqlPool, id: i64) -> Result<bool> {
    let result = sqlx::query("DELETE FROM tags WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await
        .context("Failed to delete tag")?;

    Ok(result.rows_affected() > 0)
}

async fn delete_unused_tags_mysql(pool: &MySqlPool) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM tags WHERE NOT EXISTS (SELECT 1 FROM taggings WHERE taggings.tag_id = tags.id)",
    )
    .execute(pool)
    .await
    .context("Failed to delete unused tags")?;

    Ok(result.rows_affected())
}

async fn tag_counts_mysql(pool: &MySqlPool, query: &SqlQuery) -> Result<TagCounts> {
    let rows = query
        .to_mysql()
        .fetch_all(pool)
        .await
        .context("Failed to count tags")?;

    Ok(TagCounts::new(
        rows.iter()
            .map(|row| TagCount::new(row.get("name"), row.get("count_all")))
            .collect(),
    ))
}

fn row_to_tag_mysql(row: &sqlx::mysql::MySqlRow) -> Result<Tag> {
    Ok(Tag {
        id: row.get("id"),
        name: row.get("name"),
        created_at: row.get("created_at"),
    })
}
