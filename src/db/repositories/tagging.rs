//! Tagging repository
//!
//! Database operations for the links between taggable entities and tags.
//!
//! This module provides:
//! - `TaggingRepository` trait defining the interface for link data access
//! - `SqlxTaggingRepository` implementing the trait for SQLite and MySQL
//!
//! Reconciliation writes the cached tag list, removes stale links, creates
//! missing tags and links, and optionally drops orphaned tags, all in one
//! transaction. Any failure rolls every step back.

use crate::config::DatabaseDriver;
use crate::db::query::{self, SqlQuery};
use crate::db::repositories::tag::{find_or_create_mysql, find_or_create_sqlite};
use crate::db::DynDatabasePool;
use crate::models::{
    EntityScope, MatchMode, PersistOutcome, Tag, TagCount, TagCounts, TagDiff, TagList,
    TaggableModel, TaggableRef, TaggedEntity, Tagging,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{MySqlConnection, MySqlPool, Row, Sqlite, SqliteConnection, SqlitePool, Transaction};
use std::sync::Arc;

/// The entity being reconciled has no row in its table
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{taggable} does not exist")]
pub struct EntityMissing {
    pub taggable: TaggableRef,
}

/// Everything needed to bring one entity's links in line with a tag list
#[derive(Debug, Clone)]
pub struct Reconcile<'a> {
    pub model: &'a TaggableModel,
    pub taggable_id: i64,
    /// Desired tags
    pub desired: &'a TagList,
    /// Value for the cached tag list column, if the type caches
    pub cache: Option<&'a str>,
    /// Delete unlinked tags that nothing references afterwards
    pub destroy_unused: bool,
    pub max_create_attempts: u32,
}

impl Reconcile<'_> {
    fn taggable(&self) -> TaggableRef {
        TaggableRef::new(self.model.name.as_str(), self.taggable_id)
    }
}

/// Tagging repository trait
#[async_trait]
pub trait TaggingRepository: Send + Sync {
    /// Load an entity with its cached tag list; `None` if the row is missing
    async fn find_entity(&self, model: &TaggableModel, id: i64) -> Result<Option<TaggedEntity>>;

    /// Tags linked to an entity, in link order
    async fn tags_for(&self, taggable: &TaggableRef) -> Result<Vec<Tag>>;

    /// Link rows of an entity, in link order
    async fn taggings_for(&self, taggable: &TaggableRef) -> Result<Vec<Tagging>>;

    /// Apply a desired tag list in one transaction
    ///
    /// Fails with [`EntityMissing`] when the entity row does not exist.
    async fn reconcile(&self, request: &Reconcile<'_>) -> Result<PersistOutcome>;

    /// Remove every link of an entity; returns the number removed
    async fn remove_all(&self, taggable: &TaggableRef, destroy_unused: bool) -> Result<u64>;

    /// Ids of entities matching the names under `mode`, ascending
    async fn tagged_with(
        &self,
        model: &TaggableModel,
        names: &[String],
        mode: MatchMode,
        scope: &EntityScope,
    ) -> Result<Vec<i64>>;

    /// Tags co-occurring with the names, most frequent first
    async fn related_tags(
        &self,
        model: &TaggableModel,
        names: &[String],
        scope: &EntityScope,
    ) -> Result<TagCounts>;
}

/// Tagging repository over a SQLite or MySQL pool
pub struct SqlxTaggingRepository {
    pool: DynDatabasePool,
}

impl SqlxTaggingRepository {
    /// Create a new SQLx tagging repository
    pub fn new(pool: DynDatabasePool) -> Self {
        Self { pool }
    }

    /// Create a boxed repository for use with dependency injection
    pub fn boxed(pool: DynDatabasePool) -> Arc<dyn TaggingRepository> {
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
impl TaggingRepository for SqlxTaggingRepository {
    async fn find_entity(&self, model: &TaggableModel, id: i64) -> Result<Option<TaggedEntity>> {
        let query = query::select_entity(model, id)?;
        let cached = match self.pool.driver() {
            DatabaseDriver::Sqlite => {
                let mut conn = self.sqlite()?.acquire().await.context("Failed to acquire connection")?;
                read_entity_sqlite(&mut conn, &query).await?
            }
            DatabaseDriver::Mysql => {
                let mut conn = self.mysql()?.acquire().await.context("Failed to acquire connection")?;
                read_entity_mysql(&mut conn, &query).await?
            }
        };

        Ok(cached.map(|cached| {
            TaggedEntity::with_cached(TaggableRef::new(model.name.as_str(), id), cached)
        }))
    }

    async fn tags_for(&self, taggable: &TaggableRef) -> Result<Vec<Tag>> {
        match self.pool.driver() {
            DatabaseDriver::Sqlite => {
                let mut conn = self.sqlite()?.acquire().await.context("Failed to acquire connection")?;
                tags_for_sqlite(&mut conn, taggable).await
            }
            DatabaseDriver::Mysql => {
                let mut conn = self.mysql()?.acquire().await.context("Failed to acquire connection")?;
                tags_for_mysql(&mut conn, taggable).await
            }
        }
    }

    async fn taggings_for(&self, taggable: &TaggableRef) -> Result<Vec<Tagging>> {
        match self.pool.driver() {
            DatabaseDriver::Sqlite => taggings_for_sqlite(self.sqlite()?, taggable).await,
            DatabaseDriver::Mysql => taggings_for_mysql(self.mysql()?, taggable).await,
        }
    }

    async fn reconcile(&self, request: &Reconcile<'_>) -> Result<PersistOutcome> {
        match self.pool.driver() {
            DatabaseDriver::Sqlite => reconcile_sqlite(self.sqlite()?, request).await,
            DatabaseDriver::Mysql => reconcile_mysql(self.mysql()?, request).await,
        }
    }

    async fn remove_all(&self, taggable: &TaggableRef, destroy_unused: bool) -> Result<u64> {
        match self.pool.driver() {
            DatabaseDriver::Sqlite => remove_all_sqlite(self.sqlite()?, taggable, destroy_unused).await,
            DatabaseDriver::Mysql => remove_all_mysql(self.mysql()?, taggable, destroy_unused).await,
        }
    }

    async fn tagged_with(
        &self,
        model: &TaggableModel,
        names: &[String],
        mode: MatchMode,
        scope: &EntityScope,
    ) -> Result<Vec<i64>> {
        let query = match query::tagged_with(model, names, mode, scope)? {
            Some(query) => query,
            None => return Ok(Vec::new()),
        };

        match self.pool.driver() {
            DatabaseDriver::Sqlite => {
                let rows = query
                    .to_sqlite()
                    .fetch_all(self.sqlite()?)
                    .await
                    .context("Failed to find tagged entities")?;
                Ok(rows.iter().map(|row| row.get("taggable_id")).collect())
            }
            DatabaseDriver::Mysql => {
                let rows = query
                    .to_mysql()
                    .fetch_all(self.mysql()?)
                    .await
                    .context("Failed to find tagged entities")?;
                Ok(rows.iter().map(|row| row.get("taggable_id")).collect())
            }
        }
    }

    async fn related_tags(
        &self,
        model: &TaggableModel,
        names: &[String],
        scope: &EntityScope,
    ) -> Result<TagCounts> {
        let query = match query::related_tags(model, names, scope)? {
            Some(query) => query,
            None => return Ok(TagCounts::default()),
        };

        match self.pool.driver() {
            DatabaseDriver::Sqlite => {
                let rows = query
                    .to_sqlite()
                    .fetch_all(self.sqlite()?)
                    .await
                    .context("Failed to find related tags")?;
                Ok(TagCounts::new(
                    rows.iter()
                        .map(|row| TagCount::new(row.get("name"), row.get("count_all")))
                        .collect(),
                ))
            }
            DatabaseDriver::Mysql => {
                let rows = query
                    .to_mysql()
                    .fetch_all(self.mysql()?)
                    .await
                    .context("Failed to find related tags")?;
                Ok(TagCounts::new(
                    rows.iter()
                        .map(|row| TagCount::new(row.get("name"), row.get("count_all")))
                        .collect(),
                ))
            }
        }
    }
}

// ============================================================================
// SQLite implementations
// ============================================================================

/// `Some(cached value)` when the entity row exists
async fn read_entity_sqlite(
    conn: &mut SqliteConnection,
    query: &SqlQuery,
) -> Result<Option<Option<String>>> {
    let row = query
        .to_sqlite()
        .fetch_optional(&mut *conn)
        .await
        .context("Failed to read entity")?;

    Ok(row.map(|row| row.get::<Option<String>, _>("cached_tag_list")))
}

async fn tags_for_sqlite(conn: &mut SqliteConnection, taggable: &TaggableRef) -> Result<Vec<Tag>> {
    let rows = sqlx::query(
        r#"
        SELECT t.id, t.name, t.created_at
        FROM taggings tg
        INNER JOIN tags t ON t.id = tg.tag_id
        WHERE tg.taggable_type = ? AND tg.taggable_id = ?
        ORDER BY tg.id
        "#,
    )
    .bind(&taggable.taggable_type)
    .bind(taggable.taggable_id)
    .fetch_all(&mut *conn)
    .await
    .context("Failed to get tags for entity")?;

    Ok(rows
        .iter()
        .map(|row| Tag {
            id: row.get("id"),
            name: row.get("name"),
            created_at: row.get("created_at"),
        })
        .collect())
}

async fn taggings_for_sqlite(pool: &SqlitePool, taggable: &TaggableRef) -> Result<Vec<Tagging>> {
    let rows = sqlx::query(
        r#"
        SELECT id, tag_id, taggable_type, taggable_id, created_at
        FROM taggings
        WHERE taggable_type = ? AND taggable_id = ?
        ORDER BY id
        "#,
    )
    .bind(&taggable.taggable_type)
    .bind(taggable.taggable_id)
    .fetch_all(pool)
    .await
    .context("Failed to get taggings for entity")?;

    Ok(rows
        .iter()
        .map(|row| Tagging {
            id: row.get("id"),
            tag_id: row.get("tag_id"),
            taggable_type: row.get("taggable_type"),
            taggable_id: row.get("taggable_id"),
            created_at: row.get("created_at"),
        })
        .collect())
}

async fn link_tag_sqlite(conn: &mut SqliteConnection, tag_id: i64, taggable: &TaggableRef) -> Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT OR IGNORE INTO taggings (tag_id, taggable_type, taggable_id, created_at)
        VALUES (?, ?, ?, ?)
        "#,
    )
    .bind(tag_id)
    .bind(&taggable.taggable_type)
    .bind(taggable.taggable_id)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await
    .context("Failed to link tag")?;

    Ok(result.rows_affected() > 0)
}

/// Begin a transaction that holds the write lock from its first statement
///
/// A deferred transaction that reads first fails with `SQLITE_BUSY` when it
/// upgrades after another connection committed, without waiting on the busy
/// timeout. Taking the lock up front makes concurrent writers queue instead.
async fn begin_write_sqlite(pool: &SqlitePool) -> Result<Transaction<'static, Sqlite>> {
    let mut tx = pool.begin().await.context("Failed to begin transaction")?;
    // Any write statement takes the lock; this one matches no rows
    sqlx::query("DELETE FROM taggings WHERE 0")
        .execute(&mut *tx)
        .await
        .context("Failed to acquire write lock")?;
    Ok(tx)
}

async fn reconcile_sqlite(pool: &SqlitePool, request: &Reconcile<'_>) -> Result<PersistOutcome> {
    let taggable = request.taggable();
    let mut tx = begin_write_sqlite(pool).await?;

    let entity = query::select_entity(request.model, request.taggable_id)?;
    if read_entity_sqlite(&mut tx, &entity).await?.is_none() {
        return Err(EntityMissing { taggable }.into());
    }

    if let Some(cache) = request.cache {
        if let Some(update) = query::update_cached_tag_list(request.model, request.taggable_id, cache)? {
            update
                .to_sqlite()
                .execute(&mut *tx)
                .await
                .context("Failed to write cached tag list")?;
        }
    }

    let linked = tags_for_sqlite(&mut tx, &taggable).await?;
    let diff = TagDiff::compute(request.desired, &linked);
    let mut outcome = PersistOutcome::default();

    let removed_ids: Vec<i64> = diff.to_remove.iter().map(|tag| tag.id).collect();
    if !removed_ids.is_empty() {
        query::delete_taggings(&taggable.taggable_type, taggable.taggable_id, &removed_ids)
            .to_sqlite()
            .execute(&mut *tx)
            .await
            .context("Failed to unlink tags")?;
        outcome.removed = diff.to_remove.iter().map(|tag| tag.name.clone()).collect();
    }

    for name in &diff.to_add {
        let tag = find_or_create_sqlite(&mut tx, name, request.max_create_attempts).await?;
        if link_tag_sqlite(&mut tx, tag.id, &taggable).await? {
            outcome.added.push(name.clone());
        }
    }

    if request.destroy_unused && !removed_ids.is_empty() {
        outcome.destroyed = query::delete_unused_tags(&removed_ids)
            .to_sqlite()
            .execute(&mut *tx)
            .await
            .context("Failed to delete unused tags")?
            .rows_affected();
    }

    tx.commit().await.context("Failed to commit tag changes")?;
    Ok(outcome)
}

async fn remove_all_sqlite(pool: &SqlitePool, taggable: &TaggableRef, destroy_unused: bool) -> Result<u64> {
    let mut tx = begin_write_sqlite(pool).await?;

    let tag_ids: Vec<i64> = tags_for_sqlite(&mut tx, taggable)
        .await?
        .into_iter()
        .map(|tag| tag.id)
        .collect();

    let removed = sqlx::query("DELETE FROM taggings WHERE taggable_type = ? AND taggable_id = ?")
        .bind(&taggable.taggable_type)
        .bind(taggable.taggable_id)
        .execute(&mut *tx)
        .await
        .context("Failed to remove taggings")?
        .rows_affected();

    if destroy_unused && !tag_ids.is_empty() {
        query::delete_unused_tags(&tag_ids)
            .to_sqlite()
            .execute(&mut *tx)
            .await
            .context("Failed to delete unused tags")?;
    }

    tx.commit().await.context("Failed to commit tag removal")?;
    Ok(removed)
}

// ============================================================================
// MySQL implementations
// ============================================================================

async fn read_entity_mysql(
    conn: &mut MySqlConnection,
    query: &SqlQuery,
) -> Result<Option<Option<String>>> {
    let row = query
        .to_mysql()
        .fetch_optional(&mut *conn)
        .await
        .context("Failed to read entity")?;

    Ok(row.map(|row| row.get::<Option<String>, _>("cached_tag_list")))
}

async fn tags_for_mysql(conn: &mut MySqlConnection, taggable: &TaggableRef) -> Result<Vec<Tag>> {
    let rows = sqlx::query(
        r#"
        SELECT t.id, t.name, t.created_at
        FROM taggings tg
        INNER JOIN tags t ON t.id = tg.tag_id
        WHERE tg.taggable_type = ? AND tg.taggable_id = ?
        ORDER BY tg.id
        "#,
    )
    .bind(&taggable.taggable_type)
    .bind(taggable.taggable_id)
    .fetch_all(&mut *conn)
    .await
    .context("Failed to get tags for entity")?;

    Ok(rows
        .iter()
        .map(|row| Tag {
            id: row.get("id"),
            name: row.get("name"),
            created_at: row.get("created_at"),
        })
        .collect())
}

async fn taggings_for_mysql(pool: &MySqlPool, taggable: &TaggableRef) -> Result<Vec<Tagging>> {
    let rows = sqlx::query(
        r#"
        SELECT id, tag_id, taggable_type, taggable_id, created_at
        FROM taggings
        WHERE taggable_type = ? AND taggable_id = ?
        ORDER BY id
        "#,
    )
    .bind(&taggable.taggable_type)
    .bind(taggable.taggable_id)
    .fetch_all(pool)
    .await
    .context("Failed to get taggings for entity")?;

    Ok(rows
        .iter()
        .map(|row| Tagging {
            id: row.get("id"),
            tag_id: row.get("tag_id"),
            taggable_type: row.get("taggable_type"),
            taggable_id: row.get("taggable_id"),
            created_at: row.get("created_at"),
        })
        .collect())
}

/// Link a tag; false when the link already exists
///
/// A duplicate is detected from the unique index error, which only rolls back
/// this statement inside a transaction.
async fn link_tag_mysql(conn: &mut MySqlConnection, tag_id: i64, taggable: &TaggableRef) -> Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO taggings (tag_id, taggable_type, taggable_id, created_at)
        VALUES (?, ?, ?, ?)
        "#,
    )
    .bind(tag_id)
    .bind(&taggable.taggable_type)
    .bind(taggable.taggable_id)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await;

    match result {
        Ok(_) => Ok(true),
        Err(sqlx::Error::Database(err)) if err.is_unique_violation() => Ok(false),
        Err(err) => Err(anyhow::Error::new(err).context("Failed to link tag")),
    }
}

async fn reconcile_mysql(pool: &MySqlPool, request: &Reconcile<'_>) -> Result<PersistOutcome> {
    let taggable = request.taggable();
    let mut tx = pool.begin().await.context("Failed to begin transaction")?;

    let entity = query::select_entity(request.model, request.taggable_id)?;
    if read_entity_mysql(&mut tx, &entity).await?.is_none() {
        return Err(EntityMissing { taggable }.into());
    }

    if let Some(cache) = request.cache {
        if let Some(update) = query::update_cached_tag_list(request.model, request.taggable_id, cache)? {
            update
                .to_mysql()
                .execute(&mut *tx)
                .await
                .context("Failed to write cached tag list")?;
        }
    }

    let linked = tags_for_mysql(&mut tx, &taggable).await?;
    let diff = TagDiff::compute(request.desired, &linked);
    let mut outcome = PersistOutcome::default();

    let removed_ids: Vec<i64> = diff.to_remove.iter().map(|tag| tag.id).collect();
    if !removed_ids.is_empty() {
        query::delete_taggings(&taggable.taggable_type, taggable.taggable_id, &removed_ids)
            .to_mysql()
            .execute(&mut *tx)
            .await
            .context("Failed to unlink tags")?;
        outcome.removed = diff.to_remove.iter().map(|tag| tag.name.clone()).collect();
    }

    for name in &diff.to_add {
        let tag = find_or_create_mysql(&mut tx, name, request.max_create_attempts).await?;
        if link_tag_mysql(&mut tx, tag.id, &taggable).await? {
            outcome.added.push(name.clone());
        }
    }

    if request.destroy_unused && !removed_ids.is_empty() {
        outcome.destroyed = query::delete_unused_tags(&removed_ids)
            .to_mysql()
            .execute(&mut *tx)
            .await
            .context("Failed to delete unused tags")?
            .rows_affected();
    }

    tx.commit().await.context("Failed to commit tag changes")?;
    Ok(outcome)
}

async fn remove_all_mysql(pool: &MySqlPool, taggable: &TaggableRef, destroy_unused: bool) -> Result<u64> {
    let mut tx = pool.begin().await.context("Failed to begin transaction")?;

    let tag_ids: Vec<i64> = tags_for_mysql(&mut tx, taggable)
        .await?
        .into_iter()
        .map(|tag| tag.id)
        .collect();

    let removed = sqlx::query("DELETE FROM taggings WHERE taggable_type = ? AND taggable_id = ?")
        .bind(&taggable.taggable_type)
        .bind(taggable.taggable_id)
        .execute(&mut *tx)
        .await
        .context("Failed to remove taggings")?
        .rows_affected();

    if destroy_unused && !tag_ids.is_empty() {
        query::delete_unused_tags(&tag_ids)
            .to_mysql()
            .execute(&mut *tx)
            .await
            .context("Failed to delete unused tags")?;
    }

    tx.commit().await.context("Failed to commit tag removal")?;
    Ok(removed)
}
