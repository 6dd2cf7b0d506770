//! Schema migrations for the `tags` and `taggings` tables
//!
//! Host entity tables are never touched. Each migration carries SQL for both
//! drivers; applied versions are recorded in `_migrations`.
//!
//! ```ignore
//! let pool = create_pool(&config).await?;
//! migrations::run_migrations(&pool).await?;
//! ```

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use sqlx::{MySqlPool, Row, SqlitePool};

use super::DynDatabasePool;
use crate::config::DatabaseDriver;

const TRACKING_TABLE_SQLITE: &str = "CREATE TABLE IF NOT EXISTS _migrations (
    version INTEGER PRIMARY KEY,
    name VARCHAR(255) NOT NULL,
    applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
)";

const TRACKING_TABLE_MYSQL: &str = "CREATE TABLE IF NOT EXISTS _migrations (
    version INT PRIMARY KEY,
    name VARCHAR(255) NOT NULL,
    applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
)";

/// One schema step
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    /// Ordering key, unique
    pub version: i32,
    pub name: &'static str,
    pub up_sqlite: &'static str,
    pub up_mysql: &'static str,
}

impl Migration {
    fn statements(&self, driver: DatabaseDriver) -> impl Iterator<Item = &'static str> {
        let sql = match driver {
            DatabaseDriver::Sqlite => self.up_sqlite,
            DatabaseDriver::Mysql => self.up_mysql,
        };
        sql.split(';').map(str::trim).filter(|stmt| !is_blank(stmt))
    }
}

/// Applied and pending versions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationStatus {
    pub applied: Vec<i32>,
    pub pending: Vec<i32>,
}

impl MigrationStatus {
    pub fn is_up_to_date(&self) -> bool {
        self.pending.is_empty()
    }
}

/// All migrations owned by the engine.
///
/// Tag names are unique regardless of case: SQLite declares the column
/// `COLLATE NOCASE`, MySQL relies on a `_ci` collation. Every name comparison
/// issued against `tags.name` inherits that collation.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "create_tags",
        up_sqlite: r#"
            CREATE TABLE IF NOT EXISTS tags (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name VARCHAR(255) NOT NULL COLLATE NOCASE,
                created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_tags_name ON tags(name COLLATE NOCASE);
            CREATE INDEX IF NOT EXISTS idx_tags_created_at ON tags(created_at);
        "#,
        up_mysql: r#"
            CREATE TABLE IF NOT EXISTS tags (
                id BIGINT PRIMARY KEY AUTO_INCREMENT,
                name VARCHAR(255) CHARACTER SET utf8mb4 COLLATE utf8mb4_unicode_ci NOT NULL,
                created_at TIMESTAMP(6) NOT NULL DEFAULT CURRENT_TIMESTAMP(6)
            );
            CREATE UNIQUE INDEX idx_tags_name ON tags(name);
            CREATE INDEX idx_tags_created_at ON tags(created_at);
        "#,
    },
    Migration {
        version: 2,
        name: "create_taggings",
        up_sqlite: r#"
            CREATE TABLE IF NOT EXISTS taggings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tag_id INTEGER NOT NULL,
                taggable_type VARCHAR(255) NOT NULL,
                taggable_id INTEGER NOT NULL,
                created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
                FOREIGN KEY (tag_id) REFERENCES tags(id) ON DELETE CASCADE
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_taggings_taggable_tag
                ON taggings(taggable_type, taggable_id, tag_id);
            CREATE INDEX IF NOT EXISTS idx_taggings_tag_id ON taggings(tag_id);
        "#,
        up_mysql: r#"
            CREATE TABLE IF NOT EXISTS taggings (
                id BIGINT PRIMARY KEY AUTO_INCREMENT,
                tag_id BIGINT NOT NULL,
                taggable_type VARCHAR(255) NOT NULL,
                taggable_id BIGINT NOT NULL,
                created_at TIMESTAMP(6) NOT NULL DEFAULT CURRENT_TIMESTAMP(6),
                FOREIGN KEY (tag_id) REFERENCES tags(id) ON DELETE CASCADE
            );
            CREATE UNIQUE INDEX idx_taggings_taggable_tag
                ON taggings(taggable_type, taggable_id, tag_id);
            CREATE INDEX idx_taggings_tag_id ON taggings(tag_id);
        "#,
    },
];

/// Apply every migration not yet recorded, in version order
///
/// Returns the number applied.
pub async fn run_migrations(pool: &DynDatabasePool) -> Result<usize> {
    let pending = pending(pool).await?;

    for migration in &pending {
        tracing::info!(version = migration.version, name = migration.name, "Applying migration");
        match pool.driver() {
            DatabaseDriver::Sqlite => {
                let sqlite = pool.as_sqlite().context("SQLite pool not available")?;
                apply_sqlite(sqlite, migration).await
            }
            DatabaseDriver::Mysql => {
                let mysql = pool.as_mysql().context("MySQL pool not available")?;
                apply_mysql(mysql, migration).await
            }
        }
        .with_context(|| format!("Failed to apply migration: {}", migration.name))?;
    }

    if pending.is_empty() {
        tracing::debug!("Schema is up to date");
    } else {
        tracing::info!(count = pending.len(), "Applied migrations");
    }
    Ok(pending.len())
}

/// Which versions are applied and which are still pending
pub async fn status(pool: &DynDatabasePool) -> Result<MigrationStatus> {
    let applied = applied_versions(pool).await?;
    let pending = MIGRATIONS
        .iter()
        .map(|m| m.version)
        .filter(|v| !applied.contains(v))
        .collect();

    Ok(MigrationStatus {
        applied: applied.into_iter().collect(),
        pending,
    })
}

/// True when every migration has been applied
pub async fn is_up_to_date(pool: &DynDatabasePool) -> Result<bool> {
    Ok(status(pool).await?.is_up_to_date())
}

pub async fn pending_count(pool: &DynDatabasePool) -> Result<usize> {
    Ok(status(pool).await?.pending.len())
}

async fn pending(pool: &DynDatabasePool) -> Result<Vec<&'static Migration>> {
    let applied = applied_versions(pool).await?;
    Ok(MIGRATIONS
        .iter()
        .filter(|m| !applied.contains(&m.version))
        .collect())
}

/// Recorded versions; creates the tracking table on first use
async fn applied_versions(pool: &DynDatabasePool) -> Result<BTreeSet<i32>> {
    const SELECT: &str = "SELECT version FROM _migrations";

    match pool.driver() {
        DatabaseDriver::Sqlite => {
            let sqlite = pool.as_sqlite().context("SQLite pool not available")?;
            sqlx::query(TRACKING_TABLE_SQLITE)
                .execute(sqlite)
                .await
                .context("Failed to create migrations table")?;
            let rows = sqlx::query(SELECT).fetch_all(sqlite).await?;
            Ok(rows.iter().map(|row| row.get::<i32, _>("version")).collect())
        }
        DatabaseDriver::Mysql => {
            let mysql = pool.as_mysql().context("MySQL pool not available")?;
            sqlx::query(TRACKING_TABLE_MYSQL)
                .execute(mysql)
                .await
                .context("Failed to create migrations table")?;
            let rows = sqlx::query(SELECT).fetch_all(mysql).await?;
            Ok(rows.iter().map(|row| row.get::<i32, _>("version")).collect())
        }
    }
}

async fn apply_sqlite(pool: &SqlitePool, migration: &Migration) -> Result<()> {
    let mut tx = pool.begin().await?;

    for statement in migration.statements(DatabaseDriver::Sqlite) {
        sqlx::query(statement)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to execute: {}", abbreviate(statement)))?;
    }
    sqlx::query("INSERT INTO _migrations (version, name) VALUES (?, ?)")
        .bind(migration.version)
        .bind(migration.name)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(())
}

async fn apply_mysql(pool: &MySqlPool, migration: &Migration) -> Result<()> {
    // DDL commits implicitly on MySQL
    for statement in migration.statements(DatabaseDriver::Mysql) {
        sqlx::query(statement)
            .execute(pool)
            .await
            .with_context(|| format!("Failed to execute: {}", abbreviate(statement)))?;
    }
    sqlx::query("INSERT INTO _migrations (version, name) VALUES (?, ?)")
        .bind(migration.version)
        .bind(migration.name)
        .execute(pool)
        .await?;
    Ok(())
}

fn is_blank(fragment: &str) -> bool {
    fragment
        .lines()
        .map(str::trim)
        .all(|line| line.is_empty() || line.starts_with("--"))
}

fn abbreviate(sql: &str) -> String {
    match sql.char_indices().nth(80) {
        Some((idx, _)) => format!("{}...", &sql[..idx]),
        None => sql.to_string(),
    }
}
