//! Schema introspection
//!
//! Lookups against the live schema used when taggable types are registered:
//! whether the entity table exists and whether it carries a cached tag list
//! column.

use anyhow::{Context, Result};
use sqlx::{MySqlPool, Row, SqlitePool};

use super::DynDatabasePool;
use crate::config::DatabaseDriver;

/// Check whether a table exists
pub async fn table_exists(pool: &DynDatabasePool, table: &str) -> Result<bool> {
    match pool.driver() {
        DatabaseDriver::Sqlite => {
            let pool = pool.as_sqlite().context("SQLite pool not available")?;
            table_exists_sqlite(pool, table).await
        }
        DatabaseDriver::Mysql => {
            let pool = pool.as_mysql().context("MySQL pool not available")?;
            table_exists_mysql(pool, table).await
        }
    }
}

/// Check whether a column exists on a table
pub async fn column_exists(pool: &DynDatabasePool, table: &str, column: &str) -> Result<bool> {
    match pool.driver() {
        DatabaseDriver::Sqlite => {
            let pool = pool.as_sqlite().context("SQLite pool not available")?;
            column_exists_sqlite(pool, table, column).await
        }
        DatabaseDriver::Mysql => {
            let pool = pool.as_mysql().context("MySQL pool not available")?;
            column_exists_mysql(pool, table, column).await
        }
    }
}

async fn table_exists_sqlite(pool: &SqlitePool, table: &str) -> Result<bool> {
    let row = sqlx::query(
        "SELECT COUNT(*) AS found FROM sqlite_master WHERE type IN ('table', 'view') AND name = ?",
    )
    .bind(table)
    .fetch_one(pool)
    .await
    .with_context(|| format!("Failed to look up table {}", table))?;

    let found: i64 = row.get("found");
    Ok(found > 0)
}

async fn column_exists_sqlite(pool: &SqlitePool, table: &str, column: &str) -> Result<bool> {
    let row = sqlx::query("SELECT COUNT(*) AS found FROM pragma_table_info(?) WHERE name = ?")
        .bind(table)
        .bind(column)
        .fetch_one(pool)
        .await
        .with_context(|| format!("Failed to inspect columns of {}", table))?;

    let found: i64 = row.get("found");
    Ok(found > 0)
}

async fn table_exists_mysql(pool: &MySqlPool, table: &str) -> Result<bool> {
    let row = sqlx::query(
        r#"
        SELECT COUNT(*) AS found
        FROM information_schema.tables
        WHERE table_schema = DATABASE() AND table_name = ?
        "#,
    )
    .bind(table)
    .fetch_one(pool)
    .await
    .with_context(|| format!("Failed to look up table {}", table))?;

    let found: i64 = row.get("found");
    Ok(found > 0)
}

async fn column_exists_mysql(pool: &MySqlPool, table: &str, column: &str) -> Result<bool> {
    let row = sqlx::query(
        r#"
        SELECT COUNT(*) AS found
        FROM information_schema.columns
        WHERE table_schema = DATABASE() AND table_name = ? AND column_name = ?
        "#,
    )
    .bind(table)
    .bind(column)
    .fetch_one(pool)
    .await
    .with_context(|| format!("Failed to inspect columns of {}", table))?;

    let found: i64 = row.get("found");
    Ok(found > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_test_pool;

    #[tokio::test]
    async fn test_table_and_column_lookup() {
        let pool = create_test_pool().await.expect("Failed to create test pool");
        pool.execute("CREATE TABLE posts (id INTEGER PRIMARY KEY, cached_tag_list TEXT)")
            .await
            .unwrap();

        assert!(table_exists(&pool, "posts").await.unwrap());
        assert!(!table_exists(&pool, "photos").await.unwrap());

        assert!(column_exists(&pool, "posts", "cached_tag_list").await.unwrap());
        assert!(!column_exists(&pool, "posts", "title").await.unwrap());
        assert!(!column_exists(&pool, "photos", "id").await.unwrap());
    }
}
