//! Database layer
//!
//! This module provides database abstraction for the taggable engine.
//! It supports:
//! - SQLite (default)
//! - MySQL
//!
//! The database driver is selected based on configuration.
//!
//! # Architecture
//!
//! The database layer uses a trait-based abstraction (`DatabasePool`) that
//! allows the engine to work with either SQLite or MySQL without knowing the
//! specific backend. Queries whose shape depends on the caller (multi-tag
//! joins, optional count filters, entity scopes) are assembled by [`query`]
//! into SQL text plus ordered bind values, then executed by the
//! per-driver functions in [`repositories`].
//!
//! # Usage
//!
//! ```ignore
//! use taggable::config::DatabaseConfig;
//! use taggable::db::{create_pool, migrations};
//!
//! let config = DatabaseConfig::default();
//! let pool = create_pool(&config).await?;
//! migrations::run_migrations(&pool).await?;
//! pool.ping().await?;
//! ```

pub mod migrations;
pub mod pool;
pub mod query;
pub mod repositories;
pub mod schema;

pub use pool::{
    create_pool, create_test_pool, DatabasePool, DynDatabasePool, MysqlDatabase, SqliteDatabase,
};
