//! Taggable - tagging engine for relational entities
//!
//! This library attaches shared, case-insensitively unique tags to rows of
//! any registered table, keeps an optional cached tag list column in sync,
//! and answers tag queries (ANY / ALL / NONE matching, related tags, counts)
//! over SQLite or MySQL.

pub mod config;
pub mod db;
pub mod models;
pub mod services;
