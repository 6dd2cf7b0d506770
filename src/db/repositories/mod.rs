//! Database repositories
//!
//! Repository pattern implementations for database access.
//! Tags are reached through `TagRepository`, entity links through
//! `TaggingRepository`.

pub mod tag;
pub mod tagging;

pub use tag::{SqlxTagRepository, TagNameConflict, TagRepository};
pub use tagging::{EntityMissing, Reconcile, SqlxTaggingRepository, TaggingRepository};
