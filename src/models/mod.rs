//! Data models
//!
//! This module contains the data structures used throughout the engine:
//! - Database entities (Tag, Tagging)
//! - Tag lists and their string form
//! - Taggable types, per-entity tagging state and query filters

mod tag;
mod tag_list;
mod taggable;
mod tagging;

pub use tag::{Tag, TagCount, TagCounts};
pub use tag_list::{to_tag_set, IntoTagList, TagList, TagListError, TagListFormat};
pub use taggable::{PersistOutcome, TagDiff, TagState, TaggableModel, TaggedEntity};
pub use tagging::{
    CountFilter, EntityScope, MatchMode, ScopeOp, ScopePredicate, ScopeValue, TaggableRef, Tagging,
};
