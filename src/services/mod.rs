//! Services layer - Business logic
//!
//! This module contains the tagging services:
//! - `TagService` for the shared tag store
//! - `TaggableRegistry` for resolving taggable types against the schema
//! - `TaggableService` for entity tag lists, persistence and tag queries

pub mod registry;
pub mod tag;
pub mod taggable;

pub use registry::{RegistryError, TaggableRegistry};
pub use tag::{TagService, TagServiceError};
pub use taggable::{TaggableError, TaggableService};
