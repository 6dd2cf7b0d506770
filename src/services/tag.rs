//! Tag service
//!
//! Business logic for the tag store:
//! - Find or create tags by name, ignoring case
//! - Tag frequencies with optional creation window and count bounds
//! - Deleting tags and sweeping unused ones

use crate::db::query::CountScope;
use crate::db::repositories::{TagNameConflict, TagRepository};
use crate::models::{CountFilter, Tag, TagCounts};
use anyhow::Context;
use std::sync::Arc;

/// Default number of find-or-create rounds before giving up
pub const DEFAULT_MAX_CREATE_ATTEMPTS: u32 = 3;

/// Error types for tag service operations
#[derive(Debug, thiserror::Error)]
pub enum TagServiceError {
    /// Tag not found
    #[error("Tag not found: {0}")]
    NotFound(String),

    /// Validation error
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Every find-or-create attempt lost a race
    #[error("Tag {name:?} could not be created after {attempts} attempts")]
    ConstraintViolation { name: String, attempts: u32 },

    /// Internal error
    #[error("Internal error: {0}")]
    InternalError(#[from] anyhow::Error),
}

impl TagServiceError {
    /// Recover typed repository failures from an anyhow chain
    fn from_repository(err: anyhow::Error) -> Self {
        match err.downcast_ref::<TagNameConflict>() {
            Some(conflict) => TagServiceError::ConstraintViolation {
                name: conflict.name.clone(),
                attempts: conflict.attempts,
            },
            None => TagServiceError::InternalError(err),
        }
    }
}

/// Tag service for managing shared tags
pub struct TagService {
    repo: Arc<dyn TagRepository>,
    max_create_attempts: u32,
}

impl TagService {
    /// Create a new tag service
    ///
    /// # Arguments
    /// * `repo` - Tag repository for database operations
    pub fn new(repo: Arc<dyn TagRepository>) -> Self {
        Self {
            repo,
            max_create_attempts: DEFAULT_MAX_CREATE_ATTEMPTS,
        }
    }

    /// Set how many find-or-create rounds run before a conflict is reported
    pub fn with_max_create_attempts(mut self, attempts: u32) -> Self {
        self.max_create_attempts = attempts.max(1);
        self
    }

    /// Return the tag with this name, creating it if absent
    ///
    /// Lookup ignores case; an existing tag keeps its original casing.
    ///
    /// # Errors
    /// - `ValidationError` if the name is blank
    /// - `ConstraintViolation` if concurrent writers won every attempt
    pub async fn find_or_create(&self, name: &str) -> Result<Tag, TagServiceError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(TagServiceError::ValidationError(
                "Tag name cannot be empty".to_string(),
            ));
        }

        self.repo
            .find_or_create(name, self.max_create_attempts)
            .await
            .map_err(TagServiceError::from_repository)
    }

    /// Get tag by ID
    pub async fn get_by_id(&self, id: i64) -> Result<Option<Tag>, TagServiceError> {
        self.repo
            .get_by_id(id)
            .await
            .context("Failed to get tag by ID")
            .map_err(Into::into)
    }

    /// Get tag by name, ignoring case
    pub async fn find_by_name(&self, name: &str) -> Result<Option<Tag>, TagServiceError> {
        let name = name.trim();
        if name.is_empty() {
            return Ok(None);
        }

        self.repo
            .find_by_name(name)
            .await
            .context("Failed to get tag by name")
            .map_err(Into::into)
    }

    /// List all tags ordered by name
    pub async fn list(&self) -> Result<Vec<Tag>, TagServiceError> {
        self.repo
            .list()
            .await
            .context("Failed to list tags")
            .map_err(Into::into)
    }

    /// Delete a tag together with all of its taggings
    ///
    /// # Errors
    /// - `NotFound` if no tag has this ID
    pub async fn delete(&self, id: i64) -> Result<(), TagServiceError> {
        let deleted = self
            .repo
            .delete(id)
            .await
            .context("Failed to delete tag")?;

        if !deleted {
            return Err(TagServiceError::NotFound(format!("Tag with ID {}", id)));
        }
        tracing::debug!(tag_id = id, "Deleted tag");
        Ok(())
    }

    /// Tag frequencies across every taggable type
    pub async fn counts(&self, filter: &CountFilter) -> Result<TagCounts, TagServiceError> {
        self.repo
            .counts(filter, &CountScope::global())
            .await
            .context("Failed to count tags")
            .map_err(Into::into)
    }

    /// Delete every tag that no entity uses; returns how many were removed
    pub async fn delete_unused(&self) -> Result<u64, TagServiceError> {
        let removed = self
            .repo
            .delete_unused()
            .await
            .context("Failed to delete unused tags")?;

        if removed > 0 {
            tracing::info!(removed, "Deleted unused tags");
        }
        Ok(removed)
    }
}
