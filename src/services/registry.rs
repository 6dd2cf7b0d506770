//! Taggable type registry
//!
//! Resolves each configured taggable type once at startup: identifiers are
//! validated, the entity table must exist, and the cached tag list column is
//! looked up so later operations never introspect the schema again.

use std::collections::BTreeMap;

use crate::config::{TaggableTypeConfig, TaggingConfig};
use crate::db::query::{validate_identifier, QueryError};
use crate::db::{schema, DynDatabasePool};
use crate::models::TaggableModel;

/// Error types for taggable type registration
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Table or column name is not a plain identifier
    #[error(transparent)]
    InvalidIdentifier(#[from] QueryError),

    /// Blank type name
    #[error("Taggable type name cannot be empty")]
    EmptyTypeName,

    /// Same type registered twice
    #[error("Taggable type {0} is already registered")]
    DuplicateType(String),

    /// Entity table does not exist
    #[error("Table {table} for taggable type {name} does not exist")]
    MissingTable { name: String, table: String },

    /// Primary key column does not exist
    #[error("Column {column} does not exist on table {table}")]
    MissingColumn { table: String, column: String },

    /// Internal error
    #[error("Internal error: {0}")]
    InternalError(#[from] anyhow::Error),
}

/// Taggable types by name
#[derive(Debug, Clone, Default)]
pub struct TaggableRegistry {
    models: BTreeMap<String, TaggableModel>,
}

impl TaggableRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve every type listed in the tagging configuration
    pub async fn resolve(
        pool: &DynDatabasePool,
        config: &TaggingConfig,
    ) -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        for taggable in &config.types {
            registry.register(pool, taggable, &config.cached_column).await?;
        }
        Ok(registry)
    }

    /// Resolve one type against the live schema and add it
    ///
    /// `default_cached_column` is looked up when the type names no column of
    /// its own. A missing cached column is not an error: the type just
    /// derives its tag list from links.
    pub async fn register(
        &mut self,
        pool: &DynDatabasePool,
        taggable: &TaggableTypeConfig,
        default_cached_column: &str,
    ) -> Result<&TaggableModel, RegistryError> {
        let name = taggable.name.trim();
        if name.is_empty() {
            return Err(RegistryError::EmptyTypeName);
        }
        if self.models.contains_key(name) {
            return Err(RegistryError::DuplicateType(name.to_string()));
        }

        validate_identifier(&taggable.table)?;
        validate_identifier(&taggable.primary_key)?;
        let candidate = taggable
            .cached_column
            .as_deref()
            .unwrap_or(default_cached_column);
        validate_identifier(candidate)?;

        if !schema::table_exists(pool, &taggable.table).await? {
            return Err(RegistryError::MissingTable {
                name: name.to_string(),
                table: taggable.table.clone(),
            });
        }
        if !schema::column_exists(pool, &taggable.table, &taggable.primary_key).await? {
            return Err(RegistryError::MissingColumn {
                table: taggable.table.clone(),
                column: taggable.primary_key.clone(),
            });
        }

        let cached_column = if schema::column_exists(pool, &taggable.table, candidate).await? {
            Some(candidate.to_string())
        } else {
            if taggable.cached_column.is_some() {
                tracing::warn!(
                    taggable_type = name,
                    column = candidate,
                    "Configured cached tag list column not found, tags will be read from links"
                );
            }
            None
        };

        tracing::info!(
            taggable_type = name,
            table = %taggable.table,
            cached_column = cached_column.as_deref().unwrap_or("-"),
            "Registered taggable type"
        );

        let model = TaggableModel {
            name: name.to_string(),
            table: taggable.table.clone(),
            primary_key: taggable.primary_key.clone(),
            cached_column,
        };
        Ok(self.models.entry(name.to_string()).or_insert(model))
    }

    /// Look up a registered type
    pub fn get(&self, name: &str) -> Option<&TaggableModel> {
        self.models.get(name)
    }

    /// Registered type names in order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_test_pool;

    async fn setup_pool() -> DynDatabasePool {
        let pool = create_test_pool().await.expect("Failed to create test pool");
        pool.execute("CREATE TABLE posts (id INTEGER PRIMARY KEY, title TEXT, cached_tag_list TEXT)")
            .await
            .unwrap();
        pool.execute("CREATE TABLE photos (id INTEGER PRIMARY KEY, title TEXT)")
            .await
            .unwrap();
        pool.execute("CREATE TABLE notes (note_id INTEGER PRIMARY KEY, tag_cache TEXT)")
            .await
            .unwrap();
        pool
    }

    fn config(types: Vec<TaggableTypeConfig>) -> TaggingConfig {
        TaggingConfig {
            types,
            ..TaggingConfig::default()
        }
    }

    #[tokio::test]
    async fn test_resolve_detects_cached_column() {
        let pool = setup_pool().await;
        let registry = TaggableRegistry::resolve(
            &pool,
            &config(vec![
                TaggableTypeConfig::new("Post", "posts"),
                TaggableTypeConfig::new("Photo", "photos"),
            ]),
        )
        .await
        .unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.get("Post").unwrap().cached_column.as_deref(),
            Some("cached_tag_list")
        );
        assert!(!registry.get("Photo").unwrap().caches_tag_list());
        assert!(registry.get("Video").is_none());
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["Photo", "Post"]);
    }

    #[tokio::test]
    async fn test_resolve_with_overrides() {
        let pool = setup_pool().await;
        let registry = TaggableRegistry::resolve(
            &pool,
            &config(vec![TaggableTypeConfig::new("Note", "notes")
                .with_primary_key("note_id")
                .with_cached_column("tag_cache")]),
        )
        .await
        .unwrap();

        let note = registry.get("Note").unwrap();
        assert_eq!(note.primary_key, "note_id");
        assert_eq!(note.cached_column.as_deref(), Some("tag_cache"));
    }

    #[tokio::test]
    async fn test_resolve_rejects_bad_types() {
        let pool = setup_pool().await;

        let missing = TaggableRegistry::resolve(
            &pool,
            &config(vec![TaggableTypeConfig::new("Video", "videos")]),
        )
        .await;
        assert!(matches!(missing, Err(RegistryError::MissingTable { .. })));

        let injected = TaggableRegistry::resolve(
            &pool,
            &config(vec![TaggableTypeConfig::new("Post", "posts; DROP TABLE tags")]),
        )
        .await;
        assert!(matches!(injected, Err(RegistryError::InvalidIdentifier(_))));

        let no_pk = TaggableRegistry::resolve(
            &pool,
            &config(vec![TaggableTypeConfig::new("Note", "notes")]),
        )
        .await;
        assert!(matches!(no_pk, Err(RegistryError::MissingColumn { .. })));

        let duplicate = TaggableRegistry::resolve(
            &pool,
            &config(vec![
                TaggableTypeConfig::new("Post", "posts"),
                TaggableTypeConfig::new("Post", "photos"),
            ]),
        )
        .await;
        assert!(matches!(duplicate, Err(RegistryError::DuplicateType(_))));
    }
}
