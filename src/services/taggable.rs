//! Taggable service
//!
//! Ties tag lists to entities of registered types:
//! - Reading, setting, adding and removing an entity's tags in memory
//! - Persisting a pending list as one transactional link diff
//! - Finding entities by tags (ANY / ALL / NONE) and related tags
//! - Tag frequencies for a type or around one entity
//!
//! Entities move through `Clean -> Mutated -> CacheStaged -> LinkWritePending
//! -> Clean`. A failed persist leaves the entity `CacheStaged` with its
//! pending list intact so the caller can retry.

use std::sync::Arc;

use crate::config::TaggingConfig;
use crate::db::query::{CountScope, QueryError};
use crate::db::repositories::{
    EntityMissing, Reconcile, TagNameConflict, TagRepository, TaggingRepository,
};
use crate::models::{
    to_tag_set, CountFilter, EntityScope, IntoTagList, MatchMode, PersistOutcome, TagCounts,
    TagList, TagListError, TagListFormat, TagState, TaggableModel, TaggableRef, TaggedEntity,
};
use crate::services::registry::TaggableRegistry;

/// Error types for taggable operations
#[derive(Debug, thiserror::Error)]
pub enum TaggableError {
    /// Tag list text could not be parsed
    #[error("Invalid tag list: {0}")]
    Parse(#[from] TagListError),

    /// Type was never registered
    #[error("Unknown taggable type: {0}")]
    UnknownType(String),

    /// Entity row does not exist
    #[error("Entity not found: {0}")]
    EntityNotFound(TaggableRef),

    /// Scope column is not a plain identifier
    #[error("Invalid SQL identifier: {0}")]
    InvalidIdentifier(String),

    /// Every find-or-create attempt lost a race
    #[error("Tag {name:?} could not be created after {attempts} attempts")]
    ConstraintViolation { name: String, attempts: u32 },

    /// Storage failed; any transaction was rolled back
    #[error("Persistence failure: {0}")]
    PersistenceFailure(#[from] anyhow::Error),
}

impl TaggableError {
    /// Recover typed repository failures from an anyhow chain
    fn from_repository(err: anyhow::Error) -> Self {
        if let Some(missing) = err.downcast_ref::<EntityMissing>() {
            return TaggableError::EntityNotFound(missing.taggable.clone());
        }
        if let Some(conflict) = err.downcast_ref::<TagNameConflict>() {
            return TaggableError::ConstraintViolation {
                name: conflict.name.clone(),
                attempts: conflict.attempts,
            };
        }
        if let Some(QueryError::InvalidIdentifier(name)) = err.downcast_ref::<QueryError>() {
            return TaggableError::InvalidIdentifier(name.clone());
        }
        TaggableError::PersistenceFailure(err)
    }
}

/// Taggable service
pub struct TaggableService {
    registry: Arc<TaggableRegistry>,
    tags: Arc<dyn TagRepository>,
    taggings: Arc<dyn TaggingRepository>,
    format: TagListFormat,
    destroy_unused: bool,
    max_create_attempts: u32,
}

impl TaggableService {
    /// Create a new taggable service
    ///
    /// # Arguments
    /// * `registry` - Resolved taggable types
    /// * `tags` - Tag repository, used for counting
    /// * `taggings` - Tagging repository for entity links
    /// * `config` - Delimiter, unused-tag policy and retry bound
    pub fn new(
        registry: Arc<TaggableRegistry>,
        tags: Arc<dyn TagRepository>,
        taggings: Arc<dyn TaggingRepository>,
        config: &TaggingConfig,
    ) -> Self {
        Self {
            registry,
            tags,
            taggings,
            format: TagListFormat::new(config.delimiter),
            destroy_unused: config.destroy_unused,
            max_create_attempts: config.max_create_attempts.max(1),
        }
    }

    /// Tag list format used for parsing and the cache column
    pub fn format(&self) -> &TagListFormat {
        &self.format
    }

    /// Registered type by name
    pub fn model(&self, taggable_type: &str) -> Result<&TaggableModel, TaggableError> {
        self.registry
            .get(taggable_type)
            .ok_or_else(|| TaggableError::UnknownType(taggable_type.to_string()))
    }

    /// Parse or normalize any supported tag input with the configured format
    pub fn tag_list<T: IntoTagList>(&self, input: T) -> Result<TagList, TaggableError> {
        Ok(to_tag_set(input, &self.format)?)
    }

    /// Handle to an entity without reading it
    ///
    /// Its cached tag list is unknown, so `current_tags` reads links.
    pub fn entity(&self, taggable_type: &str, id: i64) -> Result<TaggedEntity, TaggableError> {
        let model = self.model(taggable_type)?;
        Ok(TaggedEntity::new(TaggableRef::new(model.name.as_str(), id)))
    }

    /// Read an entity and its cached tag list
    pub async fn load(&self, taggable_type: &str, id: i64) -> Result<TaggedEntity, TaggableError> {
        let model = self.model(taggable_type)?;
        self.taggings
            .find_entity(model, id)
            .await
            .map_err(TaggableError::from_repository)?
            .ok_or_else(|| TaggableError::EntityNotFound(TaggableRef::new(model.name.as_str(), id)))
    }

    /// Drop pending changes and re-read the entity
    pub async fn reload(&self, entity: &mut TaggedEntity) -> Result<(), TaggableError> {
        let fresh = self.load(entity.taggable_type(), entity.id()).await?;
        entity.reset(fresh.cached_tag_list().map(str::to_string));
        Ok(())
    }

    /// The entity's tags: the pending list if one is set, else the cached
    /// column when the type has one, else the persisted links in link order
    pub async fn current_tags(&self, entity: &TaggedEntity) -> Result<TagList, TaggableError> {
        if let Some(pending) = entity.pending() {
            return Ok(pending.clone());
        }

        let model = self.model(entity.taggable_type())?;
        if model.caches_tag_list() {
            if let Some(cached) = entity.cached_tag_list() {
                return Ok(TagList::parse_with(cached, &self.format)?);
            }
        }

        let tags = self
            .taggings
            .tags_for(entity.taggable())
            .await
            .map_err(TaggableError::from_repository)?;
        Ok(tags.iter().map(|tag| tag.name.as_str()).collect())
    }

    /// Replace the entity's desired tags; nothing is written until `persist`
    pub fn set_tags<T: IntoTagList>(
        &self,
        entity: &mut TaggedEntity,
        input: T,
    ) -> Result<(), TaggableError> {
        self.model(entity.taggable_type())?;
        let list = self.tag_list(input)?;
        entity.set_pending(list);
        Ok(())
    }

    /// Append tags to the entity's current tags
    pub async fn add_tags<T: IntoTagList>(
        &self,
        entity: &mut TaggedEntity,
        input: T,
    ) -> Result<(), TaggableError> {
        let additions = self.tag_list(input)?;
        let mut list = self.current_tags(entity).await?;
        list.extend(additions.iter());
        entity.set_pending(list);
        Ok(())
    }

    /// Remove tags from the entity's current tags
    pub async fn remove_tags<T: IntoTagList>(
        &self,
        entity: &mut TaggedEntity,
        input: T,
    ) -> Result<(), TaggableError> {
        let removals = self.tag_list(input)?;
        let mut list = self.current_tags(entity).await?;
        for name in &removals {
            list.remove(name);
        }
        entity.set_pending(list);
        Ok(())
    }

    /// Stage the cache column value for the pending list
    ///
    /// Names equal ignoring case resolve to one stored tag, so only the first
    /// spelling is kept in both the pending list and the cache.
    pub fn prepare(&self, entity: &mut TaggedEntity) -> Result<(), TaggableError> {
        if entity.state() != TagState::Mutated {
            return Ok(());
        }

        let model = self.model(entity.taggable_type())?;
        let folded = entity.pending().map(TagList::fold_case_duplicates);
        if let Some(folded) = folded {
            entity.set_pending(folded);
        }
        let cache = match entity.pending() {
            Some(pending) if model.caches_tag_list() => Some(pending.serialize_with(&self.format)),
            _ => None,
        };
        entity.stage_cache(cache);
        Ok(())
    }

    /// Write the pending list: cache column, link removals, tag creation and
    /// link insertions commit together or not at all.
    ///
    /// Returns `None` when there was nothing to write.
    pub async fn persist(
        &self,
        entity: &mut TaggedEntity,
    ) -> Result<Option<PersistOutcome>, TaggableError> {
        if entity.state() == TagState::Clean {
            return Ok(None);
        }
        self.prepare(entity)?;

        let Some(desired) = entity.pending().cloned() else {
            entity.reset(entity.cached_tag_list().map(str::to_string));
            return Ok(None);
        };
        let model = self.model(entity.taggable_type())?;
        let cache = entity.staged_cache().map(str::to_string);

        entity.begin_link_write();
        let result = self
            .taggings
            .reconcile(&Reconcile {
                model,
                taggable_id: entity.id(),
                desired: &desired,
                cache: cache.as_deref(),
                destroy_unused: self.destroy_unused,
                max_create_attempts: self.max_create_attempts,
            })
            .await;

        match result {
            Ok(outcome) => {
                entity.finish_persist();
                tracing::debug!(
                    entity = %entity.taggable(),
                    added = outcome.added.len(),
                    removed = outcome.removed.len(),
                    destroyed = outcome.destroyed,
                    "Persisted tags"
                );
                Ok(Some(outcome))
            }
            Err(err) => {
                entity.abort_link_write();
                tracing::warn!(entity = %entity.taggable(), error = %err, "Failed to persist tags");
                Err(TaggableError::from_repository(err))
            }
        }
    }

    /// Ids of entities of a type matching the tags under `mode`, ascending
    pub async fn tagged_with<T: IntoTagList>(
        &self,
        taggable_type: &str,
        tags: T,
        mode: MatchMode,
    ) -> Result<Vec<i64>, TaggableError> {
        self.tagged_with_scoped(taggable_type, tags, mode, &EntityScope::all())
            .await
    }

    /// `tagged_with` restricted by predicates on the entity table
    pub async fn tagged_with_scoped<T: IntoTagList>(
        &self,
        taggable_type: &str,
        tags: T,
        mode: MatchMode,
        scope: &EntityScope,
    ) -> Result<Vec<i64>, TaggableError> {
        let model = self.model(taggable_type)?;
        let names = self.tag_list(tags)?;
        self.taggings
            .tagged_with(model, names.names(), mode, scope)
            .await
            .map_err(TaggableError::from_repository)
    }

    /// Other tags on entities tagged with any of `tags`, most frequent first
    pub async fn related_tags<T: IntoTagList>(
        &self,
        taggable_type: &str,
        tags: T,
    ) -> Result<TagCounts, TaggableError> {
        let model = self.model(taggable_type)?;
        let names = self.tag_list(tags)?;
        self.taggings
            .related_tags(model, names.names(), &EntityScope::all())
            .await
            .map_err(TaggableError::from_repository)
    }

    /// Tag frequencies among entities of one type
    pub async fn tag_counts_for_type(
        &self,
        taggable_type: &str,
        filter: &CountFilter,
        scope: &EntityScope,
    ) -> Result<TagCounts, TaggableError> {
        let model = self.model(taggable_type)?;
        let count_scope = CountScope::for_model(model).with_entity_scope(scope);
        self.tags
            .counts(filter, &count_scope)
            .await
            .map_err(TaggableError::from_repository)
    }

    /// Tag frequencies among entities of the same type sharing any tag with
    /// this one
    pub async fn tag_counts_for_entity(
        &self,
        entity: &TaggedEntity,
        filter: &CountFilter,
    ) -> Result<TagCounts, TaggableError> {
        let model = self.model(entity.taggable_type())?;
        let current = self.current_tags(entity).await?;
        if current.is_empty() {
            return Ok(TagCounts::default());
        }

        let count_scope = CountScope::for_model(model).tagged_with_any(current.names());
        self.tags
            .counts(filter, &count_scope)
            .await
            .map_err(TaggableError::from_repository)
    }

    /// Delete every link of an entity, for when the host deletes the entity
    pub async fn remove_all(&self, entity: &mut TaggedEntity) -> Result<u64, TaggableError> {
        self.model(entity.taggable_type())?;
        let removed = self
            .taggings
            .remove_all(entity.taggable(), self.destroy_unused)
            .await
            .map_err(TaggableError::from_repository)?;

        entity.reset(None);
        tracing::debug!(entity = %entity.taggable(), removed, "Removed all taggings");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DatabaseConfig, TaggableTypeConfig};
    use crate::db::repositories::{SqlxTagRepository, SqlxTaggingRepository};
    use crate::db::{create_pool, create_test_pool, migrations, DynDatabasePool};
    use crate::models::Tag;
    use sqlx::Row;

    fn tagging_config() -> TaggingConfig {
        TaggingConfig {
            types: vec![
                TaggableTypeConfig::new("Post", "posts"),
                TaggableTypeConfig::new("Photo", "photos"),
            ],
            ..TaggingConfig::default()
        }
    }

    async fn setup_with(config: TaggingConfig) -> (DynDatabasePool, TaggableService) {
        let pool = create_test_pool()
            .await
            .expect("Failed to create test pool");
        setup_on(pool, config).await
    }

    async fn setup_on(
        pool: DynDatabasePool,
        config: TaggingConfig,
    ) -> (DynDatabasePool, TaggableService) {
        migrations::run_migrations(&pool)
            .await
            .expect("Failed to run migrations");
        pool.execute(
            "CREATE TABLE posts (id INTEGER PRIMARY KEY, title TEXT NOT NULL, \
             published INTEGER NOT NULL DEFAULT 1, cached_tag_list TEXT)",
        )
        .await
        .unwrap();
        pool.execute("CREATE TABLE photos (id INTEGER PRIMARY KEY, title TEXT NOT NULL)")
            .await
            .unwrap();

        let registry = TaggableRegistry::resolve(&pool, &config)
            .await
            .expect("Failed to resolve taggable types");
        let service = TaggableService::new(
            Arc::new(registry),
            SqlxTagRepository::boxed(pool.clone()),
            SqlxTaggingRepository::boxed(pool.clone()),
            &config,
        );

        (pool, service)
    }

    async fn setup_test_service() -> (DynDatabasePool, TaggableService) {
        setup_with(tagging_config()).await
    }

    async fn create_row(pool: &DynDatabasePool, table: &str, id: i64) {
        sqlx::query(&format!("INSERT INTO {} (id, title) VALUES (?, ?)", table))
            .bind(id)
            .bind(format!("{} {}", table, id))
            .execute(pool.as_sqlite().unwrap())
            .await
            .expect("Failed to create entity");
    }

    /// Create a post and persist the given tags on it
    async fn tagged_post(
        pool: &DynDatabasePool,
        service: &TaggableService,
        id: i64,
        tags: &str,
    ) -> TaggedEntity {
        create_row(pool, "posts", id).await;
        let mut post = service.load("Post", id).await.unwrap();
        service.set_tags(&mut post, tags).unwrap();
        service.persist(&mut post).await.unwrap();
        post
    }

    async fn cached_column(pool: &DynDatabasePool, id: i64) -> Option<String> {
        sqlx::query("SELECT cached_tag_list FROM posts WHERE id = ?")
            .bind(id)
            .fetch_one(pool.as_sqlite().unwrap())
            .await
            .unwrap()
            .get("cached_tag_list")
    }

    async fn tag_rows(pool: &DynDatabasePool) -> Vec<String> {
        sqlx::query("SELECT name FROM tags ORDER BY name")
            .fetch_all(pool.as_sqlite().unwrap())
            .await
            .unwrap()
            .iter()
            .map(|row| row.get("name"))
            .collect()
    }

    async fn tagging_id(pool: &DynDatabasePool, tag: &str, taggable_id: i64) -> Option<i64> {
        sqlx::query(
            "SELECT tg.id FROM taggings tg INNER JOIN tags t ON t.id = tg.tag_id \
             WHERE t.name = ? AND tg.taggable_type = 'Post' AND tg.taggable_id = ?",
        )
        .bind(tag)
        .bind(taggable_id)
        .fetch_optional(pool.as_sqlite().unwrap())
        .await
        .unwrap()
        .map(|row| row.get("id"))
    }

    fn ids(list: &[i64]) -> Vec<i64> {
        list.to_vec()
    }

    // ========================================================================
    // Reconciliation
    // ========================================================================

    #[tokio::test]
    async fn test_persist_reconciles_links() {
        let (pool, service) = setup_test_service().await;
        let mut post = tagged_post(&pool, &service, 1, "ruby, rails").await;
        let rails_link = tagging_id(&pool, "rails", 1).await.unwrap();

        service.set_tags(&mut post, "rails, rust").unwrap();
        let outcome = service.persist(&mut post).await.unwrap().unwrap();

        assert_eq!(outcome.added, vec!["rust"]);
        assert_eq!(outcome.removed, vec!["ruby"]);
        assert_eq!(tagging_id(&pool, "rails", 1).await, Some(rails_link));
        assert!(tagging_id(&pool, "ruby", 1).await.is_none());
        assert!(tagging_id(&pool, "rust", 1).await.is_some());
        assert_eq!(cached_column(&pool, 1).await.as_deref(), Some("rails, rust"));
        assert_eq!(post.state(), TagState::Clean);
        assert_eq!(post.cached_tag_list(), Some("rails, rust"));
        // Tag rows outlive their links unless destroy_unused is on
        assert_eq!(tag_rows(&pool).await, vec!["rails", "ruby", "rust"]);
    }

    #[tokio::test]
    async fn test_persist_is_idempotent() {
        let (pool, service) = setup_test_service().await;
        let mut post = tagged_post(&pool, &service, 1, "a, b").await;
        let before = tagging_id(&pool, "a", 1).await;

        assert!(service.persist(&mut post).await.unwrap().is_none());

        service.set_tags(&mut post, "b, a").unwrap();
        let outcome = service.persist(&mut post).await.unwrap().unwrap();

        assert_eq!(outcome, PersistOutcome::default());
        assert_eq!(tagging_id(&pool, "a", 1).await, before);
    }

    #[tokio::test]
    async fn test_persist_empty_list_unlinks_everything() {
        let (pool, service) = setup_test_service().await;
        let mut post = tagged_post(&pool, &service, 1, "a, b").await;

        service.set_tags(&mut post, "").unwrap();
        let outcome = service.persist(&mut post).await.unwrap().unwrap();

        assert_eq!(outcome.removed, vec!["a", "b"]);
        assert!(service.current_tags(&post).await.unwrap().is_empty());
        assert_eq!(cached_column(&pool, 1).await.as_deref(), Some(""));
    }

    #[tokio::test]
    async fn test_persist_reuses_tags_ignoring_case() {
        let (pool, service) = setup_test_service().await;
        tagged_post(&pool, &service, 1, "Ruby").await;
        tagged_post(&pool, &service, 2, "ruby").await;

        assert_eq!(tag_rows(&pool).await, vec!["Ruby"]);
        assert_eq!(
            service.tagged_with("Post", "RUBY", MatchMode::Any).await.unwrap(),
            ids(&[1, 2])
        );
    }

    #[tokio::test]
    async fn test_persist_case_change_relinks_same_tag() {
        let (pool, service) = setup_test_service().await;
        let mut post = tagged_post(&pool, &service, 1, "rails").await;
        let old_link = tagging_id(&pool, "rails", 1).await.unwrap();

        service.set_tags(&mut post, "Rails").unwrap();
        let outcome = service.persist(&mut post).await.unwrap().unwrap();

        assert_eq!(outcome.added, vec!["Rails"]);
        assert_eq!(outcome.removed, vec!["rails"]);
        assert_eq!(tag_rows(&pool).await, vec!["rails"]);
        let new_link = tagging_id(&pool, "rails", 1).await.unwrap();
        assert_ne!(new_link, old_link);
        assert_eq!(cached_column(&pool, 1).await.as_deref(), Some("Rails"));
    }

    #[tokio::test]
    async fn test_persist_folds_names_equal_ignoring_case() {
        let (pool, service) = setup_test_service().await;
        create_row(&pool, "posts", 1).await;
        let mut post = service.load("Post", 1).await.unwrap();

        service.set_tags(&mut post, "a, A, b, B").unwrap();
        service.prepare(&mut post).unwrap();
        assert_eq!(post.staged_cache(), Some("a, b"));

        let outcome = service.persist(&mut post).await.unwrap().unwrap();

        assert_eq!(outcome.added, vec!["a", "b"]);
        assert_eq!(cached_column(&pool, 1).await.as_deref(), Some("a, b"));
        let from_cache = service.current_tags(&post).await.unwrap();
        let from_links = service.current_tags(&service.entity("Post", 1).unwrap()).await.unwrap();
        assert_eq!(from_cache, from_links);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_persists_on_file_database() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = DatabaseConfig {
            url: temp_dir.path().join("tags.db").to_string_lossy().to_string(),
            ..DatabaseConfig::default()
        };
        let pool = create_pool(&config).await.expect("Failed to create file pool");
        let (pool, service) = setup_on(pool, tagging_config()).await;
        let service = Arc::new(service);
        for id in 1..=8 {
            create_row(&pool, "posts", id).await;
        }

        for round in 0..10 {
            let mut handles = Vec::new();
            for id in 1..=8 {
                let service = service.clone();
                handles.push(tokio::spawn(async move {
                    let mut post = service.load("Post", id).await?;
                    service.set_tags(&mut post, format!("shared, fresh{}", round))?;
                    service.persist(&mut post).await
                }));
            }
            for handle in handles {
                handle.await.unwrap().expect("Concurrent persist should succeed");
            }
        }

        assert_eq!(
            service.tagged_with("Post", "shared, fresh9", MatchMode::All).await.unwrap(),
            (1..=8).collect::<Vec<i64>>()
        );
        let counts = service
            .tag_counts_for_type("Post", &CountFilter::new(), &EntityScope::all())
            .await
            .unwrap();
        assert_eq!(counts.get("shared"), Some(8));
        assert_eq!(counts.get("fresh9"), Some(8));
        pool.close().await;
    }

    #[tokio::test]
    async fn test_persist_missing_entity_keeps_pending() {
        let (pool, service) = setup_test_service().await;
        let mut ghost = service.entity("Post", 99).unwrap();
        service.set_tags(&mut ghost, "a, b").unwrap();

        let err = service.persist(&mut ghost).await.unwrap_err();

        assert!(matches!(err, TaggableError::EntityNotFound(ref r) if r.taggable_id == 99));
        assert_eq!(ghost.state(), TagState::CacheStaged);
        assert_eq!(ghost.pending(), Some(&TagList::from_names(["a", "b"])));
        assert_eq!(ghost.staged_cache(), Some("a, b"));
        assert!(tag_rows(&pool).await.is_empty());

        // Retry succeeds once the row exists
        create_row(&pool, "posts", 99).await;
        assert!(service.persist(&mut ghost).await.unwrap().is_some());
        assert_eq!(ghost.state(), TagState::Clean);
    }

    #[tokio::test]
    async fn test_persist_uncached_type() {
        let (pool, service) = setup_test_service().await;
        create_row(&pool, "photos", 1).await;
        let mut photo = service.load("Photo", 1).await.unwrap();

        service.set_tags(&mut photo, vec!["sunset", "beach"]).unwrap();
        service.prepare(&mut photo).unwrap();
        assert_eq!(photo.state(), TagState::CacheStaged);
        assert!(photo.staged_cache().is_none());

        service.persist(&mut photo).await.unwrap();
        let reloaded = service.load("Photo", 1).await.unwrap();
        assert_eq!(
            service.current_tags(&reloaded).await.unwrap(),
            TagList::from_names(["sunset", "beach"])
        );
    }

    #[tokio::test]
    async fn test_destroy_unused() {
        let config = TaggingConfig {
            destroy_unused: true,
            ..tagging_config()
        };
        let (pool, service) = setup_with(config).await;
        let mut first = tagged_post(&pool, &service, 1, "shared, solo").await;
        tagged_post(&pool, &service, 2, "shared").await;

        service.set_tags(&mut first, "fresh").unwrap();
        let outcome = service.persist(&mut first).await.unwrap().unwrap();

        assert_eq!(outcome.destroyed, 1);
        assert_eq!(tag_rows(&pool).await, vec!["fresh", "shared"]);
    }

    // ========================================================================
    // Tag list access
    // ========================================================================

    #[tokio::test]
    async fn test_current_tags_sources() {
        let (pool, service) = setup_test_service().await;
        tagged_post(&pool, &service, 1, "b, a").await;

        // Loaded post reads the cache column
        let mut post = service.load("Post", 1).await.unwrap();
        assert_eq!(post.cached_tag_list(), Some("b, a"));
        assert_eq!(service.current_tags(&post).await.unwrap().names(), &["b", "a"]);

        // A handle without cache falls back to links
        let handle = service.entity("Post", 1).unwrap();
        assert_eq!(service.current_tags(&handle).await.unwrap().names(), &["b", "a"]);

        // Pending list wins
        service.set_tags(&mut post, "c").unwrap();
        assert_eq!(service.current_tags(&post).await.unwrap().names(), &["c"]);
    }

    #[tokio::test]
    async fn test_set_tags_inputs() {
        let (pool, service) = setup_test_service().await;
        create_row(&pool, "posts", 1).await;
        let mut post = service.load("Post", 1).await.unwrap();

        service.set_tags(&mut post, r#"one, "two, three""#).unwrap();
        assert_eq!(post.pending().unwrap().names(), &["one", "two, three"]);

        service.set_tags(&mut post, &["x", " y ", ""][..]).unwrap();
        assert_eq!(post.pending().unwrap().names(), &["x", "y"]);

        service
            .set_tags(&mut post, vec!["p".to_string(), "q".to_string()])
            .unwrap();
        assert_eq!(post.pending().unwrap().names(), &["p", "q"]);

        let tag = Tag::new("solo".to_string());
        service.set_tags(&mut post, &tag).unwrap();
        assert_eq!(post.pending().unwrap().names(), &["solo"]);

        service.persist(&mut post).await.unwrap();
        assert_eq!(cached_column(&pool, 1).await.as_deref(), Some("solo"));
    }

    #[tokio::test]
    async fn test_set_tags_errors() {
        let (_pool, service) = setup_test_service().await;
        let mut post = service.entity("Post", 1).unwrap();

        let err = service.set_tags(&mut post, r#"ok, "broken"#).unwrap_err();
        assert!(matches!(err, TaggableError::Parse(_)));
        assert_eq!(post.state(), TagState::Clean);

        assert!(matches!(
            service.entity("Video", 1),
            Err(TaggableError::UnknownType(_))
        ));
        assert!(matches!(
            service.load("Post", 404).await,
            Err(TaggableError::EntityNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_add_and_remove_tags() {
        let (pool, service) = setup_test_service().await;
        let mut post = tagged_post(&pool, &service, 1, "a, b").await;

        service.add_tags(&mut post, "b, c").await.unwrap();
        assert_eq!(post.pending().unwrap().names(), &["a", "b", "c"]);

        service.remove_tags(&mut post, vec!["a"]).await.unwrap();
        assert_eq!(post.pending().unwrap().names(), &["b", "c"]);

        let outcome = service.persist(&mut post).await.unwrap().unwrap();
        assert_eq!(outcome.added, vec!["c"]);
        assert_eq!(outcome.removed, vec!["a"]);
    }

    #[tokio::test]
    async fn test_reload_discards_pending() {
        let (pool, service) = setup_test_service().await;
        let mut post = tagged_post(&pool, &service, 1, "kept").await;
        service.set_tags(&mut post, "dropped").unwrap();

        service.reload(&mut post).await.unwrap();

        assert_eq!(post.state(), TagState::Clean);
        assert!(post.pending().is_none());
        assert_eq!(service.current_tags(&post).await.unwrap().names(), &["kept"]);
    }

    #[tokio::test]
    async fn test_remove_all() {
        let (pool, service) = setup_test_service().await;
        let mut post = tagged_post(&pool, &service, 1, "a, b").await;
        tagged_post(&pool, &service, 2, "a").await;

        assert_eq!(service.remove_all(&mut post).await.unwrap(), 2);

        assert_eq!(service.tagged_with("Post", "a, b", MatchMode::Any).await.unwrap(), ids(&[2]));
    }

    // ========================================================================
    // Queries
    // ========================================================================

    #[tokio::test]
    async fn test_tagged_with_modes() {
        let (pool, service) = setup_test_service().await;
        tagged_post(&pool, &service, 1, "a, b").await;
        tagged_post(&pool, &service, 2, "a").await;
        tagged_post(&pool, &service, 3, "b, c").await;
        create_row(&pool, "posts", 4).await;
        // Same tag on another type is never matched
        create_row(&pool, "photos", 1).await;
        let mut photo = service.load("Photo", 1).await.unwrap();
        service.set_tags(&mut photo, "a").unwrap();
        service.persist(&mut photo).await.unwrap();

        assert_eq!(service.tagged_with("Post", "a, b", MatchMode::Any).await.unwrap(), ids(&[1, 2, 3]));
        assert_eq!(service.tagged_with("Post", "a, b", MatchMode::All).await.unwrap(), ids(&[1]));
        assert_eq!(service.tagged_with("Post", "a, b", MatchMode::None).await.unwrap(), ids(&[4]));
        assert_eq!(service.tagged_with("Photo", "a", MatchMode::Any).await.unwrap(), ids(&[1]));
    }

    #[tokio::test]
    async fn test_tagged_with_empty_names() {
        let (pool, service) = setup_test_service().await;
        tagged_post(&pool, &service, 1, "a").await;
        create_row(&pool, "posts", 2).await;

        assert!(service.tagged_with("Post", "", MatchMode::Any).await.unwrap().is_empty());
        assert!(service.tagged_with("Post", "", MatchMode::All).await.unwrap().is_empty());
        assert_eq!(service.tagged_with("Post", "", MatchMode::None).await.unwrap(), ids(&[1, 2]));
        assert!(service.tagged_with("Post", "missing", MatchMode::All).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tagged_with_scoped() {
        let (pool, service) = setup_test_service().await;
        tagged_post(&pool, &service, 1, "a").await;
        tagged_post(&pool, &service, 2, "a").await;
        sqlx::query("UPDATE posts SET published = 0 WHERE id = 2")
            .execute(pool.as_sqlite().unwrap())
            .await
            .unwrap();

        let published = EntityScope::all().eq("published", 1);
        assert_eq!(
            service
                .tagged_with_scoped("Post", "a", MatchMode::Any, &published)
                .await
                .unwrap(),
            ids(&[1])
        );

        let bad = EntityScope::all().eq("published = 1 OR 1", 1);
        assert!(matches!(
            service.tagged_with_scoped("Post", "a", MatchMode::Any, &bad).await,
            Err(TaggableError::InvalidIdentifier(_))
        ));
    }

    #[tokio::test]
    async fn test_related_tags() {
        let (pool, service) = setup_test_service().await;
        tagged_post(&pool, &service, 1, "ruby, rails").await;
        tagged_post(&pool, &service, 2, "ruby, rails, gems").await;
        tagged_post(&pool, &service, 3, "python, django").await;

        let related = service.related_tags("Post", vec!["ruby"]).await.unwrap();

        assert_eq!(related.names(), vec!["rails", "gems"]);
        assert_eq!(related.get("rails"), Some(2));
        assert_eq!(related.get("gems"), Some(1));
        assert!(service.related_tags("Post", "").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tag_counts_for_type() {
        let (pool, service) = setup_test_service().await;
        tagged_post(&pool, &service, 1, "x, y").await;
        tagged_post(&pool, &service, 2, "x").await;
        tagged_post(&pool, &service, 3, "x").await;
        create_row(&pool, "photos", 1).await;
        let mut photo = service.load("Photo", 1).await.unwrap();
        service.set_tags(&mut photo, "y").unwrap();
        service.persist(&mut photo).await.unwrap();

        let counts = service
            .tag_counts_for_type("Post", &CountFilter::new().at_least(2), &EntityScope::all())
            .await
            .unwrap();
        assert_eq!(counts.to_map().into_iter().collect::<Vec<_>>(), vec![("x".to_string(), 3)]);

        let all = service
            .tag_counts_for_type("Post", &CountFilter::new(), &EntityScope::all())
            .await
            .unwrap();
        assert_eq!(all.get("y"), Some(1));

        let scoped = service
            .tag_counts_for_type("Post", &CountFilter::new(), &EntityScope::all().le("id", 1))
            .await
            .unwrap();
        assert_eq!(scoped.get("x"), Some(1));
    }

    #[tokio::test]
    async fn test_tag_counts_for_entity() {
        let (pool, service) = setup_test_service().await;
        let post = tagged_post(&pool, &service, 1, "ruby").await;
        tagged_post(&pool, &service, 2, "ruby, rails").await;
        tagged_post(&pool, &service, 3, "python").await;
        create_row(&pool, "posts", 4).await;

        let counts = service
            .tag_counts_for_entity(&post, &CountFilter::new())
            .await
            .unwrap();
        assert_eq!(counts.names(), vec!["ruby", "rails"]);
        assert_eq!(counts.get("ruby"), Some(2));

        let untagged = service.load("Post", 4).await.unwrap();
        assert!(service
            .tag_counts_for_entity(&untagged, &CountFilter::new())
            .await
            .unwrap()
            .is_empty());
    }

    // ========================================================================
    // Property-Based Tests
    // ========================================================================

    use proptest::prelude::*;
    use std::collections::BTreeSet;

    const NAMES: [&str; 4] = ["a", "b", "c", "d"];

    fn pick(mask: u8) -> Vec<&'static str> {
        NAMES
            .iter()
            .enumerate()
            .filter(|(i, _)| mask & (1 << i) != 0)
            .map(|(_, name)| *name)
            .collect()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        /// ANY is the union of per-name matches, ALL their intersection and
        /// NONE the complement of ANY.
        #[test]
        fn property_match_modes_are_set_algebra(
            assignments in proptest::collection::vec(0u8..16, 1..6),
            query_mask in 1u8..16
        ) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            let result: Result<(), TestCaseError> = rt.block_on(async {
                let (pool, service) = setup_test_service().await;
                for (index, mask) in assignments.iter().enumerate() {
                    let id = index as i64 + 1;
                    create_row(&pool, "posts", id).await;
                    let mut post = service.load("Post", id).await.unwrap();
                    service.set_tags(&mut post, pick(*mask)).unwrap();
                    service.persist(&mut post).await.unwrap();
                }

                let query = pick(query_mask);
                let all_ids: BTreeSet<i64> = (1..=assignments.len() as i64).collect();
                let mut per_name = Vec::new();
                for name in &query {
                    let found: BTreeSet<i64> = service
                        .tagged_with("Post", *name, MatchMode::Any)
                        .await
                        .unwrap()
                        .into_iter()
                        .collect();
                    per_name.push(found);
                }

                let union: BTreeSet<i64> = per_name.iter().flatten().copied().collect();
                let intersection: BTreeSet<i64> = all_ids
                    .iter()
                    .copied()
                    .filter(|id| per_name.iter().all(|set| set.contains(id)))
                    .collect();
                let complement: BTreeSet<i64> = all_ids.difference(&union).copied().collect();

                let any: BTreeSet<i64> = service
                    .tagged_with("Post", query.clone(), MatchMode::Any)
                    .await
                    .unwrap()
                    .into_iter()
                    .collect();
                let all: BTreeSet<i64> = service
                    .tagged_with("Post", query.clone(), MatchMode::All)
                    .await
                    .unwrap()
                    .into_iter()
                    .collect();
                let none: BTreeSet<i64> = service
                    .tagged_with("Post", query.clone(), MatchMode::None)
                    .await
                    .unwrap()
                    .into_iter()
                    .collect();

                prop_assert_eq!(any, union);
                prop_assert_eq!(all, intersection);
                prop_assert_eq!(none, complement);
                Ok(())
            });
            result?;
        }
    }
}
