//! Taggable entity model
//!
//! A resolved taggable type, the per-entity tagging state carried between
//! `set_tags` and `persist`, and the link diff computed at persist time.

use serde::{Deserialize, Serialize};

use super::{Tag, TagList, TaggableRef};

/// A taggable type resolved against the live schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaggableModel {
    /// Type name stored in `taggings.taggable_type`
    pub name: String,
    /// Entity table
    pub table: String,
    /// Integer primary key column
    pub primary_key: String,
    /// Cached tag list column, when the table has one
    pub cached_column: Option<String>,
}

impl TaggableModel {
    /// Whether entities of this type keep a cached tag list
    pub fn caches_tag_list(&self) -> bool {
        self.cached_column.is_some()
    }
}

/// Where an entity is in the save cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TagState {
    /// Nothing to write
    #[default]
    Clean,
    /// A desired tag list was set
    Mutated,
    /// The cache string was computed and awaits writing
    CacheStaged,
    /// Cache written, links being reconciled
    LinkWritePending,
}

/// An entity plus its in-memory tagging state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedEntity {
    taggable: TaggableRef,
    cached_tag_list: Option<String>,
    pending: Option<TagList>,
    staged_cache: Option<String>,
    state: TagState,
}

impl TaggedEntity {
    /// An entity whose cached tag list is unknown
    pub fn new(taggable: TaggableRef) -> Self {
        Self::with_cached(taggable, None)
    }

    /// An entity loaded together with its cached tag list value
    pub fn with_cached(taggable: TaggableRef, cached_tag_list: Option<String>) -> Self {
        Self {
            taggable,
            cached_tag_list,
            pending: None,
            staged_cache: None,
            state: TagState::Clean,
        }
    }

    pub fn taggable(&self) -> &TaggableRef {
        &self.taggable
    }

    pub fn taggable_type(&self) -> &str {
        &self.taggable.taggable_type
    }

    pub fn id(&self) -> i64 {
        self.taggable.taggable_id
    }

    /// Last known value of the cached tag list column
    pub fn cached_tag_list(&self) -> Option<&str> {
        self.cached_tag_list.as_deref()
    }

    /// Desired tag list not yet persisted
    pub fn pending(&self) -> Option<&TagList> {
        self.pending.as_ref()
    }

    /// Cache string staged by `prepare`
    pub fn staged_cache(&self) -> Option<&str> {
        self.staged_cache.as_deref()
    }

    pub fn state(&self) -> TagState {
        self.state
    }

    pub fn is_dirty(&self) -> bool {
        self.state != TagState::Clean
    }

    pub(crate) fn set_pending(&mut self, list: TagList) {
        self.pending = Some(list);
        self.staged_cache = None;
        self.state = TagState::Mutated;
    }

    pub(crate) fn stage_cache(&mut self, cache: Option<String>) {
        self.staged_cache = cache;
        self.state = TagState::CacheStaged;
    }

    pub(crate) fn begin_link_write(&mut self) {
        self.state = TagState::LinkWritePending;
    }

    /// Roll back to the staged state after a failed write
    pub(crate) fn abort_link_write(&mut self) {
        self.state = TagState::CacheStaged;
    }

    /// Mark the pending list as written
    pub(crate) fn finish_persist(&mut self) {
        if let Some(cache) = self.staged_cache.take() {
            self.cached_tag_list = Some(cache);
        }
        self.pending = None;
        self.state = TagState::Clean;
    }

    /// Drop pending state and replace the cached value
    pub(crate) fn reset(&mut self, cached_tag_list: Option<String>) {
        self.cached_tag_list = cached_tag_list;
        self.pending = None;
        self.staged_cache = None;
        self.state = TagState::Clean;
    }
}

/// Link changes that bring persisted tags in line with a desired list
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TagDiff {
    /// Names to find-or-create and link, in desired order
    pub to_add: Vec<String>,
    /// Linked tags whose names are no longer desired
    pub to_remove: Vec<Tag>,
}

impl TagDiff {
    /// Compare a desired list with the tags currently linked
    ///
    /// Names compare case-sensitively. A desired `Rails` against a linked
    /// `rails` removes that link and adds `Rails`; the store resolves
    /// `Rails` to the existing `rails` row, so the entity ends up linked to
    /// the same tag under a new tagging id while the cache keeps `Rails`.
    pub fn compute(desired: &TagList, linked: &[Tag]) -> Self {
        let linked_names: TagList = linked.iter().map(|tag| tag.name.as_str()).collect();
        Self {
            to_add: desired.difference(&linked_names),
            to_remove: linked
                .iter()
                .filter(|tag| !desired.contains(&tag.name))
                .cloned()
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

/// What a successful persist changed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistOutcome {
    /// Names newly linked
    pub added: Vec<String>,
    /// Names unlinked
    pub removed: Vec<String>,
    /// Tags deleted because nothing links to them any more
    pub destroyed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(id: i64, name: &str) -> Tag {
        let mut tag = Tag::new(name.to_string());
        tag.id = id;
        tag
    }

    #[test]
    fn test_diff_adds_and_removes() {
        let desired = TagList::parse("rails, rust").unwrap();
        let linked = vec![tag(1, "ruby"), tag(2, "rails")];

        let diff = TagDiff::compute(&desired, &linked);

        assert_eq!(diff.to_add, vec!["rust"]);
        assert_eq!(diff.to_remove.len(), 1);
        assert_eq!(diff.to_remove[0].id, 1);
    }

    #[test]
    fn test_diff_unchanged_is_empty() {
        let desired = TagList::parse("b, a").unwrap();
        let linked = vec![tag(1, "a"), tag(2, "b")];

        assert!(TagDiff::compute(&desired, &linked).is_empty());
    }

    #[test]
    fn test_diff_is_case_sensitive() {
        let desired = TagList::parse("ruby").unwrap();
        let linked = vec![tag(1, "Ruby")];

        let diff = TagDiff::compute(&desired, &linked);

        assert_eq!(diff.to_add, vec!["ruby"]);
        assert_eq!(diff.to_remove[0].name, "Ruby");
    }

    #[test]
    fn test_diff_empty_desired_removes_everything() {
        let linked = vec![tag(1, "a"), tag(2, "b")];

        let diff = TagDiff::compute(&TagList::new(), &linked);

        assert!(diff.to_add.is_empty());
        assert_eq!(diff.to_remove.len(), 2);
    }

    #[test]
    fn test_entity_state_transitions() {
        let mut entity = TaggedEntity::new(TaggableRef::new("Post", 1));
        assert_eq!(entity.state(), TagState::Clean);
        assert!(!entity.is_dirty());

        entity.set_pending(TagList::parse("a").unwrap());
        assert_eq!(entity.state(), TagState::Mutated);

        entity.stage_cache(Some("a".to_string()));
        assert_eq!(entity.state(), TagState::CacheStaged);

        entity.begin_link_write();
        assert_eq!(entity.state(), TagState::LinkWritePending);

        entity.finish_persist();
        assert_eq!(entity.state(), TagState::Clean);
        assert_eq!(entity.cached_tag_list(), Some("a"));
        assert!(entity.pending().is_none());
    }

    #[test]
    fn test_abort_keeps_pending_list() {
        let mut entity = TaggedEntity::new(TaggableRef::new("Post", 1));
        entity.set_pending(TagList::parse("a, b").unwrap());
        entity.stage_cache(None);
        entity.begin_link_write();

        entity.abort_link_write();

        assert_eq!(entity.state(), TagState::CacheStaged);
        assert_eq!(entity.pending().map(TagList::len), Some(2));
    }
}
