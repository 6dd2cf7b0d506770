//! Tag model
//!
//! This module defines the Tag entity and tag frequency results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A canonical, uniquely named label shared by every entity that uses it.
///
/// Names are unique ignoring case; `name` keeps the casing used when the tag
/// was first created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tag {
    /// Unique identifier
    pub id: i64,
    /// Tag name
    pub name: String,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl Tag {
    /// Create a new Tag with the given name.
    ///
    /// The ID will be set to 0 and should be assigned by the database.
    pub fn new(name: String) -> Self {
        Self {
            id: 0, // Will be set by the database
            name,
            created_at: Utc::now(),
        }
    }
}

impl PartialEq for Tag {
    fn eq(&self, other: &Self) -> bool {
        (self.id != 0 && self.id == other.id) || self.name == other.name
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Number of taggings counted for one tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagCount {
    /// Tag name
    pub name: String,
    /// Number of qualifying taggings
    pub count: i64,
}

impl TagCount {
    /// Create a new TagCount
    pub fn new(name: String, count: i64) -> Self {
        Self { name, count }
    }
}

/// Tag frequencies, ordered by count descending then name ascending
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagCounts(Vec<TagCount>);

impl TagCounts {
    /// Wrap counts that are already in result order
    pub fn new(counts: Vec<TagCount>) -> Self {
        Self(counts)
    }

    /// Count for a tag name, if the tag qualified
    pub fn get(&self, name: &str) -> Option<i64> {
        self.0.iter().find(|c| c.name == name).map(|c| c.count)
    }

    /// Number of tags
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no tag qualified
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate in result order
    pub fn iter(&self) -> std::slice::Iter<'_, TagCount> {
        self.0.iter()
    }

    /// Tag names in result order
    pub fn names(&self) -> Vec<&str> {
        self.0.iter().map(|c| c.name.as_str()).collect()
    }

    /// Name to count mapping
    pub fn to_map(&self) -> BTreeMap<String, i64> {
        self.0.iter().map(|c| (c.name.clone(), c.count)).collect()
    }

    /// Unwrap into the ordered vector
    pub fn into_vec(self) -> Vec<TagCount> {
        self.0
    }
}

impl IntoIterator for TagCounts {
    type Item = TagCount;
    type IntoIter = std::vec::IntoIter<TagCount>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
