//! Tagging model
//!
//! Link rows between entities and tags, plus the filter types used by
//! tag queries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Association between one taggable entity and one tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tagging {
    /// Unique identifier
    pub id: i64,
    /// Linked tag
    pub tag_id: i64,
    /// Entity type name
    pub taggable_type: String,
    /// Entity primary key
    pub taggable_id: i64,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

/// Identity of a taggable entity: its type name and primary key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaggableRef {
    /// Type name stored in `taggings.taggable_type`
    pub taggable_type: String,
    /// Entity primary key
    pub taggable_id: i64,
}

impl TaggableRef {
    pub fn new(taggable_type: impl Into<String>, taggable_id: i64) -> Self {
        Self {
            taggable_type: taggable_type.into(),
            taggable_id,
        }
    }
}

impl fmt::Display for TaggableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.taggable_type, self.taggable_id)
    }
}

/// How a tag set is matched against an entity's tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    /// At least one of the names
    #[default]
    Any,
    /// Every one of the names
    All,
    /// None of the names
    None,
}

/// Optional restrictions for tag counting, combined with AND
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountFilter {
    /// Only tags created at or after this time
    #[serde(default)]
    pub start_at: Option<DateTime<Utc>>,
    /// Only tags created at or before this time
    #[serde(default)]
    pub end_at: Option<DateTime<Utc>>,
    /// Drop tags counted fewer times than this
    #[serde(default)]
    pub at_least: Option<i64>,
    /// Drop tags counted more times than this
    #[serde(default)]
    pub at_most: Option<i64>,
}

impl CountFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_at(mut self, at: DateTime<Utc>) -> Self {
        self.start_at = Some(at);
        self
    }

    pub fn end_at(mut self, at: DateTime<Utc>) -> Self {
        self.end_at = Some(at);
        self
    }

    pub fn at_least(mut self, count: i64) -> Self {
        self.at_least = Some(count);
        self
    }

    pub fn at_most(mut self, count: i64) -> Self {
        self.at_most = Some(count);
        self
    }
}

/// Comparison used by an entity scope predicate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl ScopeOp {
    pub fn as_sql(&self) -> &'static str {
        match self {
            ScopeOp::Eq => "=",
            ScopeOp::Ne => "<>",
            ScopeOp::Lt => "<",
            ScopeOp::Le => "<=",
            ScopeOp::Gt => ">",
            ScopeOp::Ge => ">=",
        }
    }
}

/// Value compared against an entity column
#[derive(Debug, Clone, PartialEq)]
pub enum ScopeValue {
    Int(i64),
    Float(f64),
    Text(String),
    Bool(bool),
    Timestamp(DateTime<Utc>),
}

impl From<i64> for ScopeValue {
    fn from(value: i64) -> Self {
        ScopeValue::Int(value)
    }
}

impl From<i32> for ScopeValue {
    fn from(value: i32) -> Self {
        ScopeValue::Int(value as i64)
    }
}

impl From<f64> for ScopeValue {
    fn from(value: f64) -> Self {
        ScopeValue::Float(value)
    }
}

impl From<bool> for ScopeValue {
    fn from(value: bool) -> Self {
        ScopeValue::Bool(value)
    }
}

impl From<&str> for ScopeValue {
    fn from(value: &str) -> Self {
        ScopeValue::Text(value.to_string())
    }
}

impl From<String> for ScopeValue {
    fn from(value: String) -> Self {
        ScopeValue::Text(value)
    }
}

impl From<DateTime<Utc>> for ScopeValue {
    fn from(value: DateTime<Utc>) -> Self {
        ScopeValue::Timestamp(value)
    }
}

/// One `column op value` condition on the entity table
#[derive(Debug, Clone, PartialEq)]
pub struct ScopePredicate {
    pub column: String,
    pub op: ScopeOp,
    pub value: ScopeValue,
}

/// Extra conditions on the entity table, combined with AND
///
/// Column names are validated as plain identifiers when a query is built.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityScope {
    predicates: Vec<ScopePredicate>,
}

impl EntityScope {
    /// Scope matching every entity
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: &str, op: ScopeOp, value: impl Into<ScopeValue>) -> Self {
        self.predicates.push(ScopePredicate {
            column: column.to_string(),
            op,
            value: value.into(),
        });
        self
    }

    pub fn eq(self, column: &str, value: impl Into<ScopeValue>) -> Self {
        self.with(column, ScopeOp::Eq, value)
    }

    pub fn ne(self, column: &str, value: impl Into<ScopeValue>) -> Self {
        self.with(column, ScopeOp::Ne, value)
    }

    pub fn lt(self, column: &str, value: impl Into<ScopeValue>) -> Self {
        self.with(column, ScopeOp::Lt, value)
    }

    pub fn le(self, column: &str, value: impl Into<ScopeValue>) -> Self {
        self.with(column, ScopeOp::Le, value)
    }

    pub fn gt(self, column: &str, value: impl Into<ScopeValue>) -> Self {
        self.with(column, ScopeOp::Gt, value)
    }

    pub fn ge(self, column: &str, value: impl Into<ScopeValue>) -> Self {
        self.with(column, ScopeOp::Ge, value)
    }

    pub fn predicates(&self) -> &[ScopePredicate] {
        &self.predicates
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }
}
