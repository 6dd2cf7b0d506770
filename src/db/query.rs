//! Tag query construction
//!
//! Builds SQL text together with its ordered bind values for every statement
//! whose shape depends on the caller: entity tables chosen at registration,
//! a variable number of tag names, optional count filters and entity scopes.
//! The output uses `?` placeholders, which both SQLite and MySQL accept, and
//! backtick-quoted identifiers, which SQLite accepts for MySQL compatibility.
//!
//! Table aliases used throughout:
//! - `ent`: the entity table
//! - `tg` / `t`: the taggings and tags joined for the main query
//! - `tg_N` / `t_N`: the join pair for the N-th required name (ALL matching)
//! - `tg_any` / `t_any`: the "tagged with any" subquery

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use sqlx::mysql::{MySql, MySqlArguments};
use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments};

use crate::models::{CountFilter, EntityScope, MatchMode, ScopeValue, TaggableModel};

static IDENTIFIER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,63}$").expect("identifier pattern is valid")
});

/// Error raised while building a query
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    /// A table or column name is not a plain SQL identifier
    #[error("Invalid SQL identifier: {0:?}")]
    InvalidIdentifier(String),
}

/// Check that a table or column name is a plain SQL identifier
pub fn validate_identifier(name: &str) -> Result<(), QueryError> {
    if IDENTIFIER.is_match(name) {
        Ok(())
    } else {
        Err(QueryError::InvalidIdentifier(name.to_string()))
    }
}

/// Validate and backtick-quote an identifier
pub fn quote_identifier(name: &str) -> Result<String, QueryError> {
    validate_identifier(name)?;
    Ok(format!("`{}`", name))
}

/// A value bound to a `?` placeholder
#[derive(Debug, Clone, PartialEq)]
pub enum BindValue {
    Int(i64),
    Float(f64),
    Text(String),
    Bool(bool),
    Timestamp(DateTime<Utc>),
}

impl From<i64> for BindValue {
    fn from(value: i64) -> Self {
        BindValue::Int(value)
    }
}

impl From<&str> for BindValue {
    fn from(value: &str) -> Self {
        BindValue::Text(value.to_string())
    }
}

impl From<&String> for BindValue {
    fn from(value: &String) -> Self {
        BindValue::Text(value.clone())
    }
}

impl From<DateTime<Utc>> for BindValue {
    fn from(value: DateTime<Utc>) -> Self {
        BindValue::Timestamp(value)
    }
}

impl From<&ScopeValue> for BindValue {
    fn from(value: &ScopeValue) -> Self {
        match value {
            ScopeValue::Int(v) => BindValue::Int(*v),
            ScopeValue::Float(v) => BindValue::Float(*v),
            ScopeValue::Text(v) => BindValue::Text(v.clone()),
            ScopeValue::Bool(v) => BindValue::Bool(*v),
            ScopeValue::Timestamp(v) => BindValue::Timestamp(*v),
        }
    }
}

/// SQL text plus bind values, in placeholder order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqlQuery {
    sql: String,
    binds: Vec<BindValue>,
}

impl SqlQuery {
    pub fn new(sql: &str) -> Self {
        Self {
            sql: sql.to_string(),
            binds: Vec::new(),
        }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn binds(&self) -> &[BindValue] {
        &self.binds
    }

    /// Append raw SQL
    pub fn push(&mut self, sql: &str) -> &mut Self {
        self.sql.push_str(sql);
        self
    }

    /// Append one placeholder and its value
    pub fn push_bind(&mut self, value: impl Into<BindValue>) -> &mut Self {
        self.sql.push('?');
        self.binds.push(value.into());
        self
    }

    /// Append a parenthesized placeholder list; an empty list becomes `(NULL)`
    pub fn push_bind_list<I, V>(&mut self, values: I) -> &mut Self
    where
        I: IntoIterator<Item = V>,
        V: Into<BindValue>,
    {
        self.sql.push('(');
        let mut first = true;
        for value in values {
            if !first {
                self.sql.push_str(", ");
            }
            first = false;
            self.push_bind(value);
        }
        if first {
            self.sql.push_str("NULL");
        }
        self.sql.push(')');
        self
    }

    /// Append `WHERE` for the first condition and `AND` after that
    fn push_condition(&mut self, started: &mut bool) -> &mut Self {
        self.sql.push_str(if *started { " AND " } else { " WHERE " });
        *started = true;
        self
    }

    /// Bind onto an SQLite query
    pub fn to_sqlite(&self) -> Query<'_, Sqlite, SqliteArguments<'_>> {
        let mut query = sqlx::query(&self.sql);
        for value in &self.binds {
            query = match value {
                BindValue::Int(v) => query.bind(*v),
                BindValue::Float(v) => query.bind(*v),
                BindValue::Text(v) => query.bind(v.as_str()),
                BindValue::Bool(v) => query.bind(*v),
                BindValue::Timestamp(v) => query.bind(*v),
            };
        }
        query
    }

    /// Bind onto a MySQL query
    pub fn to_mysql(&self) -> Query<'_, MySql, MySqlArguments> {
        let mut query = sqlx::query(&self.sql);
        for value in &self.binds {
            query = match value {
                BindValue::Int(v) => query.bind(*v),
                BindValue::Float(v) => query.bind(*v),
                BindValue::Text(v) => query.bind(v.as_str()),
                BindValue::Bool(v) => query.bind(*v),
                BindValue::Timestamp(v) => query.bind(*v),
            };
        }
        query
    }
}

/// Quoted table and primary key of a taggable model
struct EntityTable {
    table: String,
    pk: String,
}

impl EntityTable {
    fn of(model: &TaggableModel) -> Result<Self, QueryError> {
        Ok(Self {
            table: quote_identifier(&model.table)?,
            pk: quote_identifier(&model.primary_key)?,
        })
    }
}

/// Restricts tag counting to a taggable type, entity predicates and/or
/// entities tagged with any of a set of names
#[derive(Debug, Clone, Copy)]
pub struct CountScope<'a> {
    pub model: Option<&'a TaggableModel>,
    pub entity_scope: Option<&'a EntityScope>,
    pub tagged_with_any: Option<&'a [String]>,
}

impl<'a> CountScope<'a> {
    /// Count across every type
    pub fn global() -> Self {
        Self {
            model: None,
            entity_scope: None,
            tagged_with_any: None,
        }
    }

    /// Count taggings of one type
    pub fn for_model(model: &'a TaggableModel) -> Self {
        Self {
            model: Some(model),
            ..Self::global()
        }
    }

    pub fn with_entity_scope(mut self, scope: &'a EntityScope) -> Self {
        self.entity_scope = Some(scope);
        self
    }

    pub fn tagged_with_any(mut self, names: &'a [String]) -> Self {
        self.tagged_with_any = Some(names);
        self
    }
}

fn push_scope_predicates(
    query: &mut SqlQuery,
    scope: &EntityScope,
    started: &mut bool,
) -> Result<(), QueryError> {
    for predicate in scope.predicates() {
        let column = quote_identifier(&predicate.column)?;
        query
            .push_condition(started)
            .push(&format!("ent.{} {} ", column, predicate.op.as_sql()))
            .push_bind(&predicate.value);
    }
    Ok(())
}

/// `SELECT tg_any.taggable_id ...` for entities of `type_name` tagged with any of `names`
fn push_any_subquery(query: &mut SqlQuery, type_name: &str, names: &[String]) {
    query
        .push(
            "SELECT tg_any.taggable_id FROM taggings tg_any \
             INNER JOIN tags t_any ON t_any.id = tg_any.tag_id \
             WHERE tg_any.taggable_type = ",
        )
        .push_bind(type_name)
        .push(" AND t_any.name IN ")
        .push_bind_list(names);
}

/// Entity ids of `model` matching `names` under `mode`, ascending.
///
/// Returns `None` when the answer is empty without asking the database
/// (ANY or ALL with no names).
pub fn tagged_with(
    model: &TaggableModel,
    names: &[String],
    mode: MatchMode,
    scope: &EntityScope,
) -> Result<Option<SqlQuery>, QueryError> {
    if names.is_empty() && mode != MatchMode::None {
        return Ok(None);
    }

    let entity = EntityTable::of(model)?;
    let mut query = SqlQuery::default();
    let mut started = false;

    match mode {
        MatchMode::Any => {
            query
                .push(&format!(
                    "SELECT DISTINCT ent.{pk} AS taggable_id FROM {table} ent \
                     INNER JOIN taggings tg ON tg.taggable_id = ent.{pk} AND tg.taggable_type = ",
                    pk = entity.pk,
                    table = entity.table
                ))
                .push_bind(&model.name)
                .push(" INNER JOIN tags t ON t.id = tg.tag_id");
            query
                .push_condition(&mut started)
                .push("t.name IN ")
                .push_bind_list(names);
        }
        MatchMode::All => {
            query.push(&format!(
                "SELECT DISTINCT ent.{pk} AS taggable_id FROM {table} ent",
                pk = entity.pk,
                table = entity.table
            ));
            for (index, name) in names.iter().enumerate() {
                query
                    .push(&format!(
                        " INNER JOIN taggings tg_{i} ON tg_{i}.taggable_id = ent.{pk} \
                         AND tg_{i}.taggable_type = ",
                        i = index,
                        pk = entity.pk
                    ))
                    .push_bind(&model.name)
                    .push(&format!(
                        " INNER JOIN tags t_{i} ON t_{i}.id = tg_{i}.tag_id AND t_{i}.name = ",
                        i = index
                    ))
                    .push_bind(name);
            }
        }
        MatchMode::None => {
            query.push(&format!(
                "SELECT ent.{pk} AS taggable_id FROM {table} ent",
                pk = entity.pk,
                table = entity.table
            ));
            if !names.is_empty() {
                query
                    .push_condition(&mut started)
                    .push(&format!("ent.{} NOT IN (", entity.pk));
                push_any_subquery(&mut query, &model.name, names);
                query.push(")");
            }
        }
    }

    push_scope_predicates(&mut query, scope, &mut started)?;
    query.push(" ORDER BY taggable_id");

    Ok(Some(query))
}

/// Tag frequencies as `(name, count_all)` rows, most used first
pub fn tag_counts(filter: &CountFilter, scope: &CountScope<'_>) -> Result<SqlQuery, QueryError> {
    let mut query = SqlQuery::new(
        "SELECT t.name AS name, COUNT(t.id) AS count_all FROM tags t \
         INNER JOIN taggings tg ON tg.tag_id = t.id",
    );
    let mut started = false;

    let entity_scope = scope.entity_scope.filter(|s| !s.is_empty());

    if let Some(model) = scope.model {
        query.push(" AND tg.taggable_type = ").push_bind(&model.name);
        if entity_scope.is_some() {
            let entity = EntityTable::of(model)?;
            query.push(&format!(
                " INNER JOIN {table} ent ON ent.{pk} = tg.taggable_id",
                table = entity.table,
                pk = entity.pk
            ));
        }
    }

    if let Some(start_at) = filter.start_at {
        query
            .push_condition(&mut started)
            .push("t.created_at >= ")
            .push_bind(start_at);
    }
    if let Some(end_at) = filter.end_at {
        query
            .push_condition(&mut started)
            .push("t.created_at <= ")
            .push_bind(end_at);
    }

    if let (Some(_), Some(entity_scope)) = (scope.model, entity_scope) {
        push_scope_predicates(&mut query, entity_scope, &mut started)?;
    }

    if let (Some(model), Some(names)) = (scope.model, scope.tagged_with_any) {
        query
            .push_condition(&mut started)
            .push("tg.taggable_id IN (");
        push_any_subquery(&mut query, &model.name, names);
        query.push(")");
    }

    query.push(" GROUP BY t.id, t.name");

    match (filter.at_least, filter.at_most) {
        (Some(at_least), Some(at_most)) => {
            query
                .push(" HAVING COUNT(t.id) >= ")
                .push_bind(at_least)
                .push(" AND COUNT(t.id) <= ")
                .push_bind(at_most);
        }
        (Some(at_least), None) => {
            query.push(" HAVING COUNT(t.id) >= ").push_bind(at_least);
        }
        (None, Some(at_most)) => {
            query.push(" HAVING COUNT(t.id) <= ").push_bind(at_most);
        }
        (None, None) => {}
    }

    query.push(" ORDER BY count_all DESC, t.name ASC");
    Ok(query)
}

/// Tags co-occurring with `names` on entities of `model`, excluding `names`
///
/// Returns `None` for an empty name set.
pub fn related_tags(
    model: &TaggableModel,
    names: &[String],
    scope: &EntityScope,
) -> Result<Option<SqlQuery>, QueryError> {
    if names.is_empty() {
        return Ok(None);
    }

    let mut query = SqlQuery::new(
        "SELECT t.name AS name, COUNT(t.id) AS count_all FROM tags t \
         INNER JOIN taggings tg ON tg.tag_id = t.id AND tg.taggable_type = ",
    );
    query.push_bind(&model.name);

    if !scope.is_empty() {
        let entity = EntityTable::of(model)?;
        query.push(&format!(
            " INNER JOIN {table} ent ON ent.{pk} = tg.taggable_id",
            table = entity.table,
            pk = entity.pk
        ));
    }

    let mut started = false;
    query.push_condition(&mut started).push("tg.taggable_id IN (");
    push_any_subquery(&mut query, &model.name, names);
    query.push(")");

    query
        .push_condition(&mut started)
        .push("t.name NOT IN ")
        .push_bind_list(names);

    push_scope_predicates(&mut query, scope, &mut started)?;

    query.push(" GROUP BY t.id, t.name ORDER BY count_all DESC, t.name ASC");
    Ok(Some(query))
}

/// `DELETE` the links between one entity and the given tags
pub fn delete_taggings(type_name: &str, taggable_id: i64, tag_ids: &[i64]) -> SqlQuery {
    let mut query = SqlQuery::new("DELETE FROM taggings WHERE taggable_type = ");
    query
        .push_bind(type_name)
        .push(" AND taggable_id = ")
        .push_bind(taggable_id)
        .push(" AND tag_id IN ")
        .push_bind_list(tag_ids.iter().copied());
    query
}

/// `DELETE` those of the given tags that no tagging references any more
pub fn delete_unused_tags(tag_ids: &[i64]) -> SqlQuery {
    let mut query = SqlQuery::new("DELETE FROM tags WHERE id IN ");
    query
        .push_bind_list(tag_ids.iter().copied())
        .push(" AND NOT EXISTS (SELECT 1 FROM taggings WHERE taggings.tag_id = tags.id)");
    query
}

/// Read one entity's cached tag list column, or just its key when the type
/// does not cache
pub fn select_entity(model: &TaggableModel, taggable_id: i64) -> Result<SqlQuery, QueryError> {
    let entity = EntityTable::of(model)?;
    let selected = match &model.cached_column {
        Some(column) => format!("{} AS cached_tag_list", quote_identifier(column)?),
        None => "NULL AS cached_tag_list".to_string(),
    };
    let mut query = SqlQuery::new(&format!(
        "SELECT {pk} AS taggable_id, {selected} FROM {table} WHERE {pk} = ",
        pk = entity.pk,
        selected = selected,
        table = entity.table
    ));
    query.push_bind(taggable_id);
    Ok(query)
}

/// Write one entity's cached tag list column
///
/// Returns `None` when the type does not cache.
pub fn update_cached_tag_list(
    model: &TaggableModel,
    taggable_id: i64,
    value: &str,
) -> Result<Option<SqlQuery>, QueryError> {
    let column = match &model.cached_column {
        Some(column) => quote_identifier(column)?,
        None => return Ok(None),
    };
    let entity = EntityTable::of(model)?;
    let mut query = SqlQuery::new(&format!("UPDATE {} SET {} = ", entity.table, column));
    query
        .push_bind(value)
        .push(&format!(" WHERE {} = ", entity.pk))
        .push_bind(taggable_id);
    Ok(Some(query))
}
