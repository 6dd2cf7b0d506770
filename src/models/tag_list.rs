//! Tag list model
//!
//! An ordered, deduplicated list of tag names with a delimited string form.
//!
//! ```text
//! rails, "ruby, the language", 'it''s'
//! ```
//!
//! A token that starts with `"` or `'` runs to the matching closing quote and
//! may contain the delimiter; a doubled quote inside it is a literal quote.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use super::Tag;

/// Error raised while parsing a serialized tag list
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TagListError {
    /// A quoted name was opened but never closed
    #[error("Unterminated {quote} quote starting at position {position}")]
    UnterminatedQuote {
        /// Quote character that opened the name
        quote: char,
        /// Character offset of the opening quote
        position: usize,
    },
}

/// Delimiter settings for parsing and serializing tag lists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagListFormat {
    /// Separator between names
    pub delimiter: char,
}

impl TagListFormat {
    /// Create a format with the given delimiter
    pub fn new(delimiter: char) -> Self {
        Self { delimiter }
    }

    fn separator(&self) -> String {
        if self.delimiter.is_whitespace() {
            self.delimiter.to_string()
        } else {
            format!("{} ", self.delimiter)
        }
    }

    fn needs_quotes(&self, name: &str) -> bool {
        name.contains(self.delimiter) || name.contains('"') || name.starts_with('\'')
    }
}

impl Default for TagListFormat {
    fn default() -> Self {
        Self { delimiter: ',' }
    }
}

/// Ordered list of tag names without duplicates
///
/// Duplicates are detected case-sensitively; blank names are never stored and
/// stored names carry no surrounding whitespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct TagList {
    names: Vec<String>,
}

impl TagList {
    /// Create an empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a comma-delimited list
    pub fn parse(text: &str) -> Result<Self, TagListError> {
        Self::parse_with(text, &TagListFormat::default())
    }

    /// Parse a list using the given delimiter
    pub fn parse_with(text: &str, format: &TagListFormat) -> Result<Self, TagListError> {
        let chars: Vec<char> = text.chars().collect();
        let mut list = Self::new();
        let mut pos = 0;

        while pos < chars.len() {
            while pos < chars.len() && chars[pos].is_whitespace() && chars[pos] != format.delimiter
            {
                pos += 1;
            }
            if pos >= chars.len() {
                break;
            }

            let mut token = String::new();
            let quote = chars[pos];
            if quote == '"' || quote == '\'' {
                let opened_at = pos;
                pos += 1;
                loop {
                    match chars.get(pos) {
                        None => {
                            return Err(TagListError::UnterminatedQuote {
                                quote,
                                position: opened_at,
                            })
                        }
                        Some(&c) if c == quote => {
                            if chars.get(pos + 1) == Some(&quote) {
                                token.push(quote);
                                pos += 2;
                            } else {
                                pos += 1;
                                break;
                            }
                        }
                        Some(&c) => {
                            token.push(c);
                            pos += 1;
                        }
                    }
                }
            }

            while pos < chars.len() && chars[pos] != format.delimiter {
                token.push(chars[pos]);
                pos += 1;
            }
            // skip the delimiter
            pos += 1;

            list.add(&token);
        }

        Ok(list)
    }

    /// Build a list from names taken verbatim (no delimiter parsing)
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut list = Self::new();
        for name in names {
            list.add(name.as_ref());
        }
        list
    }

    /// Append a name unless it is blank or already present
    ///
    /// Returns true when the name was added.
    pub fn add(&mut self, name: &str) -> bool {
        let name = name.trim();
        if name.is_empty() || self.contains(name) {
            return false;
        }
        self.names.push(name.to_string());
        true
    }

    /// Remove the first matching name
    ///
    /// Returns true when a name was removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let name = name.trim();
        match self.names.iter().position(|n| n == name) {
            Some(index) => {
                self.names.remove(index);
                true
            }
            None => false,
        }
    }

    /// Check whether a name is present (case-sensitive)
    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    /// Names present in `self` but not in `other`, in `self`'s order
    pub fn difference(&self, other: &TagList) -> Vec<String> {
        self.names
            .iter()
            .filter(|name| !other.contains(name))
            .cloned()
            .collect()
    }

    /// Whether both lists hold the same names, ignoring order
    pub fn same_names(&self, other: &TagList) -> bool {
        self.len() == other.len() && self.names.iter().all(|name| other.contains(name))
    }

    /// Drop names that repeat an earlier one ignoring case; the first
    /// spelling wins
    pub fn fold_case_duplicates(&self) -> TagList {
        let mut seen = HashSet::new();
        self.names
            .iter()
            .filter(|name| seen.insert(name.to_lowercase()))
            .map(String::as_str)
            .collect()
    }

    /// Number of names
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Whether the list holds no names
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Iterate over names in order
    pub fn iter(&self) -> std::slice::Iter<'_, String> {
        self.names.iter()
    }

    /// Names in order
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Serialize with the default comma delimiter
    pub fn serialize(&self) -> String {
        self.serialize_with(&TagListFormat::default())
    }

    /// Serialize using the given delimiter, quoting names that need it
    pub fn serialize_with(&self, format: &TagListFormat) -> String {
        self.names
            .iter()
            .map(|name| {
                if format.needs_quotes(name) {
                    format!("\"{}\"", name.replace('"', "\"\""))
                } else {
                    name.clone()
                }
            })
            .collect::<Vec<_>>()
            .join(&format.separator())
    }
}

impl fmt::Display for TagList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serialize())
    }
}

impl From<Vec<String>> for TagList {
    fn from(names: Vec<String>) -> Self {
        Self::from_names(names)
    }
}

impl From<TagList> for Vec<String> {
    fn from(list: TagList) -> Self {
        list.names
    }
}

impl<S: AsRef<str>> FromIterator<S> for TagList {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self::from_names(iter)
    }
}

impl<S: AsRef<str>> Extend<S> for TagList {
    fn extend<I: IntoIterator<Item = S>>(&mut self, iter: I) {
        for name in iter {
            self.add(name.as_ref());
        }
    }
}

impl IntoIterator for TagList {
    type Item = String;
    type IntoIter = std::vec::IntoIter<String>;

    fn into_iter(self) -> Self::IntoIter {
        self.names.into_iter()
    }
}

impl<'a> IntoIterator for &'a TagList {
    type Item = &'a String;
    type IntoIter = std::slice::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.names.iter()
    }
}

/// Anything that can stand for a set of tags
///
/// Strings are parsed as delimited lists; slices and vectors contribute each
/// element as one name; tags contribute their names.
pub trait IntoTagList {
    /// Convert into a tag list, parsing strings with `format`
    fn into_tag_list(self, format: &TagListFormat) -> Result<TagList, TagListError>;
}

/// Normalize any tag-like input into a [`TagList`]
pub fn to_tag_set<T: IntoTagList>(input: T, format: &TagListFormat) -> Result<TagList, TagListError> {
    input.into_tag_list(format)
}

impl IntoTagList for &str {
    fn into_tag_list(self, format: &TagListFormat) -> Result<TagList, TagListError> {
        TagList::parse_with(self, format)
    }
}

impl IntoTagList for String {
    fn into_tag_list(self, format: &TagListFormat) -> Result<TagList, TagListError> {
        TagList::parse_with(&self, format)
    }
}

impl IntoTagList for &String {
    fn into_tag_list(self, format: &TagListFormat) -> Result<TagList, TagListError> {
        TagList::parse_with(self, format)
    }
}

impl IntoTagList for TagList {
    fn into_tag_list(self, _format: &TagListFormat) -> Result<TagList, TagListError> {
        Ok(self)
    }
}

impl IntoTagList for &TagList {
    fn into_tag_list(self, _format: &TagListFormat) -> Result<TagList, TagListError> {
        Ok(self.clone())
    }
}

impl IntoTagList for &[&str] {
    fn into_tag_list(self, _format: &TagListFormat) -> Result<TagList, TagListError> {
        Ok(TagList::from_names(self))
    }
}

impl<const N: usize> IntoTagList for [&str; N] {
    fn into_tag_list(self, _format: &TagListFormat) -> Result<TagList, TagListError> {
        Ok(TagList::from_names(self))
    }
}

impl IntoTagList for &[String] {
    fn into_tag_list(self, _format: &TagListFormat) -> Result<TagList, TagListError> {
        Ok(TagList::from_names(self))
    }
}

impl IntoTagList for Vec<String> {
    fn into_tag_list(self, _format: &TagListFormat) -> Result<TagList, TagListError> {
        Ok(TagList::from_names(self))
    }
}

impl IntoTagList for Vec<&str> {
    fn into_tag_list(self, _format: &TagListFormat) -> Result<TagList, TagListError> {
        Ok(TagList::from_names(self))
    }
}

impl IntoTagList for &Tag {
    fn into_tag_list(self, _format: &TagListFormat) -> Result<TagList, TagListError> {
        Ok(TagList::from_names([self.name.as_str()]))
    }
}

impl IntoTagList for &[Tag] {
    fn into_tag_list(self, _format: &TagListFormat) -> Result<TagList, TagListError> {
        Ok(self.iter().map(|tag| tag.name.as_str()).collect())
    }
}

impl IntoTagList for Vec<Tag> {
    fn into_tag_list(self, format: &TagListFormat) -> Result<TagList, TagListError> {
        self.as_slice().into_tag_list(format)
    }
}
