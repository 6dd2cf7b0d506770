//! Engine configuration
//!
//! Read from a YAML file (`taggable.yml` by default), then `TAGGABLE_*`
//! environment variables override individual keys. Absent keys take defaults.

use serde::{Deserialize, Serialize};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Tagging behaviour and taggable types
    #[serde(default)]
    pub tagging: TaggingConfig,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database driver (sqlite or mysql)
    #[serde(default)]
    pub driver: DatabaseDriver,
    /// Database connection URL
    #[serde(default = "default_database_url")]
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            driver: DatabaseDriver::default(),
            url: default_database_url(),
        }
    }
}

fn default_database_url() -> String {
    "data/taggable.db".to_string()
}

/// Database driver type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseDriver {
    /// SQLite (default)
    #[default]
    Sqlite,
    /// MySQL
    Mysql,
}

/// Tagging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaggingConfig {
    /// Delimiter used when parsing and serializing tag lists
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    /// Name of the cached tag list column looked up on every taggable table
    #[serde(default = "default_cached_column")]
    pub cached_column: String,
    /// Delete tags that lose their last tagging
    #[serde(default)]
    pub destroy_unused: bool,
    /// How many times find-or-create re-reads after losing a creation race
    #[serde(default = "default_max_create_attempts")]
    pub max_create_attempts: u32,
    /// Entity types that can be tagged
    #[serde(default)]
    pub types: Vec<TaggableTypeConfig>,
}

impl Default for TaggingConfig {
    fn default() -> Self {
        Self {
            delimiter: default_delimiter(),
            cached_column: default_cached_column(),
            destroy_unused: false,
            max_create_attempts: default_max_create_attempts(),
            types: Vec::new(),
        }
    }
}

fn default_delimiter() -> char {
    ','
}

fn default_cached_column() -> String {
    "cached_tag_list".to_string()
}

fn default_max_create_attempts() -> u32 {
    3
}

/// A taggable entity type backed by a host table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaggableTypeConfig {
    /// Type name stored in `taggings.taggable_type`
    pub name: String,
    /// Table holding the entities
    pub table: String,
    /// Integer primary key column of `table`
    #[serde(default = "default_primary_key")]
    pub primary_key: String,
    /// Cached tag list column for this type, overriding `tagging.cached_column`
    #[serde(default)]
    pub cached_column: Option<String>,
}

impl TaggableTypeConfig {
    /// Create a type config with the default primary key and cached column
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            primary_key: default_primary_key(),
            cached_column: None,
        }
    }

    /// Use a different cached tag list column for this type
    pub fn with_cached_column(mut self, column: impl Into<String>) -> Self {
        self.cached_column = Some(column.into());
        self
    }

    /// Use a different primary key column for this type
    pub fn with_primary_key(mut self, column: impl Into<String>) -> Self {
        self.primary_key = column.into();
        self
    }
}

fn default_primary_key() -> String {
    "id".to_string()
}

/// Error type for configuration parsing
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    FileRead {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to parse config file '{path}': {message}")]
    ParseError {
        path: String,
        message: String,
    },
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

impl Config {
    /// Read and validate a YAML file; a missing or empty file yields defaults
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.display().to_string(),
            source: e,
        })?;

        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        let config: Config = serde_yaml::from_str(&content).map_err(|e| {
            ConfigError::ParseError {
                path: path.display().to_string(),
                message: format_yaml_error(&e),
            }
        })?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from file with environment variable overrides
    ///
    /// Environment variables follow the pattern:
    /// - TAGGABLE_DATABASE_DRIVER
    /// - TAGGABLE_DATABASE_URL
    /// - TAGGABLE_DELIMITER
    /// - TAGGABLE_CACHED_COLUMN
    /// - TAGGABLE_DESTROY_UNUSED
    /// - TAGGABLE_MAX_CREATE_ATTEMPTS
    pub fn load_with_env(path: &std::path::Path) -> anyhow::Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make tag lists unparseable
    fn validate(&self) -> Result<(), ConfigError> {
        let delimiter = self.tagging.delimiter;
        if delimiter == '"' || delimiter == '\'' {
            return Err(ConfigError::ValidationError(format!(
                "tag delimiter cannot be a quote character: {:?}",
                delimiter
            )));
        }
        if self.tagging.max_create_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "max_create_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Unparseable values are ignored
    fn apply_env_overrides(&mut self) {
        if let Ok(driver) = std::env::var("TAGGABLE_DATABASE_DRIVER") {
            match driver.to_lowercase().as_str() {
                "sqlite" => self.database.driver = DatabaseDriver::Sqlite,
                "mysql" => self.database.driver = DatabaseDriver::Mysql,
                _ => {} // Ignore invalid values
            }
        }
        if let Ok(url) = std::env::var("TAGGABLE_DATABASE_URL") {
            self.database.url = url;
        }

        if let Ok(delimiter) = std::env::var("TAGGABLE_DELIMITER") {
            let mut chars = delimiter.chars();
            if let (Some(c), None) = (chars.next(), chars.next()) {
                if c != '"' && c != '\'' {
                    self.tagging.delimiter = c;
                }
            }
        }
        if let Ok(column) = std::env::var("TAGGABLE_CACHED_COLUMN") {
            if !column.trim().is_empty() {
                self.tagging.cached_column = column.trim().to_string();
            }
        }
        if let Ok(flag) = std::env::var("TAGGABLE_DESTROY_UNUSED") {
            match flag.to_lowercase().as_str() {
                "1" | "true" | "yes" => self.tagging.destroy_unused = true,
                "0" | "false" | "no" => self.tagging.destroy_unused = false,
                _ => {}
            }
        }
        if let Ok(attempts) = std::env::var("TAGGABLE_MAX_CREATE_ATTEMPTS") {
            if let Ok(attempts) = attempts.parse::<u32>() {
                if attempts > 0 {
                    self.tagging.max_create_attempts = attempts;
                }
            }
        }
    }
}

/// Format YAML parsing error with location and context
fn format_yaml_error(e: &serde_yaml::Error) -> String {
    if let Some(location) = e.location() {
        format!(
            "at line {}, column {}: {}",
            location.line(),
            location.column(),
            e
        )
    } else {
        e.to_string()
    }
}

// Shared mutex for all config tests that modify environment variables.
#[cfg(test)]
static CONFIG_ENV_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(test)]
const ENV_KEYS: &[&str] = &[
    "TAGGABLE_DATABASE_DRIVER",
    "TAGGABLE_DATABASE_URL",
    "TAGGABLE_DELIMITER",
    "TAGGABLE_CACHED_COLUMN",
    "TAGGABLE_DESTROY_UNUSED",
    "TAGGABLE_MAX_CREATE_ATTEMPTS",
];


#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn valid_driver_strategy() -> impl Strategy<Value = DatabaseDriver> {
        prop_oneof![Just(DatabaseDriver::Sqlite), Just(DatabaseDriver::Mysql)]
    }

    fn valid_type_strategy() -> impl Strategy<Value = TaggableTypeConfig> {
        (
            "[A-Z][a-z]{2,10}",
            "[a-z_]{3,12}",
            proptest::option::of("[a-z_]{3,12}"),
        )
            .prop_map(|(name, table, cached_column)| TaggableTypeConfig {
                name,
                table,
                primary_key: "id".to_string(),
                cached_column,
            })
    }

    fn valid_config_strategy() -> impl Strategy<Value = Config> {
        (
            valid_driver_strategy(),
            "[a-z]{1,10}\\.db",
            prop_oneof![Just(','), Just(';'), Just('|'), Just(' ')],
            "[a-z_]{3,15}",
            any::<bool>(),
            1..10u32,
            proptest::collection::vec(valid_type_strategy(), 0..4),
        )
            .prop_map(
                |(driver, url, delimiter, cached_column, destroy_unused, attempts, types)| Config {
                    database: DatabaseConfig { driver, url },
                    tagging: TaggingConfig {
                        delimiter,
                        cached_column,
                        destroy_unused,
                        max_create_attempts: attempts,
                        types,
                    },
                },
            )
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(20))]

        /// Serializing any valid config to YAML and loading it back yields the same values.
        #[test]
        fn property_config_roundtrip(config in valid_config_strategy()) {
            let yaml = serde_yaml::to_string(&config).expect("Failed to serialize config");

            let mut file = NamedTempFile::new().expect("Failed to create temp file");
            write!(file, "{}", yaml).expect("Failed to write config");

            let parsed = Config::load(file.path()).expect("Failed to parse config");

            prop_assert_eq!(config.database.driver, parsed.database.driver);
            prop_assert_eq!(config.database.url, parsed.database.url);
            prop_assert_eq!(config.tagging.delimiter, parsed.tagging.delimiter);
            prop_assert_eq!(config.tagging.cached_column, parsed.tagging.cached_column);
            prop_assert_eq!(config.tagging.destroy_unused, parsed.tagging.destroy_unused);
            prop_assert_eq!(config.tagging.max_create_attempts, parsed.tagging.max_create_attempts);
            prop_assert_eq!(config.tagging.types, parsed.tagging.types);
        }
    }
}
