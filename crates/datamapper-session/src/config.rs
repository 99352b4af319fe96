//! Data-layer configuration.
//!
//! Loadable from JSON with serde; every field has a default, so a config
//! file only names what it changes:
//!
//! ```json
//! {
//!   "dialect": "sqlite",
//!   "connection_string_key": "main",
//!   "connection_strings": { "main": "file:app.db" },
//!   "cache": { "overrides": { "AuditEntry": false } },
//!   "polymorphism": "table_per_type"
//! }
//! ```

use std::collections::HashMap;

use datamapper_core::{ConfigError, Error, Result};
use datamapper_pool::PoolConfig;
use datamapper_query::Dialect;
use serde::Deserialize;

/// How a type hierarchy maps onto tables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolymorphismStrategy {
    /// No polymorphic queries: a type with derived types cannot be queried.
    None,
    /// One shared table per hierarchy, rows told apart by a discriminator column.
    TablePerHierarchy,
    /// One complete table per concrete type; base-type queries union them.
    #[default]
    TablePerType,
}

/// Object-cache policy.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Master switch for entity and snapshot caching
    pub enabled: bool,
    /// Drop the snapshots of referencing types when a type is written
    pub cascade_on_write: bool,
    /// Capacity of the generated-statement cache (0 disables it)
    pub statement_cache_size: usize,
    /// Per-type cacheability overrides, keyed by entity type name
    pub overrides: HashMap<String, bool>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cascade_on_write: true,
            statement_cache_size: 512,
            overrides: HashMap::new(),
        }
    }
}

impl CacheConfig {
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn cascade_on_write(mut self, cascade: bool) -> Self {
        self.cascade_on_write = cascade;
        self
    }

    pub fn statement_cache_size(mut self, size: usize) -> Self {
        self.statement_cache_size = size;
        self
    }

    /// Force caching on or off for one entity type.
    pub fn cacheable(mut self, type_name: impl Into<String>, cacheable: bool) -> Self {
        self.overrides.insert(type_name.into(), cacheable);
        self
    }
}

/// Per-type storage overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub connection_string: Option<String>,
    pub connection_string_key: Option<String>,
}

/// Top-level configuration for a `DataContext`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub dialect: Dialect,
    /// Literal connection string
    pub connection_string: Option<String>,
    /// Name of an entry in `connection_strings`; wins over `connection_string`
    pub connection_string_key: Option<String>,
    /// Named connection strings
    pub connection_strings: HashMap<String, String>,
    pub pool: PoolConfig,
    pub cache: CacheConfig,
    pub polymorphism: PolymorphismStrategy,
    /// Per-type overrides, keyed by entity type name
    pub providers: HashMap<String, ProviderConfig>,
    /// Default batch size for bulk inserts and updates
    pub bulk_batch_size: usize,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            dialect: Dialect::default(),
            connection_string: None,
            connection_string_key: None,
            connection_strings: HashMap::new(),
            pool: PoolConfig::default(),
            cache: CacheConfig::default(),
            polymorphism: PolymorphismStrategy::default(),
            providers: HashMap::new(),
            bulk_batch_size: 1000,
        }
    }
}

impl DataConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON configuration document.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| config_error(format!("invalid data config: {e}")))
    }

    pub fn dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    pub fn connection_string(mut self, connection_string: impl Into<String>) -> Self {
        self.connection_string = Some(connection_string.into());
        self
    }

    pub fn connection_string_key(mut self, key: impl Into<String>) -> Self {
        self.connection_string_key = Some(key.into());
        self
    }

    /// Register a named connection string.
    pub fn named_connection(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.connection_strings.insert(key.into(), value.into());
        self
    }

    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn polymorphism(mut self, strategy: PolymorphismStrategy) -> Self {
        self.polymorphism = strategy;
        self
    }

    /// Override storage for one entity type.
    pub fn provider(mut self, type_name: impl Into<String>, provider: ProviderConfig) -> Self {
        self.providers.insert(type_name.into(), provider);
        self
    }

    pub fn bulk_batch_size(mut self, size: usize) -> Self {
        self.bulk_batch_size = size;
        self
    }

    /// The connection string serving `type_name`.
    ///
    /// A per-type override is consulted first, then the global settings. At
    /// each level a key wins over a literal string.
    pub fn resolve_connection_string(&self, type_name: &str) -> Result<String> {
        if let Some(provider) = self.providers.get(type_name) {
            if let Some(resolved) = self.resolve_pair(
                provider.connection_string.as_deref(),
                provider.connection_string_key.as_deref(),
            )? {
                return Ok(resolved);
            }
        }
        self.resolve_pair(
            self.connection_string.as_deref(),
            self.connection_string_key.as_deref(),
        )?
        .ok_or_else(|| {
            config_error(format!(
                "no connection string configured for entity type '{type_name}'"
            ))
        })
    }

    fn resolve_pair(&self, literal: Option<&str>, key: Option<&str>) -> Result<Option<String>> {
        if let Some(key) = key {
            return self
                .connection_strings
                .get(key)
                .cloned()
                .map(Some)
                .ok_or_else(|| config_error(format!("unknown connection string key '{key}'")));
        }
        Ok(literal.map(str::to_string))
    }
}

fn config_error(message: String) -> Error {
    Error::Config(ConfigError { message })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DataConfig::default();
        assert_eq!(config.dialect, Dialect::Postgres);
        assert!(config.cache.enabled);
        assert!(config.cache.cascade_on_write);
        assert_eq!(config.polymorphism, PolymorphismStrategy::TablePerType);
        assert_eq!(config.bulk_batch_size, 1000);
    }

    #[test]
    fn test_from_json() {
        let config = DataConfig::from_json(
            r#"{
                "dialect": "sqlserver",
                "connection_string_key": "main",
                "connection_strings": { "main": "mssql://db" },
                "pool": { "max_connections": 4 },
                "cache": { "cascade_on_write": false, "overrides": { "Audit": false } },
                "polymorphism": "table_per_hierarchy"
            }"#,
        )
        .unwrap();
        assert_eq!(config.dialect, Dialect::SqlServer);
        assert_eq!(config.pool.max_connections, 4);
        assert!(!config.cache.cascade_on_write);
        assert_eq!(config.cache.overrides.get("Audit"), Some(&false));
        assert_eq!(config.polymorphism, PolymorphismStrategy::TablePerHierarchy);
        assert_eq!(config.resolve_connection_string("Invoice").unwrap(), "mssql://db");
    }

    #[test]
    fn test_invalid_json_is_config_error() {
        let err = DataConfig::from_json("{ nope").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_key_wins_over_literal() {
        let config = DataConfig::new()
            .connection_string("literal://")
            .connection_string_key("named")
            .named_connection("named", "named://");
        assert_eq!(config.resolve_connection_string("X").unwrap(), "named://");
    }

    #[test]
    fn test_unknown_key_and_missing_string() {
        let config = DataConfig::new().connection_string_key("ghost");
        assert!(matches!(
            config.resolve_connection_string("X"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            DataConfig::new().resolve_connection_string("X"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_per_type_override() {
        let config = DataConfig::new()
            .connection_string("main://")
            .named_connection("audit", "audit://")
            .provider(
                "AuditEntry",
                ProviderConfig {
                    connection_string_key: Some("audit".into()),
                    ..ProviderConfig::default()
                },
            );
        assert_eq!(config.resolve_connection_string("AuditEntry").unwrap(), "audit://");
        assert_eq!(config.resolve_connection_string("Invoice").unwrap(), "main://");
    }
}
