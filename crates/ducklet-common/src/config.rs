//! Configuration for the ducklet client and the databases it opens

use serde::{Deserialize, Serialize};

/// Shape of rows handed to callers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowFormat {
    /// Positional values, one per column
    #[default]
    Array,
    /// Column name to value mapping
    Object,
}

/// How 64-bit integers are handed to callers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BigIntMode {
    /// Widened to `f64`; values beyond 2^53 lose precision
    #[default]
    Lossy,
    /// Kept as exact `i64`
    Exact,
}

/// Client-side settings for executing queries
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Rows a stream may buffer ahead of its consumer
    pub stream_high_water_mark: usize,
    /// Row shape used when a call does not pick one
    pub default_row_format: RowFormat,
    /// 64-bit integer conversion used when a call does not pick one
    pub bigint_mode: BigIntMode,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            stream_high_water_mark: 64,
            default_row_format: RowFormat::Array,
            bigint_mode: BigIntMode::Lossy,
        }
    }
}

/// Database access mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    #[default]
    Automatic,
    ReadOnly,
    ReadWrite,
}

/// Default ORDER BY direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    Desc,
}

/// Default NULL placement in ORDER BY
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NullOrder {
    NullsFirst,
    NullsLast,
}

/// Options for opening a DuckDB database
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database file; `None` opens an in-memory database
    pub path: Option<String>,
    pub access_mode: AccessMode,
    /// Memory limit, e.g. "4GB"
    pub maximum_memory: Option<String>,
    /// Worker threads for query execution
    pub threads: u32,
    /// Spill directory for out-of-core processing
    pub temporary_directory: Option<String>,
    pub collation: Option<String>,
    pub default_order: Option<SortOrder>,
    pub default_null_order: Option<NullOrder>,
    /// Allow COPY and file-reading table functions
    pub enable_external_access: bool,
    /// WAL size that triggers a checkpoint, e.g. "16MB"
    pub checkpoint_wal_size: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            access_mode: AccessMode::Automatic,
            maximum_memory: None,
            threads: num_cpus::get() as u32,
            temporary_directory: None,
            collation: None,
            default_order: None,
            default_null_order: None,
            enable_external_access: true,
            checkpoint_wal_size: None,
        }
    }
}

impl DatabaseConfig {
    /// In-memory database with default options
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// File-backed database with default options
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Engine setting names and values to apply when opening the database
    pub fn settings(&self) -> Vec<(&'static str, String)> {
        let mut settings = vec![
            (
                "access_mode",
                match self.access_mode {
                    AccessMode::Automatic => "automatic",
                    AccessMode::ReadOnly => "read_only",
                    AccessMode::ReadWrite => "read_write",
                }
                .to_string(),
            ),
            ("threads", self.threads.max(1).to_string()),
            (
                "enable_external_access",
                self.enable_external_access.to_string(),
            ),
        ];

        if let Some(memory) = &self.maximum_memory {
            settings.push(("max_memory", memory.clone()));
        }
        if let Some(dir) = &self.temporary_directory {
            settings.push(("temp_directory", dir.clone()));
        }
        if let Some(collation) = &self.collation {
            settings.push(("default_collation", collation.clone()));
        }
        if let Some(order) = self.default_order {
            let order = match order {
                SortOrder::Asc => "asc",
                SortOrder::Desc => "desc",
            };
            settings.push(("default_order", order.to_string()));
        }
        if let Some(null_order) = self.default_null_order {
            let null_order = match null_order {
                NullOrder::NullsFirst => "nulls_first",
                NullOrder::NullsLast => "nulls_last",
            };
            settings.push(("default_null_order", null_order.to_string()));
        }
        if let Some(wal) = &self.checkpoint_wal_size {
            settings.push(("checkpoint_threshold", wal.clone()));
        }

        settings
    }
}

/// Load configuration from environment variables
pub fn load_from_env<T: for<'de> Deserialize<'de>>(prefix: &str) -> Result<T, config::ConfigError> {
    config::Config::builder()
        .add_source(
            config::Environment::with_prefix(prefix)
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()
}

/// Get environment variable with default
pub fn env_or_default(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.stream_high_water_mark, 64);
        assert_eq!(config.default_row_format, RowFormat::Array);
        assert_eq!(config.bigint_mode, BigIntMode::Lossy);
    }

    #[test]
    fn test_database_settings() {
        let config = DatabaseConfig {
            threads: 2,
            maximum_memory: Some("1GB".into()),
            default_null_order: Some(NullOrder::NullsLast),
            ..DatabaseConfig::in_memory()
        };
        let settings = config.settings();
        assert!(settings.contains(&("threads", "2".to_string())));
        assert!(settings.contains(&("max_memory", "1GB".to_string())));
        assert!(settings.contains(&("default_null_order", "nulls_last".to_string())));
        assert!(settings.contains(&("access_mode", "automatic".to_string())));
        assert!(!settings.iter().any(|(key, _)| *key == "temp_directory"));
    }

    #[test]
    fn test_env_or_default() {
        assert_eq!(env_or_default("DUCKLET_TEST_UNSET_VARIABLE", "x"), "x");
    }

    #[test]
    fn test_load_from_env_uses_defaults() {
        let config: ClientConfig = load_from_env("DUCKLET_TEST_EMPTY_PREFIX").unwrap();
        assert_eq!(config.stream_high_water_mark, 64);
    }
}
