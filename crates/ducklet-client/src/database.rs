//! Database handle
//!
//! Opens a DuckDB database once and hands out sessions, each on its own connection to it.

use std::sync::Arc;

use duckdb::{params, Connection};
use ducklet_common::{ClientConfig, DatabaseConfig, DuckletError, Result};
use parking_lot::Mutex;
use tracing::{debug, info, instrument};

use crate::duckdb_engine::DuckDbEngine;
use crate::session::Session;

/// An open DuckDB database
pub struct Database {
    config: DatabaseConfig,
    client_config: ClientConfig,
    /// Root connection; sessions are cloned from it
    root: Mutex<Option<Connection>>,
}

impl Database {
    /// Open with default client settings
    pub fn open(config: &DatabaseConfig) -> Result<Self> {
        Self::open_with_client_config(config, ClientConfig::default())
    }

    #[instrument(skip_all, fields(path = config.path.as_deref().unwrap_or(":memory:")))]
    pub fn open_with_client_config(
        config: &DatabaseConfig,
        client_config: ClientConfig,
    ) -> Result<Self> {
        let mut flags = duckdb::Config::default();
        for (key, value) in config.settings() {
            flags = flags
                .with(key, &value)
                .map_err(|e| DuckletError::Config(format!("{} = {}: {}", key, value, e)))?;
        }

        let connection = match &config.path {
            Some(path) => Connection::open_with_flags(path, flags),
            None => Connection::open_in_memory_with_flags(flags),
        }
        .map_err(DuckletError::engine)?;

        info!(
            threads = config.threads,
            access_mode = ?config.access_mode,
            "Database opened"
        );

        Ok(Self {
            config: config.clone(),
            client_config,
            root: Mutex::new(Some(connection)),
        })
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// New session on its own connection to this database
    pub fn connect(&self) -> Result<Session> {
        let root = self.root.lock();
        let root = root
            .as_ref()
            .ok_or_else(|| DuckletError::ConnectionClosed("Database".into()))?;
        let connection = root.try_clone().map_err(DuckletError::engine)?;
        let session = Session::new(
            Arc::new(DuckDbEngine::new(connection)),
            self.client_config.clone(),
        );
        debug!(session = session.id(), "Session connected");
        Ok(session)
    }

    /// Current value of an engine setting, rendered as text
    pub fn setting(&self, name: &str) -> Result<String> {
        let root = self.root.lock();
        let root = root
            .as_ref()
            .ok_or_else(|| DuckletError::ConnectionClosed("Database".into()))?;
        // current_setting only takes a constant argument
        let sql = format!(
            "SELECT CAST(current_setting('{}') AS VARCHAR)",
            name.replace('\'', "''")
        );
        root.query_row(&sql, params![], |row| row.get::<_, String>(0))
            .map_err(DuckletError::engine)
    }

    /// Close the root connection. Open sessions keep working until they are dropped.
    pub fn close(&self) {
        if self.root.lock().take().is_some() {
            info!("Database closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.root.lock().is_none()
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.config.path)
            .field("is_closed", &self.is_closed())
            .finish()
    }
}
