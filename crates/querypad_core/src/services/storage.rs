//! Saved connection list.
//!
//! Connection configs live in a local SQLite file. Secrets never do; they go
//! through [`CredentialService`](super::credentials::CredentialService).
//!
//! # Data Directory
//!
//! - **Debug builds**: `./querypad_data` in the current directory
//! - **Release builds**: `<platform data dir>/querypad`

use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::{QueryPadError, Result};
use crate::models::{ConnectionConfig, SshConfig};

const DB_FILE: &str = "querypad.db";

/// Persistence for the saved connection list.
pub trait ConnectionStore: Send + Sync {
    /// All saved connections in saved order.
    fn load_all(&self) -> Result<Vec<ConnectionConfig>>;

    /// Replace the saved list with `connections`.
    fn save_all(&self, connections: &[ConnectionConfig]) -> Result<()>;
}

/// Default data directory for this build.
pub fn default_data_dir() -> PathBuf {
    if cfg!(debug_assertions) {
        return PathBuf::from("./querypad_data");
    }
    dirs::data_dir()
        .map(|d| d.join("querypad"))
        .unwrap_or_else(|| PathBuf::from("./querypad_data"))
}

/// Create the data directory if needed.
pub fn init_data_dir(path: &Path) -> Result<()> {
    if path.exists() {
        if !path.is_dir() {
            return Err(QueryPadError::storage(
                format!("Data path exists but is not a directory: {}", path.display()),
                Some("Select a different location or remove the existing file"),
            ));
        }
        return Ok(());
    }

    std::fs::create_dir_all(path).map_err(|e| {
        QueryPadError::storage(
            format!("Failed to create data directory '{}': {}", path.display(), e),
            Some("Check permissions or select a different location"),
        )
    })?;

    tracing::info!(path = %path.display(), "Created data directory");
    Ok(())
}

/// SQLite-backed [`ConnectionStore`].
pub struct LocalStorage {
    connection: Mutex<Connection>,
    data_dir: PathBuf,
}

impl LocalStorage {
    /// Open or create `querypad.db` inside `data_dir`.
    pub fn open(data_dir: PathBuf) -> Result<Self> {
        init_data_dir(&data_dir)?;
        let db_path = data_dir.join(DB_FILE);
        let connection = Connection::open(&db_path).map_err(|e| {
            QueryPadError::storage(
                format!("Failed to open database '{}': {}", db_path.display(), e),
                Some("The database file may be corrupted. Try deleting it to start fresh."),
            )
        })?;

        let storage = Self { connection: Mutex::new(connection), data_dir };
        storage.configure()?;
        storage.migrate()?;

        tracing::info!(path = %db_path.display(), "Local storage opened");
        Ok(storage)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn configure(&self) -> Result<()> {
        self.connection
            .lock()
            .execute_batch(
                "
                PRAGMA journal_mode = WAL;
                PRAGMA synchronous = NORMAL;
                PRAGMA busy_timeout = 5000;
                ",
            )
            .map_err(|e| QueryPadError::storage(format!("Failed to configure database: {e}"), None))
    }

    fn migrate(&self) -> Result<()> {
        const DOMAIN: &str = "connections";

        let conn = self.connection.lock();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS migrations (
                domain TEXT NOT NULL,
                step INTEGER NOT NULL,
                migration TEXT NOT NULL,
                PRIMARY KEY(domain, step)
            ) STRICT",
            [],
        )?;

        let current_step: i64 = conn.query_row(
            "SELECT COALESCE(MAX(step), 0) FROM migrations WHERE domain = ?",
            [DOMAIN],
            |row| row.get(0),
        )?;

        if current_step < 1 {
            conn.execute_batch(
                "
                CREATE TABLE connections (
                    connection_id TEXT PRIMARY KEY,
                    position INTEGER NOT NULL,
                    name TEXT NOT NULL,
                    adapter_type TEXT NOT NULL,
                    host TEXT NOT NULL,
                    port INTEGER NOT NULL,
                    database_name TEXT NOT NULL,
                    username TEXT NOT NULL,
                    ssl_enabled INTEGER NOT NULL DEFAULT 0,
                    ssh_enabled INTEGER NOT NULL DEFAULT 0,
                    ssh_host TEXT,
                    ssh_port INTEGER,
                    ssh_username TEXT,
                    ssh_key_path TEXT
                ) STRICT;
                ",
            )
            .map_err(|e| QueryPadError::storage(format!("Migration 1 failed: {e}"), None))?;

            conn.execute(
                "INSERT INTO migrations (domain, step, migration) VALUES (?, 1, 'connections')",
                [DOMAIN],
            )?;
            tracing::info!("Applied migration 1: connections");
        }

        Ok(())
    }
}

/// Raw `connections` row.
struct ConnectionRow {
    id: String,
    name: String,
    adapter_type: String,
    host: String,
    port: u16,
    database: String,
    username: String,
    ssl_enabled: bool,
    ssh_enabled: bool,
    ssh_host: Option<String>,
    ssh_port: Option<u16>,
    ssh_username: Option<String>,
    ssh_key_path: Option<String>,
}

impl ConnectionRow {
    fn into_config(self) -> Result<ConnectionConfig> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|e| QueryPadError::storage(format!("Invalid connection ID: {e}"), None))?;

        let ssh = self.ssh_host.map(|host| SshConfig {
            enabled: self.ssh_enabled,
            host,
            port: self.ssh_port.unwrap_or(22),
            username: self.ssh_username.unwrap_or_default(),
            private_key_path: self.ssh_key_path.map(PathBuf::from),
        });

        Ok(ConnectionConfig {
            id,
            name: self.name,
            adapter_type: self.adapter_type,
            host: self.host,
            port: self.port,
            database: self.database,
            username: self.username,
            ssl_enabled: self.ssl_enabled,
            ssh,
        })
    }
}

impl ConnectionStore for LocalStorage {
    fn load_all(&self) -> Result<Vec<ConnectionConfig>> {
        let conn = self.connection.lock();
        let mut stmt = conn.prepare(
            "SELECT connection_id, name, adapter_type, host, port, database_name, username,
                    ssl_enabled, ssh_enabled, ssh_host, ssh_port, ssh_username, ssh_key_path
             FROM connections ORDER BY position",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok(ConnectionRow {
                id: row.get(0)?,
                name: row.get(1)?,
                adapter_type: row.get(2)?,
                host: row.get(3)?,
                port: row.get(4)?,
                database: row.get(5)?,
                username: row.get(6)?,
                ssl_enabled: row.get(7)?,
                ssh_enabled: row.get(8)?,
                ssh_host: row.get(9)?,
                ssh_port: row.get(10)?,
                ssh_username: row.get(11)?,
                ssh_key_path: row.get(12)?,
            })
        })?;

        let configs = rows.map(|row| row?.into_config()).collect::<Result<Vec<_>>>()?;
        Ok(configs)
    }

    fn save_all(&self, connections: &[ConnectionConfig]) -> Result<()> {
        let mut conn = self.connection.lock();
        let tx = conn.transaction()?;

        tx.execute("DELETE FROM connections", [])?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO connections (
                    connection_id, position, name, adapter_type, host, port, database_name,
                    username, ssl_enabled, ssh_enabled, ssh_host, ssh_port, ssh_username,
                    ssh_key_path
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            )?;

            for (position, config) in connections.iter().enumerate() {
                let ssh = config.ssh.as_ref();
                insert.execute(params![
                    config.id.to_string(),
                    position as i64,
                    config.name,
                    config.adapter_type,
                    config.host,
                    config.port,
                    config.database,
                    config.username,
                    config.ssl_enabled,
                    ssh.is_some_and(|s| s.enabled),
                    ssh.map(|s| s.host.as_str()),
                    ssh.map(|s| s.port),
                    ssh.map(|s| s.username.as_str()),
                    ssh.and_then(|s| s.private_key_path.as_ref()).map(|p| p.display().to_string()),
                ])?;
            }
        }
        tx.commit()?;

        tracing::debug!(count = connections.len(), "Connections saved");
        Ok(())
    }
}
