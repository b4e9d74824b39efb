//! Connection configuration and pool tuning models.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// SSH tunnel settings nested in a connection.
///
/// Only a key path is ever stored here. Passwords and key passphrases come
/// from the credential vault at connect time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshConfig {
    /// Whether the connection goes through the tunnel
    pub enabled: bool,
    /// SSH server hostname
    pub host: String,
    /// SSH server port (default 22)
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// SSH username
    pub username: String,
    /// Path to a private key file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_path: Option<PathBuf>,
}

fn default_ssh_port() -> u16 {
    22
}

impl SshConfig {
    /// Create an enabled SSH configuration on port 22.
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            enabled: true,
            host: host.into(),
            port: default_ssh_port(),
            username: username.into(),
            private_key_path: None,
        }
    }

    /// Set the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Use key-based authentication.
    pub fn with_key(mut self, key_path: impl Into<PathBuf>) -> Self {
        self.private_key_path = Some(key_path.into());
        self
    }
}

/// A user-configured database connection.
///
/// `id` keys the adapter instance, the tunnel and the stored secrets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    /// Stable identifier
    pub id: Uuid,
    /// Display name (1-255 chars)
    pub name: String,
    /// Registered adapter type, e.g. "postgres"
    pub adapter_type: String,
    /// Server hostname or IP
    pub host: String,
    /// Server port
    pub port: u16,
    /// Database name
    pub database: String,
    /// Login username
    pub username: String,
    /// Connect over TLS
    #[serde(default)]
    pub ssl_enabled: bool,
    /// Optional SSH tunnel
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh: Option<SshConfig>,
}

impl ConnectionConfig {
    /// Create a PostgreSQL connection configuration on port 5432.
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        database: impl Into<String>,
        username: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            adapter_type: "postgres".to_string(),
            host: host.into(),
            port: 5432,
            database: database.into(),
            username: username.into(),
            ssl_enabled: false,
            ssh: None,
        }
    }

    /// Set the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Attach an SSH tunnel.
    pub fn with_ssh(mut self, ssh: SshConfig) -> Self {
        self.ssh = Some(ssh);
        self
    }

    /// The SSH settings, if tunneling is enabled.
    pub fn active_ssh(&self) -> Option<&SshConfig> {
        self.ssh.as_ref().filter(|ssh| ssh.enabled)
    }

    /// Copy of this config pointed at a local tunnel endpoint.
    pub fn through_tunnel(&self, local_port: u16) -> Self {
        Self { host: "127.0.0.1".to_string(), port: local_port, ..self.clone() }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() || self.name.len() > 255 {
            return Err("Name must be 1-255 characters".to_string());
        }
        if self.adapter_type.is_empty() {
            return Err("Adapter type is required".to_string());
        }
        if self.host.is_empty() {
            return Err("Host is required".to_string());
        }
        if self.port == 0 {
            return Err("Port must be between 1 and 65535".to_string());
        }
        if self.database.is_empty() {
            return Err("Database name is required".to_string());
        }
        if self.username.is_empty() {
            return Err("Username is required".to_string());
        }
        if let Some(ssh) = self.active_ssh() {
            if ssh.host.is_empty() {
                return Err("SSH host is required".to_string());
            }
            if ssh.username.is_empty() {
                return Err("SSH username is required".to_string());
            }
            if ssh.port == 0 {
                return Err("SSH port must be between 1 and 65535".to_string());
            }
        }
        Ok(())
    }

    /// Get the display connection string (without password).
    pub fn display_url(&self) -> String {
        format!("{}://{}@{}:{}/{}", self.adapter_type, self.username, self.host, self.port, self.database)
    }
}

/// Pool sizing and timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    /// Maximum pooled connections
    pub max_size: usize,
    /// Idle connections older than this are closed; `None` disables reaping
    pub idle_timeout: Option<Duration>,
    /// Limit for opening a connection and for waiting on a busy pool
    pub connect_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_size: 10,
            idle_timeout: Some(Duration::from_secs(30)),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl PoolSettings {
    /// Settings for a single-use connectivity probe.
    pub fn probe() -> Self {
        Self { max_size: 1, idle_timeout: None, connect_timeout: Duration::from_secs(5) }
    }
}
