//! Error types for the QueryPad core.
//!
//! Adapters and the tunnel manager return typed [`QueryPadError`]s. Only the
//! orchestration layer turns them into the `Response` envelope handed to the UI.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = QueryPadError> = std::result::Result<T, E>;

/// Main error type for the QueryPad core.
#[derive(Debug, Error)]
pub enum QueryPadError {
    /// Connecting to a database failed (authentication, network, timeout).
    #[error("Connection error: {message}")]
    Connection {
        /// Human-readable error message.
        message: String,
        /// Optional underlying error source.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// An operation needed a live pool but the adapter is not connected.
    #[error("Not connected to database")]
    NotConnected,

    /// No live connection is registered under this id.
    #[error("Connection not found: {connection_id}")]
    ConnectionNotFound {
        /// The requested connection id.
        connection_id: uuid::Uuid,
    },

    /// A row mutation targeted a table without a usable primary key.
    #[error("Table {table} has no primary key; rows cannot be addressed uniquely")]
    NoPrimaryKey {
        /// Qualified table name.
        table: String,
    },

    /// No adapter factory is registered under this type name.
    #[error("Unknown adapter: {adapter_type}")]
    UnknownAdapter {
        /// The adapter type that was requested.
        adapter_type: String,
    },

    /// An adapter factory is already registered under this type name.
    #[error("Adapter with id \"{adapter_type}\" is already registered")]
    DuplicateAdapter {
        /// The adapter type that was registered twice.
        adapter_type: String,
    },

    /// The SSH tunnel has no usable credential.
    #[error("SSH auth error: {message}")]
    AuthConfig {
        /// Human-readable error message.
        message: String,
    },

    /// SSH session or local listener failure.
    #[error("SSH tunnel error: {message}")]
    Tunnel {
        /// Human-readable error message.
        message: String,
        /// Optional underlying error source.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Driver-reported SQL failure.
    #[error("{message}")]
    Query {
        /// Driver error message.
        message: String,
        /// Additional detail from the server.
        detail: Option<String>,
        /// Server hint.
        hint: Option<String>,
        /// Position in query (1-indexed).
        position: Option<usize>,
        /// SQLSTATE code (e.g., "42P01").
        code: Option<String>,
    },

    /// All pooled connections stayed busy past the wait timeout.
    #[error("Pool timeout: {message}")]
    PoolTimeout {
        /// Human-readable error message.
        message: String,
    },

    /// Caller supplied invalid input.
    #[error("Validation error: {message}")]
    Validation {
        /// Human-readable error message.
        message: String,
    },

    /// Local connection store error.
    #[error("Storage error: {message}")]
    Storage {
        /// Human-readable error message.
        message: String,
        /// Actionable hint for the user.
        hint: Option<String>,
        /// Optional underlying error source.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Credential vault error.
    #[error("Keyring error: {message}")]
    Keyring {
        /// Human-readable error message.
        message: String,
        /// Actionable hint for the user.
        hint: Option<String>,
    },

    /// Unexpected internal error.
    #[error("Internal error: {message}")]
    Internal {
        /// Human-readable error message.
        message: String,
    },
}

impl QueryPadError {
    // ========== Constructors ==========

    /// Create a new connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into(), source: None }
    }

    /// Create a new connection error with source.
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection { message: message.into(), source: Some(Box::new(source)) }
    }

    /// Create a connection-not-found error.
    pub fn connection_not_found(connection_id: uuid::Uuid) -> Self {
        Self::ConnectionNotFound { connection_id }
    }

    /// Create a no-primary-key error for a table.
    pub fn no_primary_key(table: impl Into<String>) -> Self {
        Self::NoPrimaryKey { table: table.into() }
    }

    /// Create an unknown adapter error.
    pub fn unknown_adapter(adapter_type: impl Into<String>) -> Self {
        Self::UnknownAdapter { adapter_type: adapter_type.into() }
    }

    /// Create a duplicate adapter error.
    pub fn duplicate_adapter(adapter_type: impl Into<String>) -> Self {
        Self::DuplicateAdapter { adapter_type: adapter_type.into() }
    }

    /// Create an SSH auth configuration error.
    pub fn auth_config(message: impl Into<String>) -> Self {
        Self::AuthConfig { message: message.into() }
    }

    /// Create a new tunnel error.
    pub fn tunnel(message: impl Into<String>) -> Self {
        Self::Tunnel { message: message.into(), source: None }
    }

    /// Create a new tunnel error with source.
    pub fn tunnel_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Tunnel { message: message.into(), source: Some(Box::new(source)) }
    }

    /// Create a query error carrying only a message.
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query { message: message.into(), detail: None, hint: None, position: None, code: None }
    }

    /// Create a new pool timeout error.
    pub fn pool_timeout(message: impl Into<String>) -> Self {
        Self::PoolTimeout { message: message.into() }
    }

    /// Create a new validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation { message: message.into() }
    }

    /// Create a new storage error.
    pub fn storage(message: impl Into<String>, hint: Option<&str>) -> Self {
        Self::Storage { message: message.into(), hint: hint.map(String::from), source: None }
    }

    /// Create a new keyring error.
    pub fn keyring(message: impl Into<String>, hint: Option<&str>) -> Self {
        Self::Keyring { message: message.into(), hint: hint.map(String::from) }
    }

    /// Create a new internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    // ========== Methods ==========

    /// Get the error category name.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "Connection",
            Self::NotConnected | Self::ConnectionNotFound { .. } => "Connection",
            Self::NoPrimaryKey { .. } => "Mutation",
            Self::UnknownAdapter { .. } | Self::DuplicateAdapter { .. } => "Registry",
            Self::AuthConfig { .. } | Self::Tunnel { .. } => "SSH",
            Self::Query { .. } => "Query",
            Self::PoolTimeout { .. } => "Pool",
            Self::Validation { .. } => "Validation",
            Self::Storage { .. } => "Storage",
            Self::Keyring { .. } => "Keyring",
            Self::Internal { .. } => "Internal",
        }
    }

    /// Get actionable hint for the user.
    pub fn hint(&self) -> Option<&str> {
        match self {
            Self::Connection { .. } => Some("Check that the database server is running"),
            Self::NotConnected | Self::ConnectionNotFound { .. } => {
                Some("Connect to the database first")
            }
            Self::NoPrimaryKey { .. } => Some("Add a primary key to edit rows from the grid"),
            Self::UnknownAdapter { .. } => Some("Check the adapter type of the connection"),
            Self::DuplicateAdapter { .. } => None,
            Self::AuthConfig { .. } => Some("Provide an SSH password or a private key path"),
            Self::Tunnel { .. } => Some("Verify the SSH server is reachable and allows forwarding"),
            Self::Query { hint, .. } => hint.as_deref(),
            Self::PoolTimeout { .. } => Some("Too many concurrent queries; try again shortly"),
            Self::Validation { .. } => None,
            Self::Storage { hint, .. } => hint.as_deref(),
            Self::Keyring { hint, .. } => hint.as_deref(),
            Self::Internal { .. } => Some("Please report this issue"),
        }
    }

    /// Get the SQLSTATE code (if applicable).
    pub fn pg_code(&self) -> Option<&str> {
        match self {
            Self::Query { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// Check if this error came from a failed connection attempt.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::NotConnected)
    }
}

// ========== Error Conversions ==========

impl From<tokio_postgres::Error> for QueryPadError {
    fn from(err: tokio_postgres::Error) -> Self {
        if let Some(db_err) = err.as_db_error() {
            let message = db_err.message().to_string();
            let code_str = db_err.code().code();

            // 28xxx: invalid authorization; 08xxx: connection exceptions
            if code_str.starts_with("28") || code_str.starts_with("08") {
                return QueryPadError::Connection { message, source: Some(Box::new(err)) };
            }

            let position = db_err.position().and_then(|p| match p {
                tokio_postgres::error::ErrorPosition::Original(pos) => Some(*pos as usize),
                tokio_postgres::error::ErrorPosition::Internal { .. } => None,
            });

            return QueryPadError::Query {
                message,
                detail: db_err.detail().map(String::from),
                hint: db_err.hint().map(String::from),
                position,
                code: Some(code_str.to_string()),
            };
        }

        if err.is_closed() {
            return QueryPadError::Connection {
                message: "Connection closed".to_string(),
                source: Some(Box::new(err)),
            };
        }

        let is_io = std::error::Error::source(&err)
            .is_some_and(|source| source.is::<std::io::Error>());
        if is_io {
            return QueryPadError::Connection { message: err.to_string(), source: Some(Box::new(err)) };
        }

        // Client-side statement errors such as a parameter count mismatch
        QueryPadError::query(err.to_string())
    }
}

impl From<deadpool_postgres::PoolError> for QueryPadError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        use deadpool_postgres::PoolError;

        match err {
            PoolError::Backend(e) => QueryPadError::from(e),
            PoolError::Timeout(kind) => {
                QueryPadError::pool_timeout(format!("Timed out waiting for a connection ({kind:?})"))
            }
            PoolError::Closed => QueryPadError::NotConnected,
            other => QueryPadError::connection(other.to_string()),
        }
    }
}

impl From<rusqlite::Error> for QueryPadError {
    fn from(err: rusqlite::Error) -> Self {
        QueryPadError::Storage {
            message: err.to_string(),
            hint: Some("The local database may be corrupted".to_string()),
            source: Some(Box::new(err)),
        }
    }
}

impl From<std::io::Error> for QueryPadError {
    fn from(err: std::io::Error) -> Self {
        QueryPadError::Storage {
            message: err.to_string(),
            hint: Some("Check file permissions and disk space".to_string()),
            source: Some(Box::new(err)),
        }
    }
}

impl From<serde_json::Error> for QueryPadError {
    fn from(err: serde_json::Error) -> Self {
        QueryPadError::Storage {
            message: format!("JSON error: {err}"),
            hint: Some("Data may be corrupted".to_string()),
            source: Some(Box::new(err)),
        }
    }
}

impl From<keyring::Error> for QueryPadError {
    fn from(err: keyring::Error) -> Self {
        QueryPadError::Keyring {
            message: err.to_string(),
            hint: Some("Grant QueryPad access in system preferences".to_string()),
        }
    }
}

impl From<russh::Error> for QueryPadError {
    fn from(err: russh::Error) -> Self {
        QueryPadError::tunnel_with_source(err.to_string(), err)
    }
}
