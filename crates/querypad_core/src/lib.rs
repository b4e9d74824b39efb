//! Core of the QueryPad database client.
//!
//! - **adapters**: The adapter contract and the PostgreSQL adapter
//! - **services**: Orchestration, plugin registry, SSH tunnels, credentials, storage
//! - **models**: Connection configs, introspection records, query results
//! - **error**: Error handling with PostgreSQL-specific details
//! - **state**: Application state held by the UI shell
//! - **logging**: Structured logging setup

pub mod adapters;
pub mod error;
pub mod logging;
pub mod models;
pub mod services;
pub mod state;


pub use adapters::{AdapterInfo, DatabaseAdapter, PostgresAdapter};
pub use error::{QueryPadError, Result};
pub use models::{ConnectionConfig, Pagination, QueryResult, Response, SshConfig, TableData};
pub use services::{ConnectionService, CredentialService, PluginRegistry, TunnelManager};
pub use state::AppState;
