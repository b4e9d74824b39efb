//! Service layer for the QueryPad core.
//!
//! - `connection` - Orchestration façade used by the UI boundary
//! - `registry` - Adapter factories and live instances
//! - `tunnel` - SSH local port forwarding per connection
//! - `credentials` - Secret vault (file, keychain or session)
//! - `storage` - SQLite-backed saved connection list

pub mod connection;
pub mod credentials;
pub mod registry;
pub mod storage;
pub mod tunnel;

#[cfg(test)]
pub(crate) mod testing;

pub use connection::{ActiveConnection, ConnectionService};
pub use credentials::{CredentialService, SecretKind};
pub use registry::PluginRegistry;
pub use storage::{ConnectionStore, LocalStorage};
pub use tunnel::{TunnelManager, TunnelRequest};
