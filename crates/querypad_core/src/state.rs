//! Application state.
//!
//! [`AppState`] owns the runtime, the saved connection store, the credential
//! vault and the [`ConnectionService`]. The UI shell holds one instance and
//! calls into it from its command handlers.

use std::future::Future;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::{QueryPadError, Result};
use crate::models::{unit_response, ConnectionConfig, Response};
use crate::services::storage::{default_data_dir, init_data_dir};
use crate::services::{
    ConnectionService, ConnectionStore, CredentialService, LocalStorage, SecretKind,
};

/// Central application state.
pub struct AppState {
    storage: Box<dyn ConnectionStore>,
    credentials: CredentialService,
    connections: ConnectionService,
    data_dir: PathBuf,
    runtime: tokio::runtime::Runtime,
}

impl AppState {
    /// State rooted at the default data directory for this build.
    pub fn new() -> Result<Self> {
        Self::with_data_dir(default_data_dir())
    }

    /// State rooted at `data_dir`.
    pub fn with_data_dir(data_dir: PathBuf) -> Result<Self> {
        init_data_dir(&data_dir)?;
        let storage = LocalStorage::open(data_dir.clone())?;
        let credentials = CredentialService::for_data_dir(&data_dir);
        Self::from_parts(data_dir, Box::new(storage), credentials, ConnectionService::with_defaults()?)
    }

    /// Assemble state from explicit parts.
    pub fn from_parts(
        data_dir: PathBuf,
        storage: Box<dyn ConnectionStore>,
        credentials: CredentialService,
        connections: ConnectionService,
    ) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .map_err(|e| QueryPadError::internal(format!("Failed to create tokio runtime: {e}")))?;

        tracing::info!(data_dir = %data_dir.display(), "QueryPad state initialized");
        Ok(Self { storage, credentials, connections, data_dir, runtime })
    }

    pub fn connections(&self) -> &ConnectionService {
        &self.connections
    }

    pub fn credentials(&self) -> &CredentialService {
        &self.credentials
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Spawn work on the database runtime.
    pub fn spawn<F, T>(&self, future: F) -> tokio::task::JoinHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.runtime.spawn(future)
    }

    /// Run a future to completion. Not for use from inside the runtime.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    // ========== Saved connections ==========

    pub fn load_connections(&self) -> Response<Vec<ConnectionConfig>> {
        self.storage.load_all().into()
    }

    pub fn save_connections(&self, connections: &[ConnectionConfig]) -> Response<()> {
        unit_response(self.storage.save_all(connections))
    }

    // ========== Credentials ==========

    /// Store the database password and, when given, the SSH secret.
    pub fn save_credentials(
        &self,
        connection_id: Uuid,
        password: &str,
        ssh_password: Option<&str>,
    ) -> Response<()> {
        let result = self
            .credentials
            .set_secret(connection_id, SecretKind::Database, password)
            .and_then(|()| match ssh_password {
                Some(secret) => self.credentials.set_secret(connection_id, SecretKind::Ssh, secret),
                None => Ok(()),
            });
        unit_response(result)
    }

    pub fn get_credential(&self, connection_id: Uuid, kind: SecretKind) -> Response<Option<String>> {
        self.credentials.get_secret(connection_id, kind).into()
    }

    pub fn delete_credentials(&self, connection_id: Uuid) -> Response<()> {
        unit_response(self.credentials.delete_secrets(connection_id))
    }

    // ========== Connection lifecycle with stored secrets ==========

    /// Connect using the secrets stored for `config.id`.
    pub async fn connect_saved(&self, config: &ConnectionConfig) -> Response<()> {
        match self.stored_secrets(config.id) {
            Ok((password, ssh_password)) => {
                self.connections.connect(config, &password, ssh_password.as_deref()).await
            }
            Err(e) => Response::failure(e.to_string()),
        }
    }

    /// Test using the secrets stored for `config.id`.
    pub async fn test_saved(&self, config: &ConnectionConfig) -> Response<()> {
        match self.stored_secrets(config.id) {
            Ok((password, ssh_password)) => {
                self.connections.test_connection(config, &password, ssh_password.as_deref()).await
            }
            Err(e) => Response::failure(e.to_string()),
        }
    }

    fn stored_secrets(&self, connection_id: Uuid) -> Result<(String, Option<String>)> {
        let password =
            self.credentials.get_secret(connection_id, SecretKind::Database)?.unwrap_or_default();
        let ssh_password = self.credentials.get_secret(connection_id, SecretKind::Ssh)?;
        Ok((password, ssh_password))
    }

    /// Disconnect everything and close all tunnels.
    pub fn shutdown(&self) {
        self.runtime.block_on(self.connections.shutdown());
        tracing::info!("QueryPad state shut down");
    }
}
