//! Connection orchestration.
//!
//! [`ConnectionService`] is the façade the UI boundary talks to. It sequences
//! the tunnel manager, the plugin registry and the adapters for every
//! user-facing action and flattens every failure into a [`Response`].
//!
//! Resource rules:
//! - a test never leaves a tunnel or adapter behind
//! - a failed connect tears down whatever it created before returning
//! - disconnect always attempts both tunnel close and instance removal

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use uuid::Uuid;

use crate::adapters::{postgres, qualified_table, AdapterInfo, DatabaseAdapter, PostgresAdapter};
use crate::error::{QueryPadError, Result};
use crate::models::{
    unit_response, ColumnInfo, ConnectionConfig, DatabaseInfo, IndexInfo, Pagination,
    PrimaryKeyValue, QueryResult, Response, RowValues, SchemaInfo, TableData, TableInfo,
};
use crate::services::registry::PluginRegistry;
use crate::services::tunnel::{TunnelManager, TunnelRequest};

/// A live connection as reported to the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveConnection {
    /// Connection id
    pub id: Uuid,
    /// Adapter serving the connection
    pub adapter_type: String,
    /// Local tunnel port when routed over SSH
    pub tunnel_port: Option<u16>,
}

/// Composes registry, tunnels and adapters for the UI boundary.
pub struct ConnectionService {
    registry: Arc<PluginRegistry>,
    tunnels: Arc<TunnelManager>,
    /// Serializes connect/disconnect per connection id.
    locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl ConnectionService {
    /// Create a service over an existing registry and tunnel manager.
    pub fn new(registry: Arc<PluginRegistry>, tunnels: Arc<TunnelManager>) -> Self {
        Self { registry, tunnels, locks: Mutex::new(HashMap::new()) }
    }

    /// Create a service with the built-in adapters registered.
    pub fn with_defaults() -> Result<Self> {
        let registry = PluginRegistry::new();
        registry.register(postgres::ADAPTER_TYPE, || {
            Arc::new(PostgresAdapter::new()) as Arc<dyn DatabaseAdapter>
        })?;
        Ok(Self::new(Arc::new(registry), Arc::new(TunnelManager::new())))
    }

    /// The underlying registry.
    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    /// The underlying tunnel manager.
    pub fn tunnels(&self) -> &Arc<TunnelManager> {
        &self.tunnels
    }

    // ========== Lifecycle ==========

    /// Probe a configuration without keeping anything open.
    ///
    /// The probe runs on a fresh adapter instance, so a live connection with
    /// the same id is not touched. A tunnel opened for the probe is always
    /// closed.
    pub async fn test_connection(
        &self,
        config: &ConnectionConfig,
        password: &str,
        ssh_password: Option<&str>,
    ) -> Response<()> {
        unit_response(self.run_test(config, password, ssh_password).await)
    }

    async fn run_test(
        &self,
        config: &ConnectionConfig,
        password: &str,
        ssh_password: Option<&str>,
    ) -> Result<()> {
        config.validate().map_err(QueryPadError::validation)?;
        let adapter = self.registry.build(&config.adapter_type)?;

        let probe_id = Uuid::new_v4();
        let result: Result<bool> = async {
            let target = self.open_route(probe_id, config, ssh_password).await?;
            Ok(adapter.test_connection(&target, password).await)
        }
        .await;
        self.tunnels.close_tunnel(probe_id).await;

        match result {
            Ok(true) => {
                tracing::info!(connection_id = %config.id, "Connection test succeeded");
                Ok(())
            }
            Ok(false) => Err(QueryPadError::connection(format!(
                "Connection test failed for {}",
                config.display_url()
            ))),
            Err(e) => Err(e),
        }
    }

    /// Open a connection for `config.id`, replacing any previous one.
    pub async fn connect(
        &self,
        config: &ConnectionConfig,
        password: &str,
        ssh_password: Option<&str>,
    ) -> Response<()> {
        let lock = self.lock_for(config.id);
        let result = {
            let _guard = lock.lock().await;
            self.connect_locked(config, password, ssh_password).await
        };
        if result.is_err() {
            self.forget_lock(config.id, lock);
        }
        unit_response(result)
    }

    async fn connect_locked(
        &self,
        config: &ConnectionConfig,
        password: &str,
        ssh_password: Option<&str>,
    ) -> Result<()> {
        config.validate().map_err(QueryPadError::validation)?;
        if !self.registry.is_registered(&config.adapter_type) {
            return Err(QueryPadError::unknown_adapter(&config.adapter_type));
        }

        let id = config.id;
        if self.registry.get_instance(id).is_some() || self.tunnels.has_tunnel(id) {
            tracing::debug!(connection_id = %id, "Closing previous connection before reconnect");
            if let Err(e) = self.release(id).await {
                tracing::warn!(connection_id = %id, error = %e, "Failed to close previous connection");
            }
        }

        tracing::info!(
            connection_id = %id,
            adapter_type = %config.adapter_type,
            target = %config.display_url(),
            "Connecting"
        );

        let result: Result<()> = async {
            let target = self.open_route(id, config, ssh_password).await?;
            let adapter = self.registry.create_instance(&config.adapter_type, id).await?;
            adapter.connect(&target, password).await
        }
        .await;

        match result {
            Ok(()) => {
                tracing::info!(connection_id = %id, "Connected");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(connection_id = %id, error = %e, "Connect failed; cleaning up");
                if let Err(cleanup) = self.release(id).await {
                    tracing::warn!(connection_id = %id, error = %cleanup, "Cleanup after failed connect failed");
                }
                Err(e)
            }
        }
    }

    /// Close the tunnel and drop the adapter for `id`. No-op when absent.
    pub async fn disconnect(&self, id: Uuid) -> Response<()> {
        let lock = self.lock_for(id);
        let result = {
            let _guard = lock.lock().await;
            self.release(id).await
        };
        self.forget_lock(id, lock);
        if result.is_ok() {
            tracing::info!(connection_id = %id, "Disconnected");
        }
        unit_response(result)
    }

    /// Disconnect everything and close every tunnel.
    pub async fn shutdown(&self) {
        tracing::info!(connections = self.registry.instance_ids().len(), "Shutting down connections");
        tokio::join!(self.registry.disconnect_all(), self.tunnels.close_all_tunnels());
    }

    /// Connections with a live adapter instance.
    pub fn active_connections(&self) -> Vec<ActiveConnection> {
        let mut active: Vec<ActiveConnection> = self
            .registry
            .instance_ids()
            .into_iter()
            .filter_map(|id| {
                let adapter = self.registry.get_instance(id)?;
                adapter.is_connected().then(|| ActiveConnection {
                    id,
                    adapter_type: adapter.info().adapter_type,
                    tunnel_port: self.tunnels.local_port(id),
                })
            })
            .collect();
        active.sort_by_key(|c| c.id);
        active
    }

    /// Adapters available for new connections.
    pub fn available_adapters(&self) -> Vec<AdapterInfo> {
        self.registry.available_adapters()
    }

    // ========== Introspection ==========

    pub async fn get_databases(&self, id: Uuid) -> Response<Vec<DatabaseInfo>> {
        self.with_adapter(id, |adapter| async move { adapter.get_databases().await }).await
    }

    pub async fn get_schemas(&self, id: Uuid, database: Option<&str>) -> Response<Vec<SchemaInfo>> {
        self.with_adapter(id, |adapter| async move { adapter.get_schemas(database).await }).await
    }

    pub async fn get_tables(&self, id: Uuid, schema: Option<&str>) -> Response<Vec<TableInfo>> {
        self.with_adapter(id, |adapter| async move { adapter.get_tables(schema).await }).await
    }

    pub async fn get_columns(
        &self,
        id: Uuid,
        table: &str,
        schema: Option<&str>,
    ) -> Response<Vec<ColumnInfo>> {
        self.with_adapter(id, |adapter| async move { adapter.get_columns(table, schema).await })
            .await
    }

    pub async fn get_indexes(
        &self,
        id: Uuid,
        table: &str,
        schema: Option<&str>,
    ) -> Response<Vec<IndexInfo>> {
        self.with_adapter(id, |adapter| async move { adapter.get_indexes(table, schema).await })
            .await
    }

    pub async fn get_primary_key(
        &self,
        id: Uuid,
        table: &str,
        schema: Option<&str>,
    ) -> Response<Vec<String>> {
        self.with_adapter(id, |adapter| async move { adapter.get_primary_key(table, schema).await })
            .await
    }

    // ========== Data ==========

    pub async fn get_table_data(
        &self,
        id: Uuid,
        table: &str,
        schema: Option<&str>,
        pagination: &Pagination,
    ) -> Response<TableData> {
        self.with_adapter(id, |adapter| async move {
            adapter.get_table_data(table, schema, pagination).await
        })
        .await
    }

    /// Run SQL with positional parameters.
    pub async fn query(&self, id: Uuid, sql: &str, params: &[Value]) -> Response<QueryResult> {
        self.with_adapter(id, |adapter| async move {
            let result = adapter.query(sql, params).await;
            if let Err(e) = &result {
                tracing::debug!(connection_id = %id, error = %e, "Query failed");
            }
            result
        })
        .await
    }

    pub async fn insert_row(
        &self,
        id: Uuid,
        table: &str,
        schema: Option<&str>,
        values: &RowValues,
    ) -> Response<u64> {
        self.with_adapter(id, |adapter| async move { adapter.insert_row(table, schema, values).await })
            .await
    }

    /// Update one row addressed by its full primary key.
    pub async fn update_row(
        &self,
        id: Uuid,
        table: &str,
        schema: Option<&str>,
        key: &PrimaryKeyValue,
        values: &RowValues,
    ) -> Response<u64> {
        self.with_adapter(id, |adapter| async move {
            check_row_key(adapter.as_ref(), table, schema, key).await?;
            adapter.update_row(table, schema, key, values).await
        })
        .await
    }

    /// Delete one row addressed by its full primary key.
    pub async fn delete_row(
        &self,
        id: Uuid,
        table: &str,
        schema: Option<&str>,
        key: &PrimaryKeyValue,
    ) -> Response<u64> {
        self.with_adapter(id, |adapter| async move {
            check_row_key(adapter.as_ref(), table, schema, key).await?;
            adapter.delete_row(table, schema, key).await
        })
        .await
    }

    // ========== Internals ==========

    fn lock_for(&self, id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        self.locks.lock().entry(id).or_default().clone()
    }

    /// Drop the lock entry for `id` once no other caller holds or awaits it.
    fn forget_lock(&self, id: Uuid, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.locks.lock();
        drop(lock);
        if locks.get(&id).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(&id);
        }
    }

    /// Resolve the config the adapter should dial, opening a tunnel under
    /// `tunnel_id` when SSH is enabled.
    async fn open_route(
        &self,
        tunnel_id: Uuid,
        config: &ConnectionConfig,
        ssh_password: Option<&str>,
    ) -> Result<ConnectionConfig> {
        let Some(ssh) = config.active_ssh() else {
            return Ok(config.clone());
        };

        let request = TunnelRequest {
            ssh,
            remote_host: &config.host,
            remote_port: config.port,
            secret: ssh_password,
        };
        let local_port = self.tunnels.create_tunnel(tunnel_id, &request).await?;
        Ok(config.through_tunnel(local_port))
    }

    /// Close the tunnel, then remove the instance. Both steps always run.
    async fn release(&self, id: Uuid) -> Result<()> {
        self.tunnels.close_tunnel(id).await;
        self.registry.remove_instance(id).await
    }

    async fn with_adapter<T, F, Fut>(&self, id: Uuid, op: F) -> Response<T>
    where
        F: FnOnce(Arc<dyn DatabaseAdapter>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match self.registry.get_instance(id) {
            Some(adapter) => op(adapter).await.into(),
            None => Err(QueryPadError::connection_not_found(id)).into(),
        }
    }
}

/// Refuse row mutations that cannot address exactly one row.
async fn check_row_key(
    adapter: &dyn DatabaseAdapter,
    table: &str,
    schema: Option<&str>,
    key: &PrimaryKeyValue,
) -> Result<()> {
    let pk_columns = adapter.get_primary_key(table, schema).await?;
    if pk_columns.is_empty() {
        return Err(QueryPadError::no_primary_key(qualified_table(table, schema)));
    }
    if let Some(missing) = pk_columns.iter().find(|c| !key.contains_key(*c)) {
        return Err(QueryPadError::validation(format!(
            "Primary key value for column \"{missing}\" is missing"
        )));
    }
    if let Some(extra) = key.keys().find(|k| !pk_columns.contains(k)) {
        return Err(QueryPadError::validation(format!(
            "Column \"{extra}\" is not part of the primary key"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SshConfig;
    use crate::services::testing::{
        wait_until, MockAdapter, TestSshServer, SSH_PASSWORD, WRONG_SECRET,
    };
    use serde_json::json;
    use std::collections::BTreeMap;

    fn service_with(factory: fn() -> MockAdapter) -> ConnectionService {
        let registry = PluginRegistry::new();
        registry
            .register("mock", move || Arc::new(factory()) as Arc<dyn DatabaseAdapter>)
            .unwrap();
        ConnectionService::new(Arc::new(registry), Arc::new(TunnelManager::new()))
    }

    fn service() -> ConnectionService {
        service_with(MockAdapter::new)
    }

    type Created = Arc<parking_lot::Mutex<Vec<Arc<MockAdapter>>>>;

    /// Service whose factory keeps a handle on every instance it builds.
    fn recording_service(factory: fn() -> MockAdapter) -> (ConnectionService, Created) {
        let created: Created = Arc::default();
        let registry = PluginRegistry::new();
        let sink = created.clone();
        registry
            .register("mock", move || {
                let adapter = Arc::new(factory());
                sink.lock().push(adapter.clone());
                adapter as Arc<dyn DatabaseAdapter>
            })
            .unwrap();
        (ConnectionService::new(Arc::new(registry), Arc::new(TunnelManager::new())), created)
    }

    #[tokio::test]
    async fn test_connect_then_query() {
        let service = service();
        let config = MockAdapter::config();

        assert!(service.connect(&config, "pw", None).await.is_ok());
        let result = service.query(config.id, "SELECT 1", &[]).await;
        assert!(result.is_ok());
        assert_eq!(result.data.unwrap().rows[0][0], json!(1));

        let active = service.active_connections();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, config.id);
        assert_eq!(active[0].adapter_type, "mock");
        assert_eq!(active[0].tunnel_port, None);
    }

    #[tokio::test]
    async fn test_failed_connect_leaves_nothing_behind() {
        let service = service();
        let config = MockAdapter::config();

        let response = service.connect(&config, WRONG_SECRET, None).await;
        assert!(!response.success);
        assert!(response.error.unwrap().contains("password authentication failed"));
        assert!(service.registry().get_instance(config.id).is_none());
        assert_eq!(service.tunnels().tunnel_count(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_ssh_connect_leaves_nothing_behind() {
        let service = service();
        let config = MockAdapter::config()
            .with_ssh(SshConfig::new("127.0.0.1", "deploy").with_port(1));

        let response = service.connect(&config, "pw", Some("ssh-pw")).await;
        assert!(!response.success);
        assert!(service.registry().get_instance(config.id).is_none());
        assert_eq!(service.tunnels().tunnel_count(), 0);
    }

    #[tokio::test]
    async fn test_ssh_connection_owns_its_tunnel() {
        let server = TestSshServer::start().await;
        let service = service();
        let config = MockAdapter::config().with_ssh(server.ssh_config());

        assert!(service.connect(&config, "pw", Some(SSH_PASSWORD)).await.is_ok());
        let active = service.active_connections();
        assert!(active[0].tunnel_port.is_some());
        assert_eq!(active[0].tunnel_port, service.tunnels().local_port(config.id));

        // The test tunnel is closed again; the live one stays
        assert!(service.test_connection(&config, "pw", Some(SSH_PASSWORD)).await.is_ok());
        assert_eq!(service.tunnels().tunnel_count(), 1);
        assert!(wait_until(|| server.live_sessions() == 1).await);

        assert!(service.disconnect(config.id).await.is_ok());
        assert_eq!(service.tunnels().tunnel_count(), 0);
        assert!(wait_until(|| server.live_sessions() == 0).await);
    }

    #[tokio::test]
    async fn test_ssh_connect_failure_after_tunnel_closes_it() {
        let server = TestSshServer::start().await;
        let service = service();
        let config = MockAdapter::config().with_ssh(server.ssh_config());

        let response = service.connect(&config, WRONG_SECRET, Some(SSH_PASSWORD)).await;
        assert!(!response.success);
        assert_eq!(service.tunnels().tunnel_count(), 0);
        assert!(service.registry().get_instance(config.id).is_none());
        assert!(wait_until(|| server.live_sessions() == 0).await);
    }

    #[tokio::test]
    async fn test_ssh_without_credentials_fails_before_adapter() {
        let service = service();
        let config =
            MockAdapter::config().with_ssh(SshConfig::new("bastion.invalid", "deploy"));

        let response = service.connect(&config, "pw", None).await;
        assert!(!response.success);
        assert!(response.error.unwrap().starts_with("SSH auth error"));
        assert!(service.registry().instance_ids().is_empty());
    }

    #[tokio::test]
    async fn test_test_connection_does_not_touch_live_instance() {
        let (service, created) = recording_service(MockAdapter::new);
        let config = MockAdapter::config();
        assert!(service.connect(&config, "pw", None).await.is_ok());
        let live = service.registry().get_instance(config.id).unwrap();

        let failed = service.test_connection(&config, WRONG_SECRET, None).await;
        assert!(!failed.success);
        assert!(failed.error.unwrap().contains("Connection test failed"));
        assert!(service.test_connection(&config, "pw", None).await.is_ok());

        assert!(live.is_connected());
        assert!(Arc::ptr_eq(&live, &service.registry().get_instance(config.id).unwrap()));
        assert_eq!(service.registry().instance_ids(), vec![config.id]);

        // Each test ran on its own fresh instance
        let created = created.lock();
        assert_eq!(created.len(), 3);
        assert_eq!(created[0].probe_count(), 0);
        assert_eq!(created[1].probe_count(), 1);
        assert_eq!(created[2].probe_count(), 1);
    }

    #[tokio::test]
    async fn test_test_connection_rejects_invalid_config() {
        let service = service();
        let mut config = MockAdapter::config();
        config.host.clear();

        let response = service.test_connection(&config, "pw", None).await;
        assert!(!response.success);
        assert!(response.error.unwrap().starts_with("Validation error"));
    }

    #[tokio::test]
    async fn test_unknown_adapter_type() {
        let service = service();
        let mut config = MockAdapter::config();
        config.adapter_type = "oracle".to_string();

        let response = service.connect(&config, "pw", None).await;
        assert_eq!(response.error.as_deref(), Some("Unknown adapter: oracle"));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let service = service();
        let config = MockAdapter::config();
        assert!(service.connect(&config, "pw", None).await.is_ok());
        let live = service.registry().get_instance(config.id).unwrap();

        assert!(service.disconnect(config.id).await.is_ok());
        assert!(!live.is_connected());
        assert!(service.disconnect(config.id).await.is_ok());
        assert!(service.active_connections().is_empty());
    }

    #[tokio::test]
    async fn test_reconnect_replaces_previous_instance() {
        let service = service();
        let config = MockAdapter::config();
        assert!(service.connect(&config, "pw", None).await.is_ok());
        let first = service.registry().get_instance(config.id).unwrap();

        assert!(service.connect(&config, "pw", None).await.is_ok());
        let second = service.registry().get_instance(config.id).unwrap();

        assert!(!first.is_connected());
        assert!(second.is_connected());
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_operations_on_unknown_connection() {
        let service = service();
        let id = Uuid::new_v4();

        let response = service.get_tables(id, None).await;
        assert!(!response.success);
        assert_eq!(response.error.unwrap(), format!("Connection not found: {id}"));
    }

    #[tokio::test]
    async fn test_mutation_refused_without_primary_key() {
        let (service, created) = recording_service(MockAdapter::without_primary_key);
        let config = MockAdapter::config();
        assert!(service.connect(&config, "pw", None).await.is_ok());

        let key: PrimaryKeyValue = BTreeMap::from([("id".to_string(), json!(1))]);
        let values: RowValues = BTreeMap::from([("name".to_string(), json!("b"))]);

        let update = service.update_row(config.id, "logs", None, &key, &values).await;
        assert!(!update.success);
        assert!(update.error.unwrap().contains("has no primary key"));

        let delete = service.delete_row(config.id, "logs", None, &key).await;
        assert!(!delete.success);

        assert_eq!(created.lock()[0].mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_mutation_requires_full_key() {
        let service = service();
        let config = MockAdapter::config();
        assert!(service.connect(&config, "pw", None).await.is_ok());

        let values: RowValues = BTreeMap::from([("name".to_string(), json!("b"))]);
        let wrong_key: PrimaryKeyValue = BTreeMap::from([("name".to_string(), json!("a"))]);
        let response = service.update_row(config.id, "users", None, &wrong_key, &values).await;
        assert!(!response.success);
        assert!(response.error.unwrap().contains("\"id\" is missing"));

        let key: PrimaryKeyValue = BTreeMap::from([("id".to_string(), json!(5))]);
        let response = service.update_row(config.id, "users", None, &key, &values).await;
        assert_eq!(response.data, Some(1));
    }

    #[tokio::test]
    async fn test_rejected_key_never_reaches_adapter() {
        let (service, created) = recording_service(MockAdapter::new);
        let config = MockAdapter::config();
        assert!(service.connect(&config, "pw", None).await.is_ok());

        let extra: PrimaryKeyValue =
            BTreeMap::from([("id".to_string(), json!(1)), ("name".to_string(), json!("a"))]);
        let response = service.delete_row(config.id, "users", None, &extra).await;
        assert!(response.error.unwrap().contains("\"name\" is not part of the primary key"));
        assert_eq!(created.lock()[0].mutation_count(), 0);

        let key: PrimaryKeyValue = BTreeMap::from([("id".to_string(), json!(1))]);
        assert_eq!(service.delete_row(config.id, "users", None, &key).await.data, Some(1));
        assert_eq!(created.lock()[0].mutation_count(), 1);
    }

    #[tokio::test]
    async fn test_lock_entries_do_not_outlive_connections() {
        let service = service();
        let config = MockAdapter::config();

        assert!(service.connect(&config, "pw", None).await.is_ok());
        assert_eq!(service.locks.lock().len(), 1);
        assert!(service.disconnect(config.id).await.is_ok());
        assert!(service.locks.lock().is_empty());

        assert!(!service.connect(&config, WRONG_SECRET, None).await.success);
        assert!(service.locks.lock().is_empty());

        // Disconnecting an id that never connected leaves nothing either
        assert!(service.disconnect(Uuid::new_v4()).await.is_ok());
        assert!(service.locks.lock().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_disconnects_everything() {
        let service = service();
        for _ in 0..3 {
            let mut config = MockAdapter::config();
            config.id = Uuid::new_v4();
            assert!(service.connect(&config, "pw", None).await.is_ok());
        }
        assert_eq!(service.active_connections().len(), 3);

        service.shutdown().await;
        assert!(service.active_connections().is_empty());
        assert!(service.registry().instance_ids().is_empty());
    }

    #[test]
    fn test_with_defaults_registers_postgres() {
        let service = ConnectionService::with_defaults().unwrap();
        let adapters = service.available_adapters();
        assert_eq!(adapters.len(), 1);
        assert_eq!(adapters[0].adapter_type, "postgres");
    }
}
