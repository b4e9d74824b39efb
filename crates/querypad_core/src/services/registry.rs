//! Adapter factories and live adapter instances.
//!
//! Factories are registered once per adapter type. Instances are keyed by
//! connection id, at most one per id.

use futures_util::future::join_all;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::adapters::{AdapterFactory, AdapterInfo, DatabaseAdapter};
use crate::error::{QueryPadError, Result};

/// A registered adapter type.
struct Registration {
    factory: AdapterFactory,
    info: AdapterInfo,
}

/// Maps adapter types to factories and connection ids to instances.
#[derive(Default)]
pub struct PluginRegistry {
    factories: RwLock<HashMap<String, Registration>>,
    instances: RwLock<HashMap<Uuid, Arc<dyn DatabaseAdapter>>>,
}

impl PluginRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under `adapter_type`.
    ///
    /// Registration is one-time; a second registration of the same type fails.
    pub fn register<F>(&self, adapter_type: &str, factory: F) -> Result<()>
    where
        F: Fn() -> Arc<dyn DatabaseAdapter> + Send + Sync + 'static,
    {
        let mut factories = self.factories.write();
        if factories.contains_key(adapter_type) {
            return Err(QueryPadError::duplicate_adapter(adapter_type));
        }

        let factory: AdapterFactory = Arc::new(factory);
        let info = factory().info();
        factories.insert(adapter_type.to_string(), Registration { factory, info });

        tracing::debug!(adapter_type, "Adapter registered");
        Ok(())
    }

    /// Whether `adapter_type` has a factory.
    pub fn is_registered(&self, adapter_type: &str) -> bool {
        self.factories.read().contains_key(adapter_type)
    }

    /// Descriptors of all registered adapters, sorted by type.
    pub fn available_adapters(&self) -> Vec<AdapterInfo> {
        let mut adapters: Vec<AdapterInfo> =
            self.factories.read().values().map(|r| r.info.clone()).collect();
        adapters.sort_by(|a, b| a.adapter_type.cmp(&b.adapter_type));
        adapters
    }

    /// Build an unregistered instance, e.g. for a one-off connection test.
    pub fn build(&self, adapter_type: &str) -> Result<Arc<dyn DatabaseAdapter>> {
        let factory = self
            .factories
            .read()
            .get(adapter_type)
            .map(|r| r.factory.clone())
            .ok_or_else(|| QueryPadError::unknown_adapter(adapter_type))?;
        Ok(factory())
    }

    /// Create a fresh instance for `connection_id`.
    ///
    /// A previous instance under the same id is disconnected and replaced.
    pub async fn create_instance(
        &self,
        adapter_type: &str,
        connection_id: Uuid,
    ) -> Result<Arc<dyn DatabaseAdapter>> {
        let instance = self.build(adapter_type)?;
        let previous = self.instances.write().insert(connection_id, instance.clone());

        if let Some(previous) = previous {
            tracing::warn!(
                connection_id = %connection_id,
                adapter_type,
                "Replacing live adapter instance"
            );
            if let Err(e) = previous.disconnect().await {
                tracing::warn!(connection_id = %connection_id, error = %e, "Failed to disconnect replaced instance");
            }
        }

        Ok(instance)
    }

    /// Look up the instance for `connection_id`.
    pub fn get_instance(&self, connection_id: Uuid) -> Option<Arc<dyn DatabaseAdapter>> {
        self.instances.read().get(&connection_id).cloned()
    }

    /// Disconnect and drop the instance for `connection_id`. No-op when absent.
    pub async fn remove_instance(&self, connection_id: Uuid) -> Result<()> {
        let instance = self.instances.write().remove(&connection_id);
        match instance {
            Some(instance) if instance.is_connected() => instance.disconnect().await,
            _ => Ok(()),
        }
    }

    /// Ids with a live instance.
    pub fn instance_ids(&self) -> Vec<Uuid> {
        self.instances.read().keys().copied().collect()
    }

    /// Disconnect every instance concurrently, then clear the map.
    pub async fn disconnect_all(&self) {
        let instances: Vec<(Uuid, Arc<dyn DatabaseAdapter>)> =
            self.instances.read().iter().map(|(id, i)| (*id, i.clone())).collect();

        let results = join_all(
            instances
                .iter()
                .filter(|(_, instance)| instance.is_connected())
                .map(|(id, instance)| async move { (*id, instance.disconnect().await) }),
        )
        .await;

        for (id, result) in results {
            if let Err(e) = result {
                tracing::warn!(connection_id = %id, error = %e, "Failed to disconnect adapter");
            }
        }

        self.instances.write().clear();
    }
}
