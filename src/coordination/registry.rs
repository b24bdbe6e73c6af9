//! Named connection registry.
//!
//! At most one [`Connection`] exists per logical name.  Entries are created on
//! first lookup, reused afterwards, and removed by [`ConnectionRegistry::destroy`].

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use super::connection::Connection;
use crate::config::StoreSettings;
use crate::error::{Error, Result};
use crate::store::Connector;

pub struct ConnectionRegistry {
    connector: Arc<dyn Connector>,
    connections: Mutex<HashMap<String, Arc<Connection>>>,
}

impl ConnectionRegistry {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// The connection for the name `settings` resolves to, created if absent.
    pub fn connection(&self, settings: &StoreSettings) -> Result<Arc<Connection>> {
        let (name, config) = settings.resolve()?;
        let mut connections = self.connections.lock();
        let connection = connections.entry(name.clone()).or_insert_with(|| {
            debug!(connection = %name, "creating connection");
            Connection::new(
                name.clone(),
                config,
                settings.migration.clone(),
                Arc::clone(&self.connector),
            )
        });
        Ok(Arc::clone(connection))
    }

    /// Tear down the named connection and drop it from the registry.  The
    /// next lookup builds a fresh one.
    pub async fn destroy(&self, settings: &StoreSettings) -> Result<()> {
        let (name, _) = settings.resolve()?;
        let connection = self
            .connections
            .lock()
            .remove(&name)
            .ok_or_else(|| Error::Config(format!("No connection found: {name}")))?;
        connection.teardown().await;
        info!(connection = %name, "connection destroyed");
        Ok(())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.connections.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::store::memory::{MemoryBackend, MemoryConnector};

    fn registry() -> (ConnectionRegistry, Arc<MemoryConnector>) {
        let connector = MemoryConnector::new(MemoryBackend::new(), MemoryBackend::new());
        (ConnectionRegistry::new(connector.clone()), connector)
    }

    #[test]
    fn lookup_reuses_connection_by_name() {
        let (registry, _) = registry();
        let settings = StoreSettings::direct("localhost", 6379);
        let a = registry.connection(&settings).unwrap();
        let b = registry.connection(&settings).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.name(), "default");
        assert_eq!(registry.names(), vec!["default"]);
    }

    #[test]
    fn named_settings_select_entry() {
        let (registry, _) = registry();
        let mut settings = StoreSettings::default();
        settings.connection_settings.insert(
            "cache".into(),
            ConnectionConfig {
                host: Some("cache.local".into()),
                ..ConnectionConfig::default()
            },
        );
        settings.use_connection = Some("cache".into());
        let conn = registry.connection(&settings).unwrap();
        assert_eq!(conn.name(), "cache");

        settings.use_connection = Some("missing".into());
        assert!(matches!(registry.connection(&settings), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn destroy_tears_down_and_forgets() {
        let (registry, connector) = registry();
        let settings = StoreSettings::direct("localhost", 6379);
        let first = registry.connection(&settings).unwrap();
        first.establish().await.unwrap();

        registry.destroy(&settings).await.unwrap();
        assert!(!first.is_ready());
        assert!(registry.names().is_empty());

        let second = registry.connection(&settings).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        second.establish().await.unwrap();
        assert_eq!(connector.opened(), 4);
    }

    #[tokio::test]
    async fn destroy_unknown_connection_errors() {
        let (registry, _) = registry();
        let err = registry
            .destroy(&StoreSettings::direct("localhost", 6379))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("No connection found"));
    }
}
