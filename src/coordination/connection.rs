//! Paired store sessions for one logical connection name.
//!
//! A [`Connection`] owns a read/write `client` session and a pub/sub
//! `subscriber` session, plus a `replica` session while migration is enabled.
//! Concurrent `establish()` calls coalesce into one in-flight attempt; the
//! same holds for `teardown()`.  Either both primary sessions are present or
//! neither is.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::{ConnectionConfig, Discovery, MigrationConfig};
use crate::error::{Error, Result};
use crate::store::{Connector, SessionRole, SessionTarget, Store};

#[derive(Default)]
struct Sessions {
    client: Option<Arc<dyn Store>>,
    subscriber: Option<Arc<dyn Store>>,
    replica: Option<Arc<dyn Store>>,
}

impl Sessions {
    fn into_open(self) -> Vec<(SessionRole, Arc<dyn Store>)> {
        [
            (SessionRole::Client, self.client),
            (SessionRole::Subscriber, self.subscriber),
            (SessionRole::Replica, self.replica),
        ]
        .into_iter()
        .filter_map(|(role, session)| session.map(|s| (role, s)))
        .collect()
    }
}

#[derive(Default)]
struct State {
    sessions: Sessions,
    ready_listeners: Vec<oneshot::Sender<Result<()>>>,
    teardown_listeners: Vec<oneshot::Sender<()>>,
}

pub struct Connection {
    name: String,
    config: ConnectionConfig,
    migration: MigrationConfig,
    connector: Arc<dyn Connector>,
    state: Mutex<State>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.name)
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl Connection {
    pub fn new(
        name: impl Into<String>,
        config: ConnectionConfig,
        migration: MigrationConfig,
        connector: Arc<dyn Connector>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            config,
            migration,
            connector,
            state: Mutex::new(State::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sentinel discovery when the descriptor names a master or lists
    /// sentinels, direct addressing otherwise.
    pub fn discovery(&self) -> Result<Discovery> {
        self.config.discovery()
    }

    /// Resolve once every session is open.
    ///
    /// Returns immediately when already ready.  The first caller starts the
    /// attempt; later callers queue behind it and all of them observe the same
    /// outcome, including a failure.
    pub async fn establish(self: &Arc<Self>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let first = {
            let mut state = self.state.lock();
            if sessions_ready(&state.sessions) {
                return Ok(());
            }
            state.ready_listeners.push(tx);
            state.ready_listeners.len() == 1
        };

        if first {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.run_establish().await });
        } else {
            debug!(connection = %self.name, "establish already in flight, queued");
        }

        rx.await
            .unwrap_or_else(|_| Err(Error::Canceled(format!("establish {}", self.name))))
    }

    async fn run_establish(self: Arc<Self>) {
        let opened = self.open_sessions().await;
        let (outcome, listeners) = {
            let mut state = self.state.lock();
            let outcome = opened.map(|sessions| state.sessions = sessions);
            (outcome, std::mem::take(&mut state.ready_listeners))
        };

        match &outcome {
            Ok(()) => info!(connection = %self.name, listeners = listeners.len(), "connection ready"),
            Err(e) => error!(connection = %self.name, error = %e, "connection failed to establish"),
        }
        for listener in listeners {
            let _ = listener.send(outcome.clone());
        }
    }

    fn target(&self) -> Result<SessionTarget> {
        Ok(SessionTarget {
            discovery: self.discovery()?,
            password: self.config.auth_secret(),
            tls: self.config.tls,
        })
    }

    fn replica_target(&self) -> Result<Option<SessionTarget>> {
        if !self.migration.enabled {
            return Ok(None);
        }
        let replica = self.migration.replica.as_ref().ok_or_else(|| {
            Error::Config("migration is enabled but no replica is configured".to_string())
        })?;
        let discovery = replica.discovery()?;
        if !matches!(discovery, Discovery::Direct { .. }) {
            return Err(Error::Config(
                "migration replica must be a direct host/port address".to_string(),
            ));
        }
        Ok(Some(SessionTarget {
            discovery,
            password: replica.auth_secret(),
            tls: replica.tls,
        }))
    }

    /// Open every session in parallel.  A failure closes whatever did open.
    async fn open_sessions(&self) -> Result<Sessions> {
        let target = self.target()?;
        let replica_target = self.replica_target()?;

        match &target.discovery {
            Discovery::Direct { host, port } => {
                info!(connection = %self.name, %host, port, "connecting to store")
            }
            Discovery::Sentinel { master, sentinels } => info!(
                connection = %self.name,
                %master,
                sentinels = sentinels.len(),
                "connecting to store through sentinel"
            ),
        }

        let (client, subscriber, replica) = tokio::join!(
            self.connector.open(&target, SessionRole::Client),
            self.connector.open(&target, SessionRole::Subscriber),
            async {
                match &replica_target {
                    Some(t) => self.connector.open(t, SessionRole::Replica).await.map(Some),
                    None => Ok(None),
                }
            }
        );

        match (client, subscriber, replica) {
            (Ok(client), Ok(subscriber), Ok(replica)) => Ok(Sessions {
                client: Some(client),
                subscriber: Some(subscriber),
                replica,
            }),
            (client, subscriber, replica) => {
                let mut failure = None;
                for result in [client.map(Some), subscriber.map(Some), replica] {
                    match result {
                        Ok(Some(session)) => {
                            if let Err(e) = session.quit().await {
                                warn!(connection = %self.name, error = %e, "quit after failed establish");
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            failure.get_or_insert(e);
                        }
                    }
                }
                Err(failure.unwrap_or_else(|| {
                    Error::Canceled(format!("establish {}", self.name))
                }))
            }
        }
    }

    /// Client and subscriber both present and reporting ready.
    pub fn is_ready(&self) -> bool {
        sessions_ready(&self.state.lock().sessions)
    }

    /// Quit every open session and forget it.  Concurrent calls coalesce.
    pub async fn teardown(self: &Arc<Self>) {
        let (tx, rx) = oneshot::channel();
        let first = {
            let mut state = self.state.lock();
            state.teardown_listeners.push(tx);
            state.teardown_listeners.len() == 1
        };

        if first {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.run_teardown().await });
        }
        let _ = rx.await;
    }

    async fn run_teardown(self: Arc<Self>) {
        let sessions = std::mem::take(&mut self.state.lock().sessions);

        let mut quits = JoinSet::new();
        for (role, session) in sessions.into_open() {
            if !session.is_ready() {
                debug!(connection = %self.name, %role, "session already closed");
                continue;
            }
            quits.spawn(async move { (role, session.quit().await) });
        }
        while let Some(joined) = quits.join_next().await {
            match joined {
                Ok((role, Err(e))) => {
                    warn!(connection = %self.name, %role, error = %e, "session quit failed")
                }
                Ok((_, Ok(()))) => {}
                Err(e) => error!(connection = %self.name, error = %e, "quit task panicked"),
            }
        }

        let listeners = std::mem::take(&mut self.state.lock().teardown_listeners);
        info!(connection = %self.name, listeners = listeners.len(), "connection torn down");
        for listener in listeners {
            let _ = listener.send(());
        }
    }

    pub fn client(&self) -> Option<Arc<dyn Store>> {
        self.state.lock().sessions.client.clone()
    }

    pub fn subscriber(&self) -> Option<Arc<dyn Store>> {
        self.state.lock().sessions.subscriber.clone()
    }

    pub fn replica_client(&self) -> Option<Arc<dyn Store>> {
        self.state.lock().sessions.replica.clone()
    }
}

fn sessions_ready(sessions: &Sessions) -> bool {
    match (&sessions.client, &sessions.subscriber) {
        (Some(client), Some(subscriber)) => client.is_ready() && subscriber.is_ready(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::Endpoint;
    use crate::store::memory::{MemoryBackend, MemoryConnector};
    use crate::store::StoreExt;

    fn direct() -> ConnectionConfig {
        ConnectionConfig {
            host: Some("localhost".into()),
            port: Some(6379),
            ..ConnectionConfig::default()
        }
    }

    fn migrating() -> MigrationConfig {
        MigrationConfig {
            enabled: true,
            read_from_replica: false,
            replica: Some(ConnectionConfig {
                host: Some("replica.local".into()),
                port: Some(6390),
                ..ConnectionConfig::default()
            }),
        }
    }

    fn connector() -> Arc<MemoryConnector> {
        MemoryConnector::new(MemoryBackend::new(), MemoryBackend::new())
    }

    #[test]
    fn sentinel_selected_by_master_id() {
        let config = ConnectionConfig {
            id: Some("mymaster".into()),
            sentinels: vec![Endpoint {
                host: "localhost".into(),
                port: 26379,
            }],
            ..ConnectionConfig::default()
        };
        let conn = Connection::new("sentinel", config, MigrationConfig::default(), connector());
        assert!(matches!(conn.discovery(), Ok(Discovery::Sentinel { .. })));

        let conn = Connection::new("redis", direct(), MigrationConfig::default(), connector());
        assert!(matches!(conn.discovery(), Ok(Discovery::Direct { .. })));
    }

    #[tokio::test]
    async fn concurrent_establish_opens_sessions_once() {
        let connector = connector();
        connector.set_open_delay(Some(Duration::from_millis(20)));
        let conn = Connection::new("default", direct(), MigrationConfig::default(), connector.clone());

        let (a, b, c) = tokio::join!(conn.establish(), conn.establish(), conn.establish());
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert!(conn.is_ready());
        assert_eq!(connector.opened(), 2);

        conn.establish().await.unwrap();
        assert_eq!(connector.opened(), 2);
    }

    #[tokio::test]
    async fn migration_opens_replica_session() {
        let connector = connector();
        let conn = Connection::new("default", direct(), migrating(), connector.clone());
        conn.establish().await.unwrap();
        assert_eq!(connector.opened(), 3);

        let replica = conn.replica_client().unwrap();
        replica.set_nx_ex("k", "v", 60).await.unwrap();
        assert!(connector.replica().exists("k"));
        assert!(!connector.primary().exists("k"));
    }

    #[tokio::test]
    async fn failed_session_reaches_every_listener() {
        let connector = connector();
        connector.set_open_delay(Some(Duration::from_millis(20)));
        connector.fail_role(SessionRole::Subscriber);
        let conn = Connection::new("default", direct(), MigrationConfig::default(), connector.clone());

        let (a, b) = tokio::join!(conn.establish(), conn.establish());
        assert!(matches!(a, Err(Error::Transport { .. })));
        assert_eq!(a, b);
        assert!(!conn.is_ready());
        assert!(conn.client().is_none());
        assert!(conn.subscriber().is_none());

        connector.clear_failures();
        conn.establish().await.unwrap();
        assert!(conn.is_ready());
    }

    #[tokio::test]
    async fn invalid_sentinel_config_fails_establish() {
        let config = ConnectionConfig {
            id: Some("mymaster".into()),
            ..ConnectionConfig::default()
        };
        let connector = connector();
        let conn = Connection::new("sentinel", config, MigrationConfig::default(), connector.clone());
        assert!(matches!(conn.establish().await, Err(Error::Config(_))));
        assert_eq!(connector.opened(), 0);
    }

    #[tokio::test]
    async fn sentinel_replica_is_rejected() {
        let migration = MigrationConfig {
            replica: Some(ConnectionConfig {
                id: Some("mymaster".into()),
                sentinels: vec![crate::config::Endpoint {
                    host: "localhost".into(),
                    port: 26379,
                }],
                ..ConnectionConfig::default()
            }),
            ..migrating()
        };
        let connector = connector();
        let conn = Connection::new("default", direct(), migration, connector.clone());
        assert!(matches!(conn.establish().await, Err(Error::Config(_))));
        assert_eq!(connector.opened(), 0);
        assert!(!conn.is_ready());
    }

    #[tokio::test]
    async fn teardown_quits_and_allows_reestablish() {
        let connector = connector();
        let conn = Connection::new("default", direct(), migrating(), connector.clone());
        conn.establish().await.unwrap();
        let client = conn.client().unwrap();

        tokio::join!(conn.teardown(), conn.teardown());
        assert!(!conn.is_ready());
        assert!(conn.client().is_none());
        assert!(conn.replica_client().is_none());
        assert!(!client.is_ready());

        conn.establish().await.unwrap();
        assert!(conn.is_ready());
        assert_eq!(connector.opened(), 6);
    }

    #[tokio::test]
    async fn teardown_without_sessions_completes() {
        let conn = Connection::new("default", direct(), MigrationConfig::default(), connector());
        conn.teardown().await;
        assert!(!conn.is_ready());
    }
}
