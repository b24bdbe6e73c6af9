//! Process-level entry point to the store.
//!
//! [`Persistence`] owns the connection selected by [`StoreSettings`], hands
//! out its sessions to locks, allocators and lists, and implements the
//! key/hash/sorted-set helpers used by the sync service.  While migration is
//! enabled every write is mirrored to the replica (replica failures are logged,
//! never returned) and reads may be served from the replica.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, info};

use crate::config::StoreSettings;
use crate::coordination::connection::Connection;
use crate::coordination::node;
use crate::coordination::registry::ConnectionRegistry;
use crate::error::{Error, Result};
use crate::metrics::{Metrics, MetricsRegistry};
use crate::store::redis::RedisConnector;
use crate::store::{expect_int, Batch, Command, Connector, Reply, Store, StoreExt};

/// Members returned by [`Persistence::read_ordered_with_scores`], newest last.
pub const ORDERED_READ_LIMIT: i64 = 100;

/// Retention applied to a time-ordered feed before it is read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrderPolicy {
    /// Keep at most this many newest members.
    pub max_count: Option<u64>,
    /// Drop members older than this.
    pub max_age_seconds: Option<u64>,
}

impl OrderPolicy {
    fn apply(&self, batch: &mut Batch, key: &str, now_ms: i64) {
        if let Some(max_count) = self.max_count.filter(|n| *n > 0) {
            batch.zremrangebyrank(key, 0, -(max_count as i64) - 1);
        }
        if let Some(max_age) = self.max_age_seconds.filter(|n| *n > 0) {
            let max_score = now_ms - (max_age as i64) * 1000;
            batch.zremrangebyscore(key, 0.0, max_score as f64);
        }
    }
}

pub struct Persistence {
    settings: StoreSettings,
    registry: Arc<ConnectionRegistry>,
    connection: Mutex<Option<Arc<Connection>>>,
    node_id: String,
    metrics: MetricsRegistry,
}

impl Persistence {
    pub fn new(settings: StoreSettings, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            settings,
            registry,
            connection: Mutex::new(None),
            node_id: node::node_id(),
            metrics: MetricsRegistry::new(),
        }
    }

    pub fn with_connector(settings: StoreSettings, connector: Arc<dyn Connector>) -> Self {
        Self::new(settings, Arc::new(ConnectionRegistry::new(connector)))
    }

    /// Build a facade over real Redis sessions and connect it.
    pub async fn connect_with_redis(settings: StoreSettings) -> Result<Arc<Self>> {
        let persistence = Arc::new(Self::with_connector(
            settings,
            Arc::new(RedisConnector::default()),
        ));
        persistence.connect().await?;
        Ok(persistence)
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics.metrics
    }

    pub fn metrics_registry(&self) -> &MetricsRegistry {
        &self.metrics
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Establish the configured connection.  Concurrent calls share one
    /// attempt; an already-ready connection returns immediately.
    pub async fn connect(&self) -> Result<()> {
        let connection = {
            let mut current = self.connection.lock();
            match current.as_ref() {
                Some(connection) => Arc::clone(connection),
                None => {
                    let connection = self.registry.connection(&self.settings)?;
                    *current = Some(Arc::clone(&connection));
                    connection
                }
            }
        };
        connection.establish().await?;
        self.metrics().connections_ready.set(1);
        Ok(())
    }

    pub async fn disconnect(&self) {
        let connection = self.connection.lock().take();
        if let Some(connection) = connection {
            connection.teardown().await;
            info!(connection = %connection.name(), "disconnected");
        }
        self.metrics().connections_ready.set(0);
    }

    pub fn is_connected(&self) -> bool {
        self.connection
            .lock()
            .as_ref()
            .is_some_and(|connection| connection.is_ready())
    }

    fn current(&self) -> Result<Arc<Connection>> {
        self.connection
            .lock()
            .clone()
            .ok_or(Error::NotConnected("connection"))
    }

    // -----------------------------------------------------------------------
    // Session accessors
    // -----------------------------------------------------------------------

    /// The primary read/write session.
    pub fn redis(&self) -> Result<Arc<dyn Store>> {
        let connection = self.current()?;
        let client = connection.client().ok_or(Error::NotConnected("client"))?;
        if !connection.is_ready() {
            error!("client: not connected to the store");
        }
        Ok(client)
    }

    pub fn redis_replica(&self) -> Result<Arc<dyn Store>> {
        let replica = self.current()?.replica_client();
        replica.ok_or_else(|| {
            error!("replica client: not connected to the store");
            Error::NotConnected("replica")
        })
    }

    pub fn pubsub(&self) -> Result<Arc<dyn Store>> {
        let connection = self.current()?;
        let subscriber = connection
            .subscriber()
            .ok_or(Error::NotConnected("subscriber"))?;
        if !subscriber.is_ready() {
            error!("pubsub: not connected to the store");
        }
        Ok(subscriber)
    }

    pub fn migration_enabled(&self) -> bool {
        self.settings.migration.enabled
    }

    pub fn read_from_replica(&self) -> bool {
        self.settings.migration.reads_from_replica()
    }

    /// Session that serves reads: the replica while reading from it, else
    /// the primary.
    pub fn reader(&self) -> Result<Arc<dyn Store>> {
        if self.read_from_replica() {
            self.redis_replica()
        } else {
            self.redis()
        }
    }

    // -----------------------------------------------------------------------
    // Dual-write plumbing
    // -----------------------------------------------------------------------

    async fn mirror(&self, batch: Batch) {
        if !self.migration_enabled() {
            return;
        }
        let result = match self.redis_replica() {
            Ok(replica) => replica.exec(batch).await.map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            error!(error = %e, "replica write failed");
        }
    }

    /// Run `batch` on the primary, then mirror it to the replica.
    async fn write(&self, batch: Batch) -> Result<Vec<Reply>> {
        let replies = self.redis()?.exec(batch.clone()).await?;
        self.mirror(batch).await;
        Ok(replies)
    }

    async fn write_one(&self, command: Command) -> Result<Reply> {
        let reply = self.redis()?.run(command.clone()).await?;
        let mut batch = Batch::new();
        batch.push(command);
        self.mirror(batch).await;
        Ok(reply)
    }

    // -----------------------------------------------------------------------
    // Plain keys
    // -----------------------------------------------------------------------

    /// Store `value` as JSON under `key`, optionally with a TTL.
    pub async fn persist_key<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<u64>,
    ) -> Result<()> {
        debug!(%key, "persist_key");
        let json = encode(key, value)?;
        let mut batch = Batch::new();
        batch.set(key, &json, None);
        if let Some(ttl) = ttl {
            batch.expire(key, ttl);
        }
        self.write(batch).await?;
        Ok(())
    }

    /// Read a JSON value, refreshing the key's TTL on every store when
    /// `expire_ttl` is given.
    pub async fn read_key<T: DeserializeOwned>(
        &self,
        key: &str,
        expire_ttl: Option<u64>,
    ) -> Result<Option<T>> {
        debug!(%key, "read_key");
        let mut batch = Batch::new();
        batch.get(key);
        if let Some(ttl) = expire_ttl {
            batch.expire(key, ttl);
        }
        let raw = self
            .reader()?
            .exec(batch)
            .await?
            .into_iter()
            .next()
            .and_then(Reply::into_text);

        if let (Some(ttl), true) = (expire_ttl, self.migration_enabled()) {
            let other = if self.read_from_replica() {
                self.redis()
            } else {
                self.redis_replica()
            };
            let result = match other {
                Ok(store) => store.expire(key, ttl).await.map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                error!(%key, error = %e, "expire refresh failed");
            }
        }
        raw.map(|raw| decode(key, &raw)).transpose()
    }

    pub async fn del(&self, key: &str) -> Result<i64> {
        info!(%key, "deleting");
        let reply = self.write_one(Command::Del { key: key.into() }).await?;
        expect_int("DEL", reply)
    }

    /// Delete every key matching `pattern`; returns how many were found.
    pub async fn del_wildcard(&self, pattern: &str) -> Result<usize> {
        let keys = self.keys(pattern).await?;
        for key in &keys {
            self.del(key).await?;
        }
        Ok(keys.len())
    }

    /// Refresh a TTL.  Failures are logged only.
    pub async fn expire(&self, key: &str, seconds: u64) {
        debug!(%key, seconds, "expire");
        if let Err(e) = self
            .write_one(Command::Expire { key: key.into(), seconds })
            .await
        {
            error!(%key, error = %e, "expire failed");
        }
    }

    pub async fn ttl(&self, key: &str) -> Result<i64> {
        self.redis()?.ttl(key).await
    }

    pub async fn incrby(&self, key: &str, by: i64) -> Result<i64> {
        let reply = self.write_one(Command::IncrBy { key: key.into(), by }).await?;
        expect_int("INCRBY", reply)
    }

    pub async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        self.reader()?.keys(pattern).await
    }

    /// Publish `value` as JSON; returns the number of receivers.
    pub async fn publish<T: Serialize + ?Sized>(&self, channel: &str, value: &T) -> Result<i64> {
        debug!(%channel, "publish");
        let json = encode(channel, value)?;
        self.reader()?.publish(channel, &json).await
    }

    // -----------------------------------------------------------------------
    // Hashes
    // -----------------------------------------------------------------------

    pub async fn persist_hash<T: Serialize + ?Sized>(
        &self,
        hash: &str,
        field: &str,
        value: &T,
    ) -> Result<()> {
        debug!(%hash, %field, "persist_hash");
        let json = encode(hash, value)?;
        self.write_one(Command::HSet {
            key: hash.into(),
            field: field.into(),
            value: json,
        })
        .await?;
        Ok(())
    }

    pub async fn read_hash_value<T: DeserializeOwned>(
        &self,
        hash: &str,
        field: &str,
    ) -> Result<Option<T>> {
        debug!(%hash, %field, "read_hash_value");
        let reply = self
            .reader()?
            .run(Command::HGet {
                key: hash.into(),
                field: field.into(),
            })
            .await?;
        reply
            .into_text()
            .map(|raw| decode(&format!("{hash}[{field}]"), &raw))
            .transpose()
    }

    /// Every field of `hash`, decoded.  Fields that are not valid JSON are
    /// dropped and logged.
    pub async fn read_hash_all(&self, hash: &str) -> Result<HashMap<String, serde_json::Value>> {
        let flat = self
            .reader()?
            .run(Command::HGetAll { key: hash.into() })
            .await?
            .into_texts();

        let mut out = HashMap::with_capacity(flat.len() / 2);
        let mut pairs = flat.into_iter();
        while let (Some(field), Some(raw)) = (pairs.next(), pairs.next()) {
            match serde_json::from_str(&raw) {
                Ok(value) => {
                    out.insert(field, value);
                }
                Err(e) => {
                    self.metrics().corrupted_values.inc();
                    error!(%hash, %field, error = %e, "corrupted hash value dropped");
                }
            }
        }
        Ok(out)
    }

    /// Remove one hash field.  Failures are logged only.
    pub async fn delete_hash(&self, hash: &str, field: &str) {
        debug!(%hash, %field, "delete_hash");
        if let Err(e) = self
            .write_one(Command::HDel {
                key: hash.into(),
                field: field.into(),
            })
            .await
        {
            error!(%hash, %field, error = %e, "delete_hash failed");
        }
    }

    // -----------------------------------------------------------------------
    // Time-ordered feed
    // -----------------------------------------------------------------------

    /// Add `value` to the sorted set at `key`, scored by the current time in
    /// milliseconds.
    pub async fn persist_ordered<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let json = encode(key, value)?;
        self.write_one(Command::ZAdd {
            key: key.into(),
            score: now_ms() as f64,
            member: json,
        })
        .await?;
        Ok(())
    }

    /// Apply `policy` (on every store during migration) and return the newest
    /// members with their scores, oldest first.  The range is read once, from
    /// [`Persistence::reader`].
    pub async fn read_ordered_with_scores(
        &self,
        key: &str,
        policy: Option<&OrderPolicy>,
    ) -> Result<Vec<(String, f64)>> {
        let now = now_ms();
        let mut primary = Batch::new();
        let mut replica = Batch::new();
        if let Some(policy) = policy {
            policy.apply(&mut primary, key, now);
            if self.migration_enabled() {
                policy.apply(&mut replica, key, now);
            }
        }

        let from_replica = self.read_from_replica();
        let reader = if from_replica { &mut replica } else { &mut primary };
        reader.zrange_with_scores(key, -ORDERED_READ_LIMIT, -1);

        let (read_replies, other) = if from_replica {
            let replies = self.redis_replica()?.exec(replica).await?;
            (replies, primary)
        } else {
            let replies = self.redis()?.exec(primary).await?;
            (replies, replica)
        };
        if !other.is_empty() {
            let store = if from_replica { self.redis() } else { self.redis_replica() };
            let result = match store {
                Ok(store) => store.exec(other).await.map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                error!(%key, error = %e, "retention policy failed on mirrored store");
            }
        }

        let flat = read_replies
            .into_iter()
            .last()
            .ok_or_else(|| Error::transport("ZRANGE", "empty transaction reply"))?
            .into_texts();
        let mut members = Vec::with_capacity(flat.len() / 2);
        let mut pairs = flat.into_iter();
        while let (Some(member), Some(score)) = (pairs.next(), pairs.next()) {
            let score = score.parse().map_err(|_| Error::Corrupted {
                key: key.to_string(),
                reason: format!("score {score:?} is not a number"),
            })?;
            members.push((member, score));
        }
        Ok(members)
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn encode<T: Serialize + ?Sized>(key: &str, value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| Error::InvalidEntry(format!("{key}: {e}")))
}

fn decode<T: DeserializeOwned>(key: &str, raw: &str) -> Result<T> {
    serde_json::from_str(raw).map_err(|e| Error::Corrupted {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::config::{ConnectionConfig, MigrationConfig};
    use crate::store::memory::{MemoryBackend, MemoryConnector};

    pub(crate) fn settings(migration: bool, read_from_replica: bool) -> StoreSettings {
        let mut settings = StoreSettings::direct("localhost", 6379);
        if migration {
            settings.migration = MigrationConfig {
                enabled: true,
                read_from_replica,
                replica: Some(ConnectionConfig {
                    host: Some("replica.local".into()),
                    port: Some(6390),
                    ..ConnectionConfig::default()
                }),
            };
        }
        settings
    }

    /// A connected facade over in-memory stores.
    pub(crate) async fn connected(settings: StoreSettings) -> (Arc<Persistence>, Arc<MemoryConnector>) {
        let connector = MemoryConnector::new(MemoryBackend::new(), MemoryBackend::new());
        let persistence = Arc::new(Persistence::with_connector(settings, connector.clone()));
        persistence.connect().await.unwrap();
        (persistence, connector)
    }
}
