//! Redis / KeyDB sessions via `fred`.
//!
//! Each session is a single [`fred::clients::Client`] configured either for a
//! centralized server or for sentinel discovery, optionally over `rustls`.
//! Commands are sent as custom commands so that the same [`Command`] values
//! drive both the single-command and the MULTI/EXEC paths.

use std::sync::Arc;

use fred::clients::Client;
use fred::interfaces::{ClientLike, EventInterface, PubsubInterface, TransactionInterface};
use fred::types::config::{Config as FredConfig, ReconnectPolicy, ServerConfig, TlsConnector};
use fred::types::{Builder, CustomCommand, Value};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{Batch, Command, Connector, Reply, SessionRole, SessionTarget, Store, Subscription};
use crate::config::Discovery;
use crate::error::{Error, Result};

/// A connected `fred` client.
pub struct RedisStore {
    client: Client,
    role: SessionRole,
}

impl RedisStore {
    pub fn new(client: Client, role: SessionRole) -> Self {
        Self { client, role }
    }
}

fn custom(command: &Command) -> CustomCommand {
    CustomCommand::new_static(command.name(), None::<u16>, false)
}

/// Convert a `fred` value into a [`Reply`].
pub(crate) fn to_reply(value: Value) -> Reply {
    match value {
        Value::Null => Reply::Nil,
        Value::Queued => Reply::Status("QUEUED".into()),
        Value::Integer(n) => Reply::Int(n),
        Value::Boolean(b) => Reply::Int(i64::from(b)),
        Value::Double(d) => Reply::Text(d.to_string()),
        Value::String(s) => Reply::Text(s.to_string()),
        Value::Bytes(b) => Reply::Text(String::from_utf8_lossy(&b).into_owned()),
        Value::Array(items) => Reply::Array(items.into_iter().map(to_reply).collect()),
        Value::Map(map) => Reply::Array(
            map.inner()
                .into_iter()
                .flat_map(|(k, v)| [Reply::Text(k.as_str_lossy().into_owned()), to_reply(v)])
                .collect(),
        ),
    }
}

#[async_trait::async_trait]
impl Store for RedisStore {
    fn is_ready(&self) -> bool {
        self.client.is_connected()
    }

    async fn run(&self, command: Command) -> Result<Reply> {
        let value: Value = self.client.custom(custom(&command), command.args()).await?;
        Ok(to_reply(value))
    }

    async fn exec(&self, batch: Batch) -> Result<Vec<Reply>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let trx = self.client.multi();
        for command in batch.commands() {
            let _: () = trx.custom(custom(command), command.args()).await?;
        }
        let value: Value = trx.exec(true).await?;
        match to_reply(value) {
            Reply::Array(replies) => Ok(replies),
            Reply::Nil => Err(Error::transport("EXEC", "transaction aborted")),
            other => Ok(vec![other]),
        }
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut messages = self.client.message_rx();
        self.client.subscribe(channel).await?;

        let wanted = channel.to_string();
        tokio::spawn(async move {
            while let Ok(message) = messages.recv().await {
                if &*message.channel != wanted.as_str() {
                    continue;
                }
                let Some(payload) = message.value.as_string() else {
                    continue;
                };
                if tx.send(payload).is_err() {
                    break;
                }
            }
        });

        debug!(%channel, role = %self.role, "subscribed");
        Ok(Subscription::new(channel, rx))
    }

    async fn unsubscribe(&self, channel: &str) -> Result<()> {
        self.client.unsubscribe(channel).await?;
        Ok(())
    }

    async fn quit(&self) -> Result<()> {
        self.client.quit().await?;
        info!(role = %self.role, "session closed");
        Ok(())
    }
}

/// Opens [`RedisStore`] sessions.
#[derive(Debug, Clone)]
pub struct RedisConnector {
    policy: ReconnectPolicy,
}

impl Default for RedisConnector {
    fn default() -> Self {
        // Exponential reconnect: initial 0ms, base 100ms, max 30s, factor 2.
        Self {
            policy: ReconnectPolicy::new_exponential(0, 100, 30_000, 2),
        }
    }
}

impl RedisConnector {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy }
    }
}

/// Build the `fred` configuration for one session target.
pub fn fred_config(target: &SessionTarget) -> Result<FredConfig> {
    let server = match &target.discovery {
        Discovery::Direct { host, port } => ServerConfig::new_centralized(host.as_str(), *port),
        Discovery::Sentinel { master, sentinels } => ServerConfig::new_sentinel(
            sentinels
                .iter()
                .map(|s| (s.host.clone(), s.port))
                .collect(),
            master.clone(),
        ),
    };

    let mut config = FredConfig {
        server,
        ..FredConfig::default()
    };

    if target.tls {
        config.tls = Some(
            TlsConnector::default_rustls()
                .map_err(|e| Error::Config(format!("TLS setup failed: {e}")))?
                .into(),
        );
    }

    if let Some(ref password) = target.password {
        config.password = Some(password.clone());
    }

    Ok(config)
}

#[async_trait::async_trait]
impl Connector for RedisConnector {
    async fn open(&self, target: &SessionTarget, role: SessionRole) -> Result<Arc<dyn Store>> {
        let mut builder = Builder::from_config(fred_config(target)?);
        builder.set_policy(self.policy.clone());
        let client = builder.build()?;
        client.init().await?;

        // Verify connectivity with a PING.
        let _: String = client.ping(None).await?;

        match &target.discovery {
            Discovery::Direct { host, port } => {
                info!(%role, %host, port, tls = target.tls, "Redis client ready")
            }
            Discovery::Sentinel { master, sentinels } => info!(
                %role,
                %master,
                sentinels = sentinels.len(),
                "Sentinel client ready"
            ),
        }

        Ok(Arc::new(RedisStore::new(client, role)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Endpoint;

    #[test]
    fn converts_nested_values() {
        let value = Value::Array(vec![
            Value::from("a"),
            Value::Integer(3),
            Value::Null,
        ]);
        assert_eq!(
            to_reply(value),
            Reply::Array(vec![Reply::Text("a".into()), Reply::Int(3), Reply::Nil])
        );
    }

    #[test]
    fn sentinel_target_builds_sentinel_server_config() {
        let target = SessionTarget {
            discovery: Discovery::Sentinel {
                master: "mymaster".into(),
                sentinels: vec![Endpoint {
                    host: "localhost".into(),
                    port: 26379,
                }],
            },
            password: Some("secret".into()),
            tls: false,
        };
        let config = fred_config(&target).unwrap();
        assert!(matches!(config.server, ServerConfig::Sentinel { .. }));
        assert_eq!(config.password.as_deref(), Some("secret"));
    }

    #[test]
    fn direct_target_builds_centralized_config() {
        let target = SessionTarget {
            discovery: Discovery::Direct {
                host: "keydb.local".into(),
                port: 6380,
            },
            password: None,
            tls: false,
        };
        let config = fred_config(&target).unwrap();
        assert!(matches!(config.server, ServerConfig::Centralized { .. }));
        assert!(config.password.is_none());
    }
}
