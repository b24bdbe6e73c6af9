use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::Error;

// ---------------------------------------------------------------------------
// Top-level settings
// ---------------------------------------------------------------------------

/// Store settings as loaded from YAML.
///
/// Either `use_connection` names one entry of `connection_settings`, or the
/// legacy `redis_host` / `redis_port` pair is used under the name `default`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreSettings {
    /// Named connection descriptors (e.g. `redis`, `sentinel`).
    #[serde(default)]
    pub connection_settings: HashMap<String, ConnectionConfig>,
    /// Selects one entry of `connection_settings`.
    pub use_connection: Option<String>,
    /// Legacy direct host, used when `use_connection` is absent.
    pub redis_host: Option<String>,
    /// Legacy direct port, used when `use_connection` is absent.
    pub redis_port: Option<u16>,
    /// Dual-write / dual-read against a migration replica.
    #[serde(default)]
    pub migration: MigrationConfig,
}

impl StoreSettings {
    /// Settings for a single direct address, without any named descriptors.
    pub fn direct(host: impl Into<String>, port: u16) -> Self {
        Self {
            redis_host: Some(host.into()),
            redis_port: Some(port),
            ..Self::default()
        }
    }

    /// Resolve the logical connection name and the descriptor to use.
    pub fn resolve(&self) -> Result<(String, ConnectionConfig), Error> {
        match &self.use_connection {
            Some(name) => {
                let config = self.connection_settings.get(name).ok_or_else(|| {
                    Error::Config(format!(
                        "No connection_settings provided for use_connection: {name}"
                    ))
                })?;
                Ok((name.clone(), config.clone()))
            }
            None => Ok((
                "default".to_string(),
                ConnectionConfig {
                    host: Some(
                        self.redis_host
                            .clone()
                            .unwrap_or_else(|| "localhost".to_string()),
                    ),
                    port: Some(self.redis_port.unwrap_or(DEFAULT_PORT)),
                    ..ConnectionConfig::default()
                },
            )),
        }
    }

    /// Apply `SYNCSTORE_MIGRATION_ENABLED` / `SYNCSTORE_READ_FROM_REPLICA`.
    pub fn apply_env_overrides(&mut self) {
        if let Some(enabled) = env_flag("SYNCSTORE_MIGRATION_ENABLED") {
            self.migration.enabled = enabled;
        }
        if let Some(enabled) = env_flag("SYNCSTORE_READ_FROM_REPLICA") {
            self.migration.read_from_replica = enabled;
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name).ok().map(|v| v == "true")
}

pub const DEFAULT_PORT: u16 = 6379;

// ---------------------------------------------------------------------------
// Connection descriptor
// ---------------------------------------------------------------------------

/// One store endpoint: direct `host`/`port`, or a sentinel master `id` plus
/// the sentinel endpoints that track it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ConnectionConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Sentinel master name.
    pub id: Option<String>,
    #[serde(default)]
    pub sentinels: Vec<Endpoint>,
    /// Inline auth secret.
    pub redis_auth: Option<String>,
    /// Name of an environment variable holding the auth secret.
    pub auth_token_env: Option<String>,
    #[serde(default)]
    pub tls: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Endpoint {
    pub host: String,
    #[serde(default = "default_sentinel_port")]
    pub port: u16,
}

fn default_sentinel_port() -> u16 {
    26379
}

/// How a session locates the primary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discovery {
    Direct { host: String, port: u16 },
    Sentinel { master: String, sentinels: Vec<Endpoint> },
}

impl ConnectionConfig {
    /// Sentinel is selected as soon as a master id or sentinel list appears.
    pub fn uses_sentinel(&self) -> bool {
        self.id.is_some() || !self.sentinels.is_empty()
    }

    pub fn discovery(&self) -> Result<Discovery, Error> {
        if !self.uses_sentinel() {
            return Ok(Discovery::Direct {
                host: self
                    .host
                    .clone()
                    .unwrap_or_else(|| "localhost".to_string()),
                port: self.port.unwrap_or(DEFAULT_PORT),
            });
        }
        match &self.id {
            Some(master) if !master.is_empty() && !self.sentinels.is_empty() => {
                Ok(Discovery::Sentinel {
                    master: master.clone(),
                    sentinels: self.sentinels.clone(),
                })
            }
            _ => Err(Error::Config(
                "Provide a valid sentinel cluster configuration".to_string(),
            )),
        }
    }

    /// Inline secret first, then the named environment variable.
    pub fn auth_secret(&self) -> Option<String> {
        self.redis_auth.clone().or_else(|| {
            self.auth_token_env
                .as_deref()
                .and_then(|name| std::env::var(name).ok())
        })
    }
}

// ---------------------------------------------------------------------------
// Migration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct MigrationConfig {
    /// Open a replica session and mirror writes to it.
    #[serde(default)]
    pub enabled: bool,
    /// Serve reads from the replica while migration is enabled.
    #[serde(default)]
    pub read_from_replica: bool,
    /// Direct address of the migration replica.
    pub replica: Option<ConnectionConfig>,
}

impl MigrationConfig {
    pub fn reads_from_replica(&self) -> bool {
        self.enabled && self.read_from_replica
    }
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate [`StoreSettings`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<StoreSettings> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let mut settings: StoreSettings = serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    settings.apply_env_overrides();
    validate_config(&settings)?;
    Ok(settings)
}

/// Checks that cannot be expressed purely with serde.
pub fn validate_config(settings: &StoreSettings) -> Result<()> {
    let (name, config) = settings.resolve()?;
    config
        .discovery()
        .with_context(|| format!("connection `{name}`"))?;
    if settings.migration.enabled {
        let replica = settings
            .migration
            .replica
            .as_ref()
            .context("migration.enabled requires migration.replica")?;
        anyhow::ensure!(
            !replica.uses_sentinel(),
            "migration.replica must be a direct host/port address"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
connection_settings:
  redis:
    host: localhost
    port: 6379
  sentinel:
    id: mymaster
    sentinels:
      - host: localhost
        port: 26379
      - host: localhost
        port: 26380
      - host: localhost
        port: 26381
use_connection: redis
"#;

    fn example() -> StoreSettings {
        serde_yaml::from_str(EXAMPLE).unwrap()
    }

    #[test]
    fn parses_named_redis_connection() {
        let mut settings = example();
        settings
            .connection_settings
            .get_mut("redis")
            .unwrap()
            .port = Some(6380);
        let (name, config) = settings.resolve().unwrap();
        assert_eq!(name, "redis");
        assert_eq!(
            config.discovery().unwrap(),
            Discovery::Direct {
                host: "localhost".into(),
                port: 6380
            }
        );
    }

    #[test]
    fn parses_named_sentinel_connection() {
        let mut settings = example();
        settings.use_connection = Some("sentinel".into());
        let (name, config) = settings.resolve().unwrap();
        assert_eq!(name, "sentinel");
        match config.discovery().unwrap() {
            Discovery::Sentinel { master, sentinels } => {
                assert_eq!(master, "mymaster");
                let ports: Vec<u16> = sentinels.iter().map(|s| s.port).collect();
                assert_eq!(ports, vec![26379, 26380, 26381]);
            }
            other => panic!("expected sentinel discovery, got {other:?}"),
        }
    }

    #[test]
    fn missing_named_connection_is_config_error() {
        let mut settings = example();
        settings.use_connection = Some("non-existing".into());
        let err = settings.resolve().unwrap_err();
        assert!(err.to_string().contains("No connection_settings provided"));
    }

    #[test]
    fn legacy_fallback_uses_default_name() {
        let mut settings = example();
        settings.use_connection = None;
        let (name, config) = settings.resolve().unwrap();
        assert_eq!(name, "default");
        assert_eq!(config.host.as_deref(), Some("localhost"));
        assert_eq!(config.port, Some(6379));
    }

    #[test]
    fn sentinel_without_endpoints_is_rejected() {
        let config = ConnectionConfig {
            id: Some("mymaster".into()),
            ..ConnectionConfig::default()
        };
        assert!(config.uses_sentinel());
        assert!(matches!(config.discovery(), Err(Error::Config(_))));
    }

    #[test]
    fn migration_requires_replica() {
        let mut settings = example();
        settings.migration.enabled = true;
        assert!(validate_config(&settings).is_err());
        settings.migration.replica = Some(ConnectionConfig {
            host: Some("replica.local".into()),
            port: Some(6390),
            ..ConnectionConfig::default()
        });
        assert!(validate_config(&settings).is_ok());
        assert!(!settings.migration.reads_from_replica());

        settings.migration.replica = Some(ConnectionConfig {
            id: Some("mymaster".into()),
            sentinels: vec![Endpoint {
                host: "localhost".into(),
                port: 26379,
            }],
            ..ConnectionConfig::default()
        });
        assert!(validate_config(&settings).is_err());
    }

    #[test]
    fn inline_auth_wins_over_env() {
        let config = ConnectionConfig {
            redis_auth: Some("inline".into()),
            auth_token_env: Some("SYNCSTORE_TEST_UNSET_AUTH".into()),
            ..ConnectionConfig::default()
        };
        assert_eq!(config.auth_secret().as_deref(), Some("inline"));
    }
}
