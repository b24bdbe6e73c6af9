//! Store command surface.
//!
//! The coordination layer talks to the key-value/pub-sub store only through
//! the [`Store`] trait: single commands, atomic batches (MULTI/EXEC), and
//! channel subscriptions.  [`redis`] backs it with a real Redis-compatible
//! server through `fred`; [`memory`] provides an in-process store with the
//! same semantics.

pub mod memory;
pub mod redis;

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::Discovery;
use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// A single store command.  Indices follow Redis conventions (negative values
/// count from the tail).
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Get { key: String },
    Set { key: String, value: String, ttl_secs: Option<u64>, only_if_absent: bool },
    Del { key: String },
    Expire { key: String, seconds: u64 },
    Ttl { key: String },
    IncrBy { key: String, by: i64 },
    Keys { pattern: String },
    HSet { key: String, field: String, value: String },
    HGet { key: String, field: String },
    HGetAll { key: String },
    HDel { key: String, field: String },
    ZAdd { key: String, score: f64, member: String },
    ZRangeWithScores { key: String, start: i64, stop: i64 },
    ZRemRangeByRank { key: String, start: i64, stop: i64 },
    ZRemRangeByScore { key: String, min: f64, max: f64 },
    RPush { key: String, value: String },
    LRange { key: String, start: i64, stop: i64 },
    LTrim { key: String, start: i64, stop: i64 },
    LLen { key: String },
    Publish { channel: String, message: String },
}

impl Command {
    /// Wire name of the command.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Get { .. } => "GET",
            Self::Set { .. } => "SET",
            Self::Del { .. } => "DEL",
            Self::Expire { .. } => "EXPIRE",
            Self::Ttl { .. } => "TTL",
            Self::IncrBy { .. } => "INCRBY",
            Self::Keys { .. } => "KEYS",
            Self::HSet { .. } => "HSET",
            Self::HGet { .. } => "HGET",
            Self::HGetAll { .. } => "HGETALL",
            Self::HDel { .. } => "HDEL",
            Self::ZAdd { .. } => "ZADD",
            Self::ZRangeWithScores { .. } => "ZRANGE",
            Self::ZRemRangeByRank { .. } => "ZREMRANGEBYRANK",
            Self::ZRemRangeByScore { .. } => "ZREMRANGEBYSCORE",
            Self::RPush { .. } => "RPUSH",
            Self::LRange { .. } => "LRANGE",
            Self::LTrim { .. } => "LTRIM",
            Self::LLen { .. } => "LLEN",
            Self::Publish { .. } => "PUBLISH",
        }
    }

    /// Arguments as sent on the wire, after the command name.
    pub fn args(&self) -> Vec<String> {
        match self {
            Self::Get { key }
            | Self::Del { key }
            | Self::Ttl { key }
            | Self::HGetAll { key }
            | Self::LLen { key } => vec![key.clone()],
            Self::Set { key, value, ttl_secs, only_if_absent } => {
                let mut args = vec![key.clone(), value.clone()];
                if let Some(ttl) = ttl_secs {
                    args.push("EX".into());
                    args.push(ttl.to_string());
                }
                if *only_if_absent {
                    args.push("NX".into());
                }
                args
            }
            Self::Expire { key, seconds } => vec![key.clone(), seconds.to_string()],
            Self::IncrBy { key, by } => vec![key.clone(), by.to_string()],
            Self::Keys { pattern } => vec![pattern.clone()],
            Self::HSet { key, field, value } => vec![key.clone(), field.clone(), value.clone()],
            Self::HGet { key, field } | Self::HDel { key, field } => {
                vec![key.clone(), field.clone()]
            }
            Self::ZAdd { key, score, member } => {
                vec![key.clone(), score.to_string(), member.clone()]
            }
            Self::ZRangeWithScores { key, start, stop } => vec![
                key.clone(),
                start.to_string(),
                stop.to_string(),
                "WITHSCORES".into(),
            ],
            Self::ZRemRangeByRank { key, start, stop }
            | Self::LRange { key, start, stop }
            | Self::LTrim { key, start, stop } => {
                vec![key.clone(), start.to_string(), stop.to_string()]
            }
            Self::ZRemRangeByScore { key, min, max } => {
                vec![key.clone(), min.to_string(), max.to_string()]
            }
            Self::RPush { key, value } => vec![key.clone(), value.clone()],
            Self::Publish { channel, message } => vec![channel.clone(), message.clone()],
        }
    }
}

/// Commands queued for one atomic MULTI/EXEC round trip.  Replies come back in
/// submission order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    commands: Vec<Command>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, command: Command) -> &mut Self {
        self.commands.push(command);
        self
    }

    pub fn get(&mut self, key: &str) -> &mut Self {
        self.push(Command::Get { key: key.into() })
    }

    pub fn set(&mut self, key: &str, value: &str, ttl_secs: Option<u64>) -> &mut Self {
        self.push(Command::Set {
            key: key.into(),
            value: value.into(),
            ttl_secs,
            only_if_absent: false,
        })
    }

    pub fn expire(&mut self, key: &str, seconds: u64) -> &mut Self {
        self.push(Command::Expire { key: key.into(), seconds })
    }

    pub fn incr(&mut self, key: &str) -> &mut Self {
        self.push(Command::IncrBy { key: key.into(), by: 1 })
    }

    pub fn publish(&mut self, channel: &str, message: &str) -> &mut Self {
        self.push(Command::Publish {
            channel: channel.into(),
            message: message.into(),
        })
    }

    pub fn rpush(&mut self, key: &str, value: &str) -> &mut Self {
        self.push(Command::RPush { key: key.into(), value: value.into() })
    }

    pub fn lrange(&mut self, key: &str, start: i64, stop: i64) -> &mut Self {
        self.push(Command::LRange { key: key.into(), start, stop })
    }

    pub fn ltrim(&mut self, key: &str, start: i64, stop: i64) -> &mut Self {
        self.push(Command::LTrim { key: key.into(), start, stop })
    }

    pub fn llen(&mut self, key: &str) -> &mut Self {
        self.push(Command::LLen { key: key.into() })
    }

    pub fn zrange_with_scores(&mut self, key: &str, start: i64, stop: i64) -> &mut Self {
        self.push(Command::ZRangeWithScores { key: key.into(), start, stop })
    }

    pub fn zremrangebyrank(&mut self, key: &str, start: i64, stop: i64) -> &mut Self {
        self.push(Command::ZRemRangeByRank { key: key.into(), start, stop })
    }

    pub fn zremrangebyscore(&mut self, key: &str, min: f64, max: f64) -> &mut Self {
        self.push(Command::ZRemRangeByScore { key: key.into(), min, max })
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn into_commands(self) -> Vec<Command> {
        self.commands
    }
}

// ---------------------------------------------------------------------------
// Replies
// ---------------------------------------------------------------------------

/// A decoded store reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Nil,
    Status(String),
    Int(i64),
    Text(String),
    Array(Vec<Reply>),
}

impl Reply {
    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            Self::Text(s) | Self::Status(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn into_text(self) -> Option<String> {
        match self {
            Self::Text(s) | Self::Status(s) => Some(s),
            Self::Int(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Flatten an array reply into its text members.  Nested arrays (RESP3
    /// pairs) are flattened in order.
    pub fn into_texts(self) -> Vec<String> {
        match self {
            Self::Array(items) => items.into_iter().flat_map(Reply::into_texts).collect(),
            Self::Nil => Vec::new(),
            other => other.into_text().into_iter().collect(),
        }
    }
}

pub(crate) fn expect_int(command: &str, reply: Reply) -> Result<i64> {
    reply.as_i64().ok_or_else(|| {
        Error::transport(command, format!("unexpected reply {reply:?}"))
    })
}

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

/// Messages published to one channel, in delivery order.
#[derive(Debug)]
pub struct Subscription {
    channel: String,
    rx: mpsc::UnboundedReceiver<String>,
}

impl Subscription {
    pub fn new(channel: impl Into<String>, rx: mpsc::UnboundedReceiver<String>) -> Self {
        Self { channel: channel.into(), rx }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Wait for the next message; `None` once the session is gone.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Drain everything already delivered without waiting.
    pub fn drain(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(message) = self.rx.try_recv() {
            out.push(message);
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Store / Connector traits
// ---------------------------------------------------------------------------

/// One logical session against the store.
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    /// True while the session is connected and usable.
    fn is_ready(&self) -> bool;

    /// Run one command.
    async fn run(&self, command: Command) -> Result<Reply>;

    /// Run every command of `batch` as one atomic unit.
    async fn exec(&self, batch: Batch) -> Result<Vec<Reply>>;

    /// Start receiving messages published to `channel`.
    async fn subscribe(&self, channel: &str) -> Result<Subscription>;

    async fn unsubscribe(&self, channel: &str) -> Result<()>;

    /// Close the session gracefully.
    async fn quit(&self) -> Result<()>;
}

/// Typed wrappers over [`Store::run`].
#[async_trait::async_trait]
pub trait StoreExt: Store {
    /// `SET key value EX ttl NX`; true iff the key was created.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool> {
        let reply = self
            .run(Command::Set {
                key: key.into(),
                value: value.into(),
                ttl_secs: Some(ttl_secs),
                only_if_absent: true,
            })
            .await?;
        Ok(!reply.is_nil())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.run(Command::Get { key: key.into() }).await?.into_text())
    }

    async fn del(&self, key: &str) -> Result<i64> {
        let reply = self.run(Command::Del { key: key.into() }).await?;
        expect_int("DEL", reply)
    }

    async fn expire(&self, key: &str, seconds: u64) -> Result<bool> {
        let reply = self.run(Command::Expire { key: key.into(), seconds }).await?;
        Ok(expect_int("EXPIRE", reply)? == 1)
    }

    async fn ttl(&self, key: &str) -> Result<i64> {
        let reply = self.run(Command::Ttl { key: key.into() }).await?;
        expect_int("TTL", reply)
    }

    async fn incrby(&self, key: &str, by: i64) -> Result<i64> {
        let reply = self.run(Command::IncrBy { key: key.into(), by }).await?;
        expect_int("INCRBY", reply)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        Ok(self
            .run(Command::Keys { pattern: pattern.into() })
            .await?
            .into_texts())
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        Ok(self
            .run(Command::LRange { key: key.into(), start, stop })
            .await?
            .into_texts())
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<i64> {
        let reply = self
            .run(Command::Publish {
                channel: channel.into(),
                message: message.into(),
            })
            .await?;
        expect_int("PUBLISH", reply)
    }
}

impl<T: Store + ?Sized> StoreExt for T {}

/// Which of a connection's sessions is being opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionRole {
    Client,
    Subscriber,
    Replica,
}

impl std::fmt::Display for SessionRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Client => "client",
            Self::Subscriber => "subscriber",
            Self::Replica => "replica",
        })
    }
}

/// Everything needed to open one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTarget {
    pub discovery: Discovery,
    pub password: Option<String>,
    pub tls: bool,
}

/// Opens sessions; the only place network connections are created.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    /// Resolves once the session reports ready.
    async fn open(&self, target: &SessionTarget, role: SessionRole) -> Result<Arc<dyn Store>>;
}
