//! In-process store with Redis semantics.
//!
//! A [`MemoryBackend`] plays the role of one server; every [`MemoryStore`]
//! opened on it is an independent session sharing its keyspace.  Batches run
//! under the backend lock, so they are atomic with respect to every other
//! session.  TTLs use the tokio clock and are enforced lazily on access.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::{Batch, Command, Connector, Reply, SessionRole, SessionTarget, Store, Subscription};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
enum Data {
    Str(String),
    List(VecDeque<String>),
    Hash(HashMap<String, String>),
    /// Kept sorted by (score, member).
    ZSet(Vec<(f64, String)>),
}

#[derive(Default)]
struct Keyspace {
    data: HashMap<String, Data>,
    expires: HashMap<String, Instant>,
    channels: HashMap<String, Vec<(u64, mpsc::UnboundedSender<String>)>>,
    failing: HashSet<&'static str>,
    latency: HashMap<&'static str, Latency>,
}

/// Simulated slowness of one command, applied by [`MemoryStore::run`].
#[derive(Debug, Clone, Copy)]
pub enum Latency {
    /// The command reaches the server after the delay.
    Request(Duration),
    /// The command applies at once; its reply arrives after the delay.
    Reply(Duration),
}

/// One simulated server.
#[derive(Default)]
pub struct MemoryBackend {
    keyspace: Mutex<Keyspace>,
    next_session: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Open a new session on this backend.
    pub fn session(self: &Arc<Self>) -> Arc<MemoryStore> {
        Arc::new(MemoryStore {
            backend: Arc::clone(self),
            id: self.next_session.fetch_add(1, Ordering::Relaxed),
            connected: AtomicBool::new(true),
        })
    }

    /// Make every later command named `name` fail with a transport error.
    pub fn fail_command(&self, name: &'static str) {
        self.keyspace.lock().failing.insert(name);
    }

    pub fn clear_failures(&self) {
        self.keyspace.lock().failing.clear();
    }

    /// Slow down every later single command named `name`.
    pub fn set_latency(&self, name: &'static str, latency: Latency) {
        self.keyspace.lock().latency.insert(name, latency);
    }

    fn latency(&self, name: &str) -> Option<Latency> {
        self.keyspace.lock().latency.get(name).copied()
    }

    /// Raw list contents, for assertions.
    pub fn list(&self, key: &str) -> Vec<String> {
        let mut ks = self.keyspace.lock();
        ks.purge(key, Instant::now());
        match ks.data.get(key) {
            Some(Data::List(items)) => items.iter().cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// Raw string value, for assertions.
    pub fn string(&self, key: &str) -> Option<String> {
        let mut ks = self.keyspace.lock();
        ks.purge(key, Instant::now());
        match ks.data.get(key) {
            Some(Data::Str(s)) => Some(s.clone()),
            _ => None,
        }
    }

    pub fn exists(&self, key: &str) -> bool {
        let mut ks = self.keyspace.lock();
        ks.purge(key, Instant::now());
        ks.data.contains_key(key)
    }
}

impl Keyspace {
    fn purge(&mut self, key: &str, now: Instant) {
        if self.expires.get(key).is_some_and(|at| *at <= now) {
            self.expires.remove(key);
            self.data.remove(key);
        }
    }

    fn purge_all(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .expires
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            self.expires.remove(&key);
            self.data.remove(&key);
        }
    }

    fn remove(&mut self, key: &str) -> bool {
        self.expires.remove(key);
        self.data.remove(key).is_some()
    }

    fn check(&self, command: &Command) -> Result<()> {
        if self.failing.contains(command.name()) {
            return Err(Error::transport(command.name(), "injected failure"));
        }
        Ok(())
    }

    fn apply(&mut self, command: Command, now: Instant) -> Result<Reply> {
        let name = command.name();
        let wrong_type = || {
            Error::transport(
                name,
                "WRONGTYPE Operation against a key holding the wrong kind of value",
            )
        };

        match command {
            Command::Get { key } => {
                self.purge(&key, now);
                match self.data.get(&key) {
                    None => Ok(Reply::Nil),
                    Some(Data::Str(s)) => Ok(Reply::Text(s.clone())),
                    Some(_) => Err(wrong_type()),
                }
            }
            Command::Set { key, value, ttl_secs, only_if_absent } => {
                self.purge(&key, now);
                if only_if_absent && self.data.contains_key(&key) {
                    return Ok(Reply::Nil);
                }
                self.data.insert(key.clone(), Data::Str(value));
                match ttl_secs {
                    Some(secs) => {
                        self.expires.insert(key, now + Duration::from_secs(secs));
                    }
                    None => {
                        self.expires.remove(&key);
                    }
                }
                Ok(Reply::Status("OK".into()))
            }
            Command::Del { key } => {
                self.purge(&key, now);
                Ok(Reply::Int(i64::from(self.remove(&key))))
            }
            Command::Expire { key, seconds } => {
                self.purge(&key, now);
                if !self.data.contains_key(&key) {
                    return Ok(Reply::Int(0));
                }
                if seconds == 0 {
                    self.remove(&key);
                } else {
                    self.expires.insert(key, now + Duration::from_secs(seconds));
                }
                Ok(Reply::Int(1))
            }
            Command::Ttl { key } => {
                self.purge(&key, now);
                if !self.data.contains_key(&key) {
                    return Ok(Reply::Int(-2));
                }
                match self.expires.get(&key) {
                    None => Ok(Reply::Int(-1)),
                    Some(at) => {
                        let ms = at.saturating_duration_since(now).as_millis() as i64;
                        Ok(Reply::Int((ms + 500) / 1000))
                    }
                }
            }
            Command::IncrBy { key, by } => {
                self.purge(&key, now);
                let current = match self.data.get(&key) {
                    None => 0,
                    Some(Data::Str(s)) => s.parse::<i64>().map_err(|_| {
                        Error::transport(name, "ERR value is not an integer or out of range")
                    })?,
                    Some(_) => return Err(wrong_type()),
                };
                let next = current + by;
                self.data.insert(key, Data::Str(next.to_string()));
                Ok(Reply::Int(next))
            }
            Command::Keys { pattern } => {
                self.purge_all(now);
                let mut keys: Vec<String> = self
                    .data
                    .keys()
                    .filter(|k| glob_match(&pattern, k))
                    .cloned()
                    .collect();
                keys.sort();
                Ok(Reply::Array(keys.into_iter().map(Reply::Text).collect()))
            }
            Command::HSet { key, field, value } => {
                self.purge(&key, now);
                let hash = match self
                    .data
                    .entry(key)
                    .or_insert_with(|| Data::Hash(HashMap::new()))
                {
                    Data::Hash(h) => h,
                    _ => return Err(wrong_type()),
                };
                let added = hash.insert(field, value).is_none();
                Ok(Reply::Int(i64::from(added)))
            }
            Command::HGet { key, field } => {
                self.purge(&key, now);
                match self.data.get(&key) {
                    None => Ok(Reply::Nil),
                    Some(Data::Hash(h)) => {
                        Ok(h.get(&field).cloned().map_or(Reply::Nil, Reply::Text))
                    }
                    Some(_) => Err(wrong_type()),
                }
            }
            Command::HGetAll { key } => {
                self.purge(&key, now);
                match self.data.get(&key) {
                    None => Ok(Reply::Array(Vec::new())),
                    Some(Data::Hash(h)) => {
                        let mut fields: Vec<(&String, &String)> = h.iter().collect();
                        fields.sort();
                        Ok(Reply::Array(
                            fields
                                .into_iter()
                                .flat_map(|(f, v)| [Reply::Text(f.clone()), Reply::Text(v.clone())])
                                .collect(),
                        ))
                    }
                    Some(_) => Err(wrong_type()),
                }
            }
            Command::HDel { key, field } => {
                self.purge(&key, now);
                let (removed, now_empty) = match self.data.get_mut(&key) {
                    None => (false, false),
                    Some(Data::Hash(h)) => (h.remove(&field).is_some(), h.is_empty()),
                    Some(_) => return Err(wrong_type()),
                };
                if now_empty {
                    self.remove(&key);
                }
                Ok(Reply::Int(i64::from(removed)))
            }
            Command::ZAdd { key, score, member } => {
                self.purge(&key, now);
                let set = match self.data.entry(key).or_insert_with(|| Data::ZSet(Vec::new())) {
                    Data::ZSet(s) => s,
                    _ => return Err(wrong_type()),
                };
                let existed = match set.iter().position(|(_, m)| *m == member) {
                    Some(pos) => {
                        set.remove(pos);
                        true
                    }
                    None => false,
                };
                set.push((score, member));
                set.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
                Ok(Reply::Int(i64::from(!existed)))
            }
            Command::ZRangeWithScores { key, start, stop } => {
                self.purge(&key, now);
                match self.data.get(&key) {
                    None => Ok(Reply::Array(Vec::new())),
                    Some(Data::ZSet(set)) => {
                        let items = match normalize_range(start, stop, set.len()) {
                            Some((s, e)) => set[s..=e]
                                .iter()
                                .flat_map(|(score, m)| {
                                    [Reply::Text(m.clone()), Reply::Text(score.to_string())]
                                })
                                .collect(),
                            None => Vec::new(),
                        };
                        Ok(Reply::Array(items))
                    }
                    Some(_) => Err(wrong_type()),
                }
            }
            Command::ZRemRangeByRank { key, start, stop } => {
                self.purge(&key, now);
                let (removed, now_empty) = match self.data.get_mut(&key) {
                    None => (0, false),
                    Some(Data::ZSet(set)) => match normalize_range(start, stop, set.len()) {
                        Some((s, e)) => {
                            set.drain(s..=e);
                            (e - s + 1, set.is_empty())
                        }
                        None => (0, false),
                    },
                    Some(_) => return Err(wrong_type()),
                };
                if now_empty {
                    self.remove(&key);
                }
                Ok(Reply::Int(removed as i64))
            }
            Command::ZRemRangeByScore { key, min, max } => {
                self.purge(&key, now);
                let (removed, now_empty) = match self.data.get_mut(&key) {
                    None => (0, false),
                    Some(Data::ZSet(set)) => {
                        let before = set.len();
                        set.retain(|(score, _)| *score < min || *score > max);
                        (before - set.len(), set.is_empty())
                    }
                    Some(_) => return Err(wrong_type()),
                };
                if now_empty {
                    self.remove(&key);
                }
                Ok(Reply::Int(removed as i64))
            }
            Command::RPush { key, value } => {
                self.purge(&key, now);
                let list = match self
                    .data
                    .entry(key)
                    .or_insert_with(|| Data::List(VecDeque::new()))
                {
                    Data::List(l) => l,
                    _ => return Err(wrong_type()),
                };
                list.push_back(value);
                Ok(Reply::Int(list.len() as i64))
            }
            Command::LRange { key, start, stop } => {
                self.purge(&key, now);
                match self.data.get(&key) {
                    None => Ok(Reply::Array(Vec::new())),
                    Some(Data::List(list)) => {
                        let items = match normalize_range(start, stop, list.len()) {
                            Some((s, e)) => list
                                .range(s..=e)
                                .cloned()
                                .map(Reply::Text)
                                .collect(),
                            None => Vec::new(),
                        };
                        Ok(Reply::Array(items))
                    }
                    Some(_) => Err(wrong_type()),
                }
            }
            Command::LTrim { key, start, stop } => {
                self.purge(&key, now);
                let now_empty = match self.data.get_mut(&key) {
                    None => false,
                    Some(Data::List(list)) => match normalize_range(start, stop, list.len()) {
                        Some((s, e)) => {
                            list.truncate(e + 1);
                            list.drain(..s);
                            list.is_empty()
                        }
                        None => true,
                    },
                    Some(_) => return Err(wrong_type()),
                };
                if now_empty {
                    self.remove(&key);
                }
                Ok(Reply::Status("OK".into()))
            }
            Command::LLen { key } => {
                self.purge(&key, now);
                match self.data.get(&key) {
                    None => Ok(Reply::Int(0)),
                    Some(Data::List(list)) => Ok(Reply::Int(list.len() as i64)),
                    Some(_) => Err(wrong_type()),
                }
            }
            Command::Publish { channel, message } => {
                let mut delivered = 0;
                if let Some(subscribers) = self.channels.get_mut(&channel) {
                    subscribers.retain(|(_, tx)| tx.send(message.clone()).is_ok());
                    delivered = subscribers.len();
                }
                Ok(Reply::Int(delivered as i64))
            }
        }
    }
}

/// Clamp Redis-style inclusive `start..=stop` indices to `len`.
fn normalize_range(start: i64, stop: i64, len: usize) -> Option<(usize, usize)> {
    let len = len as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if start > stop || start >= len || stop < 0 {
        return None;
    }
    Some((start as usize, stop as usize))
}

/// `*` and `?` globbing, as used by `KEYS`.
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;
    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            backtrack = Some((pi, ti));
            pi += 1;
        } else if let Some((star, matched)) = backtrack {
            pi = star + 1;
            ti = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|c| *c == '*')
}

/// One session on a [`MemoryBackend`].
pub struct MemoryStore {
    backend: Arc<MemoryBackend>,
    id: u64,
    connected: AtomicBool,
}

impl MemoryStore {
    pub fn backend(&self) -> &Arc<MemoryBackend> {
        &self.backend
    }

    fn ensure_connected(&self, command: &str) -> Result<()> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::transport(command, "connection closed"))
        }
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    fn is_ready(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn run(&self, command: Command) -> Result<Reply> {
        self.ensure_connected(command.name())?;
        let latency = self.backend.latency(command.name());
        if let Some(Latency::Request(delay)) = latency {
            tokio::time::sleep(delay).await;
        }
        let reply = {
            let mut ks = self.backend.keyspace.lock();
            ks.check(&command).and_then(|()| ks.apply(command, Instant::now()))
        };
        if let Some(Latency::Reply(delay)) = latency {
            tokio::time::sleep(delay).await;
        }
        reply
    }

    async fn exec(&self, batch: Batch) -> Result<Vec<Reply>> {
        self.ensure_connected("EXEC")?;
        let mut ks = self.backend.keyspace.lock();
        for command in batch.commands() {
            ks.check(command)?;
        }
        let now = Instant::now();
        batch
            .into_commands()
            .into_iter()
            .map(|command| ks.apply(command, now))
            .collect()
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        self.ensure_connected("SUBSCRIBE")?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.backend
            .keyspace
            .lock()
            .channels
            .entry(channel.to_string())
            .or_default()
            .push((self.id, tx));
        Ok(Subscription::new(channel, rx))
    }

    async fn unsubscribe(&self, channel: &str) -> Result<()> {
        self.ensure_connected("UNSUBSCRIBE")?;
        if let Some(subscribers) = self.backend.keyspace.lock().channels.get_mut(channel) {
            subscribers.retain(|(session, _)| *session != self.id);
        }
        Ok(())
    }

    async fn quit(&self) -> Result<()> {
        self.connected.store(false, Ordering::Release);
        let mut ks = self.backend.keyspace.lock();
        for subscribers in ks.channels.values_mut() {
            subscribers.retain(|(session, _)| *session != self.id);
        }
        Ok(())
    }
}

/// Opens [`MemoryStore`] sessions: client and subscriber sessions on the
/// primary backend, replica sessions on a separate replica backend.
pub struct MemoryConnector {
    primary: Arc<MemoryBackend>,
    replica: Arc<MemoryBackend>,
    opened: AtomicUsize,
    failing: Mutex<HashSet<SessionRole>>,
    open_delay: Mutex<Option<Duration>>,
}

impl MemoryConnector {
    pub fn new(primary: Arc<MemoryBackend>, replica: Arc<MemoryBackend>) -> Arc<Self> {
        Arc::new(Self {
            primary,
            replica,
            opened: AtomicUsize::new(0),
            failing: Mutex::new(HashSet::new()),
            open_delay: Mutex::new(None),
        })
    }

    pub fn primary(&self) -> &Arc<MemoryBackend> {
        &self.primary
    }

    pub fn replica(&self) -> &Arc<MemoryBackend> {
        &self.replica
    }

    /// Number of sessions opened so far (including failed attempts).
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Make later opens for `role` fail.
    pub fn fail_role(&self, role: SessionRole) {
        self.failing.lock().insert(role);
    }

    pub fn clear_failures(&self) {
        self.failing.lock().clear();
    }

    /// Delay every open, to widen the window for concurrent establish calls.
    pub fn set_open_delay(&self, delay: Option<Duration>) {
        *self.open_delay.lock() = delay;
    }
}

#[async_trait::async_trait]
impl Connector for MemoryConnector {
    async fn open(&self, _target: &SessionTarget, role: SessionRole) -> Result<Arc<dyn Store>> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let delay = *self.open_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.lock().contains(&role) {
            return Err(Error::transport("CONNECT", format!("{role} session refused")));
        }
        let backend = match role {
            SessionRole::Replica => &self.replica,
            SessionRole::Client | SessionRole::Subscriber => &self.primary,
        };
        Ok(backend.session())
    }
}
