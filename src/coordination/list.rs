//! Append-only replicated log.
//!
//! Each push takes the next id from the list's [`IdGen`] and, still under the
//! id lease, publishes the stamped entry on the channel named after the list
//! and appends it to the stored log in one atomic batch.  The id counter never
//! expires, so ids are not reused after the log itself lapses.  Consumers replay from their last-seen id
//! with [`List::info`] + [`List::read`]; a cursor that fell out of the
//! retained window gets [`Error::Sync`] and must start over.

use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, warn};

use super::id_gen::IdGen;
use crate::error::{Error, Result};
use crate::persistence::Persistence;
use crate::store::{expect_int, Batch, Reply, StoreExt};

/// Prefix of the counter key backing a list's ids.
pub const ID_GEN_PREFIX: &str = "id_gen:/";

/// Extra older entries fetched on replay, to cover pushes and trims that
/// landed between `info()` and `read()`.
pub const READ_MARGIN: i64 = 100;

/// A stored entry: the caller's JSON object stamped with `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub id: u64,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

/// Bounds of the stored log.  `start`/`end` are `None` when the log is empty
/// or the boundary entry does not decode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListInfo {
    pub start: Option<u64>,
    pub end: Option<u64>,
    pub size: u64,
}

pub struct List {
    persistence: Arc<Persistence>,
    name: String,
    expiry: Option<u64>,
    max_length: usize,
    id_gen: IdGen,
}

impl List {
    /// `max_length == 0` makes the list publish-only: nothing is stored.
    /// `expiry` applies to the stored log only.
    pub fn new(
        persistence: Arc<Persistence>,
        name: impl Into<String>,
        expiry: Option<u64>,
        max_length: usize,
    ) -> Self {
        let name = name.into();
        let id_gen = IdGen::new(Arc::clone(&persistence), format!("{ID_GEN_PREFIX}{name}"), None);
        Self {
            persistence,
            name,
            expiry,
            max_length,
            id_gen,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id_gen(&self) -> &IdGen {
        &self.id_gen
    }

    /// Stamp `payload` with the next id and write it out.
    ///
    /// The id is requested before this returns and the write runs before the
    /// id lease is released, so pushes are stored and published in id order
    /// whatever order their futures are awaited in (or if they are dropped).
    pub fn push<T: Serialize + ?Sized>(
        &self,
        payload: &T,
    ) -> impl Future<Output = Result<Entry>> + Send + 'static {
        let pending = to_object(payload).map(|payload| {
            let persistence = Arc::clone(&self.persistence);
            let name = self.name.clone();
            let expiry = self.expiry;
            let max_length = self.max_length;
            self.id_gen.alloc_with(move |id| {
                write_entry(persistence, name, Entry { id, payload }, expiry, max_length)
            })
        });
        async move { pending?.await }
    }

    /// First id, last id and entry count of the stored log, read atomically.
    pub async fn info(&self) -> Result<ListInfo> {
        let mut batch = Batch::new();
        batch
            .lrange(&self.name, 0, 0)
            .lrange(&self.name, -1, -1)
            .llen(&self.name);
        let replies = self.persistence.redis()?.exec(batch).await?;
        let [first, last, len]: [_; 3] = replies
            .try_into()
            .map_err(|_| Error::transport("EXEC", "expected three replies for list info"))?;

        let boundary = |reply: Reply| {
            reply
                .into_texts()
                .first()
                .and_then(|raw| self.boundary_id(raw))
        };
        Ok(ListInfo {
            start: boundary(first),
            end: boundary(last),
            size: expect_int("LLEN", len)?.max(0) as u64,
        })
    }

    /// Entries newer than `from`, oldest first.  `None` reads the whole log.
    pub async fn read(&self, from: Option<u64>, info: &ListInfo) -> Result<Vec<Entry>> {
        let start = match from {
            None => 0,
            Some(from) => match start_offset(from, info) {
                Some(offset) => offset,
                None => {
                    self.persistence.metrics().sync_errors.inc();
                    debug!(list = %self.name, from, ?info, "replay cursor outside window");
                    return Err(Error::Sync {
                        from,
                        start: info.start,
                        end: info.end,
                        size: info.size,
                    });
                }
            },
        };

        let raw = self.persistence.redis()?.lrange(&self.name, start, -1).await?;
        Ok(raw
            .iter()
            .filter_map(|raw| self.decode_entry(raw))
            .filter(|entry| from.map_or(true, |from| entry.id > from))
            .collect())
    }

    /// Retry a push waiting on the id lease, e.g. after the lease was cleared
    /// by hand.
    pub fn unblock(&self) {
        self.id_gen.unblock();
    }

    /// The `id` of a boundary entry.  Legacy entries may be a bare number.
    fn boundary_id(&self, raw: &str) -> Option<u64> {
        match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => map.get("id").and_then(Value::as_u64),
            Ok(Value::Number(n)) => n.as_u64(),
            Ok(Value::String(s)) => s.parse().ok(),
            Ok(other) => {
                self.corrupted(raw, &format!("unexpected value {other}"));
                None
            }
            Err(e) => {
                self.corrupted(raw, &e.to_string());
                None
            }
        }
    }

    fn decode_entry(&self, raw: &str) -> Option<Entry> {
        serde_json::from_str(raw)
            .map_err(|e| self.corrupted(raw, &e.to_string()))
            .ok()
    }

    fn corrupted(&self, raw: &str, reason: &str) {
        self.persistence.metrics().corrupted_values.inc();
        error!(list = %self.name, %raw, %reason, "corrupted list entry dropped");
    }
}

/// Tail-relative LRANGE start for a replay from `from`, or `None` when the
/// cursor is outside `[start, end]` or the log is empty.
pub fn start_offset(from: u64, info: &ListInfo) -> Option<i64> {
    if info.size == 0 {
        return None;
    }
    let (start, end) = (info.start?, info.end?);
    if from < start || from > end {
        return None;
    }
    Some(-1 - (end - from) as i64 - READ_MARGIN)
}

async fn write_entry(
    persistence: Arc<Persistence>,
    name: String,
    entry: Entry,
    expiry: Option<u64>,
    max_length: usize,
) -> Result<Entry> {
    let json = serde_json::to_string(&entry).map_err(|e| Error::InvalidEntry(e.to_string()))?;

    let mut batch = Batch::new();
    batch.publish(&name, &json);
    if max_length > 0 {
        batch.rpush(&name, &json);
    }
    match expiry {
        Some(secs) => {
            batch.expire(&name, secs);
        }
        None => warn!(list = %name, "list written without an expiry; key will not expire"),
    }
    if max_length > 0 {
        batch.ltrim(&name, -(max_length as i64), -1);
    }

    persistence.redis()?.exec(batch).await?;
    persistence.metrics().list_pushes.inc();
    debug!(list = %name, id = entry.id, "pushed");
    Ok(entry)
}

fn to_object<T: Serialize + ?Sized>(payload: &T) -> Result<Map<String, Value>> {
    match serde_json::to_value(payload) {
        Ok(Value::Object(mut map)) => {
            map.remove("id");
            Ok(map)
        }
        Ok(other) => Err(Error::InvalidEntry(format!("got {other}"))),
        Err(e) => Err(Error::InvalidEntry(e.to_string())),
    }
}
