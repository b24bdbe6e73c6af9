//! Error taxonomy for the coordination layer.
//!
//! Every variant is `Clone` so that one establish failure can be handed to
//! every caller queued on the same connection attempt.

/// Errors surfaced by connections, leases, allocators and logs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Missing or inconsistent connection descriptor.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A store command failed on the wire or was rejected by the server.
    #[error("{command} failed: {reason}")]
    Transport { command: String, reason: String },

    /// A session accessor was used before `connect()` completed.
    #[error("not connected to the store ({0})")]
    NotConnected(&'static str),

    /// The replay cursor fell outside the retained window of a list.
    #[error("sync-error: cursor {from} outside retained window [{start:?}, {end:?}] (size {size})")]
    Sync {
        from: u64,
        start: Option<u64>,
        end: Option<u64>,
        size: u64,
    },

    /// A stored value did not decode as the expected format.
    #[error("corrupted value at {key}: {reason}")]
    Corrupted { key: String, reason: String },

    /// A list payload that is not a JSON object.
    #[error("list entries must be JSON objects: {0}")]
    InvalidEntry(String),

    /// The allocator or connection owning a pending request went away.
    #[error("request canceled: {0}")]
    Canceled(String),
}

impl Error {
    pub(crate) fn transport(command: impl Into<String>, reason: impl ToString) -> Self {
        Self::Transport {
            command: command.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether this is the replay-window signal rather than a failure.
    pub fn is_sync(&self) -> bool {
        matches!(self, Self::Sync { .. })
    }
}

impl From<fred::error::Error> for Error {
    fn from(e: fred::error::Error) -> Self {
        Self::transport(format!("{:?}", e.kind()), e.details())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_error_is_flagged() {
        let e = Error::Sync {
            from: 5,
            start: Some(1),
            end: Some(3),
            size: 3,
        };
        assert!(e.is_sync());
        assert!(e.to_string().starts_with("sync-error"));
        assert!(!Error::NotConnected("client").is_sync());
    }
}
