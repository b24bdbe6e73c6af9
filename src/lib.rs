pub mod config;
pub mod coordination;
pub mod error;
pub mod metrics;
pub mod persistence;
pub mod store;

pub use coordination::connection::Connection;
pub use coordination::id_gen::IdGen;
pub use coordination::list::{Entry, List, ListInfo};
pub use coordination::lock::{Lock, LockEvent};
pub use coordination::registry::ConnectionRegistry;
pub use error::{Error, Result};
pub use persistence::{OrderPolicy, Persistence};
