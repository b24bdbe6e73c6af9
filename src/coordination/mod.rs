//! Coordination primitives over the shared store.
//!
//! Connections with coalesced establish/teardown, lease locks with local
//! expiry notification, a FIFO id allocator serialized under a lease, and a
//! trimmed, replayable append log.  All shared state lives in the store so
//! that any number of processes can cooperate on the same keys.

pub mod connection;
pub mod id_gen;
pub mod list;
pub mod lock;
pub mod node;
pub mod registry;
