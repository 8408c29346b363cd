//! A replicated key-value store consistent via the Raft consensus algorithm.
//!
//! The hard engineering lives in [`replica::Replica`]: the per-replica role
//! state machine, election, log replication with commit-index advancement
//! and conflict resolution, and the client-facing get/put pipeline
//! (redirect, queue during elections, MID-based at-most-once acknowledgement).

pub mod election;
pub mod kv;
pub mod message;
pub mod raftlog;
pub mod replica;
pub mod role;
pub mod transport;

pub use kv::Kv;
pub use message::{Body, Command, LogEntry, Message, Mid, BROADCAST};
pub use replica::{Replica, ReplicaState};
pub use role::{LeaderState, Role};
