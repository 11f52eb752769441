//! Client-side transaction commit driver for the LatticeStore distributed
//! in-memory key/value store.
//!
//! A transaction buffers tentative read/write/remove ops in a
//! [`commit::CommitTask`]; committing drives a two-phase protocol against
//! the masters owning the affected keys, batching per-server requests and
//! retrying individual participants across topology changes. The transport,
//! tablet lookup, and lease services are supplied through the traits in
//! [`transport`] and [`cluster`].

pub mod cluster;
pub mod commit;
pub mod context;
pub mod manager;
pub mod object;
pub mod tracker;
pub mod transport;
pub mod wire;

pub use commit::{CacheEntry, CacheKey, CommitTask, TaskState};
pub use context::{ClientConfig, ClientContext, Dispatch};
pub use manager::TransactionManager;
pub use object::{key_hash, KeyHash, ObjectBuffer, TableId};
pub use tracker::RpcTracker;
pub use transport::{RpcHandle, RpcState, Session, SessionManager, SessionRef};
pub use wire::{ClientLease, OpKind, RejectRules, RpcStatus, TxDecision, Vote};
