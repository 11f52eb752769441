//! Client-side view of cluster metadata.
//!
//! The commit task resolves key owners through these traits; the concrete
//! implementations (coordinator-backed tablet map, lease agent) live with
//! the transport.

use crate::object::{KeyHash, TableId};
use crate::transport::SessionRef;
use crate::wire::ClientLease;

/// Cached tablet-to-master mapping.
pub trait ObjectFinder: Send + Sync {
    /// Resolve the session for the master currently owning
    /// `(table_id, key_hash)`.
    ///
    /// Fails when the table does not exist; the error may carry a
    /// [`StatusError`](crate::wire::StatusError) to surface the exact
    /// protocol status.
    fn lookup(&self, table_id: TableId, key_hash: KeyHash) -> anyhow::Result<SessionRef>;

    /// Invalidate cached mappings for `table_id` after a topology change.
    fn flush(&self, table_id: TableId);
}

/// Source of the client's lease.
pub trait LeaseProvider: Send + Sync {
    /// The current lease, renewing it if necessary.
    fn get_lease(&self) -> ClientLease;
}
