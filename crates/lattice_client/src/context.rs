//! Shared client state handed to every task step.

use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::anyhow;

use crate::cluster::{LeaseProvider, ObjectFinder};
use crate::tracker::RpcTracker;
use crate::transport::SessionManager;

/// Operational tuning for the commit driver.
#[derive(Clone, Copy, Debug)]
pub struct ClientConfig {
    /// Upper bound on ops batched into one prepare or decision RPC.
    ///
    /// Keeps individual requests bounded so a large transaction cannot stall
    /// a master behind one oversized RPC.
    pub max_ops_per_rpc: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_ops_per_rpc: 75,
        }
    }
}

/// Transport poll hook.
///
/// The client is single-threaded cooperative: transports make progress only
/// when the poll loop runs. `poll` must not block.
pub trait Dispatch: Send + Sync {
    fn poll(&self);
}

/// Process-wide collaborators shared by all of a client's tasks.
///
/// Everything here is accessed non-concurrently from the client's poll loop;
/// the task mutates only its own fields.
pub struct ClientContext {
    pub finder: Arc<dyn ObjectFinder>,
    pub sessions: Arc<dyn SessionManager>,
    pub lease_provider: Arc<dyn LeaseProvider>,
    pub dispatch: Arc<dyn Dispatch>,
    pub config: ClientConfig,
    tracker: Mutex<RpcTracker>,
}

impl ClientContext {
    pub fn new(
        finder: Arc<dyn ObjectFinder>,
        sessions: Arc<dyn SessionManager>,
        lease_provider: Arc<dyn LeaseProvider>,
        dispatch: Arc<dyn Dispatch>,
        config: ClientConfig,
    ) -> Self {
        Self {
            finder,
            sessions,
            lease_provider,
            dispatch,
            config,
            tracker: Mutex::new(RpcTracker::new()),
        }
    }

    /// Exclusive access to the rpc-id tracker.
    pub fn tracker(&self) -> anyhow::Result<MutexGuard<'_, RpcTracker>> {
        self.tracker
            .lock()
            .map_err(|_| anyhow!("rpc tracker mutex poisoned"))
    }
}
