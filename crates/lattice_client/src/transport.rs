//! Poll-style RPC plumbing shared by the commit task and the transport.
//!
//! The transport is out of tree: concrete `Session` implementations can sit
//! on gRPC, in-memory channels, or test harnesses. The task never blocks on
//! I/O; it hands the transport an `RpcHandle` at send time and polls it on
//! later scheduling passes.

use std::sync::{Arc, Mutex};

use bytes::Bytes;

/// Progress of one outstanding RPC.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RpcState {
    #[default]
    NotStarted,
    InProgress,
    /// A response buffer is available.
    Finished,
    /// Transport-level failure; no response will arrive.
    Failed,
}

#[derive(Debug, Default)]
struct RpcSlot {
    state: RpcState,
    response: Option<Bytes>,
}

/// Completion slot shared between the task and the transport.
///
/// The task side polls `is_ready`/`state` and takes the response; the
/// transport side calls `complete` or `fail` exactly once.
#[derive(Clone, Debug, Default)]
pub struct RpcHandle {
    slot: Arc<Mutex<RpcSlot>>,
}

impl RpcHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Completion test; true once the transport finished or failed the RPC.
    pub fn is_ready(&self) -> bool {
        matches!(self.state(), RpcState::Finished | RpcState::Failed)
    }

    pub fn state(&self) -> RpcState {
        self.slot.lock().map(|slot| slot.state).unwrap_or(RpcState::Failed)
    }

    /// The response buffer, once `state` is `Finished`.
    pub fn response(&self) -> Option<Bytes> {
        self.slot.lock().ok().and_then(|slot| slot.response.clone())
    }

    /// Mark the RPC dispatched. Called by the sender before handing the
    /// request to the session.
    pub fn start(&self) {
        if let Ok(mut slot) = self.slot.lock() {
            slot.state = RpcState::InProgress;
        }
    }

    /// Transport side: deliver the response and mark the RPC finished.
    pub fn complete(&self, response: Bytes) {
        if let Ok(mut slot) = self.slot.lock() {
            slot.response = Some(response);
            slot.state = RpcState::Finished;
        }
    }

    /// Transport side: record a transport-level failure.
    pub fn fail(&self) {
        if let Ok(mut slot) = self.slot.lock() {
            slot.state = RpcState::Failed;
        }
    }
}

/// One cached connection to a master.
pub trait Session: Send + Sync {
    /// Stable address of the server behind this session. Used as the
    /// equality token when batching consecutive ops onto one RPC.
    fn service_locator(&self) -> &str;

    /// Dispatch a request; the transport later completes or fails `handle`.
    fn send_request(&self, request: Bytes, handle: RpcHandle);
}

pub type SessionRef = Arc<dyn Session>;

/// Owner of the session cache.
pub trait SessionManager: Send + Sync {
    /// Discard a cached session after a transport-level failure so the next
    /// lookup opens a fresh connection.
    fn flush_session(&self, service_locator: &str);
}
