//! Shared in-memory fake cluster for commit-protocol tests.
//!
//! The cluster implements every collaborator trait the commit task consumes:
//! tablet routing, session cache, lease service, and the transport poll
//! hook. Masters record every decoded request and answer from a per-kind
//! script, defaulting to success.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use lattice_client::cluster::{LeaseProvider, ObjectFinder};
use lattice_client::commit::CommitTask;
use lattice_client::context::{ClientConfig, ClientContext, Dispatch};
use lattice_client::object::{key_hash, KeyHash, TableId};
use lattice_client::transport::{RpcHandle, Session, SessionManager, SessionRef};
use lattice_client::wire::{
    ClientLease, DecisionRequestFrame, OpKind, Opcode, PrepareRequestFrame, RpcStatus, StatusError,
    TxDecisionResponse, TxPrepareResponse, Vote,
};

pub const TEST_LEASE_ID: u64 = 42;

/// Scripted reply to one prepare request.
enum PrepareReply {
    Respond(RpcStatus, Vote),
    TransportFailure,
}

/// Scripted reply to one decision request.
enum DecisionReply {
    Respond(RpcStatus),
    TransportFailure,
}

#[derive(Default)]
struct FakeMaster {
    inbox: VecDeque<(Bytes, RpcHandle)>,
    prepare_script: VecDeque<PrepareReply>,
    decision_script: VecDeque<DecisionReply>,
    prepares: Vec<PrepareRequestFrame>,
    decisions: Vec<DecisionRequestFrame>,
}

#[derive(Default)]
struct ClusterInner {
    masters: Mutex<HashMap<String, FakeMaster>>,
    routes: Mutex<HashMap<(TableId, KeyHash), String>>,
    flushed_tables: Mutex<Vec<TableId>>,
    flushed_sessions: Mutex<Vec<String>>,
}

/// In-memory cluster of scripted masters.
#[derive(Clone, Default)]
pub struct FakeCluster {
    inner: Arc<ClusterInner>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_master(&self, locator: &str) {
        self.inner
            .masters
            .lock()
            .unwrap()
            .insert(locator.to_string(), FakeMaster::default());
    }

    /// Route `(table_id, key)` to the master at `locator`.
    pub fn route_key(&self, table_id: TableId, key: &[u8], locator: &str) {
        self.inner
            .routes
            .lock()
            .unwrap()
            .insert((table_id, key_hash(key)), locator.to_string());
    }

    pub fn script_prepare(&self, locator: &str, status: RpcStatus, vote: Vote) {
        self.with_master(locator, |m| {
            m.prepare_script.push_back(PrepareReply::Respond(status, vote))
        });
    }

    pub fn script_prepare_transport_failure(&self, locator: &str) {
        self.with_master(locator, |m| {
            m.prepare_script.push_back(PrepareReply::TransportFailure)
        });
    }

    pub fn script_decision(&self, locator: &str, status: RpcStatus) {
        self.with_master(locator, |m| {
            m.decision_script.push_back(DecisionReply::Respond(status))
        });
    }

    pub fn script_decision_transport_failure(&self, locator: &str) {
        self.with_master(locator, |m| {
            m.decision_script.push_back(DecisionReply::TransportFailure)
        });
    }

    /// Every prepare request the master has decoded, in arrival order.
    pub fn prepares(&self, locator: &str) -> Vec<PrepareRequestFrame> {
        self.with_master(locator, |m| m.prepares.clone())
    }

    /// Every decision request the master has decoded, in arrival order.
    pub fn decisions(&self, locator: &str) -> Vec<DecisionRequestFrame> {
        self.with_master(locator, |m| m.decisions.clone())
    }

    pub fn flushed_tables(&self) -> Vec<TableId> {
        self.inner.flushed_tables.lock().unwrap().clone()
    }

    pub fn flushed_sessions(&self) -> Vec<String> {
        self.inner.flushed_sessions.lock().unwrap().clone()
    }

    pub fn context(&self) -> ClientContext {
        self.context_with_config(ClientConfig::default())
    }

    pub fn context_with_config(&self, config: ClientConfig) -> ClientContext {
        let this = Arc::new(self.clone());
        ClientContext::new(
            this.clone(),
            this.clone(),
            this.clone(),
            this,
            config,
        )
    }

    /// Serve every queued request; what `Dispatch::poll` runs.
    pub fn poll_transport(&self) {
        self.serve_pending();
    }

    fn with_master<R>(&self, locator: &str, f: impl FnOnce(&mut FakeMaster) -> R) -> R {
        let mut masters = self.inner.masters.lock().unwrap();
        let master = masters
            .get_mut(locator)
            .unwrap_or_else(|| panic!("unknown master {locator}"));
        f(master)
    }

    /// Serve every queued request on every master.
    fn serve_pending(&self) {
        let mut masters = self.inner.masters.lock().unwrap();
        for master in masters.values_mut() {
            while let Some((request, handle)) = master.inbox.pop_front() {
                match Opcode::peek(&request).expect("request with valid opcode") {
                    Opcode::TxPrepare => {
                        let frame =
                            PrepareRequestFrame::decode(request).expect("decodable prepare");
                        master.prepares.push(frame);
                        match master
                            .prepare_script
                            .pop_front()
                            .unwrap_or(PrepareReply::Respond(RpcStatus::Ok, Vote::Commit))
                        {
                            PrepareReply::Respond(status, vote) => {
                                handle.complete(TxPrepareResponse { status, vote }.encode())
                            }
                            PrepareReply::TransportFailure => handle.fail(),
                        }
                    }
                    Opcode::TxDecision => {
                        let frame =
                            DecisionRequestFrame::decode(request).expect("decodable decision");
                        master.decisions.push(frame);
                        match master
                            .decision_script
                            .pop_front()
                            .unwrap_or(DecisionReply::Respond(RpcStatus::Ok))
                        {
                            DecisionReply::Respond(status) => {
                                handle.complete(TxDecisionResponse { status }.encode())
                            }
                            DecisionReply::TransportFailure => handle.fail(),
                        }
                    }
                }
            }
        }
    }
}

impl ObjectFinder for FakeCluster {
    fn lookup(&self, table_id: TableId, key_hash: KeyHash) -> anyhow::Result<SessionRef> {
        let routes = self.inner.routes.lock().unwrap();
        let locator = routes
            .get(&(table_id, key_hash))
            .ok_or(StatusError(RpcStatus::TableDoesntExist))?;
        Ok(Arc::new(FakeSession {
            locator: locator.clone(),
            inner: self.inner.clone(),
        }))
    }

    fn flush(&self, table_id: TableId) {
        self.inner.flushed_tables.lock().unwrap().push(table_id);
    }
}

impl SessionManager for FakeCluster {
    fn flush_session(&self, service_locator: &str) {
        self.inner
            .flushed_sessions
            .lock()
            .unwrap()
            .push(service_locator.to_string());
    }
}

impl LeaseProvider for FakeCluster {
    fn get_lease(&self) -> ClientLease {
        ClientLease {
            lease_id: TEST_LEASE_ID,
            lease_expiration: 1_000_000,
            timestamp: 1,
        }
    }
}

impl Dispatch for FakeCluster {
    fn poll(&self) {
        self.serve_pending();
    }
}

struct FakeSession {
    locator: String,
    inner: Arc<ClusterInner>,
}

impl Session for FakeSession {
    fn service_locator(&self) -> &str {
        &self.locator
    }

    fn send_request(&self, request: Bytes, handle: RpcHandle) {
        let mut masters = self.inner.masters.lock().unwrap();
        match masters.get_mut(&self.locator) {
            Some(master) => master.inbox.push_back((request, handle)),
            None => handle.fail(),
        }
    }
}

/// Buffer a write the way the user API would: a repeated write of the same
/// key replaces the cached value in place instead of adding an entry.
pub fn buffer_write(task: &mut CommitTask, table_id: TableId, key: &[u8], value: &[u8]) {
    if let Some(entry) = task.find_entry_mut(table_id, key) {
        entry.kind = OpKind::Write;
        entry.set_value(value);
        return;
    }
    let entry = task.insert_entry(table_id, key, value);
    entry.kind = OpKind::Write;
}

/// Insert a read op the way the user API would.
pub fn buffer_read(task: &mut CommitTask, table_id: TableId, key: &[u8]) {
    let entry = task.insert_entry(table_id, key, b"");
    entry.kind = OpKind::Read;
}

/// Insert a remove op the way the user API would.
pub fn buffer_remove(task: &mut CommitTask, table_id: TableId, key: &[u8]) {
    let entry = task.insert_entry(table_id, key, b"");
    entry.kind = OpKind::Remove;
}

/// Step the task until DONE, pumping the transport between steps.
///
/// Returns the number of `perform_step` calls used; panics if the task does
/// not finish within `max_steps`.
pub fn drive(
    task: &mut CommitTask,
    ctx: &ClientContext,
    cluster: &FakeCluster,
    max_steps: usize,
) -> usize {
    for step in 0..max_steps {
        if task.is_done() {
            return step;
        }
        task.perform_step(ctx);
        cluster.serve_pending();
    }
    assert!(task.is_done(), "task did not finish within {max_steps} steps");
    max_steps
}
