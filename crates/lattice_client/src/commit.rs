//! The transaction commit task.
//!
//! A task accumulates tentative read/write/remove ops in an ordered commit
//! cache, then drives the two-phase commit protocol against the masters
//! owning the affected keys: prepare RPCs collect votes, decision RPCs carry
//! the final outcome. The task is driven incrementally from the client poll
//! loop via [`CommitTask::perform_step`]; it never blocks on I/O.
//!
//! Retries are entry-level, not task-level: a transport failure or a moved
//! tablet resets the affected entries to pending and rewinds the batching
//! cursor, while assigned rpc ids and the participant list stay fixed so
//! servers can deduplicate.

use std::collections::BTreeMap;
use std::ops::Bound;

use anyhow::anyhow;
use bytes::{Bytes, BytesMut};

use crate::context::ClientContext;
use crate::object::{key_hash, KeyHash, ObjectBuffer, TableId};
use crate::transport::{RpcHandle, RpcState, SessionRef};
use crate::wire::{
    ClientLease, OpKind, RejectRules, RpcStatus, StatusError, TxDecision, TxDecisionRequest,
    TxDecisionResponse, TxParticipant, TxPrepareRequest, TxPrepareResponse, Vote,
};

/// Identity of a cached op: the tablet-routing key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct CacheKey {
    pub table_id: TableId,
    pub key_hash: KeyHash,
}

/// Ordering key inside the commit cache. The hash is imperfect, so distinct
/// keys may share a `CacheKey`; `seq` keeps colliding entries apart while
/// preserving ascending `(table_id, key_hash)` order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct EntryId {
    key: CacheKey,
    seq: u64,
}

impl EntryId {
    const FIRST: EntryId = EntryId {
        key: CacheKey {
            table_id: 0,
            key_hash: 0,
        },
        seq: 0,
    };
}

/// Protocol progress of one cached op.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum EntryState {
    /// Not yet carried by a live RPC in the current phase.
    #[default]
    Pending,
    /// Carried by a prepare RPC.
    Prepare,
    /// Carried by a decision RPC.
    Decide,
}

/// One tentative op in the commit cache.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub kind: OpKind,
    pub reject_rules: RejectRules,
    object: ObjectBuffer,
    rpc_id: u64,
    state: EntryState,
}

impl CacheEntry {
    /// The materialised key+value payload.
    pub fn object(&self) -> &ObjectBuffer {
        &self.object
    }

    /// The participant-slot id assigned at commit start; 0 before then.
    pub fn rpc_id(&self) -> u64 {
        self.rpc_id
    }

    /// Replace the cached value, keeping the key. Used by the layer above
    /// when the same key is written again inside one transaction.
    pub fn set_value(&mut self, value: &[u8]) {
        let key = self.object.key().to_vec();
        self.object = ObjectBuffer::new(&key, value);
    }
}

/// Phase of the commit protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    Init,
    Prepare,
    Decision,
    Done,
}

type CommitCache = BTreeMap<EntryId, CacheEntry>;

/// Client-side driver of one transaction commit.
pub struct CommitTask {
    state: TaskState,
    status: RpcStatus,
    decision: TxDecision,
    lease: ClientLease,
    /// First id of this task's contiguous rpc-id block; 0 before INIT runs.
    tx_id: u64,
    participant_count: u32,
    /// Pre-serialised participant tuples, shared by every prepare RPC.
    participant_list: Bytes,
    cache: CommitCache,
    next_seq: u64,
    /// Lower bound of the next entry to batch; `None` once the walk hit the
    /// end of the cache for the current phase.
    cursor: Option<EntryId>,
    prepare_rpcs: Vec<PrepareRpc>,
    decision_rpcs: Vec<DecisionRpc>,
}

impl CommitTask {
    pub fn new() -> Self {
        Self {
            state: TaskState::Init,
            status: RpcStatus::Ok,
            decision: TxDecision::Invalid,
            lease: ClientLease::default(),
            tx_id: 0,
            participant_count: 0,
            participant_list: Bytes::new(),
            cache: BTreeMap::new(),
            next_seq: 0,
            cursor: None,
            prepare_rpcs: Vec::new(),
            decision_rpcs: Vec::new(),
        }
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn is_done(&self) -> bool {
        self.state == TaskState::Done
    }

    /// Terminal status; `Ok` unless a fatal protocol error stopped the task.
    pub fn status(&self) -> RpcStatus {
        self.status
    }

    pub fn decision(&self) -> TxDecision {
        self.decision
    }

    /// Base rpc id of the block reserved at commit start.
    pub fn tx_id(&self) -> u64 {
        self.tx_id
    }

    pub fn participant_count(&self) -> u32 {
        self.participant_count
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Find the cache entry holding `key`, walking past hash collisions.
    ///
    /// The returned reference is invalidated by any later cache mutation.
    pub fn find_entry(&self, table_id: TableId, key: &[u8]) -> Option<&CacheEntry> {
        let target = CacheKey {
            table_id,
            key_hash: key_hash(key),
        };
        let from = EntryId {
            key: target,
            seq: 0,
        };
        for (id, entry) in self.cache.range(from..) {
            if id.key != target {
                break;
            }
            if entry.object.key() == key {
                return Some(entry);
            }
        }
        None
    }

    /// Mutable variant of [`find_entry`](Self::find_entry).
    pub fn find_entry_mut(&mut self, table_id: TableId, key: &[u8]) -> Option<&mut CacheEntry> {
        let target = CacheKey {
            table_id,
            key_hash: key_hash(key),
        };
        let from = EntryId {
            key: target,
            seq: 0,
        };
        for (id, entry) in self.cache.range_mut(from..) {
            if id.key != target {
                break;
            }
            if entry.object.key() == key {
                return Some(entry);
            }
        }
        None
    }

    /// Insert a fresh entry for `(table_id, key)` holding `value`.
    ///
    /// The entry's kind is left `Invalid` for the layer above to assign.
    /// Colliding hashes land as additional entries in the same bucket;
    /// duplicate full keys are not detected here. Must not be called once
    /// the task has left INIT.
    pub fn insert_entry(
        &mut self,
        table_id: TableId,
        key: &[u8],
        value: &[u8],
    ) -> &mut CacheEntry {
        debug_assert!(
            self.state == TaskState::Init,
            "inserts are forbidden once commit has started"
        );
        let id = EntryId {
            key: CacheKey {
                table_id,
                key_hash: key_hash(key),
            },
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.cache.entry(id).or_insert_with(|| CacheEntry {
            kind: OpKind::Invalid,
            reject_rules: RejectRules::default(),
            object: ObjectBuffer::new(key, value),
            rpc_id: 0,
            state: EntryState::Pending,
        })
    }

    /// Make incremental progress toward commit.
    ///
    /// Non-blocking: reaps completed RPCs, issues at most one new RPC per
    /// phase, and advances the state machine as far as synchronously
    /// possible. A task can run INIT through the start of DECISION in one
    /// call when nothing is outstanding.
    pub fn perform_step(&mut self, ctx: &ClientContext) {
        if let Err(err) = self.step(ctx) {
            // Any fatal protocol problem stops the whole commit.
            self.prepare_rpcs.clear();
            self.decision_rpcs.clear();
            self.status = err
                .downcast_ref::<StatusError>()
                .map(|e| e.0)
                .unwrap_or(RpcStatus::InternalError);
            if let Ok(mut tracker) = ctx.tracker() {
                tracker.rpc_finished(self.tx_id);
            }
            tracing::warn!(status = ?self.status, error = %err, "commit task failed");
            self.state = TaskState::Done;
        }
    }

    fn step(&mut self, ctx: &ClientContext) -> anyhow::Result<()> {
        if self.state == TaskState::Init {
            self.init_task(ctx)?;
            self.cursor = Some(EntryId::FIRST);
            self.state = TaskState::Prepare;
        }
        if self.state == TaskState::Prepare {
            self.process_prepare_rpcs(ctx)?;
            self.send_prepare_rpc(ctx)?;
            if self.prepare_rpcs.is_empty() && self.peek_cursor().is_none() {
                if self.decision != TxDecision::Abort {
                    self.decision = TxDecision::Commit;
                }
                self.cursor = Some(EntryId::FIRST);
                self.state = TaskState::Decision;
            }
        }
        if self.state == TaskState::Decision {
            self.process_decision_rpcs(ctx)?;
            self.send_decision_rpc(ctx)?;
            if self.decision_rpcs.is_empty() && self.peek_cursor().is_none() {
                ctx.tracker()?.rpc_finished(self.tx_id);
                self.state = TaskState::Done;
            }
        }
        Ok(())
    }

    /// Acquire the lease, reserve the rpc-id block, and build the
    /// participant list in cache order.
    fn init_task(&mut self, ctx: &ClientContext) -> anyhow::Result<()> {
        self.lease = ctx.lease_provider.get_lease();
        self.tx_id = ctx.tracker()?.new_rpc_id_block(self.cache.len() as u64);

        let mut list = BytesMut::with_capacity(self.cache.len() * TxParticipant::WIRE_LEN);
        for (i, (id, entry)) in self.cache.iter_mut().enumerate() {
            entry.rpc_id = self.tx_id + i as u64;
            TxParticipant {
                table_id: id.key.table_id,
                key_hash: id.key.key_hash,
                rpc_id: entry.rpc_id,
            }
            .encode(&mut list);
        }
        self.participant_count = self.cache.len() as u32;
        self.participant_list = list.freeze();
        Ok(())
    }

    /// First entry at or after the cursor, if any.
    fn peek_cursor(&self) -> Option<EntryId> {
        let from = self.cursor?;
        self.cache.range(from..).next().map(|(id, _)| *id)
    }

    /// Move the cursor past `id`.
    fn advance_cursor(&mut self, id: EntryId) {
        self.cursor = self
            .cache
            .range((Bound::Excluded(id), Bound::Unbounded))
            .next()
            .map(|(next, _)| *next);
    }

    /// Batch consecutive same-server entries into one new prepare RPC and
    /// dispatch it. At most one RPC is created per call.
    fn send_prepare_rpc(&mut self, ctx: &ClientContext) -> anyhow::Result<()> {
        let mut next_rpc: Option<PrepareRpc> = None;
        while let Some(id) = self.peek_cursor() {
            let Some(entry) = self.cache.get(&id) else {
                break;
            };
            if entry.state == EntryState::Prepare {
                self.advance_cursor(id);
                continue;
            }

            let session = ctx.finder.lookup(id.key.table_id, id.key.key_hash)?;
            if next_rpc.is_none() {
                next_rpc = Some(PrepareRpc::new(
                    session.clone(),
                    self.lease,
                    self.participant_list.clone(),
                    self.participant_count,
                ));
            }
            let Some(rpc) = next_rpc.as_mut() else {
                break;
            };
            if rpc.locator() != Some(session.service_locator())
                || rpc.request.op_count() >= ctx.config.max_ops_per_rpc
            {
                break;
            }
            if let Some(entry) = self.cache.get_mut(&id) {
                rpc.append_op(id, entry);
            }
            self.advance_cursor(id);
        }
        if let Some(mut rpc) = next_rpc {
            if rpc.request.op_count() > 0 {
                rpc.send(ctx)?;
                self.prepare_rpcs.push(rpc);
            }
        }
        Ok(())
    }

    /// Reap every completed prepare RPC, aggregating votes.
    fn process_prepare_rpcs(&mut self, ctx: &ClientContext) -> anyhow::Result<()> {
        let rpcs = std::mem::take(&mut self.prepare_rpcs);
        let mut still_in_flight = Vec::with_capacity(rpcs.len());
        for mut rpc in rpcs {
            if !rpc.is_ready() {
                still_in_flight.push(rpc);
                continue;
            }
            if rpc.state() == RpcState::Failed {
                tracing::debug!(ops = rpc.ops.len(), "prepare transport failure, will retry");
                rpc.handle_transport_error(ctx, &mut self.cache, &mut self.cursor);
                continue;
            }
            let response = rpc
                .handle
                .response()
                .ok_or_else(|| anyhow!("finished prepare rpc has no response"))?;
            let response = TxPrepareResponse::decode(response)?;
            match response.status {
                RpcStatus::Ok => {
                    if response.vote != Vote::Commit {
                        // Abort is sticky for the rest of the task.
                        self.decision = TxDecision::Abort;
                    }
                }
                RpcStatus::UnknownTablet => {
                    tracing::debug!(ops = rpc.ops.len(), "prepare hit a moved tablet, will retry");
                    let _ = rpc.check_status(response.status, ctx, &mut self.cache, &mut self.cursor);
                }
                status => return Err(StatusError(status).into()),
            }
        }
        self.prepare_rpcs = still_in_flight;
        Ok(())
    }

    /// Batch consecutive same-server entries into one new decision RPC and
    /// dispatch it. Mirrors the prepare batcher; entries already informed of
    /// the decision are skipped.
    fn send_decision_rpc(&mut self, ctx: &ClientContext) -> anyhow::Result<()> {
        let mut next_rpc: Option<DecisionRpc> = None;
        while let Some(id) = self.peek_cursor() {
            let Some(entry) = self.cache.get(&id) else {
                break;
            };
            if entry.state == EntryState::Decide {
                self.advance_cursor(id);
                continue;
            }

            let session = ctx.finder.lookup(id.key.table_id, id.key.key_hash)?;
            if next_rpc.is_none() {
                next_rpc = Some(DecisionRpc::new(
                    session.clone(),
                    self.decision,
                    self.lease.lease_id,
                ));
            }
            let Some(rpc) = next_rpc.as_mut() else {
                break;
            };
            if rpc.locator() != Some(session.service_locator())
                || rpc.request.participant_count() >= ctx.config.max_ops_per_rpc
            {
                break;
            }
            if let Some(entry) = self.cache.get_mut(&id) {
                rpc.append_op(id, entry);
            }
            self.advance_cursor(id);
        }
        if let Some(mut rpc) = next_rpc {
            if rpc.request.participant_count() > 0 {
                rpc.send(ctx)?;
                self.decision_rpcs.push(rpc);
            }
        }
        Ok(())
    }

    /// Reap every completed decision RPC. The vote is final by now; this
    /// phase never mutates the decision.
    fn process_decision_rpcs(&mut self, ctx: &ClientContext) -> anyhow::Result<()> {
        let rpcs = std::mem::take(&mut self.decision_rpcs);
        let mut still_in_flight = Vec::with_capacity(rpcs.len());
        for mut rpc in rpcs {
            if !rpc.is_ready() {
                still_in_flight.push(rpc);
                continue;
            }
            if rpc.state() == RpcState::Failed {
                tracing::debug!(ops = rpc.ops.len(), "decision transport failure, will retry");
                rpc.handle_transport_error(ctx, &mut self.cache, &mut self.cursor);
                continue;
            }
            let response = rpc
                .handle
                .response()
                .ok_or_else(|| anyhow!("finished decision rpc has no response"))?;
            let response = TxDecisionResponse::decode(response)?;
            match response.status {
                RpcStatus::Ok => {}
                RpcStatus::UnknownTablet => {
                    tracing::debug!(ops = rpc.ops.len(), "decision hit a moved tablet, will retry");
                    let _ = rpc.check_status(response.status, ctx, &mut self.cache, &mut self.cursor);
                }
                status => return Err(StatusError(status).into()),
            }
        }
        self.decision_rpcs = still_in_flight;
        Ok(())
    }
}

impl Default for CommitTask {
    fn default() -> Self {
        Self::new()
    }
}

/// Capability set shared by prepare and decision RPCs.
///
/// The payloads differ, but retry handling is identical: reset every carried
/// entry for another attempt and rewind the task cursor so the batcher
/// revisits the whole cache in order. The rewind is deliberately coarse;
/// entries still in their phase state are skipped cheaply on the re-scan.
trait TaskRpc {
    fn session_slot(&mut self) -> &mut Option<SessionRef>;
    fn op_ids(&self) -> &[EntryId];
    fn handle(&self) -> &RpcHandle;

    /// Dispatch on the bound session.
    fn send(&mut self, ctx: &ClientContext) -> anyhow::Result<()>;

    /// Non-blocking completion test.
    fn is_ready(&self) -> bool {
        self.handle().is_ready()
    }

    fn state(&self) -> RpcState {
        self.handle().state()
    }

    /// Queue every op carried by this RPC for another attempt: flush the
    /// possibly stale owner mappings, reset the entries to pending, and
    /// rewind the cursor to the start of the cache.
    fn retry_request(
        &self,
        ctx: &ClientContext,
        cache: &mut CommitCache,
        cursor: &mut Option<EntryId>,
    ) {
        for id in self.op_ids() {
            ctx.finder.flush(id.key.table_id);
            if let Some(entry) = cache.get_mut(id) {
                entry.state = EntryState::Pending;
            }
        }
        *cursor = Some(EntryId::FIRST);
    }

    /// Handle a retryable server status. Reports handled.
    fn check_status(
        &self,
        status: RpcStatus,
        ctx: &ClientContext,
        cache: &mut CommitCache,
        cursor: &mut Option<EntryId>,
    ) -> bool {
        if status == RpcStatus::UnknownTablet {
            self.retry_request(ctx, cache, cursor);
        }
        true
    }

    /// Discard the failed session and arrange a retry of every carried op.
    fn handle_transport_error(
        &mut self,
        ctx: &ClientContext,
        cache: &mut CommitCache,
        cursor: &mut Option<EntryId>,
    ) {
        if let Some(session) = self.session_slot().take() {
            ctx.sessions.flush_session(session.service_locator());
        }
        self.retry_request(ctx, cache, cursor);
    }
}

/// A live prepare RPC and the cache entries it carries.
struct PrepareRpc {
    session: Option<SessionRef>,
    handle: RpcHandle,
    request: TxPrepareRequest,
    /// Back-references into the commit cache, re-indexed on reap/retry.
    ops: Vec<EntryId>,
}

impl PrepareRpc {
    fn new(
        session: SessionRef,
        lease: ClientLease,
        participant_list: Bytes,
        participant_count: u32,
    ) -> Self {
        Self {
            session: Some(session),
            handle: RpcHandle::new(),
            request: TxPrepareRequest::new(lease, participant_list, participant_count),
            ops: Vec::new(),
        }
    }

    fn locator(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.service_locator())
    }

    /// Append one cached op to the request and mark it carried.
    ///
    /// An entry whose kind was never assigned is logged and skipped; the
    /// task must keep going.
    fn append_op(&mut self, id: EntryId, entry: &mut CacheEntry) {
        match entry.kind {
            OpKind::Read => self.request.append_read_op(
                id.key.table_id,
                entry.rpc_id,
                entry.object.key(),
                &entry.reject_rules,
            ),
            OpKind::Remove => self.request.append_remove_op(
                id.key.table_id,
                entry.rpc_id,
                entry.object.key(),
                &entry.reject_rules,
            ),
            OpKind::Write => self.request.append_write_op(
                id.key.table_id,
                entry.rpc_id,
                &entry.object,
                &entry.reject_rules,
            ),
            OpKind::Invalid => {
                tracing::error!(table_id = id.key.table_id, "unknown transaction op kind");
                return;
            }
        }
        entry.state = EntryState::Prepare;
        self.ops.push(id);
    }
}

impl TaskRpc for PrepareRpc {
    fn session_slot(&mut self) -> &mut Option<SessionRef> {
        &mut self.session
    }

    fn op_ids(&self) -> &[EntryId] {
        &self.ops
    }

    fn handle(&self) -> &RpcHandle {
        &self.handle
    }

    /// The ack id is sampled from the tracker at send time.
    fn send(&mut self, ctx: &ClientContext) -> anyhow::Result<()> {
        self.request.ack_id = ctx.tracker()?.ack_id();
        self.handle.start();
        if let Some(session) = &self.session {
            session.send_request(self.request.encode(), self.handle.clone());
        }
        Ok(())
    }
}

/// A live decision RPC and the cache entries it carries.
struct DecisionRpc {
    session: Option<SessionRef>,
    handle: RpcHandle,
    request: TxDecisionRequest,
    /// Back-references into the commit cache, re-indexed on reap/retry.
    ops: Vec<EntryId>,
}

impl DecisionRpc {
    fn new(session: SessionRef, decision: TxDecision, lease_id: u64) -> Self {
        Self {
            session: Some(session),
            handle: RpcHandle::new(),
            request: TxDecisionRequest::new(decision, lease_id),
            ops: Vec::new(),
        }
    }

    fn locator(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.service_locator())
    }

    fn append_op(&mut self, id: EntryId, entry: &mut CacheEntry) {
        self.request.append_participant(TxParticipant {
            table_id: id.key.table_id,
            key_hash: id.key.key_hash,
            rpc_id: entry.rpc_id,
        });
        entry.state = EntryState::Decide;
        self.ops.push(id);
    }
}

impl TaskRpc for DecisionRpc {
    fn session_slot(&mut self) -> &mut Option<SessionRef> {
        &mut self.session
    }

    fn op_ids(&self) -> &[EntryId] {
        &self.ops
    }

    fn handle(&self) -> &RpcHandle {
        &self.handle
    }

    fn send(&mut self, _ctx: &ClientContext) -> anyhow::Result<()> {
        self.handle.start();
        if let Some(session) = &self.session {
            session.send_request(self.request.encode(), self.handle.clone());
        }
        Ok(())
    }
}
