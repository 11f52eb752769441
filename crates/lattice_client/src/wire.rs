//! Wire format for the commit protocol.
//!
//! All layouts are little-endian with fixed-width headers; they are bit-exact
//! at the client/server boundary. Encoders are used by the commit task;
//! decoders exist so transports and test harnesses can parse requests without
//! a server build.
//!
//! Every request begins with a common `[ opcode u32 ]` header so servers can
//! dispatch before parsing the body.
//!
//! Prepare request layout (after the opcode):
//! `[ lease (24) ][ participant_count u32 ][ op_count u32 ][ ack_id u64 ]`
//! followed by `participant_count` participant tuples and `op_count` op
//! records. Each op record starts with its kind tag:
//! - read/remove: `[ kind u32 ][ table_id u64 ][ rpc_id u64 ][ key_len u16 ]`
//!   `[ reject_rules (12) ][ key bytes ]`
//! - write: `[ kind u32 ][ table_id u64 ][ rpc_id u64 ][ object_size u32 ]`
//!   `[ reject_rules (12) ][ object bytes ]`

use std::fmt;

use anyhow::{bail, ensure};
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::object::{KeyHash, ObjectBuffer, TableId};

/// Request opcode, the first field of every request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Opcode {
    TxPrepare,
    TxDecision,
}

impl Opcode {
    fn to_wire(self) -> u32 {
        match self {
            Opcode::TxPrepare => 1,
            Opcode::TxDecision => 2,
        }
    }

    fn from_wire(raw: u32) -> anyhow::Result<Self> {
        Ok(match raw {
            1 => Opcode::TxPrepare,
            2 => Opcode::TxDecision,
            other => bail!("unknown opcode {other}"),
        })
    }

    /// Read the opcode of an encoded request without consuming it.
    pub fn peek(buf: &Bytes) -> anyhow::Result<Self> {
        ensure!(buf.len() >= 4, "truncated request header");
        Self::from_wire(u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]))
    }
}

/// Server-reported status of one RPC.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RpcStatus {
    Ok,
    /// The addressed server no longer owns the tablet; retryable.
    UnknownTablet,
    TableDoesntExist,
    InternalError,
}

impl RpcStatus {
    pub(crate) fn to_wire(self) -> u32 {
        match self {
            RpcStatus::Ok => 0,
            RpcStatus::UnknownTablet => 1,
            RpcStatus::TableDoesntExist => 2,
            RpcStatus::InternalError => 3,
        }
    }

    pub(crate) fn from_wire(raw: u32) -> anyhow::Result<Self> {
        Ok(match raw {
            0 => RpcStatus::Ok,
            1 => RpcStatus::UnknownTablet,
            2 => RpcStatus::TableDoesntExist,
            3 => RpcStatus::InternalError,
            other => bail!("unknown rpc status {other}"),
        })
    }
}

/// A fatal protocol status carried as an error.
///
/// Collaborators and reap paths raise this through `anyhow`; the task's
/// catch-all downcasts it to record the terminal status.
#[derive(Clone, Copy, Debug)]
pub struct StatusError(pub RpcStatus);

impl fmt::Display for StatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rpc failed with status {:?}", self.0)
    }
}

impl std::error::Error for StatusError {}

/// A master's per-prepare verdict.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Vote {
    Commit,
    Abort,
    /// The master asks the client to abort (e.g. a reject rule fired).
    AbortRequested,
}

impl Vote {
    pub(crate) fn to_wire(self) -> u32 {
        match self {
            Vote::Commit => 1,
            Vote::Abort => 2,
            Vote::AbortRequested => 3,
        }
    }

    pub(crate) fn from_wire(raw: u32) -> anyhow::Result<Self> {
        Ok(match raw {
            1 => Vote::Commit,
            2 => Vote::Abort,
            3 => Vote::AbortRequested,
            other => bail!("unknown prepare vote {other}"),
        })
    }
}

/// The task-level outcome shipped in decision RPCs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxDecision {
    /// No decision reached yet; never sent on the wire.
    Invalid,
    Commit,
    Abort,
}

impl TxDecision {
    pub(crate) fn to_wire(self) -> u32 {
        match self {
            TxDecision::Invalid => 0,
            TxDecision::Commit => 1,
            TxDecision::Abort => 2,
        }
    }

    pub(crate) fn from_wire(raw: u32) -> anyhow::Result<Self> {
        Ok(match raw {
            0 => TxDecision::Invalid,
            1 => TxDecision::Commit,
            2 => TxDecision::Abort,
            other => bail!("unknown tx decision {other}"),
        })
    }
}

/// Kind of a cached operation.
///
/// `Invalid` is the default for a freshly inserted cache entry until the
/// layer above assigns a real kind; it is never encoded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OpKind {
    #[default]
    Invalid,
    Read,
    Remove,
    Write,
}

const OP_WIRE_READ: u32 = 1;
const OP_WIRE_REMOVE: u32 = 2;
const OP_WIRE_WRITE: u32 = 3;

/// Server-side precondition attached to one op (version fencing).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RejectRules {
    pub given_version: u64,
    pub doesnt_exist: bool,
    pub exists: bool,
    pub version_le_given: bool,
    pub version_ne_given: bool,
}

impl RejectRules {
    pub const WIRE_LEN: usize = 12;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.given_version);
        buf.put_u8(self.doesnt_exist as u8);
        buf.put_u8(self.exists as u8);
        buf.put_u8(self.version_le_given as u8);
        buf.put_u8(self.version_ne_given as u8);
    }

    fn decode(buf: &mut Bytes) -> anyhow::Result<Self> {
        ensure!(buf.remaining() >= Self::WIRE_LEN, "truncated reject rules");
        Ok(Self {
            given_version: buf.get_u64_le(),
            doesnt_exist: buf.get_u8() != 0,
            exists: buf.get_u8() != 0,
            version_le_given: buf.get_u8() != 0,
            version_ne_given: buf.get_u8() != 0,
        })
    }
}

/// Time-bounded client identity; servers use `lease_id` to fence a dead
/// client's transactions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClientLease {
    pub lease_id: u64,
    pub lease_expiration: u64,
    pub timestamp: u64,
}

impl ClientLease {
    pub const WIRE_LEN: usize = 24;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.lease_id);
        buf.put_u64_le(self.lease_expiration);
        buf.put_u64_le(self.timestamp);
    }

    fn decode(buf: &mut Bytes) -> anyhow::Result<Self> {
        ensure!(buf.remaining() >= Self::WIRE_LEN, "truncated client lease");
        Ok(Self {
            lease_id: buf.get_u64_le(),
            lease_expiration: buf.get_u64_le(),
            timestamp: buf.get_u64_le(),
        })
    }
}

/// One participant slot: the tuple servers use to identify an op across the
/// prepare and decision phases.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TxParticipant {
    pub table_id: TableId,
    pub key_hash: KeyHash,
    pub rpc_id: u64,
}

impl TxParticipant {
    pub const WIRE_LEN: usize = 24;

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.table_id);
        buf.put_u64_le(self.key_hash);
        buf.put_u64_le(self.rpc_id);
    }

    pub fn decode(buf: &mut Bytes) -> anyhow::Result<Self> {
        ensure!(buf.remaining() >= Self::WIRE_LEN, "truncated participant");
        Ok(Self {
            table_id: buf.get_u64_le(),
            key_hash: buf.get_u64_le(),
            rpc_id: buf.get_u64_le(),
        })
    }
}

/// Incrementally built prepare request.
///
/// The participant list is pre-serialised once per task and shared across
/// every prepare RPC; ops are appended per batched entry.
#[derive(Debug)]
pub struct TxPrepareRequest {
    pub lease: ClientLease,
    pub participant_count: u32,
    pub ack_id: u64,
    op_count: u32,
    participants: Bytes,
    ops: BytesMut,
}

impl TxPrepareRequest {
    pub fn new(lease: ClientLease, participants: Bytes, participant_count: u32) -> Self {
        Self {
            lease,
            participant_count,
            ack_id: 0,
            op_count: 0,
            participants,
            ops: BytesMut::new(),
        }
    }

    /// Number of ops appended so far; bounds batching.
    pub fn op_count(&self) -> u32 {
        self.op_count
    }

    pub fn append_read_op(
        &mut self,
        table_id: TableId,
        rpc_id: u64,
        key: &[u8],
        reject_rules: &RejectRules,
    ) {
        self.append_key_op(OP_WIRE_READ, table_id, rpc_id, key, reject_rules);
    }

    pub fn append_remove_op(
        &mut self,
        table_id: TableId,
        rpc_id: u64,
        key: &[u8],
        reject_rules: &RejectRules,
    ) {
        self.append_key_op(OP_WIRE_REMOVE, table_id, rpc_id, key, reject_rules);
    }

    pub fn append_write_op(
        &mut self,
        table_id: TableId,
        rpc_id: u64,
        object: &ObjectBuffer,
        reject_rules: &RejectRules,
    ) {
        self.ops.put_u32_le(OP_WIRE_WRITE);
        self.ops.put_u64_le(table_id);
        self.ops.put_u64_le(rpc_id);
        self.ops.put_u32_le(object.size());
        reject_rules.encode(&mut self.ops);
        self.ops.put_slice(object.as_bytes());
        self.op_count += 1;
    }

    fn append_key_op(
        &mut self,
        kind: u32,
        table_id: TableId,
        rpc_id: u64,
        key: &[u8],
        reject_rules: &RejectRules,
    ) {
        self.ops.put_u32_le(kind);
        self.ops.put_u64_le(table_id);
        self.ops.put_u64_le(rpc_id);
        self.ops.put_u16_le(key.len() as u16);
        reject_rules.encode(&mut self.ops);
        self.ops.put_slice(key);
        self.op_count += 1;
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(
            4 + ClientLease::WIRE_LEN + 16 + self.participants.len() + self.ops.len(),
        );
        buf.put_u32_le(Opcode::TxPrepare.to_wire());
        self.lease.encode(&mut buf);
        buf.put_u32_le(self.participant_count);
        buf.put_u32_le(self.op_count);
        buf.put_u64_le(self.ack_id);
        buf.put_slice(&self.participants);
        buf.put_slice(&self.ops);
        buf.freeze()
    }
}

/// One decoded prepare op record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PrepareOp {
    Read {
        table_id: TableId,
        rpc_id: u64,
        reject_rules: RejectRules,
        key: Bytes,
    },
    Remove {
        table_id: TableId,
        rpc_id: u64,
        reject_rules: RejectRules,
        key: Bytes,
    },
    Write {
        table_id: TableId,
        rpc_id: u64,
        reject_rules: RejectRules,
        object: Bytes,
    },
}

impl PrepareOp {
    pub fn rpc_id(&self) -> u64 {
        match self {
            PrepareOp::Read { rpc_id, .. }
            | PrepareOp::Remove { rpc_id, .. }
            | PrepareOp::Write { rpc_id, .. } => *rpc_id,
        }
    }
}

/// Fully decoded prepare request, for transports and test harnesses.
#[derive(Clone, Debug)]
pub struct PrepareRequestFrame {
    pub lease: ClientLease,
    pub ack_id: u64,
    pub participants: Vec<TxParticipant>,
    pub ops: Vec<PrepareOp>,
}

impl PrepareRequestFrame {
    pub fn decode(mut buf: Bytes) -> anyhow::Result<Self> {
        ensure!(buf.remaining() >= 4, "truncated request header");
        let opcode = Opcode::from_wire(buf.get_u32_le())?;
        ensure!(opcode == Opcode::TxPrepare, "not a prepare request");
        let lease = ClientLease::decode(&mut buf)?;
        ensure!(buf.remaining() >= 16, "truncated prepare header");
        let participant_count = buf.get_u32_le();
        let op_count = buf.get_u32_le();
        let ack_id = buf.get_u64_le();

        let mut participants = Vec::with_capacity(participant_count as usize);
        for _ in 0..participant_count {
            participants.push(TxParticipant::decode(&mut buf)?);
        }

        let mut ops = Vec::with_capacity(op_count as usize);
        for _ in 0..op_count {
            ops.push(Self::decode_op(&mut buf)?);
        }

        Ok(Self {
            lease,
            ack_id,
            participants,
            ops,
        })
    }

    fn decode_op(buf: &mut Bytes) -> anyhow::Result<PrepareOp> {
        ensure!(buf.remaining() >= 20, "truncated prepare op header");
        let kind = buf.get_u32_le();
        let table_id = buf.get_u64_le();
        let rpc_id = buf.get_u64_le();
        Ok(match kind {
            OP_WIRE_READ | OP_WIRE_REMOVE => {
                ensure!(buf.remaining() >= 2, "truncated key op");
                let key_len = usize::from(buf.get_u16_le());
                let reject_rules = RejectRules::decode(buf)?;
                ensure!(buf.remaining() >= key_len, "truncated op key");
                let key = buf.split_to(key_len);
                if kind == OP_WIRE_READ {
                    PrepareOp::Read {
                        table_id,
                        rpc_id,
                        reject_rules,
                        key,
                    }
                } else {
                    PrepareOp::Remove {
                        table_id,
                        rpc_id,
                        reject_rules,
                        key,
                    }
                }
            }
            OP_WIRE_WRITE => {
                ensure!(buf.remaining() >= 4, "truncated write op");
                let object_size = buf.get_u32_le() as usize;
                let reject_rules = RejectRules::decode(buf)?;
                ensure!(buf.remaining() >= object_size, "truncated op object");
                let object = buf.split_to(object_size);
                PrepareOp::Write {
                    table_id,
                    rpc_id,
                    reject_rules,
                    object,
                }
            }
            other => bail!("unknown prepare op kind {other}"),
        })
    }
}

/// Prepare response: server status plus the master's vote.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TxPrepareResponse {
    pub status: RpcStatus,
    pub vote: Vote,
}

impl TxPrepareResponse {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u32_le(self.status.to_wire());
        buf.put_u32_le(self.vote.to_wire());
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> anyhow::Result<Self> {
        ensure!(buf.remaining() >= 8, "truncated prepare response");
        Ok(Self {
            status: RpcStatus::from_wire(buf.get_u32_le())?,
            vote: Vote::from_wire(buf.get_u32_le())?,
        })
    }
}

/// Incrementally built decision request.
#[derive(Debug)]
pub struct TxDecisionRequest {
    pub decision: TxDecision,
    pub lease_id: u64,
    participant_count: u32,
    participants: BytesMut,
}

impl TxDecisionRequest {
    pub fn new(decision: TxDecision, lease_id: u64) -> Self {
        Self {
            decision,
            lease_id,
            participant_count: 0,
            participants: BytesMut::new(),
        }
    }

    /// Number of participants appended so far; bounds batching.
    pub fn participant_count(&self) -> u32 {
        self.participant_count
    }

    pub fn append_participant(&mut self, participant: TxParticipant) {
        participant.encode(&mut self.participants);
        self.participant_count += 1;
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(20 + self.participants.len());
        buf.put_u32_le(Opcode::TxDecision.to_wire());
        buf.put_u32_le(self.decision.to_wire());
        buf.put_u64_le(self.lease_id);
        buf.put_u32_le(self.participant_count);
        buf.put_slice(&self.participants);
        buf.freeze()
    }
}

/// Fully decoded decision request, for transports and test harnesses.
#[derive(Clone, Debug)]
pub struct DecisionRequestFrame {
    pub decision: TxDecision,
    pub lease_id: u64,
    pub participants: Vec<TxParticipant>,
}

impl DecisionRequestFrame {
    pub fn decode(mut buf: Bytes) -> anyhow::Result<Self> {
        ensure!(buf.remaining() >= 20, "truncated decision header");
        let opcode = Opcode::from_wire(buf.get_u32_le())?;
        ensure!(opcode == Opcode::TxDecision, "not a decision request");
        let decision = TxDecision::from_wire(buf.get_u32_le())?;
        let lease_id = buf.get_u64_le();
        let participant_count = buf.get_u32_le();
        let mut participants = Vec::with_capacity(participant_count as usize);
        for _ in 0..participant_count {
            participants.push(TxParticipant::decode(&mut buf)?);
        }
        Ok(Self {
            decision,
            lease_id,
            participants,
        })
    }
}

/// Decision response: server status only.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TxDecisionResponse {
    pub status: RpcStatus,
}

impl TxDecisionResponse {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u32_le(self.status.to_wire());
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> anyhow::Result<Self> {
        ensure!(buf.remaining() >= 4, "truncated decision response");
        Ok(Self {
            status: RpcStatus::from_wire(buf.get_u32_le())?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepare_request_layout_is_fixed() {
        let lease = ClientLease {
            lease_id: 7,
            lease_expiration: 100,
            timestamp: 50,
        };
        let mut participants = BytesMut::new();
        TxParticipant {
            table_id: 1,
            key_hash: 2,
            rpc_id: 3,
        }
        .encode(&mut participants);

        let mut req = TxPrepareRequest::new(lease, participants.freeze(), 1);
        req.ack_id = 9;
        req.append_read_op(1, 3, b"key", &RejectRules::default());

        let encoded = req.encode();
        // opcode (4) + header (40) + one participant (24) + read op (34 + 3)
        assert_eq!(encoded.len(), 4 + 40 + 24 + 4 + 8 + 8 + 2 + 12 + 3);
        assert_eq!(Opcode::peek(&encoded).unwrap(), Opcode::TxPrepare);
        // ack_id sits at the end of the fixed header
        assert_eq!(u64::from_le_bytes(encoded[36..44].try_into().unwrap()), 9);

        let frame = PrepareRequestFrame::decode(encoded).unwrap();
        assert_eq!(frame.lease, lease);
        assert_eq!(frame.ack_id, 9);
        assert_eq!(frame.participants.len(), 1);
        assert_eq!(
            frame.ops,
            vec![PrepareOp::Read {
                table_id: 1,
                rpc_id: 3,
                reject_rules: RejectRules::default(),
                key: Bytes::from_static(b"key"),
            }]
        );
    }

    #[test]
    fn write_op_carries_full_object() {
        let mut req = TxPrepareRequest::new(ClientLease::default(), Bytes::new(), 0);
        let object = ObjectBuffer::new(b"k", b"value");
        req.append_write_op(4, 11, &object, &RejectRules::default());

        let frame = PrepareRequestFrame::decode(req.encode()).unwrap();
        match &frame.ops[0] {
            PrepareOp::Write {
                table_id,
                rpc_id,
                object: buf,
                ..
            } => {
                assert_eq!((*table_id, *rpc_id), (4, 11));
                assert_eq!(buf.as_ref(), object.as_bytes().as_ref());
            }
            other => panic!("unexpected op: {other:?}"),
        }
    }

    #[test]
    fn decision_request_round_trips() {
        let mut req = TxDecisionRequest::new(TxDecision::Abort, 77);
        req.append_participant(TxParticipant {
            table_id: 5,
            key_hash: 6,
            rpc_id: 8,
        });
        let frame = DecisionRequestFrame::decode(req.encode()).unwrap();
        assert_eq!(frame.decision, TxDecision::Abort);
        assert_eq!(frame.lease_id, 77);
        assert_eq!(frame.participants[0].rpc_id, 8);
    }

    #[test]
    fn unknown_status_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(99);
        buf.put_u32_le(1);
        assert!(TxPrepareResponse::decode(buf.freeze()).is_err());
    }
}
