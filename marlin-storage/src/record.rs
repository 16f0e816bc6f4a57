//! Log record model: the fixed record header, every record body, and their
//! byte-exact encode/decode pairs.
//!
//! Records live in log pages and may span page boundaries, so decoding goes
//! through [`RecordRead`], which hides the page walk. Encoding always
//! produces a contiguous buffer that the appender then scatters over pages.
//! Undo/redo images larger than the configured threshold are compressed;
//! the high bit of the on-disk length marks a compressed image.

use bytes::{BufMut, Bytes, BytesMut};
use zerocopy::byteorder::little_endian::{I16, I32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::error::{Error, Result};
use crate::lsa::{Lsa, LsaRepr};

/// Records are aligned to this boundary so a record header never needs
/// realignment when mapped over the page payload.
pub const MAX_ALIGNMENT: usize = 8;

/// Compressed-image marker on the 32-bit on-disk length.
const ZIP_LEN_FLAG: u32 = 0x8000_0000;

pub fn align_up(n: usize) -> usize {
    (n + MAX_ALIGNMENT - 1) & !(MAX_ALIGNMENT - 1)
}

// ---------------------------------------------------------------- types

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum RecordType {
    UndoRedo = 1,
    DiffUndoRedo = 2,
    Undo = 3,
    Redo = 4,
    DbExternRedo = 5,
    Postpone = 6,
    RunPostpone = 7,
    Compensate = 8,
    LogicalCompensate = 9,
    WillCommit = 10,
    CommitWithPostpone = 11,
    Commit = 12,
    CommitTopopeWithPostpone = 13,
    CommitTopope = 14,
    Abort = 15,
    AbortTopope = 16,
    StartChkpt = 17,
    EndChkpt = 18,
    Savepoint = 19,
    TwopcPrepare = 20,
    TwopcStart = 21,
    TwopcCommitDecision = 22,
    TwopcAbortDecision = 23,
    TwopcCommitInformParticps = 24,
    TwopcAbortInformParticps = 25,
    TwopcRecvAck = 26,
    EndOfLog = 27,
    DummyCrashRecovery = 28,
    DummyFillpageForArchive = 29,
    ReplicationData = 30,
    ReplicationSchema = 31,
    UnlockCommit = 32,
    UnlockAbort = 33,
    DummyHaServerState = 34,
}

impl RecordType {
    pub fn from_i32(v: i32) -> Option<Self> {
        use RecordType::*;
        Some(match v {
            1 => UndoRedo,
            2 => DiffUndoRedo,
            3 => Undo,
            4 => Redo,
            5 => DbExternRedo,
            6 => Postpone,
            7 => RunPostpone,
            8 => Compensate,
            9 => LogicalCompensate,
            10 => WillCommit,
            11 => CommitWithPostpone,
            12 => Commit,
            13 => CommitTopopeWithPostpone,
            14 => CommitTopope,
            15 => Abort,
            16 => AbortTopope,
            17 => StartChkpt,
            18 => EndChkpt,
            19 => Savepoint,
            20 => TwopcPrepare,
            21 => TwopcStart,
            22 => TwopcCommitDecision,
            23 => TwopcAbortDecision,
            24 => TwopcCommitInformParticps,
            25 => TwopcAbortInformParticps,
            26 => TwopcRecvAck,
            27 => EndOfLog,
            28 => DummyCrashRecovery,
            29 => DummyFillpageForArchive,
            30 => ReplicationData,
            31 => ReplicationSchema,
            32 => UnlockCommit,
            33 => UnlockAbort,
            34 => DummyHaServerState,
            _ => return None,
        })
    }
}

/// Recovery function index. Values are part of the on-disk format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum RvIndex {
    VolHeaderFormat = 0,
    VolHeaderLink = 1,
    VolHeaderCreation = 2,
    VolHeaderBootHfid = 3,
    AllocTableSet = 4,
    VhdrPgAlloc = 5,
    VhdrSectAlloc = 6,
    IdDeallocWithVolheader = 7,
    IdDeallocBitmapOnly = 8,
    IdDeallocVhdrOnly = 9,
    HeapInsert = 10,
    HeapDelete = 11,
    HeapUpdate = 12,
    AllocTableInit = 13,
}

impl RvIndex {
    pub const COUNT: usize = 14;

    pub fn from_i32(v: i32) -> Option<Self> {
        use RvIndex::*;
        Some(match v {
            0 => VolHeaderFormat,
            1 => VolHeaderLink,
            2 => VolHeaderCreation,
            3 => VolHeaderBootHfid,
            4 => AllocTableSet,
            5 => VhdrPgAlloc,
            6 => VhdrSectAlloc,
            7 => IdDeallocWithVolheader,
            8 => IdDeallocBitmapOnly,
            9 => IdDeallocVhdrOnly,
            10 => HeapInsert,
            11 => HeapDelete,
            12 => HeapUpdate,
            13 => AllocTableInit,
            _ => return None,
        })
    }
}

/// Address of the page a recovery function applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RcvAddr {
    pub rcvindex: RvIndex,
    pub volid: i16,
    pub pageid: i32,
    pub offset: i16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
struct RcvAddrRepr {
    rcvindex: I32,
    volid: I16,
    _pad0: [u8; 2],
    pageid: I32,
    offset: I16,
    _pad1: [u8; 2],
}

impl RcvAddr {
    pub const SIZE: usize = std::mem::size_of::<RcvAddrRepr>();

    fn to_repr(self) -> RcvAddrRepr {
        RcvAddrRepr {
            rcvindex: (self.rcvindex as i32).into(),
            volid: self.volid.into(),
            _pad0: [0; 2],
            pageid: self.pageid.into(),
            offset: self.offset.into(),
            _pad1: [0; 2],
        }
    }
}

// ------------------------------------------------------------- header

/// Fixed record header, 32 bytes on disk, always contiguous within a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub trid: i32,
    /// Previous record of the same transaction.
    pub prev_tranlsa: Lsa,
    /// Previous record in the global log.
    pub back_lsa: Lsa,
    /// Next record in the global log; NULL at the write frontier until the
    /// next append back-patches it.
    pub forw_lsa: Lsa,
    pub rectype: RecordType,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
pub struct RecordHeaderRepr {
    trid: I32,
    prev_tranlsa: LsaRepr,
    back_lsa: LsaRepr,
    forw_lsa: LsaRepr,
    rectype: I32,
}

impl RecordHeader {
    pub const SIZE: usize = std::mem::size_of::<RecordHeaderRepr>();
    /// Byte offset of `forw_lsa` within the header, used by the appender's
    /// back-patch of the previous record.
    pub const FORW_LSA_OFFSET: usize = 4 + LsaRepr::SIZE * 2;

    pub fn encode(&self, buf: &mut BytesMut) {
        let repr = RecordHeaderRepr {
            trid: self.trid.into(),
            prev_tranlsa: self.prev_tranlsa.into(),
            back_lsa: self.back_lsa.into(),
            forw_lsa: self.forw_lsa.into(),
            rectype: (self.rectype as i32).into(),
        };
        buf.put_slice(repr.as_bytes());
    }

    pub fn decode(bytes: &[u8], at: Lsa) -> Result<Self> {
        let repr = RecordHeaderRepr::read_from_prefix(bytes)
            .ok_or(Error::LogRecordCorrupted(at))?;
        let rectype = RecordType::from_i32(repr.rectype.get())
            .ok_or(Error::LogRecordCorrupted(at))?;
        Ok(RecordHeader {
            trid: repr.trid.get(),
            prev_tranlsa: repr.prev_tranlsa.get(),
            back_lsa: repr.back_lsa.get(),
            forw_lsa: repr.forw_lsa.get(),
            rectype,
        })
    }
}

// ------------------------------------------------------- reading trait

/// Byte source that walks log pages transparently. `read_bytes` may cross
/// page boundaries; the implementation realigns on page payload start.
pub trait RecordRead {
    fn read_bytes(&mut self, n: usize) -> Result<Bytes>;
    /// Address of the next unread byte.
    fn position(&self) -> Lsa;

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_i16(&mut self) -> Result<i16> {
        let b = self.read_bytes(2)?;
        Ok(i16::from_le_bytes([b[0], b[1]]))
    }

    fn read_i32(&mut self) -> Result<i32> {
        let b = self.read_bytes(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_i64(&mut self) -> Result<i64> {
        let b = self.read_bytes(8)?;
        Ok(i64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn read_lsa(&mut self) -> Result<Lsa> {
        let b = self.read_bytes(LsaRepr::SIZE)?;
        let repr =
            LsaRepr::read_from(&b[..]).ok_or(Error::LogRecordCorrupted(self.position()))?;
        Ok(repr.get())
    }

    fn read_rcv(&mut self) -> Result<RcvAddr> {
        let at = self.position();
        let b = self.read_bytes(RcvAddr::SIZE)?;
        let repr = RcvAddrRepr::read_from(&b[..]).ok_or(Error::LogRecordCorrupted(at))?;
        let rcvindex =
            RvIndex::from_i32(repr.rcvindex.get()).ok_or(Error::LogRecordCorrupted(at))?;
        Ok(RcvAddr {
            rcvindex,
            volid: repr.volid.get(),
            pageid: repr.pageid.get(),
            offset: repr.offset.get(),
        })
    }

    fn read_string(&mut self) -> Result<String> {
        let len = self.read_i16()? as usize;
        let b = self.read_bytes(len)?;
        String::from_utf8(b.to_vec())
            .map_err(|_| Error::LogRecordCorrupted(self.position()))
    }

    /// Read a zip-flagged image: length word, then raw or compressed bytes.
    fn read_image(&mut self) -> Result<Bytes> {
        let raw = self.read_i32()? as u32;
        let zipped = raw & ZIP_LEN_FLAG != 0;
        let len = (raw & !ZIP_LEN_FLAG) as usize;
        let data = self.read_bytes(len)?;
        if zipped {
            unzip(&data)
        } else {
            Ok(data)
        }
    }
}

// ------------------------------------------------------- encode helpers

fn put_lsa(buf: &mut BytesMut, lsa: Lsa) {
    buf.put_slice(LsaRepr::from(lsa).as_bytes());
}

fn put_rcv(buf: &mut BytesMut, rcv: &RcvAddr) {
    buf.put_slice(rcv.to_repr().as_bytes());
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_i16_le(s.len() as i16);
    buf.put_slice(s.as_bytes());
}

fn put_image(buf: &mut BytesMut, data: &[u8], compress_threshold: usize) {
    if compress_threshold > 0 && data.len() >= compress_threshold {
        let zipped = zip(data);
        if zipped.len() < data.len() {
            buf.put_u32_le(zipped.len() as u32 | ZIP_LEN_FLAG);
            buf.put_slice(&zipped);
            return;
        }
    }
    buf.put_u32_le(data.len() as u32);
    buf.put_slice(data);
}

pub fn zip(data: &[u8]) -> Vec<u8> {
    snap::raw::Encoder::new()
        .compress_vec(data)
        .expect("snappy compression cannot fail on in-memory input")
}

pub fn unzip(data: &[u8]) -> Result<Bytes> {
    snap::raw::Decoder::new()
        .decompress_vec(data)
        .map(Bytes::from)
        .map_err(|e| Error::Unzip(e.to_string()))
}

// ---------------------------------------------------------------- bodies

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplOp {
    Insert = 0,
    Update = 1,
    Delete = 2,
    UpdateStart = 3,
    UpdateEnd = 4,
}

impl ReplOp {
    fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => ReplOp::Insert,
            1 => ReplOp::Update,
            2 => ReplOp::Delete,
            3 => ReplOp::UpdateStart,
            4 => ReplOp::UpdateEnd,
            _ => return None,
        })
    }
}

/// Payload of a REPLICATION_DATA record: one row operation to re-execute on
/// a replica, keyed by class name and primary key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplData {
    pub op: ReplOp,
    pub class_name: String,
    pub pkey: String,
    pub data: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParticipantId {
    pub host_id: i32,
    pub tran_idx: i32,
}

impl ParticipantId {
    /// Fixed per-id length of the opaque participant block.
    pub const SIZE: usize = 8;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChkptTran {
    pub isloose_end: bool,
    pub trid: i32,
    pub state: i32,
    pub isolation: i32,
    pub head_lsa: Lsa,
    pub tail_lsa: Lsa,
    pub undo_nxlsa: Lsa,
    pub posp_nxlsa: Lsa,
    pub savept_lsa: Lsa,
    pub tail_topresult_lsa: Lsa,
    pub client_undo_lsa: Lsa,
    pub client_posp_lsa: Lsa,
    pub user_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChkptTopop {
    pub trid: i32,
    pub lastparent_lsa: Lsa,
    pub posp_lsa: Lsa,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChkptEnd {
    pub redo_lsa: Lsa,
    pub trans: Vec<ChkptTran>,
    pub topops: Vec<ChkptTopop>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordBody {
    UndoRedo {
        rcv: RcvAddr,
        undo: Bytes,
        redo: Bytes,
        /// DIFF_UNDOREDO: the redo image is an xor diff against the undo.
        diff: bool,
    },
    Undo {
        rcv: RcvAddr,
        data: Bytes,
    },
    Redo {
        rcv: RcvAddr,
        data: Bytes,
    },
    DbExternRedo {
        rcvindex: RvIndex,
        data: Bytes,
    },
    Postpone {
        rcv: RcvAddr,
        data: Bytes,
    },
    RunPostpone {
        rcv: RcvAddr,
        ref_lsa: Lsa,
        data: Bytes,
    },
    Compensate {
        rcv: RcvAddr,
        undo_nxlsa: Lsa,
        data: Bytes,
    },
    LogicalCompensate {
        rcvindex: RvIndex,
        undo_nxlsa: Lsa,
    },
    Savepoint {
        prev_savept: Lsa,
        name: String,
    },
    WillCommit,
    CommitWithPostpone {
        start_posp_lsa: Lsa,
    },
    Commit {
        at_time: i64,
    },
    Abort {
        at_time: i64,
    },
    CommitTopopeWithPostpone {
        lastparent_lsa: Lsa,
        start_posp_lsa: Lsa,
    },
    CommitTopope {
        lastparent_lsa: Lsa,
        prv_topresult_lsa: Lsa,
    },
    AbortTopope {
        lastparent_lsa: Lsa,
        prv_topresult_lsa: Lsa,
    },
    StartChkpt,
    EndChkpt(ChkptEnd),
    TwopcPrepare {
        gtrid: i32,
        user_name: String,
        num_object_locks: i32,
        num_page_locks: i32,
        lock_block: Bytes,
    },
    TwopcStart {
        gtrid: i32,
        user_name: String,
        particps: Vec<ParticipantId>,
    },
    TwopcCommitDecision,
    TwopcAbortDecision,
    TwopcCommitInformParticps,
    TwopcAbortInformParticps,
    TwopcRecvAck {
        particp_index: i32,
    },
    EndOfLog,
    DummyCrashRecovery,
    DummyFillpageForArchive,
    ReplicationData(ReplData),
    ReplicationSchema {
        ddl: String,
        user: String,
    },
    UnlockCommit,
    UnlockAbort,
    DummyHaServerState {
        state: i32,
    },
}

impl RecordBody {
    pub fn rectype(&self) -> RecordType {
        use RecordBody as B;
        use RecordType as T;
        match self {
            B::UndoRedo { diff: false, .. } => T::UndoRedo,
            B::UndoRedo { diff: true, .. } => T::DiffUndoRedo,
            B::Undo { .. } => T::Undo,
            B::Redo { .. } => T::Redo,
            B::DbExternRedo { .. } => T::DbExternRedo,
            B::Postpone { .. } => T::Postpone,
            B::RunPostpone { .. } => T::RunPostpone,
            B::Compensate { .. } => T::Compensate,
            B::LogicalCompensate { .. } => T::LogicalCompensate,
            B::Savepoint { .. } => T::Savepoint,
            B::WillCommit => T::WillCommit,
            B::CommitWithPostpone { .. } => T::CommitWithPostpone,
            B::Commit { .. } => T::Commit,
            B::Abort { .. } => T::Abort,
            B::CommitTopopeWithPostpone { .. } => T::CommitTopopeWithPostpone,
            B::CommitTopope { .. } => T::CommitTopope,
            B::AbortTopope { .. } => T::AbortTopope,
            B::StartChkpt => T::StartChkpt,
            B::EndChkpt(_) => T::EndChkpt,
            B::TwopcPrepare { .. } => T::TwopcPrepare,
            B::TwopcStart { .. } => T::TwopcStart,
            B::TwopcCommitDecision => T::TwopcCommitDecision,
            B::TwopcAbortDecision => T::TwopcAbortDecision,
            B::TwopcCommitInformParticps => T::TwopcCommitInformParticps,
            B::TwopcAbortInformParticps => T::TwopcAbortInformParticps,
            B::TwopcRecvAck { .. } => T::TwopcRecvAck,
            B::EndOfLog => T::EndOfLog,
            B::DummyCrashRecovery => T::DummyCrashRecovery,
            B::DummyFillpageForArchive => T::DummyFillpageForArchive,
            B::ReplicationData(_) => T::ReplicationData,
            B::ReplicationSchema { .. } => T::ReplicationSchema,
            B::UnlockCommit => T::UnlockCommit,
            B::UnlockAbort => T::UnlockAbort,
            B::DummyHaServerState { .. } => T::DummyHaServerState,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut, compress_threshold: usize) {
        use RecordBody as B;
        match self {
            B::UndoRedo {
                rcv, undo, redo, ..
            } => {
                put_rcv(buf, rcv);
                put_image(buf, undo, compress_threshold);
                put_image(buf, redo, compress_threshold);
            }
            B::Undo { rcv, data } | B::Redo { rcv, data } | B::Postpone { rcv, data } => {
                put_rcv(buf, rcv);
                put_image(buf, data, compress_threshold);
            }
            B::DbExternRedo { rcvindex, data } => {
                buf.put_i32_le(*rcvindex as i32);
                put_image(buf, data, compress_threshold);
            }
            B::RunPostpone { rcv, ref_lsa, data } => {
                put_rcv(buf, rcv);
                put_lsa(buf, *ref_lsa);
                put_image(buf, data, compress_threshold);
            }
            B::Compensate {
                rcv,
                undo_nxlsa,
                data,
            } => {
                put_rcv(buf, rcv);
                put_lsa(buf, *undo_nxlsa);
                put_image(buf, data, compress_threshold);
            }
            B::LogicalCompensate { rcvindex, undo_nxlsa } => {
                buf.put_i32_le(*rcvindex as i32);
                put_lsa(buf, *undo_nxlsa);
            }
            B::Savepoint { prev_savept, name } => {
                put_lsa(buf, *prev_savept);
                put_string(buf, name);
            }
            B::WillCommit
            | B::StartChkpt
            | B::TwopcCommitDecision
            | B::TwopcAbortDecision
            | B::TwopcCommitInformParticps
            | B::TwopcAbortInformParticps
            | B::EndOfLog
            | B::DummyCrashRecovery
            | B::DummyFillpageForArchive
            | B::UnlockCommit
            | B::UnlockAbort => {}
            B::CommitWithPostpone { start_posp_lsa } => put_lsa(buf, *start_posp_lsa),
            B::Commit { at_time } | B::Abort { at_time } => buf.put_i64_le(*at_time),
            B::CommitTopopeWithPostpone {
                lastparent_lsa,
                start_posp_lsa,
            } => {
                put_lsa(buf, *lastparent_lsa);
                put_lsa(buf, *start_posp_lsa);
            }
            B::CommitTopope {
                lastparent_lsa,
                prv_topresult_lsa,
            }
            | B::AbortTopope {
                lastparent_lsa,
                prv_topresult_lsa,
            } => {
                put_lsa(buf, *lastparent_lsa);
                put_lsa(buf, *prv_topresult_lsa);
            }
            B::EndChkpt(chkpt) => {
                put_lsa(buf, chkpt.redo_lsa);
                buf.put_i32_le(chkpt.trans.len() as i32);
                buf.put_i32_le(chkpt.topops.len() as i32);
                for t in &chkpt.trans {
                    buf.put_u8(t.isloose_end as u8);
                    buf.put_i32_le(t.trid);
                    buf.put_i32_le(t.state);
                    buf.put_i32_le(t.isolation);
                    put_lsa(buf, t.head_lsa);
                    put_lsa(buf, t.tail_lsa);
                    put_lsa(buf, t.undo_nxlsa);
                    put_lsa(buf, t.posp_nxlsa);
                    put_lsa(buf, t.savept_lsa);
                    put_lsa(buf, t.tail_topresult_lsa);
                    put_lsa(buf, t.client_undo_lsa);
                    put_lsa(buf, t.client_posp_lsa);
                    put_string(buf, &t.user_name);
                }
                for t in &chkpt.topops {
                    buf.put_i32_le(t.trid);
                    put_lsa(buf, t.lastparent_lsa);
                    put_lsa(buf, t.posp_lsa);
                }
            }
            B::TwopcPrepare {
                gtrid,
                user_name,
                num_object_locks,
                num_page_locks,
                lock_block,
            } => {
                buf.put_i32_le(*gtrid);
                put_string(buf, user_name);
                buf.put_i32_le(*num_object_locks);
                buf.put_i32_le(*num_page_locks);
                put_image(buf, lock_block, 0);
            }
            B::TwopcStart {
                gtrid,
                user_name,
                particps,
            } => {
                buf.put_i32_le(*gtrid);
                put_string(buf, user_name);
                buf.put_i32_le(particps.len() as i32);
                buf.put_i32_le(ParticipantId::SIZE as i32);
                for p in particps {
                    buf.put_i32_le(p.host_id);
                    buf.put_i32_le(p.tran_idx);
                }
            }
            B::TwopcRecvAck { particp_index } => buf.put_i32_le(*particp_index),
            B::ReplicationData(d) => {
                buf.put_u8(d.op as u8);
                put_string(buf, &d.class_name);
                put_string(buf, &d.pkey);
                put_image(buf, &d.data, compress_threshold);
            }
            B::ReplicationSchema { ddl, user } => {
                put_string(buf, ddl);
                put_string(buf, user);
            }
            B::DummyHaServerState { state } => buf.put_i32_le(*state),
        }
    }

    pub fn decode<R: RecordRead>(rectype: RecordType, r: &mut R) -> Result<RecordBody> {
        use RecordType as T;
        let at = r.position();
        Ok(match rectype {
            T::UndoRedo | T::DiffUndoRedo => RecordBody::UndoRedo {
                rcv: r.read_rcv()?,
                undo: r.read_image()?,
                redo: r.read_image()?,
                diff: rectype == T::DiffUndoRedo,
            },
            T::Undo => RecordBody::Undo {
                rcv: r.read_rcv()?,
                data: r.read_image()?,
            },
            T::Redo => RecordBody::Redo {
                rcv: r.read_rcv()?,
                data: r.read_image()?,
            },
            T::DbExternRedo => {
                let rcvindex = RvIndex::from_i32(r.read_i32()?)
                    .ok_or(Error::LogRecordCorrupted(at))?;
                RecordBody::DbExternRedo {
                    rcvindex,
                    data: r.read_image()?,
                }
            }
            T::Postpone => RecordBody::Postpone {
                rcv: r.read_rcv()?,
                data: r.read_image()?,
            },
            T::RunPostpone => RecordBody::RunPostpone {
                rcv: r.read_rcv()?,
                ref_lsa: r.read_lsa()?,
                data: r.read_image()?,
            },
            T::Compensate => RecordBody::Compensate {
                rcv: r.read_rcv()?,
                undo_nxlsa: r.read_lsa()?,
                data: r.read_image()?,
            },
            T::LogicalCompensate => {
                let rcvindex = RvIndex::from_i32(r.read_i32()?)
                    .ok_or(Error::LogRecordCorrupted(at))?;
                RecordBody::LogicalCompensate {
                    rcvindex,
                    undo_nxlsa: r.read_lsa()?,
                }
            }
            T::Savepoint => RecordBody::Savepoint {
                prev_savept: r.read_lsa()?,
                name: r.read_string()?,
            },
            T::WillCommit => RecordBody::WillCommit,
            T::CommitWithPostpone => RecordBody::CommitWithPostpone {
                start_posp_lsa: r.read_lsa()?,
            },
            T::Commit => RecordBody::Commit {
                at_time: r.read_i64()?,
            },
            T::Abort => RecordBody::Abort {
                at_time: r.read_i64()?,
            },
            T::CommitTopopeWithPostpone => RecordBody::CommitTopopeWithPostpone {
                lastparent_lsa: r.read_lsa()?,
                start_posp_lsa: r.read_lsa()?,
            },
            T::CommitTopope => RecordBody::CommitTopope {
                lastparent_lsa: r.read_lsa()?,
                prv_topresult_lsa: r.read_lsa()?,
            },
            T::AbortTopope => RecordBody::AbortTopope {
                lastparent_lsa: r.read_lsa()?,
                prv_topresult_lsa: r.read_lsa()?,
            },
            T::StartChkpt => RecordBody::StartChkpt,
            T::EndChkpt => {
                let redo_lsa = r.read_lsa()?;
                let ntrans = r.read_i32()?;
                let ntops = r.read_i32()?;
                if !(0..100_000).contains(&ntrans) || !(0..100_000).contains(&ntops) {
                    return Err(Error::LogRecordCorrupted(at));
                }
                let mut trans = Vec::with_capacity(ntrans as usize);
                for _ in 0..ntrans {
                    trans.push(ChkptTran {
                        isloose_end: r.read_u8()? != 0,
                        trid: r.read_i32()?,
                        state: r.read_i32()?,
                        isolation: r.read_i32()?,
                        head_lsa: r.read_lsa()?,
                        tail_lsa: r.read_lsa()?,
                        undo_nxlsa: r.read_lsa()?,
                        posp_nxlsa: r.read_lsa()?,
                        savept_lsa: r.read_lsa()?,
                        tail_topresult_lsa: r.read_lsa()?,
                        client_undo_lsa: r.read_lsa()?,
                        client_posp_lsa: r.read_lsa()?,
                        user_name: r.read_string()?,
                    });
                }
                let mut topops = Vec::with_capacity(ntops as usize);
                for _ in 0..ntops {
                    topops.push(ChkptTopop {
                        trid: r.read_i32()?,
                        lastparent_lsa: r.read_lsa()?,
                        posp_lsa: r.read_lsa()?,
                    });
                }
                RecordBody::EndChkpt(ChkptEnd {
                    redo_lsa,
                    trans,
                    topops,
                })
            }
            T::TwopcPrepare => RecordBody::TwopcPrepare {
                gtrid: r.read_i32()?,
                user_name: r.read_string()?,
                num_object_locks: r.read_i32()?,
                num_page_locks: r.read_i32()?,
                lock_block: r.read_image()?,
            },
            T::TwopcStart => {
                let gtrid = r.read_i32()?;
                let user_name = r.read_string()?;
                let n = r.read_i32()?;
                let id_len = r.read_i32()?;
                if id_len != ParticipantId::SIZE as i32 || !(0..=1024).contains(&n) {
                    return Err(Error::LogRecordCorrupted(at));
                }
                let mut particps = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    particps.push(ParticipantId {
                        host_id: r.read_i32()?,
                        tran_idx: r.read_i32()?,
                    });
                }
                RecordBody::TwopcStart {
                    gtrid,
                    user_name,
                    particps,
                }
            }
            T::TwopcCommitDecision => RecordBody::TwopcCommitDecision,
            T::TwopcAbortDecision => RecordBody::TwopcAbortDecision,
            T::TwopcCommitInformParticps => RecordBody::TwopcCommitInformParticps,
            T::TwopcAbortInformParticps => RecordBody::TwopcAbortInformParticps,
            T::TwopcRecvAck => RecordBody::TwopcRecvAck {
                particp_index: r.read_i32()?,
            },
            T::EndOfLog => RecordBody::EndOfLog,
            T::DummyCrashRecovery => RecordBody::DummyCrashRecovery,
            T::DummyFillpageForArchive => RecordBody::DummyFillpageForArchive,
            T::ReplicationData => {
                let op = ReplOp::from_u8(r.read_u8()?).ok_or(Error::LogRecordCorrupted(at))?;
                RecordBody::ReplicationData(ReplData {
                    op,
                    class_name: r.read_string()?,
                    pkey: r.read_string()?,
                    data: r.read_image()?,
                })
            }
            T::ReplicationSchema => RecordBody::ReplicationSchema {
                ddl: r.read_string()?,
                user: r.read_string()?,
            },
            T::UnlockCommit => RecordBody::UnlockCommit,
            T::UnlockAbort => RecordBody::UnlockAbort,
            T::DummyHaServerState => RecordBody::DummyHaServerState {
                state: r.read_i32()?,
            },
        })
    }
}

/// A fully decoded record with its address.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub lsa: Lsa,
    pub header: RecordHeader,
    pub body: RecordBody,
}

#[cfg(test)]
mod test {
    use super::*;

    struct SliceRead {
        data: Bytes,
        pos: usize,
    }

    impl SliceRead {
        fn new(data: impl Into<Bytes>) -> Self {
            Self {
                data: data.into(),
                pos: 0,
            }
        }
    }

    impl RecordRead for SliceRead {
        fn read_bytes(&mut self, n: usize) -> Result<Bytes> {
            if self.pos + n > self.data.len() {
                return Err(Error::LogRecordCorrupted(Lsa::NULL));
            }
            let out = self.data.slice(self.pos..self.pos + n);
            self.pos += n;
            Ok(out)
        }

        fn position(&self) -> Lsa {
            Lsa::new(0, self.pos as i16)
        }
    }

    fn round_trip(body: RecordBody) {
        let mut buf = BytesMut::new();
        body.encode(&mut buf, 255);
        let mut r = SliceRead::new(buf.freeze());
        let back = RecordBody::decode(body.rectype(), &mut r).unwrap();
        assert_eq!(back, body);
    }

    fn rcv() -> RcvAddr {
        RcvAddr {
            rcvindex: RvIndex::HeapInsert,
            volid: 0,
            pageid: 33,
            offset: 120,
        }
    }

    #[test]
    fn undoredo_round_trip() {
        round_trip(RecordBody::UndoRedo {
            rcv: rcv(),
            undo: Bytes::from_static(b"before"),
            redo: Bytes::from_static(b"after"),
            diff: false,
        });
    }

    #[test]
    fn compressed_image_round_trip() {
        // Highly repetitive payload over the threshold compresses; the
        // decoder must hand back the original bytes.
        let data = Bytes::from(vec![7u8; 4000]);
        round_trip(RecordBody::Redo {
            rcv: rcv(),
            data,
        });
    }

    #[test]
    fn zip_unzip_inverse() {
        let data: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();
        let zipped = zip(&data);
        assert_eq!(unzip(&zipped).unwrap(), Bytes::from(data));
    }

    #[test]
    fn end_chkpt_round_trip() {
        round_trip(RecordBody::EndChkpt(ChkptEnd {
            redo_lsa: Lsa::new(10, 40),
            trans: vec![ChkptTran {
                isloose_end: false,
                trid: 7,
                state: 1,
                isolation: 4,
                head_lsa: Lsa::new(9, 0),
                tail_lsa: Lsa::new(10, 16),
                undo_nxlsa: Lsa::new(10, 16),
                posp_nxlsa: Lsa::NULL,
                savept_lsa: Lsa::NULL,
                tail_topresult_lsa: Lsa::NULL,
                client_undo_lsa: Lsa::NULL,
                client_posp_lsa: Lsa::NULL,
                user_name: "dba".into(),
            }],
            topops: vec![ChkptTopop {
                trid: 7,
                lastparent_lsa: Lsa::new(9, 0),
                posp_lsa: Lsa::NULL,
            }],
        }));
    }

    #[test]
    fn twopc_start_round_trip() {
        round_trip(RecordBody::TwopcStart {
            gtrid: 4242,
            user_name: "dba".into(),
            particps: vec![
                ParticipantId {
                    host_id: 1,
                    tran_idx: 12,
                },
                ParticipantId {
                    host_id: 2,
                    tran_idx: 3,
                },
            ],
        });
    }

    #[test]
    fn replication_round_trip() {
        round_trip(RecordBody::ReplicationData(ReplData {
            op: ReplOp::Update,
            class_name: "stock".into(),
            pkey: "1".into(),
            data: Bytes::from_static(b"(1,\"b\")"),
        }));
        round_trip(RecordBody::ReplicationSchema {
            ddl: "create table t (a int primary key)".into(),
            user: "dba".into(),
        });
    }

    #[test]
    fn header_encode_decode() {
        let hdr = RecordHeader {
            trid: 5,
            prev_tranlsa: Lsa::new(1, 0),
            back_lsa: Lsa::new(1, 64),
            forw_lsa: Lsa::NULL,
            rectype: RecordType::Commit,
        };
        let mut buf = BytesMut::new();
        hdr.encode(&mut buf);
        assert_eq!(buf.len(), RecordHeader::SIZE);
        let back = RecordHeader::decode(&buf, Lsa::NULL).unwrap();
        assert_eq!(back, hdr);
    }

    #[test]
    fn bad_rectype_rejected() {
        assert!(RecordType::from_i32(999).is_none());
        assert!(RecordType::from_i32(0).is_none());
    }
}
