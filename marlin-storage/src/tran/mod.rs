//! Transaction descriptors and the fixed-capacity transaction table.
//! Slot 0 is reserved for the system/recovery transaction.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::lsa::Lsa;
use crate::record::ReplData;

pub mod twopc;

pub use twopc::{Coordinator, TwopcTransport, Vote};

pub const SYSTEM_TRAN_INDEX: usize = 0;
pub const NULL_TRID: i32 = -1;
pub const NULL_GTRID: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum TranState {
    Active = 0,
    UnactiveWillCommit = 1,
    UnactiveCommittedWithPostpone = 2,
    UnactiveCommitted = 3,
    UnactiveAborted = 4,
    UnactiveUnilaterallyAborted = 5,
    Unactive2pcPrepare = 6,
    Unactive2pcCollectingVotes = 7,
    Unactive2pcCommitDecision = 8,
    Unactive2pcAbortDecision = 9,
    UnactiveCommittedInformingParticipants = 10,
    UnactiveAbortedInformingParticipants = 11,
    RecoveryUndo = 12,
}

impl TranState {
    pub fn from_i32(v: i32) -> Option<Self> {
        use TranState::*;
        Some(match v {
            0 => Active,
            1 => UnactiveWillCommit,
            2 => UnactiveCommittedWithPostpone,
            3 => UnactiveCommitted,
            4 => UnactiveAborted,
            5 => UnactiveUnilaterallyAborted,
            6 => Unactive2pcPrepare,
            7 => Unactive2pcCollectingVotes,
            8 => Unactive2pcCommitDecision,
            9 => Unactive2pcAbortDecision,
            10 => UnactiveCommittedInformingParticipants,
            11 => UnactiveAbortedInformingParticipants,
            12 => RecoveryUndo,
            _ => return None,
        })
    }

    pub fn is_committed(&self) -> bool {
        matches!(
            self,
            TranState::UnactiveCommitted
                | TranState::UnactiveWillCommit
                | TranState::UnactiveCommittedWithPostpone
                | TranState::Unactive2pcCommitDecision
                | TranState::UnactiveCommittedInformingParticipants
        )
    }

    pub fn is_aborted(&self) -> bool {
        matches!(
            self,
            TranState::UnactiveAborted
                | TranState::UnactiveUnilaterallyAborted
                | TranState::Unactive2pcAbortDecision
                | TranState::UnactiveAbortedInformingParticipants
        )
    }

    /// In-doubt distributed transactions survive recovery untouched.
    pub fn is_in_doubt(&self) -> bool {
        matches!(self, TranState::Unactive2pcPrepare)
    }
}

/// Isolation is an opaque key for the lock manager; the table only
/// carries it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Isolation {
    Serializable = 0,
    RepClassRepInstance = 1,
    RepClassCommitInstance = 2,
    RepClassUncommitInstance = 3,
    CommitClassCommitInstance = 4,
    CommitClassUncommitInstance = 5,
}

impl Isolation {
    pub fn from_i32(v: i32) -> Option<Self> {
        use Isolation::*;
        Some(match v {
            0 => Serializable,
            1 => RepClassRepInstance,
            2 => RepClassCommitInstance,
            3 => RepClassUncommitInstance,
            4 => CommitClassCommitInstance,
            5 => CommitClassUncommitInstance,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientIds {
    pub user_name: String,
    pub host_name: String,
    pub process_id: i32,
}

/// LSA anchors a transaction drags through the log. Updated by the
/// appender, consumed by rollback, checkpointing and recovery.
#[derive(Debug, Clone, Copy, Default)]
pub struct TranLog {
    pub head_lsa: Lsa,
    pub tail_lsa: Lsa,
    pub undo_nxlsa: Lsa,
    pub posp_nxlsa: Lsa,
    pub savept_lsa: Lsa,
    pub tail_topresult_lsa: Lsa,
    pub client_undo_lsa: Lsa,
    pub client_posp_lsa: Lsa,
}

impl TranLog {
    pub fn reset(&mut self) {
        *self = TranLog::default();
    }

    pub fn has_logged(&self) -> bool {
        !self.head_lsa.is_null()
    }
}

/// One nested top-operation scope.
#[derive(Debug, Clone, Copy)]
pub struct TopopEntry {
    pub lastparent_lsa: Lsa,
    pub posp_lsa: Lsa,
}

/// Unique-constraint statistics accumulated per b-tree while a
/// transaction runs; merged into the catalog at commit by upper layers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UniqueStat {
    pub n_objects: i64,
    pub n_nulls: i64,
    pub n_keys: i64,
}

#[derive(Debug)]
pub struct Tdes {
    pub trid: i32,
    pub index: usize,
    pub state: TranState,
    pub isolation: Isolation,
    pub wait_secs: i32,
    pub client: ClientIds,
    pub log: TranLog,
    pub topops: Vec<TopopEntry>,
    /// Global transaction id when participating in 2PC.
    pub gtrid: i32,
    pub coord: Option<Coordinator>,
    pub unique_stats: HashMap<i32, UniqueStat>,
    pub modified_classes: Vec<String>,
    /// Replication records buffered until commit.
    pub repl_records: Vec<ReplData>,
    pub repl_schema: Vec<(String, String)>,
}

impl Tdes {
    fn new(
        trid: i32,
        index: usize,
        client: ClientIds,
        isolation: Isolation,
        wait_secs: i32,
    ) -> Self {
        Self {
            trid,
            index,
            state: TranState::Active,
            isolation,
            wait_secs,
            client,
            log: TranLog::default(),
            topops: Vec::new(),
            gtrid: NULL_GTRID,
            coord: None,
            unique_stats: HashMap::new(),
            modified_classes: Vec::new(),
            repl_records: Vec::new(),
            repl_schema: Vec::new(),
        }
    }

    /// Reuse the slot for a fresh transaction after commit or abort.
    pub fn reuse(&mut self, trid: i32) {
        self.trid = trid;
        self.state = TranState::Active;
        self.log.reset();
        self.topops.clear();
        self.gtrid = NULL_GTRID;
        self.coord = None;
        self.unique_stats.clear();
        self.modified_classes.clear();
        self.repl_records.clear();
        self.repl_schema.clear();
    }

    pub fn push_topop(&mut self) -> usize {
        self.topops.push(TopopEntry {
            lastparent_lsa: self.log.tail_lsa,
            // postpone anchor at scope entry; restored when the scope
            // commits and has run its own postpones
            posp_lsa: self.log.posp_nxlsa,
        });
        self.topops.len() - 1
    }

    pub fn topop_depth(&self) -> usize {
        self.topops.len()
    }

    pub fn note_unique_stat(&mut self, btid: i32, objects: i64, nulls: i64, keys: i64) {
        let entry = self.unique_stats.entry(btid).or_default();
        entry.n_objects += objects;
        entry.n_nulls += nulls;
        entry.n_keys += keys;
    }

    pub fn note_modified_class(&mut self, class_name: &str) {
        if !self.modified_classes.iter().any(|c| c == class_name) {
            self.modified_classes.push(class_name.to_owned());
        }
    }
}

/// One slot of the table. The interrupt flag lives outside the descriptor
/// mutex so another thread can raise it while the owner works.
#[derive(Debug)]
pub struct TranSlot {
    pub index: usize,
    pub interrupt: AtomicBool,
    pub tdes: Mutex<Tdes>,
}

impl TranSlot {
    pub fn set_interrupt(&self, on: bool) {
        self.interrupt.store(on, Ordering::SeqCst);
    }

    /// Sticky check: raising the flag makes every subsequent page fetch
    /// fail until the caller clears it.
    pub fn check_interrupt(&self) -> Result<()> {
        if self.interrupt.load(Ordering::SeqCst) {
            return Err(Error::Interrupted);
        }
        Ok(())
    }
}

#[derive(Debug)]
struct TableInner {
    slots: Vec<Option<Arc<TranSlot>>>,
    hint_free_index: usize,
}

/// Fixed-capacity table of transaction descriptors.
#[derive(Debug)]
pub struct TranTable {
    inner: Mutex<TableInner>,
}

impl TranTable {
    pub fn new(capacity: usize) -> Self {
        let mut slots: Vec<Option<Arc<TranSlot>>> = (0..capacity.max(2)).map(|_| None).collect();
        // slot 0: the system transaction, always present
        slots[SYSTEM_TRAN_INDEX] = Some(Arc::new(TranSlot {
            index: SYSTEM_TRAN_INDEX,
            interrupt: AtomicBool::new(false),
            tdes: Mutex::new(Tdes::new(
                NULL_TRID,
                SYSTEM_TRAN_INDEX,
                ClientIds::default(),
                Isolation::Serializable,
                -1,
            )),
        }));
        Self {
            inner: Mutex::new(TableInner {
                slots,
                hint_free_index: 1,
            }),
        }
    }

    /// Claim a free slot. The caller supplies the trid (freshly drawn from
    /// the log header under the log critical section).
    pub fn assign(
        &self,
        trid: i32,
        client: ClientIds,
        isolation: Isolation,
        wait_secs: i32,
    ) -> Result<Arc<TranSlot>> {
        let mut inner = self.inner.lock();
        let n = inner.slots.len();
        let start = inner.hint_free_index.clamp(1, n - 1);
        for probe in 0..n - 1 {
            let idx = 1 + (start - 1 + probe) % (n - 1);
            if inner.slots[idx].is_none() {
                let slot = Arc::new(TranSlot {
                    index: idx,
                    interrupt: AtomicBool::new(false),
                    tdes: Mutex::new(Tdes::new(trid, idx, client, isolation, wait_secs)),
                });
                inner.slots[idx] = Some(slot.clone());
                inner.hint_free_index = (idx + 1) % n;
                return Ok(slot);
            }
        }
        Err(Error::TranTableFull)
    }

    pub fn get(&self, index: usize) -> Result<Arc<TranSlot>> {
        self.inner
            .lock()
            .slots
            .get(index)
            .and_then(|s| s.clone())
            .ok_or(Error::NoSuchTranIndex(index))
    }

    pub fn system_slot(&self) -> Arc<TranSlot> {
        self.get(SYSTEM_TRAN_INDEX).expect("system slot always exists")
    }

    /// Release the slot. Owned resources die with the descriptor.
    pub fn free(&self, index: usize) -> Result<()> {
        if index == SYSTEM_TRAN_INDEX {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        if inner.slots.get_mut(index).map(|s| s.take()).flatten().is_none() {
            return Err(Error::NoSuchTranIndex(index));
        }
        if index < inner.hint_free_index {
            inner.hint_free_index = index;
        }
        Ok(())
    }

    /// Snapshot of the live slots, system transaction excluded.
    pub fn live_slots(&self) -> Vec<Arc<TranSlot>> {
        self.inner
            .lock()
            .slots
            .iter()
            .skip(1)
            .flatten()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().slots.iter().flatten().count()
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().slots.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn client() -> ClientIds {
        ClientIds {
            user_name: "dba".into(),
            host_name: "localhost".into(),
            process_id: 1,
        }
    }

    #[test]
    fn assign_reuses_freed_slots() {
        let table = TranTable::new(4);
        let a = table
            .assign(1, client(), Isolation::RepClassCommitInstance, -1)
            .unwrap();
        let b = table
            .assign(2, client(), Isolation::RepClassCommitInstance, -1)
            .unwrap();
        assert_ne!(a.index, b.index);
        assert_ne!(a.index, SYSTEM_TRAN_INDEX);

        let a_idx = a.index;
        table.free(a_idx).unwrap();
        let c = table
            .assign(3, client(), Isolation::Serializable, -1)
            .unwrap();
        assert_eq!(c.index, a_idx);
    }

    #[test]
    fn table_fills_up() {
        let table = TranTable::new(3);
        table.assign(1, client(), Isolation::Serializable, -1).unwrap();
        table.assign(2, client(), Isolation::Serializable, -1).unwrap();
        assert!(matches!(
            table.assign(3, client(), Isolation::Serializable, -1),
            Err(Error::TranTableFull)
        ));
    }

    #[test]
    fn interrupt_is_sticky() {
        let table = TranTable::new(4);
        let slot = table.assign(1, client(), Isolation::Serializable, -1).unwrap();
        assert!(slot.check_interrupt().is_ok());
        slot.set_interrupt(true);
        assert!(matches!(slot.check_interrupt(), Err(Error::Interrupted)));
        assert!(matches!(slot.check_interrupt(), Err(Error::Interrupted)));
        slot.set_interrupt(false);
        assert!(slot.check_interrupt().is_ok());
    }

    #[test]
    fn topop_stack_nests() {
        let mut tdes = Tdes::new(9, 1, client(), Isolation::Serializable, -1);
        tdes.log.tail_lsa = Lsa::new(4, 0);
        tdes.push_topop();
        tdes.log.tail_lsa = Lsa::new(4, 64);
        tdes.push_topop();
        assert_eq!(tdes.topop_depth(), 2);
        assert_eq!(tdes.topops[0].lastparent_lsa, Lsa::new(4, 0));
        assert_eq!(tdes.topops[1].lastparent_lsa, Lsa::new(4, 64));
    }
}
