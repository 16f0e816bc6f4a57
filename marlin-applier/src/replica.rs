//! The replica-side database seam. The real implementation is the
//! standard client library; tests plug in [`MemReplica`].

use hashbrown::HashMap;
use marlin_storage::lsa::Lsa;

use crate::error::Result;

/// One row of the `db_ha_apply_info` bookkeeping table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyInfo {
    pub db_name: String,
    pub copied_log_path: String,
    /// LSA of the last master commit replayed locally.
    pub committed_lsa: Lsa,
    /// Lowest master log page the applier still needs; authorizes archive
    /// pruning upstream.
    pub required_pageid: i32,
    pub insert_counter: u64,
    pub update_counter: u64,
    pub delete_counter: u64,
    pub schema_counter: u64,
    pub commit_counter: u64,
    pub fail_counter: u64,
    pub status_busy: bool,
}

impl ApplyInfo {
    pub fn fresh(db_name: &str, copied_log_path: &str) -> Self {
        Self {
            db_name: db_name.to_owned(),
            copied_log_path: copied_log_path.to_owned(),
            committed_lsa: Lsa::NULL,
            required_pageid: 0,
            insert_counter: 0,
            update_counter: 0,
            delete_counter: 0,
            schema_counter: 0,
            commit_counter: 0,
            fail_counter: 0,
            status_busy: false,
        }
    }
}

/// State the applier publishes to the replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplierState {
    Recovering,
    Working,
    Done,
}

/// Master server HA state as carried by DUMMY_HA_SERVER_STATE records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterState {
    Unknown,
    Active,
    ToBeStandby,
    Standby,
    Dead,
}

impl MasterState {
    pub fn from_i32(v: i32) -> Self {
        match v {
            1 => MasterState::Active,
            2 => MasterState::ToBeStandby,
            3 => MasterState::Standby,
            4 => MasterState::Dead,
            _ => MasterState::Unknown,
        }
    }
}

/// The standard DB client library, reduced to what the applier needs:
/// primary-key row operations, DDL under a recorded user, local commit
/// and the bookkeeping row.
pub trait ReplicaClient: Send {
    fn find_by_pkey(&mut self, class: &str, pkey: &str) -> Result<Option<Vec<u8>>>;
    fn insert(&mut self, class: &str, pkey: &str, data: &[u8]) -> Result<()>;
    fn update(&mut self, class: &str, pkey: &str, data: &[u8]) -> Result<()>;
    /// Returns whether a row was there to delete.
    fn delete(&mut self, class: &str, pkey: &str) -> Result<bool>;
    /// Execute DDL with the current user switched to `user` for the call.
    fn execute_ddl(&mut self, ddl: &str, user: &str) -> Result<()>;
    fn commit(&mut self) -> Result<()>;
    fn read_apply_info(&mut self, db_name: &str) -> Result<Option<ApplyInfo>>;
    fn write_apply_info(&mut self, info: &ApplyInfo) -> Result<()>;
    fn notify_applier_state(&mut self, state: ApplierState) -> Result<()>;
}

/// In-memory replica with transactional visibility: rows become visible
/// at commit, exactly how the applier observes the real client library.
#[derive(Debug, Default)]
pub struct MemReplica {
    committed: HashMap<(String, String), Vec<u8>>,
    pending: Vec<PendingOp>,
    pub ddl_log: Vec<(String, String)>,
    pub apply_info: Option<ApplyInfo>,
    pub states: Vec<ApplierState>,
    pub commits: usize,
}

#[derive(Debug, Clone)]
enum PendingOp {
    Put(String, String, Vec<u8>),
    Del(String, String),
}

impl MemReplica {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn committed_row(&self, class: &str, pkey: &str) -> Option<&Vec<u8>> {
        self.committed.get(&(class.to_owned(), pkey.to_owned()))
    }

    pub fn row_count(&self) -> usize {
        self.committed.len()
    }

    fn lookup(&self, class: &str, pkey: &str) -> Option<Vec<u8>> {
        // pending ops shadow committed state within the open transaction
        let key = (class.to_owned(), pkey.to_owned());
        for op in self.pending.iter().rev() {
            match op {
                PendingOp::Put(c, k, v) if *c == key.0 && *k == key.1 => {
                    return Some(v.clone());
                }
                PendingOp::Del(c, k) if *c == key.0 && *k == key.1 => return None,
                _ => {}
            }
        }
        self.committed.get(&key).cloned()
    }
}

impl ReplicaClient for MemReplica {
    fn find_by_pkey(&mut self, class: &str, pkey: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.lookup(class, pkey))
    }

    fn insert(&mut self, class: &str, pkey: &str, data: &[u8]) -> Result<()> {
        self.pending
            .push(PendingOp::Put(class.to_owned(), pkey.to_owned(), data.to_vec()));
        Ok(())
    }

    fn update(&mut self, class: &str, pkey: &str, data: &[u8]) -> Result<()> {
        self.pending
            .push(PendingOp::Put(class.to_owned(), pkey.to_owned(), data.to_vec()));
        Ok(())
    }

    fn delete(&mut self, class: &str, pkey: &str) -> Result<bool> {
        let existed = self.lookup(class, pkey).is_some();
        if existed {
            self.pending
                .push(PendingOp::Del(class.to_owned(), pkey.to_owned()));
        }
        Ok(existed)
    }

    fn execute_ddl(&mut self, ddl: &str, user: &str) -> Result<()> {
        self.ddl_log.push((ddl.to_owned(), user.to_owned()));
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        for op in self.pending.drain(..) {
            match op {
                PendingOp::Put(c, k, v) => {
                    self.committed.insert((c, k), v);
                }
                PendingOp::Del(c, k) => {
                    self.committed.remove(&(c, k));
                }
            }
        }
        self.commits += 1;
        Ok(())
    }

    fn read_apply_info(&mut self, _db_name: &str) -> Result<Option<ApplyInfo>> {
        Ok(self.apply_info.clone())
    }

    fn write_apply_info(&mut self, info: &ApplyInfo) -> Result<()> {
        self.apply_info = Some(info.clone());
        Ok(())
    }

    fn notify_applier_state(&mut self, state: ApplierState) -> Result<()> {
        self.states.push(state);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pending_rows_invisible_until_commit() {
        let mut db = MemReplica::new();
        db.insert("stock", "1", b"(1,\"a\")").unwrap();
        assert_eq!(db.row_count(), 0);
        assert!(db.find_by_pkey("stock", "1").unwrap().is_some());
        db.commit().unwrap();
        assert_eq!(db.row_count(), 1);
        assert_eq!(db.committed_row("stock", "1").unwrap(), b"(1,\"a\")");
    }

    #[test]
    fn delete_of_missing_row_reports_absence() {
        let mut db = MemReplica::new();
        assert!(!db.delete("stock", "9").unwrap());
    }
}
