//! Apply items and the ordered commit queue.
//!
//! Replication records are queued per master transaction; a commit entry
//! is created by UNLOCK_COMMIT and only fires once the matching COMMIT
//! record arrives, which keeps replay in master commit order.

use std::collections::VecDeque;

use bytes::Bytes;
use hashbrown::HashMap;
use marlin_storage::lsa::Lsa;
use marlin_storage::record::ReplOp;

#[derive(Debug, Clone)]
pub enum ApplyItem {
    Row {
        op: ReplOp,
        class_name: String,
        pkey: String,
        data: Bytes,
        lsa: Lsa,
    },
    Schema {
        ddl: String,
        user: String,
        lsa: Lsa,
    },
}

/// Items of one master transaction, in log order.
#[derive(Debug, Default)]
pub struct ApplyTask {
    pub head_lsa: Lsa,
    pub items: Vec<ApplyItem>,
}

impl ApplyTask {
    pub fn push(&mut self, item: ApplyItem, lsa: Lsa) {
        if self.head_lsa.is_null() {
            self.head_lsa = lsa;
        }
        self.items.push(item);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitState {
    /// UNLOCK_COMMIT seen; waiting for the real commit record.
    Unlock,
    /// COMMIT (or COMMIT_TOPOPE) seen; ready to fire.
    Commit,
}

#[derive(Debug, Clone)]
pub struct CommitEntry {
    pub tranid: i32,
    pub lsa: Lsa,
    pub state: CommitState,
    /// Master-side end-of-transaction time, for replication lag.
    pub eot_time: i64,
}

/// Per-transaction item lists plus the ordered commit queue.
#[derive(Debug, Default)]
pub struct ApplyQueue {
    pub tasks: HashMap<i32, ApplyTask>,
    pub commits: VecDeque<CommitEntry>,
}

impl ApplyQueue {
    pub fn push_item(&mut self, tranid: i32, item: ApplyItem, lsa: Lsa) {
        self.tasks.entry(tranid).or_default().push(item, lsa);
    }

    pub fn note_unlock_commit(&mut self, tranid: i32, lsa: Lsa) {
        self.commits.push_back(CommitEntry {
            tranid,
            lsa,
            state: CommitState::Unlock,
            eot_time: 0,
        });
    }

    /// COMMIT arrived; arm the matching queue entry. Returns whether an
    /// entry was armed.
    pub fn note_commit(&mut self, tranid: i32, lsa: Lsa, eot_time: i64) -> bool {
        for entry in self.commits.iter_mut() {
            if entry.tranid == tranid && entry.state == CommitState::Unlock {
                entry.state = CommitState::Commit;
                entry.lsa = lsa;
                entry.eot_time = eot_time;
                return true;
            }
        }
        false
    }

    pub fn discard(&mut self, tranid: i32) {
        self.tasks.remove(&tranid);
        self.commits.retain(|c| c.tranid != tranid);
    }

    /// Armed entries at the queue head, in order.
    pub fn drain_ready(&mut self) -> Vec<CommitEntry> {
        let mut out = Vec::new();
        while matches!(self.commits.front(), Some(e) if e.state == CommitState::Commit) {
            out.push(self.commits.pop_front().expect("front checked above"));
        }
        out
    }

    pub fn take_task(&mut self, tranid: i32) -> Option<ApplyTask> {
        self.tasks.remove(&tranid)
    }

    pub fn has_pending(&self) -> bool {
        !self.tasks.is_empty() || !self.commits.is_empty()
    }

    /// Lowest master page id any open transaction still needs.
    pub fn min_required_pageid(&self, fallback: i32) -> i32 {
        self.tasks
            .values()
            .filter(|t| !t.head_lsa.is_null())
            .map(|t| t.head_lsa.pageid)
            .min()
            .unwrap_or(fallback)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn commits_fire_in_queue_order() {
        let mut q = ApplyQueue::default();
        q.note_unlock_commit(7, Lsa::new(1, 0));
        q.note_unlock_commit(9, Lsa::new(1, 64));
        // the later transaction commits first on the master log; nothing
        // may fire until the head entry is armed
        assert!(q.note_commit(9, Lsa::new(2, 0), 1));
        assert!(q.drain_ready().is_empty());
        assert!(q.note_commit(7, Lsa::new(2, 64), 2));
        let fired: Vec<i32> = q.drain_ready().iter().map(|e| e.tranid).collect();
        assert_eq!(fired, vec![7, 9]);
    }

    #[test]
    fn abort_discards_items_and_entry() {
        let mut q = ApplyQueue::default();
        q.push_item(
            5,
            ApplyItem::Schema {
                ddl: "create table t(i int)".into(),
                user: "dba".into(),
                lsa: Lsa::new(3, 0),
            },
            Lsa::new(3, 0),
        );
        q.note_unlock_commit(5, Lsa::new(3, 64));
        q.discard(5);
        assert!(!q.has_pending());
    }

    #[test]
    fn required_pageid_tracks_oldest_open_task() {
        let mut q = ApplyQueue::default();
        assert_eq!(q.min_required_pageid(42), 42);
        q.push_item(
            1,
            ApplyItem::Schema {
                ddl: String::new(),
                user: String::new(),
                lsa: Lsa::new(9, 0),
            },
            Lsa::new(9, 0),
        );
        q.push_item(
            2,
            ApplyItem::Schema {
                ddl: String::new(),
                user: String::new(),
                lsa: Lsa::new(4, 0),
            },
            Lsa::new(4, 0),
        );
        assert_eq!(q.min_required_pageid(42), 4);
    }
}
