//! The applier proper: walks the master log record by record, queues
//! replication payloads per transaction, fires them at commit order, and
//! keeps the `db_ha_apply_info` bookkeeping row current.

use std::time::{Duration, Instant};

use marlin_storage::lsa::Lsa;
use marlin_storage::record::{RecordBody, ReplOp};

use crate::cache::LogCache;
use crate::error::{Error, Result};
use crate::item::{ApplyItem, ApplyQueue, ApplyTask};
use crate::replica::{ApplierState, ApplyInfo, MasterState, ReplicaClient};

/// Local commit / bookkeeping refresh interval.
const PERIODIC_COMMIT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// At least one record was consumed.
    Progress,
    /// Caught up with the copied log; try again later.
    EndOfLog,
}

pub struct Applier<C: ReplicaClient> {
    cache: LogCache,
    client: C,
    queue: ApplyQueue,
    pub info: ApplyInfo,
    state: ApplierState,
    master_state: MasterState,
    /// Next record to consume.
    final_lsa: Lsa,
    last_periodic: Instant,
    /// Resident-set cap in kilobytes; None disables the check.
    max_mem_kb: Option<u64>,
}

impl<C: ReplicaClient> Applier<C> {
    pub fn new(cache: LogCache, mut client: C, db_name: &str, max_mem_kb: Option<u64>) -> Result<Self> {
        let copied = cache.eof_lsa();
        let info = match client.read_apply_info(db_name)? {
            Some(info) => info,
            None => {
                // first contact with this replica: insert a fresh row
                let info = ApplyInfo::fresh(db_name, "");
                client.write_apply_info(&info)?;
                info
            }
        };
        let final_lsa = if info.committed_lsa.is_null() {
            Lsa::new(0, 0)
        } else {
            info.committed_lsa
        };
        tracing::info!(%final_lsa, eof = %copied, "applier starting");
        let mut this = Self {
            cache,
            client,
            queue: ApplyQueue::default(),
            info,
            state: ApplierState::Recovering,
            master_state: MasterState::Unknown,
            final_lsa,
            last_periodic: Instant::now(),
            max_mem_kb,
        };
        this.transition(ApplierState::Recovering)?;
        Ok(this)
    }

    pub fn state(&self) -> ApplierState {
        self.state
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut C {
        &mut self.client
    }

    pub fn final_lsa(&self) -> Lsa {
        self.final_lsa
    }

    /// Consume copied-log records until the end of log. Fatal errors
    /// propagate; per-item failures only bump `fail_counter`.
    pub fn step(&mut self) -> Result<StepOutcome> {
        let mut progressed = false;
        loop {
            let eof = self.cache.eof_lsa();
            if self.final_lsa >= eof {
                self.cache.refresh_header()?;
                if self.final_lsa >= self.cache.eof_lsa() {
                    self.periodic_work(true)?;
                    self.update_state_machine(true)?;
                    return Ok(if progressed {
                        StepOutcome::Progress
                    } else {
                        StepOutcome::EndOfLog
                    });
                }
                continue;
            }

            let rec_lsa = self.final_lsa;
            let (header, body, end_pos) = match self.cache.read_record(rec_lsa) {
                Ok(parts) => parts,
                Err(e) => {
                    // the master may have page-aligned past a tail too
                    // small for a record header; realign and retry once
                    let next = self.cache.realign(rec_lsa, self.cache.eof_lsa())?;
                    if !next.is_null() && next > rec_lsa {
                        self.final_lsa = next;
                        continue;
                    }
                    return Err(e);
                }
            };
            self.handle_record(header.trid, rec_lsa, body)?;
            progressed = true;

            let mut next = header.forw_lsa;
            if next.is_null() {
                next = self.cache.realign(rec_lsa, self.cache.eof_lsa())?;
            }
            if next.is_null() {
                // frontier record: the master's append cursor sits at the
                // aligned end of its body
                let aligned = marlin_storage::record::align_up(end_pos.offset as usize)
                    .min(self.cache.payload_size());
                next = Lsa::new(end_pos.pageid, aligned as i16);
            }
            if next <= rec_lsa {
                self.periodic_work(true)?;
                self.update_state_machine(true)?;
                return Ok(StepOutcome::Progress);
            }
            self.final_lsa = next;
            self.periodic_work(false)?;
        }
    }

    fn handle_record(&mut self, trid: i32, lsa: Lsa, body: RecordBody) -> Result<()> {
        match body {
            RecordBody::ReplicationData(d) => {
                self.queue.push_item(
                    trid,
                    ApplyItem::Row {
                        op: d.op,
                        class_name: d.class_name,
                        pkey: d.pkey,
                        data: d.data,
                        lsa,
                    },
                    lsa,
                );
            }
            RecordBody::ReplicationSchema { ddl, user } => {
                self.queue
                    .push_item(trid, ApplyItem::Schema { ddl, user, lsa }, lsa);
            }
            RecordBody::UnlockCommit => {
                self.queue.note_unlock_commit(trid, lsa);
            }
            RecordBody::Commit { at_time } => {
                if self.queue.note_commit(trid, lsa, at_time) {
                    self.drain_commits()?;
                } else {
                    // transaction without replication payload
                    self.queue.discard(trid);
                }
            }
            RecordBody::CommitTopope { .. } => {
                if self.queue.note_commit(trid, lsa, 0) {
                    self.drain_commits()?;
                }
            }
            RecordBody::Abort { .. }
            | RecordBody::AbortTopope { .. }
            | RecordBody::UnlockAbort => {
                self.queue.discard(trid);
            }
            RecordBody::EndChkpt(_) => {
                // checkpoint on the master: recompute which archives we
                // still need and let upstream prune the rest
                self.info.required_pageid =
                    self.queue.min_required_pageid(self.final_lsa.pageid);
                self.client.write_apply_info(&self.info)?;
            }
            RecordBody::DummyHaServerState { state } => {
                self.master_state = MasterState::from_i32(state);
                self.update_state_machine(false)?;
            }
            RecordBody::EndOfLog => {}
            _ => {}
        }
        Ok(())
    }

    /// Fire every armed commit entry in queue order.
    fn drain_commits(&mut self) -> Result<()> {
        for entry in self.queue.drain_ready() {
            if let Some(task) = self.queue.take_task(entry.tranid) {
                self.apply_task(task)?;
            }
            self.client.commit().map_err(map_conn_err)?;
            self.info.commit_counter += 1;
            self.info.committed_lsa = entry.lsa;
            self.client.write_apply_info(&self.info)?;
            tracing::debug!(
                tranid = entry.tranid,
                lsa = %entry.lsa,
                eot = entry.eot_time,
                "master transaction replayed"
            );
        }
        Ok(())
    }

    fn apply_task(&mut self, task: ApplyTask) -> Result<()> {
        let mut batch: Option<Vec<ApplyItem>> = None;
        for item in task.items {
            let marker = match &item {
                ApplyItem::Row { op, .. } => Some(*op),
                ApplyItem::Schema { .. } => None,
            };
            match marker {
                Some(ReplOp::UpdateStart) => {
                    batch = Some(Vec::new());
                }
                Some(ReplOp::UpdateEnd) => {
                    // replay the bracketed updates as one batch
                    if let Some(items) = batch.take() {
                        for b in items {
                            self.apply_item(b)?;
                        }
                    }
                }
                _ => match batch.as_mut() {
                    Some(b) => b.push(item),
                    None => self.apply_item(item)?,
                },
            }
        }
        if let Some(items) = batch {
            // unterminated bracket; apply what we have rather than drop it
            tracing::warn!("multi-update bracket missing its end marker");
            for b in items {
                self.apply_item(b)?;
            }
        }
        Ok(())
    }

    fn apply_item(&mut self, item: ApplyItem) -> Result<()> {
        let outcome = match &item {
            ApplyItem::Row {
                op: ReplOp::Insert,
                class_name,
                pkey,
                data,
                ..
            } => match self.client.find_by_pkey(class_name, pkey).map_err(map_conn_err)? {
                Some(_) => Err(Error::Apply(format!(
                    "insert: key {pkey} already exists in {class_name}"
                ))),
                None => self
                    .client
                    .insert(class_name, pkey, data)
                    .map_err(map_conn_err)
                    .map(|()| self.info.insert_counter += 1),
            },
            ApplyItem::Row {
                op: ReplOp::Update,
                class_name,
                pkey,
                data,
                ..
            } => match self.client.find_by_pkey(class_name, pkey).map_err(map_conn_err)? {
                Some(_) => self
                    .client
                    .update(class_name, pkey, data)
                    .map_err(map_conn_err)
                    .map(|()| self.info.update_counter += 1),
                None => Err(Error::Apply(format!(
                    "update: key {pkey} not found in {class_name}"
                ))),
            },
            ApplyItem::Row {
                op: ReplOp::Delete,
                class_name,
                pkey,
                ..
            } => match self.client.delete(class_name, pkey).map_err(map_conn_err)? {
                true => {
                    self.info.delete_counter += 1;
                    Ok(())
                }
                false => Err(Error::Apply(format!(
                    "delete: key {pkey} not found in {class_name}"
                ))),
            },
            ApplyItem::Row { op, .. } => {
                Err(Error::Apply(format!("stray bracket marker {op:?}")))
            }
            ApplyItem::Schema { ddl, user, .. } => self
                .client
                .execute_ddl(ddl, user)
                .map_err(map_conn_err)
                .map(|()| self.info.schema_counter += 1),
        };
        match outcome {
            Ok(()) => Ok(()),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                // item-level failures never stop the applier
                self.info.fail_counter += 1;
                tracing::warn!("apply failure: {e}");
                Ok(())
            }
        }
    }

    /// Local commit + bookkeeping refresh + memory cap, at least every
    /// 500 ms (or forced at idle points).
    fn periodic_work(&mut self, force: bool) -> Result<()> {
        if !force && self.last_periodic.elapsed() < PERIODIC_COMMIT {
            return Ok(());
        }
        self.last_periodic = Instant::now();
        self.info.status_busy = self.queue.has_pending();
        self.client.commit().map_err(map_conn_err)?;
        self.client.write_apply_info(&self.info)?;

        if let Some(cap) = self.max_mem_kb {
            if !self.queue.has_pending() {
                let rss = resident_kb();
                if rss > cap {
                    tracing::error!(rss, cap, "memory cap exceeded, shutting down for restart");
                    return Err(Error::NoSpace);
                }
            }
        }
        Ok(())
    }

    fn caught_up(&self) -> bool {
        self.final_lsa >= self.cache.eof_lsa()
    }

    /// Publish Recovering/Working/Done; every transition commits first so
    /// bookkeeping matches the declared state.
    fn update_state_machine(&mut self, at_eof: bool) -> Result<()> {
        let next = match (self.master_state, at_eof && self.caught_up()) {
            (MasterState::Active | MasterState::ToBeStandby, true) => ApplierState::Working,
            (MasterState::Standby | MasterState::Dead, true) => ApplierState::Done,
            _ => {
                if self.state == ApplierState::Working {
                    // stay working while streaming from a live master
                    ApplierState::Working
                } else {
                    ApplierState::Recovering
                }
            }
        };
        if next != self.state {
            self.transition(next)?;
        }
        Ok(())
    }

    fn transition(&mut self, next: ApplierState) -> Result<()> {
        self.client.commit().map_err(map_conn_err)?;
        self.client.notify_applier_state(next)?;
        tracing::info!(?next, "applier state change");
        self.state = next;
        Ok(())
    }

    /// Drive the applier until shutdown: poll the copied log, nap when
    /// caught up, stop on fatal errors or ctrl-c.
    pub async fn run(mut self) -> Result<()> {
        let mut idle = tokio::time::interval(Duration::from_millis(100));
        loop {
            let outcome = tokio::task::block_in_place(|| self.step());
            match outcome {
                Ok(StepOutcome::Progress) => {}
                Ok(StepOutcome::EndOfLog) => {
                    if self.state == ApplierState::Done {
                        tracing::info!("master is gone and the log is drained");
                        return Ok(());
                    }
                    idle.tick().await;
                }
                Err(e) if e.is_fatal() => {
                    tracing::error!("applier shutting down: {e}");
                    let _ = self.client.commit();
                    let _ = self.client.write_apply_info(&self.info);
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!("transient applier error: {e}");
                    idle.tick().await;
                }
            }
        }
    }
}

fn map_conn_err(e: Error) -> Error {
    // the seam reports lost connections as io errors
    match e {
        Error::Io(_) => Error::CantConnectServer,
        other => other,
    }
}

/// Resident set size in kilobytes, from /proc/self/statm.
fn resident_kb() -> u64 {
    let Ok(statm) = std::fs::read_to_string("/proc/self/statm") else {
        return 0;
    };
    let pages: u64 = statm
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    pages * 4
}
