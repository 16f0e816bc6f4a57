//! Fuzzy checkpoints: a START_CHKPT marker, a transaction-table snapshot
//! in END_CHKPT, and the redo bound recovery may trust.

use crate::error::Result;
use crate::log::SYSTEM_TRID;
use crate::lsa::Lsa;
use crate::record::{ChkptEnd, ChkptTopop, ChkptTran, RecordBody};
use crate::Engine;

impl Engine {
    /// Take a checkpoint. Returns the LSA of the START_CHKPT record; the
    /// active-log header points there afterwards.
    #[tracing::instrument(skip(self))]
    pub fn checkpoint(&self) -> Result<Lsa> {
        let system = self.trantab.system_slot();

        let start_lsa = {
            let mut sys_tdes = system.tdes.lock();
            let mut log = self.log.lock();
            log.append(SYSTEM_TRID, &mut sys_tdes.log, &RecordBody::StartChkpt)?
        };

        // the oldest LSA a crash could lose from the data-page cache; it
        // bounds where redo may start
        let dirty_bound = self.disk.oldest_dirty_lsa();
        let redo_lsa = match dirty_bound {
            Some(d) => d.min(start_lsa),
            None => start_lsa,
        };

        // snapshot the transaction table; records appended while we scan
        // are picked up by analysis after START_CHKPT anyway. A descriptor
        // its owner holds mid-commit is skipped for the same reason.
        let mut trans = Vec::new();
        let mut topops = Vec::new();
        for slot in self.trantab.live_slots() {
            let Some(tdes) = slot.tdes.try_lock() else {
                continue;
            };
            if !tdes.log.has_logged() {
                continue;
            }
            trans.push(ChkptTran {
                isloose_end: tdes.state != crate::tran::TranState::Active,
                trid: tdes.trid,
                state: tdes.state as i32,
                isolation: tdes.isolation as i32,
                head_lsa: tdes.log.head_lsa,
                tail_lsa: tdes.log.tail_lsa,
                undo_nxlsa: tdes.log.undo_nxlsa,
                posp_nxlsa: tdes.log.posp_nxlsa,
                savept_lsa: tdes.log.savept_lsa,
                tail_topresult_lsa: tdes.log.tail_topresult_lsa,
                client_undo_lsa: tdes.log.client_undo_lsa,
                client_posp_lsa: tdes.log.client_posp_lsa,
                user_name: tdes.client.user_name.clone(),
            });
            for entry in &tdes.topops {
                topops.push(ChkptTopop {
                    trid: tdes.trid,
                    lastparent_lsa: entry.lastparent_lsa,
                    posp_lsa: entry.posp_lsa,
                });
            }
        }

        {
            let mut sys_tdes = system.tdes.lock();
            let mut log = self.log.lock();
            log.append(
                SYSTEM_TRID,
                &mut sys_tdes.log,
                &RecordBody::EndChkpt(ChkptEnd {
                    redo_lsa,
                    trans,
                    topops,
                }),
            )?;
            log.flush_all_append_pages()?;
            // data pages made durable here cannot be lost, so the next
            // checkpoint's redo bound moves forward
            self.disk.flush_all(&mut log)?;
            log.hdr.chkpt_lsa = start_lsa;
            log.write_header()?;
            log.reset_chkpt_counter();
            log.loginfo.checkpoint_finished(start_lsa);
        }

        for volid in self.disk.volids() {
            self.disk.set_checkpoint(volid, start_lsa)?;
        }
        tracing::info!(%start_lsa, %redo_lsa, "checkpoint complete");
        Ok(start_lsa)
    }
}
