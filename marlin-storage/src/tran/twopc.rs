//! Two-phase commit: coordinator vote collection and decision records,
//! participant prepare, and resolution of in-doubt transactions after
//! recovery. The message transport is a seam; the core only demands
//! prepare/decision delivery and opaque fixed-size participant ids.

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::record::{ParticipantId, RecordBody};
use crate::tran::{TranState, NULL_GTRID};
use crate::Engine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vote {
    Yes,
    No,
}

/// Outbound messaging of the 2PC protocol; the RPC layer implements it.
pub trait TwopcTransport: Send + Sync {
    fn send_prepare(&self, particp: &ParticipantId) -> Result<Vote>;
    fn send_decision(&self, particp: &ParticipantId, commit: bool) -> Result<()>;
}

/// Coordinator-side bookkeeping for one distributed transaction.
#[derive(Debug, Clone)]
pub struct Coordinator {
    pub gtrid: i32,
    pub particps: Vec<ParticipantId>,
    pub ack_received: Vec<bool>,
}

impl Coordinator {
    pub fn new(gtrid: i32, particps: Vec<ParticipantId>) -> Self {
        let n = particps.len();
        Self {
            gtrid,
            particps,
            ack_received: vec![false; n],
        }
    }

    pub fn mark_ack(&mut self, particp_index: usize) {
        if let Some(flag) = self.ack_received.get_mut(particp_index) {
            *flag = true;
        }
    }

    pub fn all_acked(&self) -> bool {
        self.ack_received.iter().all(|a| *a)
    }
}

impl Engine {
    /// Participant side: make the prepared state durable and vote. The
    /// acquired update-lock set rides along so recovery can re-acquire.
    pub fn twopc_prepare(
        &self,
        index: usize,
        gtrid: i32,
        num_object_locks: i32,
        num_page_locks: i32,
        lock_block: Bytes,
    ) -> Result<Vote> {
        let slot = self.trantab.get(index)?;
        let mut tdes = slot.tdes.lock();
        if tdes.state != TranState::Active {
            return Err(Error::Twopc("prepare of a finished transaction".into()));
        }
        tdes.gtrid = gtrid;
        let body = RecordBody::TwopcPrepare {
            gtrid,
            user_name: tdes.client.user_name.clone(),
            num_object_locks,
            num_page_locks,
            lock_block,
        };
        let prepare_lsa = {
            let mut log = self.log.lock();
            log.append(tdes.trid, &mut tdes.log, &body)?
        };
        // the vote means nothing until the prepare record is durable
        self.make_durable(prepare_lsa)?;
        tdes.state = TranState::Unactive2pcPrepare;
        tracing::info!(trid = tdes.trid, gtrid, "prepared for two-phase commit");
        Ok(Vote::Yes)
    }

    /// Participant side: the coordinator's decision arrived.
    pub fn twopc_receive_decision(&self, index: usize, commit: bool) -> Result<()> {
        let slot = self.trantab.get(index)?;
        let mut tdes = slot.tdes.lock();
        if tdes.state != TranState::Unactive2pcPrepare {
            return Err(Error::Twopc("decision for a transaction not in prepare".into()));
        }
        if commit {
            let lsa = self.commit_records_locked(&mut tdes)?;
            self.make_durable(lsa)?;
            tdes.state = TranState::UnactiveCommitted;
        } else {
            self.abort_locked(&mut tdes, TranState::UnactiveAborted)?;
        }
        Ok(())
    }

    /// Coordinator side, full protocol: collect votes, log the global
    /// decision, run the local part, inform participants and collect
    /// acks. Returns whether the global transaction committed.
    pub fn twopc_execute(
        &self,
        index: usize,
        gtrid: i32,
        particps: Vec<ParticipantId>,
        transport: &dyn TwopcTransport,
    ) -> Result<bool> {
        let slot = self.trantab.get(index)?;
        let mut tdes = slot.tdes.lock();
        if tdes.state != TranState::Active {
            return Err(Error::Twopc("2pc start on a finished transaction".into()));
        }
        tdes.gtrid = gtrid;
        tdes.coord = Some(Coordinator::new(gtrid, particps.clone()));

        let start_body = RecordBody::TwopcStart {
            gtrid,
            user_name: tdes.client.user_name.clone(),
            particps: particps.clone(),
        };
        let start_lsa = {
            let mut log = self.log.lock();
            log.append(tdes.trid, &mut tdes.log, &start_body)?
        };
        self.make_durable(start_lsa)?;
        tdes.state = TranState::Unactive2pcCollectingVotes;

        let mut all_yes = true;
        for particp in &particps {
            match transport.send_prepare(particp) {
                Ok(Vote::Yes) => {}
                Ok(Vote::No) => {
                    all_yes = false;
                    break;
                }
                Err(e) => {
                    tracing::warn!("prepare delivery failed, counting as NO vote: {e}");
                    all_yes = false;
                    break;
                }
            }
        }

        if all_yes {
            let decision_lsa = {
                let mut log = self.log.lock();
                log.append(tdes.trid, &mut tdes.log, &RecordBody::TwopcCommitDecision)?
            };
            self.make_durable(decision_lsa)?;
            tdes.state = TranState::Unactive2pcCommitDecision;

            let commit_lsa = self.commit_records_locked(&mut tdes)?;
            self.make_durable(commit_lsa)?;
            tdes.state = TranState::UnactiveCommittedInformingParticipants;
            let inform_lsa = {
                let mut log = self.log.lock();
                log.append(
                    tdes.trid,
                    &mut tdes.log,
                    &RecordBody::TwopcCommitInformParticps,
                )?
            };
            // a crash past this point re-attaches the coordinator in the
            // informing state instead of forgetting the participants
            self.make_durable(inform_lsa)?;
            self.inform_participants(&mut tdes, transport, true)?;
            if tdes.coord.as_ref().map_or(true, Coordinator::all_acked) {
                tdes.state = TranState::UnactiveCommitted;
            }
            Ok(true)
        } else {
            let decision_lsa = {
                let mut log = self.log.lock();
                log.append(tdes.trid, &mut tdes.log, &RecordBody::TwopcAbortDecision)?
            };
            self.make_durable(decision_lsa)?;
            tdes.state = TranState::Unactive2pcAbortDecision;

            self.abort_locked(&mut tdes, TranState::UnactiveAbortedInformingParticipants)?;
            let inform_lsa = {
                let mut log = self.log.lock();
                log.append(
                    tdes.trid,
                    &mut tdes.log,
                    &RecordBody::TwopcAbortInformParticps,
                )?
            };
            self.make_durable(inform_lsa)?;
            self.inform_participants(&mut tdes, transport, false)?;
            if tdes.coord.as_ref().map_or(true, Coordinator::all_acked) {
                tdes.state = TranState::UnactiveAborted;
            }
            Ok(false)
        }
    }

    /// Deliver the global decision to every participant that has not
    /// acknowledged yet; resending to an acked participant is never
    /// needed, the ack set filters them out.
    fn inform_participants(
        &self,
        tdes: &mut crate::tran::Tdes,
        transport: &dyn TwopcTransport,
        commit: bool,
    ) -> Result<()> {
        let (particps, acked) = match &tdes.coord {
            Some(coord) => (coord.particps.clone(), coord.ack_received.clone()),
            None => return Err(Error::Twopc("no coordinator info".into())),
        };
        for (i, particp) in particps.iter().enumerate() {
            if acked.get(i).copied().unwrap_or(false) {
                continue;
            }
            match transport.send_decision(particp, commit) {
                Ok(()) => {
                    let mut log = self.log.lock();
                    log.append(
                        tdes.trid,
                        &mut tdes.log,
                        &RecordBody::TwopcRecvAck {
                            particp_index: i as i32,
                        },
                    )?;
                    drop(log);
                    if let Some(coord) = tdes.coord.as_mut() {
                        coord.mark_ack(i);
                    }
                }
                Err(e) => {
                    // the participant stays in-doubt; a later resend
                    // resolves it, the local outcome is already final
                    tracing::warn!(
                        particp = i,
                        "decision delivery failed, participant left unresolved: {e}"
                    );
                }
            }
        }
        Ok(())
    }

    /// Transactions recovery left in prepared state, awaiting an external
    /// decision. Locks they held remain theirs.
    pub fn in_doubt_transactions(&self) -> Vec<(usize, i32, i32)> {
        self.trantab
            .live_slots()
            .into_iter()
            .filter_map(|slot| {
                let tdes = slot.tdes.lock();
                (tdes.state == TranState::Unactive2pcPrepare && tdes.gtrid != NULL_GTRID)
                    .then(|| (tdes.index, tdes.gtrid, tdes.trid))
            })
            .collect()
    }

    /// External resolution of an in-doubt transaction.
    pub fn resolve_in_doubt(&self, index: usize, commit: bool) -> Result<()> {
        self.twopc_receive_decision(index, commit)
    }

    /// Coordinators recovery re-attached mid "informing participants":
    /// `(tran_index, gtrid, decided_commit)`.
    pub fn informing_transactions(&self) -> Vec<(usize, i32, bool)> {
        self.trantab
            .live_slots()
            .into_iter()
            .filter_map(|slot| {
                let tdes = slot.tdes.lock();
                match tdes.state {
                    TranState::UnactiveCommittedInformingParticipants => {
                        Some((tdes.index, tdes.gtrid, true))
                    }
                    TranState::UnactiveAbortedInformingParticipants => {
                        Some((tdes.index, tdes.gtrid, false))
                    }
                    _ => None,
                }
            })
            .collect()
    }

    /// Finish a re-attached coordinator's second phase: re-send the
    /// logged decision to the participants still missing it.
    pub fn resume_informing(
        &self,
        index: usize,
        transport: &dyn TwopcTransport,
    ) -> Result<bool> {
        let slot = self.trantab.get(index)?;
        let mut tdes = slot.tdes.lock();
        let commit = match tdes.state {
            TranState::UnactiveCommittedInformingParticipants => true,
            TranState::UnactiveAbortedInformingParticipants => false,
            _ => {
                return Err(Error::Twopc(
                    "transaction is not informing participants".into(),
                ))
            }
        };
        self.inform_participants(&mut tdes, transport, commit)?;
        let done = tdes.coord.as_ref().map_or(true, Coordinator::all_acked);
        if done {
            tdes.state = if commit {
                TranState::UnactiveCommitted
            } else {
                TranState::UnactiveAborted
            };
            tracing::info!(trid = tdes.trid, gtrid = tdes.gtrid, commit, "second phase complete");
        }
        Ok(done)
    }
}
