//! Group commit: a dedicated flusher thread batches the commit-time fsync
//! across concurrent transactions. Committers block until the flushed
//! frontier covers their commit LSA; the flusher wakes on its interval
//! (or an explicit kick, e.g. shutdown) and serves everyone waiting.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::lsa::Lsa;

#[derive(Debug)]
struct GcState {
    flushed_lsa: Lsa,
    shutdown: bool,
}

#[derive(Debug)]
pub struct GroupCommit {
    st: Mutex<GcState>,
    /// Flusher wake-up.
    wake: Condvar,
    /// Waiter release after a flush.
    done: Condvar,
    interval: Duration,
}

impl GroupCommit {
    pub fn new(interval: Duration) -> Self {
        Self {
            st: Mutex::new(GcState {
                flushed_lsa: Lsa::NULL,
                shutdown: false,
            }),
            wake: Condvar::new(),
            done: Condvar::new(),
            interval,
        }
    }

    /// Zero interval means batching is off and commits flush themselves.
    pub fn batching(&self) -> bool {
        !self.interval.is_zero()
    }

    pub fn flushed_lsa(&self) -> Lsa {
        self.st.lock().flushed_lsa
    }

    /// Record a completed flush and release every commit it covers.
    pub fn note_flushed(&self, lsa: Lsa) {
        let mut st = self.st.lock();
        if lsa > st.flushed_lsa {
            st.flushed_lsa = lsa;
        }
        self.done.notify_all();
    }

    /// Block until the flushed frontier reaches `lsa`.
    pub fn wait_durable(&self, lsa: Lsa) {
        let mut st = self.st.lock();
        while st.flushed_lsa < lsa && !st.shutdown {
            self.done.wait(&mut st);
        }
    }

    /// Flusher-side wait; returns `false` once shutdown was requested.
    pub fn flusher_wait(&self) -> bool {
        let mut st = self.st.lock();
        if st.shutdown {
            return false;
        }
        self.wake.wait_for(&mut st, self.interval);
        !st.shutdown
    }

    pub fn request_shutdown(&self) {
        let mut st = self.st.lock();
        st.shutdown = true;
        self.wake.notify_all();
        self.done.notify_all();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn waiters_release_in_lsa_order() {
        let gc = Arc::new(GroupCommit::new(Duration::from_millis(20)));
        let mut handles = Vec::new();
        for i in 1..=4 {
            let gc = gc.clone();
            handles.push(std::thread::spawn(move || {
                gc.wait_durable(Lsa::new(i, 0));
            }));
        }
        // one "flush" covering all four
        gc.note_flushed(Lsa::new(10, 0));
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(gc.flushed_lsa(), Lsa::new(10, 0));
    }

    #[test]
    fn shutdown_releases_everyone() {
        let gc = Arc::new(GroupCommit::new(Duration::from_secs(60)));
        let waiter = {
            let gc = gc.clone();
            std::thread::spawn(move || gc.wait_durable(Lsa::new(1, 0)))
        };
        gc.request_shutdown();
        waiter.join().unwrap();
        assert!(!gc.flusher_wait());
    }
}
