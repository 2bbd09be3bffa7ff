//! Deferred reclamation of callout backends
//!
//! A terminated callout's backend may still be referenced from a remote
//! wheel slot or observed by a core that has not yet polled. Retiring it
//! stamps it with the global epoch; it is released only once every online
//! core has passed a quiescent point (a top-level `poll`) after that stamp.
//! A core that nobody holds cannot be observing anything and does not hold
//! reclamation back.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;
use spin::Mutex;

use crate::kern::processor::Cpu;
use crate::kern::timer::CalloutBackend;

/// `PerCpu::quiesced` value of a core that no context holds
pub(crate) const QUIESCED_OFFLINE: u64 = u64::MAX;

struct Retired {
    stamp: u64,
    /// Only held, so the backend outlives its grace period
    #[allow(dead_code)]
    backend: Arc<CalloutBackend>,
}

/// Objects retired on one core, oldest first
pub(crate) struct ReclaimList {
    list: Mutex<VecDeque<Retired>>,
}

impl ReclaimList {
    pub(crate) fn new() -> Self {
        Self {
            list: Mutex::new(VecDeque::new()),
        }
    }

    fn len(&self) -> usize {
        self.list.lock().len()
    }
}

impl<'a> Cpu<'a> {
    /// Queue `backend` for release after a grace period
    pub(crate) fn retire(&self, backend: Arc<CalloutBackend>) {
        let stamp = self.smp().epoch.fetch_add(1, Ordering::SeqCst);
        self.pcpu
            .reclaim
            .list
            .lock()
            .push_back(Retired { stamp, backend });
    }

    /// Record a quiescent point for this core
    pub(crate) fn quiesce(&self) {
        let epoch = self.smp().epoch.load(Ordering::SeqCst);
        self.pcpu.quiesced.store(epoch, Ordering::SeqCst);
    }

    /// Release every retired object whose grace period has passed
    pub(crate) fn reclaim(&self) -> usize {
        let smp = self.smp();
        let horizon = smp
            .percpus()
            .iter()
            .map(|p| p.quiesced.load(Ordering::SeqCst))
            .min()
            .unwrap_or(QUIESCED_OFFLINE);

        let freed: Vec<Retired> = {
            let mut list = self.pcpu.reclaim.list.lock();
            let mut freed = Vec::new();
            while list.front().is_some_and(|r| r.stamp < horizon) {
                if let Some(r) = list.pop_front() {
                    freed.push(r);
                }
            }
            freed
        };

        let n = freed.len();
        if n > 0 {
            smp.counter_set().callouts_reclaimed.add(n as u64);
            log::debug!("reclaim: {} freed {} backends", self.id(), n);
        }
        // Backends drop here, outside the list lock
        drop(freed);
        n
    }

    /// Objects retired on this core and not yet released
    pub fn pending_reclaim(&self) -> usize {
        self.pcpu.reclaim.len()
    }
}
