//! Cpusync - multi-core rendezvous
//!
//! Holds a set of cores in a polling loop, runs a function exactly once on
//! each while they are held, then lets them go. One acknowledgement mask is
//! used in two stages:
//!
//! 1. each target sets its bit when it enters the hold loop;
//! 2. the initiator, having seen every bit, clears the mask to say
//!    "proceed";
//! 3. each target runs the function and sets its bit again.
//!
//! Held cores keep draining their incoming xcalls, so a held core can still
//! serve other cores. Initiators serialize on one global lock and drain
//! while waiting for it, which lets a waiting initiator act as a target.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::fatal;
use crate::kern::lock::SimpleLock;
use crate::kern::processor::Cpu;
use crate::types::{CpuId, CpuMask};

/// Function run on every core of a rendezvous
pub type CpuSyncFn = Arc<dyn Fn(&Cpu<'_>) + Send + Sync>;

/// Rendezvous state shared by all cores
pub(crate) struct CpuSyncState {
    lock: SimpleLock,
}

impl CpuSyncState {
    pub(crate) const fn new() -> Self {
        Self {
            lock: SimpleLock::new(),
        }
    }
}

struct CpuSyncRequest {
    initiator: CpuId,
    targets: CpuMask,
    ack: AtomicU64,
    func: CpuSyncFn,
}

/// An active rendezvous; the targets stay held until `finish` (or drop)
pub struct CpuSyncGuard<'c, 'a> {
    cpu: &'c Cpu<'a>,
    req: Arc<CpuSyncRequest>,
    run_local: bool,
    finished: bool,
}

impl CpuSyncGuard<'_, '_> {
    /// Cores held (not counting the initiator)
    pub fn targets(&self) -> CpuMask {
        self.req.targets
    }

    /// Run the function everywhere and release the targets
    pub fn finish(mut self) {
        self.complete();
    }

    fn complete(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;

        let cpu = self.cpu;
        if self.run_local {
            (self.req.func)(cpu);
        }
        self.req.ack.store(0, Ordering::Release);
        cpu.cpusync_wait(&self.req, self.req.targets.bits());

        cpu.in_cpusync.set(false);
        let smp = cpu.smp();
        smp.cpusync.lock.unlock();
        smp.counter_set().cpusyncs.inc();
        log::debug!(
            "cpusync: {} released {:?}",
            self.req.initiator,
            self.req.targets
        );
    }
}

impl Drop for CpuSyncGuard<'_, '_> {
    fn drop(&mut self) {
        self.complete();
    }
}

impl<'a> Cpu<'a> {
    /// Run `func` exactly once on every core in `mask` while all of them
    /// are held in a rendezvous.
    pub fn cpusync(&self, mask: CpuMask, func: impl Fn(&Cpu<'_>) + Send + Sync + 'static) {
        self.cpusync_start(mask, func).finish();
    }

    /// Hold every other core in `mask` and return once they are all held.
    ///
    /// `func` runs on each core of `mask` when the guard finishes.
    pub fn cpusync_start<'c>(
        &'c self,
        mask: CpuMask,
        func: impl Fn(&Cpu<'_>) + Send + Sync + 'static,
    ) -> CpuSyncGuard<'c, 'a> {
        if self.in_cpusync.get() {
            fatal!("{} re-entered cpusync", self.id());
        }
        let smp = self.smp();
        smp.cpusync.lock.lock(self);
        self.in_cpusync.set(true);

        let mask = CpuMask::from_bits(mask.bits() & CpuMask::all(smp.ncpus()).bits());
        let targets = mask.without(self.id());
        let req = Arc::new(CpuSyncRequest {
            initiator: self.id(),
            targets,
            ack: AtomicU64::new(0),
            func: Arc::new(func),
        });
        log::debug!("cpusync: {} holding {:?}", self.id(), targets);

        for target in targets.cpus() {
            let req = req.clone();
            self.xcall_with(target, move |c| c.cpusync_hold(&req));
        }
        self.cpusync_wait(&req, targets.bits());

        CpuSyncGuard {
            cpu: self,
            req,
            run_local: mask.contains(self.id()),
            finished: false,
        }
    }

    /// Is this context taking part in a rendezvous?
    pub fn in_cpusync(&self) -> bool {
        self.in_cpusync.get()
    }

    fn cpusync_hold(&self, req: &CpuSyncRequest) {
        if self.in_cpusync.get() {
            fatal!("{} re-entered cpusync (from {})", self.id(), req.initiator);
        }
        self.in_cpusync.set(true);

        let bit = self.id().bit();
        req.ack.fetch_or(bit, Ordering::AcqRel);
        while req.ack.load(Ordering::Acquire) & bit != 0 {
            self.drain_incoming();
            core::hint::spin_loop();
        }

        (req.func)(self);
        req.ack.fetch_or(bit, Ordering::AcqRel);
        self.in_cpusync.set(false);
    }

    fn cpusync_wait(&self, req: &CpuSyncRequest, want: u64) {
        while req.ack.load(Ordering::Acquire) != want {
            self.drain_incoming();
            core::hint::spin_loop();
        }
    }
}
