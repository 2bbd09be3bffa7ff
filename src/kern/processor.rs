//! Processor Management - per-core state and the execution context
//!
//! An `Smp` owns one `PerCpu` record per core plus the cross-core call
//! matrix. Code runs "on" a core by holding its run token, which
//! `Smp::enter` hands out as a `Cpu` handle. Everything core-local (the
//! timer wheel, the sleep queue, incoming xcall rings) is reached through
//! that handle, so exclusive ownership follows from holding it.
//!
//! `Cpu` is neither `Send` nor `Sync`. Interrupt-like contexts (xcall
//! functions and timer callbacks) receive `&Cpu`; the suspension points
//! (`wait`, `idle_until`, `yield_now`) need `&mut Cpu`, so those contexts
//! cannot block.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::cell::Cell;
use core::fmt;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::config::{ConfigError, SmpConfig};
use crate::fatal;
use crate::kern::counters::{CounterSnapshot, SmpCounters};
use crate::kern::cpusync::CpuSyncState;
use crate::kern::reclaim::{ReclaimList, QUIESCED_OFFLINE};
use crate::kern::sched_prim::SleepQueue;
use crate::kern::thread::Thread;
use crate::kern::timer::TimerWheel;
use crate::kern::xcall::XcallMatrix;
use crate::platform::Platform;
use crate::types::CpuId;

// ============================================================================
// Processor State
// ============================================================================

/// Processor states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ProcessorState {
    /// No context holds the core
    OffLine = 0,
    /// A context is executing on the core
    Running = 1,
    /// A context is suspended on the core, waiting for a notification
    Idle = 2,
}

impl ProcessorState {
    fn from_u32(v: u32) -> Self {
        match v {
            1 => ProcessorState::Running,
            2 => ProcessorState::Idle,
            _ => ProcessorState::OffLine,
        }
    }
}

// ============================================================================
// Per-CPU Record
// ============================================================================

/// Everything one core owns
pub(crate) struct PerCpu {
    /// Core ID
    pub(crate) id: CpuId,
    /// Run token
    running: AtomicBool,
    /// Diagnostic state
    state: AtomicU32,
    /// Hard clock ticks
    pub(crate) ticks: AtomicU64,
    /// A poll has been requested and not yet started
    pub(crate) npoll: AtomicBool,
    /// Epoch of the last quiescent point, `QUIESCED_OFFLINE` when unheld
    pub(crate) quiesced: AtomicU64,
    /// Timer wheel
    pub(crate) wheel: TimerWheel,
    /// Sleep queue
    pub(crate) sleepq: SleepQueue,
    /// Objects retired on this core
    pub(crate) reclaim: ReclaimList,
}

impl PerCpu {
    fn new(id: CpuId, config: &SmpConfig) -> Self {
        Self {
            id,
            running: AtomicBool::new(false),
            state: AtomicU32::new(ProcessorState::OffLine as u32),
            ticks: AtomicU64::new(0),
            npoll: AtomicBool::new(false),
            quiesced: AtomicU64::new(QUIESCED_OFFLINE),
            wheel: TimerWheel::new(id, config.wheel_slots),
            sleepq: SleepQueue::new(id, config.sleepq_buckets),
            reclaim: ReclaimList::new(),
        }
    }

    fn try_acquire(&self) -> bool {
        self.running
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn acquire(&self) {
        while !self.try_acquire() {
            while self.running.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
    }

    fn release(&self) {
        self.running.store(false, Ordering::Release);
    }

    fn set_state(&self, state: ProcessorState) {
        self.state.store(state as u32, Ordering::Relaxed);
    }
}

// ============================================================================
// SMP Instance
// ============================================================================

/// The set of cores and everything shared between them
pub struct Smp {
    config: SmpConfig,
    platform: Arc<dyn Platform>,
    cpus: Box<[PerCpu]>,
    pub(crate) xcalls: XcallMatrix,
    pub(crate) cpusync: CpuSyncState,
    /// Global reclamation epoch
    pub(crate) epoch: AtomicU64,
    counters: SmpCounters,
}

impl fmt::Debug for Smp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Smp")
            .field("ncpus", &self.config.ncpus)
            .field("epoch", &self.epoch.load(Ordering::Relaxed))
            .finish()
    }
}

impl Smp {
    /// Build an instance for `config.ncpus` cores
    pub fn new(config: SmpConfig, platform: Arc<dyn Platform>) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        let cpus = (0..config.ncpus)
            .map(|i| PerCpu::new(CpuId(i), &config))
            .collect();
        let xcalls = XcallMatrix::new(config.ncpus, config.xcall_fifo);
        log::debug!(
            "smp: {} cpus, xcall fifo {}, wheel {}, sleepq {}, hz {}",
            config.ncpus,
            config.xcall_fifo,
            config.wheel_slots,
            config.sleepq_buckets,
            config.hz
        );
        Ok(Arc::new(Self {
            config,
            platform,
            cpus,
            xcalls,
            cpusync: CpuSyncState::new(),
            epoch: AtomicU64::new(1),
            counters: SmpCounters::new(),
        }))
    }

    /// Active configuration
    pub fn config(&self) -> &SmpConfig {
        &self.config
    }

    /// Number of cores
    pub fn ncpus(&self) -> usize {
        self.config.ncpus
    }

    /// Clock rate
    pub fn hz(&self) -> u32 {
        self.config.hz
    }

    /// Hard clock ticks seen by `cpu`
    pub fn ticks(&self, cpu: CpuId) -> u64 {
        self.pcpu(cpu).ticks.load(Ordering::Acquire)
    }

    /// Diagnostic state of `cpu`
    pub fn state(&self, cpu: CpuId) -> ProcessorState {
        ProcessorState::from_u32(self.pcpu(cpu).state.load(Ordering::Relaxed))
    }

    /// Snapshot of the diagnostic counters
    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    /// The live counter set
    pub fn counter_set(&self) -> &SmpCounters {
        &self.counters
    }

    /// Advance `cpu`'s clock by one tick.
    ///
    /// Called from the clock interrupt; the owner runs expired timers on its
    /// next poll.
    pub fn hardclock(&self, cpu: CpuId) {
        self.pcpu(cpu).ticks.fetch_add(1, Ordering::AcqRel);
        self.counters.clock_ticks.inc();
        self.platform.notify(cpu);
    }

    /// Send an unconditional notification to `cpu`
    pub fn notify(&self, cpu: CpuId) {
        self.platform.notify(cpu);
    }

    /// Ask `cpu` to poll, unless a poll is already pending
    pub(crate) fn request_poll(&self, cpu: CpuId) {
        if self.pcpu(cpu).npoll.swap(true, Ordering::SeqCst) {
            self.counters.xcall_notify_avoided.inc();
        } else {
            self.platform.notify(cpu);
        }
    }

    pub(crate) fn pcpu(&self, cpu: CpuId) -> &PerCpu {
        match self.cpus.get(cpu.index()) {
            Some(pcpu) => pcpu,
            None => fatal!("{} out of range ({} cpus)", cpu, self.cpus.len()),
        }
    }

    pub(crate) fn percpus(&self) -> &[PerCpu] {
        &self.cpus
    }

    /// Become the context running on `cpu`, spinning until it is free
    pub fn enter(&self, cpu: CpuId, thread: &Arc<Thread>) -> Cpu<'_> {
        let pcpu = self.pcpu(cpu);
        pcpu.acquire();
        Cpu::attach(self, pcpu, thread.clone())
    }

    /// Become the context running on `cpu` if nobody holds it
    pub fn try_enter(&self, cpu: CpuId, thread: &Arc<Thread>) -> Option<Cpu<'_>> {
        let pcpu = self.pcpu(cpu);
        if pcpu.try_acquire() {
            Some(Cpu::attach(self, pcpu, thread.clone()))
        } else {
            None
        }
    }
}

// ============================================================================
// Execution Context
// ============================================================================

/// Handle proving the holder runs on one core
pub struct Cpu<'a> {
    smp: &'a Smp,
    pub(crate) pcpu: &'a PerCpu,
    thread: Arc<Thread>,
    /// Active drains on this context
    pub(crate) depth: Cell<u32>,
    /// Taking part in a rendezvous
    pub(crate) in_cpusync: Cell<bool>,
    _not_send: PhantomData<*mut ()>,
}

impl fmt::Debug for Cpu<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cpu")
            .field("id", &self.pcpu.id)
            .field("thread", &self.thread.id())
            .field("depth", &self.depth.get())
            .finish()
    }
}

impl<'a> Cpu<'a> {
    fn attach(smp: &'a Smp, pcpu: &'a PerCpu, thread: Arc<Thread>) -> Self {
        let cpu = Self {
            smp,
            pcpu,
            thread,
            depth: Cell::new(0),
            in_cpusync: Cell::new(false),
            _not_send: PhantomData,
        };
        cpu.online();
        cpu
    }

    /// Core ID
    #[inline]
    pub fn id(&self) -> CpuId {
        self.pcpu.id
    }

    /// The owning instance
    #[inline]
    pub fn smp(&self) -> &'a Smp {
        self.smp
    }

    /// Thread running in this context
    pub fn curthread(&self) -> &Arc<Thread> {
        &self.thread
    }

    /// Hard clock ticks of this core
    pub fn ticks(&self) -> u64 {
        self.pcpu.ticks.load(Ordering::Acquire)
    }

    /// Is this context inside an xcall drain (an interrupt-like context)?
    pub fn in_interrupt(&self) -> bool {
        self.depth.get() > 0
    }

    /// Run everything pending on this core: incoming xcalls, expired
    /// timers and retired objects whose grace period has passed.
    pub fn poll(&self) {
        self.drain_incoming();
        self.softclock();
        if self.depth.get() == 0 {
            self.quiesce();
        }
        self.reclaim();
    }

    /// Poll until `cond` holds, idling between polls
    pub fn idle_until(&mut self, mut cond: impl FnMut(&Cpu<'a>) -> bool) {
        loop {
            self.poll();
            if cond(&*self) {
                return;
            }
            self.block();
        }
    }

    /// Let any other context waiting for this core run
    pub fn yield_now(&mut self) {
        self.go_offline(ProcessorState::OffLine);
        core::hint::spin_loop();
        self.pcpu.acquire();
        self.online();
        self.poll();
    }

    /// Give up the core until notified, then take it back.
    pub(crate) fn block(&mut self) {
        self.go_offline(ProcessorState::Idle);
        self.smp.platform.idle(self.id());
        self.pcpu.acquire();
        self.online();
    }

    fn online(&self) {
        self.pcpu.set_state(ProcessorState::Running);
        self.quiesce();
    }

    fn go_offline(&self, state: ProcessorState) {
        self.pcpu.quiesced.store(QUIESCED_OFFLINE, Ordering::SeqCst);
        self.pcpu.set_state(state);
        self.pcpu.release();
    }
}

impl Drop for Cpu<'_> {
    fn drop(&mut self) {
        self.go_offline(ProcessorState::OffLine);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::SpinPlatform;
    use crate::testutil::{new_smp, thread};

    #[test]
    fn test_new_rejects_bad_config() {
        let platform = Arc::new(SpinPlatform::new(0));
        assert_eq!(
            Smp::new(SmpConfig::new(0), platform).err(),
            Some(ConfigError::InvalidCpuCount(0))
        );
    }

    #[test]
    fn test_enter_is_exclusive() {
        let smp = new_smp(2);
        let t = thread("main");
        assert_eq!(smp.state(CpuId(0)), ProcessorState::OffLine);

        let cpu = smp.enter(CpuId(0), &t);
        assert_eq!(cpu.id(), CpuId(0));
        assert_eq!(smp.state(CpuId(0)), ProcessorState::Running);
        assert!(smp.try_enter(CpuId(0), &t).is_none());
        assert!(smp.try_enter(CpuId(1), &t).is_some());

        drop(cpu);
        assert_eq!(smp.state(CpuId(0)), ProcessorState::OffLine);
        assert!(smp.try_enter(CpuId(0), &t).is_some());
    }

    #[test]
    fn test_hardclock_advances_ticks() {
        let smp = new_smp(2);
        smp.hardclock(CpuId(1));
        smp.hardclock(CpuId(1));
        assert_eq!(smp.ticks(CpuId(1)), 2);
        assert_eq!(smp.ticks(CpuId(0)), 0);
        assert_eq!(smp.counters().clock_ticks, 2);
    }

    #[test]
    fn test_idle_until_polls() {
        let smp = new_smp(1);
        let mut cpu = smp.enter(CpuId(0), &thread("idle"));
        let mut polls = 0;
        cpu.idle_until(|_| {
            polls += 1;
            polls == 3
        });
        assert_eq!(polls, 3);
        cpu.yield_now();
        assert_eq!(smp.state(CpuId(0)), ProcessorState::Running);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_enter_unknown_cpu_is_fatal() {
        let smp = new_smp(2);
        let _cpu = smp.enter(CpuId(5), &thread("lost"));
    }
}
