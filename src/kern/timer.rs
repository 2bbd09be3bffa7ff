//! Callouts - per-core hashed timer wheel
//!
//! Each core owns a wheel of `wheel_slots` buckets indexed by
//! `expire & mask`. Entries only ever live on their owner's wheel; arming a
//! callout for another core sends the insert there as an xcall.
//!
//! A `Callout` is the caller's handle. Its backend is allocated on first
//! arm and never rebound. Every arm or stop bumps the backend's generation,
//! so a wheel entry carrying an old generation never fires. The backend
//! also remembers where its last entry was linked; the next arm unlinks it,
//! on the owning core, so re-arming does not leave entries behind. An entry
//! left by a bare `stop` is dropped when its slot comes up.
//!
//! ## Backend States
//!
//! ```text
//! Idle -> Queued -> Firing -> Idle | Queued
//! ```
//!
//! While `Firing`, requests against the callout are recorded as pending
//! operations and applied by the firing core once the callback returns.
//! A cancel recorded during a firing suppresses any later reset in that
//! same firing.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use spin::{Mutex, Once};

use crate::fatal;
use crate::kern::lock::CpuOwned;
use crate::kern::processor::{Cpu, Smp};
use crate::kern::xcall::Xcall;
use crate::types::CpuId;

/// Timer callback
pub type CalloutFn = Arc<dyn Fn(&Cpu<'_>) + Send + Sync>;

bitflags! {
    /// Requests recorded against a firing callout
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct PendingOps: u8 {
        /// Re-arm once the callback returns
        const RESET = 1 << 0;
        /// Stay idle once the callback returns
        const STOP = 1 << 1;
        /// Stay idle and refuse resets until the callback returns
        const CANCEL = 1 << 2;
    }
}

/// Callout backend state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalloutState {
    /// Not armed
    Idle,
    /// Waiting on `cpu`'s wheel
    Queued { cpu: CpuId, expire: u64 },
    /// Callback running on `cpu`
    Firing { cpu: CpuId },
}

// ============================================================================
// Backend
// ============================================================================

struct PendingReset {
    cpu: CpuId,
    delay: u64,
    func: CalloutFn,
}

struct BackendState {
    phase: CalloutState,
    /// Bumped on every arm and stop; wheel entries with an older value are stale
    generation: u64,
    func: Option<CalloutFn>,
    pending: PendingOps,
    pending_reset: Option<PendingReset>,
    fired: u64,
    /// Core whose wheel saw the most recent arm
    last_cpu: Option<CpuId>,
    /// Entry last linked on a wheel, if it may still be there
    linked: Option<WheelLink>,
}

impl BackendState {
    /// Move to `Queued` on `target`; returns (generation, expire)
    fn arm(&mut self, smp: &Smp, target: CpuId, delay: u64, func: CalloutFn) -> (u64, u64) {
        self.generation = self.generation.wrapping_add(1);
        let expire = smp.ticks(target) + delay.max(1);
        self.func = Some(func);
        self.phase = CalloutState::Queued {
            cpu: target,
            expire,
        };
        self.last_cpu = Some(target);
        self.linked = Some(WheelLink {
            cpu: target,
            expire,
            generation: self.generation,
        });
        (self.generation, expire)
    }

    /// Forget `linked` if it names the entry of `generation`
    fn unlinked(&mut self, generation: u64) {
        if self.linked.is_some_and(|l| l.generation == generation) {
            self.linked = None;
        }
    }
}

/// Shared state behind a `Callout`
pub(crate) struct CalloutBackend {
    state: Mutex<BackendState>,
}

impl CalloutBackend {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BackendState {
                phase: CalloutState::Idle,
                generation: 0,
                func: None,
                pending: PendingOps::empty(),
                pending_reset: None,
                fired: 0,
                last_cpu: None,
                linked: None,
            }),
        })
    }
}

// ============================================================================
// Wheel
// ============================================================================

pub(crate) struct WheelEntry {
    expire: u64,
    generation: u64,
    backend: Arc<CalloutBackend>,
}

/// Where a backend's entry sits: wheel, slot and generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct WheelLink {
    cpu: CpuId,
    expire: u64,
    generation: u64,
}

struct Wheel {
    /// Last tick processed by the softclock
    curticks: u64,
    mask: u64,
    slots: Box<[Vec<WheelEntry>]>,
}

/// One core's timer wheel
pub(crate) struct TimerWheel {
    inner: CpuOwned<Wheel>,
}

impl TimerWheel {
    pub(crate) fn new(owner: CpuId, nslots: usize) -> Self {
        Self {
            inner: CpuOwned::new(
                owner,
                Wheel {
                    curticks: 0,
                    mask: (nslots - 1) as u64,
                    slots: (0..nslots).map(|_| Vec::new()).collect(),
                },
            ),
        }
    }
}

impl<'a> Cpu<'a> {
    /// Entries linked on this core's wheel, stale ones included
    pub(crate) fn wheel_entries(&self) -> usize {
        self.pcpu
            .wheel
            .inner
            .with(self, |w| w.slots.iter().map(Vec::len).sum())
    }
}

impl<'a> Cpu<'a> {
    /// Run every callout whose expiry has passed on this core
    pub(crate) fn softclock(&self) {
        let target = self.ticks();
        loop {
            let due = self.pcpu.wheel.inner.with(self, |w| {
                if w.curticks >= target {
                    return None;
                }
                w.curticks += 1;
                let tick = w.curticks;
                let slot = &mut w.slots[(tick & w.mask) as usize];
                let (due, keep): (Vec<_>, Vec<_>) =
                    core::mem::take(slot).into_iter().partition(|e| e.expire <= tick);
                *slot = keep;
                Some(due)
            });
            let Some(due) = due else {
                break;
            };
            for entry in due {
                self.fire(entry);
            }
        }
    }

    fn fire(&self, entry: WheelEntry) {
        let backend = entry.backend;
        let func = {
            let mut st = backend.state.lock();
            st.unlinked(entry.generation);
            if st.generation != entry.generation {
                return;
            }
            match st.phase {
                CalloutState::Queued { cpu, .. } if cpu == self.id() => {}
                CalloutState::Queued { cpu, .. } => {
                    fatal!("callout queued on {} found on {} wheel", cpu, self.id())
                }
                _ => return,
            }
            st.phase = CalloutState::Firing { cpu: self.id() };
            st.func.clone()
        };

        log::trace!("callout: firing on {} at tick {}", self.id(), entry.expire);
        if let Some(func) = func {
            func(self);
        }
        self.smp().counter_set().callouts_fired.inc();

        let requeue = {
            let mut st = backend.state.lock();
            st.fired += 1;
            let pending = core::mem::take(&mut st.pending);
            let reset = st.pending_reset.take();
            match reset {
                Some(r)
                    if pending.contains(PendingOps::RESET)
                        && !pending.contains(PendingOps::CANCEL) =>
                {
                    let (generation, expire) = st.arm(self.smp(), r.cpu, r.delay, r.func);
                    Some((r.cpu, generation, expire))
                }
                _ => {
                    st.phase = CalloutState::Idle;
                    None
                }
            }
        };
        if let Some((target, generation, expire)) = requeue {
            self.callout_insert(
                target,
                WheelEntry {
                    expire,
                    generation,
                    backend,
                },
            );
        }
    }

    fn callout_insert(&self, target: CpuId, entry: WheelEntry) {
        if target == self.id() {
            self.wheel_insert(entry);
        } else {
            self.xcall_with(target, move |c| c.wheel_insert(entry));
        }
    }

    /// Link `entry` into this core's wheel unless it is already stale
    pub(crate) fn wheel_insert(&self, mut entry: WheelEntry) {
        let backend = entry.backend.clone();
        let mut st = backend.state.lock();
        if st.generation != entry.generation {
            st.unlinked(entry.generation);
            return;
        }
        self.pcpu.wheel.inner.with(self, |w| {
            // Never the current or a past slot
            entry.expire = entry.expire.max(w.curticks + 1);
            if let Some(link) = st.linked.as_mut() {
                if link.cpu == self.id() && link.generation == entry.generation {
                    link.expire = entry.expire;
                }
            }
            let slot = (entry.expire & w.mask) as usize;
            w.slots[slot].push(entry);
        });
    }

    /// Unlink the entry described by `link`, on whichever core owns it
    fn callout_unlink(&self, link: WheelLink, backend: &Arc<CalloutBackend>) {
        if link.cpu == self.id() {
            self.wheel_unlink(link, backend);
        } else {
            let backend = backend.clone();
            self.xcall_with(link.cpu, move |c| {
                c.wheel_unlink(link, &backend);
            });
        }
    }

    fn wheel_unlink(&self, link: WheelLink, backend: &Arc<CalloutBackend>) -> bool {
        let removed = self.pcpu.wheel.inner.with(self, |w| {
            let slot = &mut w.slots[(link.expire & w.mask) as usize];
            let pos = slot
                .iter()
                .position(|e| e.generation == link.generation && Arc::ptr_eq(&e.backend, backend));
            pos.map(|pos| slot.remove(pos)).is_some()
        });
        if removed {
            log::trace!("callout: unlinked stale entry from {}", self.id());
        }
        removed
    }
}

// ============================================================================
// Callout Handle
// ============================================================================

/// Caller-owned timer handle
pub struct Callout {
    backend: Once<Arc<CalloutBackend>>,
}

impl core::fmt::Debug for Callout {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Callout")
            .field("state", &self.state())
            .field("fired", &self.fire_count())
            .finish()
    }
}

impl Callout {
    /// Create an unarmed callout
    pub const fn new() -> Self {
        Self {
            backend: Once::new(),
        }
    }

    fn backend(&self) -> &Arc<CalloutBackend> {
        self.backend.call_once(CalloutBackend::new)
    }

    /// Arm on the calling core to run `func` after `delay` ticks.
    ///
    /// A zero delay means the next tick. Returns false if the request was
    /// refused because a cancel is pending against the current firing.
    pub fn reset(
        &self,
        cpu: &Cpu<'_>,
        delay: u64,
        func: impl Fn(&Cpu<'_>) + Send + Sync + 'static,
    ) -> bool {
        self.arm(cpu, cpu.id(), delay, Some(Arc::new(func)))
    }

    /// Arm on `target` to run `func` after `delay` of `target`'s ticks
    pub fn reset_on(
        &self,
        cpu: &Cpu<'_>,
        target: CpuId,
        delay: u64,
        func: impl Fn(&Cpu<'_>) + Send + Sync + 'static,
    ) -> bool {
        self.arm(cpu, target, delay, Some(Arc::new(func)))
    }

    /// Re-arm on the calling core with the last function.
    ///
    /// Returns false if the callout was never armed.
    pub fn reschedule(&self, cpu: &Cpu<'_>, delay: u64) -> bool {
        self.arm(cpu, cpu.id(), delay, None)
    }

    fn arm(&self, cpu: &Cpu<'_>, target: CpuId, delay: u64, func: Option<CalloutFn>) -> bool {
        let smp = cpu.smp();
        if target.index() >= smp.ncpus() {
            fatal!("callout armed on {} ({} cpus)", target, smp.ncpus());
        }
        let backend = self.backend();
        let (stale, entry) = {
            let mut st = backend.state.lock();
            let Some(func) = func.or_else(|| st.func.clone()) else {
                return false;
            };
            if let CalloutState::Firing { .. } = st.phase {
                if st.pending.contains(PendingOps::CANCEL) {
                    return false;
                }
                st.pending.remove(PendingOps::STOP);
                st.pending.insert(PendingOps::RESET);
                st.pending_reset = Some(PendingReset {
                    cpu: target,
                    delay,
                    func,
                });
                return true;
            }
            let stale = st.linked.take();
            let (generation, expire) = st.arm(smp, target, delay, func);
            let entry = WheelEntry {
                expire,
                generation,
                backend: backend.clone(),
            };
            (stale, entry)
        };
        if let Some(link) = stale {
            cpu.callout_unlink(link, backend);
        }
        cpu.callout_insert(target, entry);
        true
    }

    /// Disarm without waiting.
    ///
    /// Returns true if a pending expiry, or a re-arm requested during the
    /// current firing, was prevented.
    pub fn stop(&self) -> bool {
        self.halt(PendingOps::STOP)
    }

    /// Like `stop`, and refuse re-arms until the current firing completes.
    ///
    /// A second cancel returns false.
    pub fn cancel(&self) -> bool {
        self.halt(PendingOps::STOP | PendingOps::CANCEL)
    }

    fn halt(&self, ops: PendingOps) -> bool {
        let Some(backend) = self.backend.get() else {
            return false;
        };
        let mut st = backend.state.lock();
        match st.phase {
            CalloutState::Queued { .. } => {
                st.generation = st.generation.wrapping_add(1);
                st.phase = CalloutState::Idle;
                true
            }
            CalloutState::Firing { .. } => {
                let prevented = st.pending.contains(PendingOps::RESET);
                st.pending.remove(PendingOps::RESET);
                st.pending_reset = None;
                st.pending.insert(ops);
                prevented
            }
            CalloutState::Idle => false,
        }
    }

    /// Cancel, then wait for a firing on another core to finish.
    ///
    /// A firing on the calling core (cancel from inside the callback) is not
    /// waited for.
    pub fn cancel_sync(&self, cpu: &Cpu<'_>) -> bool {
        let prevented = self.cancel();
        let Some(backend) = self.backend.get() else {
            return prevented;
        };
        loop {
            let remote_firing = matches!(
                backend.state.lock().phase,
                CalloutState::Firing { cpu: c } if c != cpu.id()
            );
            if !remote_firing {
                break;
            }
            cpu.drain_bounded();
            core::hint::spin_loop();
        }
        prevented
    }

    /// Cancel synchronously and hand the backend to the reclaimer of the
    /// core that last owned it.
    pub fn terminate(self, cpu: &Cpu<'_>) {
        self.cancel_sync(cpu);
        let Some(backend) = self.backend.get().cloned() else {
            return;
        };
        let stale = backend.state.lock().linked.take();
        if let Some(link) = stale {
            cpu.callout_unlink(link, &backend);
        }
        let owner = backend.state.lock().last_cpu.unwrap_or(cpu.id());
        if owner == cpu.id() {
            cpu.retire(backend);
        } else {
            cpu.xcall_passive(owner, Xcall::closure(move |c| c.retire(backend)));
        }
    }

    /// Current backend state
    pub fn state(&self) -> CalloutState {
        match self.backend.get() {
            Some(backend) => backend.state.lock().phase,
            None => CalloutState::Idle,
        }
    }

    /// Waiting on a wheel?
    pub fn is_pending(&self) -> bool {
        matches!(self.state(), CalloutState::Queued { .. })
    }

    /// Waiting on a wheel or firing?
    pub fn is_active(&self) -> bool {
        !matches!(self.state(), CalloutState::Idle)
    }

    /// Number of completed firings
    pub fn fire_count(&self) -> u64 {
        self.backend.get().map_or(0, |b| b.state.lock().fired)
    }
}

impl Default for Callout {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Callout {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{new_smp, spawn_clock, spawn_cpu_loop, spin_until, thread};
    use alloc::sync::Weak;
    use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    fn tick(cpu: &Cpu<'_>, n: u64) {
        for _ in 0..n {
            cpu.smp().hardclock(cpu.id());
            cpu.poll();
        }
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&Cpu<'_>) + Send + Sync + 'static) {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        (hits, move |_: &Cpu<'_>| {
            h.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_fires_once_at_expiry() {
        let smp = new_smp(1);
        let cpu = smp.enter(CpuId(0), &thread("timer"));
        let at = Arc::new(AtomicU64::new(0));
        let co = Callout::new();

        let a = at.clone();
        assert!(co.reset(&cpu, 5, move |c| a.store(c.ticks(), Ordering::SeqCst)));
        assert!(co.is_pending());

        tick(&cpu, 4);
        assert_eq!(co.fire_count(), 0);
        tick(&cpu, 1);
        assert_eq!(co.fire_count(), 1);
        assert_eq!(at.load(Ordering::SeqCst), 5);
        assert_eq!(co.state(), CalloutState::Idle);

        tick(&cpu, 10);
        assert_eq!(co.fire_count(), 1);
        assert_eq!(smp.counters().callouts_fired, 1);
    }

    #[test]
    fn test_zero_delay_uses_next_tick() {
        let smp = new_smp(1);
        let cpu = smp.enter(CpuId(0), &thread("timer"));
        let (hits, f) = counter();
        let co = Callout::new();
        co.reset(&cpu, 0, f);
        // Same-tick poll must not fire it
        cpu.poll();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        tick(&cpu, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reschedule_from_own_callback() {
        let smp = new_smp(1);
        let cpu = smp.enter(CpuId(0), &thread("timer"));
        let fired_at = Arc::new(StdMutex::new(Vec::new()));
        let co = Arc::new(Callout::new());

        let weak: Weak<Callout> = Arc::downgrade(&co);
        let log = fired_at.clone();
        co.reset(&cpu, 50, move |c| {
            let mut log = log.lock().unwrap();
            log.push(c.ticks());
            if log.len() == 1 {
                if let Some(co) = weak.upgrade() {
                    assert!(co.reschedule(c, 10));
                }
            }
        });

        tick(&cpu, 100);
        assert_eq!(*fired_at.lock().unwrap(), [50, 60]);
        assert_eq!(co.fire_count(), 2);
    }

    #[test]
    fn test_reset_supersedes_pending_arm() {
        let smp = new_smp(1);
        let cpu = smp.enter(CpuId(0), &thread("timer"));
        let (first, f1) = counter();
        let (second, f2) = counter();
        let co = Callout::new();

        co.reset(&cpu, 10, f1);
        co.reset(&cpu, 20, f2);
        tick(&cpu, 30);
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_rearm_keeps_one_wheel_entry() {
        let smp = new_smp(1);
        let cpu = smp.enter(CpuId(0), &thread("timer"));
        let (hits, f) = counter();
        let co = Callout::new();

        co.reset(&cpu, 100, f);
        for delay in 0..10_000 {
            assert!(co.reschedule(&cpu, 100 + delay % 7));
        }
        assert_eq!(cpu.wheel_entries(), 1);

        // A stopped entry goes with the next arm
        assert!(co.stop());
        assert!(co.reschedule(&cpu, 3));
        assert_eq!(cpu.wheel_entries(), 1);

        tick(&cpu, 3);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(cpu.wheel_entries(), 0);
    }

    #[test]
    fn test_remote_rearm_unlinks_on_owner() {
        let smp = new_smp(2);
        let t = thread("both");
        let cpu0 = smp.enter(CpuId(0), &t);
        let cpu1 = smp.enter(CpuId(1), &t);
        let (hits, f) = counter();
        let co = Callout::new();

        co.reset_on(&cpu0, CpuId(1), 50, f);
        cpu1.poll();
        assert_eq!(cpu1.wheel_entries(), 1);

        assert!(co.reschedule(&cpu0, 5));
        cpu1.poll();
        assert_eq!(cpu1.wheel_entries(), 0);
        assert_eq!(cpu0.wheel_entries(), 1);

        tick(&cpu0, 5);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_terminate_unlinks_pending_entry() {
        let smp = new_smp(1);
        let cpu = smp.enter(CpuId(0), &thread("timer"));
        let (_hits, f) = counter();
        let co = Callout::new();

        co.reset(&cpu, 40, f);
        assert_eq!(cpu.wheel_entries(), 1);
        co.terminate(&cpu);
        assert_eq!(cpu.wheel_entries(), 0);
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let smp = new_smp(1);
        let cpu = smp.enter(CpuId(0), &thread("timer"));
        let (hits, f) = counter();
        let co = Callout::new();

        assert!(!co.cancel());
        co.reset(&cpu, 10, f);
        assert!(co.cancel());
        assert!(!co.cancel());
        assert!(!co.stop());
        tick(&cpu, 20);
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        // A cancelled callout can be armed again
        assert!(co.reschedule(&cpu, 1));
        tick(&cpu, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_inside_callback_beats_reset() {
        let smp = new_smp(1);
        let cpu = smp.enter(CpuId(0), &thread("timer"));
        let co = Arc::new(Callout::new());
        let weak = Arc::downgrade(&co);
        let outcome = Arc::new(StdMutex::new(None));

        let out = outcome.clone();
        co.reset(&cpu, 1, move |c| {
            if let Some(co) = weak.upgrade() {
                let rearmed = co.reschedule(c, 5);
                let cancelled = co.cancel();
                let rearmed_after_cancel = co.reschedule(c, 5);
                *out.lock().unwrap() = Some((rearmed, cancelled, rearmed_after_cancel));
            }
        });

        tick(&cpu, 20);
        assert_eq!(*outcome.lock().unwrap(), Some((true, true, false)));
        assert_eq!(co.fire_count(), 1);
        assert_eq!(co.state(), CalloutState::Idle);
    }

    #[test]
    fn test_stop_inside_callback_drops_reset() {
        let smp = new_smp(1);
        let cpu = smp.enter(CpuId(0), &thread("timer"));
        let co = Arc::new(Callout::new());
        let weak = Arc::downgrade(&co);

        co.reset(&cpu, 1, move |c| {
            if let Some(co) = weak.upgrade() {
                co.reschedule(c, 3);
                assert!(co.stop());
                // Unlike cancel, stop leaves later resets allowed
                assert!(co.reschedule(c, 3));
                assert!(co.stop());
            }
        });

        tick(&cpu, 10);
        assert_eq!(co.fire_count(), 1);
        assert!(!co.is_active());
    }

    #[test]
    fn test_remote_reset_fires_on_target() {
        let smp = new_smp(2);
        let t = thread("both");
        let cpu0 = smp.enter(CpuId(0), &t);
        let cpu1 = smp.enter(CpuId(1), &t);
        let ran_on = Arc::new(AtomicUsize::new(usize::MAX));
        let co = Callout::new();

        let r = ran_on.clone();
        co.reset_on(&cpu0, CpuId(1), 3, move |c| {
            r.store(c.id().index(), Ordering::SeqCst);
        });
        assert_eq!(co.state(), CalloutState::Queued { cpu: CpuId(1), expire: 3 });

        tick(&cpu0, 5);
        assert_eq!(ran_on.load(Ordering::SeqCst), usize::MAX);
        tick(&cpu1, 3);
        assert_eq!(ran_on.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stop_before_remote_insert_lands() {
        let smp = new_smp(2);
        let t = thread("both");
        let cpu0 = smp.enter(CpuId(0), &t);
        let cpu1 = smp.enter(CpuId(1), &t);
        let (hits, f) = counter();
        let co = Callout::new();

        co.reset_on(&cpu0, CpuId(1), 2, f);
        assert!(co.stop());
        tick(&cpu1, 5);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_drop_disarms() {
        let smp = new_smp(1);
        let cpu = smp.enter(CpuId(0), &thread("timer"));
        let (hits, f) = counter();
        {
            let co = Callout::new();
            co.reset(&cpu, 2, f);
        }
        tick(&cpu, 5);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cancel_sync_waits_for_remote_callback() {
        let smp = new_smp(2);
        let _clock = spawn_clock(&smp);
        let _loop1 = spawn_cpu_loop(&smp, CpuId(1));
        let cpu0 = smp.enter(CpuId(0), &thread("canceller"));
        let started = Arc::new(AtomicBool::new(false));
        let done = Arc::new(AtomicBool::new(false));
        let co = Callout::new();

        let (s, d) = (started.clone(), done.clone());
        co.reset_on(&cpu0, CpuId(1), 1, move |_| {
            s.store(true, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(50));
            d.store(true, Ordering::SeqCst);
        });

        assert!(spin_until(Duration::from_secs(5), || started.load(Ordering::SeqCst)));
        co.cancel_sync(&cpu0);
        assert!(done.load(Ordering::SeqCst));
        assert!(!co.is_active());

        co.terminate(&cpu0);
        assert!(spin_until(Duration::from_secs(5), || {
            cpu0.poll();
            smp.counters().callouts_reclaimed == 1
        }));
    }

    #[test]
    fn test_terminate_on_owner_retires_locally() {
        let smp = new_smp(1);
        let cpu = smp.enter(CpuId(0), &thread("timer"));
        let (_hits, f) = counter();
        let co = Callout::new();
        co.reset(&cpu, 5, f);
        co.terminate(&cpu);
        assert_eq!(cpu.pending_reclaim(), 1);
        cpu.poll();
        assert_eq!(cpu.pending_reclaim(), 0);
        assert_eq!(smp.counters().callouts_reclaimed, 1);
    }

    #[test]
    #[should_panic(expected = "callout queued on cpu1 found on cpu0 wheel")]
    fn test_entry_on_foreign_wheel_is_fatal() {
        let smp = new_smp(2);
        let cpu0 = smp.enter(CpuId(0), &thread("corrupt"));
        let (_hits, f) = counter();
        let co = Callout::new();

        co.reset_on(&cpu0, CpuId(1), 1, f);
        let backend = co.backend().clone();
        let generation = backend.state.lock().generation;
        cpu0.wheel_insert(WheelEntry {
            expire: 1,
            generation,
            backend,
        });
        tick(&cpu0, 1);
    }
}
