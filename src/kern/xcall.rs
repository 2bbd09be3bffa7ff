//! Cross-Core Calls - per-link FIFO rings
//!
//! Every ordered (source, destination) pair of cores has its own ring, so
//! each ring has exactly one producer (the source core) and one consumer
//! (the destination core) and needs no lock. The write index only moves on
//! the source, the read index only on the destination. Both are free
//! running `u32` counters; fill level is their wrapping difference.
//!
//! A third counter, the completion index, advances after each call has
//! returned, which lets a producer wait for its own earlier calls.
//!
//! ## Back-pressure
//!
//! A producer that finds the ring at its high-water mark notifies the
//! destination and spins, draining its own incoming rings so that two cores
//! full toward each other still make progress. A producer already inside a
//! drain may fill the ring further (the nested mark) and stops starting new
//! drains beyond `MAX_XCALL_DEPTH`.

use alloc::boxed::Box;
use core::cell::UnsafeCell;
use core::fmt;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::fatal;
use crate::kern::processor::Cpu;
use crate::types::CpuId;

/// Deepest drain a stalled producer or waiter will start
pub const MAX_XCALL_DEPTH: u32 = 4;

// ============================================================================
// Call Records
// ============================================================================

/// Plain cross-core function: executing core plus two arguments
pub type XcallFn = fn(&Cpu<'_>, usize, usize);

/// One queued cross-core call
pub enum Xcall {
    /// Function pointer with two word-sized arguments
    Func {
        func: XcallFn,
        arg1: usize,
        arg2: usize,
    },
    /// Boxed closure
    Closure(Box<dyn FnOnce(&Cpu<'_>) + Send>),
}

impl Xcall {
    /// Call record for a plain function
    pub fn func(func: XcallFn, arg1: usize, arg2: usize) -> Self {
        Xcall::Func { func, arg1, arg2 }
    }

    /// Call record for a closure
    pub fn closure(f: impl FnOnce(&Cpu<'_>) + Send + 'static) -> Self {
        Xcall::Closure(Box::new(f))
    }

    fn invoke(self, cpu: &Cpu<'_>) {
        match self {
            Xcall::Func { func, arg1, arg2 } => func(cpu, arg1, arg2),
            Xcall::Closure(f) => f(cpu),
        }
    }
}

impl fmt::Debug for Xcall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Xcall::Func { arg1, arg2, .. } => f
                .debug_struct("Xcall::Func")
                .field("arg1", arg1)
                .field("arg2", arg2)
                .finish(),
            Xcall::Closure(_) => f.write_str("Xcall::Closure"),
        }
    }
}

/// How deep inside xcall drains a producer is running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Nesting {
    /// Ordinary context
    TopLevel,
    /// Inside this many drains
    Nested(u32),
}

impl Nesting {
    fn of(depth: u32) -> Self {
        if depth == 0 {
            Nesting::TopLevel
        } else {
            Nesting::Nested(depth)
        }
    }

    /// Drain depth
    pub fn depth(self) -> u32 {
        match self {
            Nesting::TopLevel => 0,
            Nesting::Nested(d) => d,
        }
    }
}

// ============================================================================
// Ring
// ============================================================================

/// Single-producer single-consumer ring for one (source, destination) link
pub(crate) struct XcallRing {
    /// Next slot to write; advanced by the source
    windex: AtomicU32,
    /// Next slot to read; advanced by the destination
    rindex: AtomicU32,
    /// Calls completed; advanced by the destination
    xindex: AtomicU32,
    mask: u32,
    slots: Box<[UnsafeCell<MaybeUninit<Xcall>>]>,
}

// Safety: a slot is written only by the producer while it is outside
// `rindex..windex` and read only by the consumer while inside it; the index
// stores publish the slot contents.
unsafe impl Sync for XcallRing {}

impl XcallRing {
    pub(crate) fn new(size: usize) -> Self {
        Self {
            windex: AtomicU32::new(0),
            rindex: AtomicU32::new(0),
            xindex: AtomicU32::new(0),
            mask: (size - 1) as u32,
            slots: (0..size)
                .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
                .collect(),
        }
    }

    /// Slots in use
    pub(crate) fn used(&self) -> u32 {
        self.windex
            .load(Ordering::Relaxed)
            .wrapping_sub(self.rindex.load(Ordering::Acquire))
    }

    fn capacity(&self) -> u32 {
        self.mask + 1
    }

    /// Calls completed so far
    fn completed(&self) -> u32 {
        self.xindex.load(Ordering::Acquire)
    }

    /// Append a call, returning the write sequence after the append.
    ///
    /// # Safety
    ///
    /// Only the source core of this ring may push.
    pub(crate) unsafe fn push(&self, xcall: Xcall) -> u32 {
        let w = self.windex.load(Ordering::Relaxed);
        let r = self.rindex.load(Ordering::Acquire);
        if w.wrapping_sub(r) >= self.capacity() {
            fatal!("xcall ring overrun (w={} r={})", w, r);
        }
        let slot = &self.slots[(w & self.mask) as usize];
        // Safety: slot is outside rindex..windex, so the consumer is done with it
        unsafe { (*slot.get()).write(xcall) };
        self.windex.store(w.wrapping_add(1), Ordering::SeqCst);
        w.wrapping_add(1)
    }

    /// Take the oldest call.
    ///
    /// # Safety
    ///
    /// Only the destination core of this ring may pop.
    pub(crate) unsafe fn pop(&self) -> Option<Xcall> {
        let r = self.rindex.load(Ordering::Relaxed);
        if r == self.windex.load(Ordering::SeqCst) {
            return None;
        }
        let slot = &self.slots[(r & self.mask) as usize];
        // Safety: slot is inside rindex..windex and its write is visible
        let xcall = unsafe { (*slot.get()).assume_init_read() };
        self.rindex.store(r.wrapping_add(1), Ordering::Release);
        Some(xcall)
    }

    fn complete(&self) {
        self.xindex.fetch_add(1, Ordering::Release);
    }
}

impl Drop for XcallRing {
    fn drop(&mut self) {
        let w = *self.windex.get_mut();
        let mut r = *self.rindex.get_mut();
        while r != w {
            // Safety: exclusive access, and the slot holds an unconsumed call
            unsafe { self.slots[(r & self.mask) as usize].get_mut().assume_init_drop() };
            r = r.wrapping_add(1);
        }
    }
}

/// All rings of an `Smp`, indexed by (source, destination)
pub(crate) struct XcallMatrix {
    ncpus: usize,
    rings: Box<[XcallRing]>,
}

impl XcallMatrix {
    pub(crate) fn new(ncpus: usize, size: usize) -> Self {
        Self {
            ncpus,
            rings: (0..ncpus * ncpus).map(|_| XcallRing::new(size)).collect(),
        }
    }

    pub(crate) fn ring(&self, src: CpuId, dst: CpuId) -> &XcallRing {
        &self.rings[src.index() * self.ncpus + dst.index()]
    }
}

// ============================================================================
// Producer / Consumer
// ============================================================================

impl<'a> Cpu<'a> {
    /// Current drain nesting
    pub fn nesting(&self) -> Nesting {
        Nesting::of(self.depth.get())
    }

    /// Run `func(arg1, arg2)` on `dst`
    pub fn xcall(&self, dst: CpuId, func: XcallFn, arg1: usize, arg2: usize) -> u32 {
        self.send_xcall(dst, Xcall::func(func, arg1, arg2))
    }

    /// Run a closure on `dst`
    pub fn xcall_with(&self, dst: CpuId, f: impl FnOnce(&Cpu<'_>) + Send + 'static) -> u32 {
        self.send_xcall(dst, Xcall::closure(f))
    }

    /// Queue `xcall` for `dst` and notify it.
    ///
    /// Returns the ring's write sequence, usable with `xcall_wait`. A call
    /// aimed at this core runs before returning, and the result is 0.
    pub fn send_xcall(&self, dst: CpuId, xcall: Xcall) -> u32 {
        if dst == self.id() {
            self.run_local(xcall);
            return 0;
        }
        let smp = self.smp();
        let ring = smp.xcalls.ring(self.id(), dst);
        self.wait_for_room(dst, ring);
        // Safety: this context holds the source core
        let seq = unsafe { ring.push(xcall) };
        smp.counter_set().xcalls_sent.inc();
        smp.request_poll(dst);
        seq
    }

    /// Queue `xcall` for `dst` without a notification.
    ///
    /// While the ring is below the passive mark the destination picks the
    /// call up on its next poll. Above it this behaves like `send_xcall`.
    pub fn xcall_passive(&self, dst: CpuId, xcall: Xcall) -> u32 {
        if dst == self.id() {
            self.run_local(xcall);
            return 0;
        }
        let smp = self.smp();
        let ring = smp.xcalls.ring(self.id(), dst);
        if ring.used() >= smp.config().fifo_passive_water() {
            return self.send_xcall(dst, xcall);
        }
        // Safety: this context holds the source core
        let seq = unsafe { ring.push(xcall) };
        smp.counter_set().xcalls_passive.inc();
        seq
    }

    /// Wait until `dst` has completed the call that returned `seq`
    pub fn xcall_wait(&self, dst: CpuId, seq: u32) {
        if dst == self.id() {
            return;
        }
        let smp = self.smp();
        let ring = smp.xcalls.ring(self.id(), dst);
        while (ring.completed().wrapping_sub(seq) as i32) < 0 {
            smp.request_poll(dst);
            self.drain_bounded();
            core::hint::spin_loop();
        }
    }

    /// Execute every call queued for this core, in per-link FIFO order.
    ///
    /// Returns the number of calls executed.
    pub fn drain_incoming(&self) -> usize {
        let smp = self.smp();
        self.pcpu.npoll.store(false, Ordering::SeqCst);

        let depth = self.depth.get() + 1;
        self.depth.set(depth);
        smp.counter_set().xcall_max_depth.update_max(depth as u64);

        let mut executed = 0;
        for src in 0..smp.ncpus() {
            let src = CpuId(src);
            if src == self.id() {
                continue;
            }
            let ring = smp.xcalls.ring(src, self.id());
            // Safety: this context holds the destination core
            while let Some(xcall) = unsafe { ring.pop() } {
                xcall.invoke(self);
                ring.complete();
                executed += 1;
            }
        }

        self.depth.set(depth - 1);
        executed
    }

    /// Drain unless already too deep; used by every spin-wait
    pub(crate) fn drain_bounded(&self) {
        if self.depth.get() < MAX_XCALL_DEPTH {
            self.drain_incoming();
        }
    }

    fn run_local(&self, xcall: Xcall) {
        self.smp().counter_set().xcalls_local.inc();
        self.depth.set(self.depth.get() + 1);
        xcall.invoke(self);
        self.depth.set(self.depth.get() - 1);
    }

    fn wait_for_room(&self, dst: CpuId, ring: &XcallRing) {
        let smp = self.smp();
        let nesting = self.nesting();
        let mark = match nesting {
            Nesting::TopLevel => smp.config().fifo_high_water(),
            Nesting::Nested(_) => smp.config().fifo_nested_water(),
        };
        if ring.used() < mark {
            return;
        }

        smp.counter_set().xcall_fifo_full.inc();
        log::trace!(
            "xcall {} -> {}: ring {}/{} full, {:?}",
            self.id(),
            dst,
            ring.used(),
            ring.capacity(),
            nesting
        );
        while ring.used() >= mark {
            smp.request_poll(dst);
            self.drain_bounded();
            core::hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SmpConfig;
    use crate::testutil::{new_smp, new_smp_with, spawn_cpu_loop, spin_until, thread};
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use core::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;

    static FUNC_CALLS: AtomicUsize = AtomicUsize::new(0);

    fn record_sum(_cpu: &Cpu<'_>, a: usize, b: usize) {
        FUNC_CALLS.fetch_add(a + b, Ordering::SeqCst);
    }

    fn noop(_cpu: &Cpu<'_>, _a: usize, _b: usize) {}

    #[test]
    fn test_self_xcall_runs_immediately() {
        let smp = new_smp(2);
        let cpu = smp.enter(CpuId(0), &thread("self"));
        let hit = Arc::new(AtomicUsize::new(0));
        let h = hit.clone();
        let seq = cpu.xcall_with(CpuId(0), move |c| {
            assert!(c.in_interrupt());
            h.store(c.id().index() + 1, Ordering::SeqCst);
        });
        assert_eq!(seq, 0);
        assert_eq!(hit.load(Ordering::SeqCst), 1);
        assert_eq!(smp.counters().xcalls_local, 1);
        cpu.xcall_wait(CpuId(0), seq);
    }

    #[test]
    fn test_fifo_per_link() {
        let smp = new_smp(2);
        let t = thread("both");
        let cpu0 = smp.enter(CpuId(0), &t);
        let cpu1 = smp.enter(CpuId(1), &t);
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..20 {
            let seen = seen.clone();
            let seq = cpu0.xcall_with(CpuId(1), move |c| {
                assert_eq!(c.id(), CpuId(1));
                seen.lock().unwrap().push(i);
            });
            assert_eq!(seq, i + 1);
        }

        assert_eq!(cpu1.drain_incoming(), 20);
        assert_eq!(*seen.lock().unwrap(), (0..20).collect::<Vec<u32>>());
        assert_eq!(cpu1.drain_incoming(), 0);
    }

    #[test]
    fn test_func_xcall_and_coalesced_notify() {
        let smp = new_smp(2);
        let t = thread("both");
        let cpu0 = smp.enter(CpuId(0), &t);
        let cpu1 = smp.enter(CpuId(1), &t);
        let before = FUNC_CALLS.load(Ordering::SeqCst);

        cpu0.xcall(CpuId(1), record_sum, 2, 3);
        cpu0.xcall(CpuId(1), record_sum, 10, 0);
        // The second call found a poll already requested
        assert_eq!(smp.counters().xcall_notify_avoided, 1);

        cpu1.drain_incoming();
        assert_eq!(FUNC_CALLS.load(Ordering::SeqCst) - before, 15);
        assert_eq!(smp.counters().xcalls_sent, 2);
    }

    #[test]
    fn test_passive_xcall_skips_notify() {
        let smp = new_smp(2);
        let t = thread("both");
        let cpu0 = smp.enter(CpuId(0), &t);
        let cpu1 = smp.enter(CpuId(1), &t);

        cpu0.xcall_passive(CpuId(1), Xcall::func(noop, 0, 0));
        assert!(!smp.pcpu(CpuId(1)).npoll.load(Ordering::SeqCst));
        assert_eq!(smp.counters().xcalls_passive, 1);
        assert_eq!(smp.counters().xcalls_sent, 0);

        assert_eq!(cpu1.drain_incoming(), 1);
    }

    #[test]
    fn test_passive_above_low_water_notifies() {
        let smp = new_smp_with(SmpConfig::new(2).with_xcall_fifo(8));
        let t = thread("both");
        let cpu0 = smp.enter(CpuId(0), &t);
        let cpu1 = smp.enter(CpuId(1), &t);

        // Passive mark is 2 of 8
        for _ in 0..3 {
            cpu0.xcall_passive(CpuId(1), Xcall::func(noop, 0, 0));
        }
        assert_eq!(smp.counters().xcalls_passive, 2);
        assert_eq!(smp.counters().xcalls_sent, 1);
        assert!(smp.pcpu(CpuId(1)).npoll.load(Ordering::SeqCst));
        assert_eq!(cpu1.drain_incoming(), 3);
    }

    #[test]
    fn test_xcall_wait_sees_completion() {
        let smp = new_smp(2);
        let _loop1 = spawn_cpu_loop(&smp, CpuId(1));
        let cpu0 = smp.enter(CpuId(0), &thread("waiter"));
        let done = Arc::new(AtomicUsize::new(0));

        let d = done.clone();
        let seq = cpu0.xcall_with(CpuId(1), move |_| {
            d.store(7, Ordering::SeqCst);
        });
        cpu0.xcall_wait(CpuId(1), seq);
        assert_eq!(done.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn test_thousand_xcalls_through_small_ring() {
        let smp = new_smp_with(SmpConfig::new(2).with_xcall_fifo(16));
        let seen = Arc::new(Mutex::new(Vec::with_capacity(1000)));

        let consumer = {
            let smp = smp.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                let mut cpu1 = smp.enter(CpuId(1), &thread("consumer"));
                cpu1.idle_until(|_| {
                    smp.counters().xcalls_sent == 1000
                        && smp.xcalls.ring(CpuId(0), CpuId(1)).used() == 0
                });
            })
        };

        {
            let cpu0 = smp.enter(CpuId(0), &thread("producer"));
            for i in 0..1000u32 {
                let seen = seen.clone();
                cpu0.xcall_with(CpuId(1), move |_| seen.lock().unwrap().push(i));
            }
        }
        consumer.join().unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1000);
        assert!(seen.iter().copied().eq(0..1000));
        assert!(smp.counters().xcall_fifo_full > 0);
    }

    #[test]
    fn test_mutual_flood_makes_progress() {
        let smp = new_smp_with(SmpConfig::new(2).with_xcall_fifo(16));
        let received: Arc<[AtomicUsize; 2]> =
            Arc::new([AtomicUsize::new(0), AtomicUsize::new(0)]);

        let workers: Vec<_> = (0..2)
            .map(|me| {
                let smp = smp.clone();
                let received = received.clone();
                std::thread::spawn(move || {
                    let mut cpu = smp.enter(CpuId(me), &thread("flood"));
                    let other = CpuId(1 - me);
                    for _ in 0..500 {
                        let received = received.clone();
                        cpu.xcall_with(other, move |c| {
                            received[c.id().index()].fetch_add(1, Ordering::SeqCst);
                        });
                    }
                    cpu.idle_until(|_| received[me].load(Ordering::SeqCst) == 500);
                })
            })
            .collect();

        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(received[0].load(Ordering::SeqCst), 500);
        assert_eq!(received[1].load(Ordering::SeqCst), 500);
    }

    #[test]
    fn test_nested_drain_depth_recorded() {
        let smp = new_smp(2);
        let _loop1 = spawn_cpu_loop(&smp, CpuId(1));
        let cpu0 = smp.enter(CpuId(0), &thread("nest"));
        let bounced = Arc::new(AtomicUsize::new(0));

        // cpu1 calls back into cpu0 from inside its drain
        let b = bounced.clone();
        cpu0.xcall_with(CpuId(1), move |c| {
            assert_eq!(c.nesting(), Nesting::Nested(1));
            c.xcall_with(CpuId(0), move |_| {
                b.store(1, Ordering::SeqCst);
            });
        });
        assert!(spin_until(Duration::from_secs(5), || {
            cpu0.drain_incoming();
            bounced.load(Ordering::SeqCst) == 1
        }));
        assert!(smp.counters().xcall_max_depth >= 1);
        assert_eq!(cpu0.nesting(), Nesting::TopLevel);
    }

    #[test]
    #[should_panic(expected = "xcall ring overrun")]
    fn test_ring_overrun_is_fatal() {
        let ring = XcallRing::new(8);
        for i in 0..9 {
            unsafe { ring.push(Xcall::func(noop, i, 0)) };
        }
    }

    #[test]
    fn test_ring_drop_releases_pending_closures() {
        let marker = Arc::new(());
        {
            let ring = XcallRing::new(8);
            let m = marker.clone();
            unsafe { ring.push(Xcall::closure(move |_| drop(m))) };
            assert_eq!(Arc::strong_count(&marker), 2);
        }
        assert_eq!(Arc::strong_count(&marker), 1);
    }
}
