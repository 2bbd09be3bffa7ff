//! SMP Diagnostic Counters
//!
//! Read-only counters for external monitoring tooling. Nothing in the crate
//! makes decisions based on them.
//!
//! ## Counter Categories
//!
//! - **Xcall**: Messages sent, ring-full stalls, notifications avoided
//! - **Cpusync**: Rendezvous completed
//! - **Callout**: Firings, reclaimed backends
//! - **Sleep**: Sleeps, wakeups, timeouts, interrupts
//! - **Port**: Messages sent and replied, port wakeups avoided
//! - **System**: Clock ticks

use core::sync::atomic::{AtomicU64, Ordering};

// ============================================================================
// Counter Type
// ============================================================================

/// One named event count, bumped with relaxed atomics from any core
#[derive(Debug)]
pub struct SmpCounter {
    value: AtomicU64,
    name: &'static str,
}

impl SmpCounter {
    pub const fn new(name: &'static str) -> Self {
        Self {
            value: AtomicU64::new(0),
            name,
        }
    }

    /// Count one event
    #[inline]
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Count `n` events at once
    #[inline]
    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Events counted so far; may lag concurrent updates
    #[inline]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn reset(&self) {
        self.value.store(0, Ordering::Relaxed);
    }

    /// Label used in snapshots and logs
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Track a high-water mark instead of a count
    pub fn update_max(&self, current: u64) {
        self.value.fetch_max(current, Ordering::Relaxed);
    }
}

// ============================================================================
// Counter Set
// ============================================================================

/// All counters of one `Smp` instance
#[derive(Debug)]
pub struct SmpCounters {
    /// Xcalls enqueued toward another core
    pub xcalls_sent: SmpCounter,
    /// Xcalls executed on the caller because the target was local
    pub xcalls_local: SmpCounter,
    /// Xcalls queued without a notification (passive)
    pub xcalls_passive: SmpCounter,
    /// Producer found its ring above the high-water mark
    pub xcall_fifo_full: SmpCounter,
    /// Notification skipped because the target already had one pending
    pub xcall_notify_avoided: SmpCounter,
    /// Deepest nested drain observed
    pub xcall_max_depth: SmpCounter,
    /// Rendezvous completed
    pub cpusyncs: SmpCounter,
    /// Callout callbacks executed
    pub callouts_fired: SmpCounter,
    /// Callout backends freed after their grace period
    pub callouts_reclaimed: SmpCounter,
    /// Threads placed on a sleep queue
    pub sleeps: SmpCounter,
    /// Threads removed from a sleep queue by a signal
    pub wakeups: SmpCounter,
    /// Waits ended by their timeout
    pub timeouts: SmpCounter,
    /// Waits ended by an interrupt
    pub interrupts: SmpCounter,
    /// Messages handed to a port
    pub msgs_sent: SmpCounter,
    /// Messages replied
    pub msgs_replied: SmpCounter,
    /// Port puts that found nobody waiting
    pub port_wakeups_avoided: SmpCounter,
    /// Clock ticks across all cores
    pub clock_ticks: SmpCounter,
}

impl SmpCounters {
    /// Create a zeroed counter set
    pub const fn new() -> Self {
        Self {
            xcalls_sent: SmpCounter::new("xcalls_sent"),
            xcalls_local: SmpCounter::new("xcalls_local"),
            xcalls_passive: SmpCounter::new("xcalls_passive"),
            xcall_fifo_full: SmpCounter::new("xcall_fifo_full"),
            xcall_notify_avoided: SmpCounter::new("xcall_notify_avoided"),
            xcall_max_depth: SmpCounter::new("xcall_max_depth"),
            cpusyncs: SmpCounter::new("cpusyncs"),
            callouts_fired: SmpCounter::new("callouts_fired"),
            callouts_reclaimed: SmpCounter::new("callouts_reclaimed"),
            sleeps: SmpCounter::new("sleeps"),
            wakeups: SmpCounter::new("wakeups"),
            timeouts: SmpCounter::new("timeouts"),
            interrupts: SmpCounter::new("interrupts"),
            msgs_sent: SmpCounter::new("msgs_sent"),
            msgs_replied: SmpCounter::new("msgs_replied"),
            port_wakeups_avoided: SmpCounter::new("port_wakeups_avoided"),
            clock_ticks: SmpCounter::new("clock_ticks"),
        }
    }

    /// Take a snapshot of all counters
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            xcalls_sent: self.xcalls_sent.get(),
            xcalls_local: self.xcalls_local.get(),
            xcalls_passive: self.xcalls_passive.get(),
            xcall_fifo_full: self.xcall_fifo_full.get(),
            xcall_notify_avoided: self.xcall_notify_avoided.get(),
            xcall_max_depth: self.xcall_max_depth.get(),
            cpusyncs: self.cpusyncs.get(),
            callouts_fired: self.callouts_fired.get(),
            callouts_reclaimed: self.callouts_reclaimed.get(),
            sleeps: self.sleeps.get(),
            wakeups: self.wakeups.get(),
            timeouts: self.timeouts.get(),
            interrupts: self.interrupts.get(),
            msgs_sent: self.msgs_sent.get(),
            msgs_replied: self.msgs_replied.get(),
            port_wakeups_avoided: self.port_wakeups_avoided.get(),
            clock_ticks: self.clock_ticks.get(),
        }
    }

    /// Reset all counters to zero
    pub fn reset_all(&self) {
        for counter in self.iter() {
            counter.reset();
        }
    }

    /// Every counter, for name/value dumps
    pub fn iter(&self) -> impl Iterator<Item = &SmpCounter> {
        [
            &self.xcalls_sent,
            &self.xcalls_local,
            &self.xcalls_passive,
            &self.xcall_fifo_full,
            &self.xcall_notify_avoided,
            &self.xcall_max_depth,
            &self.cpusyncs,
            &self.callouts_fired,
            &self.callouts_reclaimed,
            &self.sleeps,
            &self.wakeups,
            &self.timeouts,
            &self.interrupts,
            &self.msgs_sent,
            &self.msgs_replied,
            &self.port_wakeups_avoided,
            &self.clock_ticks,
        ]
        .into_iter()
    }
}

impl Default for SmpCounters {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of an `SmpCounters` set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    // Xcall
    pub xcalls_sent: u64,
    pub xcalls_local: u64,
    pub xcalls_passive: u64,
    pub xcall_fifo_full: u64,
    pub xcall_notify_avoided: u64,
    pub xcall_max_depth: u64,

    // Cpusync
    pub cpusyncs: u64,

    // Callout
    pub callouts_fired: u64,
    pub callouts_reclaimed: u64,

    // Sleep
    pub sleeps: u64,
    pub wakeups: u64,
    pub timeouts: u64,
    pub interrupts: u64,

    // Port
    pub msgs_sent: u64,
    pub msgs_replied: u64,
    pub port_wakeups_avoided: u64,

    // System
    pub clock_ticks: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_counts_and_resets() {
        let counter = SmpCounter::new("test");
        assert_eq!(counter.get(), 0);

        counter.inc();
        assert_eq!(counter.get(), 1);

        counter.add(5);
        assert_eq!(counter.get(), 6);

        counter.reset();
        assert_eq!(counter.get(), 0);
        assert_eq!(counter.name(), "test");
    }

    #[test]
    fn test_counter_tracks_high_water() {
        let counter = SmpCounter::new("max_test");
        counter.update_max(10);
        assert_eq!(counter.get(), 10);

        counter.update_max(5);
        assert_eq!(counter.get(), 10);

        counter.update_max(20);
        assert_eq!(counter.get(), 20);
    }

    #[test]
    fn test_snapshot_and_reset() {
        let counters = SmpCounters::new();
        counters.xcalls_sent.add(3);
        counters.cpusyncs.inc();

        let snap = counters.snapshot();
        assert_eq!(snap.xcalls_sent, 3);
        assert_eq!(snap.cpusyncs, 1);
        assert_eq!(snap.wakeups, 0);

        counters.reset_all();
        assert_eq!(counters.snapshot(), CounterSnapshot::default());
        assert_eq!(counters.iter().count(), 17);
    }
}
