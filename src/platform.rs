//! Platform Interface
//!
//! The narrow boundary between the per-core subsystems and the machine:
//! how to poke a remote core so it polls its incoming queues, and how a
//! core with nothing to do waits for such a poke.

use alloc::boxed::Box;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::types::CpuId;

/// Machine hooks supplied at initialization
pub trait Platform: Send + Sync {
    /// Deliver an inter-processor notification to `cpu`.
    ///
    /// May be called from any core and from interrupt-like contexts.
    fn notify(&self, cpu: CpuId);

    /// Halt the calling core until `notify(cpu)` or a short timeout.
    ///
    /// Spurious returns are fine; callers always re-check their condition.
    fn idle(&self, cpu: CpuId);
}

// ============================================================================
// Spin Platform (no_std)
// ============================================================================

/// Number of spin iterations before `SpinPlatform::idle` gives up
const SPIN_IDLE_ITERATIONS: usize = 1 << 12;

/// Platform that idles by spinning on a per-core pending flag.
///
/// Usable anywhere, including bare metal before interrupts are wired.
pub struct SpinPlatform {
    pending: Box<[AtomicBool]>,
}

impl SpinPlatform {
    /// Create for `ncpus` cores
    pub fn new(ncpus: usize) -> Self {
        Self {
            pending: (0..ncpus).map(|_| AtomicBool::new(false)).collect(),
        }
    }
}

impl Platform for SpinPlatform {
    fn notify(&self, cpu: CpuId) {
        if let Some(flag) = self.pending.get(cpu.index()) {
            flag.store(true, Ordering::Release);
        }
    }

    fn idle(&self, cpu: CpuId) {
        let Some(flag) = self.pending.get(cpu.index()) else {
            return;
        };
        for _ in 0..SPIN_IDLE_ITERATIONS {
            if flag.swap(false, Ordering::Acquire) {
                return;
            }
            core::hint::spin_loop();
        }
    }
}

// ============================================================================
// Hosted Platform (std)
// ============================================================================

#[cfg(any(test, feature = "std"))]
pub use hosted::HostedPlatform;

#[cfg(any(test, feature = "std"))]
mod hosted {
    use std::sync::{Condvar, Mutex, PoisonError};
    use std::time::Duration;
    use std::vec::Vec;

    use super::Platform;
    use crate::types::CpuId;

    /// Longest a hosted core sleeps without a notification
    const IDLE_TIMEOUT: Duration = Duration::from_millis(1);

    struct Doorbell {
        rung: Mutex<u64>,
        cond: Condvar,
    }

    /// Platform for running cores as host threads.
    ///
    /// Each core has a doorbell; `notify` rings it and `idle` sleeps on it
    /// for at most a millisecond.
    pub struct HostedPlatform {
        bells: Vec<Doorbell>,
    }

    impl HostedPlatform {
        /// Create for `ncpus` cores
        pub fn new(ncpus: usize) -> Self {
            Self {
                bells: (0..ncpus)
                    .map(|_| Doorbell {
                        rung: Mutex::new(0),
                        cond: Condvar::new(),
                    })
                    .collect(),
            }
        }
    }

    impl Platform for HostedPlatform {
        fn notify(&self, cpu: CpuId) {
            if let Some(bell) = self.bells.get(cpu.index()) {
                let mut rung = bell.rung.lock().unwrap_or_else(PoisonError::into_inner);
                *rung = rung.wrapping_add(1);
                bell.cond.notify_all();
            }
        }

        fn idle(&self, cpu: CpuId) {
            let Some(bell) = self.bells.get(cpu.index()) else {
                return;
            };
            let rung = bell.rung.lock().unwrap_or_else(PoisonError::into_inner);
            let seen = *rung;
            let _ = bell
                .cond
                .wait_timeout_while(rung, IDLE_TIMEOUT, |r| *r == seen)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}
