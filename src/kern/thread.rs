//! Thread Management
//!
//! A thread here is only what the wait primitive needs to know about an
//! execution context: an identity, where it is sleeping, how its last wait
//! ended and whether someone asked it to stop waiting.

use alloc::string::String;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;

use crate::kern::processor::Smp;
use crate::kern::sched_prim::WaitResult;
use crate::types::{CpuId, Domain, ThreadId, WaitToken};

/// Where a prepared thread sits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SleepChannel {
    /// Core whose sleep queue holds the entry
    pub cpu: CpuId,
    /// Token the thread waits on
    pub token: WaitToken,
    /// Domain the thread waits in
    pub domain: Domain,
}

/// Wait bookkeeping, changed only by the core named in `channel`
#[derive(Debug, Default)]
pub(crate) struct SleepState {
    /// Current sleep queue entry, if any
    pub channel: Option<SleepChannel>,
    /// Outcome recorded when the entry was removed, with the entry it ended
    pub result: Option<(SleepChannel, WaitResult)>,
}

/// Execution context known to the wait primitive
#[derive(Debug)]
pub struct Thread {
    /// Thread ID
    id: ThreadId,
    /// Name for diagnostics
    name: String,
    /// Sleep queue linkage
    pub(crate) sleep: Mutex<SleepState>,
    /// Interrupt requested
    interrupt: AtomicBool,
}

impl Thread {
    /// Create a new thread
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            id: ThreadId::new(),
            name: String::from(name),
            sleep: Mutex::new(SleepState::default()),
            interrupt: AtomicBool::new(false),
        })
    }

    /// Thread ID
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Thread name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Is the thread on a sleep queue?
    pub fn is_sleeping(&self) -> bool {
        self.sleep.lock().channel.is_some()
    }

    /// Core whose sleep queue holds the thread, if any
    pub fn sleep_cpu(&self) -> Option<CpuId> {
        self.sleep.lock().channel.map(|c| c.cpu)
    }

    /// Ask the thread to abandon an interruptible wait.
    ///
    /// The flag stays set until an interruptible wait consumes it or
    /// `clear_interrupt` is called.
    pub fn interrupt(&self, smp: &Smp) {
        self.interrupt.store(true, Ordering::SeqCst);
        if let Some(cpu) = self.sleep_cpu() {
            smp.notify(cpu);
        }
    }

    /// Is an interrupt pending?
    pub fn interrupt_pending(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    /// Drop a pending interrupt
    pub fn clear_interrupt(&self) -> bool {
        self.interrupt.swap(false, Ordering::SeqCst)
    }
}
