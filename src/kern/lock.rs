//! Locking Primitives
//!
//! Provides:
//! - Simple spin locks for short critical sections
//! - Core-owned cells, whose contents only the owning core may touch
//! - Serializing domains, an external lock a caller holds around access to
//!   structures that opt into it (see `PortKind::Serialized`)
//!
//! Core ownership replaces locking for almost everything in this crate.
//! The run token of a core guarantees that at most one context executes on
//! it at a time, so data only ever touched by its owner needs no lock.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::fatal;
use crate::kern::processor::Cpu;
use crate::types::{CpuId, ThreadId};

// ============================================================================
// Simple Lock (Spin Lock)
// ============================================================================

/// A simple spin lock
///
/// Used only where cores really contend: rendezvous initiators and
/// serializing domains. A core spinning on it keeps serving its incoming
/// xcalls, since the holder may be waiting on that core.
#[repr(C)]
pub struct SimpleLock {
    held: AtomicBool,
}

impl core::fmt::Debug for SimpleLock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SimpleLock")
            .field("held", &self.is_locked())
            .finish()
    }
}

impl SimpleLock {
    /// Create a new unlocked simple lock
    pub const fn new() -> Self {
        Self {
            held: AtomicBool::new(false),
        }
    }

    /// Acquire the lock from `cpu`, draining its xcalls while spinning
    pub fn lock(&self, cpu: &Cpu<'_>) {
        while !self.try_lock() {
            cpu.drain_incoming();
            core::hint::spin_loop();
        }
    }

    /// Release the lock
    pub fn unlock(&self) {
        self.held.store(false, Ordering::Release);
    }

    /// Try to acquire the lock without spinning
    pub fn try_lock(&self) -> bool {
        self.held
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Check if the lock is held
    pub fn is_locked(&self) -> bool {
        self.held.load(Ordering::Relaxed)
    }
}

impl Default for SimpleLock {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Core-Owned Data
// ============================================================================

/// Data that only its owning core may access.
///
/// Access goes through `with`, which checks the caller's core and rejects
/// re-entrant use. Either failure is an invariant violation.
pub struct CpuOwned<T> {
    owner: CpuId,
    busy: AtomicBool,
    value: UnsafeCell<T>,
}

// Safety: the value is only reached through `with`, which admits a single
// caller at a time (the `busy` flag) and only on the owning core.
unsafe impl<T: Send> Send for CpuOwned<T> {}
unsafe impl<T: Send> Sync for CpuOwned<T> {}

impl<T> CpuOwned<T> {
    /// Wrap `value` for `owner`
    pub const fn new(owner: CpuId, value: T) -> Self {
        Self {
            owner,
            busy: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    /// Owning core
    pub fn owner(&self) -> CpuId {
        self.owner
    }

    /// Run `f` with exclusive access to the value.
    ///
    /// `f` must not call back into `with` on the same cell.
    pub fn with<R>(&self, cpu: &Cpu<'_>, f: impl FnOnce(&mut T) -> R) -> R {
        if cpu.id() != self.owner {
            fatal!("{} touched data owned by {}", cpu.id(), self.owner);
        }
        if self.busy.swap(true, Ordering::Acquire) {
            fatal!("re-entrant access to data owned by {}", self.owner);
        }
        let _release = BusyRelease(&self.busy);
        // Safety: owner checked and `busy` excludes every other accessor
        f(unsafe { &mut *self.value.get() })
    }
}

struct BusyRelease<'a>(&'a AtomicBool);

impl Drop for BusyRelease<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// ============================================================================
// Serializing Domain
// ============================================================================

const NO_HOLDER: u64 = 0;

/// External serializer shared by a group of structures.
///
/// Holding the domain grants access to everything protected by it. The
/// holding thread is recorded so that protected structures can verify their
/// caller; another thread running on the same core does not hold it.
#[derive(Debug)]
pub struct SerialDomain {
    name: &'static str,
    lock: SimpleLock,
    holder: AtomicU64,
}

impl SerialDomain {
    /// Create an unheld domain
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            lock: SimpleLock::new(),
            holder: AtomicU64::new(NO_HOLDER),
        }
    }

    /// Domain name, for diagnostics
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Acquire the domain for the thread running on `cpu`.
    ///
    /// Polls the caller's incoming xcalls while spinning so a holder waiting
    /// on this core can still make progress.
    pub fn enter(&self, cpu: &Cpu<'_>) -> SerialGuard<'_> {
        self.lock.lock(cpu);
        self.hold(cpu)
    }

    /// Acquire the domain if it is free
    pub fn try_enter(&self, cpu: &Cpu<'_>) -> Option<SerialGuard<'_>> {
        if !self.lock.try_lock() {
            return None;
        }
        Some(self.hold(cpu))
    }

    fn hold(&self, cpu: &Cpu<'_>) -> SerialGuard<'_> {
        self.holder.store(cpu.curthread().id().0, Ordering::Release);
        SerialGuard {
            domain: self,
            cpu: cpu.id(),
        }
    }

    /// Give the domain up for the duration of a sleep.
    ///
    /// The caller's guard stays alive; `resume` must run before it drops.
    pub(crate) fn suspend(&self, cpu: &Cpu<'_>) {
        if !self.is_held_by(cpu) {
            fatal!("{} suspended {} without holding it", cpu.id(), self.name);
        }
        self.holder.store(NO_HOLDER, Ordering::Release);
        self.lock.unlock();
    }

    /// Take the domain back after `suspend`
    pub(crate) fn resume(&self, cpu: &Cpu<'_>) {
        self.lock.lock(cpu);
        self.holder.store(cpu.curthread().id().0, Ordering::Release);
    }

    /// Is the domain currently held by the thread running on `cpu`?
    pub fn is_held_by(&self, cpu: &Cpu<'_>) -> bool {
        self.holder.load(Ordering::Acquire) == cpu.curthread().id().0
    }

    /// Thread holding the domain, if any
    pub fn holder(&self) -> Option<ThreadId> {
        match self.holder.load(Ordering::Acquire) {
            NO_HOLDER => None,
            id => Some(ThreadId(id)),
        }
    }

    /// Is the domain held at all?
    pub fn is_held(&self) -> bool {
        self.lock.is_locked()
    }
}

/// Proof of holding a `SerialDomain`; releases on drop
#[derive(Debug)]
pub struct SerialGuard<'a> {
    domain: &'a SerialDomain,
    cpu: CpuId,
}

impl SerialGuard<'_> {
    /// Core the domain was entered from
    pub fn cpu(&self) -> CpuId {
        self.cpu
    }
}

impl Drop for SerialGuard<'_> {
    fn drop(&mut self) {
        self.domain.holder.store(NO_HOLDER, Ordering::Release);
        self.domain.lock.unlock();
    }
}
