//! Messages
//!
//! A message carries a payload to a port and comes back to its originator
//! through a reply. The flags track where it is:
//!
//! - `QUEUED`: linked on a port queue (its target, or its reply port after
//!   the reply);
//! - `REPLIED`: the reply status is final;
//! - `DONE`: the originator owns the message again.
//!
//! A message is never `DONE` while linked on a queue.

use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use bitflags::bitflags;
use spin::{Mutex, MutexGuard};

use super::port::MsgPort;
use super::{IpcError, IpcResult, MSG_DOMAIN};
use crate::kern::processor::Cpu;
use crate::kern::sched_prim::{WakeCount, WakeScope};
use crate::types::{CpuId, MsgId, WaitToken};

bitflags! {
    /// Message state and options
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MsgFlags: u32 {
        /// Completed; the originator owns the message
        const DONE = 1 << 0;
        /// Linked on a port queue
        const QUEUED = 1 << 1;
        /// Reply status is final
        const REPLIED = 1 << 2;
        /// The originator waits for the reply; it is never queued
        const SYNC = 1 << 3;
        /// Dequeued ahead of normal messages
        const PRIORITY = 1 << 4;
        /// `abort` is allowed
        const ABORTABLE = 1 << 5;
        /// `abort` was called
        const ABORT_REQUESTED = 1 << 6;
    }
}

impl MsgFlags {
    /// State dropped when a message is sent again
    const TRANSIENT: MsgFlags = MsgFlags::DONE
        .union(MsgFlags::REPLIED)
        .union(MsgFlags::ABORT_REQUESTED);
}

/// Completion status carried by a reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgStatus {
    Success,
    Failed(i32),
    Aborted,
}

/// Hook run by `abort` when the message is no longer queued at its target
pub type MsgAbortFn<P> = fn(&Cpu<'_>, &Arc<Msg<P>>);

const NO_WAITER: usize = usize::MAX;

/// A message and its routing state
pub struct Msg<P> {
    id: MsgId,
    flags: AtomicU32,
    /// Set by the first reply; later replies are ignored
    status: Mutex<Option<MsgStatus>>,
    target: Mutex<Option<Arc<MsgPort<P>>>>,
    reply_port: Option<Arc<MsgPort<P>>>,
    abort_fn: Option<MsgAbortFn<P>>,
    /// Core of a thread blocked in `wait_for`
    waiter: AtomicUsize,
    payload: Mutex<P>,
}

impl<P> Msg<P> {
    /// Create a normal-priority message with no reply port
    pub fn new(payload: P) -> Self {
        Self {
            id: MsgId::new(),
            flags: AtomicU32::new(0),
            status: Mutex::new(None),
            target: Mutex::new(None),
            reply_port: None,
            abort_fn: None,
            waiter: AtomicUsize::new(NO_WAITER),
            payload: Mutex::new(payload),
        }
    }

    /// Deliver replies to `port`
    pub fn with_reply_port(mut self, port: Arc<MsgPort<P>>) -> Self {
        self.reply_port = Some(port);
        self
    }

    /// Queue ahead of normal messages
    pub fn with_priority(self) -> Self {
        self.flags.fetch_or(MsgFlags::PRIORITY.bits(), Ordering::Relaxed);
        self
    }

    /// Allow `abort`, running `hook` when the target has already taken the
    /// message
    pub fn with_abort(mut self, hook: MsgAbortFn<P>) -> Self {
        self.flags.fetch_or(MsgFlags::ABORTABLE.bits(), Ordering::Relaxed);
        self.abort_fn = Some(hook);
        self
    }

    pub fn id(&self) -> MsgId {
        self.id
    }

    pub fn flags(&self) -> MsgFlags {
        MsgFlags::from_bits_truncate(self.flags.load(Ordering::SeqCst))
    }

    pub fn is_done(&self) -> bool {
        self.flags().contains(MsgFlags::DONE)
    }

    /// Reply status, once replied
    pub fn status(&self) -> Option<MsgStatus> {
        *self.status.lock()
    }

    pub fn payload(&self) -> MutexGuard<'_, P> {
        self.payload.lock()
    }

    pub fn reply_port(&self) -> Option<&Arc<MsgPort<P>>> {
        self.reply_port.as_ref()
    }

    /// Port the message was last sent to
    pub fn target(&self) -> Option<Arc<MsgPort<P>>> {
        self.target.lock().clone()
    }

    /// Set `flags`, returning the previous value
    pub(crate) fn set_flags(&self, flags: MsgFlags) -> MsgFlags {
        MsgFlags::from_bits_truncate(self.flags.fetch_or(flags.bits(), Ordering::SeqCst))
    }

    /// Clear `flags`, returning the previous value
    pub(crate) fn clear_flags(&self, flags: MsgFlags) -> MsgFlags {
        MsgFlags::from_bits_truncate(self.flags.fetch_and(!flags.bits(), Ordering::SeqCst))
    }

    pub(crate) fn token(&self) -> WaitToken {
        WaitToken::from_ref(self)
    }

    /// Can the originator send the message?
    ///
    /// Only a message never sent or already `DONE` can go out. Anything
    /// else is still with a port, its handler or a reply in transit.
    pub(crate) fn check_sendable(&self) -> IpcResult<()> {
        let flags = self.flags();
        if flags.contains(MsgFlags::QUEUED) {
            return Err(IpcError::AlreadyQueued);
        }
        if !flags.contains(MsgFlags::DONE) && self.target.lock().is_some() {
            return Err(IpcError::InvalidState);
        }
        Ok(())
    }

    /// Reset per-trip state before a send to `port`
    pub(crate) fn prepare_send(&self, port: &Arc<MsgPort<P>>) -> IpcResult<()> {
        self.check_sendable()?;
        self.retarget(port);
        Ok(())
    }

    /// Point the message at `port` for a new trip or a forward
    pub(crate) fn retarget(&self, port: &Arc<MsgPort<P>>) {
        self.clear_flags(MsgFlags::TRANSIENT);
        *self.status.lock() = None;
        *self.target.lock() = Some(port.clone());
    }

    /// Signal a thread blocked in `wait_for`, on whichever core it sleeps
    pub(crate) fn wake_waiter(&self, cpu: &Cpu<'_>) {
        let waiter = self.waiter.load(Ordering::SeqCst);
        if waiter == NO_WAITER {
            return;
        }
        let token = self.token();
        let waiter = CpuId(waiter);
        if waiter == cpu.id() {
            cpu.signal(token, MSG_DOMAIN, WakeCount::All, WakeScope::LocalCpu);
        } else {
            cpu.xcall_with(waiter, move |c| {
                c.signal(token, MSG_DOMAIN, WakeCount::All, WakeScope::LocalCpu);
            });
        }
    }
}

impl<P: Send + 'static> Msg<P> {
    /// Complete the message with `status`.
    ///
    /// A synchronous message only wakes its originator. Otherwise the
    /// message is queued on its reply port, or completed in place when it
    /// has none. Replying twice is a caller bug; the second reply is logged
    /// and dropped.
    pub fn reply(self: &Arc<Self>, cpu: &Cpu<'_>, status: MsgStatus) {
        {
            let mut slot = self.status.lock();
            if let Some(prev) = *slot {
                log::warn!(
                    "msg {:?}: reply {:?} ignored, already replied {:?}",
                    self.id,
                    status,
                    prev
                );
                return;
            }
            *slot = Some(status);
        }
        cpu.smp().counter_set().msgs_replied.inc();

        if self.flags().contains(MsgFlags::SYNC) {
            self.set_flags(MsgFlags::REPLIED);
            self.wake_waiter(cpu);
            return;
        }
        match &self.reply_port {
            Some(port) => port.put_reply(cpu, self.clone()),
            None => {
                self.set_flags(MsgFlags::REPLIED | MsgFlags::DONE);
                self.wake_waiter(cpu);
            }
        }
    }

    /// Block until the message is replied, then take it back.
    ///
    /// A reply still linked on the reply port is unlinked first.
    pub fn wait_for(self: &Arc<Self>, cpu: &mut Cpu<'_>) -> MsgStatus {
        let token = self.token();
        while !self.flags().contains(MsgFlags::REPLIED) {
            cpu.prepare(token, MSG_DOMAIN);
            self.waiter.store(cpu.id().index(), Ordering::SeqCst);
            if self.flags().contains(MsgFlags::REPLIED) {
                cpu.unsleep();
                break;
            }
            cpu.wait(token, MSG_DOMAIN, None, false);
        }
        self.waiter.store(NO_WAITER, Ordering::SeqCst);

        if self.flags().contains(MsgFlags::QUEUED) {
            if let Some(port) = &self.reply_port {
                port.unlink_sync(cpu, self);
            }
        }
        self.set_flags(MsgFlags::DONE);
        self.status().unwrap_or(MsgStatus::Success)
    }

    /// Ask for the message to be cut short.
    ///
    /// Only an `ABORTABLE`, sent, unreplied message is affected, and only
    /// the first call does anything. A message still queued at its target
    /// is unlinked and replied `Aborted`; otherwise the abort hook runs on
    /// the core that owns the target's queue. Returns true if this call
    /// started the abort.
    pub fn abort(self: &Arc<Self>, cpu: &Cpu<'_>) -> bool {
        let flags = self.flags();
        if !flags.contains(MsgFlags::ABORTABLE) || flags.contains(MsgFlags::REPLIED) {
            return false;
        }
        let Some(port) = self.target() else {
            return false;
        };
        if self
            .set_flags(MsgFlags::ABORT_REQUESTED)
            .contains(MsgFlags::ABORT_REQUESTED)
        {
            return false;
        }
        log::debug!("msg {:?}: abort requested on {}", self.id, cpu.id());
        port.abort_msg(cpu, self.clone());
        true
    }

    pub(crate) fn run_abort_hook(self: &Arc<Self>, cpu: &Cpu<'_>) {
        // A reply may still be on its way to the reply port
        if self.status().is_some() {
            return;
        }
        if let Some(hook) = self.abort_fn {
            hook(cpu, self);
        }
    }
}

impl<P> fmt::Debug for Msg<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Msg")
            .field("id", &self.id)
            .field("flags", &self.flags())
            .field("status", &self.status())
            .finish()
    }
}
