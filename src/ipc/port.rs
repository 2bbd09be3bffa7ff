//! Ports - message queues with a choice of protection
//!
//! Every port holds a priority queue and a normal queue; `get_port` drains
//! the priority queue first. How the queues are protected is fixed at
//! creation by `PortKind`:
//!
//! - `CpuExclusive(cpu)`: only `cpu` touches the queues. Sends, replies and
//!   aborts issued elsewhere are shipped to it as xcalls, and a dequeue from
//!   any other core is fatal.
//! - `Spin`: a spinlock; any core may use the port directly.
//! - `Serialized(domain)`: callers hold the `SerialDomain`; use without it
//!   is fatal.
//!
//! A receiver about to block raises `waiting`. Enqueuers signal only when
//! they clear it, so a busy port costs no wakeups.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;

use super::msg::{Msg, MsgFlags, MsgStatus};
use super::{IpcError, IpcResult, PORT_DOMAIN};
use crate::fatal;
use crate::kern::lock::{CpuOwned, SerialDomain};
use crate::kern::processor::Cpu;
use crate::kern::sched_prim::{WaitResult, WakeCount, WakeScope};
use crate::types::{CpuId, PortId, WaitToken};

/// Queue protection strategy
#[derive(Debug, Clone)]
pub enum PortKind {
    /// Owned by one core
    CpuExclusive(CpuId),
    /// Spinlock, usable from any core
    Spin,
    /// Protected by an external serializer the caller holds
    Serialized(Arc<SerialDomain>),
}

/// Outcome of handing a message to a port's handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Link the message on the port queue
    Queue,
    /// The handler kept the message and will reply later
    Pending,
    /// Handled already; reply with this status
    Completed(MsgStatus),
}

/// Receives every message put to a port.
///
/// Runs on the core that performs the put: the owner for an exclusive port,
/// the sender otherwise. It must not block.
pub trait PortHandler<P>: Send + Sync {
    fn put(&self, cpu: &Cpu<'_>, port: &Arc<MsgPort<P>>, msg: &Arc<Msg<P>>) -> Dispatch;
}

struct PortQueue<P> {
    priority: VecDeque<Arc<Msg<P>>>,
    normal: VecDeque<Arc<Msg<P>>>,
}

impl<P> PortQueue<P> {
    const fn new() -> Self {
        Self {
            priority: VecDeque::new(),
            normal: VecDeque::new(),
        }
    }

    fn push(&mut self, msg: Arc<Msg<P>>) {
        if msg.flags().contains(MsgFlags::PRIORITY) {
            self.priority.push_back(msg);
        } else {
            self.normal.push_back(msg);
        }
    }

    fn pop(&mut self) -> Option<Arc<Msg<P>>> {
        self.priority.pop_front().or_else(|| self.normal.pop_front())
    }

    fn remove(&mut self, msg: &Arc<Msg<P>>) -> bool {
        for queue in [&mut self.priority, &mut self.normal] {
            if let Some(pos) = queue.iter().position(|m| Arc::ptr_eq(m, msg)) {
                queue.remove(pos);
                return true;
            }
        }
        false
    }

    fn len(&self) -> usize {
        self.priority.len() + self.normal.len()
    }
}

enum QueueCell<P> {
    Owned(CpuOwned<PortQueue<P>>),
    // Also used by serialized ports, where the domain keeps it uncontended
    Locked(Mutex<PortQueue<P>>),
}

/// A message port
pub struct MsgPort<P> {
    id: PortId,
    kind: PortKind,
    queue: QueueCell<P>,
    /// A receiver is about to block on this port
    waiting: AtomicBool,
    handler: Option<Arc<dyn PortHandler<P>>>,
}

impl<P: Send + 'static> MsgPort<P> {
    /// Create a port that queues everything it is sent
    pub fn new(kind: PortKind) -> Arc<Self> {
        Self::build(kind, None)
    }

    /// Create a port whose puts go through `handler`
    pub fn with_handler(kind: PortKind, handler: Arc<dyn PortHandler<P>>) -> Arc<Self> {
        Self::build(kind, Some(handler))
    }

    fn build(kind: PortKind, handler: Option<Arc<dyn PortHandler<P>>>) -> Arc<Self> {
        let queue = match &kind {
            PortKind::CpuExclusive(owner) => {
                QueueCell::Owned(CpuOwned::new(*owner, PortQueue::new()))
            }
            PortKind::Spin | PortKind::Serialized(_) => {
                QueueCell::Locked(Mutex::new(PortQueue::new()))
            }
        };
        Arc::new(Self {
            id: PortId::new(),
            kind,
            queue,
            waiting: AtomicBool::new(false),
            handler,
        })
    }

    pub fn id(&self) -> PortId {
        self.id
    }

    pub fn kind(&self) -> &PortKind {
        &self.kind
    }

    /// Messages currently queued
    pub fn pending(&self, cpu: &Cpu<'_>) -> usize {
        self.with_queue(cpu, |q| q.len())
    }

    fn token(&self) -> WaitToken {
        WaitToken::from_ref(self)
    }

    /// Owner of an exclusive port, when it is not `cpu`
    fn foreign_owner(&self, cpu: &Cpu<'_>) -> Option<CpuId> {
        match self.kind {
            PortKind::CpuExclusive(owner) if owner != cpu.id() => Some(owner),
            _ => None,
        }
    }

    fn with_queue<R>(&self, cpu: &Cpu<'_>, f: impl FnOnce(&mut PortQueue<P>) -> R) -> R {
        if let PortKind::Serialized(domain) = &self.kind {
            if !domain.is_held_by(cpu) {
                fatal!(
                    "port {:?} used from {} without holding {}",
                    self.id,
                    cpu.id(),
                    domain.name()
                );
            }
        }
        match &self.queue {
            QueueCell::Owned(queue) => queue.with(cpu, f),
            QueueCell::Locked(queue) => f(&mut *queue.lock()),
        }
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Send `msg` to this port without waiting for the reply.
    ///
    /// The message must be new or `DONE`; one still out with a port is
    /// refused.
    pub fn send(self: &Arc<Self>, cpu: &Cpu<'_>, msg: &Arc<Msg<P>>) -> IpcResult<()> {
        msg.prepare_send(self)?;
        cpu.smp().counter_set().msgs_sent.inc();
        self.put(cpu, msg.clone());
        Ok(())
    }

    /// Send `msg` synchronously and wait for its reply
    pub fn do_msg(
        self: &Arc<Self>,
        cpu: &mut Cpu<'_>,
        msg: &Arc<Msg<P>>,
    ) -> IpcResult<MsgStatus> {
        msg.check_sendable()?;
        msg.set_flags(MsgFlags::SYNC);
        if let Err(e) = self.send(cpu, msg) {
            msg.clear_flags(MsgFlags::SYNC);
            return Err(e);
        }
        let status = msg.wait_for(cpu);
        msg.clear_flags(MsgFlags::SYNC);
        Ok(status)
    }

    /// Pass a received message on to this port, keeping its reply port
    pub fn forward(self: &Arc<Self>, cpu: &Cpu<'_>, msg: &Arc<Msg<P>>) -> IpcResult<()> {
        if msg
            .flags()
            .intersects(MsgFlags::REPLIED | MsgFlags::DONE | MsgFlags::QUEUED)
        {
            return Err(IpcError::InvalidState);
        }
        msg.retarget(self);
        cpu.smp().counter_set().msgs_sent.inc();
        self.put(cpu, msg.clone());
        Ok(())
    }

    fn put(self: &Arc<Self>, cpu: &Cpu<'_>, msg: Arc<Msg<P>>) {
        match self.foreign_owner(cpu) {
            Some(owner) => {
                let port = self.clone();
                cpu.xcall_with(owner, move |c| port.put_local(c, msg));
            }
            None => self.put_local(cpu, msg),
        }
    }

    fn put_local(self: &Arc<Self>, cpu: &Cpu<'_>, msg: Arc<Msg<P>>) {
        let dispatch = match &self.handler {
            Some(handler) => handler.put(cpu, self, &msg),
            None => Dispatch::Queue,
        };
        match dispatch {
            Dispatch::Queue => {
                self.with_queue(cpu, |q| {
                    msg.set_flags(MsgFlags::QUEUED);
                    q.push(msg);
                });
                self.wake_receiver(cpu);
            }
            Dispatch::Pending => {}
            Dispatch::Completed(status) => msg.reply(cpu, status),
        }
    }

    /// Queue a reply on this (reply) port
    pub(crate) fn put_reply(self: &Arc<Self>, cpu: &Cpu<'_>, msg: Arc<Msg<P>>) {
        match self.foreign_owner(cpu) {
            Some(owner) => {
                let port = self.clone();
                cpu.xcall_with(owner, move |c| port.put_reply_local(c, msg));
            }
            None => self.put_reply_local(cpu, msg),
        }
    }

    fn put_reply_local(&self, cpu: &Cpu<'_>, msg: Arc<Msg<P>>) {
        let waiter = msg.clone();
        self.with_queue(cpu, |q| {
            // Both bits go up together so a racing dequeue sees a reply
            msg.set_flags(MsgFlags::QUEUED | MsgFlags::REPLIED);
            q.push(msg);
        });
        self.wake_receiver(cpu);
        waiter.wake_waiter(cpu);
    }

    fn wake_receiver(&self, cpu: &Cpu<'_>) {
        if self.waiting.swap(false, Ordering::SeqCst) {
            let scope = match self.kind {
                PortKind::CpuExclusive(_) => WakeScope::LocalCpu,
                _ => WakeScope::AllCpus,
            };
            cpu.signal(self.token(), PORT_DOMAIN, WakeCount::All, scope);
        } else {
            cpu.smp().counter_set().port_wakeups_avoided.inc();
        }
    }

    // ------------------------------------------------------------------
    // Receiving
    // ------------------------------------------------------------------

    /// Dequeue the next message, priority queue first
    pub fn get_port(&self, cpu: &Cpu<'_>) -> Option<Arc<Msg<P>>> {
        self.with_queue(cpu, |q| {
            let msg = q.pop()?;
            let prev = msg.clear_flags(MsgFlags::QUEUED);
            if prev.contains(MsgFlags::REPLIED) {
                msg.set_flags(MsgFlags::DONE);
            }
            Some(msg)
        })
    }

    /// Dequeue the next message, sleeping until one arrives.
    ///
    /// `timeout` is in ticks. The wait is interruptible. On a serialized
    /// port the caller's domain is given up while asleep and held again
    /// when this returns.
    pub fn wait_port(&self, cpu: &mut Cpu<'_>, timeout: Option<u64>) -> IpcResult<Arc<Msg<P>>> {
        let token = self.token();
        let serializer = match &self.kind {
            PortKind::Serialized(domain) => Some(&**domain),
            _ => None,
        };
        let deadline = timeout.map(|ticks| cpu.ticks().saturating_add(ticks));
        loop {
            if let Some(msg) = self.get_port(cpu) {
                return Ok(msg);
            }
            let remaining = match deadline {
                Some(deadline) => {
                    let now = cpu.ticks();
                    if now >= deadline {
                        return Err(IpcError::TimedOut);
                    }
                    Some(deadline - now)
                }
                None => None,
            };

            cpu.prepare(token, PORT_DOMAIN);
            self.waiting.store(true, Ordering::SeqCst);
            if self.pending(cpu) > 0 {
                cpu.unsleep();
                continue;
            }
            // Prepared before the domain goes, so a send in between wakes us
            if let Some(domain) = serializer {
                domain.suspend(cpu);
            }
            let result = cpu.wait(token, PORT_DOMAIN, remaining, true);
            if let Some(domain) = serializer {
                domain.resume(cpu);
            }
            match result {
                WaitResult::Woken => {}
                WaitResult::TimedOut => return Err(IpcError::TimedOut),
                WaitResult::Interrupted => return Err(IpcError::Interrupted),
            }
        }
    }

    // ------------------------------------------------------------------
    // Unlinking
    // ------------------------------------------------------------------

    fn unlink(&self, cpu: &Cpu<'_>, msg: &Arc<Msg<P>>) -> bool {
        self.with_queue(cpu, |q| {
            let found = q.remove(msg);
            if found {
                msg.clear_flags(MsgFlags::QUEUED);
            }
            found
        })
    }

    /// Unlink `msg` if it is still queued here; returns once that is settled
    pub(crate) fn unlink_sync(self: &Arc<Self>, cpu: &Cpu<'_>, msg: &Arc<Msg<P>>) {
        match &self.kind {
            PortKind::CpuExclusive(owner) if *owner != cpu.id() => {
                let port = self.clone();
                let msg = msg.clone();
                let seq = cpu.xcall_with(*owner, move |c| {
                    port.unlink(c, &msg);
                });
                cpu.xcall_wait(*owner, seq);
            }
            PortKind::Serialized(domain) if !domain.is_held_by(cpu) => {
                let _guard = domain.enter(cpu);
                self.unlink(cpu, msg);
            }
            _ => {
                self.unlink(cpu, msg);
            }
        }
    }

    /// Abort a message sent to this port
    pub(crate) fn abort_msg(self: &Arc<Self>, cpu: &Cpu<'_>, msg: Arc<Msg<P>>) {
        match self.foreign_owner(cpu) {
            Some(owner) => {
                let port = self.clone();
                cpu.xcall_with(owner, move |c| port.abort_local(c, &msg));
            }
            None => self.abort_local(cpu, &msg),
        }
    }

    fn abort_local(&self, cpu: &Cpu<'_>, msg: &Arc<Msg<P>>) {
        if self.unlink(cpu, msg) {
            msg.reply(cpu, MsgStatus::Aborted);
        } else {
            msg.run_abort_hook(cpu);
        }
    }
}

impl<P> fmt::Debug for MsgPort<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MsgPort")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("waiting", &self.waiting.load(Ordering::Relaxed))
            .finish()
    }
}
