//! Scheduling Primitives - Sleep queues and wait/signal
//!
//! Every core has a sleep queue hashed by wait token. A thread waits on its
//! current core: it is first *prepared* (placed in the bucket, still
//! running), then *waits* (gives the core up until its entry is removed).
//! Because preparing happens before the condition is re-checked, a signal
//! that lands in between removes the entry and the wait returns at once.
//!
//! Only the owning core touches a sleep queue. Signals for other cores
//! travel as xcalls, so a remote waiter is removed by its own core.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use crate::fatal;
use crate::kern::processor::Cpu;
use crate::kern::thread::{SleepChannel, Thread};
use crate::kern::timer::Callout;
use crate::types::{CpuId, Domain, WaitToken};

// ============================================================================
// Wait Results
// ============================================================================

/// How a wait ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum WaitResult {
    /// Removed by a matching signal
    Woken = 0,
    /// Interrupted while interruptible
    Interrupted = 2,
    /// Timeout expired first
    TimedOut = 3,
}

/// How many matching waiters a signal removes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeCount {
    /// The oldest match
    One,
    /// Every match
    All,
}

/// Which sleep queues a signal searches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeScope {
    /// Only the signalling core's
    LocalCpu,
    /// The signalling core's, then the others via xcall
    AllCpus,
}

// ============================================================================
// Sleep Queue
// ============================================================================

struct SleepEntry {
    thread: Arc<Thread>,
    token: WaitToken,
    domain: Domain,
}

type Bucket = Mutex<VecDeque<SleepEntry>>;

/// Per-core sleep queue
pub(crate) struct SleepQueue {
    owner: CpuId,
    buckets: Box<[Bucket]>,
}

impl SleepQueue {
    pub(crate) fn new(owner: CpuId, nbuckets: usize) -> Self {
        Self {
            owner,
            buckets: (0..nbuckets).map(|_| Mutex::new(VecDeque::new())).collect(),
        }
    }

    fn bucket(&self, cpu: &Cpu<'_>, token: WaitToken) -> &Bucket {
        if cpu.id() != self.owner {
            fatal!("sleep queue of {} touched from {}", self.owner, cpu.id());
        }
        &self.buckets[token.bucket(self.buckets.len())]
    }

    fn insert(&self, cpu: &Cpu<'_>, entry: SleepEntry) {
        self.bucket(cpu, entry.token).lock().push_back(entry);
    }

    /// Remove `thread`'s entry from the bucket of `token`
    fn remove(&self, cpu: &Cpu<'_>, token: WaitToken, thread: &Arc<Thread>) -> bool {
        let mut bucket = self.bucket(cpu, token).lock();
        match bucket.iter().position(|e| Arc::ptr_eq(&e.thread, thread)) {
            Some(pos) => {
                bucket.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Remove matching entries in FIFO order
    fn take_matching(
        &self,
        cpu: &Cpu<'_>,
        token: WaitToken,
        domain: Domain,
        count: WakeCount,
    ) -> Vec<Arc<Thread>> {
        let mut bucket = self.bucket(cpu, token).lock();
        let mut woken = Vec::new();
        let mut i = 0;
        while i < bucket.len() {
            if bucket[i].token == token && bucket[i].domain == domain {
                if let Some(entry) = bucket.remove(i) {
                    woken.push(entry.thread);
                }
                if count == WakeCount::One {
                    break;
                }
            } else {
                i += 1;
            }
        }
        woken
    }

    /// Total queued threads
    pub(crate) fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.lock().len()).sum()
    }
}

// ============================================================================
// Wait / Signal
// ============================================================================

impl<'a> Cpu<'a> {
    /// Place the current thread on this core's sleep queue without
    /// suspending. Any earlier entry of the thread is withdrawn first.
    pub fn prepare(&self, token: WaitToken, domain: Domain) {
        let thread = self.curthread().clone();
        self.withdraw(&thread);
        {
            let mut st = thread.sleep.lock();
            st.result = None;
            st.channel = Some(SleepChannel {
                cpu: self.id(),
                token,
                domain,
            });
        }
        self.pcpu.sleepq.insert(
            self,
            SleepEntry {
                thread,
                token,
                domain,
            },
        );
        self.smp().counter_set().sleeps.inc();
    }

    /// Withdraw a prepared current thread without waiting.
    ///
    /// Returns false if it was not queued (for instance already signalled).
    pub fn unsleep(&self) -> bool {
        let thread = self.curthread().clone();
        let removed = self.withdraw(&thread);
        thread.sleep.lock().result = None;
        removed
    }

    /// Suspend until signalled on (`token`, `domain`), timed out after
    /// `timeout` ticks, or (if `interruptible`) interrupted.
    ///
    /// Prepares first unless the thread is already prepared for this token.
    pub fn wait(
        &mut self,
        token: WaitToken,
        domain: Domain,
        timeout: Option<u64>,
        interruptible: bool,
    ) -> WaitResult {
        let thread = self.curthread().clone();
        let wanted = SleepChannel {
            cpu: self.id(),
            token,
            domain,
        };
        let prepared = {
            let mut st = thread.sleep.lock();
            match (st.channel, st.result) {
                (Some(ch), _) => ch == wanted,
                (None, Some((ch, _))) if ch == wanted => true,
                (None, _) => {
                    // An outcome left over from some other wait
                    st.result = None;
                    false
                }
            }
        };
        if !prepared {
            self.prepare(token, domain);
        }

        let timer = timeout.map(|ticks| {
            let callout = Callout::new();
            let sleeper = thread.clone();
            callout.reset(self, ticks, move |c| {
                if c.remove_waiter(&sleeper, WaitResult::TimedOut) {
                    c.smp().counter_set().timeouts.inc();
                    log::trace!("sleep: {} timed out on {}", sleeper.name(), c.id());
                }
            });
            callout
        });

        let result = loop {
            if let Some((_, result)) = thread.sleep.lock().result.take() {
                break result;
            }
            if interruptible
                && thread.interrupt_pending()
                && self.remove_waiter(&thread, WaitResult::Interrupted)
            {
                thread.clear_interrupt();
                self.smp().counter_set().interrupts.inc();
                continue;
            }
            self.block();
            self.poll();
        };

        if let Some(callout) = timer {
            callout.terminate(self);
        }
        result
    }

    /// `wait` in the default domain, not interruptible
    pub fn sleep(&mut self, token: WaitToken, timeout: Option<u64>) -> WaitResult {
        self.wait(token, Domain::DEFAULT, timeout, false)
    }

    /// Wake waiters on (`token`, `domain`).
    ///
    /// Returns how many were woken on this core. With `AllCpus` the other
    /// cores are searched asynchronously: `All` asks every core, `One`
    /// walks the cores in ascending order from here until one has a match.
    pub fn signal(
        &self,
        token: WaitToken,
        domain: Domain,
        count: WakeCount,
        scope: WakeScope,
    ) -> usize {
        let woken = self.signal_local(token, domain, count);
        if scope == WakeScope::LocalCpu {
            return woken;
        }
        match count {
            WakeCount::All => {
                for cpu in 0..self.smp().ncpus() {
                    let cpu = CpuId(cpu);
                    if cpu != self.id() {
                        self.xcall_with(cpu, move |c| {
                            c.signal_local(token, domain, WakeCount::All);
                        });
                    }
                }
            }
            WakeCount::One if woken == 0 => self.forward_signal_one(self.id(), token, domain),
            WakeCount::One => {}
        }
        woken
    }

    /// Wake every waiter on `token` in the default domain, on every core
    pub fn wakeup(&self, token: WaitToken) -> usize {
        self.signal(token, Domain::DEFAULT, WakeCount::All, WakeScope::AllCpus)
    }

    /// Wake the first waiter found on `token` in the default domain
    pub fn wakeup_one(&self, token: WaitToken) -> usize {
        self.signal(token, Domain::DEFAULT, WakeCount::One, WakeScope::AllCpus)
    }

    fn forward_signal_one(&self, origin: CpuId, token: WaitToken, domain: Domain) {
        let next = CpuId((self.id().index() + 1) % self.smp().ncpus());
        if next == origin {
            return;
        }
        self.xcall_with(next, move |c| {
            if c.signal_local(token, domain, WakeCount::One) == 0 {
                c.forward_signal_one(origin, token, domain);
            }
        });
    }

    fn signal_local(&self, token: WaitToken, domain: Domain, count: WakeCount) -> usize {
        let woken = self.pcpu.sleepq.take_matching(self, token, domain, count);
        for thread in &woken {
            let mut st = thread.sleep.lock();
            st.result = st.channel.take().map(|ch| (ch, WaitResult::Woken));
        }
        let n = woken.len();
        if n > 0 {
            self.smp().counter_set().wakeups.add(n as u64);
            self.smp().notify(self.id());
        }
        n
    }

    /// Remove `thread` from this core's queue, recording `result`
    pub(crate) fn remove_waiter(&self, thread: &Arc<Thread>, result: WaitResult) -> bool {
        let channel = thread.sleep.lock().channel;
        let Some(ch) = channel.filter(|ch| ch.cpu == self.id()) else {
            return false;
        };
        if !self.pcpu.sleepq.remove(self, ch.token, thread) {
            return false;
        }
        {
            let mut st = thread.sleep.lock();
            st.channel = None;
            st.result = Some((ch, result));
        }
        self.smp().notify(self.id());
        true
    }

    fn withdraw(&self, thread: &Arc<Thread>) -> bool {
        let channel = thread.sleep.lock().channel;
        let Some(ch) = channel else {
            return false;
        };
        if ch.cpu != self.id() {
            fatal!(
                "thread {} queued on {} withdrawn from {}",
                thread.name(),
                ch.cpu,
                self.id()
            );
        }
        let removed = self.pcpu.sleepq.remove(self, ch.token, thread);
        thread.sleep.lock().channel = None;
        removed
    }

    /// Threads queued on this core
    pub fn sleepers(&self) -> usize {
        self.pcpu.sleepq.len()
    }
}

// ============================================================================
// Wait Queue
// ============================================================================

/// Wait domain of threads blocked on a `WaitQueue`
pub const WAITQ_DOMAIN: Domain = Domain(0x7761_6974);

/// Generation-counted wait queue.
///
/// A waiter samples `generation()` before checking its condition and hands
/// the sample to `block`. Every `signal` bumps the generation, so a signal
/// that lands between the check and the block makes `block` return at once
/// instead of sleeping through it.
#[derive(Debug, Default)]
pub struct WaitQueue {
    gen: AtomicU64,
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            gen: AtomicU64::new(0),
        }
    }

    /// Current generation
    pub fn generation(&self) -> u64 {
        self.gen.load(Ordering::SeqCst)
    }

    fn token(&self) -> WaitToken {
        WaitToken::from_ref(self)
    }

    /// Sleep until the next signal, unless one came after `*gen` was taken.
    ///
    /// `*gen` is refreshed to the generation seen on return. Returns
    /// `Woken` without sleeping when the generation has already moved.
    pub fn block(&self, cpu: &mut Cpu<'_>, gen: &mut u64, timeout: Option<u64>) -> WaitResult {
        let token = self.token();
        cpu.prepare(token, WAITQ_DOMAIN);
        let result = if self.generation() == *gen {
            cpu.wait(token, WAITQ_DOMAIN, timeout, false)
        } else {
            cpu.unsleep();
            WaitResult::Woken
        };
        *gen = self.generation();
        result
    }

    /// Bump the generation and wake every blocked thread, on every core.
    ///
    /// Returns how many were woken on the calling core.
    pub fn signal(&self, cpu: &Cpu<'_>) -> usize {
        self.gen.fetch_add(1, Ordering::SeqCst);
        cpu.signal(self.token(), WAITQ_DOMAIN, WakeCount::All, WakeScope::AllCpus)
    }
}
