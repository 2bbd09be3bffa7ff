//! Kern subsystem - Per-core scheduling primitives
//!
//! Contains the per-core context, cross-core calls, the timer wheel, the
//! sleep queues and the support pieces they share.

pub mod counters;
pub mod cpusync;
pub mod lock;
pub mod processor;
pub mod reclaim;
pub mod sched_prim;
pub mod thread;
pub mod timer;
pub mod xcall;

pub use counters::{CounterSnapshot, SmpCounter, SmpCounters};
pub use cpusync::{CpuSyncFn, CpuSyncGuard};
pub use lock::{CpuOwned, SerialDomain, SerialGuard, SimpleLock};
pub use processor::{Cpu, ProcessorState, Smp};
pub use sched_prim::{WaitQueue, WaitResult, WakeCount, WakeScope, WAITQ_DOMAIN};
pub use thread::Thread;
pub use timer::{Callout, CalloutFn, CalloutState};
pub use xcall::{Nesting, Xcall, XcallFn};
