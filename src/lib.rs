//! smpcore - Per-core scheduling and cross-core coordination
//!
//! This crate provides the layer of a multi-core kernel that sits directly
//! above the machine: cross-core function calls and rendezvous, per-core
//! timer wheels, a blocking wait primitive and asynchronous message ports.
//!
//! Every core owns its own queues. Remote state is only ever changed by
//! asking the owning core to do it, so there is no whole-system lock.

#![no_std]
// Kernel-appropriate clippy configuration
// Many kernel types have specialized initialization that doesn't fit Default
#![allow(clippy::new_without_default)]
// Per-core handles are threaded through nearly every call
#![allow(clippy::too_many_arguments)]

// Standard library replacement for no_std
extern crate alloc;

#[cfg(any(test, feature = "std"))]
extern crate std;

// Core types
pub mod config;
pub mod panic;
pub mod platform;
pub mod types;

// Subsystems
pub mod ipc;
pub mod kern;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::{ConfigError, SmpConfig};
pub use ipc::{
    Dispatch, IpcError, IpcResult, Msg, MsgFlags, MsgPort, MsgStatus, PortHandler, PortKind,
};
pub use kern::{
    Callout, Cpu, CounterSnapshot, CpuSyncGuard, Smp, Thread, WaitQueue, WaitResult, WakeCount,
    WakeScope, Xcall, XcallFn,
};
pub use platform::{Platform, SpinPlatform};
pub use types::{CpuId, CpuMask, Domain, WaitToken, MAX_CPUS};

#[cfg(any(test, feature = "std"))]
pub use platform::HostedPlatform;

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Library name
pub const NAME: &str = "smpcore";
