//! Asynchronous message passing
//!
//! Messages are sent to ports and replied to, either synchronously (the
//! sender sleeps until the reply) or through a reply port. The port decides
//! how its queues are protected; see `PortKind`.

use core::fmt;

use crate::types::Domain;

pub mod msg;
pub mod port;

pub use msg::{Msg, MsgAbortFn, MsgFlags, MsgStatus};
pub use port::{Dispatch, MsgPort, PortHandler, PortKind};

/// Wait domain of threads blocked on a port
pub const PORT_DOMAIN: Domain = Domain(0x706f_7274);

/// Wait domain of threads blocked on a message
pub const MSG_DOMAIN: Domain = Domain(0x6d73_6721);

/// IPC error types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcError {
    /// No message arrived before the timeout
    TimedOut,
    /// The waiting thread was interrupted
    Interrupted,
    /// The message is in a state that does not allow the operation
    InvalidState,
    /// The message is still linked on a port
    AlreadyQueued,
}

impl fmt::Display for IpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpcError::TimedOut => write!(f, "timed out"),
            IpcError::Interrupted => write!(f, "interrupted"),
            IpcError::InvalidState => write!(f, "message state does not allow this"),
            IpcError::AlreadyQueued => write!(f, "message already queued"),
        }
    }
}

/// Result type for IPC operations
pub type IpcResult<T> = Result<T, IpcError>;
