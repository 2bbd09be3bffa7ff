//! Invariant violation handler
//!
//! Scheduler state that fails a consistency check cannot be repaired in
//! place; continuing would silently corrupt it. These paths log and halt.

use core::fmt;

/// Report an invariant violation and halt.
///
/// Never returns. The host test harness sees an ordinary panic.
#[cold]
#[inline(never)]
pub fn invariant_violation(args: fmt::Arguments<'_>) -> ! {
    log::error!("!!! SMP INVARIANT VIOLATION !!! {}", args);
    panic!("invariant violation: {}", args);
}

/// Halt on a broken scheduler invariant
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {
        $crate::panic::invariant_violation(format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    #[test]
    #[should_panic(expected = "invariant violation: owner cpu2 != cpu0")]
    fn test_fatal_panics_with_message() {
        crate::fatal!("owner cpu{} != cpu{}", 2, 0);
    }
}
