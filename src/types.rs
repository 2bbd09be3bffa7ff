//! Common types used across smpcore
//!
//! This module defines shared identifiers to avoid circular dependencies
//! between the per-core subsystems.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

/// Maximum number of cores a single `Smp` instance can manage.
///
/// Bounded by the width of `CpuMask`.
pub const MAX_CPUS: usize = 64;

// ============================================================================
// Identifiers
// ============================================================================

/// Core identifier (0..N-1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct CpuId(pub usize);

impl CpuId {
    /// Index into per-core tables
    #[inline]
    pub const fn index(self) -> usize {
        self.0
    }

    /// Single-bit mask for this core
    #[inline]
    pub const fn bit(self) -> u64 {
        1u64 << self.0
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

/// Thread identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ThreadId(pub u64);

impl ThreadId {
    /// Create a new thread ID with a unique auto-incremented value
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        ThreadId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Unique port identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PortId(pub u64);

impl PortId {
    /// Generate a new unique port ID with an auto-incremented value
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        PortId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Unique message identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MsgId(pub u64);

impl MsgId {
    /// Generate a new unique message ID
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        MsgId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

// ============================================================================
// Wait Tokens
// ============================================================================

/// Opaque identity used to match waiters with signalers.
///
/// Typically the address of the object being waited on. It is compared and
/// hashed, never dereferenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WaitToken(pub usize);

impl WaitToken {
    /// Token derived from the address of a value
    pub fn from_ref<T: ?Sized>(value: &T) -> Self {
        WaitToken(value as *const T as *const () as usize)
    }

    /// Token derived from a raw pointer
    pub fn from_ptr<T: ?Sized>(ptr: *const T) -> Self {
        WaitToken(ptr as *const () as usize)
    }

    /// Sleep queue bucket for this token.
    ///
    /// Objects are aligned to at least 4 bytes and often much more, so the
    /// low bits carry little entropy; fold the address onto itself first.
    #[inline]
    pub fn bucket(self, nbuckets: usize) -> usize {
        (self.0 ^ (self.0 >> 8)) & (nbuckets - 1)
    }
}

/// Secondary wait key multiplexing independent wait spaces on one token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Domain(pub u32);

impl Domain {
    /// Domain used when the caller does not care
    pub const DEFAULT: Domain = Domain(0);
}

// ============================================================================
// CPU Masks
// ============================================================================

/// Set of cores, one bit per `CpuId`
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CpuMask(u64);

impl CpuMask {
    /// Empty set
    pub const fn empty() -> Self {
        CpuMask(0)
    }

    /// Cores `0..ncpus`
    pub const fn all(ncpus: usize) -> Self {
        if ncpus >= 64 {
            CpuMask(u64::MAX)
        } else {
            CpuMask((1u64 << ncpus) - 1)
        }
    }

    /// Set holding only `cpu`
    pub const fn single(cpu: CpuId) -> Self {
        CpuMask(cpu.bit())
    }

    /// Build from raw bits
    pub const fn from_bits(bits: u64) -> Self {
        CpuMask(bits)
    }

    /// Raw bits
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Copy with `cpu` added
    pub const fn with(self, cpu: CpuId) -> Self {
        CpuMask(self.0 | cpu.bit())
    }

    /// Copy with `cpu` removed
    pub const fn without(self, cpu: CpuId) -> Self {
        CpuMask(self.0 & !cpu.bit())
    }

    /// Is `cpu` a member?
    pub const fn contains(self, cpu: CpuId) -> bool {
        self.0 & cpu.bit() != 0
    }

    /// Is the set empty?
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Number of members
    pub const fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// Members in ascending order
    pub fn cpus(self) -> heapless::Vec<CpuId, MAX_CPUS> {
        let mut out = heapless::Vec::new();
        let mut bits = self.0;
        while bits != 0 {
            let n = bits.trailing_zeros() as usize;
            // Capacity equals the mask width, so this cannot overflow
            let _ = out.push(CpuId(n));
            bits &= bits - 1;
        }
        out
    }
}

impl fmt::Debug for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CpuMask({:#x})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_mask_ops() {
        let mask = CpuMask::all(4);
        assert_eq!(mask.count(), 4);
        assert!(mask.contains(CpuId(3)));
        assert!(!mask.contains(CpuId(4)));

        let mask = mask.without(CpuId(1));
        assert_eq!(mask.cpus().as_slice(), &[CpuId(0), CpuId(2), CpuId(3)]);
        assert_eq!(mask.with(CpuId(1)), CpuMask::all(4));
        assert!(CpuMask::empty().is_empty());
        assert_eq!(CpuMask::all(64).bits(), u64::MAX);
    }

    #[test]
    fn test_wait_token_bucket_in_range() {
        let value = 17u32;
        let token = WaitToken::from_ref(&value);
        assert!(token.bucket(128) < 128);
        assert_eq!(WaitToken(0x1234).bucket(1), 0);
        assert_eq!(token, WaitToken::from_ptr(&value as *const u32));
    }

    #[test]
    fn test_unique_ids() {
        assert_ne!(ThreadId::new(), ThreadId::new());
        assert_ne!(PortId::new(), PortId::new());
        assert_ne!(MsgId::new(), MsgId::new());
    }
}
