//! SMP Configuration
//!
//! Sizing and tuning knobs for the per-core subsystems. Every table size is
//! a power of two so that indices can be masked instead of divided.

use core::fmt;

use crate::types::MAX_CPUS;

// ============================================================================
// Defaults
// ============================================================================

/// Slots per (source, destination) xcall ring
pub const DEFAULT_XCALL_FIFO: usize = 256;

/// Slots per per-core timer wheel
pub const DEFAULT_WHEEL_SLOTS: usize = 512;

/// Buckets per per-core sleep queue
pub const DEFAULT_SLEEPQ_BUCKETS: usize = 128;

/// Clock interrupts per second
pub const DEFAULT_HZ: u32 = 100;

/// Top-level producers stall once a ring is this full (percent)
pub const DEFAULT_FIFO_HIGH_PCT: u8 = 50;

/// Producers already inside a drain may fill up to here (percent)
pub const DEFAULT_FIFO_NESTED_PCT: u8 = 75;

/// Passive xcalls skip the notification below this fill level (percent)
pub const DEFAULT_FIFO_PASSIVE_PCT: u8 = 25;

/// Smallest ring that leaves room for all three watermarks
pub const MIN_XCALL_FIFO: usize = 8;

// ============================================================================
// Errors
// ============================================================================

/// Configuration errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// CPU count is zero or above `MAX_CPUS`
    InvalidCpuCount(usize),
    /// A table size is not a power of two (or is too small)
    NotPowerOfTwo {
        /// Which table
        what: &'static str,
        /// Offending value
        value: usize,
    },
    /// Watermarks must satisfy passive <= high < nested < 100
    BadWatermarks,
    /// Clock rate must be non-zero
    ZeroHz,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidCpuCount(n) => {
                write!(f, "cpu count {} outside 1..={}", n, MAX_CPUS)
            }
            ConfigError::NotPowerOfTwo { what, value } => {
                write!(f, "{} size {} is not a usable power of two", what, value)
            }
            ConfigError::BadWatermarks => {
                write!(f, "xcall watermarks must satisfy passive <= high < nested < 100")
            }
            ConfigError::ZeroHz => write!(f, "hz must be non-zero"),
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for an `Smp` instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmpConfig {
    /// Number of cores
    pub ncpus: usize,
    /// Slots per xcall ring
    pub xcall_fifo: usize,
    /// Top-level high-water mark, percent of `xcall_fifo`
    pub fifo_high_pct: u8,
    /// Nested high-water mark, percent of `xcall_fifo`
    pub fifo_nested_pct: u8,
    /// Passive low-water mark, percent of `xcall_fifo`
    pub fifo_passive_pct: u8,
    /// Slots per timer wheel
    pub wheel_slots: usize,
    /// Buckets per sleep queue
    pub sleepq_buckets: usize,
    /// Clock rate
    pub hz: u32,
}

impl SmpConfig {
    /// Default configuration for `ncpus` cores
    pub const fn new(ncpus: usize) -> Self {
        Self {
            ncpus,
            xcall_fifo: DEFAULT_XCALL_FIFO,
            fifo_high_pct: DEFAULT_FIFO_HIGH_PCT,
            fifo_nested_pct: DEFAULT_FIFO_NESTED_PCT,
            fifo_passive_pct: DEFAULT_FIFO_PASSIVE_PCT,
            wheel_slots: DEFAULT_WHEEL_SLOTS,
            sleepq_buckets: DEFAULT_SLEEPQ_BUCKETS,
            hz: DEFAULT_HZ,
        }
    }

    /// Set the xcall ring size
    pub const fn with_xcall_fifo(mut self, slots: usize) -> Self {
        self.xcall_fifo = slots;
        self
    }

    /// Set the xcall watermarks (percent of ring size)
    pub const fn with_watermarks(mut self, high: u8, nested: u8, passive: u8) -> Self {
        self.fifo_high_pct = high;
        self.fifo_nested_pct = nested;
        self.fifo_passive_pct = passive;
        self
    }

    /// Set the timer wheel size
    pub const fn with_wheel_slots(mut self, slots: usize) -> Self {
        self.wheel_slots = slots;
        self
    }

    /// Set the sleep queue bucket count
    pub const fn with_sleepq_buckets(mut self, buckets: usize) -> Self {
        self.sleepq_buckets = buckets;
        self
    }

    /// Set the clock rate
    pub const fn with_hz(mut self, hz: u32) -> Self {
        self.hz = hz;
        self
    }

    /// Check the configuration for consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ncpus == 0 || self.ncpus > MAX_CPUS {
            return Err(ConfigError::InvalidCpuCount(self.ncpus));
        }
        if !self.xcall_fifo.is_power_of_two() || self.xcall_fifo < MIN_XCALL_FIFO {
            return Err(ConfigError::NotPowerOfTwo {
                what: "xcall fifo",
                value: self.xcall_fifo,
            });
        }
        if !self.wheel_slots.is_power_of_two() {
            return Err(ConfigError::NotPowerOfTwo {
                what: "timer wheel",
                value: self.wheel_slots,
            });
        }
        if !self.sleepq_buckets.is_power_of_two() {
            return Err(ConfigError::NotPowerOfTwo {
                what: "sleep queue",
                value: self.sleepq_buckets,
            });
        }
        // Nested producers must be allowed closer to full than top-level
        // ones, otherwise two cores full toward each other can both stall.
        if self.fifo_passive_pct > self.fifo_high_pct
            || self.fifo_high_pct >= self.fifo_nested_pct
            || self.fifo_nested_pct >= 100
            || self.fifo_high_water() == 0
        {
            return Err(ConfigError::BadWatermarks);
        }
        if self.hz == 0 {
            return Err(ConfigError::ZeroHz);
        }
        Ok(())
    }

    /// Fill level above which a top-level producer stalls
    pub fn fifo_high_water(&self) -> u32 {
        Self::pct_of(self.xcall_fifo, self.fifo_high_pct)
    }

    /// Fill level above which a nested producer stalls
    pub fn fifo_nested_water(&self) -> u32 {
        Self::pct_of(self.xcall_fifo, self.fifo_nested_pct)
    }

    /// Fill level below which passive xcalls skip the notification
    pub fn fifo_passive_water(&self) -> u32 {
        Self::pct_of(self.xcall_fifo, self.fifo_passive_pct)
    }

    /// Convert milliseconds to clock ticks, rounding up
    pub fn ticks_for_ms(&self, ms: u64) -> u64 {
        (ms * self.hz as u64).div_ceil(1000)
    }

    fn pct_of(size: usize, pct: u8) -> u32 {
        ((size * pct as usize) / 100) as u32
    }
}

impl Default for SmpConfig {
    fn default() -> Self {
        Self::new(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        let config = SmpConfig::new(4);
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.fifo_high_water(), 128);
        assert_eq!(config.fifo_nested_water(), 192);
        assert_eq!(config.fifo_passive_water(), 64);
    }

    #[test]
    fn test_rejects_bad_sizes() {
        assert_eq!(
            SmpConfig::new(0).validate(),
            Err(ConfigError::InvalidCpuCount(0))
        );
        assert_eq!(
            SmpConfig::new(MAX_CPUS + 1).validate(),
            Err(ConfigError::InvalidCpuCount(MAX_CPUS + 1))
        );
        assert!(matches!(
            SmpConfig::new(2).with_xcall_fifo(100).validate(),
            Err(ConfigError::NotPowerOfTwo { what: "xcall fifo", .. })
        ));
        assert!(matches!(
            SmpConfig::new(2).with_xcall_fifo(4).validate(),
            Err(ConfigError::NotPowerOfTwo { .. })
        ));
        assert!(matches!(
            SmpConfig::new(2).with_wheel_slots(300).validate(),
            Err(ConfigError::NotPowerOfTwo { what: "timer wheel", .. })
        ));
        assert_eq!(
            SmpConfig::new(2).with_hz(0).validate(),
            Err(ConfigError::ZeroHz)
        );
    }

    #[test]
    fn test_watermark_shape() {
        // nested must sit above top-level
        assert_eq!(
            SmpConfig::new(2).with_watermarks(75, 50, 25).validate(),
            Err(ConfigError::BadWatermarks)
        );
        assert_eq!(
            SmpConfig::new(2).with_watermarks(50, 100, 25).validate(),
            Err(ConfigError::BadWatermarks)
        );
        assert_eq!(
            SmpConfig::new(2).with_watermarks(50, 60, 55).validate(),
            Err(ConfigError::BadWatermarks)
        );
        assert_eq!(
            SmpConfig::new(2).with_watermarks(40, 90, 10).validate(),
            Ok(())
        );
    }

    #[test]
    fn test_ticks_for_ms() {
        let config = SmpConfig::new(1).with_hz(100);
        assert_eq!(config.ticks_for_ms(0), 0);
        assert_eq!(config.ticks_for_ms(1), 1);
        assert_eq!(config.ticks_for_ms(10), 1);
        assert_eq!(config.ticks_for_ms(25), 3);
        assert_eq!(config.ticks_for_ms(1000), 100);
    }
}
