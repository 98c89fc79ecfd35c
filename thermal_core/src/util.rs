//! Cadence/period helpers for thermal_core.

use std::time::Duration;

/// Whole milliseconds in `d`, saturating, at least 1.
#[inline]
pub fn interval_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Cadence cycles needed to cover `ms` at `interval_ms` per cycle, rounded up.
#[inline]
pub fn cycles_for(ms: u64, interval_ms: u64) -> u64 {
    ms.div_ceil(interval_ms.max(1))
}

/// Logical time after `cycles` cadence cycles.
#[inline]
pub fn cycles_to_ms(cycles: u64, interval_ms: u64) -> u64 {
    cycles.saturating_mul(interval_ms)
}
