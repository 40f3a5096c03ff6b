//! Time types shared across the co-kernel.
//!
//! A `RTime` value is a signed 64-bit count whose unit depends on the timer
//! mode: CPU timestamp-counter ticks in one-shot mode, hardware timer counts
//! in periodic mode. Conversions live in `quartz_hal::clock`.

/// Signed tick count. Signed so that deadline arithmetic (`deadline - now`)
/// stays well-defined when a deadline is already in the past.
pub type RTime = i64;

/// "Never": a resume time no running timer will ever reach.
pub const RT_TIME_END: RTime = i64::MAX;

pub const NSECS_PER_SEC: i64 = 1_000_000_000;
