//! Scaled integer multiply-divide.
//!
//! The scheduler converts between nanoseconds, timestamp-counter ticks,
//! and timer counts with `value * mult / div` where `value` spans the full
//! signed 64-bit range. A plain 64-bit product overflows, so both helpers
//! widen through 128 bits (the 64x32 -> 96 -> 64 shape of the classic
//! assembler versions) and round to nearest. Rounding keeps the
//! ns -> ticks -> ns round trip within one tick.

/// `i * mult / div`, rounded to nearest, for 32-bit-ish operands.
#[inline]
pub const fn imuldiv(i: i32, mult: u32, div: u32) -> i32 {
    if div == 0 {
        return 0;
    }
    let prod = i as i64 * mult as i64;
    let half = (div / 2) as i64;
    let q = if prod >= 0 {
        (prod + half) / div as i64
    } else {
        (prod - half) / div as i64
    };
    q as i32
}

/// `ll * mult / div`, rounded to nearest, across the whole RTime range.
#[inline]
pub const fn llimd(ll: i64, mult: u32, div: u32) -> i64 {
    if div == 0 {
        return 0;
    }
    let prod = ll as i128 * mult as i128;
    let half = (div / 2) as i128;
    let q = if prod >= 0 {
        (prod + half) / div as i128
    } else {
        (prod - half) / div as i128
    };
    q as i64
}

#[cfg(feature = "itests")]
pub mod math_tests {
    use super::*;
    use crate::testing::TestResult;

    pub fn test_llimd_identity() -> TestResult {
        for v in [0i64, 1, -1, 999_999_937, -999_999_937, i64::MAX / 2] {
            if llimd(v, 7, 7) != v {
                return crate::fail!("llimd identity broke for {}", v);
            }
        }
        TestResult::Pass
    }

    pub fn test_llimd_round_trip_within_one_tick() -> TestResult {
        // ns -> ticks at 2.4 GHz and back; |error| must be <= 1 tick's ns.
        let cpu_freq: u32 = 2_400_000_000;
        for ns in [1i64, 1_000, 999_999, 1_000_000_000, -1_000_000_000] {
            let ticks = llimd(ns, cpu_freq, 1_000_000_000);
            let back = llimd(ticks, 1_000_000_000, cpu_freq);
            if (back - ns).abs() > 1 {
                return crate::fail!("round trip {} -> {} -> {}", ns, ticks, back);
            }
        }
        TestResult::Pass
    }

    pub fn test_llimd_no_overflow_near_extremes() -> TestResult {
        let big = i64::MAX / 2;
        let r = llimd(big, 3, 5);
        if r <= 0 {
            return crate::fail!("sign lost near extreme");
        }
        let r = llimd(-big, 3, 5);
        if r >= 0 {
            return crate::fail!("sign lost near negative extreme");
        }
        TestResult::Pass
    }

    pub fn test_imuldiv_rounds_to_nearest() -> TestResult {
        if imuldiv(5, 1, 2) != 3 {
            return crate::fail!("5/2 should round to 3");
        }
        if imuldiv(-5, 1, 2) != -3 {
            return crate::fail!("-5/2 should round to -3");
        }
        TestResult::Pass
    }

    crate::define_test_suite!(
        math,
        [
            test_llimd_identity,
            test_llimd_round_trip_within_one_tick,
            test_llimd_no_overflow_near_extremes,
            test_imuldiv_rounds_to_nearest,
        ]
    );
}
