//! Timebase: unit conversion and per-CPU timer bookkeeping.
//!
//! Two native unit systems exist. In one-shot mode a tick is one CPU
//! timestamp-counter cycle; in periodic mode it is one timer reload
//! period. `nano2count`/`count2nano` hide the split so the scheduler can
//! reason in ticks while callers reason in nanoseconds.
//!
//! The `RtTimes` block per CPU tracks the last programmed expiry
//! (`intr_time`), the last observed tick (`tick_time`), and the host
//! tick simulation state (`linux_time`, `linux_tick`). The scheduler
//! owns its contents; everything here is bookkeeping storage plus the
//! conversions.

use quartz_abi::config::TunedParams;
use quartz_abi::task::MAX_CPUS;
use quartz_abi::time::{NSECS_PER_SEC, RTime};
use quartz_lib::math::llimd;
use quartz_lib::{IrqMutex, tsc};

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};

/// Per-CPU timer state.
#[derive(Clone, Copy, Debug)]
pub struct RtTimes {
    /// Absolute time the timer was last programmed to fire.
    pub intr_time: RTime,
    /// Absolute time of the last observed expiry.
    pub tick_time: RTime,
    /// Next host tick due; advanced by `linux_tick` as ticks are
    /// simulated toward the host.
    pub linux_time: RTime,
    /// Host tick period.
    pub linux_tick: RTime,
    /// Reload period while in periodic mode.
    pub periodic_tick: RTime,
}

impl RtTimes {
    pub const fn new() -> Self {
        Self {
            intr_time: 0,
            tick_time: 0,
            linux_time: 0,
            linux_tick: 0,
            periodic_tick: 0,
        }
    }
}

impl Default for RtTimes {
    fn default() -> Self {
        Self::new()
    }
}

static RT_TIMES: [IrqMutex<RtTimes>; MAX_CPUS] = {
    const INIT: IrqMutex<RtTimes> = IrqMutex::new(RtTimes::new());
    [INIT; MAX_CPUS]
};

static ONESHOT_TIMER: [AtomicBool; MAX_CPUS] = {
    const INIT: AtomicBool = AtomicBool::new(quartz_abi::config::ONE_SHOT);
    [INIT; MAX_CPUS]
};

/// Calibration block. Written during boot calibration only, then
/// read-only; the cell keeps the hot conversion path free of locks.
struct TunedCell(UnsafeCell<TunedParams>);

// SAFETY: written once before the timer starts, read-only afterwards.
unsafe impl Sync for TunedCell {}

static TUNED: TunedCell = TunedCell(UnsafeCell::new(TunedParams::new()));

#[inline]
pub fn tuned() -> TunedParams {
    // SAFETY: see TunedCell.
    unsafe { *TUNED.0.get() }
}

pub fn set_tuned(params: TunedParams) {
    // SAFETY: callers run during init or tests, before timer use.
    unsafe { *TUNED.0.get() = params }
}

/// Access a CPU's timer bookkeeping. Callers composing multi-field
/// updates (the scheduler's decision path) do so inside one closure.
pub fn with_times<R>(cpu: usize, f: impl FnOnce(&mut RtTimes) -> R) -> R {
    f(&mut RT_TIMES[cpu.min(MAX_CPUS - 1)].lock())
}

pub fn set_oneshot(cpu: usize, oneshot: bool) {
    ONESHOT_TIMER[cpu.min(MAX_CPUS - 1)].store(oneshot, Ordering::Release);
}

#[inline]
pub fn is_oneshot(cpu: usize) -> bool {
    ONESHOT_TIMER[cpu.min(MAX_CPUS - 1)].load(Ordering::Acquire)
}

/// Current monotonic tick count for this CPU: the TSC in one-shot mode,
/// the accumulated tick time in periodic mode.
pub fn rt_get_time_cpu(cpu: usize) -> RTime {
    if is_oneshot(cpu) {
        tsc::rdtsc() as RTime
    } else {
        with_times(cpu, |t| t.tick_time)
    }
}

pub fn rt_get_time() -> RTime {
    rt_get_time_cpu(quartz_lib::current_cpu_id())
}

/// Convert a tick count to nanoseconds for a given CPU's mode.
pub fn count2nano_cpu(counts: RTime, cpu: usize) -> RTime {
    let tuned = tuned();
    let freq = if is_oneshot(cpu) {
        tuned.cpu_freq
    } else {
        tuned.timer_freq
    };
    if freq == 0 {
        return 0;
    }
    scaled(counts, NSECS_PER_SEC as u64, freq)
}

/// Convert nanoseconds to tick counts for a given CPU's mode.
pub fn nano2count_cpu(ns: RTime, cpu: usize) -> RTime {
    let tuned = tuned();
    let freq = if is_oneshot(cpu) {
        tuned.cpu_freq
    } else {
        tuned.timer_freq
    };
    if freq == 0 {
        return 0;
    }
    scaled(ns, freq, NSECS_PER_SEC as u64)
}

pub fn count2nano(counts: RTime) -> RTime {
    count2nano_cpu(counts, quartz_lib::current_cpu_id())
}

pub fn nano2count(ns: RTime) -> RTime {
    nano2count_cpu(ns, quartz_lib::current_cpu_id())
}

pub fn rt_get_time_ns() -> RTime {
    count2nano(rt_get_time())
}

/// Wall ticks of the CPU clock in nanoseconds, independent of timer mode.
pub fn rt_get_cpu_time_ns() -> RTime {
    let tuned = tuned();
    if tuned.cpu_freq == 0 {
        return 0;
    }
    scaled(tsc::rdtsc() as RTime, NSECS_PER_SEC as u64, tuned.cpu_freq)
}

/// `value * mult / div` where either factor may exceed u32. Frequencies
/// below 4 GHz take the fast 64x32 path; anything larger splits the
/// factor so intermediate products still fit.
fn scaled(value: RTime, mult: u64, div: u64) -> RTime {
    if mult <= u32::MAX as u64 && div <= u32::MAX as u64 {
        return llimd(value, mult as u32, div as u32);
    }
    ((value as i128 * mult as i128) / div as i128) as RTime
}

/// Reset a CPU's bookkeeping (tests and timer stop path).
pub fn reset_times(cpu: usize) {
    with_times(cpu, |t| *t = RtTimes::new());
}
