//! Build-time configuration knobs and the boot-time tuning block.

use crate::time::RTime;

/// If true the timer is programmed per-deadline; otherwise it reloads at
/// `PERIODIC_TICK_NS`.
pub const ONE_SHOT: bool = true;

/// Tick period used when not in one-shot mode.
pub const PERIODIC_TICK_NS: i64 = 1_000_000;

/// Calibration overrides. Zero means "measure at boot".
pub const LATENCY_NS: i64 = 0;
pub const SETUP_TIME_NS: i64 = 0;

/// Fallback task stack size when the caller passes zero.
pub const STACK_DEFAULT_SIZE: usize = 32 * 1024;

// Dynamic allocator geometry. Powers of two; min alignment of 16 keeps
// FPU save areas directly storable in heap blocks.
pub const HEAP_PAGE_SIZE: usize = 4096;
pub const HEAP_MIN_ALLOC: usize = 32;
pub const HEAP_MIN_ALIGN: usize = 16;
pub const HEAP_PAGES: usize = 256;

pub const MAX_SEMAPHORES: usize = 64;
pub const MAX_NAMES: usize = 64;

/// Whether the host task carries an FPU context (affects switch cost).
pub const LINUX_USES_FPU: bool = true;

/// Per-IRQ latency ceiling that activates the watchdog. Zero disables.
pub const WATCHDOG_THRESHOLD_NS: i64 = 0;

const _: () = {
    assert!(HEAP_PAGE_SIZE.is_power_of_two());
    assert!(HEAP_MIN_ALLOC.is_power_of_two());
    assert!(HEAP_MIN_ALIGN.is_power_of_two());
    assert!(HEAP_MIN_ALLOC >= 8 && HEAP_MIN_ALLOC <= 32768);
    assert!(HEAP_MIN_ALIGN >= 16);
};

/// Calibrated timing parameters, measured once at boot and never changed
/// at runtime. All values are plain integers so the scheduler's deadline
/// arithmetic never touches floating point.
#[derive(Clone, Copy, Debug)]
pub struct TunedParams {
    /// CPU timestamp-counter frequency in Hz.
    pub cpu_freq: u64,
    /// Programmable timer frequency in Hz.
    pub timer_freq: u64,
    /// Interrupt-assertion to handler-entry latency, in CPU ticks.
    pub latency: i32,
    /// Timer-write to first-fire delay, in CPU ticks.
    pub setup_time_cpu: i32,
    /// Same delay expressed in timer counts.
    pub setup_time_timer: i32,
    /// Per-CPU tolerance applied when matching deadlines to ticks.
    pub timers_tol: [RTime; crate::task::MAX_CPUS],
}

impl TunedParams {
    pub const fn new() -> Self {
        Self {
            cpu_freq: 0,
            timer_freq: 0,
            latency: 0,
            setup_time_cpu: 0,
            setup_time_timer: 0,
            timers_tol: [0; crate::task::MAX_CPUS],
        }
    }
}

impl Default for TunedParams {
    fn default() -> Self {
        Self::new()
    }
}
