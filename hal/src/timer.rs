//! Programmable timer device.
//!
//! One free-running countdown timer per CPU, programmable either for
//! one-shot deadlines or a fixed reload period. The scheduler talks to
//! it through [`arm_absolute`] and never sees the register file; tests
//! talk to a [`MockTimer`] instead of the LAPIC.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use quartz_abi::RtError;
use quartz_abi::config::{self, TunedParams};
use quartz_abi::error::RtResult;
use quartz_abi::time::RTime;
use quartz_lib::math::{imuldiv, llimd};
use quartz_lib::{IrqMutex, klog_info, tsc};

use crate::clock;
use crate::pipeline::{self, IrqMode};

/// The pipeline IRQ line carrying timer expiries.
pub const TIMER_IRQ: u32 = 0;

/// Interrupt vector programmed into the local timer's LVT entry.
const TIMER_VECTOR: u32 = 0xF0;

pub trait TimerDevice: Sync {
    /// Program a single expiry `count` timer ticks from now.
    fn program_oneshot(&self, count: u32);
    /// Program a recurring expiry every `count` timer ticks.
    fn program_periodic(&self, count: u32);
    fn stop(&self);
    fn current_count(&self) -> u32;
}

/// Local x2APIC timer behind its MSR register file.
pub struct X2ApicTimer;

const MSR_X2APIC_LVT_TIMER: u32 = 0x832;
const MSR_X2APIC_INIT_COUNT: u32 = 0x838;
const MSR_X2APIC_CUR_COUNT: u32 = 0x839;
const MSR_X2APIC_DIV: u32 = 0x83E;

const LVT_TIMER_PERIODIC: u64 = 1 << 17;
const LVT_MASKED: u64 = 1 << 16;
/// Divide-by-1 encoding.
const DIV_BY_1: u64 = 0b1011;

impl X2ApicTimer {
    #[inline]
    fn wrmsr(reg: u32, value: u64) {
        let mut msr = x86_64::registers::model_specific::Msr::new(reg);
        // SAFETY: x2APIC timer MSRs; the co-kernel owns the local timer
        // once installed.
        unsafe { msr.write(value) };
    }

    #[inline]
    fn rdmsr(reg: u32) -> u64 {
        let msr = x86_64::registers::model_specific::Msr::new(reg);
        // SAFETY: read-only timer MSR.
        unsafe { msr.read() }
    }
}

impl TimerDevice for X2ApicTimer {
    fn program_oneshot(&self, count: u32) {
        Self::wrmsr(MSR_X2APIC_DIV, DIV_BY_1);
        Self::wrmsr(MSR_X2APIC_LVT_TIMER, TIMER_VECTOR as u64);
        Self::wrmsr(MSR_X2APIC_INIT_COUNT, count.max(1) as u64);
    }

    fn program_periodic(&self, count: u32) {
        Self::wrmsr(MSR_X2APIC_DIV, DIV_BY_1);
        Self::wrmsr(MSR_X2APIC_LVT_TIMER, TIMER_VECTOR as u64 | LVT_TIMER_PERIODIC);
        Self::wrmsr(MSR_X2APIC_INIT_COUNT, count.max(1) as u64);
    }

    fn stop(&self) {
        Self::wrmsr(MSR_X2APIC_LVT_TIMER, TIMER_VECTOR as u64 | LVT_MASKED);
        Self::wrmsr(MSR_X2APIC_INIT_COUNT, 0);
    }

    fn current_count(&self) -> u32 {
        Self::rdmsr(MSR_X2APIC_CUR_COUNT) as u32
    }
}

static X2APIC_TIMER: X2ApicTimer = X2ApicTimer;

static DEVICE: IrqMutex<Option<&'static dyn TimerDevice>> = IrqMutex::new(None);

static DEFAULT_INSTALL: spin::Once<()> = spin::Once::new();

/// Install a timer device. The scheduler refuses to start until one is
/// present; tests install a [`MockTimer`], the host glue the LAPIC.
pub fn install_timer_device(dev: &'static dyn TimerDevice) {
    *DEVICE.lock() = Some(dev);
}

/// Install the local APIC timer, once. Harnesses that already installed
/// a mock are left alone.
pub fn install_default_timer() {
    DEFAULT_INSTALL.call_once(|| {
        let mut guard = DEVICE.lock();
        if guard.is_none() {
            *guard = Some(&X2APIC_TIMER);
        }
    });
}

fn with_device<R>(f: impl FnOnce(&dyn TimerDevice) -> R) -> Option<R> {
    let guard = DEVICE.lock();
    match *guard {
        Some(dev) => Some(f(dev)),
        None => None,
    }
}

// --- Programming -------------------------------------------------------------

/// Program the next expiry in raw timer counts. A zero delay in
/// periodic mode is a no-op: the reload register refires by itself.
pub fn rt_set_timer_delay(delay_counts: i32) {
    let cpu = quartz_lib::current_cpu_id();
    if delay_counts == 0 && !clock::is_oneshot(cpu) {
        return;
    }
    with_device(|dev| dev.program_oneshot(delay_counts.max(1) as u32));
}

/// Aim the timer at the absolute deadline `intr_time`, compensating for
/// the calibrated interrupt latency. Deadlines closer than the minimum
/// programmable delay are pushed out to `now + setup_time`; the returned
/// value is the expiry actually programmed, which the caller must store
/// as the effective `intr_time`.
pub fn arm_absolute(intr_time: RTime, now: RTime) -> RTime {
    let tuned = clock::tuned();
    let delay = (intr_time - now) as i64 - tuned.latency as i64;
    if delay >= tuned.setup_time_cpu as i64 {
        let counts = if tuned.cpu_freq != 0 {
            llimd(delay, tuned.timer_freq as u32, tuned.cpu_freq as u32)
        } else {
            delay
        };
        rt_set_timer_delay(counts.clamp(1, i32::MAX as i64) as i32);
        intr_time
    } else {
        rt_set_timer_delay(tuned.setup_time_timer.max(1));
        now + tuned.setup_time_cpu as RTime
    }
}

// --- Mode control ------------------------------------------------------------

pub fn rt_set_oneshot_mode() {
    stop_timer();
    for cpu in 0..quartz_lib::MAX_CPUS {
        clock::set_oneshot(cpu, true);
    }
}

pub fn rt_set_periodic_mode() {
    stop_timer();
    for cpu in 0..quartz_lib::MAX_CPUS {
        clock::set_oneshot(cpu, false);
    }
}

/// Start the hardware timer and route its IRQ to `handler` in the
/// real-time domain. `period_counts` is the reload period for periodic
/// mode and ignored in one-shot mode. Returns the period programmed.
pub fn rt_request_timer(
    handler: pipeline::IrqHandler,
    period_counts: RTime,
    rt_domain: crate::domain::DomainId,
) -> RtResult<RTime> {
    if DEVICE.lock().is_none() {
        return Err(RtError::NoResource);
    }

    pipeline::virtualize_irq_from(
        rt_domain,
        TIMER_IRQ,
        Some(handler),
        core::ptr::null_mut(),
        None,
        IrqMode::HANDLE,
    )?;

    let cpu = quartz_lib::current_cpu_id();
    let oneshot = clock::is_oneshot(cpu);
    let now = tsc::rdtsc() as RTime;
    let tuned = clock::tuned();
    let host_tick = host_tick_counts(cpu);

    clock::with_times(cpu, |t| {
        t.periodic_tick = if oneshot { 0 } else { period_counts.max(1) };
        t.tick_time = if oneshot { now } else { 0 };
        t.intr_time = t.tick_time + if oneshot { host_tick } else { t.periodic_tick };
        t.linux_tick = host_tick;
        t.linux_time = t.tick_time + host_tick;
    });

    with_device(|dev| {
        if oneshot {
            // First shot a host tick out; the scheduler will re-aim it.
            let counts = if tuned.cpu_freq != 0 {
                llimd(host_tick, tuned.timer_freq as u32, tuned.cpu_freq as u32)
            } else {
                host_tick
            };
            dev.program_oneshot(counts.clamp(1, u32::MAX as i64) as u32);
        } else {
            dev.program_periodic(period_counts.clamp(1, u32::MAX as i64) as u32);
        }
    });

    klog_info!(
        "HAL: timer started, mode={}, period={} counts",
        if oneshot { "oneshot" } else { "periodic" },
        period_counts,
    );
    Ok(period_counts)
}

/// Stop the device and forget the timer IRQ routing.
pub fn stop_timer() {
    with_device(|dev| dev.stop());
    for cpu in 0..quartz_lib::MAX_CPUS {
        clock::reset_times(cpu);
    }
}

/// Host tick period in this CPU's native counts.
pub fn host_tick_counts(cpu: usize) -> RTime {
    let ns = crate::host::host_tick_ns();
    let counts = clock::nano2count_cpu(ns, cpu);
    counts.max(1)
}

// --- Calibration -------------------------------------------------------------

/// Measure how long one timer programming takes by issuing `samples`
/// back-to-back writes and averaging, then fold the result into the
/// calibration block. `cpu_freq`/`timer_freq` must already be known
/// (host-provided or measured against a reference clock by the glue).
pub fn calibrate_timer(cpu_freq: u64, timer_freq: u64, samples: u32) -> TunedParams {
    let samples = samples.max(1);
    let measured_ns = with_device(|dev| {
        let start = tsc::rdtsc();
        for _ in 0..samples {
            dev.program_oneshot(u32::MAX);
        }
        let elapsed = tsc::rdtsc().wrapping_sub(start);
        dev.stop();
        if cpu_freq == 0 {
            0
        } else {
            llimd((elapsed / samples as u64) as i64, 1_000_000_000, cpu_freq as u32)
        }
    })
    .unwrap_or(0);

    let setup_ns = if config::SETUP_TIME_NS > 0 {
        config::SETUP_TIME_NS
    } else {
        measured_ns.max(1)
    };
    let latency_ns = if config::LATENCY_NS > 0 {
        config::LATENCY_NS
    } else {
        // Dispatch latency is dominated by the programming cost until a
        // real measurement replaces it.
        setup_ns
    };

    let mut tuned = TunedParams::new();
    tuned.cpu_freq = cpu_freq;
    tuned.timer_freq = timer_freq;
    tuned.latency = imuldiv(latency_ns as i32, cpu_freq.min(u32::MAX as u64) as u32, 1_000_000_000);
    tuned.setup_time_cpu =
        imuldiv(setup_ns as i32, cpu_freq.min(u32::MAX as u64) as u32, 1_000_000_000);
    tuned.setup_time_timer =
        imuldiv(setup_ns as i32, timer_freq.min(u32::MAX as u64) as u32, 1_000_000_000);
    clock::set_tuned(tuned);
    klog_info!(
        "HAL: calibrated setup={}ns latency={}ns over {} samples",
        setup_ns,
        latency_ns,
        samples,
    );
    tuned
}

// --- Mock device -------------------------------------------------------------

/// Recording device for the test suites: remembers every programming so
/// tests can assert "exactly one arm per decision" and mode switches.
pub struct MockTimer {
    pub last_count: AtomicU32,
    /// 0 = stopped, 1 = oneshot, 2 = periodic.
    pub mode: AtomicU32,
    pub programmings: AtomicU64,
}

impl MockTimer {
    pub const fn new() -> Self {
        Self {
            last_count: AtomicU32::new(0),
            mode: AtomicU32::new(0),
            programmings: AtomicU64::new(0),
        }
    }

    pub fn reset(&self) {
        self.last_count.store(0, Ordering::Relaxed);
        self.mode.store(0, Ordering::Relaxed);
        self.programmings.store(0, Ordering::Relaxed);
    }
}

impl Default for MockTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerDevice for MockTimer {
    fn program_oneshot(&self, count: u32) {
        self.last_count.store(count, Ordering::Relaxed);
        self.mode.store(1, Ordering::Relaxed);
        self.programmings.fetch_add(1, Ordering::Relaxed);
    }

    fn program_periodic(&self, count: u32) {
        self.last_count.store(count, Ordering::Relaxed);
        self.mode.store(2, Ordering::Relaxed);
        self.programmings.fetch_add(1, Ordering::Relaxed);
    }

    fn stop(&self) {
        self.mode.store(0, Ordering::Relaxed);
    }

    fn current_count(&self) -> u32 {
        self.last_count.load(Ordering::Relaxed)
    }
}
