//! Shared fixture for the scenario suites.
//!
//! Full stack, suppressed switch: pipeline and host domain installed,
//! mock timer device, TSC-anchored timeline with second-scale steps so
//! elapsed test time is noise on the simulated clock.

use core::sync::atomic::{AtomicU64, Ordering};

use quartz_abi::config::TunedParams;
use quartz_hal::clock;
use quartz_hal::host;
use quartz_hal::pipeline;
use quartz_hal::timer::{MockTimer, install_timer_device};
use quartz_lib::tsc;
use quartz_sched::api::{init_scheduler, task_init, task_start};
use quartz_sched::scheduler::set_switch_suppressed;
use quartz_sched::registry::reset_registry;
use quartz_sched::task::{TaskHandle, with_core};

pub static MOCK: MockTimer = MockTimer::new();

/// Counts deliveries into the host domain's IRQ entry.
pub static HOST_IRQS: AtomicU64 = AtomicU64::new(0);

pub const SECOND: i64 = 2_000_000_000;

pub fn dummy_entry(_arg: usize) {}

fn host_irq_entry(_irq: u32) {
    HOST_IRQS.fetch_add(1, Ordering::Relaxed);
}

pub struct ScenarioFixture {
    pub base: i64,
}

impl ScenarioFixture {
    pub fn new() -> Self {
        set_switch_suppressed(true);
        pipeline::reset_pipeline();
        host::reset_host();
        init_scheduler();
        reset_registry();
        HOST_IRQS.store(0, Ordering::Relaxed);

        let _ = host::install_rt_domain();
        let _ = host::install_host_domain(host_irq_entry);

        let mut tuned = TunedParams::new();
        tuned.cpu_freq = 2_000_000_000;
        tuned.timer_freq = 100_000_000;
        tuned.setup_time_cpu = 4_000;
        tuned.setup_time_timer = 200;
        tuned.latency = 2_000;
        clock::set_tuned(tuned);
        clock::set_oneshot(0, true);
        clock::reset_times(0);
        MOCK.reset();
        install_timer_device(&MOCK);

        let base = tsc::rdtsc() as i64;
        clock::with_times(0, |t| {
            t.tick_time = base;
            t.intr_time = base + SECOND;
            t.linux_time = base + SECOND;
            t.linux_tick = SECOND;
        });
        with_core(|core| {
            core.cpus[0].oneshot_running = true;
            core.cpus[0].shot_fired = true;
            core.cpus[0].half_tick = 1_000;
            core.cpus[0].rt_time_h = base + 1_000;
        });
        Self { base }
    }

    pub fn spawn(&self, priority: i32) -> TaskHandle {
        let handle =
            task_init(dummy_entry, 0, 4096, priority, false, None).expect("task_init failed");
        task_start(handle).expect("task_start failed");
        handle
    }

    pub fn run_as(&self, handle: TaskHandle) {
        with_core(|core| core.cpus[0].current = handle.raw());
    }

    pub fn host_irq_count(&self) -> u64 {
        HOST_IRQS.load(Ordering::Relaxed)
    }
}

impl Drop for ScenarioFixture {
    fn drop(&mut self) {
        with_core(|core| core.init());
        pipeline::reset_pipeline();
        host::reset_host();
        reset_registry();
    }
}
