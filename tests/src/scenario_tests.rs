//! End-to-end scenarios across the pipeline, timer, scheduler, and IPC.

use core::ffi::c_void;
use core::sync::atomic::{AtomicU16, AtomicU64, Ordering};

use quartz_abi::task::TaskState;
use quartz_hal::host;
use quartz_hal::pipeline::{self, IrqMode};
use quartz_lib::testing::TestResult;
use quartz_lib::{define_test_suite, fail};
use quartz_sched::api::{task_make_periodic, task_resume, task_wait_period};
use quartz_sched::scheduler::timer_isr;
use quartz_sched::task::with_core;

use crate::harness::{ScenarioFixture, SECOND};

// --- Host-tick recovery ------------------------------------------------------

/// No real-time task runs for 200 host-tick periods; the host's wall
/// clock still advances by exactly 200 ticks because every crossing of
/// `linux_time` propagates its timer IRQ down the pipeline.
pub fn test_host_tick_recovery_over_200_periods() -> TestResult {
    let fixture = ScenarioFixture::new();
    for _ in 0..200 {
        timer_isr(quartz_hal::timer::TIMER_IRQ, core::ptr::null_mut());
        // The host stage drains between ticks, as it would whenever the
        // CPU has nothing real-time to run.
        host::host_sti();
    }
    let observed = fixture.host_irq_count();
    if observed != 200 {
        return fail!("host should observe 200 ticks, saw {}", observed);
    }
    TestResult::Pass
}

// --- Periodic release grid ---------------------------------------------------

/// A periodic task releases exactly once per period, on the period
/// grid: `resume_time` advances by an exact multiple of the period per
/// release and every timer tick puts the task back on the ready queue.
pub fn test_periodic_task_releases_on_the_grid() -> TestResult {
    let fixture = ScenarioFixture::new();
    let base = fixture.base;
    let t = fixture.spawn(1);
    if task_make_periodic(t, base + SECOND, SECOND).is_err() {
        return fail!("make_periodic failed");
    }

    let mut wakes = 0u32;
    for k in 1..=5i64 {
        timer_isr(quartz_hal::timer::TIMER_IRQ, core::ptr::null_mut());
        let (ready, resume) = with_core(|core| {
            let task = &core.tasks[t.raw() as usize];
            (task.is_runnable(), task.resume_time)
        });
        if !ready {
            return fail!("task missed its release {}", k);
        }
        if resume != base + k * SECOND {
            return fail!("release {} off the grid: {} vs {}", k, resume, base + k * SECOND);
        }
        wakes += 1;

        // The task runs and parks for its next period.
        fixture.run_as(t);
        if task_wait_period().is_err() {
            return fail!("wait_period failed on release {}", k);
        }
        let delayed = with_core(|core| {
            core.tasks[t.raw() as usize].state.contains(TaskState::DELAYED)
        });
        if !delayed {
            return fail!("task must re-park after release {}", k);
        }
    }
    if wakes != 5 {
        return fail!("expected 5 releases, saw {}", wakes);
    }
    TestResult::Pass
}

// --- IRQ wakes task, host gets its share -------------------------------------

static WAKE_TARGET: AtomicU16 = AtomicU16::new(u16::MAX);
static RT_HITS: AtomicU64 = AtomicU64::new(0);

fn waking_handler(irq: u32, _cookie: *mut c_void) {
    RT_HITS.fetch_add(1, Ordering::Relaxed);
    let raw = WAKE_TARGET.load(Ordering::Relaxed);
    if raw != u16::MAX {
        let _ = task_resume(quartz_sched::task::TaskHandle::from_raw(raw));
    }
    host::propagate_irq(irq);
}

/// A device IRQ enters the real-time domain first, wakes the handler's
/// task, and only then reaches the host ISR, exactly once.
pub fn test_irq_wakes_task_then_reaches_host() -> TestResult {
    let fixture = ScenarioFixture::new();
    RT_HITS.store(0, Ordering::Relaxed);

    // A dormant task the IRQ handler will release.
    let t = match quartz_sched::api::task_init(crate::harness::dummy_entry, 0, 4096, 2, false, None)
    {
        Ok(t) => t,
        Err(_) => return fail!("task_init failed"),
    };
    WAKE_TARGET.store(t.raw(), Ordering::Relaxed);

    let rt = match host::rt_domain() {
        Some(id) => id,
        None => return fail!("rt domain missing"),
    };
    if pipeline::virtualize_irq_from(
        rt,
        7,
        Some(waking_handler),
        core::ptr::null_mut(),
        None,
        IrqMode::HANDLE,
    )
    .is_err()
    {
        return fail!("virtualize failed");
    }

    pipeline::dispatch_irq(7);

    if RT_HITS.load(Ordering::Relaxed) != 1 {
        return fail!("real-time handler must run exactly once");
    }
    if fixture.host_irq_count() != 1 {
        return fail!(
            "host ISR must run exactly once per assertion, saw {}",
            fixture.host_irq_count()
        );
    }
    let runnable = with_core(|core| core.tasks[t.raw() as usize].is_runnable());
    if !runnable {
        return fail!("the IRQ must have woken the task");
    }
    // A second assertion is again one-for-one.
    pipeline::dispatch_irq(7);
    if RT_HITS.load(Ordering::Relaxed) != 2 || fixture.host_irq_count() != 2 {
        return fail!("per-assertion delivery must stay one-for-one");
    }
    TestResult::Pass
}

// --- Destroy-while-waiting across the stack ----------------------------------

/// A waiter with a pending deadline sees DESTROYED (not TIMEOUT) when
/// the semaphore dies first, and the handle is dead afterwards.
pub fn test_destroy_beats_timeout() -> TestResult {
    let fixture = ScenarioFixture::new();
    let waiter = fixture.spawn(3);
    let sem = match quartz_ipc::sem_init(0) {
        Ok(s) => s,
        Err(_) => return fail!("sem_init failed"),
    };

    fixture.run_as(waiter);
    // Queue the waiter with a deadline two seconds out.
    let deadline = fixture.base + 2 * SECOND;
    let blocked = with_core(|core| {
        matches!(
            quartz_ipc::sem::wait_prepare(core, sem, 0, Some(deadline)),
            Ok(quartz_ipc::sem::Prepared::Blocked(_))
        )
    });
    if !blocked {
        return fail!("waiter should have blocked");
    }

    // Destruction happens before the deadline.
    if quartz_ipc::sem_delete(sem).is_err() {
        return fail!("sem_delete failed");
    }

    fixture.run_as(waiter);
    match with_core(|core| quartz_ipc::sem::wait_finish(core, sem, 0)) {
        Err(quartz_abi::RtError::Destroyed) => {}
        other => return fail!("expected DESTROYED, got {:?}", other),
    }
    let clean =
        with_core(|core| core.tasks[waiter.raw() as usize].blocked_on == quartz_sched::task::NO_SYNC);
    if !clean {
        return fail!("waiter leaked onto a queue");
    }
    match quartz_ipc::sem_count(sem) {
        Err(quartz_abi::RtError::InvalidArg) => TestResult::Pass,
        other => fail!("dead handle must be invalid, got {:?}", other),
    }
}

define_test_suite!(
    scenarios,
    [
        test_host_tick_recovery_over_200_periods,
        test_periodic_task_releases_on_the_grid,
        test_irq_wakes_task_then_reaches_host,
        test_destroy_beats_timeout,
    ]
);
