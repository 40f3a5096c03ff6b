//! The scheduling decision, the timer ISR, and the context-switch glue.
//!
//! Every event that can change the ready-queue head funnels into
//! [`schedule`]: wake-ups, priority changes, unlocks, explicit yields,
//! and the timer ISR. The decision re-reads the clock and re-drains the
//! timed queue first (anticipation), so a deadline that became due while
//! the event was being processed cannot be missed, then picks the ready
//! head and, in one-shot mode, programs the single hardware timer for
//! the earliest of the next task deadline, the running task's
//! round-robin yield point, and the host tick.
//!
//! The host OS is the permanent lowest-priority task, so "nothing to
//! do" and "run the host" are the same decision, and host ticks are
//! simulated by propagating its timer IRQ whenever `tick_time` crosses
//! `linux_time`.

use core::ffi::c_void;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use quartz_abi::error::RtResult;
use quartz_abi::task::{HOST_PRIORITY, MAX_CPUS, TaskState};
use quartz_abi::time::RTime;
use quartz_hal::clock;
use quartz_hal::timer;
use quartz_lib::{cpu as cpuflags, klog_error, klog_info, tsc};

use crate::switch::{self, FpuState, SwitchContext};
use crate::task::{NO_TASK, SchedCore, TaskId, with_core};

/// IPI vector requested from the host glue for remote reschedules.
pub const RESCHEDULE_IPI_VECTOR: u8 = 0xF1;

static SCHEDULER_ENABLED: AtomicBool = AtomicBool::new(false);

/// Test harnesses run without task stacks; this suppresses the actual
/// register switch while keeping every bookkeeping effect observable.
static SWITCH_SUPPRESSED: AtomicBool = AtomicBool::new(false);

/// Virtual IRQ used to kick the scheduler from another domain.
static SCHED_VIRQ: AtomicU32 = AtomicU32::new(u32::MAX);

pub fn set_scheduler_enabled(enabled: bool) {
    SCHEDULER_ENABLED.store(enabled, Ordering::Release);
}

pub fn is_scheduler_enabled() -> bool {
    SCHEDULER_ENABLED.load(Ordering::Acquire)
}

pub fn set_switch_suppressed(suppressed: bool) {
    SWITCH_SUPPRESSED.store(suppressed, Ordering::Release);
}

pub fn switch_is_suppressed() -> bool {
    SWITCH_SUPPRESSED.load(Ordering::Acquire)
}

/// What one scheduling decision concluded. Exposed so invariants (one
/// timer programming per decision, chosen head) are directly testable.
#[derive(Clone, Copy, Debug)]
pub struct Decision {
    pub next: TaskId,
    /// Effective absolute expiry programmed into the timer, if any.
    pub armed: Option<RTime>,
}

// --- Round-robin accounting --------------------------------------------------

fn rr_yield(core: &mut SchedCore, cpu: usize) {
    let cur = core.cpus[cpu].current;
    if cur == NO_TASK || core.tasks[cur as usize].policy <= 0 {
        return;
    }
    let tick_time = clock::with_times(cpu, |t| t.tick_time);
    let task = &mut core.tasks[cur as usize];
    task.rr_remaining = task.yield_time - tick_time;
    if task.rr_remaining <= 0 {
        task.rr_remaining = task.rr_quantum;
        if task.is_runnable() {
            core.rotate_within_class(cur);
        }
    }
}

fn rr_set_yield_time(core: &mut SchedCore, cpu: usize, next: TaskId) {
    let rt_time_h = core.cpus[cpu].rt_time_h;
    let task = &mut core.tasks[next as usize];
    if task.policy > 0 {
        task.yield_time = rt_time_h + task.rr_remaining;
    }
}

// --- The decision ------------------------------------------------------------

/// Run one scheduling decision on `cpu` at time `now` (native ticks).
/// Wakes due timed tasks, applies round-robin, reads the ready head,
/// and (one-shot mode) programs the timer at most once.
pub fn schedule_decision(core: &mut SchedCore, cpu: usize, now: RTime) -> Decision {
    core.cpus[cpu].sched_requested = true;
    rr_yield(core, cpu);

    if !core.cpus[cpu].oneshot_running {
        let next = core.ready_head(cpu);
        rr_set_yield_time(core, cpu, next);
        return Decision { next, armed: None };
    }

    // Anticipation: refresh the horizon from the clock and re-drain, so
    // a wake-up racing this decision is observed by it.
    core.cpus[cpu].rt_time_h = now + core.cpus[cpu].half_tick;
    let time_h = core.cpus[cpu].rt_time_h;
    core.wake_up_timed_tasks(cpu, time_h);

    let next = core.ready_head(cpu);
    let prio = core.tasks[next as usize].priority;
    rr_set_yield_time(core, cpu, next);

    let shot_fired = core.cpus[cpu].shot_fired;
    let mut intr_time = clock::with_times(cpu, |t| {
        if shot_fired {
            t.intr_time
        } else {
            t.intr_time + t.linux_tick
        }
    });

    let mut preempt = if core.tasks[next as usize].policy > 0 {
        if core.tasks[next as usize].yield_time < intr_time {
            intr_time = core.tasks[next as usize].yield_time;
        }
        true
    } else {
        false
    };

    // Earliest queued deadline that outranks the task about to run.
    let sentinel = core.host_of(cpu);
    let mut t = core.tasks[sentinel as usize].tq_next;
    while t != sentinel {
        let task = &core.tasks[t as usize];
        if task.priority <= prio && task.resume_time < intr_time {
            intr_time = task.resume_time;
            preempt = true;
            break;
        }
        t = task.tq_next;
    }

    let mut armed = None;
    if preempt || (!shot_fired && prio == HOST_PRIORITY) {
        core.cpus[cpu].shot_fired = true;
        let target = if preempt {
            clock::with_times(cpu, |times| {
                times.intr_time = intr_time;
                times.intr_time
            })
        } else {
            clock::with_times(cpu, |times| times.intr_time)
        };
        let effective = timer::arm_absolute(target, now);
        clock::with_times(cpu, |times| times.intr_time = effective);
        armed = Some(effective);
    }

    Decision { next, armed }
}

// --- Context switching -------------------------------------------------------

struct SwitchPlan {
    prev_ctx: *mut SwitchContext,
    next_ctx: *const SwitchContext,
    save_fpu: *mut FpuState,
    restore_fpu: *const FpuState,
    leaving_host: bool,
    entering_host: bool,
    cpu: usize,
    resume_signal: Option<fn()>,
}

fn prepare_switch(core: &mut SchedCore, cpu: usize, next: TaskId) -> SwitchPlan {
    let cur = core.cpus[cpu].current;
    let now = tsc::rdtsc() as RTime;

    if !core.tasks[cur as usize].is_host {
        core.tasks[cur as usize].exectime[0] += now - core.cpus[cpu].switch_time;
    }
    if core.tasks[next as usize].exectime[1] == 0 {
        core.tasks[next as usize].exectime[1] = now;
    }
    core.cpus[cpu].switch_time = now;
    core.cpus[cpu].switches += 1;

    let leaving_host = core.tasks[cur as usize].is_host;
    let entering_host = core.tasks[next as usize].is_host;

    let mut save_fpu: *mut FpuState = core::ptr::null_mut();
    let mut restore_fpu: *const FpuState = core::ptr::null();
    if core.tasks[next as usize].uses_fpu {
        let owner = core.cpus[cpu].fpu_owner;
        if owner != next {
            if owner != NO_TASK {
                save_fpu = &raw mut core.tasks[owner as usize].fpu;
            }
            restore_fpu = &raw const core.tasks[next as usize].fpu;
            core.cpus[cpu].fpu_owner = next;
        }
    }

    core.cpus[cpu].current = next;

    SwitchPlan {
        prev_ctx: &raw mut core.tasks[cur as usize].switch_ctx,
        next_ctx: &raw const core.tasks[next as usize].switch_ctx,
        save_fpu,
        restore_fpu,
        leaving_host,
        entering_host,
        cpu,
        // Runs when the suspended caller is eventually resumed.
        resume_signal: core.tasks[cur as usize].signal,
    }
}

/// Perform the hardware side of a prepared switch. Interrupts must be
/// disabled; control returns here when the suspended context resumes.
fn execute_switch(plan: SwitchPlan) {
    if SWITCH_SUPPRESSED.load(Ordering::Acquire) {
        return;
    }

    if plan.leaving_host {
        let saved = switch::save_cr0_and_clts();
        with_core(|core| core.cpus[plan.cpu].linux_cr0 = saved);
        quartz_lib::mark_cpu_realtime(plan.cpu, true);
    }

    // SAFETY: the plan's pointers target arena slots that outlive the
    // switch; FPU areas are 16-aligned by construction.
    unsafe {
        if !plan.save_fpu.is_null() {
            switch::save_fpenv(plan.save_fpu);
        }
        if !plan.restore_fpu.is_null() {
            switch::restore_fpenv(plan.restore_fpu);
        }
    }

    if plan.entering_host {
        let saved = with_core(|core| core.cpus[plan.cpu].linux_cr0);
        switch::restore_cr0(saved);
        quartz_lib::mark_cpu_realtime(plan.cpu, false);
        // The host stage may have work deferred while real-time tasks
        // ran; deliver it before the host resumes.
        quartz_hal::host::sync_host_stage();
    }

    // SAFETY: contexts are valid arena fields; interrupts are disabled.
    unsafe { switch::switch_registers(plan.prev_ctx, plan.next_ctx) };

    // Resumed. The signal handler contract is: runs in the resumed
    // task's context with interrupts still disabled.
    if let Some(signal) = plan.resume_signal {
        signal();
    }
}

/// The scheduling entry point for task context.
pub fn schedule() {
    let flags = cpuflags::save_flags_cli();
    let cpu = quartz_lib::current_cpu_id();
    let mut plan = None;
    let mut corrupt = false;

    with_core(|core| {
        if !core.initialized {
            return;
        }
        let now = clock::rt_get_time_cpu(cpu);
        let decision = schedule_decision(core, cpu, now);
        if !core.valid_task(decision.next) {
            corrupt = true;
            return;
        }
        if decision.next != core.cpus[cpu].current {
            plan = Some(prepare_switch(core, cpu, decision.next));
        }
    });

    if corrupt {
        freeze_realtime(cpu, "ready-queue head is not a live task");
    } else if let Some(plan) = plan {
        execute_switch(plan);
    }
    cpuflags::restore_flags(flags);
}

/// Reschedule the CPUs named in a bitmask: the local CPU synchronously
/// first, then remote CPUs by ascending id via IPI. Each remote CPU
/// re-reads its own ready queue in its IPI handler rather than trusting
/// the sender's view.
pub fn schedule_map(schedmap: u32) {
    if schedmap == 0 {
        return;
    }
    let cpu = quartz_lib::current_cpu_id();
    if schedmap & (1 << cpu) != 0 {
        schedule();
    }
    let mut rest = schedmap & !(1 << cpu);
    while rest != 0 {
        let target = rest.trailing_zeros() as usize;
        rest &= rest - 1;
        if quartz_lib::is_cpu_online(target) {
            quartz_lib::send_ipi_to_cpu(target, RESCHEDULE_IPI_VECTOR);
        }
    }
}

/// Reschedule for a single task's CPU.
pub fn schedule_for(core_cpu: usize) {
    schedule_map(1 << core_cpu);
}

// --- Timer ISR ---------------------------------------------------------------

/// Pipeline handler for the timer IRQ.
pub fn timer_isr(_irq: u32, _cookie: *mut c_void) {
    let flags = cpuflags::save_flags_cli();
    let cpu = quartz_lib::current_cpu_id();
    // Sampled before the lock below raises the count itself.
    let preempt_blocked = quartz_lib::is_preemption_disabled();
    let mut plan = None;
    let mut corrupt = false;

    with_core(|core| {
        if !core.initialized {
            return;
        }
        core.cpus[cpu].tick_count += 1;
        core.cpus[cpu].sched_requested = true;

        let oneshot = core.cpus[cpu].oneshot_running;
        let half_tick = core.cpus[cpu].half_tick;

        // The shot that fired is the tick we are processing.
        let (tick_time, host_tick_due) = clock::with_times(cpu, |t| {
            t.tick_time = t.intr_time;
            let due = t.tick_time >= t.linux_time;
            if due {
                t.linux_time += t.linux_tick;
            }
            (t.tick_time, due)
        });
        core.cpus[cpu].rt_time_h = tick_time + half_tick;

        if host_tick_due {
            // Keep the host wall clock monotonic no matter how long
            // real-time work owned the hardware timer.
            quartz_hal::host::propagate_irq(timer::TIMER_IRQ);
        }

        let time_h = core.cpus[cpu].rt_time_h;
        core.wake_up_timed_tasks(cpu, time_h);
        rr_yield(core, cpu);

        let next = core.ready_head(cpu);
        if !core.valid_task(next) {
            corrupt = true;
            return;
        }
        let prio = core.tasks[next as usize].priority;
        rr_set_yield_time(core, cpu, next);

        if oneshot {
            // The default next deadline is the coming host tick; record
            // it even when no shot gets armed below, so a later decision
            // arms from a live target instead of the tick just consumed.
            let mut intr_time = clock::with_times(cpu, |t| {
                t.intr_time = if t.linux_time > t.tick_time {
                    t.linux_time
                } else {
                    t.tick_time + t.linux_tick
                };
                t.intr_time
            });

            let mut preempt = if core.tasks[next as usize].policy > 0 {
                if core.tasks[next as usize].yield_time < intr_time {
                    intr_time = core.tasks[next as usize].yield_time;
                }
                true
            } else {
                core.cpus[cpu].preempt_always || prio == HOST_PRIORITY
            };

            let sentinel = core.host_of(cpu);
            let mut t = core.tasks[sentinel as usize].tq_next;
            while t != sentinel {
                let task = &core.tasks[t as usize];
                if task.priority <= prio && task.resume_time < intr_time {
                    intr_time = task.resume_time;
                    preempt = true;
                    break;
                }
                t = task.tq_next;
            }

            core.cpus[cpu].shot_fired = preempt;
            if preempt {
                let now = clock::rt_get_time_cpu(cpu);
                let effective = timer::arm_absolute(intr_time, now);
                clock::with_times(cpu, |times| times.intr_time = effective);
            }
        } else {
            clock::with_times(cpu, |t| t.intr_time += t.periodic_tick);
            timer::rt_set_timer_delay(0);
        }

        if next != core.cpus[cpu].current {
            if preempt_blocked {
                // The decision replays when the outermost guard drops.
                quartz_lib::PreemptGuard::set_reschedule_pending();
            } else {
                if !core.tasks[core.cpus[cpu].current as usize].is_host {
                    core.cpus[cpu].preemptions += 1;
                }
                plan = Some(prepare_switch(core, cpu, next));
            }
        }
    });

    if corrupt {
        freeze_realtime(cpu, "ready-queue head is not a live task");
    } else if let Some(plan) = plan {
        execute_switch(plan);
    }
    cpuflags::restore_flags(flags);
}

/// Pipeline handler for the scheduler virq and the reschedule IPI.
pub fn reschedule_entry(_irq: u32, _cookie: *mut c_void) {
    schedule();
}

// --- Timer start/stop --------------------------------------------------------

/// Start the real-time timer. In periodic mode `period_counts` is the
/// reload period in timer counts; one-shot mode ignores it. Also routes
/// the timer IRQ and the scheduler virq through the real-time domain.
pub fn start_rt_timer(period_counts: RTime) -> RtResult<RTime> {
    let rt_domain = quartz_hal::host::install_rt_domain()?;

    let virq = quartz_hal::pipeline::alloc_virq()?;
    quartz_hal::pipeline::virtualize_irq_from(
        rt_domain,
        virq,
        Some(reschedule_entry),
        core::ptr::null_mut(),
        None,
        quartz_hal::pipeline::IrqMode::HANDLE,
    )?;
    SCHED_VIRQ.store(virq, Ordering::Release);

    let period = timer::rt_request_timer(timer_isr, period_counts, rt_domain)?;

    let tuned = clock::tuned();
    with_core(|core| {
        if !core.initialized {
            core.init();
        }
        for cpu in 0..MAX_CPUS {
            let oneshot = clock::is_oneshot(cpu);
            core.cpus[cpu].oneshot_running = oneshot;
            core.cpus[cpu].shot_fired = oneshot;
            core.cpus[cpu].half_tick = if oneshot {
                (tuned.latency as RTime + 1) >> 1
            } else {
                (clock::with_times(cpu, |t| t.periodic_tick) + 1) >> 1
            };
            let half = core.cpus[cpu].half_tick;
            core.cpus[cpu].rt_time_h = clock::with_times(cpu, |t| t.tick_time) + half;
        }
    });

    set_scheduler_enabled(true);
    klog_info!("SCHED: timer running, period {} counts", period);
    Ok(period)
}

pub fn stop_rt_timer() {
    set_scheduler_enabled(false);
    timer::stop_timer();
    let virq = SCHED_VIRQ.swap(u32::MAX, Ordering::AcqRel);
    if virq != u32::MAX {
        if let Some(rt) = quartz_hal::host::rt_domain() {
            let _ = quartz_hal::pipeline::release_irq(rt, virq);
        }
        let _ = quartz_hal::pipeline::free_virq(virq);
    }
    with_core(|core| {
        for cpu in 0..MAX_CPUS {
            core.cpus[cpu].oneshot_running = false;
            core.cpus[cpu].shot_fired = false;
        }
    });
    klog_info!("SCHED: timer stopped");
}

/// Watchdog escalation invoked by the pipeline when a real-time handler
/// exceeds its latency budget: promote the registered watchdog task to
/// the highest priority and ask for a decision.
pub fn watchdog_kick(cpu: usize, irq: u32) {
    let boosted = with_core(|core| {
        let wd = core.watchdog[cpu.min(MAX_CPUS - 1)];
        if wd == NO_TASK || !core.valid_task(wd) {
            return false;
        }
        core.tasks[wd as usize].base_priority = quartz_abi::task::HIGHEST_PRIORITY;
        core.renq_ready_task(wd, quartz_abi::task::HIGHEST_PRIORITY);
        if core.tasks[wd as usize].state.contains(TaskState::SUSPENDED) {
            core.tasks[wd as usize].suspdepth = 0;
            core.tasks[wd as usize].state.remove(TaskState::SUSPENDED);
            if core.tasks[wd as usize].is_runnable() {
                core.enq_ready_task(wd);
            }
        }
        true
    });
    if boosted {
        klog_error!("SCHED: watchdog fired for IRQ {} on cpu {}", irq, cpu);
        schedule();
    }
}

// --- Fatal path --------------------------------------------------------------

/// Ready-queue linkage corruption or a trap inside the scheduler:
/// freeze real-time activity and drop this CPU back to the host.
pub fn freeze_realtime(cpu: usize, reason: &str) {
    klog_error!("SCHED: fatal on cpu {}: {}, freezing real-time", cpu, reason);
    set_scheduler_enabled(false);
    timer::stop_timer();
    with_core(|core| {
        let host = core.host_of(cpu);
        core.cpus[cpu].current = host;
        core.cpus[cpu].oneshot_running = false;
    });
    quartz_lib::mark_cpu_realtime(cpu, false);
    quartz_hal::host::host_sti();
}

/// Validate ready-queue linkage from the sentinel; the decision's
/// anticipation step calls this cheaply in debug flows and the fatal
/// path on failure.
pub fn verify_ready_queue(core: &SchedCore, cpu: usize) -> bool {
    let sentinel = core.host_of(cpu);
    let mut seen = 0;
    let mut t = core.tasks[sentinel as usize].rq_next;
    let mut last_prio = i32::MIN;
    while t != sentinel {
        if !core.valid_task(t) {
            return false;
        }
        let prio = core.tasks[t as usize].priority;
        if prio < last_prio {
            return false;
        }
        last_prio = prio;
        seen += 1;
        if seen > quartz_abi::task::MAX_TASKS {
            return false;
        }
        t = core.tasks[t as usize].rq_next;
    }
    true
}
