//! Task-facing scheduler services.
//!
//! Every entry validates its handle against the arena magic, mutates
//! state under the scheduler lock, and runs the scheduling decision
//! *after* the lock is released, usually through a CPU bitmask collected
//! while mutating. Blocking operations park the caller on a queue under
//! the lock and then call [`schedule`], which switches away until the
//! wake condition re-enqueues the task.

use quartz_abi::RtError;
use quartz_abi::error::RtResult;
use quartz_abi::task::{HIGHEST_PRIORITY, HOST_PRIORITY, LOWEST_PRIORITY, MAX_CPUS, TaskState};
use quartz_abi::time::{RT_TIME_END, RTime};
use quartz_hal::clock;
use quartz_lib::{klog_warn, tsc};

use crate::scheduler::{schedule, schedule_map, watchdog_kick};
use crate::registry;
use crate::switch::SwitchContext;
use crate::task::{
    NO_SYNC, NO_TASK, RT_TASK_MAGIC, SchedCore, TaskEntry, TaskHandle, TaskId, with_core,
};

// --- Creation and deletion ---------------------------------------------------

/// Create a task in the dormant state: suspended once, entry recorded,
/// stack allocated, not yet eligible to run. `task_start` (or
/// `task_resume`, or `task_make_periodic`) releases it.
pub fn task_init(
    entry: TaskEntry,
    arg: usize,
    stack_size: usize,
    priority: i32,
    uses_fpu: bool,
    signal: Option<fn()>,
) -> RtResult<TaskHandle> {
    let cpu = with_core(min_tasks_cpu);
    task_init_cpu(entry, arg, stack_size, priority, uses_fpu, signal, cpu)
}

/// As `task_init`, pinned to a CPU.
pub fn task_init_cpu(
    entry: TaskEntry,
    arg: usize,
    stack_size: usize,
    priority: i32,
    uses_fpu: bool,
    signal: Option<fn()>,
    cpu: usize,
) -> RtResult<TaskHandle> {
    if cpu >= MAX_CPUS || !(0..=LOWEST_PRIORITY).contains(&priority) {
        return Err(RtError::InvalidArg);
    }

    let stack_size = if stack_size == 0 {
        quartz_abi::config::STACK_DEFAULT_SIZE
    } else {
        stack_size
    };
    let stack = quartz_mm::alloc_stack(stack_size);
    if stack.is_null() {
        return Err(RtError::NoResource);
    }

    let result = with_core(|core| {
        if !core.initialized {
            return Err(RtError::NoResource);
        }
        // Highest priority is reserved while a watchdog is registered.
        if priority == HIGHEST_PRIORITY && core.watchdog[cpu] != NO_TASK {
            return Err(RtError::Busy);
        }
        let tid = core.alloc_task_slot().ok_or(RtError::NoResource)?;

        let stack_top = (stack as u64 + stack_size as u64) & !0xF;
        let task = core.task_mut(tid);
        task.magic = RT_TASK_MAGIC;
        task.state = TaskState::SUSPENDED | TaskState::READY;
        task.suspdepth = 1;
        task.priority = priority;
        task.base_priority = priority;
        task.policy = 0;
        task.period = 0;
        task.resume_time = RT_TIME_END;
        task.uses_fpu = uses_fpu;
        task.runnable_on_cpu = cpu as u8;
        task.affinity = 1 << cpu;
        task.entry = Some(entry);
        task.entry_arg = arg;
        task.stack_base = stack;
        task.stack_size = stack_size;
        task.signal = signal;
        task.overruns = 0;
        task.switch_ctx = SwitchContext::new_for_task(entry as usize as u64, arg as u64, stack_top);
        core.cpus[cpu].task_count += 1;
        Ok(TaskHandle(tid))
    });

    if result.is_err() {
        quartz_mm::rt_free(stack);
    }
    result
}

/// Release a dormant task into the ready queue.
pub fn task_start(handle: TaskHandle) -> RtResult<()> {
    task_resume(handle)
}

/// Delete a task. Immediate for the caller itself or a task owning no
/// resources; otherwise the deletion is parked in `suspdepth` and runs
/// when the last owned resource is released.
pub fn task_delete(handle: TaskHandle) -> RtResult<()> {
    let tid = handle.0;
    let map = with_core(|core| -> RtResult<u32> {
        if !core.valid_task(tid) || core.tasks[tid as usize].is_host {
            return Err(RtError::InvalidArg);
        }
        let cpu = quartz_lib::current_cpu_id();
        let cur = core.cpus[cpu].current;
        let immediate = core.tasks[tid as usize].owndres == 0
            || tid == cur
            || core.tasks[cur as usize].priority == HOST_PRIORITY;
        if immediate {
            Ok(task_delete_inner(core, tid))
        } else {
            core.tasks[tid as usize].suspdepth = i32::MIN;
            Ok(0)
        }
    })?;
    schedule_map(map);
    Ok(())
}

/// The actual destructor; runs with the core lock held. Returns a CPU
/// bitmask needing a decision (always including the victim's CPU).
pub fn task_delete_inner(core: &mut SchedCore, tid: TaskId) -> u32 {
    let cpu = core.tasks[tid as usize].runnable_on_cpu as usize;
    let map = 1u32 << cpu;

    if let Some(hook) = core.tasks[tid as usize].exit_hook {
        hook(tid);
    }

    core.rem_timed_task(tid);

    // A deleted waiter must repair the semaphore count it decremented.
    let sync = core.tasks[tid as usize].blocked_on;
    if sync != NO_SYNC {
        core.dequeue_blocked(tid);
        if core.tasks[tid as usize].state.contains(TaskState::SEMAPHORE) {
            let slot = &mut core.syncs[sync as usize];
            slot.count += 1;
            if slot.stype != 0 && slot.count > 1 {
                slot.count = 1;
            }
        }
    }

    core.rem_ready_task(tid);

    if core.cpus[cpu].fpu_owner == tid {
        core.cpus[cpu].fpu_owner = core.host_of(cpu);
    }

    if core.tasks[tid as usize].name != 0 {
        registry::drop_name_inner(core.tasks[tid as usize].name);
    }

    // The stack may be live under the victim; park it for the deferred
    // drain that runs outside real-time context.
    quartz_mm::defer_free_stack(core.tasks[tid as usize].stack_base);

    let task = core.task_mut(tid);
    task.magic = 0;
    task.state = TaskState::empty();
    task.stack_base = core::ptr::null_mut();
    core.cpus[cpu].task_count = core.cpus[cpu].task_count.saturating_sub(1);
    map
}

/// Trampoline landing point: a task whose entry function returned.
pub extern "C" fn task_exit_current() {
    let cpu = quartz_lib::current_cpu_id();
    let me = with_core(|core| core.cpus[cpu].current);
    if me != NO_TASK {
        let _ = task_delete(TaskHandle(me));
    }
    // Deleting self switches away and never resumes; reaching this loop
    // means the switch was suppressed by a harness.
    loop {
        if crate::scheduler::switch_is_suppressed() {
            return;
        }
        quartz_lib::cpu::halt();
    }
}

// --- Suspension and resumption -----------------------------------------------

/// Suspend a task (or the caller when `handle` is the current task).
/// Nested suspends stack; a task owning resources only records the
/// suspension, which materializes when the last resource is released.
pub fn task_suspend(handle: TaskHandle) -> RtResult<()> {
    let tid = handle.0;
    let mut self_suspended = false;
    with_core(|core| -> RtResult<()> {
        if !core.valid_task(tid) || core.tasks[tid as usize].is_host {
            return Err(RtError::InvalidArg);
        }
        let depth = core.tasks[tid as usize].suspdepth;
        core.tasks[tid as usize].suspdepth = depth + 1;
        if depth == 0 && core.tasks[tid as usize].owndres == 0 {
            core.rem_ready_task(tid);
            core.tasks[tid as usize].state.insert(TaskState::SUSPENDED);
            let cpu = quartz_lib::current_cpu_id();
            self_suspended = tid == core.cpus[cpu].current;
        }
        Ok(())
    })?;
    if self_suspended {
        schedule();
    }
    Ok(())
}

pub fn task_resume(handle: TaskHandle) -> RtResult<()> {
    let tid = handle.0;
    let map = with_core(|core| -> RtResult<u32> {
        if !core.valid_task(tid) {
            return Err(RtError::InvalidArg);
        }
        core.tasks[tid as usize].suspdepth -= 1;
        if core.tasks[tid as usize].suspdepth != 0 {
            return Ok(0);
        }
        core.rem_timed_task(tid);
        let task = &mut core.tasks[tid as usize];
        task.state.remove(TaskState::SUSPENDED);
        if task.is_runnable() {
            let cpu = task.runnable_on_cpu as u32;
            core.enq_ready_task(tid);
            return Ok(1 << cpu);
        }
        Ok(0)
    })?;
    schedule_map(map);
    Ok(())
}

/// Move behind equal-priority peers and re-decide. Equal-priority tasks
/// never preempt each other; this is the cooperative slice boundary.
pub fn task_yield() {
    let rotated = with_core(|core| {
        let cpu = quartz_lib::current_cpu_id();
        let cur = core.cpus[cpu].current;
        cur != NO_TASK && core.rotate_within_class(cur)
    });
    if rotated {
        schedule();
    }
}

// --- Priorities --------------------------------------------------------------

pub fn get_prio(handle: TaskHandle) -> RtResult<i32> {
    with_core(|core| {
        if core.valid_task(handle.0) {
            Ok(core.tasks[handle.0 as usize].base_priority)
        } else {
            Err(RtError::InvalidArg)
        }
    })
}

pub fn get_inher_prio(handle: TaskHandle) -> RtResult<i32> {
    with_core(|core| {
        if core.valid_task(handle.0) {
            Ok(core.tasks[handle.0 as usize].priority)
        } else {
            Err(RtError::InvalidArg)
        }
    })
}

/// Change a task's base priority, pushing a raised priority through the
/// inheritance chain. Returns the previous base priority. Re-applying
/// the current value rotates the task behind its priority peers.
pub fn change_prio(handle: TaskHandle, priority: i32) -> RtResult<i32> {
    let tid = handle.0;
    if !(0..=LOWEST_PRIORITY).contains(&priority) {
        return Err(RtError::InvalidArg);
    }
    let (old, map) = with_core(|core| -> RtResult<(i32, u32)> {
        if !core.valid_task(tid) || core.tasks[tid as usize].is_host {
            return Err(RtError::InvalidArg);
        }
        let old = core.tasks[tid as usize].base_priority;
        core.tasks[tid as usize].base_priority = priority;

        if priority == old && priority == core.tasks[tid as usize].priority {
            let rotated = core.rotate_within_class(tid);
            let cpu = core.tasks[tid as usize].runnable_on_cpu as u32;
            return Ok((old, if rotated { 1 << cpu } else { 0 }));
        }

        let mut map = 0u32;
        if priority < core.tasks[tid as usize].priority {
            // Raise: walk the chain this task has passed priority to.
            let mut walk = tid;
            loop {
                core.tasks[walk as usize].priority = priority;
                if core.tasks[walk as usize].is_runnable() {
                    core.rem_ready_current(walk);
                    core.enq_ready_task(walk);
                    map |= 1 << core.tasks[walk as usize].runnable_on_cpu;
                } else if core.tasks[walk as usize].blocked_on != NO_SYNC {
                    core.requeue_blocked(walk);
                    map |= 1 << core.tasks[walk as usize].runnable_on_cpu;
                }
                let next = core.tasks[walk as usize].prio_passed_to;
                if next == NO_TASK || core.tasks[next as usize].priority <= priority {
                    break;
                }
                walk = next;
            }
        } else if core.tasks[tid as usize].owndres == 0 {
            // Lower: takes effect immediately only without inheritance.
            if core.renq_ready_task(tid, priority) {
                map |= 1 << core.tasks[tid as usize].runnable_on_cpu;
            }
        }
        Ok((old, map))
    })?;
    schedule_map(map);
    Ok(old)
}

// --- Sleeping and periodic execution -----------------------------------------

fn block_current_delayed(core: &mut SchedCore, cpu: usize, resume_time: RTime) -> bool {
    let cur = core.cpus[cpu].current;
    if cur == NO_TASK || core.tasks[cur as usize].is_host {
        return false;
    }
    if resume_time <= core.cpus[cpu].rt_time_h {
        // Too near: the caller is effectively already due.
        return false;
    }
    core.tasks[cur as usize].resume_time = resume_time;
    core.tasks[cur as usize].state.insert(TaskState::DELAYED);
    core.rem_ready_current(cur);
    core.enq_timed_task(cur);
    true
}

/// Sleep for `delay` native ticks.
pub fn sleep(delay: RTime) -> RtResult<()> {
    let cpu = quartz_lib::current_cpu_id();
    let blocked = with_core(|core| {
        let now = clock::rt_get_time_cpu(cpu);
        block_current_delayed(core, cpu, now + delay)
    });
    if blocked {
        schedule();
    }
    Ok(())
}

/// Sleep until the absolute tick `time`. Already-past deadlines return
/// immediately.
pub fn sleep_until(time: RTime) -> RtResult<()> {
    let cpu = quartz_lib::current_cpu_id();
    let blocked = with_core(|core| block_current_delayed(core, cpu, time));
    if blocked {
        schedule();
    }
    Ok(())
}

/// Burn cycles without yielding the CPU; for sub-scheduling-quantum
/// synchronization delays only.
pub fn busy_sleep(ns: i64) {
    let tuned = clock::tuned();
    if tuned.cpu_freq == 0 {
        return;
    }
    let end = tsc::rdtsc() as i64 + quartz_lib::llimd(ns, tuned.cpu_freq as u32, 1_000_000_000);
    while (tsc::rdtsc() as i64) < end {
        core::hint::spin_loop();
    }
}

/// POSIX-shaped sleep: INTERRUPTED when an explicit unblock cut the
/// sleep short.
pub fn nanosleep(ns: i64) -> RtResult<()> {
    if ns < 0 {
        return Err(RtError::InvalidArg);
    }
    let cpu = quartz_lib::current_cpu_id();
    let expire = clock::rt_get_time_cpu(cpu) + clock::nano2count_cpu(ns, cpu);
    sleep_until(expire)?;
    let interrupted = with_core(|core| {
        let cur = core.cpus[cpu].current;
        cur != NO_TASK && core.tasks[cur as usize].unblocked
    });
    if interrupted {
        with_core(|core| {
            let cur = core.cpus[cpu].current;
            core.tasks[cur as usize].unblocked = false;
        });
        return Err(RtError::Interrupted);
    }
    Ok(())
}

/// Mark a task periodic: first release at absolute `start_time`, then
/// every `period` ticks on `wait_period`. A zero `start_time` means
/// "one period from now".
pub fn task_make_periodic(handle: TaskHandle, start_time: RTime, period: RTime) -> RtResult<()> {
    let tid = handle.0;
    if period < 0 {
        return Err(RtError::InvalidArg);
    }
    let map = with_core(|core| -> RtResult<u32> {
        if !core.valid_task(tid) || core.tasks[tid as usize].is_host {
            return Err(RtError::InvalidArg);
        }
        let cpu = core.tasks[tid as usize].runnable_on_cpu as usize;
        let start = if start_time == 0 && period > 0 {
            clock::rt_get_time_cpu(cpu) + period
        } else {
            start_time
        };
        core.tasks[tid as usize].resume_time = start;
        core.tasks[tid as usize].period = period;
        core.tasks[tid as usize].suspdepth = 0;
        if !core.tasks[tid as usize].state.contains(TaskState::DELAYED) {
            core.rem_ready_task(tid);
            let task = &mut core.tasks[tid as usize];
            task.state.remove(TaskState::SUSPENDED);
            task.state.insert(TaskState::DELAYED);
            core.enq_timed_task(tid);
        }
        Ok(1 << cpu)
    })?;
    schedule_map(map);
    Ok(())
}

/// As `task_make_periodic` with a relative start and nanosecond units.
pub fn task_make_periodic_relative_ns(
    handle: TaskHandle,
    start_delay_ns: RTime,
    period_ns: RTime,
) -> RtResult<()> {
    let cpu = with_core(|core| {
        if core.valid_task(handle.0) {
            core.tasks[handle.0 as usize].runnable_on_cpu as usize
        } else {
            quartz_lib::current_cpu_id()
        }
    });
    let start = clock::rt_get_time_cpu(cpu) + clock::nano2count_cpu(start_delay_ns, cpu);
    let period = clock::nano2count_cpu(period_ns, cpu);
    task_make_periodic(handle, start, period)
}

/// Block until the next release point. When the caller is already past
/// it, the release points missed are added to the overrun counter, the
/// resume time is realigned past now (staying on the period grid), and
/// OVERRUN is returned without blocking.
pub fn task_wait_period() -> RtResult<()> {
    let cpu = quartz_lib::current_cpu_id();
    enum Outcome {
        Blocked,
        Resynced,
        Overrun,
        NotPeriodic,
    }
    let outcome = with_core(|core| {
        let cur = core.cpus[cpu].current;
        if cur == NO_TASK || core.tasks[cur as usize].is_host {
            return Outcome::NotPeriodic;
        }
        if core.tasks[cur as usize].period == 0 {
            return Outcome::NotPeriodic;
        }
        if core.tasks[cur as usize].resync_frame {
            // Watchdog-requested realignment to the present.
            core.tasks[cur as usize].resync_frame = false;
            core.tasks[cur as usize].resume_time = clock::rt_get_time_cpu(cpu);
            return Outcome::Resynced;
        }
        let period = core.tasks[cur as usize].period;
        let next = core.tasks[cur as usize].resume_time + period;
        let time_h = core.cpus[cpu].rt_time_h;
        if next > time_h {
            core.tasks[cur as usize].resume_time = next;
            core.tasks[cur as usize].state.insert(TaskState::DELAYED);
            core.rem_ready_current(cur);
            core.enq_timed_task(cur);
            Outcome::Blocked
        } else {
            // Late: advance by whole periods until the grid point is in
            // the future again, counting each one missed.
            let missed = (time_h - next) / period + 1;
            core.tasks[cur as usize].overruns += missed as u32;
            core.tasks[cur as usize].resume_time = next + missed * period;
            Outcome::Overrun
        }
    });
    match outcome {
        Outcome::Blocked => {
            schedule();
            Ok(())
        }
        Outcome::Resynced => Ok(()),
        Outcome::Overrun => Err(RtError::Overrun),
        Outcome::NotPeriodic => Err(RtError::InvalidArg),
    }
}

/// The absolute time of the caller's next release point.
pub fn next_period() -> RTime {
    let cpu = quartz_lib::current_cpu_id();
    with_core(|core| {
        let cur = core.cpus[cpu].current;
        if cur == NO_TASK {
            return 0;
        }
        core.tasks[cur as usize].resume_time + core.tasks[cur as usize].period
    })
}

pub fn set_period(handle: TaskHandle, period: RTime) -> RtResult<()> {
    with_core(|core| {
        if !core.valid_task(handle.0) || period < 0 {
            return Err(RtError::InvalidArg);
        }
        core.tasks[handle.0 as usize].period = period;
        Ok(())
    })
}

/// Move a delayed task's resume time. Succeeds only when the new time
/// sorts past the task's current timed-queue successor; anything else
/// reports TIMEOUT and leaves the queue untouched. (Deliberately not
/// "always re-sort": callers depend on the cheap forward-only move.)
pub fn set_resume_time(handle: TaskHandle, new_time: RTime) -> RtResult<()> {
    with_core(|core| {
        let tid = handle.0;
        if !core.valid_task(tid) {
            return Err(RtError::InvalidArg);
        }
        if !core.tasks[tid as usize].state.contains(TaskState::DELAYED) {
            return Err(RtError::Timeout);
        }
        let succ = core.tasks[tid as usize].tq_next;
        core.tasks[tid as usize].resume_time = new_time;
        if succ != NO_TASK && new_time > core.tasks[succ as usize].resume_time {
            core.rem_timed_task(tid);
            core.enq_timed_task(tid);
            return Ok(());
        }
        Err(RtError::Timeout)
    })
}

/// Force a delayed task ready ahead of its resume time.
pub fn task_wakeup_sleeping(handle: TaskHandle) -> RtResult<()> {
    let tid = handle.0;
    let map = with_core(|core| -> RtResult<u32> {
        if !core.valid_task(tid) {
            return Err(RtError::InvalidArg);
        }
        core.rem_timed_task(tid);
        let task = &mut core.tasks[tid as usize];
        if task.is_runnable() {
            return Ok(0);
        }
        task.state.remove(TaskState::DELAYED);
        if task.is_runnable() {
            let cpu = task.runnable_on_cpu as u32;
            core.enq_ready_task(tid);
            return Ok(1 << cpu);
        }
        Ok(0)
    })?;
    schedule_map(map);
    Ok(())
}

/// Pull a task out of any blocking state; the interrupted wait reports
/// INTERRUPTED to its caller.
pub fn task_unblock(handle: TaskHandle) -> RtResult<()> {
    let tid = handle.0;
    let map = with_core(|core| -> RtResult<u32> {
        if !core.valid_task(tid) {
            return Err(RtError::InvalidArg);
        }
        if core.tasks[tid as usize].is_runnable() {
            return Ok(0);
        }
        core.rem_timed_task(tid);
        if core.tasks[tid as usize].blocked_on != NO_SYNC {
            // Undo the waiter's count decrement, as a timeout would.
            let sync = core.tasks[tid as usize].blocked_on;
            core.dequeue_blocked(tid);
            let slot = &mut core.syncs[sync as usize];
            slot.count += 1;
            if slot.stype != 0 && slot.count > 1 {
                slot.count = 1;
            }
        }
        let task = &mut core.tasks[tid as usize];
        task.unblocked = true;
        task.state.remove(TaskState::DELAYED | TaskState::SEMAPHORE);
        if task.is_runnable() {
            let cpu = task.runnable_on_cpu as u32;
            core.enq_ready_task(tid);
            return Ok(1 << cpu);
        }
        Ok(0)
    })?;
    schedule_map(map);
    Ok(())
}

// --- Policy, FPU, callbacks --------------------------------------------------

/// Select FIFO (the default) or round-robin with the given quantum; a
/// zero or out-of-range quantum falls back to one host tick.
pub fn set_sched_policy(handle: TaskHandle, policy: i32, rr_quantum_ns: i64) -> RtResult<()> {
    with_core(|core| {
        let tid = handle.0;
        if !core.valid_task(tid) || !(0..=1).contains(&policy) {
            return Err(RtError::InvalidArg);
        }
        let cpu = core.tasks[tid as usize].runnable_on_cpu as usize;
        core.tasks[tid as usize].policy = policy;
        if policy > 0 {
            let mut quantum = clock::nano2count_cpu(rr_quantum_ns, cpu);
            if quantum <= 0 || quantum > u32::MAX as i64 {
                quantum = clock::with_times(cpu, |t| t.linux_tick).max(1);
            }
            let task = &mut core.tasks[tid as usize];
            task.rr_quantum = quantum;
            task.rr_remaining = quantum;
            task.yield_time = 0;
        }
        Ok(())
    })
}

pub fn task_use_fpu(handle: TaskHandle, use_fpu: bool) -> RtResult<()> {
    with_core(|core| {
        if !core.valid_task(handle.0) {
            return Err(RtError::InvalidArg);
        }
        core.tasks[handle.0 as usize].uses_fpu = use_fpu;
        Ok(())
    })
}

/// Whether host-task switches carry an FPU context.
pub fn linux_use_fpu(use_fpu: bool) {
    with_core(|core| {
        for cpu in 0..MAX_CPUS {
            let host = core.host_of(cpu);
            core.tasks[host as usize].uses_fpu = use_fpu;
        }
    });
}

pub fn task_signal_handler(handle: TaskHandle, handler: Option<fn()>) -> RtResult<()> {
    with_core(|core| {
        if !core.valid_task(handle.0) {
            return Err(RtError::InvalidArg);
        }
        core.tasks[handle.0 as usize].signal = handler;
        Ok(())
    })
}

pub fn set_exit_hook(handle: TaskHandle, hook: Option<fn(TaskId)>) -> RtResult<()> {
    with_core(|core| {
        if !core.valid_task(handle.0) {
            return Err(RtError::InvalidArg);
        }
        core.tasks[handle.0 as usize].exit_hook = hook;
        Ok(())
    })
}

/// Install a per-task trap override; returns the previous one.
pub fn set_task_trap_handler(
    handle: TaskHandle,
    vector: u32,
    handler: Option<crate::task::TrapHandler>,
) -> RtResult<Option<crate::task::TrapHandler>> {
    with_core(|core| {
        if !core.valid_task(handle.0) || vector as usize >= crate::task::NR_TRAPS {
            return Err(RtError::InvalidArg);
        }
        let slot = &mut core.tasks[handle.0 as usize].trap_handlers[vector as usize];
        Ok(core::mem::replace(slot, handler))
    })
}

/// Trap entry for the current task: its override first, else the
/// default of suspending and deleting the offender.
pub fn trap_entry(vector: u32) -> bool {
    let cpu = quartz_lib::current_cpu_id();
    let (cur, handler) = with_core(|core| {
        let cur = core.cpus[cpu].current;
        if cur == NO_TASK || !core.valid_task(cur) {
            return (NO_TASK, None);
        }
        let handler = if (vector as usize) < crate::task::NR_TRAPS {
            core.tasks[cur as usize].trap_handlers[vector as usize]
        } else {
            None
        };
        (cur, handler)
    });
    if cur == NO_TASK {
        return false;
    }
    if let Some(handler) = handler {
        return handler(vector, cur);
    }
    klog_warn!("SCHED: trap {} in task {}, suspending and deleting", vector, cur);
    let _ = task_suspend(TaskHandle(cur));
    let _ = task_delete(TaskHandle(cur));
    true
}

// --- Scheduler lock ----------------------------------------------------------

/// Enter a scheduler-locked section: the caller's effective priority
/// goes negative, which pins it at the ready-queue head, so wake-ups
/// accumulate without preempting. Nests.
pub fn sched_lock() {
    with_core(|core| {
        let cpu = quartz_lib::current_cpu_id();
        let cur = core.cpus[cpu].current;
        if cur == NO_TASK {
            return;
        }
        if core.tasks[cur as usize].priority >= 0 {
            core.tasks[cur as usize].sched_lock_priority = core.tasks[cur as usize].priority;
            core.tasks[cur as usize].priority = -1;
            core.cpus[cpu].sched_requested = false;
        } else {
            core.tasks[cur as usize].priority -= 1;
        }
    });
}

/// Leave a scheduler-locked section; the outermost unlock restores the
/// real priority and replays any decision requested meanwhile.
pub fn sched_unlock() {
    let replay = with_core(|core| {
        let cpu = quartz_lib::current_cpu_id();
        let cur = core.cpus[cpu].current;
        if cur == NO_TASK || core.tasks[cur as usize].priority >= 0 {
            return false;
        }
        core.tasks[cur as usize].priority += 1;
        if core.tasks[cur as usize].priority != 0 {
            return false;
        }
        let restored = core.tasks[cur as usize].sched_lock_priority;
        core.tasks[cur as usize].priority = restored;
        if restored != HOST_PRIORITY {
            core.rem_ready_current(cur);
            core.enq_ready_task(cur);
        }
        core.cpus[cpu].sched_requested
    });
    if replay {
        schedule();
    }
}

// --- Rate-monotonic priority assignment --------------------------------------

/// Reassign base priorities on a CPU by ascending period: the classic
/// rate-monotonic ordering for the periodic task set. Aperiodic tasks
/// keep their priorities.
pub fn spv_rms(cpu: usize) -> RtResult<()> {
    if cpu >= MAX_CPUS {
        return Err(RtError::InvalidArg);
    }
    let map = with_core(|core| {
        let mut assigned = [NO_TASK; quartz_abi::task::MAX_TASKS];
        let mut n = 0usize;

        loop {
            let mut best = NO_TASK;
            let mut best_period = RT_TIME_END;
            for tid in 0..quartz_abi::task::MAX_TASKS as TaskId {
                let task = &core.tasks[tid as usize];
                if !task.is_live()
                    || task.is_host
                    || task.runnable_on_cpu as usize != cpu
                    || task.period == 0
                {
                    continue;
                }
                if assigned[..n].contains(&tid) {
                    continue;
                }
                if task.period < best_period {
                    best_period = task.period;
                    best = tid;
                }
            }
            if best == NO_TASK {
                break;
            }
            core.tasks[best as usize].base_priority = n as i32;
            assigned[n] = best;
            n += 1;
        }

        let mut map = 0u32;
        for &tid in &assigned[..n] {
            let base = core.tasks[tid as usize].base_priority;
            if core.renq_ready_task(tid, base) {
                map |= 1 << core.tasks[tid as usize].runnable_on_cpu;
            }
        }
        map
    });
    schedule_map(map);
    Ok(())
}

// --- Migration ---------------------------------------------------------------

/// Explicitly migrate a task to another CPU. If the source and target
/// run different timer modes, the task's resume time and period are
/// rebased between tick units. Refused for the running task.
pub fn set_runnable_on_cpu(handle: TaskHandle, target_cpu: usize) -> RtResult<()> {
    let tid = handle.0;
    if target_cpu >= MAX_CPUS {
        return Err(RtError::InvalidArg);
    }
    let map = with_core(|core| -> RtResult<u32> {
        if !core.valid_task(tid) || core.tasks[tid as usize].is_host {
            return Err(RtError::InvalidArg);
        }
        let from_cpu = core.tasks[tid as usize].runnable_on_cpu as usize;
        if from_cpu == target_cpu {
            return Ok(0);
        }
        if core.cpus[from_cpu].current == tid {
            return Err(RtError::Busy);
        }

        let tuned = clock::tuned();
        let from_oneshot = clock::is_oneshot(from_cpu);
        let to_oneshot = clock::is_oneshot(target_cpu);
        if from_oneshot != to_oneshot && tuned.cpu_freq != 0 && tuned.timer_freq != 0 {
            let (mult, div) = if from_oneshot {
                (tuned.timer_freq, tuned.cpu_freq)
            } else {
                (tuned.cpu_freq, tuned.timer_freq)
            };
            let task = &mut core.tasks[tid as usize];
            task.period = quartz_lib::llimd(task.period, mult as u32, div as u32);
            if task.resume_time != RT_TIME_END {
                task.resume_time = quartz_lib::llimd(task.resume_time, mult as u32, div as u32);
            }
        }

        let was_ready = core.tasks[tid as usize].is_runnable();
        let was_delayed = core.tasks[tid as usize].state.contains(TaskState::DELAYED);
        core.rem_ready_task(tid);
        core.rem_timed_task(tid);
        core.tasks[tid as usize].runnable_on_cpu = target_cpu as u8;
        core.tasks[tid as usize].affinity = 1 << target_cpu;
        core.cpus[from_cpu].task_count = core.cpus[from_cpu].task_count.saturating_sub(1);
        core.cpus[target_cpu].task_count += 1;
        if was_ready {
            core.enq_ready_task(tid);
        }
        if was_delayed {
            core.enq_timed_task(tid);
        }
        Ok((1 << from_cpu) | (1 << target_cpu))
    })?;
    schedule_map(map);
    Ok(())
}

// --- Watchdog ----------------------------------------------------------------

/// Register `handle` as the watchdog task for `cpu` and arm the
/// pipeline's per-IRQ latency ceiling. While registered, the highest
/// priority is reserved for it.
pub fn register_watchdog(handle: TaskHandle, cpu: usize, threshold_ns: i64) -> RtResult<()> {
    if cpu >= MAX_CPUS {
        return Err(RtError::InvalidArg);
    }
    with_core(|core| -> RtResult<()> {
        if !core.valid_task(handle.0) {
            return Err(RtError::InvalidArg);
        }
        if core.watchdog[cpu] != NO_TASK {
            return Err(RtError::Busy);
        }
        for tid in 0..quartz_abi::task::MAX_TASKS as TaskId {
            if tid != handle.0
                && core.valid_task(tid)
                && !core.tasks[tid as usize].is_host
                && core.tasks[tid as usize].priority == HIGHEST_PRIORITY
            {
                return Err(RtError::Busy);
            }
        }
        core.watchdog[cpu] = handle.0;
        Ok(())
    })?;
    quartz_hal::pipeline::register_watchdog_kick(watchdog_kick, threshold_ns);
    Ok(())
}

pub fn deregister_watchdog(handle: TaskHandle, cpu: usize) -> RtResult<()> {
    if cpu >= MAX_CPUS {
        return Err(RtError::InvalidArg);
    }
    with_core(|core| {
        if core.watchdog[cpu] != handle.0 {
            return Err(RtError::InvalidArg);
        }
        core.watchdog[cpu] = NO_TASK;
        Ok(())
    })?;
    quartz_hal::pipeline::unregister_watchdog_kick();
    Ok(())
}

/// Ask a periodic task to realign its release grid to the present on
/// its next `wait_period` (the watchdog's recovery handshake).
pub fn request_resync_frame(handle: TaskHandle) -> RtResult<()> {
    with_core(|core| {
        if !core.valid_task(handle.0) {
            return Err(RtError::InvalidArg);
        }
        core.tasks[handle.0 as usize].resync_frame = true;
        Ok(())
    })
}

// --- Introspection -----------------------------------------------------------

pub fn whoami() -> TaskHandle {
    let cpu = quartz_lib::current_cpu_id();
    TaskHandle(with_core(|core| core.cpus[cpu].current))
}

pub fn get_task_state(handle: TaskHandle) -> RtResult<TaskState> {
    with_core(|core| {
        if core.valid_task(handle.0) {
            Ok(core.tasks[handle.0 as usize].state)
        } else {
            Err(RtError::InvalidArg)
        }
    })
}

pub fn task_overruns(handle: TaskHandle) -> RtResult<u32> {
    with_core(|core| {
        if core.valid_task(handle.0) {
            Ok(core.tasks[handle.0 as usize].overruns)
        } else {
            Err(RtError::InvalidArg)
        }
    })
}

/// Accumulated execution ticks and the timestamp of first dispatch.
pub fn task_exectime(handle: TaskHandle) -> RtResult<(RTime, RTime)> {
    with_core(|core| {
        if core.valid_task(handle.0) {
            let t = &core.tasks[handle.0 as usize];
            Ok((t.exectime[0], t.exectime[1]))
        } else {
            Err(RtError::InvalidArg)
        }
    })
}

/// Per-CPU scheduler counters: (switches, preemptions, timer ticks).
pub fn schedule_stats(cpu: usize) -> (u64, u64, u64) {
    if cpu >= MAX_CPUS {
        return (0, 0, 0);
    }
    with_core(|core| {
        let c = &core.cpus[cpu];
        (c.switches, c.preemptions, c.tick_count)
    })
}

fn min_tasks_cpu(core: &mut SchedCore) -> usize {
    let online = quartz_lib::cpu_count().min(MAX_CPUS);
    let mut best = 0;
    let mut min = u32::MAX;
    for cpu in 0..online {
        if core.cpus[cpu].task_count < min {
            min = core.cpus[cpu].task_count;
            best = cpu;
        }
    }
    best
}

/// Initialize the scheduler subsystem: the heap, the arena with its
/// per-CPU host tasks, and the deferred-reschedule hook.
pub fn init_scheduler() {
    quartz_mm::heap_init();
    with_core(|core| core.init());
    quartz_lib::preempt::register_reschedule_callback(deferred_reschedule);
}

fn deferred_reschedule() {
    if crate::scheduler::is_scheduler_enabled() {
        schedule();
    }
}
