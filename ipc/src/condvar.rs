//! Condition variables.
//!
//! A condvar is a waiter queue with no count of its own: `cond_wait`
//! atomically parks the caller and releases the paired mutex (one
//! recursion level if the mutex is nested), and reacquires the mutex
//! before returning, whatever way the wait ended.

use quartz_abi::RtError;
use quartz_abi::error::RtResult;
use quartz_abi::task::{QueueOrder, TaskState};
use quartz_abi::time::RTime;
use quartz_hal::clock;
use quartz_sched::scheduler::{schedule, schedule_map};
use quartz_sched::task::{NO_TASK, RT_SYNC_MAGIC, SchedCore, TaskId, with_core};

use crate::sem::{self, Sem, SemKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CondVar(pub(crate) Sem);

pub fn cond_init() -> RtResult<CondVar> {
    Ok(CondVar(sem::typed_sem_init(
        0,
        SemKind::Counting,
        QueueOrder::Priority,
    )?))
}

pub fn cond_delete(cond: CondVar) -> RtResult<()> {
    sem::sem_delete(cond.0)
}

/// Wake the first queued waiter. Nothing happens without waiters.
pub fn cond_signal(cond: CondVar) -> RtResult<()> {
    let map = with_core(|core| -> RtResult<u32> {
        check(core, cond.0)?;
        let idx = cond.0.idx;
        let head = core.syncs[idx as usize].wq_head;
        if head == NO_TASK {
            return Ok(0);
        }
        core.dequeue_blocked(head);
        core.rem_timed_task(head);
        let task = &mut core.tasks[head as usize];
        if !task.is_runnable() {
            task.state.remove(TaskState::SEMAPHORE | TaskState::DELAYED);
            if task.is_runnable() {
                let cpu = task.runnable_on_cpu as u32;
                core.enq_ready_task(head);
                return Ok(1 << cpu);
            }
        }
        Ok(0)
    })?;
    schedule_map(map);
    Ok(())
}

/// Wake every queued waiter.
pub fn cond_broadcast(cond: CondVar) -> RtResult<()> {
    sem::sem_broadcast(cond.0)
}

fn check(core: &SchedCore, sem: Sem) -> RtResult<()> {
    let slot = core
        .syncs
        .get(sem.idx as usize)
        .ok_or(RtError::InvalidArg)?;
    if slot.magic != RT_SYNC_MAGIC || slot.generation != sem.generation {
        return Err(RtError::InvalidArg);
    }
    Ok(())
}

/// Release one level of the paired mutex while its holder parks on the
/// condvar: the deepest nesting level just unwinds; the outermost
/// releases ownership and hands the mutex to its first waiter.
pub(crate) fn cndmtx_release(core: &mut SchedCore, mtx: Sem, cur: TaskId) -> u32 {
    let idx = mtx.idx;
    let stype = core.syncs[idx as usize].stype;
    if stype > 1 {
        core.syncs[idx as usize].stype -= 1;
        return 0;
    }

    core.syncs[idx as usize].count += 1;
    if core.syncs[idx as usize].count > 1 {
        core.syncs[idx as usize].count = 1;
    }

    let mut map = 0u32;
    let head = core.syncs[idx as usize].wq_head;
    if head != NO_TASK {
        core.dequeue_blocked(head);
        core.rem_timed_task(head);
        let task = &mut core.tasks[head as usize];
        if !task.is_runnable() {
            task.state.remove(TaskState::SEMAPHORE | TaskState::DELAYED);
            if task.is_runnable() {
                map |= 1 << task.runnable_on_cpu;
                core.enq_ready_task(head);
            }
        }
    }

    if stype > 0 {
        map |= crate::sem::release_ownership_for_cond(core, idx, cur);
    }
    map
}

pub(crate) fn classify_cond_wake(core: &mut SchedCore, cond: CondVar, cpu: usize) -> RtResult<()> {
    let idx = cond.0.idx;
    let cur = core.cpus[cpu].current;

    let slot = &core.syncs[idx as usize];
    if slot.magic != RT_SYNC_MAGIC || slot.generation != cond.0.generation {
        core.tasks[cur as usize].prio_passed_to = NO_TASK;
        return Err(RtError::Destroyed);
    }
    if core.tasks[cur as usize].unblocked {
        core.tasks[cur as usize].unblocked = false;
        return Err(RtError::Interrupted);
    }
    if core.tasks[cur as usize].blocked_on == idx {
        // Deadline fired first; withdraw from the queue. A condvar has
        // no count to repair.
        core.dequeue_blocked(cur);
        core.tasks[cur as usize].state.remove(TaskState::SEMAPHORE);
        return Err(RtError::Timeout);
    }
    Ok(())
}

fn cond_wait_inner(cond: CondVar, mtx: Sem, deadline: Option<RTime>) -> RtResult<()> {
    let cpu = quartz_lib::current_cpu_id();
    let map = with_core(|core| -> RtResult<u32> {
        check(core, cond.0)?;
        check(core, mtx)?;
        let cur = core.cpus[cpu].current;
        if core.tasks[cur as usize].is_host {
            return Err(RtError::InvalidArg);
        }
        if let Some(deadline) = deadline {
            if deadline <= core.cpus[cpu].rt_time_h {
                return Err(RtError::Timeout);
            }
            core.tasks[cur as usize].resume_time = deadline;
            core.tasks[cur as usize]
                .state
                .insert(TaskState::SEMAPHORE | TaskState::DELAYED);
        } else {
            core.tasks[cur as usize].state.insert(TaskState::SEMAPHORE);
        }
        core.rem_ready_current(cur);
        core.enqueue_blocked(cur, cond.0.idx);
        if deadline.is_some() {
            core.enq_timed_task(cur);
        }
        Ok(cndmtx_release(core, mtx, cur))
    })?;

    schedule_map(map);
    schedule();

    let wait_result = with_core(|core| classify_cond_wake(core, cond, cpu));

    // Reacquire the mutex regardless of how the wait ended; the caller
    // owns it again on every return path.
    let reacquire = sem::sem_wait(mtx);
    match (wait_result, reacquire) {
        (Err(err), _) => Err(err),
        (Ok(()), Err(err)) => Err(err),
        (Ok(()), Ok(_)) => Ok(()),
    }
}

/// Atomically release `mtx` and wait for a signal, reacquiring `mtx`
/// before returning.
pub fn cond_wait(cond: CondVar, mtx: Sem) -> RtResult<()> {
    cond_wait_inner(cond, mtx, None)
}

/// As `cond_wait`, giving up at the absolute tick `deadline`.
pub fn cond_wait_until(cond: CondVar, mtx: Sem, deadline: RTime) -> RtResult<()> {
    cond_wait_inner(cond, mtx, Some(deadline))
}

/// As `cond_wait`, giving up after `delay` ticks.
pub fn cond_wait_timed(cond: CondVar, mtx: Sem, delay: RTime) -> RtResult<()> {
    let cpu = quartz_lib::current_cpu_id();
    cond_wait_inner(cond, mtx, Some(clock::rt_get_time_cpu(cpu) + delay))
}
