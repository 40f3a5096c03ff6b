//! Counting, binary, and resource semaphores.
//!
//! The count algebra follows the classic encoding: a negative count is
//! the number of blocked waiters. Binary semaphores clamp at one;
//! resource semaphores add single ownership, recursion (nested depth is
//! carried above 1 in the kind field), and priority inheritance through
//! the scheduler's `pass_prio` chain.
//!
//! Blocking waits split into a prepare step (queue the caller under the
//! scheduler lock), the schedule call, and a finish step that classifies
//! how the wait ended: signaled, timed out (the waiter is still on the
//! queue), interrupted (explicit unblock), or destroyed (the slot's
//! generation moved on).

use quartz_abi::RtError;
use quartz_abi::error::RtResult;
use quartz_abi::task::{QueueOrder, TaskState};
use quartz_abi::time::RTime;
use quartz_hal::clock;
use quartz_sched::scheduler::{schedule, schedule_map};
use quartz_sched::task::{
    NO_SYNC, NO_TASK, RT_SYNC_MAGIC, SchedCore, SyncId, TaskId, with_core,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SemKind {
    Counting,
    Binary,
    Resource,
}

impl SemKind {
    /// The kind/recursion encoding used by the wait/signal algebra.
    const fn stype(self) -> i32 {
        match self {
            Self::Binary => -1,
            Self::Counting => 0,
            Self::Resource => 1,
        }
    }
}

/// Semaphore handle: slot index plus the generation it was created in,
/// so operations on a deleted (and possibly reused) slot fail cleanly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Sem {
    pub(crate) idx: SyncId,
    pub(crate) generation: u32,
}

pub const SEM_COUNT_MAX: i32 = 0xFFFF;

/// Create a semaphore of the given kind. Resource semaphores force a
/// priority-ordered queue and a count of one; binary initial values
/// clamp to one.
pub fn typed_sem_init(value: i32, kind: SemKind, order: QueueOrder) -> RtResult<Sem> {
    if !(0..=SEM_COUNT_MAX).contains(&value) {
        return Err(RtError::InvalidArg);
    }
    with_core(|core| {
        let idx = core.alloc_sync_slot().ok_or(RtError::NoResource)?;
        let slot = &mut core.syncs[idx as usize];
        slot.magic = RT_SYNC_MAGIC;
        slot.qtype = match kind {
            SemKind::Resource => QueueOrder::Priority,
            _ => order,
        };
        slot.stype = kind.stype();
        slot.count = match kind {
            SemKind::Counting => value,
            SemKind::Binary => value.min(1),
            SemKind::Resource => 1,
        };
        slot.owner = NO_TASK;
        slot.wq_head = NO_TASK;
        slot.wq_tail = NO_TASK;
        Ok(Sem {
            idx,
            generation: slot.generation,
        })
    })
}

/// Counting semaphore with priority-ordered waiters.
pub fn sem_init(value: i32) -> RtResult<Sem> {
    typed_sem_init(value, SemKind::Counting, QueueOrder::Priority)
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

pub fn sem_count(sem: Sem) -> RtResult<i32> {
    with_core(|core| {
        check(core, sem)?;
        Ok(core.syncs[sem.idx as usize].count)
    })
}

// --- Wake helper -------------------------------------------------------------

/// Pull one waiter off the queue and make it runnable if nothing else
/// blocks it. Returns the woken task and a CPU map for rescheduling.
fn wake_head(core: &mut SchedCore, idx: SyncId) -> (TaskId, u32) {
    let head = core.syncs[idx as usize].wq_head;
    if head == NO_TASK {
        return (NO_TASK, 0);
    }
    core.dequeue_blocked(head);
    core.rem_timed_task(head);
    let task = &mut core.tasks[head as usize];
    if !task.is_runnable() {
        task.state.remove(TaskState::SEMAPHORE | TaskState::DELAYED);
        if task.is_runnable() {
            let cpu = task.runnable_on_cpu as u32;
            core.enq_ready_task(head);
            return (head, 1 << cpu);
        }
    }
    (head, 0)
}

/// Release resource ownership held by `cur`: drop the owned-resource
/// count, restore the base priority once nothing is owned (an adaptive
/// ceiling keeps the inherited value while other resources are still
/// held), and materialize any suspension or deletion that was deferred
/// while the resource was owned. Returns (cpu map, needs decision).
fn release_ownership(core: &mut SchedCore, idx: SyncId, cur: TaskId) -> (u32, bool) {
    core.syncs[idx as usize].owner = NO_TASK;
    let mut map = 0u32;
    let mut sched = false;

    if core.tasks[cur as usize].owndres > 0 {
        core.tasks[cur as usize].owndres -= 1;
    }
    if core.tasks[cur as usize].owndres == 0 {
        let base = core.tasks[cur as usize].base_priority;
        if core.renq_ready_task(cur, base) {
            map |= 1 << core.tasks[cur as usize].runnable_on_cpu;
            sched = true;
        }
    }

    let depth = core.tasks[cur as usize].suspdepth;
    if depth > 0 {
        core.tasks[cur as usize].state.insert(TaskState::SUSPENDED);
        core.rem_ready_task(cur);
        map |= 1 << core.tasks[cur as usize].runnable_on_cpu;
        sched = true;
    } else if depth < 0 {
        // A deletion parked behind the owned resource fires now.
        map |= quartz_sched::api::task_delete_inner(core, cur);
        sched = true;
    }
    (map, sched)
}

// --- Signal / broadcast ------------------------------------------------------

pub fn sem_signal(sem: Sem) -> RtResult<()> {
    let cpu = quartz_lib::current_cpu_id();
    let map = with_core(|core| -> RtResult<u32> {
        check(core, sem)?;
        let idx = sem.idx;
        let cur = core.cpus[cpu].current;
        let stype = core.syncs[idx as usize].stype;

        if stype != 0 {
            if stype > 0 && core.syncs[idx as usize].owner != cur {
                return Err(RtError::Busy);
            }
            if stype > 1 {
                // Nested resource lock: unwind one level, keep owning.
                core.syncs[idx as usize].stype -= 1;
                return Ok(0);
            }
            core.syncs[idx as usize].count += 1;
            if core.syncs[idx as usize].count > 1 {
                core.syncs[idx as usize].count = 1;
            }
        } else {
            if core.syncs[idx as usize].count >= SEM_COUNT_MAX {
                return Err(RtError::InvalidArg);
            }
            core.syncs[idx as usize].count += 1;
        }

        let (_woken, mut map) = wake_head(core, idx);

        if stype > 0 {
            let (own_map, _sched) = release_ownership(core, idx, cur);
            map |= own_map;
        }
        Ok(map)
    })?;
    schedule_map(map);
    Ok(())
}

/// Wake every waiter and zero the count.
pub fn sem_broadcast(sem: Sem) -> RtResult<()> {
    let map = with_core(|core| -> RtResult<u32> {
        check(core, sem)?;
        let idx = sem.idx;
        let mut map = 0u32;
        loop {
            let (woken, m) = wake_head(core, idx);
            if woken == NO_TASK {
                break;
            }
            map |= m;
        }
        core.syncs[idx as usize].count = 0;
        Ok(map)
    })?;
    schedule_map(map);
    Ok(())
}

// --- Wait family -------------------------------------------------------------

/// Outcome of the queuing half of a wait. Exposed (with the two halves
/// below) as building blocks for primitives layered on semaphores and
/// for harnesses that must observe the blocked intermediate state.
pub enum Prepared {
    /// Acquired without blocking; carries the pre-decrement count.
    Got(i32),
    /// Resource recursion by the owner; nothing to wait for.
    Recursed,
    /// Queued; CPUs in the map need a decision before we block.
    Blocked(u32),
    /// A timed wait whose deadline is already inside the horizon.
    PastDeadline,
}

/// First half of a wait: consume the count or queue the caller.
pub fn wait_prepare(
    core: &mut SchedCore,
    sem: Sem,
    cpu: usize,
    deadline: Option<RTime>,
) -> RtResult<Prepared> {
    check(core, sem)?;
    let idx = sem.idx;
    let cur = core.cpus[cpu].current;
    if core.tasks[cur as usize].is_host {
        return Err(RtError::InvalidArg);
    }

    let count = core.syncs[idx as usize].count;
    if count > 0 {
        core.syncs[idx as usize].count = count - 1;
        if core.syncs[idx as usize].stype > 0 {
            core.syncs[idx as usize].owner = cur;
            core.tasks[cur as usize].owndres += 1;
        }
        return Ok(Prepared::Got(count));
    }

    let stype = core.syncs[idx as usize].stype;
    if stype > 0 && core.syncs[idx as usize].owner == cur {
        // Recursive take by the owner never blocks.
        core.syncs[idx as usize].stype += 1;
        return Ok(Prepared::Recursed);
    }

    if let Some(deadline) = deadline {
        if deadline <= core.cpus[cpu].rt_time_h {
            return Ok(Prepared::PastDeadline);
        }
        core.tasks[cur as usize].resume_time = deadline;
    }

    let mut map = 0u32;
    if stype > 0 {
        let owner = core.syncs[idx as usize].owner;
        if owner != NO_TASK {
            map = core.pass_prio(owner, cur);
        }
    }

    core.syncs[idx as usize].count -= 1;
    let state = if deadline.is_some() {
        TaskState::SEMAPHORE | TaskState::DELAYED
    } else {
        TaskState::SEMAPHORE
    };
    core.tasks[cur as usize].state.insert(state);
    core.rem_ready_current(cur);
    core.enqueue_blocked(cur, idx);
    if deadline.is_some() {
        core.enq_timed_task(cur);
    }
    Ok(Prepared::Blocked(map))
}

/// Second half of a wait, after the scheduler resumed us: classify the
/// wake-up and finish the acquisition on success.
pub fn wait_finish(core: &mut SchedCore, sem: Sem, cpu: usize) -> RtResult<i32> {
    let idx = sem.idx;
    let cur = core.cpus[cpu].current;

    let slot = &core.syncs[idx as usize];
    if slot.magic != RT_SYNC_MAGIC || slot.generation != sem.generation {
        core.tasks[cur as usize].prio_passed_to = NO_TASK;
        return Err(RtError::Destroyed);
    }

    if core.tasks[cur as usize].unblocked {
        core.tasks[cur as usize].unblocked = false;
        core.tasks[cur as usize].prio_passed_to = NO_TASK;
        return Err(RtError::Interrupted);
    }

    if core.tasks[cur as usize].blocked_on == idx {
        // Still queued: the timer (or an abnormal wake) got us here, not
        // a signal. Withdraw and repair the count we consumed.
        core.dequeue_blocked(cur);
        core.tasks[cur as usize].state.remove(TaskState::SEMAPHORE);
        let slot = &mut core.syncs[idx as usize];
        slot.count += 1;
        if slot.stype != 0 && slot.count > 1 {
            slot.count = 1;
        }
        return Err(RtError::Timeout);
    }

    if core.syncs[idx as usize].stype > 0 {
        core.syncs[idx as usize].owner = cur;
        core.tasks[cur as usize].owndres += 1;
    }
    Ok(core.syncs[idx as usize].count)
}

/// Wait on a semaphore; blocks until signaled. Returns the number of
/// events still available at acquisition time.
pub fn sem_wait(sem: Sem) -> RtResult<i32> {
    let cpu = quartz_lib::current_cpu_id();
    let prepared = with_core(|core| wait_prepare(core, sem, cpu, None))?;
    match prepared {
        Prepared::Got(count) => Ok(count),
        Prepared::Recursed => Ok(0),
        Prepared::PastDeadline => Err(RtError::Timeout),
        Prepared::Blocked(map) => {
            schedule_map(map);
            schedule();
            with_core(|core| wait_finish(core, sem, cpu))
        }
    }
}

/// Non-blocking wait: WOULD_BLOCK instead of queuing.
pub fn sem_wait_if(sem: Sem) -> RtResult<i32> {
    let cpu = quartz_lib::current_cpu_id();
    with_core(|core| {
        check(core, sem)?;
        let idx = sem.idx;
        let cur = core.cpus[cpu].current;
        let count = core.syncs[idx as usize].count;
        if count > 0 {
            core.syncs[idx as usize].count = count - 1;
            if core.syncs[idx as usize].stype > 0 {
                core.syncs[idx as usize].owner = cur;
                core.tasks[cur as usize].owndres += 1;
            }
            return Ok(count);
        }
        if core.syncs[idx as usize].stype > 0 && core.syncs[idx as usize].owner == cur {
            core.syncs[idx as usize].stype += 1;
            return Ok(0);
        }
        Err(RtError::WouldBlock)
    })
}

/// Wait with an absolute deadline (native ticks).
pub fn sem_wait_until(sem: Sem, deadline: RTime) -> RtResult<i32> {
    let cpu = quartz_lib::current_cpu_id();
    let prepared = with_core(|core| wait_prepare(core, sem, cpu, Some(deadline)))?;
    match prepared {
        Prepared::Got(count) => Ok(count),
        Prepared::Recursed => Ok(0),
        Prepared::PastDeadline => Err(RtError::Timeout),
        Prepared::Blocked(map) => {
            schedule_map(map);
            schedule();
            with_core(|core| wait_finish(core, sem, cpu))
        }
    }
}

/// Wait with a relative timeout (native ticks).
pub fn sem_wait_timed(sem: Sem, delay: RTime) -> RtResult<i32> {
    let cpu = quartz_lib::current_cpu_id();
    sem_wait_until(sem, clock::rt_get_time_cpu(cpu) + delay)
}

// --- Barrier -----------------------------------------------------------------

/// Gang wait: the first N-1 callers block; the N-th broadcasts everyone
/// loose. N is the count the semaphore was initialized with, parked in
/// the owner field while the barrier is armed. Returns true for the
/// releasing caller.
pub fn sem_wait_barrier(sem: Sem) -> RtResult<bool> {
    let role = with_core(|core| -> RtResult<bool> {
        check(core, sem)?;
        let slot = &mut core.syncs[sem.idx as usize];
        if slot.owner == NO_TASK {
            let armed = slot.count.max(1) as u16;
            slot.owner = armed;
            slot.count = 0;
            slot.stype = 0;
        }
        let armed = slot.owner as i32;
        Ok((1 - slot.count) >= armed)
    })?;
    if role {
        // The armed N stays parked in the owner field so the barrier
        // can cycle again with the same width.
        sem_broadcast(sem)?;
        Ok(true)
    } else {
        sem_wait(sem)?;
        Ok(false)
    }
}

// --- Deletion ----------------------------------------------------------------

/// Delete a semaphore: every waiter wakes with DESTROYED (the handle
/// generation moves on before any of them runs), a resource owner's
/// inherited priority is re-derived, and the slot is retired.
pub fn sem_delete(sem: Sem) -> RtResult<()> {
    let map = with_core(|core| -> RtResult<u32> {
        check(core, sem)?;
        let idx = sem.idx;
        let mut map = 0u32;

        // Invalidate first: a waiter woken below must classify against
        // the new generation no matter how scheduling interleaves.
        core.syncs[idx as usize].magic = 0;
        core.syncs[idx as usize].generation = core.syncs[idx as usize].generation.wrapping_add(1);

        loop {
            let head = core.syncs[idx as usize].wq_head;
            if head == NO_TASK {
                break;
            }
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
            // Leave blocked_on cleared: the dead generation is what
            // tells the waiter the object is gone.
        }

        let owner = core.syncs[idx as usize].owner;
        if owner != NO_TASK && core.syncs[idx as usize].stype > 0 && core.valid_task(owner) {
            let (own_map, _sched) = release_ownership(core, idx, owner);
            map |= own_map;
        }

        if core.syncs[idx as usize].name != 0 {
            let name = core.syncs[idx as usize].name;
            let _ = quartz_sched::registry::drop_name(name);
        }

        let slot = &mut core.syncs[idx as usize];
        let generation = slot.generation;
        *slot = quartz_sched::task::SyncSlot::empty();
        slot.generation = generation;
        Ok(map)
    })?;
    schedule_map(map);
    Ok(())
}

// --- Named semaphores --------------------------------------------------------

/// Find-or-create a named semaphore; an existing name bumps its usage
/// count and returns the same object.
pub fn named_sem_init(name: &str, value: i32, kind: SemKind) -> RtResult<Sem> {
    let num = quartz_sched::registry::nam2num(name);
    if let Some(adr) = quartz_sched::registry::get_adr_cnt(num) {
        return decode_handle(adr as usize);
    }
    let sem = typed_sem_init(value, kind, QueueOrder::Priority)?;
    with_core(|core| core.syncs[sem.idx as usize].name = num);
    match quartz_sched::registry::register(
        num,
        quartz_abi::task::ObjectType::Sem,
        encode_handle(sem) as *mut core::ffi::c_void,
        u16::MAX,
        0,
    ) {
        Ok(_) => Ok(sem),
        Err(err) => {
            let _ = sem_delete(sem);
            Err(err)
        }
    }
}

/// Drop one named reference; the last reference deletes the semaphore.
pub fn named_sem_delete(sem: Sem) -> RtResult<()> {
    let name = with_core(|core| {
        check(core, sem)?;
        Ok(core.syncs[sem.idx as usize].name)
    })?;
    if name == 0 {
        return sem_delete(sem);
    }
    match quartz_sched::registry::drop_name_cnt(name) {
        Ok(0) | Err(_) => sem_delete(sem),
        Ok(_) => Ok(()),
    }
}

fn encode_handle(sem: Sem) -> usize {
    ((sem.generation as usize) << 16) | sem.idx as usize
}

fn decode_handle(raw: usize) -> RtResult<Sem> {
    let sem = Sem {
        idx: (raw & 0xFFFF) as SyncId,
        generation: (raw >> 16) as u32,
    };
    with_core(|core| check(core, sem))?;
    Ok(sem)
}

/// Ownership release entry for the condvar's mutex hand-off.
pub(crate) fn release_ownership_for_cond(core: &mut SchedCore, idx: SyncId, cur: TaskId) -> u32 {
    release_ownership(core, idx, cur).0
}

/// True when the task id is still queued on this semaphore.
#[allow(dead_code)]
pub(crate) fn is_queued(core: &SchedCore, sem: Sem, tid: TaskId) -> bool {
    core.tasks[tid as usize].blocked_on == sem.idx && core.tasks[tid as usize].blocked_on != NO_SYNC
}
