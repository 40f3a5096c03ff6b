//! Task records and the scheduler arena.
//!
//! Tasks, semaphores, and their wait queues form a cyclic graph (a
//! resource points at its owner, which is pointed at by its waiters), so
//! everything lives in static arenas and all linkage is by index. The
//! intrusive `*_prev`/`*_next` fields give O(1) unlink on every queue
//! while keeping the records movable-free and alias-free.
//!
//! Arena slot `cpu` holds that CPU's host task. It is created at init,
//! never destroyed, doubles as the circular sentinel of the CPU's ready
//! and timed lists, and carries `HOST_PRIORITY` so every real-time task
//! sorts ahead of it.

use core::ffi::c_void;
use core::ptr;

use quartz_abi::config::MAX_SEMAPHORES;
use quartz_abi::task::{HOST_PRIORITY, MAX_CPUS, MAX_TASKS, QueueOrder, TaskState};
use quartz_abi::time::{RT_TIME_END, RTime};
use quartz_lib::IrqMutex;

use crate::switch::{FpuState, SwitchContext};

pub type TaskId = u16;
pub type SyncId = u16;

pub const NO_TASK: TaskId = u16::MAX;
pub const NO_SYNC: SyncId = u16::MAX;

pub const RT_TASK_MAGIC: u32 = 0x5154_534B;
pub const RT_SYNC_MAGIC: u32 = 0x5153_454D;

pub const NR_TRAPS: usize = 8;

/// Per-task trap override. Returns true when the trap was handled.
pub type TrapHandler = fn(vector: u32, task: TaskId) -> bool;

/// Task entry point, called from the trampoline with its init argument.
pub type TaskEntry = fn(arg: usize);

#[repr(C)]
pub struct RtTask {
    pub magic: u32,
    pub state: TaskState,
    /// Effective (possibly inherited) priority. Negative values encode
    /// scheduler-lock nesting and never reach the ready queue.
    pub priority: i32,
    pub base_priority: i32,
    pub sched_lock_priority: i32,
    pub policy: i32,
    pub rr_quantum: RTime,
    pub rr_remaining: RTime,
    pub yield_time: RTime,
    pub period: RTime,
    pub resume_time: RTime,
    /// Suspension nesting; `i32::MIN` flags a deferred deletion.
    pub suspdepth: i32,
    /// Count of resource semaphores currently owned.
    pub owndres: u32,
    /// The task this task most recently passed its priority to (the
    /// owner of the resource it blocks on); walked transitively by
    /// priority changes.
    pub prio_passed_to: TaskId,
    pub blocked_on: SyncId,
    /// Set by an explicit unblock so the waiter can report INTERRUPTED.
    pub unblocked: bool,
    pub uses_fpu: bool,
    pub is_host: bool,
    pub runnable_on_cpu: u8,
    pub affinity: u32,
    pub overruns: u32,
    /// Watchdog resync request: the next wait_period realigns to now.
    pub resync_frame: bool,

    // Intrusive queue linkage (ready / timed / blocked).
    pub rq_prev: TaskId,
    pub rq_next: TaskId,
    pub tq_prev: TaskId,
    pub tq_next: TaskId,
    pub bq_prev: TaskId,
    pub bq_next: TaskId,

    pub entry: Option<TaskEntry>,
    pub entry_arg: usize,
    pub stack_base: *mut u8,
    pub stack_size: usize,
    pub switch_ctx: SwitchContext,
    pub fpu: FpuState,
    pub signal: Option<fn()>,
    /// Runs during deletion, before the record is dismantled.
    pub exit_hook: Option<fn(TaskId)>,
    pub trap_handlers: [Option<TrapHandler>; NR_TRAPS],
    /// [accumulated run ticks, timestamp of first dispatch].
    pub exectime: [RTime; 2],
    /// Registry name, 0 while anonymous.
    pub name: u32,
}

impl RtTask {
    pub const fn empty() -> Self {
        Self {
            magic: 0,
            state: TaskState::empty(),
            priority: 0,
            base_priority: 0,
            sched_lock_priority: 0,
            policy: 0,
            rr_quantum: 0,
            rr_remaining: 0,
            yield_time: 0,
            period: 0,
            resume_time: RT_TIME_END,
            suspdepth: 0,
            owndres: 0,
            prio_passed_to: NO_TASK,
            blocked_on: NO_SYNC,
            unblocked: false,
            uses_fpu: false,
            is_host: false,
            runnable_on_cpu: 0,
            affinity: 0,
            overruns: 0,
            resync_frame: false,
            rq_prev: NO_TASK,
            rq_next: NO_TASK,
            tq_prev: NO_TASK,
            tq_next: NO_TASK,
            bq_prev: NO_TASK,
            bq_next: NO_TASK,
            entry: None,
            entry_arg: 0,
            stack_base: ptr::null_mut(),
            stack_size: 0,
            switch_ctx: SwitchContext::zero(),
            fpu: FpuState::new(),
            signal: None,
            exit_hook: None,
            trap_handlers: [None; NR_TRAPS],
            exectime: [0; 2],
            name: 0,
        }
    }

    #[inline]
    pub fn is_live(&self) -> bool {
        self.magic == RT_TASK_MAGIC
    }

    #[inline]
    pub fn is_runnable(&self) -> bool {
        self.state.is_runnable()
    }
}

/// Shared synchronization-object slot: one per semaphore, and one per
/// primitive built on semaphores (condvar, rwlock internals). Living in
/// the same arena as the tasks lets task deletion repair semaphore
/// counts without a dependency cycle between crates.
#[derive(Clone, Copy)]
pub struct SyncSlot {
    pub magic: u32,
    /// Bumped on every deletion so a reused slot cannot satisfy a stale
    /// handle: waiters woken by deletion classify against this.
    pub generation: u32,
    pub count: i32,
    pub qtype: QueueOrder,
    /// Kind and recursion in one field, matching the count algebra of
    /// the wait/signal paths: -1 binary, 0 counting, >= 1 resource,
    /// values above 1 being the nested lock depth of the owner.
    pub stype: i32,
    pub owner: TaskId,
    pub wq_head: TaskId,
    pub wq_tail: TaskId,
    /// Registry name, 0 while anonymous.
    pub name: u32,
}

impl SyncSlot {
    pub const fn empty() -> Self {
        Self {
            magic: 0,
            generation: 0,
            count: 0,
            qtype: QueueOrder::Priority,
            stype: 0,
            owner: NO_TASK,
            wq_head: NO_TASK,
            wq_tail: NO_TASK,
            name: 0,
        }
    }

    #[inline]
    pub fn is_live(&self) -> bool {
        self.magic == RT_SYNC_MAGIC
    }
}

/// Per-CPU scheduler state.
pub struct CpuSched {
    pub current: TaskId,
    pub fpu_owner: TaskId,
    /// Host CR0 image captured when the CPU left the host task.
    pub linux_cr0: u64,
    pub oneshot_running: bool,
    pub shot_fired: bool,
    pub preempt_always: bool,
    /// A scheduling event fired while the scheduler lock was held.
    pub sched_requested: bool,
    pub half_tick: RTime,
    /// Time horizon: now + half_tick, refreshed by the anticipation
    /// re-read before every decision.
    pub rt_time_h: RTime,
    pub task_count: u32,
    pub switches: u64,
    pub preemptions: u64,
    pub tick_count: u64,
    /// Timestamp of the last context switch, for exec accounting.
    pub switch_time: RTime,
}

impl CpuSched {
    pub const fn new() -> Self {
        Self {
            current: NO_TASK,
            fpu_owner: NO_TASK,
            linux_cr0: 0,
            oneshot_running: false,
            shot_fired: false,
            preempt_always: false,
            sched_requested: false,
            half_tick: 0,
            rt_time_h: 0,
            task_count: 0,
            switches: 0,
            preemptions: 0,
            tick_count: 0,
            switch_time: 0,
        }
    }
}

pub struct SchedCore {
    pub tasks: [RtTask; MAX_TASKS],
    pub syncs: [SyncSlot; MAX_SEMAPHORES],
    pub cpus: [CpuSched; MAX_CPUS],
    pub watchdog: [TaskId; MAX_CPUS],
    pub initialized: bool,
}

// SAFETY: raw stack pointers and cookies inside task records are only
// dereferenced by their owning CPU; all record access goes through the
// scheduler lock.
unsafe impl Send for SchedCore {}

impl SchedCore {
    pub const fn new() -> Self {
        const TASK: RtTask = RtTask::empty();
        const SYNC: SyncSlot = SyncSlot::empty();
        const CPU: CpuSched = CpuSched::new();
        Self {
            tasks: [TASK; MAX_TASKS],
            syncs: [SYNC; MAX_SEMAPHORES],
            cpus: [CPU; MAX_CPUS],
            watchdog: [NO_TASK; MAX_CPUS],
            initialized: false,
        }
    }

    /// Build the permanent host task for each CPU and reset all state.
    pub fn init(&mut self) {
        const TASK: RtTask = RtTask::empty();
        const SYNC: SyncSlot = SyncSlot::empty();
        self.tasks = [TASK; MAX_TASKS];
        self.syncs = [SYNC; MAX_SEMAPHORES];
        self.watchdog = [NO_TASK; MAX_CPUS];
        for cpu in 0..MAX_CPUS {
            let host = cpu as TaskId;
            let task = &mut self.tasks[cpu];
            task.magic = RT_TASK_MAGIC;
            task.state = TaskState::READY;
            task.priority = HOST_PRIORITY;
            task.base_priority = HOST_PRIORITY;
            task.is_host = true;
            task.uses_fpu = quartz_abi::config::LINUX_USES_FPU;
            task.runnable_on_cpu = cpu as u8;
            task.resume_time = RT_TIME_END;
            task.rq_prev = host;
            task.rq_next = host;
            task.tq_prev = host;
            task.tq_next = host;

            self.cpus[cpu] = CpuSched::new();
            self.cpus[cpu].current = host;
            self.cpus[cpu].fpu_owner = host;
        }
        self.initialized = true;
    }

    /// The circular-list sentinel for a CPU: its host task id.
    #[inline]
    pub fn host_of(&self, cpu: usize) -> TaskId {
        cpu as TaskId
    }

    /// Allocate a free task slot (never a host slot).
    pub fn alloc_task_slot(&mut self) -> Option<TaskId> {
        (MAX_CPUS..MAX_TASKS)
            .find(|&i| self.tasks[i].magic == 0)
            .map(|i| i as TaskId)
    }

    pub fn alloc_sync_slot(&mut self) -> Option<SyncId> {
        self.syncs
            .iter()
            .position(|s| s.magic == 0)
            .map(|i| i as SyncId)
    }

    #[inline]
    pub fn task(&self, id: TaskId) -> &RtTask {
        &self.tasks[id as usize]
    }

    #[inline]
    pub fn task_mut(&mut self, id: TaskId) -> &mut RtTask {
        &mut self.tasks[id as usize]
    }

    #[inline]
    pub fn valid_task(&self, id: TaskId) -> bool {
        (id as usize) < MAX_TASKS && self.tasks[id as usize].is_live()
    }

    #[inline]
    pub fn valid_sync(&self, id: SyncId) -> bool {
        (id as usize) < MAX_SEMAPHORES && self.syncs[id as usize].is_live()
    }

    #[inline]
    pub fn current(&self, cpu: usize) -> TaskId {
        self.cpus[cpu].current
    }
}

static SCHED: IrqMutex<SchedCore> = IrqMutex::new(SchedCore::new());

/// Run `f` holding the global scheduler lock. This is the single lock
/// protecting the task arena, sync slots, and every queue; the HAL's
/// per-CPU structures nest inside it, never the other way around.
pub fn with_core<R>(f: impl FnOnce(&mut SchedCore) -> R) -> R {
    f(&mut SCHED.lock())
}

/// Opaque cookie wrapper so callers outside the crate can hold a task
/// reference without touching arena internals.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TaskHandle(pub(crate) TaskId);

impl TaskHandle {
    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u16 {
        self.0
    }
}

/// Cookie passed through IRQ handlers that need a task back.
pub fn handle_as_cookie(handle: TaskHandle) -> *mut c_void {
    handle.0 as usize as *mut c_void
}
