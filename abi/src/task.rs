//! Task ABI: state bits, priorities, policies, and identity constants
//! shared between the scheduler, the pipeline, and the IPC layer.
//!
//! Kernel-internal structures (the task record, register contexts, FPU
//! state, queue linkage) live in `quartz_sched::task`.

use bitflags::bitflags;

// --- Capacity ---

pub const MAX_CPUS: usize = 8;
pub const MAX_TASKS: usize = 64;
pub const INVALID_TASK_INDEX: u16 = u16::MAX;

// --- Priorities ---
//
// Numerically lower is stronger. Priority 0 is reserved for a registered
// watchdog task while one exists. The host task sits at HOST_PRIORITY on
// every CPU and is never removed; it doubles as the "nothing real-time to
// do" position in the ready queue. Negative priorities are internal: they
// encode scheduler-lock nesting and are never accepted from callers.

pub const HIGHEST_PRIORITY: i32 = 0;
pub const LOWEST_PRIORITY: i32 = 0x3FFF_FFFF;
pub const HOST_PRIORITY: i32 = 0x7FFF_FFFF;

// --- Scheduling policy ---

pub const POLICY_FIFO: i32 = 0;
pub const POLICY_RR: i32 = 1;

bitflags! {
    /// Task state bits.
    ///
    /// `READY` is set for every live task; a task is runnable when the
    /// state is exactly `READY`. Wake paths clear a blocking bit and test
    /// `state == READY` to decide whether to re-enqueue, so the bit
    /// algebra here is load-bearing; see `quartz_sched::queues`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct TaskState: u16 {
        const READY     = 0x01;
        const SUSPENDED = 0x02;
        /// Parked on the timed queue waiting for `resume_time`.
        const DELAYED   = 0x04;
        /// Blocked on a semaphore (or any primitive built on one).
        const SEMAPHORE = 0x08;
    }
}

impl TaskState {
    /// Bits that keep a task off the ready queue.
    pub const BLOCKING: TaskState = TaskState::SUSPENDED
        .union(TaskState::DELAYED)
        .union(TaskState::SEMAPHORE);

    #[inline]
    pub const fn is_runnable(self) -> bool {
        self.bits() == TaskState::READY.bits()
    }
}

/// Blocked-queue ordering for a waitable primitive.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum QueueOrder {
    /// Waiters wake in priority order (ties FIFO).
    #[default]
    Priority = 0,
    /// Waiters wake strictly in arrival order.
    Fifo = 1,
}

/// Object classes in the shared name registry.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectType {
    Task = 0,
    Sem = 1,
    RwLock = 2,
    SpinLock = 3,
    Mailbox = 4,
    Proxy = 5,
    Bits = 6,
    Tbx = 7,
}

impl ObjectType {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Task => "TASK",
            Self::Sem => "SEM",
            Self::RwLock => "RWL",
            Self::SpinLock => "SPL",
            Self::Mailbox => "MBX",
            Self::Proxy => "PRX",
            Self::Bits => "BITS",
            Self::Tbx => "TBX",
        }
    }
}
