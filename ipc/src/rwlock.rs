//! Multi-reader single-writer locks, writer-preferring.
//!
//! Built from three semaphores: a resource mutex serializing writers, a
//! counting semaphore each blocked writer waits on, and one for blocked
//! readers. A reader yields not only to a holding writer but to any
//! *queued* writer of equal or stronger priority, so sustained read
//! traffic cannot starve writers. The live reader count is parked in
//! the reader semaphore's otherwise-unused owner field.

use quartz_abi::RtError;
use quartz_abi::error::RtResult;
use quartz_abi::task::QueueOrder;
use quartz_abi::time::RTime;
use quartz_hal::clock;
use quartz_sched::task::{NO_TASK, SchedCore, with_core};

use crate::sem::{self, Sem, SemKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RwLock {
    wrmtx: Sem,
    wrsem: Sem,
    rdsem: Sem,
}

#[cfg(feature = "itests")]
impl RwLock {
    /// Writer-gate slot index, for tests that queue a writer directly.
    pub(crate) fn wrsem_index(&self) -> quartz_sched::task::SyncId {
        self.wrsem.idx
    }
}

pub fn rwl_init() -> RtResult<RwLock> {
    let wrmtx = sem::typed_sem_init(1, SemKind::Resource, QueueOrder::Priority)?;
    let wrsem = match sem::typed_sem_init(0, SemKind::Counting, QueueOrder::Priority) {
        Ok(s) => s,
        Err(err) => {
            let _ = sem::sem_delete(wrmtx);
            return Err(err);
        }
    };
    let rdsem = match sem::typed_sem_init(0, SemKind::Counting, QueueOrder::Priority) {
        Ok(s) => s,
        Err(err) => {
            let _ = sem::sem_delete(wrsem);
            let _ = sem::sem_delete(wrmtx);
            return Err(err);
        }
    };
    Ok(RwLock {
        wrmtx,
        wrsem,
        rdsem,
    })
}

pub fn rwl_delete(rwl: RwLock) -> RtResult<()> {
    let a = sem::sem_delete(rwl.rdsem);
    let b = sem::sem_delete(rwl.wrsem);
    let c = sem::sem_delete(rwl.wrmtx);
    a.and(b).and(c)
}

fn readers(core: &SchedCore, rwl: RwLock) -> u16 {
    let owner = core.syncs[rwl.rdsem.idx as usize].owner;
    if owner == NO_TASK { 0 } else { owner }
}

fn set_readers(core: &mut SchedCore, rwl: RwLock, count: u16) {
    core.syncs[rwl.rdsem.idx as usize].owner = if count == 0 { NO_TASK } else { count };
}

enum ReadGate {
    Acquired,
    MustWait,
}

fn read_gate(core: &mut SchedCore, rwl: RwLock, cpu: usize) -> RtResult<ReadGate> {
    let cur = core.cpus[cpu].current;
    let writer = core.syncs[rwl.wrmtx.idx as usize].owner;
    if writer == cur {
        // Read inside one's own write section: refused, not recursed.
        return Err(RtError::Busy);
    }
    let queued_writer = core.syncs[rwl.wrsem.idx as usize].wq_head;
    let writer_outranks = queued_writer != NO_TASK
        && core.tasks[queued_writer as usize].priority <= core.tasks[cur as usize].priority;
    if writer != NO_TASK || writer_outranks {
        return Ok(ReadGate::MustWait);
    }
    let count = readers(core, rwl);
    set_readers(core, rwl, count + 1);
    Ok(ReadGate::Acquired)
}

fn rdlock_inner(rwl: RwLock, deadline: Option<RTime>) -> RtResult<()> {
    let cpu = quartz_lib::current_cpu_id();
    loop {
        match with_core(|core| read_gate(core, rwl, cpu))? {
            ReadGate::Acquired => return Ok(()),
            ReadGate::MustWait => match deadline {
                Some(deadline) => {
                    sem::sem_wait_until(rwl.rdsem, deadline)?;
                }
                None => {
                    sem::sem_wait(rwl.rdsem)?;
                }
            },
        }
    }
}

/// Acquire for reading; blocks while a writer holds the lock or an
/// equal-or-stronger writer is queued.
pub fn rwl_rdlock(rwl: RwLock) -> RtResult<()> {
    rdlock_inner(rwl, None)
}

pub fn rwl_rdlock_until(rwl: RwLock, deadline: RTime) -> RtResult<()> {
    rdlock_inner(rwl, Some(deadline))
}

pub fn rwl_rdlock_timed(rwl: RwLock, delay: RTime) -> RtResult<()> {
    let cpu = quartz_lib::current_cpu_id();
    rdlock_inner(rwl, Some(clock::rt_get_time_cpu(cpu) + delay))
}

/// Non-blocking read acquisition.
pub fn rwl_rdlock_if(rwl: RwLock) -> RtResult<()> {
    let cpu = quartz_lib::current_cpu_id();
    match with_core(|core| read_gate(core, rwl, cpu))? {
        ReadGate::Acquired => Ok(()),
        ReadGate::MustWait => Err(RtError::WouldBlock),
    }
}

fn wrlock_inner(rwl: RwLock, deadline: Option<RTime>) -> RtResult<()> {
    let cpu = quartz_lib::current_cpu_id();
    loop {
        enum Gate {
            Free,
            Readers,
        }
        let gate = with_core(|core| -> RtResult<Gate> {
            let cur = core.cpus[cpu].current;
            if core.syncs[rwl.wrmtx.idx as usize].owner == cur {
                // Recursive writer re-entry is an error, not a recursion.
                return Err(RtError::Busy);
            }
            if readers(core, rwl) > 0 {
                Ok(Gate::Readers)
            } else {
                Ok(Gate::Free)
            }
        })?;
        match gate {
            Gate::Free => {
                match deadline {
                    Some(deadline) => sem::sem_wait_until(rwl.wrmtx, deadline)?,
                    None => sem::sem_wait(rwl.wrmtx)?,
                };
                return Ok(());
            }
            Gate::Readers => match deadline {
                Some(deadline) => {
                    sem::sem_wait_until(rwl.wrsem, deadline)?;
                }
                None => {
                    sem::sem_wait(rwl.wrsem)?;
                }
            },
        }
    }
}

/// Acquire for writing; blocks while readers are inside.
pub fn rwl_wrlock(rwl: RwLock) -> RtResult<()> {
    wrlock_inner(rwl, None)
}

pub fn rwl_wrlock_until(rwl: RwLock, deadline: RTime) -> RtResult<()> {
    wrlock_inner(rwl, Some(deadline))
}

pub fn rwl_wrlock_timed(rwl: RwLock, delay: RTime) -> RtResult<()> {
    let cpu = quartz_lib::current_cpu_id();
    wrlock_inner(rwl, Some(clock::rt_get_time_cpu(cpu) + delay))
}

/// Non-blocking write acquisition.
pub fn rwl_wrlock_if(rwl: RwLock) -> RtResult<()> {
    let cpu = quartz_lib::current_cpu_id();
    with_core(|core| {
        let cur = core.cpus[cpu].current;
        if core.syncs[rwl.wrmtx.idx as usize].owner == cur {
            return Err(RtError::Busy);
        }
        if readers(core, rwl) > 0 {
            return Err(RtError::WouldBlock);
        }
        Ok(())
    })?;
    match sem::sem_wait_if(rwl.wrmtx) {
        Ok(_) => Ok(()),
        Err(RtError::WouldBlock) => Err(RtError::WouldBlock),
        Err(err) => Err(err),
    }
}

// --- Named RW-locks ----------------------------------------------------------

const MAX_NAMED_RWLS: usize = 16;

static NAMED_RWLS: quartz_lib::IrqMutex<[Option<RwLock>; MAX_NAMED_RWLS]> =
    quartz_lib::IrqMutex::new([None; MAX_NAMED_RWLS]);

/// Find-or-create a named RW-lock.
pub fn named_rwl_init(name: &str) -> RtResult<RwLock> {
    let num = quartz_sched::registry::nam2num(name);
    if let Some(adr) = quartz_sched::registry::get_adr(num) {
        let slot = adr as usize;
        if let Some(rwl) = NAMED_RWLS.lock().get(slot).copied().flatten() {
            return Ok(rwl);
        }
        return Err(RtError::InvalidArg);
    }
    let rwl = rwl_init()?;
    let slot = {
        let mut table = NAMED_RWLS.lock();
        match table.iter().position(|s| s.is_none()) {
            Some(slot) => {
                table[slot] = Some(rwl);
                slot
            }
            None => {
                drop(table);
                let _ = rwl_delete(rwl);
                return Err(RtError::NoResource);
            }
        }
    };
    match quartz_sched::registry::register(
        num,
        quartz_abi::task::ObjectType::RwLock,
        slot as *mut core::ffi::c_void,
        u16::MAX,
        0,
    ) {
        Ok(_) => Ok(rwl),
        Err(err) => {
            NAMED_RWLS.lock()[slot] = None;
            let _ = rwl_delete(rwl);
            Err(err)
        }
    }
}

pub fn named_rwl_delete(name: &str) -> RtResult<()> {
    let num = quartz_sched::registry::nam2num(name);
    let adr = quartz_sched::registry::get_adr(num).ok_or(RtError::InvalidArg)?;
    let slot = adr as usize;
    let rwl = NAMED_RWLS
        .lock()
        .get_mut(slot)
        .and_then(|s| s.take())
        .ok_or(RtError::InvalidArg)?;
    let _ = quartz_sched::registry::drop_name(num);
    rwl_delete(rwl)
}

/// Release either role. When the lock becomes free the strongest-
/// priority queued side (writers win ties) gets handed the lock.
pub fn rwl_unlock(rwl: RwLock) -> RtResult<()> {
    let release_writer = with_core(|core| -> RtResult<bool> {
        if core.syncs[rwl.wrmtx.idx as usize].owner != NO_TASK {
            return Ok(true);
        }
        let count = readers(core, rwl);
        if count == 0 {
            return Err(RtError::InvalidArg);
        }
        set_readers(core, rwl, count - 1);
        Ok(false)
    })?;

    if release_writer {
        sem::sem_signal(rwl.wrmtx)?;
    }

    enum Handoff {
        Writers,
        Readers,
        Nobody,
    }
    let handoff = with_core(|core| {
        if core.syncs[rwl.wrmtx.idx as usize].owner != NO_TASK || readers(core, rwl) > 0 {
            return Handoff::Nobody;
        }
        let wtask = core.syncs[rwl.wrsem.idx as usize].wq_head;
        let rtask = core.syncs[rwl.rdsem.idx as usize].wq_head;
        match (wtask != NO_TASK, rtask != NO_TASK) {
            (true, true) => {
                if core.tasks[wtask as usize].priority <= core.tasks[rtask as usize].priority {
                    Handoff::Writers
                } else {
                    Handoff::Readers
                }
            }
            (true, false) => Handoff::Writers,
            (false, true) => Handoff::Readers,
            (false, false) => Handoff::Nobody,
        }
    });
    match handoff {
        Handoff::Writers => sem::sem_signal(rwl.wrsem),
        Handoff::Readers => sem::sem_signal(rwl.rdsem),
        Handoff::Nobody => Ok(()),
    }
}
