//! Condvar, RW-lock, and recursive spinlock tests.

use quartz_abi::RtError;
use quartz_abi::task::{QueueOrder, TaskState};
use quartz_lib::testing::TestResult;
use quartz_lib::{define_test_suite, fail};
use quartz_sched::task::{NO_TASK, with_core};

use crate::condvar::{self, cond_init, cond_signal};
use crate::rwlock::{
    rwl_init, rwl_rdlock_if, rwl_unlock, rwl_wrlock_if,
};
use crate::sem::{self, SemKind, typed_sem_init};
use crate::sem_tests::IpcFixture;
use crate::spl::{SpinLock, spl_lock, spl_lock_if, spl_unlock};

// --- Condvar -----------------------------------------------------------------

pub fn test_cond_wait_releases_mutex_atomically() -> TestResult {
    let fixture = IpcFixture::new();
    let a = fixture.spawn(5);
    let b = fixture.spawn(6);
    let cond = match cond_init() {
        Ok(c) => c,
        Err(_) => return fail!("cond_init failed"),
    };
    let mtx = match typed_sem_init(1, SemKind::Resource, QueueOrder::Priority) {
        Ok(m) => m,
        Err(_) => return fail!("mutex init failed"),
    };

    fixture.run_as(a);
    if sem::sem_wait(mtx).is_err() {
        return fail!("A could not take the mutex");
    }

    // Park A on the condvar and release the mutex, exactly what
    // cond_wait does before it schedules away.
    with_core(|core| {
        core.tasks[a.raw() as usize].state.insert(TaskState::SEMAPHORE);
        core.rem_ready_current(a.raw());
        core.enqueue_blocked(a.raw(), cond.0.idx);
        condvar::cndmtx_release(core, mtx, a.raw());
    });

    let released = with_core(|core| {
        core.syncs[mtx.idx as usize].owner == NO_TASK && core.syncs[mtx.idx as usize].count == 1
    });
    if !released {
        return fail!("parking on the condvar must release the mutex");
    }

    // B can take the mutex while A sleeps.
    fixture.run_as(b);
    if sem::sem_wait(mtx).is_err() {
        return fail!("B must be able to take the released mutex");
    }
    let _ = sem::sem_signal(mtx);

    // Signal wakes A; its wake classifies as a signal, not a timeout.
    if cond_signal(cond).is_err() {
        return fail!("cond_signal failed");
    }
    fixture.run_as(a);
    match with_core(|core| condvar::classify_cond_wake(core, cond, 0)) {
        Ok(()) => {}
        other => return fail!("signaled waiter misclassified: {:?}", other),
    }
    with_core(|core| {
        if !core.tasks[a.raw() as usize].is_runnable() {
            return fail!("signaled waiter must be runnable");
        }
        TestResult::Pass
    })
}

pub fn test_cond_signal_wakes_exactly_one() -> TestResult {
    let fixture = IpcFixture::new();
    let a = fixture.spawn(5);
    let b = fixture.spawn(6);
    let cond = match cond_init() {
        Ok(c) => c,
        Err(_) => return fail!("cond_init failed"),
    };

    for &t in &[a, b] {
        with_core(|core| {
            core.tasks[t.raw() as usize].state.insert(TaskState::SEMAPHORE);
            core.rem_ready_current(t.raw());
            core.enqueue_blocked(t.raw(), cond.0.idx);
        });
    }

    let _ = cond_signal(cond);
    let (a_awake, b_awake) = with_core(|core| {
        (
            core.tasks[a.raw() as usize].is_runnable(),
            core.tasks[b.raw() as usize].is_runnable(),
        )
    });
    // Priority queue: A (5) outranks B (6) and wakes first.
    if !a_awake || b_awake {
        return fail!("exactly the strongest waiter must wake");
    }
    TestResult::Pass
}

// --- RW-lock -----------------------------------------------------------------

pub fn test_rwlock_writer_excludes_readers() -> TestResult {
    let fixture = IpcFixture::new();
    let writer = fixture.spawn(5);
    let reader = fixture.spawn(6);
    let rwl = match rwl_init() {
        Ok(r) => r,
        Err(_) => return fail!("rwl_init failed"),
    };

    fixture.run_as(writer);
    if rwl_wrlock_if(rwl).is_err() {
        return fail!("free lock must grant the writer");
    }

    fixture.run_as(reader);
    match rwl_rdlock_if(rwl) {
        Err(RtError::WouldBlock) => {}
        other => return fail!("reader must wait for the writer, got {:?}", other),
    }

    fixture.run_as(writer);
    if rwl_unlock(rwl).is_err() {
        return fail!("writer unlock failed");
    }

    fixture.run_as(reader);
    if rwl_rdlock_if(rwl).is_err() {
        return fail!("released lock must grant the reader");
    }
    let _ = rwl_unlock(rwl);
    TestResult::Pass
}

pub fn test_rwlock_readers_yield_to_queued_writer() -> TestResult {
    let fixture = IpcFixture::new();
    let reader1 = fixture.spawn(10);
    let writer = fixture.spawn(5);
    let reader2 = fixture.spawn(10);
    let rwl = match rwl_init() {
        Ok(r) => r,
        Err(_) => return fail!("rwl_init failed"),
    };

    fixture.run_as(reader1);
    if rwl_rdlock_if(rwl).is_err() {
        return fail!("first reader must pass");
    }

    // A writer of stronger priority parks on the writer gate.
    let wrsem = rwl.wrsem_index();
    with_core(|core| {
        core.tasks[writer.raw() as usize].state.insert(TaskState::SEMAPHORE);
        core.rem_ready_current(writer.raw());
        core.enqueue_blocked(writer.raw(), wrsem);
    });

    // New readers now yield to the queued writer.
    fixture.run_as(reader2);
    match rwl_rdlock_if(rwl) {
        Err(RtError::WouldBlock) => TestResult::Pass,
        other => fail!("reader must yield to a queued writer, got {:?}", other),
    }
}

pub fn test_rwlock_recursive_write_is_error() -> TestResult {
    let fixture = IpcFixture::new();
    let writer = fixture.spawn(5);
    let rwl = match rwl_init() {
        Ok(r) => r,
        Err(_) => return fail!("rwl_init failed"),
    };
    fixture.run_as(writer);
    if rwl_wrlock_if(rwl).is_err() {
        return fail!("first write lock failed");
    }
    match rwl_wrlock_if(rwl) {
        Err(RtError::Busy) => TestResult::Pass,
        other => fail!("recursive write must be an error, got {:?}", other),
    }
}

// --- Recursive spinlock ------------------------------------------------------

pub fn test_spl_recursion_and_foreign_unlock() -> TestResult {
    let fixture = IpcFixture::new();
    let a = fixture.spawn(5);
    let b = fixture.spawn(6);
    static LOCK: SpinLock = SpinLock::new();

    fixture.run_as(a);
    spl_lock(&LOCK);
    spl_lock(&LOCK); // recursive re-entry nests

    fixture.run_as(b);
    match spl_lock_if(&LOCK) {
        Err(RtError::WouldBlock) => {}
        other => return fail!("held lock must refuse another task, got {:?}", other),
    }
    match spl_unlock(&LOCK) {
        Err(RtError::Busy) => {}
        other => return fail!("foreign unlock must fail, got {:?}", other),
    }

    fixture.run_as(a);
    if spl_unlock(&LOCK).is_err() {
        return fail!("inner unlock failed");
    }
    if spl_unlock(&LOCK).is_err() {
        return fail!("outer unlock failed");
    }

    fixture.run_as(b);
    if spl_lock_if(&LOCK).is_err() {
        return fail!("released lock must be takeable");
    }
    let _ = spl_unlock(&LOCK);
    TestResult::Pass
}

define_test_suite!(
    ipc_sync,
    [
        test_cond_wait_releases_mutex_atomically,
        test_cond_signal_wakes_exactly_one,
        test_rwlock_writer_excludes_readers,
        test_rwlock_readers_yield_to_queued_writer,
        test_rwlock_recursive_write_is_error,
        test_spl_recursion_and_foreign_unlock,
    ]
);
