#![no_std]
#![allow(unsafe_op_in_unsafe_fn)]

pub mod condvar;
pub mod rwlock;
pub mod sem;
pub mod spl;

#[cfg(feature = "itests")]
pub mod sync_tests;

pub use condvar::{CondVar, cond_broadcast, cond_delete, cond_init, cond_signal, cond_wait,
    cond_wait_timed, cond_wait_until};
pub use rwlock::{RwLock, named_rwl_delete, named_rwl_init, rwl_delete, rwl_init, rwl_rdlock,
    rwl_rdlock_if, rwl_unlock, rwl_wrlock, rwl_wrlock_if};
pub use sem::{Sem, SemKind, named_sem_delete, named_sem_init, sem_broadcast, sem_count,
    sem_delete, sem_init, sem_signal, sem_wait, sem_wait_barrier, sem_wait_if, sem_wait_timed,
    sem_wait_until, typed_sem_init};
pub use spl::{SpinLock, named_spl_delete, named_spl_init, spl_init, spl_lock, spl_lock_if,
    spl_lock_timed, spl_unlock};
