#![no_std]
#![allow(unsafe_op_in_unsafe_fn)]

pub mod cpu;
pub mod init_flag;
pub mod klog;
pub mod math;
pub mod pcr;
pub mod preempt;
pub mod spinlock;
pub mod testing;

pub mod tsc {
    use core::arch::asm;

    #[inline(always)]
    pub fn rdtsc() -> u64 {
        let lo: u32;
        let hi: u32;
        unsafe {
            asm!(
                "rdtsc",
                out("eax") lo,
                out("edx") hi,
                options(nomem, nostack, preserves_flags)
            );
        }
        ((hi as u64) << 32) | (lo as u64)
    }
}

#[doc(hidden)]
pub use paste;

pub use init_flag::InitFlag;
pub use klog::{KlogLevel, klog_register_backend, klog_set_level};
pub use math::{imuldiv, llimd};
pub use pcr::{
    MAX_CPUS, cpu_count, current_cpu_id, is_cpu_online, is_cpu_realtime, mark_cpu_offline,
    mark_cpu_online, mark_cpu_realtime, register_cpu_id_fn, register_send_ipi_fn, send_ipi_to_cpu,
    set_cpu_count,
};
pub use preempt::{PreemptGuard, is_preemption_disabled, preempt_count};
pub use spinlock::{IrqMutex, IrqMutexGuard, IrqRwLock, IrqRwLockReadGuard, IrqRwLockWriteGuard};
