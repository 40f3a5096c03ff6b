//! Low-level context switching.
//!
//! Register switching uses naked functions with `offset_of!`-derived
//! field offsets, so a layout change in [`SwitchContext`] is caught at
//! compile time instead of corrupting a stack at runtime.

use core::arch::naked_asm;
use core::mem::offset_of;

/// Callee-saved register context. Layout consumed by the naked asm
/// below; compile-time assertions pin every offset.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct SwitchContext {
    pub rbx: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub rflags: u64,
    pub rip: u64,
}

impl SwitchContext {
    pub const fn zero() -> Self {
        Self {
            rbx: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rbp: 0,
            rsp: 0,
            rflags: 0x202,
            rip: 0,
        }
    }

    /// Context for a fresh task: first dispatch lands in the trampoline
    /// with the entry function in r12 and its argument in r13.
    pub fn new_for_task(entry: u64, arg: u64, stack_top: u64) -> Self {
        Self {
            rbx: 0,
            r12: entry,
            r13: arg,
            r14: 0,
            r15: 0,
            rbp: 0,
            rsp: stack_top - 8,
            rflags: 0x202,
            rip: task_entry_trampoline as *const () as usize as u64,
        }
    }
}

const _: () = assert!(core::mem::size_of::<SwitchContext>() == 72);

/// FXSAVE area: 512 bytes, 16-byte aligned.
pub const FPU_STATE_SIZE: usize = 512;

#[repr(C, align(16))]
#[derive(Clone, Copy)]
pub struct FpuState {
    pub data: [u8; FPU_STATE_SIZE],
}

impl FpuState {
    /// Default FCW (0x037F) and MXCSR (0x1F80): all exceptions masked.
    pub const fn new() -> Self {
        let mut state = Self {
            data: [0u8; FPU_STATE_SIZE],
        };
        state.data[0] = 0x7F;
        state.data[1] = 0x03;
        state.data[24] = 0x80;
        state.data[25] = 0x1F;
        state
    }
}

impl Default for FpuState {
    fn default() -> Self {
        Self::new()
    }
}

/// Save the FPU/SSE state of the outgoing owner.
///
/// # Safety
/// `state` must point to a valid, 16-aligned [`FpuState`].
#[inline]
pub unsafe fn save_fpenv(state: *mut FpuState) {
    core::arch::asm!("fxsave64 [{}]", in(reg) state, options(nostack));
}

/// Restore the FPU/SSE state of the incoming owner.
///
/// # Safety
/// `state` must point to a valid, 16-aligned [`FpuState`].
#[inline]
pub unsafe fn restore_fpenv(state: *const FpuState) {
    core::arch::asm!("fxrstor64 [{}]", in(reg) state, options(nostack));
}

/// Save CR0 and clear its TS bit so FPU use does not trap while a
/// real-time task runs. Returns the saved CR0 for the host restore.
#[inline]
pub fn save_cr0_and_clts() -> u64 {
    use x86_64::registers::control::{Cr0, Cr0Flags};
    let saved = Cr0::read_raw();
    // SAFETY: clearing TS only affects lazy-FPU trapping.
    unsafe { Cr0::update(|flags| flags.remove(Cr0Flags::TASK_SWITCHED)) };
    saved
}

/// Restore the host's CR0 image when dropping back to the host task.
#[inline]
pub fn restore_cr0(saved: u64) {
    use x86_64::registers::control::Cr0;
    // SAFETY: restoring the exact image captured by save_cr0_and_clts.
    unsafe { Cr0::write_raw(saved) };
}

/// Swap callee-saved register state: save into `prev`, load from `next`.
///
/// # Safety
/// Both contexts must be valid; must run with interrupts disabled; the
/// caller handles FPU and CR0 state separately.
#[unsafe(naked)]
pub unsafe extern "sysv64" fn switch_registers(prev: *mut SwitchContext, next: *const SwitchContext) {
    naked_asm!(
        // rdi = prev, rsi = next. A null prev means the outgoing
        // context is discarded (first dispatch on this CPU).
        "test rdi, rdi",
        "jz 2f",

        "mov [rdi + {off_rbx}], rbx",
        "mov [rdi + {off_r12}], r12",
        "mov [rdi + {off_r13}], r13",
        "mov [rdi + {off_r14}], r14",
        "mov [rdi + {off_r15}], r15",
        "mov [rdi + {off_rbp}], rbp",
        "mov [rdi + {off_rsp}], rsp",

        "pushfq",
        "pop QWORD PTR [rdi + {off_rflags}]",

        "mov rax, [rsp]",
        "mov [rdi + {off_rip}], rax",

        "2:",
        "mov rbx, [rsi + {off_rbx}]",
        "mov r12, [rsi + {off_r12}]",
        "mov r13, [rsi + {off_r13}]",
        "mov r14, [rsi + {off_r14}]",
        "mov r15, [rsi + {off_r15}]",
        "mov rbp, [rsi + {off_rbp}]",

        "push QWORD PTR [rsi + {off_rflags}]",
        "popfq",

        "mov rsp, [rsi + {off_rsp}]",
        "ret",

        off_rbx = const offset_of!(SwitchContext, rbx),
        off_r12 = const offset_of!(SwitchContext, r12),
        off_r13 = const offset_of!(SwitchContext, r13),
        off_r14 = const offset_of!(SwitchContext, r14),
        off_r15 = const offset_of!(SwitchContext, r15),
        off_rbp = const offset_of!(SwitchContext, rbp),
        off_rsp = const offset_of!(SwitchContext, rsp),
        off_rflags = const offset_of!(SwitchContext, rflags),
        off_rip = const offset_of!(SwitchContext, rip),
    );
}

/// Entry trampoline for new tasks: enable interrupts, run the entry
/// function, and self-delete if it ever returns.
#[unsafe(naked)]
pub extern "sysv64" fn task_entry_trampoline() {
    naked_asm!(
        "sti",
        "mov rdi, r13",
        "call r12",
        "call {task_exit}",
        "ud2",
        task_exit = sym crate::api::task_exit_current,
    );
}
