//! Interrupt flag management: sti, cli, irqsave/irqrestore.
//!
//! These manipulate the *physical* interrupt flag. Code running above the
//! pipeline should normally use the per-domain stage flag instead; hard
//! cli/sti is reserved for the dispatcher's own bookkeeping and the
//! innermost scheduler sections.

use core::arch::asm;

#[inline(always)]
pub fn enable_interrupts() {
    unsafe {
        asm!("sti", options(nomem, nostack));
    }
}

#[inline(always)]
pub fn disable_interrupts() {
    unsafe {
        asm!("cli", options(nomem, nostack));
    }
}

/// Save RFLAGS and disable interrupts (irqsave pattern).
#[inline(always)]
pub fn save_flags_cli() -> u64 {
    let flags: u64;
    unsafe {
        asm!(
            "pushfq",
            "pop {}",
            "cli",
            out(reg) flags,
            options(nomem)
        );
    }
    flags
}

/// Restore the interrupt flag from saved RFLAGS. Only re-enables
/// interrupts if they were enabled in the saved value.
#[inline(always)]
pub fn restore_flags(flags: u64) {
    if flags & (1 << 9) != 0 {
        enable_interrupts();
    }
}

#[inline(always)]
pub fn read_rflags() -> u64 {
    let flags: u64;
    unsafe {
        asm!("pushfq; pop {}", out(reg) flags, options(nomem, preserves_flags));
    }
    flags
}

#[inline(always)]
pub fn are_interrupts_enabled() -> bool {
    (read_rflags() & (1 << 9)) != 0
}

/// Halt until the next interrupt.
#[inline(always)]
pub fn halt() {
    x86_64::instructions::hlt();
}
