//! Kernel logging.
//!
//! All log output funnels through a single backend function pointer.
//! Before a serial driver registers itself the fallback writes raw bytes
//! to COM1, which is safe from any context. The backend receives the
//! pre-formatted arguments for one line and must write the text plus a
//! trailing newline atomically with respect to other CPUs.
//!
//! Logging never blocks and is never called from the timer fast path;
//! failures that cannot be reported to a caller are funnelled here from
//! non-real-time context.

use core::fmt;
use core::sync::atomic::{AtomicPtr, AtomicU8, Ordering};

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KlogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
}

static CURRENT_LEVEL: AtomicU8 = AtomicU8::new(KlogLevel::Info as u8);

#[inline(always)]
pub fn klog_is_enabled(level: KlogLevel) -> bool {
    level as u8 <= CURRENT_LEVEL.load(Ordering::Relaxed)
}

pub fn klog_set_level(level: KlogLevel) {
    CURRENT_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Signature of a klog backend.
pub type KlogBackend = fn(fmt::Arguments<'_>);

/// Stored as a raw pointer; null means "use the early COM1 fallback".
static BACKEND: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

const COM1_DATA: u16 = 0x3F8;

fn early_backend(args: fmt::Arguments<'_>) {
    use x86_64::instructions::port::Port;

    struct EarlyWriter;

    impl fmt::Write for EarlyWriter {
        fn write_str(&mut self, s: &str) -> fmt::Result {
            let mut port: Port<u8> = Port::new(COM1_DATA);
            for byte in s.bytes() {
                unsafe { port.write(byte) };
            }
            Ok(())
        }
    }

    let _ = fmt::write(&mut EarlyWriter, args);
    let mut port: Port<u8> = Port::new(COM1_DATA);
    unsafe {
        port.write(b'\r');
        port.write(b'\n');
    }
}

/// Register a backend that replaces the early COM1 fallback.
pub fn klog_register_backend(backend: KlogBackend) {
    BACKEND.store(backend as *mut (), Ordering::Release);
}

#[doc(hidden)]
pub fn klog_dispatch(level: KlogLevel, args: fmt::Arguments<'_>) {
    if !klog_is_enabled(level) {
        return;
    }
    let ptr = BACKEND.load(Ordering::Acquire);
    if ptr.is_null() {
        early_backend(args);
    } else {
        // SAFETY: only valid `KlogBackend` fn pointers are ever stored,
        // and fn pointers are pointer-sized on x86_64.
        let backend: KlogBackend = unsafe { core::mem::transmute(ptr) };
        backend(args);
    }
}

#[macro_export]
macro_rules! klog_error {
    ($($arg:tt)*) => {
        $crate::klog::klog_dispatch($crate::klog::KlogLevel::Error, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! klog_warn {
    ($($arg:tt)*) => {
        $crate::klog::klog_dispatch($crate::klog::KlogLevel::Warn, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! klog_info {
    ($($arg:tt)*) => {
        $crate::klog::klog_dispatch($crate::klog::KlogLevel::Info, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! klog_debug {
    ($($arg:tt)*) => {
        $crate::klog::klog_dispatch($crate::klog::KlogLevel::Debug, format_args!($($arg)*))
    };
}
