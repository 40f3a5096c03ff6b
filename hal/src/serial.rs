//! Serial klog backend.
//!
//! Replaces the early raw-port fallback once initialised. Output is a
//! single lock acquisition per line so lines from different CPUs do not
//! interleave.

use core::fmt::{self, Write};

use quartz_lib::IrqMutex;
use uart_16550::SerialPort;

const COM1_BASE: u16 = 0x3F8;

static SERIAL: IrqMutex<Option<SerialPort>> = IrqMutex::new(None);

fn serial_backend(args: fmt::Arguments<'_>) {
    let mut guard = SERIAL.lock();
    if let Some(port) = guard.as_mut() {
        let _ = port.write_fmt(args);
        let _ = port.write_str("\r\n");
    }
}

/// Initialise COM1 and register it as the klog backend.
pub fn serial_init() {
    {
        let mut guard = SERIAL.lock();
        if guard.is_none() {
            // SAFETY: standard COM1 base; no other owner once the
            // co-kernel is loaded.
            let mut port = unsafe { SerialPort::new(COM1_BASE) };
            port.init();
            *guard = Some(port);
        }
    }
    quartz_lib::klog_register_backend(serial_backend);
}
