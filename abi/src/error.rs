//! Error kinds returned by kernel-entry operations.
//!
//! Every operation returns a single discriminated result; there are no
//! panics in the fast path. The discriminants double as the negative
//! C-style codes used at FFI-facing seams via [`RtError::as_errno`].

use core::ffi::c_int;

#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RtError {
    /// Bad handle, bad magic, or out-of-range argument.
    InvalidArg = 22,
    /// Out of arena slots, stack memory, or registry slots.
    NoResource = 12,
    /// Resource held or reserved by another task.
    Busy = 16,
    /// A timed wait reached its deadline before the event arrived.
    Timeout = 110,
    /// The waiter was explicitly unblocked.
    Interrupted = 4,
    /// The object was deleted while the caller waited on it.
    Destroyed = 43,
    /// Non-blocking wait found no resource available.
    WouldBlock = 11,
    /// Caller passed an address the kernel refuses to touch.
    Fault = 14,
    /// A periodic task missed one or more release points.
    Overrun = 75,
}

impl RtError {
    /// The conventional negative errno-style value.
    #[inline]
    pub const fn as_errno(self) -> c_int {
        -(self as c_int)
    }

    #[inline]
    pub const fn from_errno(raw: c_int) -> Option<Self> {
        match -raw {
            22 => Some(Self::InvalidArg),
            12 => Some(Self::NoResource),
            16 => Some(Self::Busy),
            110 => Some(Self::Timeout),
            4 => Some(Self::Interrupted),
            43 => Some(Self::Destroyed),
            11 => Some(Self::WouldBlock),
            14 => Some(Self::Fault),
            75 => Some(Self::Overrun),
            _ => None,
        }
    }
}

pub type RtResult<T> = core::result::Result<T, RtError>;
