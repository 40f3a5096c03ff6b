#![no_std]
#![allow(unsafe_op_in_unsafe_fn)]

pub mod config;
pub mod error;
pub mod task;
pub mod time;

pub use error::RtError;
pub use time::{RTime, RT_TIME_END};
