#![no_std]
#![allow(unsafe_op_in_unsafe_fn)]

pub mod clock;
pub mod domain;
pub mod host;
pub mod pipeline;
pub mod serial;
pub mod timer;

#[cfg(feature = "itests")]
pub mod clock_tests;
#[cfg(feature = "itests")]
pub mod pipeline_tests;

pub use clock::{count2nano, nano2count, rt_get_cpu_time_ns, rt_get_time, rt_get_time_ns};
pub use domain::{DomainId, stage_disable, stage_enable};
pub use pipeline::{IrqMode, propagate, trigger, virtualize_irq_from};
