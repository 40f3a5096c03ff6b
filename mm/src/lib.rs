#![no_std]
#![allow(unsafe_op_in_unsafe_fn)]

pub mod heap;
pub mod stack_pool;

#[cfg(feature = "itests")]
pub mod heap_tests;

pub use heap::{heap_init, rt_free, rt_malloc};
pub use stack_pool::{alloc_stack, defer_free_stack, drain_deferred_frees};
