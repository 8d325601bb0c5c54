//! Shared memory contract between producer and trusted consumer.
//!
//! This module contains:
//! - `consts`: region limits, batch capacity, naming and digest constants.
//! - `layout`: the `repr(C)` blocks that make up a mapped region.
//! - `batch`: the fixed-capacity batch a producer flushes in one go.

pub mod batch;
pub mod consts;
pub mod layout;
