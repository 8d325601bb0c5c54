//! Platform-specific mapping, futex and process helpers
//!
//! Sessions live in `/dev/shm` and block on Linux futexes, so only Linux is
//! supported.

#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(target_os = "linux")]
pub use linux::*;
