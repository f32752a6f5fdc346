//! Hardware Abstraction Layer trait for the Secure Partition Manager
//!
//! The SPM runtime only needs a few platform services: a monotonic clock
//! for the audit trail, a debug console and a hook invoked when a partition
//! is halted. Threads and blocking are provided by the runtime itself.
//!
//! # Platform Implementations
//!
//! - **Host**: `HostHal` (feature `std`), clock from `std::time::Instant`,
//!   debug output captured in memory and optionally echoed to stderr
//! - **Device**: a board crate implementing `HAL` over its UART and timer

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

#[cfg(feature = "std")]
mod host;

#[cfg(feature = "std")]
pub use host::HostHal;

/// Hardware Abstraction Layer trait
///
/// Implementations must be shareable between partition threads.
pub trait HAL: Send + Sync + 'static {
    // === Time ===

    /// Get current time in nanoseconds (monotonic)
    fn now_nanos(&self) -> u64;

    // === Debug ===

    /// Write a debug message to the platform's console/log
    fn debug_write(&self, msg: &str);

    // === Fault handling ===

    /// Called after a partition has been halted for a protocol violation.
    ///
    /// `partition` is the raw partition id. The default does nothing.
    fn partition_faulted(&self, _partition: i32, _reason: &str) {}
}
