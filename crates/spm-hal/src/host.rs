//! Host HAL for running the SPM as an ordinary process.

use alloc::string::{String, ToString};
use alloc::vec::Vec;
use spin::Mutex;
use std::time::Instant;

use crate::HAL;

/// HAL backed by the host OS.
///
/// Debug output is kept in memory so callers can inspect it, and written to
/// stderr when `echo` is set.
pub struct HostHal {
    start: Instant,
    echo: bool,
    log: Mutex<Vec<String>>,
    faults: Mutex<Vec<(i32, String)>>,
}

impl HostHal {
    pub fn new() -> Self {
        Self::with_echo(false)
    }

    /// Create a host HAL that also prints debug output to stderr.
    pub fn with_echo(echo: bool) -> Self {
        Self {
            start: Instant::now(),
            echo,
            log: Mutex::new(Vec::new()),
            faults: Mutex::new(Vec::new()),
        }
    }

    /// All debug messages written so far
    pub fn debug_log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    /// Check if a specific message was logged
    pub fn has_log_containing(&self, substr: &str) -> bool {
        self.log.lock().iter().any(|msg| msg.contains(substr))
    }

    /// Partitions reported through `partition_faulted`, oldest first
    pub fn faults(&self) -> Vec<(i32, String)> {
        self.faults.lock().clone()
    }
}

impl Default for HostHal {
    fn default() -> Self {
        Self::new()
    }
}

impl HAL for HostHal {
    fn now_nanos(&self) -> u64 {
        self.start.elapsed().as_nanos() as u64
    }

    fn debug_write(&self, msg: &str) {
        if self.echo {
            std::eprintln!("{}", msg);
        }
        self.log.lock().push(msg.to_string());
    }

    fn partition_faulted(&self, partition: i32, reason: &str) {
        self.faults.lock().push((partition, reason.to_string()));
    }
}
