//! Platform lifecycle service.
//!
//! Exposes the device lifecycle state through two services: one returns
//! the current state, the other forwards a change request. Both exchange a
//! single little-endian `u32`; any other buffer size drops the connection.

use std::sync::Arc;

use spin::Mutex;
use spm_core::{Sid, Status};
use spm_hal::HAL;
use spm_kernel::{PartitionRunner, Request, ServiceHandler, SpmError};

/// Wire size of a lifecycle state.
pub const LIFECYCLE_STATE_SIZE: usize = 4;

/// Lifecycle state values.
pub mod lifecycle {
    pub const UNKNOWN: u32 = 0x0000;
    pub const ASSEMBLY_AND_TEST: u32 = 0x1000;
    pub const PSA_ROT_PROVISIONING: u32 = 0x2000;
    pub const SECURED: u32 = 0x3000;
    pub const NON_PSA_ROT_DEBUG: u32 = 0x4000;
    pub const RECOVERABLE_PSA_ROT_DEBUG: u32 = 0x5000;
    pub const DECOMMISSIONED: u32 = 0x6000;

    pub fn is_valid(state: u32) -> bool {
        state & 0x0fff == 0 && state <= DECOMMISSIONED
    }
}

/// Platform backend holding the lifecycle state.
pub trait Lifecycle: Send {
    fn state(&mut self) -> Result<u32, Status>;

    /// Ask the platform to move to `state`.
    fn request_change(&mut self, state: u32) -> Status;
}

/// Lifecycle kept in memory; only forward transitions are accepted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryLifecycle {
    state: u32,
}

impl MemoryLifecycle {
    pub fn new(state: u32) -> Self {
        Self { state }
    }
}

impl Default for MemoryLifecycle {
    fn default() -> Self {
        Self::new(lifecycle::ASSEMBLY_AND_TEST)
    }
}

impl Lifecycle for MemoryLifecycle {
    fn state(&mut self) -> Result<u32, Status> {
        Ok(self.state)
    }

    fn request_change(&mut self, state: u32) -> Status {
        if !lifecycle::is_valid(state) {
            return Status::INVALID_ARGUMENT;
        }
        if state <= self.state {
            return Status::NOT_PERMITTED;
        }
        self.state = state;
        Status::SUCCESS
    }
}

// ============================================================================
// Handlers
// ============================================================================

struct LifecycleGet<L>(Arc<Mutex<L>>);

impl<L: Lifecycle> ServiceHandler for LifecycleGet<L> {
    fn call(&mut self, request: &mut Request<'_>) -> Result<Status, SpmError> {
        if request.out_size(0) != LIFECYCLE_STATE_SIZE {
            return Ok(Status::DROP_CONNECTION);
        }

        let state = self.0.lock().state();
        match state {
            Ok(state) => {
                request.write(0, 0, &state.to_le_bytes())?;
                Ok(Status::SUCCESS)
            }
            Err(status) => Ok(status),
        }
    }
}

struct LifecycleSet<L>(Arc<Mutex<L>>);

impl<L: Lifecycle> ServiceHandler for LifecycleSet<L> {
    fn call(&mut self, request: &mut Request<'_>) -> Result<Status, SpmError> {
        if request.in_size(0) != LIFECYCLE_STATE_SIZE {
            return Ok(Status::DROP_CONNECTION);
        }
        let mut raw = [0u8; LIFECYCLE_STATE_SIZE];
        if request.read(0, &mut raw)? != LIFECYCLE_STATE_SIZE {
            return Ok(Status::DROP_CONNECTION);
        }

        Ok(self.0.lock().request_change(u32::from_le_bytes(raw)))
    }
}

/// Register the lifecycle get/set services on `runner`.
///
/// Returns the shared backend so the host can observe state changes.
pub fn register_platform_services<H: HAL, L: Lifecycle + 'static>(
    runner: &mut PartitionRunner<H>,
    get_sid: Sid,
    set_sid: Sid,
    lifecycle: L,
) -> Result<Arc<Mutex<L>>, SpmError> {
    let shared = Arc::new(Mutex::new(lifecycle));
    runner
        .register_service(get_sid, LifecycleGet(Arc::clone(&shared)))?
        .register_service(set_sid, LifecycleSet(Arc::clone(&shared)))?;
    Ok(shared)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_values() {
        assert!(lifecycle::is_valid(lifecycle::SECURED));
        assert!(!lifecycle::is_valid(0x3001));
        assert!(!lifecycle::is_valid(0x7000));
    }

    #[test]
    fn test_memory_lifecycle_moves_forward_only() {
        let mut lc = MemoryLifecycle::default();
        assert_eq!(lc.request_change(lifecycle::SECURED), Status::SUCCESS);
        assert_eq!(lc.state(), Ok(lifecycle::SECURED));
        assert_eq!(
            lc.request_change(lifecycle::ASSEMBLY_AND_TEST),
            Status::NOT_PERMITTED
        );
        assert_eq!(lc.request_change(0x1234), Status::INVALID_ARGUMENT);
    }
}
