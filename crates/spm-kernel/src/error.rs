//! Runtime errors.

use spm_core::{HandleError, IpcError, PartitionId, ProtocolViolation, Status};

use crate::config::ConfigError;

/// Errors returned by the blocking runtime.
#[derive(Clone, Debug, thiserror::Error)]
pub enum SpmError {
    /// Client-side request refused before reaching the service.
    #[error("IPC error: {0}")]
    Ipc(IpcError),

    /// The calling partition broke the IPC protocol and has been halted.
    #[error("protocol violation: {0}")]
    Violation(ProtocolViolation),

    /// The calling partition was halted earlier.
    #[error("partition {0} is halted")]
    Halted(PartitionId),

    /// The service replied to CONNECT with an error.
    #[error("connection rejected: {0}")]
    Rejected(Status),

    /// The runtime is stopping; partition loops should return.
    #[error("SPM is shutting down")]
    Shutdown,

    /// A thread panicked while holding the SPM lock.
    #[error("SPM state lock poisoned")]
    Poisoned,

    #[error("unknown partition {0}")]
    UnknownPartition(PartitionId),

    #[error("unknown IRQ line {0}")]
    UnknownIrqLine(u32),

    /// A partition runner was started without a handler for these signals.
    #[error("no handler for signals {0:#x}")]
    UnhandledSignal(u32),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("audit export failed: {0}")]
    Audit(String),
}

impl SpmError {
    /// Status code equivalent, for reporting across the IPC boundary.
    pub fn status(&self) -> Status {
        match self {
            SpmError::Ipc(err) => err.status(),
            SpmError::Violation(_) => Status::PROGRAMMER_ERROR,
            SpmError::Halted(_) => Status::CONNECTION_REFUSED,
            SpmError::Rejected(status) => *status,
            SpmError::Shutdown => Status::SERVICE_FAILURE,
            SpmError::UnknownPartition(_) | SpmError::UnknownIrqLine(_) => Status::DOES_NOT_EXIST,
            SpmError::UnhandledSignal(_) | SpmError::Config(_) => Status::INVALID_ARGUMENT,
            SpmError::Poisoned | SpmError::Audit(_) => Status::GENERIC_ERROR,
        }
    }
}

impl From<IpcError> for SpmError {
    fn from(err: IpcError) -> Self {
        SpmError::Ipc(err)
    }
}

impl From<HandleError> for SpmError {
    fn from(err: HandleError) -> Self {
        SpmError::Ipc(IpcError::Handle(err))
    }
}
