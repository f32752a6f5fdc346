//! Core SPM types
//!
//! Identifiers and static descriptors shared by the handle tables, the IPC
//! state machine and the runtime. All types here are pure data.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use serde::{Deserialize, Serialize};
use spm_ipc::NON_SECURE_CLIENT_FLAG;

/// Partition (or client) identifier.
///
/// Secure partitions use non-negative ids. Non-secure callers carry the
/// high bit, so they are negative when viewed as `i32`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionId(pub i32);

impl PartitionId {
    /// Identity of a non-secure caller with the given raw number.
    pub const fn non_secure(raw: i32) -> Self {
        PartitionId(raw | NON_SECURE_CLIENT_FLAG)
    }

    /// True if the caller is outside the trusted boundary.
    pub const fn is_non_secure(self) -> bool {
        self.0 & NON_SECURE_CLIENT_FLAG != 0
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_non_secure() {
            write!(f, "ns:{}", self.0 & !NON_SECURE_CLIENT_FLAG)
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Service identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Sid(pub u32);

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Partition state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionState {
    /// Partition is running
    Running,
    /// Partition is parked in `wait_any`
    Blocked,
    /// Partition violated the IPC protocol and was stopped
    Halted,
}

/// How a connecting client's requested minor version is checked.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MinorPolicy {
    /// Requested version must equal the declared version
    #[default]
    Strict,
    /// Requested version must not exceed the declared version
    Relaxed,
}

impl MinorPolicy {
    /// True if a client asking for `requested` may connect to a service
    /// declaring `declared`.
    pub fn accepts(self, requested: u32, declared: u32) -> bool {
        match self {
            MinorPolicy::Strict => requested == declared,
            MinorPolicy::Relaxed => requested <= declared,
        }
    }
}

/// Static description of one service exposed by a partition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    /// Service identifier clients connect to
    pub sid: Sid,
    /// Signal mask asserted while messages are pending (single bit)
    pub signal: u32,
    /// Whether non-secure clients may connect
    pub nspe_callable: bool,
    /// Declared minor version
    pub minor_version: u32,
    /// Version check applied on connect
    pub minor_policy: MinorPolicy,
}

/// Static description of a partition, as registered with `SpmCore`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionDescriptor {
    /// Partition ID
    pub id: PartitionId,
    /// Partition name (diagnostics only)
    pub name: String,
    /// Services hosted by this partition
    pub services: Vec<ServiceDescriptor>,
    /// Signals reserved for interrupts routed to this partition
    pub interrupt_signals: u32,
    /// Services in other partitions this partition may connect to
    pub extern_sids: Vec<Sid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_secure_identity() {
        let ns = PartitionId::non_secure(5);
        assert!(ns.is_non_secure());
        assert!(ns.0 < 0);
        assert!(!PartitionId(5).is_non_secure());
        assert_eq!(alloc::format!("{}", ns), "ns:5");
        assert_eq!(alloc::format!("{}", PartitionId(5)), "5");
    }

    #[test]
    fn test_minor_policy() {
        assert!(MinorPolicy::Strict.accepts(2, 2));
        assert!(!MinorPolicy::Strict.accepts(1, 2));
        assert!(MinorPolicy::Relaxed.accepts(1, 2));
        assert!(!MinorPolicy::Relaxed.accepts(3, 2));
    }

    #[test]
    fn test_minor_policy_serde_names() {
        let policy: MinorPolicy = serde_json::from_str("\"relaxed\"").unwrap();
        assert_eq!(policy, MinorPolicy::Relaxed);
        assert!(serde_json::from_str::<MinorPolicy>("\"loose\"").is_err());
    }
}
