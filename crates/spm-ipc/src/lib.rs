//! IPC Protocol Constants for the Secure Partition Manager
//!
//! This crate defines:
//! - **Status codes** returned by services and by the SPM itself
//! - **Message types** carried by every in-flight request
//! - **Signal layout** of a partition's 32-bit signal set
//! - **Limits** shared by clients, services, and the SPM
//!
//! It is the **single source of truth** for all protocol constants,
//! eliminating duplication across crates.
//!
//! # Signal Layout
//!
//! | Bits  | Meaning                                   |
//! |-------|-------------------------------------------|
//! | 0-2   | Reserved                                  |
//! | 3     | Doorbell (cross-partition notify)         |
//! | 4-31  | Assigned by the manifest to services/IRQs |
//!
//! # Usage
//!
//! ```rust
//! use spm_ipc::{signal, MessageType, Status};
//!
//! assert_eq!(MessageType::from_raw(2), Some(MessageType::Call));
//! assert!(Status::DOES_NOT_EXIST.is_error());
//! assert!(signal::is_single(signal::DOORBELL));
//! ```

#![no_std]

use core::fmt;

// =============================================================================
// Limits
// =============================================================================

/// Maximum number of input (and, separately, output) iovecs per message.
pub const MAX_IOVEC: usize = 4;

/// Identity bit marking a caller outside the trusted boundary.
///
/// `identity()` on a message from a non-secure client returns an id with
/// this bit set, so non-secure ids are always negative as `i32`.
pub const NON_SECURE_CLIENT_FLAG: i32 = i32::MIN;

// =============================================================================
// Status Codes
// =============================================================================

/// Result code delivered to a client by `reply`.
///
/// Negative values are errors drawn from the fixed set below; non-negative
/// values are service-defined success payloads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Status(pub i32);

impl Status {
    pub const SUCCESS: Status = Status(0);

    pub const PROGRAMMER_ERROR: Status = Status(-129);
    pub const CONNECTION_REFUSED: Status = Status(-130);
    pub const CONNECTION_BUSY: Status = Status(-131);
    pub const GENERIC_ERROR: Status = Status(-132);
    pub const NOT_PERMITTED: Status = Status(-133);
    pub const NOT_SUPPORTED: Status = Status(-134);
    pub const INVALID_ARGUMENT: Status = Status(-135);
    pub const INVALID_HANDLE: Status = Status(-136);
    pub const BAD_STATE: Status = Status(-137);
    pub const BUFFER_TOO_SMALL: Status = Status(-138);
    pub const ALREADY_EXISTS: Status = Status(-139);
    pub const DOES_NOT_EXIST: Status = Status(-140);
    pub const INSUFFICIENT_MEMORY: Status = Status(-141);
    pub const INSUFFICIENT_STORAGE: Status = Status(-142);
    pub const INSUFFICIENT_DATA: Status = Status(-143);
    pub const SERVICE_FAILURE: Status = Status(-144);
    pub const COMMUNICATION_FAILURE: Status = Status(-145);
    pub const STORAGE_FAILURE: Status = Status(-146);
    pub const HARDWARE_FAILURE: Status = Status(-147);

    /// Reply status telling the SPM to drop the connection.
    ///
    /// A `CALL` replied with this status marks the channel as dropped;
    /// every later call on it is refused.
    pub const DROP_CONNECTION: Status = Status::CONNECTION_REFUSED;

    /// Key/object slot already holds data.
    pub const OCCUPIED_SLOT: Status = Status::ALREADY_EXISTS;

    /// True for negative (error) codes.
    pub const fn is_error(self) -> bool {
        self.0 < 0
    }

    /// True for zero or any service-defined success payload.
    pub const fn is_success(self) -> bool {
        self.0 >= 0
    }

    /// Symbolic name for known codes.
    pub fn name(self) -> Option<&'static str> {
        let name = match self {
            Status::SUCCESS => "SUCCESS",
            Status::PROGRAMMER_ERROR => "PROGRAMMER_ERROR",
            Status::CONNECTION_REFUSED => "CONNECTION_REFUSED",
            Status::CONNECTION_BUSY => "CONNECTION_BUSY",
            Status::GENERIC_ERROR => "GENERIC_ERROR",
            Status::NOT_PERMITTED => "NOT_PERMITTED",
            Status::NOT_SUPPORTED => "NOT_SUPPORTED",
            Status::INVALID_ARGUMENT => "INVALID_ARGUMENT",
            Status::INVALID_HANDLE => "INVALID_HANDLE",
            Status::BAD_STATE => "BAD_STATE",
            Status::BUFFER_TOO_SMALL => "BUFFER_TOO_SMALL",
            Status::ALREADY_EXISTS => "ALREADY_EXISTS",
            Status::DOES_NOT_EXIST => "DOES_NOT_EXIST",
            Status::INSUFFICIENT_MEMORY => "INSUFFICIENT_MEMORY",
            Status::INSUFFICIENT_STORAGE => "INSUFFICIENT_STORAGE",
            Status::INSUFFICIENT_DATA => "INSUFFICIENT_DATA",
            Status::SERVICE_FAILURE => "SERVICE_FAILURE",
            Status::COMMUNICATION_FAILURE => "COMMUNICATION_FAILURE",
            Status::STORAGE_FAILURE => "STORAGE_FAILURE",
            Status::HARDWARE_FAILURE => "HARDWARE_FAILURE",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} ({})", name, self.0),
            None => write!(f, "{}", self.0),
        }
    }
}

impl From<i32> for Status {
    fn from(raw: i32) -> Self {
        Status(raw)
    }
}

// =============================================================================
// Message Types
// =============================================================================

/// Type tag of an in-flight message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum MessageType {
    /// Client is establishing a channel
    Connect = 1,
    /// Request over an established channel
    Call = 2,
    /// Client is closing the channel
    Disconnect = 3,
}

impl MessageType {
    /// Decode a raw type tag. Anything outside the known set is `None`.
    pub const fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            1 => Some(MessageType::Connect),
            2 => Some(MessageType::Call),
            3 => Some(MessageType::Disconnect),
            _ => None,
        }
    }

    /// Raw wire value.
    pub const fn as_raw(self) -> i32 {
        self as i32
    }
}

// =============================================================================
// Wait Policy
// =============================================================================

/// How long `wait_any` may suspend the caller.
///
/// Finite durations are not supported.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Timeout {
    /// Suspend until at least one watched signal is asserted
    Block,
    /// Return the current signal set immediately
    Poll,
}

// =============================================================================
// Signals
// =============================================================================

/// Signal bit layout and helpers.
pub mod signal {
    /// Bits 0-2, never assigned.
    pub const RESERVED_MASK: u32 = 0b0111;

    /// Doorbell bit asserted by `notify` and cleared by `clear`.
    pub const DOORBELL: u32 = 1 << 3;

    /// First bit number a manifest may assign to a service or IRQ.
    pub const FIRST_ASSIGNABLE_BIT: u32 = 4;

    /// Mask of every bit a manifest may assign.
    pub const ASSIGNABLE_MASK: u32 = !(RESERVED_MASK | DOORBELL);

    /// Signal mask for bit number `bit`.
    pub const fn from_bit(bit: u32) -> u32 {
        1 << bit
    }

    /// True if exactly one bit is set.
    pub const fn is_single(signal: u32) -> bool {
        signal != 0 && signal & (signal - 1) == 0
    }

    /// True if `signal` is a single bit a manifest may assign.
    pub const fn is_assignable(signal: u32) -> bool {
        is_single(signal) && signal & ASSIGNABLE_MASK == signal
    }

    /// Iterate the set bits of `signals`, lowest first.
    pub fn iter(signals: u32) -> impl Iterator<Item = u32> {
        (0..32u32)
            .map(|bit| 1u32 << bit)
            .filter(move |mask| signals & mask != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_round_trip() {
        for kind in [MessageType::Connect, MessageType::Call, MessageType::Disconnect] {
            assert_eq!(MessageType::from_raw(kind.as_raw()), Some(kind));
        }
        assert_eq!(MessageType::from_raw(0), None);
        assert_eq!(MessageType::from_raw(-1), None);
        assert_eq!(MessageType::from_raw(4), None);
    }

    #[test]
    fn test_status_aliases() {
        assert_eq!(Status::DROP_CONNECTION, Status::CONNECTION_REFUSED);
        assert_eq!(Status::OCCUPIED_SLOT, Status::ALREADY_EXISTS);
        assert!(Status::SUCCESS.is_success());
        assert!(Status(7).is_success());
        assert!(Status::STORAGE_FAILURE.is_error());
        assert_eq!(Status(7).name(), None);
    }

    #[test]
    fn test_signal_helpers() {
        assert!(signal::is_single(signal::DOORBELL));
        assert!(!signal::is_single(0));
        assert!(!signal::is_single(0b1010));
        assert!(!signal::is_assignable(signal::DOORBELL));
        assert!(!signal::is_assignable(1));
        assert!(signal::is_assignable(signal::from_bit(4)));
        assert!(signal::is_assignable(signal::from_bit(31)));

        let bits: [u32; 3] = [1 << 3, 1 << 4, 1 << 31];
        let mut iter = signal::iter(bits[0] | bits[1] | bits[2]);
        assert_eq!(iter.next(), Some(bits[0]));
        assert_eq!(iter.next(), Some(bits[1]));
        assert_eq!(iter.next(), Some(bits[2]));
        assert_eq!(iter.next(), None);
    }

    #[test]
    fn test_non_secure_flag_is_high_bit() {
        assert_eq!(NON_SECURE_CLIENT_FLAG as u32, 0x8000_0000);
    }
}
