//! Secure Partition Manager Core - Pure State Machine
//!
//! This crate contains the **pure, HAL-free** state of the Secure Partition
//! Manager (SPM): the handle tables naming channels and in-flight messages,
//! the IPC message state machine, and the protection-unit evaluator.
//!
//! # Design Principles
//!
//! 1. **No HAL dependency**: Threads, blocking and logging live in `spm-kernel`
//! 2. **No I/O or side effects**: Pure state transformations only
//! 3. **Deterministic**: Same input always produces same output
//! 4. **Handles, not pointers**: Partitions only ever hold opaque handles
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        spm-core                             │
//! │                  (Pure State Machine)                       │
//! │                                                             │
//! │   ┌───────────────┐    ┌───────────────┐                   │
//! │   │    SpmCore    │    │  HandleTable  │                   │
//! │   │  - partitions │───▶│  - channels   │                   │
//! │   │  - services   │    │  - messages   │                   │
//! │   └───────────────┘    └───────────────┘                   │
//! │                                                             │
//! │   ┌───────────────┐    ┌───────────────┐                   │
//! │   │  Protection   │    │  Invariants   │                   │
//! │   │  evaluator    │    │  Assertions   │                   │
//! │   └───────────────┘    └───────────────┘                   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              │ used by
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       spm-kernel                            │
//! │                   (Runtime Wrapper)                         │
//! │                                                             │
//! │   - One thread per partition, blocking wait/call            │
//! │   - HAL integration (debug output, timing)                  │
//! │   - SysLog audit trail                                      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! - `types` - Identifiers and partition/service descriptors
//! - `handle` - Generation-tagged handle table
//! - `ipc` - `SpmCore`: channels, messages, signals
//! - `protection` - MPU/SMPU/PPU region tiers and access decisions
//! - `invariants` - Runtime-checkable invariant assertions

#![cfg_attr(not(any(test, feature = "std")), no_std)]
extern crate alloc;

pub mod handle;
pub mod invariants;
pub mod ipc;
pub mod protection;
pub mod types;

// Re-export all public types for convenient access
pub use handle::{Handle, HandleEntry, HandleError, HandleTable, MAX_TABLE_CAPACITY};
pub use invariants::{assert_invariants, check_all_invariants, InvariantViolation};
pub use ipc::{
    CallTicket, Channel, Completion, IpcError, Message, MessageInfo, MessageState, Partition,
    ProtocolViolation, Service, SpmCore,
};
pub use protection::{
    AccessDecision, AccessPermission, AccessRequest, BusMaster, ContextMask, DenyReason,
    ProtectionConfig, ProtectionConfigError, ProtectionContext, ProtectionRegion, TierKind,
    TierVerdict,
};
pub use types::{
    MinorPolicy, PartitionDescriptor, PartitionId, PartitionState, ServiceDescriptor, Sid,
};

pub use spm_ipc::{MessageType, Status, Timeout, MAX_IOVEC};
