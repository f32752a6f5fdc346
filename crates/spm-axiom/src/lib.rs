//! Audit layer for the Secure Partition Manager
//!
//! Every IPC operation and every partition fault is recorded in an
//! append-only `SysLog` so an operator can reconstruct what led up to a
//! halt. The log is bounded: old events are dropped once it reaches
//! `MAX_SYSLOG_EVENTS`.
//!
//! Identifiers are stored as raw integers so this crate stays independent of
//! `spm-core`.

#![cfg_attr(not(any(test, feature = "std")), no_std)]
extern crate alloc;

pub mod syslog;

pub use syslog::{SpmEvent, SpmEventType, SysLog, MAX_SYSLOG_EVENTS};

/// Monotonic event identifier
pub type EventId = u64;
