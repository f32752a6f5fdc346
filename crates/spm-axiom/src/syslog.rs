//! System Event Log (SysLog)
//!
//! Records IPC requests, dispatches, completions and faults for audit.

use alloc::string::String;
use alloc::vec::Vec;
use serde::{Deserialize, Serialize};

use crate::EventId;

/// One audited event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpmEvent {
    /// Unique event ID (monotonic)
    pub id: EventId,
    /// Partition (or non-secure caller) the event concerns
    pub partition: i32,
    /// Timestamp (nanos since boot)
    pub timestamp: u64,
    pub event_type: SpmEventType,
}

/// Type of audited event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpmEventType {
    /// Partition registered at boot
    PartitionRegistered { name: String, services: u32 },
    /// Client opened a channel
    Connect {
        sid: u32,
        minor_version: u32,
        channel: u32,
    },
    /// Client submitted a message on a channel
    Call { channel: u32, raw_type: i32 },
    /// Client closed a channel
    Disconnect { channel: u32 },
    /// Server fetched a message
    Dispatched {
        message: u32,
        sid: u32,
        raw_type: i32,
    },
    /// Server replied to a message
    Completed { message: u32, status: i32 },
    /// Doorbell rung on `target`
    Doorbell { target: i32 },
    /// Interrupt signal asserted
    Interrupt { signal: u32 },
    /// Operation refused with an error status
    Rejected { operation: String, status: i32 },
    /// Protocol violation by the partition
    Violation { reason: String },
    /// Partition halted; `released` messages were completed on its behalf
    Halted { released: u32 },
}

/// Maximum number of events to keep in memory
pub const MAX_SYSLOG_EVENTS: usize = 10000;

/// System event log for auditing.
///
/// Events are append-only with monotonic IDs.
pub struct SysLog {
    /// Event entries (append-only)
    events: Vec<SpmEvent>,
    /// Next event ID to assign
    next_id: EventId,
}

impl SysLog {
    /// Create a new empty SysLog.
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            next_id: 0,
        }
    }

    /// Record an event. Returns its ID.
    pub fn log(&mut self, partition: i32, event_type: SpmEventType, timestamp: u64) -> EventId {
        let id = self.next_id;
        self.next_id += 1;

        self.events.push(SpmEvent {
            id,
            partition,
            timestamp,
            event_type,
        });

        self.trim_if_needed();
        id
    }

    /// Get all events.
    pub fn events(&self) -> &[SpmEvent] {
        &self.events
    }

    /// Get events in a sequence range.
    pub fn get_range(&self, start_id: EventId, end_id: EventId) -> Vec<&SpmEvent> {
        self.events
            .iter()
            .filter(|e| e.id >= start_id && e.id < end_id)
            .collect()
    }

    /// Get the most recent N events.
    pub fn get_recent(&self, count: usize) -> Vec<&SpmEvent> {
        self.events.iter().rev().take(count).collect()
    }

    /// Events concerning one partition, oldest first.
    pub fn for_partition(&self, partition: i32) -> Vec<&SpmEvent> {
        self.events
            .iter()
            .filter(|e| e.partition == partition)
            .collect()
    }

    /// Serialize the retained events as a JSON array.
    pub fn export_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.events)
    }

    /// Get the number of events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Check if the log is empty.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Get the next event ID.
    pub fn next_id(&self) -> EventId {
        self.next_id
    }

    /// Trim old events if exceeding max capacity.
    fn trim_if_needed(&mut self) {
        if self.events.len() > MAX_SYSLOG_EVENTS {
            let drain_count = self.events.len() - MAX_SYSLOG_EVENTS;
            self.events.drain(0..drain_count);
        }
    }
}

impl Default for SysLog {
    fn default() -> Self {
        Self::new()
    }
}
