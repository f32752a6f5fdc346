//! Runtime-checkable SPM invariants
//!
//! These hold after every completed `SpmCore` operation. They are used for
//! runtime assertion checking in the kernel's debug builds and by the
//! property tests.
//!
//! # Invariants
//!
//! 1. **Message Channel Liveness**: Every in-flight message refers to a live channel
//! 2. **Pending Queue Consistency**: Service queues hold exactly the pending messages
//! 3. **Channel Busy Consistency**: A channel is busy iff a message travels on it
//! 4. **Halted Quiescence**: A halted partition holds no messages
//! 5. **Service Registry**: Channels and services refer to registered entities
//! 6. **Signal Uniqueness**: A partition's signals are distinct and assignable
//! 7. **Handle Ownership**: Table owners match the objects' roles

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use crate::handle::Handle;
use crate::ipc::{MessageState, SpmCore};
use crate::types::PartitionState;
use spm_ipc::signal;

/// An invariant violation with details
#[derive(Clone, Debug)]
pub struct InvariantViolation {
    /// Name of the violated invariant
    pub invariant: &'static str,
    /// Description of what went wrong
    pub description: String,
}

/// Check all SPM invariants.
///
/// Returns a list of violations (empty if all invariants hold).
pub fn check_all_invariants(core: &SpmCore) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    violations.extend(check_message_channel_liveness(core));
    violations.extend(check_pending_queue_consistency(core));
    violations.extend(check_channel_busy_consistency(core));
    violations.extend(check_halted_quiescence(core));
    violations.extend(check_service_registry(core));
    violations.extend(check_signal_uniqueness(core));
    violations.extend(check_handle_ownership(core));

    violations
}

/// Assert all invariants hold (panic if not)
pub fn assert_invariants(core: &SpmCore) {
    let violations = check_all_invariants(core);
    if let Some(v) = violations.first() {
        panic!("Invariant violated: {} ({})", v.invariant, v.description);
    }
}

/// Invariant 1: Every in-flight message refers to a live channel
fn check_message_channel_liveness(core: &SpmCore) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    for entry in core.messages.iter() {
        let message = entry.value();
        if !core.channels.contains(message.channel) {
            violations.push(InvariantViolation {
                invariant: "message_channel_liveness",
                description: alloc::format!(
                    "Message {} refers to dead channel {}",
                    entry.handle(),
                    message.channel
                ),
            });
        }
        if message.state == MessageState::Completed {
            violations.push(InvariantViolation {
                invariant: "message_channel_liveness",
                description: alloc::format!(
                    "Completed message {} still holds a handle",
                    entry.handle()
                ),
            });
        }
    }

    violations
}

/// Invariant 2: Every pending message is queued exactly once on its service,
/// and queues hold nothing else
fn check_pending_queue_consistency(core: &SpmCore) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    let mut queued: BTreeMap<Handle, usize> = BTreeMap::new();

    for (sid, service) in &core.services {
        for &handle in &service.pending {
            *queued.entry(handle).or_insert(0) += 1;

            let Some(entry) = core.messages.iter().find(|e| e.handle() == handle) else {
                violations.push(InvariantViolation {
                    invariant: "pending_queue_consistency",
                    description: alloc::format!(
                        "Service {} queues dead message {}",
                        sid,
                        handle
                    ),
                });
                continue;
            };
            let message = entry.value();
            if message.state != MessageState::Pending || message.sid != *sid {
                violations.push(InvariantViolation {
                    invariant: "pending_queue_consistency",
                    description: alloc::format!(
                        "Service {} queues message {} ({:?} for {})",
                        sid,
                        handle,
                        message.state,
                        message.sid
                    ),
                });
            }
        }
    }

    for (handle, count) in &queued {
        if *count > 1 {
            violations.push(InvariantViolation {
                invariant: "pending_queue_consistency",
                description: alloc::format!("Message {} queued {} times", handle, count),
            });
        }
    }

    for entry in core.messages.iter() {
        if entry.value().state == MessageState::Pending && !queued.contains_key(&entry.handle()) {
            violations.push(InvariantViolation {
                invariant: "pending_queue_consistency",
                description: alloc::format!(
                    "Pending message {} is not queued on any service",
                    entry.handle()
                ),
            });
        }
    }

    violations
}

/// Invariant 3: A channel is busy iff exactly one message travels on it
fn check_channel_busy_consistency(core: &SpmCore) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    for entry in core.channels.iter() {
        let in_flight = core
            .messages
            .iter()
            .filter(|m| m.value().channel == entry.handle())
            .count();
        let busy = entry.value().busy;

        if in_flight > 1 {
            violations.push(InvariantViolation {
                invariant: "channel_busy_consistency",
                description: alloc::format!(
                    "Channel {} carries {} messages at once",
                    entry.handle(),
                    in_flight
                ),
            });
        }
        if busy != (in_flight > 0) {
            violations.push(InvariantViolation {
                invariant: "channel_busy_consistency",
                description: alloc::format!(
                    "Channel {} busy={} with {} messages in flight",
                    entry.handle(),
                    busy,
                    in_flight
                ),
            });
        }
    }

    violations
}

/// Invariant 4: A halted partition holds no messages
fn check_halted_quiescence(core: &SpmCore) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    for (id, partition) in &core.partitions {
        if partition.state() != PartitionState::Halted {
            continue;
        }
        let held = core.messages.iter().filter(|e| e.owner() == *id).count();
        if held > 0 {
            violations.push(InvariantViolation {
                invariant: "halted_quiescence",
                description: alloc::format!("Halted partition {} holds {} messages", id, held),
            });
        }
    }

    violations
}

/// Invariant 5: Services belong to registered partitions and channels name
/// registered services hosted by their server
fn check_service_registry(core: &SpmCore) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    for (sid, service) in &core.services {
        let listed = core
            .partitions
            .get(&service.partition)
            .map_or(false, |p| p.services().contains(sid));
        if !listed {
            violations.push(InvariantViolation {
                invariant: "service_registry",
                description: alloc::format!(
                    "Service {} claims partition {} which does not list it",
                    sid,
                    service.partition
                ),
            });
        }
    }

    for entry in core.channels.iter() {
        let channel = entry.value();
        match core.services.get(&channel.sid) {
            Some(service) if service.partition == channel.server => {}
            Some(service) => violations.push(InvariantViolation {
                invariant: "service_registry",
                description: alloc::format!(
                    "Channel {} names server {} but service {} lives in {}",
                    entry.handle(),
                    channel.server,
                    channel.sid,
                    service.partition
                ),
            }),
            None => violations.push(InvariantViolation {
                invariant: "service_registry",
                description: alloc::format!(
                    "Channel {} names unknown service {}",
                    entry.handle(),
                    channel.sid
                ),
            }),
        }
    }

    violations
}

/// Invariant 6: Within a partition every service signal is a distinct
/// assignable bit, disjoint from its interrupt signals
fn check_signal_uniqueness(core: &SpmCore) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    for (id, partition) in &core.partitions {
        let mut used = partition.interrupt_signals();
        if used & signal::RESERVED_MASK != 0 {
            violations.push(InvariantViolation {
                invariant: "signal_uniqueness",
                description: alloc::format!(
                    "Partition {} routes interrupts to reserved bits {:#x}",
                    id,
                    used
                ),
            });
        }

        for sid in partition.services() {
            let Some(service) = core.services.get(sid) else {
                continue;
            };
            let bit = service.descriptor.signal;
            if !signal::is_assignable(bit) || used & bit != 0 {
                violations.push(InvariantViolation {
                    invariant: "signal_uniqueness",
                    description: alloc::format!(
                        "Partition {} service {} has signal {:#x} (in use: {:#x})",
                        id,
                        sid,
                        bit,
                        used
                    ),
                });
            }
            used |= bit;
        }
    }

    violations
}

/// Invariant 7: Channels are owned by their client with the server as
/// friend; messages are owned by the partition hosting their service
fn check_handle_ownership(core: &SpmCore) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    for entry in core.channels.iter() {
        let channel = entry.value();
        if entry.owner() != channel.client || entry.friend() != Some(channel.server) {
            violations.push(InvariantViolation {
                invariant: "handle_ownership",
                description: alloc::format!(
                    "Channel {} owned by {} (friend {:?}), expected {} / {}",
                    entry.handle(),
                    entry.owner(),
                    entry.friend(),
                    channel.client,
                    channel.server
                ),
            });
        }
    }

    for entry in core.messages.iter() {
        let host = core.services.get(&entry.value().sid).map(|s| s.partition);
        if host != Some(entry.owner()) || entry.friend().is_some() {
            violations.push(InvariantViolation {
                invariant: "handle_ownership",
                description: alloc::format!(
                    "Message {} owned by {}, service host is {:?}",
                    entry.handle(),
                    entry.owner(),
                    host
                ),
            });
        }
    }

    violations
}
