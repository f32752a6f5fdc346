//! IPC state machine
//!
//! `SpmCore` holds every partition, service, channel and in-flight message,
//! and implements the partition-side (`get`, `read`, `write`, `reply`, ...)
//! and client-side (`connect`, `call`, `close`) operations as pure state
//! transitions. Blocking, wakeups and logging are layered on top by
//! `spm-kernel`.
//!
//! # Message Lifecycle
//!
//! ```text
//!  connect/call/close        get(signal)            reply(status)
//! ───────────────────▶ Pending ─────────▶ Dispatched ─────────▶ Completed
//!                        │                                      (handle destroyed,
//!                        └── queued on the service; its signal   Completion stored
//!                            is asserted while the queue is      under the ticket)
//!                            non-empty
//! ```
//!
//! Channels and messages each live in their own `HandleTable`. A channel is
//! owned by its client with the serving partition as friend; a message is
//! owned by the serving partition.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use spm_ipc::{signal, MessageType, Status, MAX_IOVEC};

use crate::handle::{Handle, HandleError, HandleTable};
use crate::types::{PartitionDescriptor, PartitionId, PartitionState, ServiceDescriptor, Sid};

// ============================================================================
// Errors
// ============================================================================

/// Recoverable IPC errors, reported to the caller as a status code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IpcError {
    /// Channel/message table failure
    Handle(HandleError),
    /// No service with this SID
    UnknownService(Sid),
    /// No partition with this ID
    UnknownPartition(PartitionId),
    /// Partition ID cannot be registered (non-secure flag set)
    InvalidPartition(PartitionId),
    /// Caller may not connect to this service
    ServiceNotPermitted(Sid),
    /// Requested minor version rejected by the service's policy
    VersionMismatch {
        sid: Sid,
        requested: u32,
        declared: u32,
    },
    /// Channel dropped or serving partition halted
    ConnectionRefused,
    /// Channel already carries an in-flight message
    ConnectionBusy,
    /// More iovecs than `MAX_IOVEC`
    TooManyVectors(usize),
    /// Signal is not a valid assignable bit for this use
    InvalidSignal(u32),
    /// Message type reserved for `connect`/`close`
    ReservedMessageType(i32),
    /// Type tag outside the known set
    UnknownMessageType(i32),
    /// Partition already registered
    PartitionExists(PartitionId),
    /// SID already registered
    ServiceExists(Sid),
    /// Caller itself has been halted
    Halted(PartitionId),
}

impl IpcError {
    /// Status code reported to the client.
    pub fn status(self) -> Status {
        match self {
            IpcError::Handle(err) => err.status(),
            IpcError::UnknownService(_) | IpcError::UnknownPartition(_) => Status::DOES_NOT_EXIST,
            IpcError::ServiceNotPermitted(_) => Status::NOT_PERMITTED,
            IpcError::VersionMismatch { .. } | IpcError::ConnectionRefused => {
                Status::CONNECTION_REFUSED
            }
            IpcError::ConnectionBusy => Status::CONNECTION_BUSY,
            IpcError::TooManyVectors(_)
            | IpcError::InvalidSignal(_)
            | IpcError::InvalidPartition(_)
            | IpcError::ReservedMessageType(_)
            | IpcError::UnknownMessageType(_) => Status::INVALID_ARGUMENT,
            IpcError::PartitionExists(_) | IpcError::ServiceExists(_) => Status::ALREADY_EXISTS,
            IpcError::Halted(_) => Status::BAD_STATE,
        }
    }
}

impl From<HandleError> for IpcError {
    fn from(err: HandleError) -> Self {
        IpcError::Handle(err)
    }
}

impl fmt::Display for IpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpcError::Handle(err) => write!(f, "{}", err),
            IpcError::UnknownService(sid) => write!(f, "unknown service {}", sid),
            IpcError::UnknownPartition(id) => write!(f, "unknown partition {}", id),
            IpcError::InvalidPartition(id) => write!(f, "invalid partition id {}", id),
            IpcError::ServiceNotPermitted(sid) => write!(f, "not permitted to connect to {}", sid),
            IpcError::VersionMismatch {
                sid,
                requested,
                declared,
            } => write!(
                f,
                "service {} rejects minor version {} (declared {})",
                sid, requested, declared
            ),
            IpcError::ConnectionRefused => write!(f, "connection refused"),
            IpcError::ConnectionBusy => write!(f, "connection busy"),
            IpcError::TooManyVectors(n) => write!(f, "{} iovecs exceed the limit of {}", n, MAX_IOVEC),
            IpcError::InvalidSignal(s) => write!(f, "invalid signal {:#x}", s),
            IpcError::ReservedMessageType(t) => write!(f, "message type {} is reserved", t),
            IpcError::UnknownMessageType(t) => write!(f, "unknown message type {}", t),
            IpcError::PartitionExists(id) => write!(f, "partition {} already registered", id),
            IpcError::ServiceExists(sid) => write!(f, "service {} already registered", sid),
            IpcError::Halted(id) => write!(f, "partition {} is halted", id),
        }
    }
}

/// Contract breach by a partition. Fatal to the offending partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtocolViolation {
    /// Caller is not a registered partition
    UnknownPartition(PartitionId),
    /// Message handle not live, or not owned by the caller
    BadMessageHandle { handle: Handle, error: HandleError },
    /// `get` needs exactly one signal bit
    NotSingleSignal(u32),
    /// Signal does not belong to any of the caller's services
    SignalNotOwned(u32),
    /// Signal owned by the caller but nothing is pending on it
    SignalNotAsserted(u32),
    /// Message was never handed out by `get`
    MessageNotDispatched(Handle),
    /// Iovec index outside `0..MAX_IOVEC`
    InvalidIovecIndex(usize),
    /// Response write past the client's declared capacity
    WriteOverflow {
        outvec: usize,
        offset: usize,
        len: usize,
        capacity: usize,
    },
    /// Received message carries a type tag the partition cannot handle
    UnknownMessageType(i32),
    /// Interrupt wait mask names signals that are neither IRQs nor the doorbell
    InterruptMaskNotSubset { mask: u32, allowed: u32 },
    /// Signal is not one of the caller's interrupt signals
    NotAnInterrupt(u32),
    /// End-of-interrupt for a signal that is not asserted
    InterruptNotAsserted(u32),
}

impl fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolViolation::UnknownPartition(id) => write!(f, "unknown partition {}", id),
            ProtocolViolation::BadMessageHandle { handle, error } => {
                write!(f, "bad message handle {}: {}", handle, error)
            }
            ProtocolViolation::NotSingleSignal(s) => write!(f, "signal {:#x} is not a single bit", s),
            ProtocolViolation::SignalNotOwned(s) => write!(f, "signal {:#x} is not owned", s),
            ProtocolViolation::SignalNotAsserted(s) => write!(f, "signal {:#x} is not asserted", s),
            ProtocolViolation::MessageNotDispatched(h) => write!(f, "message {} not dispatched", h),
            ProtocolViolation::InvalidIovecIndex(i) => write!(f, "iovec index {} out of range", i),
            ProtocolViolation::WriteOverflow {
                outvec,
                offset,
                len,
                capacity,
            } => write!(
                f,
                "write of {} bytes at offset {} overflows outvec {} (capacity {})",
                len, offset, outvec, capacity
            ),
            ProtocolViolation::UnknownMessageType(t) => write!(f, "unknown message type {}", t),
            ProtocolViolation::InterruptMaskNotSubset { mask, allowed } => write!(
                f,
                "interrupt mask {:#x} is not a subset of {:#x}",
                mask, allowed
            ),
            ProtocolViolation::NotAnInterrupt(s) => write!(f, "signal {:#x} is not an interrupt", s),
            ProtocolViolation::InterruptNotAsserted(s) => {
                write!(f, "interrupt {:#x} is not asserted", s)
            }
        }
    }
}

// ============================================================================
// Objects
// ============================================================================

/// Ticket a client uses to collect the reply to a message it submitted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CallTicket(pub u64);

/// Registered partition
#[derive(Clone, Debug)]
pub struct Partition {
    id: PartitionId,
    name: String,
    state: PartitionState,
    services: Vec<Sid>,
    interrupt_signals: u32,
    extern_sids: Vec<Sid>,
    /// Doorbell and interrupt bits currently asserted
    asserted: u32,
}

impl Partition {
    pub fn id(&self) -> PartitionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> PartitionState {
        self.state
    }

    pub fn services(&self) -> &[Sid] {
        &self.services
    }

    pub fn interrupt_signals(&self) -> u32 {
        self.interrupt_signals
    }

    pub fn extern_sids(&self) -> &[Sid] {
        &self.extern_sids
    }
}

/// Registered service and its queue of pending messages.
#[derive(Clone, Debug)]
pub struct Service {
    pub(crate) descriptor: ServiceDescriptor,
    pub(crate) partition: PartitionId,
    pub(crate) pending: VecDeque<Handle>,
}

impl Service {
    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Established client/service connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Channel {
    /// Connecting client (table owner)
    pub client: PartitionId,
    /// Partition hosting the service (table friend)
    pub server: PartitionId,
    pub sid: Sid,
    /// Private state attached by the service
    pub reverse_handle: Option<u64>,
    /// Set when the service dropped the connection or halted
    pub dropped: bool,
    /// A message on this channel has not been replied to yet
    pub busy: bool,
}

/// Message state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageState {
    /// Queued, signal asserted, not yet fetched
    Pending,
    /// Fetched by `get`, awaiting `reply`
    Dispatched,
    /// Replied; the handle no longer exists
    Completed,
}

#[derive(Clone, Debug)]
struct InVec {
    data: Vec<u8>,
    cursor: usize,
}

#[derive(Clone, Debug)]
struct OutVec {
    buffer: Vec<u8>,
    written: usize,
}

/// One in-flight request.
#[derive(Clone, Debug)]
pub struct Message {
    raw_type: i32,
    pub(crate) state: MessageState,
    pub(crate) channel: Handle,
    pub(crate) client: PartitionId,
    pub(crate) sid: Sid,
    ticket: CallTicket,
    in_vecs: Vec<InVec>,
    out_vecs: Vec<OutVec>,
}

impl Message {
    fn in_sizes(&self) -> [usize; MAX_IOVEC] {
        let mut sizes = [0; MAX_IOVEC];
        for (size, vec) in sizes.iter_mut().zip(&self.in_vecs) {
            *size = vec.data.len();
        }
        sizes
    }

    fn out_sizes(&self) -> [usize; MAX_IOVEC] {
        let mut sizes = [0; MAX_IOVEC];
        for (size, vec) in sizes.iter_mut().zip(&self.out_vecs) {
            *size = vec.buffer.len();
        }
        sizes
    }

    fn into_completion(self, status: Status) -> Completion {
        Completion {
            status,
            channel: self.channel,
            outputs: self
                .out_vecs
                .into_iter()
                .map(|mut vec| {
                    vec.buffer.truncate(vec.written);
                    vec.buffer
                })
                .collect(),
        }
    }
}

/// Descriptor returned by `get`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageInfo {
    /// Message handle for `read`/`write`/`reply`
    pub handle: Handle,
    /// Raw type tag
    pub raw_type: i32,
    pub sid: Sid,
    /// Client identity (high bit set for non-secure clients)
    pub client: PartitionId,
    /// Private state attached to the channel, if any
    pub reverse_handle: Option<u64>,
    /// Byte size of each input iovec (0 if absent)
    pub in_sizes: [usize; MAX_IOVEC],
    /// Byte capacity of each output iovec (0 if absent)
    pub out_sizes: [usize; MAX_IOVEC],
}

impl MessageInfo {
    /// Decoded type, `None` for an unknown tag.
    pub fn kind(&self) -> Option<MessageType> {
        MessageType::from_raw(self.raw_type)
    }
}

/// Result delivered to a client when its message completes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Completion {
    pub status: Status,
    /// Channel the message travelled on
    pub channel: Handle,
    /// Written bytes of each output iovec, up to the highest offset written
    pub outputs: Vec<Vec<u8>>,
}

// ============================================================================
// SpmCore
// ============================================================================

/// The complete IPC state of the SPM.
#[derive(Debug)]
pub struct SpmCore {
    pub(crate) partitions: BTreeMap<PartitionId, Partition>,
    pub(crate) services: BTreeMap<Sid, Service>,
    pub(crate) channels: HandleTable<Channel>,
    pub(crate) messages: HandleTable<Message>,
    pub(crate) completions: BTreeMap<CallTicket, Completion>,
    /// Client that will collect each stored completion
    collectors: BTreeMap<CallTicket, PartitionId>,
    /// In-flight messages allowed per client partition
    message_quota: usize,
    next_ticket: u64,
}

impl SpmCore {
    /// Create an empty core.
    ///
    /// A channel carries at most one message, so the message pool is sized
    /// like the channel pool. `max_messages` bounds how many of those one
    /// client partition may hold in flight.
    pub fn new(max_channels: usize, max_messages: usize) -> Self {
        Self {
            partitions: BTreeMap::new(),
            services: BTreeMap::new(),
            channels: HandleTable::new(max_channels),
            messages: HandleTable::new(max_channels),
            completions: BTreeMap::new(),
            collectors: BTreeMap::new(),
            message_quota: max_messages,
            next_ticket: 1,
        }
    }

    // ========================================================================
    // Registration & queries
    // ========================================================================

    /// Register a partition and its services.
    ///
    /// Nothing is registered if any check fails.
    pub fn register_partition(&mut self, descriptor: PartitionDescriptor) -> Result<(), IpcError> {
        let id = descriptor.id;
        if id.is_non_secure() {
            return Err(IpcError::InvalidPartition(id));
        }
        if self.partitions.contains_key(&id) {
            return Err(IpcError::PartitionExists(id));
        }

        let mut used = 0u32;
        let mut sids: Vec<Sid> = Vec::new();
        for service in &descriptor.services {
            if !signal::is_assignable(service.signal) || used & service.signal != 0 {
                return Err(IpcError::InvalidSignal(service.signal));
            }
            if self.services.contains_key(&service.sid) || sids.contains(&service.sid) {
                return Err(IpcError::ServiceExists(service.sid));
            }
            used |= service.signal;
            sids.push(service.sid);
        }

        let irqs = descriptor.interrupt_signals;
        if irqs & !signal::ASSIGNABLE_MASK != 0 || irqs & used != 0 {
            return Err(IpcError::InvalidSignal(irqs));
        }

        for service in descriptor.services {
            self.services.insert(
                service.sid,
                Service {
                    descriptor: service,
                    partition: id,
                    pending: VecDeque::new(),
                },
            );
        }
        self.partitions.insert(
            id,
            Partition {
                id,
                name: descriptor.name,
                state: PartitionState::Running,
                services: sids,
                interrupt_signals: irqs,
                extern_sids: descriptor.extern_sids,
                asserted: 0,
            },
        );
        Ok(())
    }

    pub fn partition(&self, id: PartitionId) -> Option<&Partition> {
        self.partitions.get(&id)
    }

    pub fn partitions(&self) -> impl Iterator<Item = &Partition> {
        self.partitions.values()
    }

    pub fn service(&self, sid: Sid) -> Option<&Service> {
        self.services.get(&sid)
    }

    /// Union of the signals of every service hosted by `id`.
    pub fn service_signals(&self, id: PartitionId) -> u32 {
        self.partitions.get(&id).map_or(0, |partition| {
            partition
                .services
                .iter()
                .filter_map(|sid| self.services.get(sid))
                .fold(0, |acc, service| acc | service.descriptor.signal)
        })
    }

    pub fn is_halted(&self, id: PartitionId) -> bool {
        self.partitions
            .get(&id)
            .map_or(false, |p| p.state == PartitionState::Halted)
    }

    /// Record whether a partition is parked in `wait_any`.
    pub fn set_blocked(&mut self, id: PartitionId, blocked: bool) {
        if let Some(partition) = self.partitions.get_mut(&id) {
            if partition.state != PartitionState::Halted {
                partition.state = if blocked {
                    PartitionState::Blocked
                } else {
                    PartitionState::Running
                };
            }
        }
    }

    /// Channel state, as seen by its client or server.
    pub fn channel(&self, handle: Handle, requester: PartitionId) -> Result<&Channel, HandleError> {
        self.channels.resolve(handle, requester)
    }

    pub fn channels_in_use(&self) -> usize {
        self.channels.len()
    }

    pub fn messages_in_flight(&self) -> usize {
        self.messages.len()
    }

    /// In-flight messages sent by `client`.
    pub fn client_messages(&self, client: PartitionId) -> usize {
        self.messages
            .iter()
            .filter(|entry| entry.value().client == client)
            .count()
    }

    /// Completions stored and not yet collected.
    pub fn completions_pending(&self) -> usize {
        self.completions.len()
    }

    // ========================================================================
    // Client side
    // ========================================================================

    /// Open a channel to `sid` and queue its `CONNECT` message.
    ///
    /// Returns the new channel handle and the ticket for the connect reply.
    pub fn connect(
        &mut self,
        client: PartitionId,
        sid: Sid,
        minor_version: u32,
    ) -> Result<(Handle, CallTicket), IpcError> {
        let service = self.services.get(&sid).ok_or(IpcError::UnknownService(sid))?;
        let server = service.partition;
        let descriptor = &service.descriptor;

        if client.is_non_secure() {
            if !descriptor.nspe_callable {
                return Err(IpcError::ServiceNotPermitted(sid));
            }
        } else {
            let caller = self
                .partitions
                .get(&client)
                .ok_or(IpcError::UnknownPartition(client))?;
            if caller.state == PartitionState::Halted {
                return Err(IpcError::Halted(client));
            }
            if !caller.extern_sids.contains(&sid) {
                return Err(IpcError::ServiceNotPermitted(sid));
            }
        }

        if !descriptor
            .minor_policy
            .accepts(minor_version, descriptor.minor_version)
        {
            return Err(IpcError::VersionMismatch {
                sid,
                requested: minor_version,
                declared: descriptor.minor_version,
            });
        }
        if self.is_halted(server) {
            return Err(IpcError::ConnectionRefused);
        }

        let channel = self.channels.create(
            Channel {
                client,
                server,
                sid,
                reverse_handle: None,
                dropped: false,
                busy: true,
            },
            client,
            Some(server),
        )?;

        match self.admit(
            MessageType::Connect.as_raw(),
            client,
            channel,
            sid,
            server,
            Vec::new(),
            &[],
        ) {
            Ok(ticket) => Ok((channel, ticket)),
            Err(err) => {
                let _ = self.channels.destroy(channel, client);
                Err(err)
            }
        }
    }

    /// Queue a `CALL` on an established channel.
    pub fn call(
        &mut self,
        client: PartitionId,
        channel: Handle,
        in_vecs: Vec<Vec<u8>>,
        out_capacities: &[usize],
    ) -> Result<CallTicket, IpcError> {
        self.submit(
            client,
            channel,
            MessageType::Call.as_raw(),
            in_vecs,
            out_capacities,
        )
    }

    /// Queue a message carrying a raw type tag on an established channel.
    ///
    /// `CONNECT` and `DISCONNECT` tags are only produced by `connect` and
    /// `close`, and tags outside the known set never reach a service.
    pub fn submit(
        &mut self,
        client: PartitionId,
        channel: Handle,
        raw_type: i32,
        in_vecs: Vec<Vec<u8>>,
        out_capacities: &[usize],
    ) -> Result<CallTicket, IpcError> {
        match MessageType::from_raw(raw_type) {
            Some(MessageType::Call) => {}
            Some(MessageType::Connect) | Some(MessageType::Disconnect) => {
                return Err(IpcError::ReservedMessageType(raw_type))
            }
            None => return Err(IpcError::UnknownMessageType(raw_type)),
        }
        if in_vecs.len() > MAX_IOVEC {
            return Err(IpcError::TooManyVectors(in_vecs.len()));
        }
        if out_capacities.len() > MAX_IOVEC {
            return Err(IpcError::TooManyVectors(out_capacities.len()));
        }

        let (server, sid) = self.idle_channel(client, channel)?;
        if self.is_halted(server) {
            return Err(IpcError::ConnectionRefused);
        }
        let ticket = self.admit(raw_type, client, channel, sid, server, in_vecs, out_capacities)?;
        self.channels.resolve_mut(channel, client)?.busy = true;
        Ok(ticket)
    }

    /// Close a channel.
    ///
    /// Queues a `DISCONNECT` and returns its ticket, even for a dropped
    /// channel so the service can release its reverse-handle state. If the
    /// serving partition has halted the channel is torn down at once and
    /// `None` is returned.
    pub fn close(
        &mut self,
        client: PartitionId,
        channel: Handle,
    ) -> Result<Option<CallTicket>, IpcError> {
        let state = self.client_channel(client, channel)?;
        if state.busy {
            return Err(IpcError::ConnectionBusy);
        }
        let (server, sid) = (state.server, state.sid);
        if self.is_halted(server) {
            self.channels.destroy(channel, client)?;
            return Ok(None);
        }
        let ticket = self.admit(
            MessageType::Disconnect.as_raw(),
            client,
            channel,
            sid,
            server,
            Vec::new(),
            &[],
        )?;
        self.channels.resolve_mut(channel, client)?.busy = true;
        Ok(Some(ticket))
    }

    /// Collect the completion for `ticket`, if the message has been replied.
    pub fn take_completion(&mut self, ticket: CallTicket) -> Option<Completion> {
        self.collectors.remove(&ticket);
        self.completions.remove(&ticket)
    }

    /// Drop every uncollected completion addressed to `client`.
    ///
    /// Returns how many were dropped.
    pub fn discard_completions(&mut self, client: PartitionId) -> usize {
        let stale: Vec<CallTicket> = self
            .collectors
            .iter()
            .filter(|(_, &collector)| collector == client)
            .map(|(&ticket, _)| ticket)
            .collect();
        for ticket in &stale {
            self.collectors.remove(ticket);
            self.completions.remove(ticket);
        }
        stale.len()
    }

    /// Drop every uncollected completion.
    pub fn discard_all_completions(&mut self) -> usize {
        let count = self.completions.len();
        self.collectors.clear();
        self.completions.clear();
        count
    }

    fn store_completion(&mut self, ticket: CallTicket, client: PartitionId, completion: Completion) {
        self.collectors.insert(ticket, client);
        self.completions.insert(ticket, completion);
    }

    /// Channel state, resolved for its client only.
    fn client_channel(&self, client: PartitionId, channel: Handle) -> Result<&Channel, IpcError> {
        let state = self.channels.resolve(channel, client)?;
        if state.client != client {
            return Err(IpcError::Handle(HandleError::AccessDenied));
        }
        Ok(state)
    }

    /// Check a channel may carry a new message from `client`.
    fn idle_channel(&self, client: PartitionId, channel: Handle) -> Result<(PartitionId, Sid), IpcError> {
        let state = self.client_channel(client, channel)?;
        if state.dropped {
            return Err(IpcError::ConnectionRefused);
        }
        if state.busy {
            return Err(IpcError::ConnectionBusy);
        }
        Ok((state.server, state.sid))
    }

    #[allow(clippy::too_many_arguments)]
    fn admit(
        &mut self,
        raw_type: i32,
        client: PartitionId,
        channel: Handle,
        sid: Sid,
        server: PartitionId,
        in_vecs: Vec<Vec<u8>>,
        out_capacities: &[usize],
    ) -> Result<CallTicket, IpcError> {
        if self.client_messages(client) >= self.message_quota {
            return Err(IpcError::Handle(HandleError::CapacityExhausted));
        }
        let ticket = CallTicket(self.next_ticket);
        let message = Message {
            raw_type,
            state: MessageState::Pending,
            channel,
            client,
            sid,
            ticket,
            in_vecs: in_vecs
                .into_iter()
                .map(|data| InVec { data, cursor: 0 })
                .collect(),
            out_vecs: out_capacities
                .iter()
                .map(|&capacity| OutVec {
                    buffer: alloc::vec![0; capacity],
                    written: 0,
                })
                .collect(),
        };

        let handle = self.messages.create(message, server, None)?;
        self.next_ticket += 1;
        if let Some(service) = self.services.get_mut(&sid) {
            service.pending.push_back(handle);
        }
        Ok(ticket)
    }

    // ========================================================================
    // Partition side
    // ========================================================================

    /// Every signal currently asserted for `id`.
    pub fn asserted_signals(&self, id: PartitionId) -> Result<u32, ProtocolViolation> {
        let partition = self
            .partitions
            .get(&id)
            .ok_or(ProtocolViolation::UnknownPartition(id))?;

        let pending = partition
            .services
            .iter()
            .filter_map(|sid| self.services.get(sid))
            .filter(|service| !service.pending.is_empty())
            .fold(0, |acc, service| acc | service.descriptor.signal);

        Ok(partition.asserted | pending)
    }

    /// Asserted signals within an interrupt wait mask.
    ///
    /// The mask may only name the caller's interrupt signals and the doorbell.
    pub fn asserted_interrupts(&self, id: PartitionId, mask: u32) -> Result<u32, ProtocolViolation> {
        let partition = self
            .partitions
            .get(&id)
            .ok_or(ProtocolViolation::UnknownPartition(id))?;
        let allowed = partition.interrupt_signals | signal::DOORBELL;
        if mask & !allowed != 0 {
            return Err(ProtocolViolation::InterruptMaskNotSubset { mask, allowed });
        }
        Ok(partition.asserted & mask)
    }

    /// Fetch the oldest pending message behind a single service signal.
    pub fn get(&mut self, id: PartitionId, signal: u32) -> Result<MessageInfo, ProtocolViolation> {
        if !signal::is_single(signal) {
            return Err(ProtocolViolation::NotSingleSignal(signal));
        }
        let partition = self
            .partitions
            .get(&id)
            .ok_or(ProtocolViolation::UnknownPartition(id))?;
        let sid = partition
            .services
            .iter()
            .copied()
            .find(|sid| {
                self.services
                    .get(sid)
                    .map_or(false, |service| service.descriptor.signal == signal)
            })
            .ok_or(ProtocolViolation::SignalNotOwned(signal))?;

        let handle = self
            .services
            .get_mut(&sid)
            .and_then(|service| service.pending.pop_front())
            .ok_or(ProtocolViolation::SignalNotAsserted(signal))?;

        let message = self
            .messages
            .resolve_mut(handle, id)
            .map_err(|error| ProtocolViolation::BadMessageHandle { handle, error })?;
        message.state = MessageState::Dispatched;
        let channel = message.channel;

        let mut info = MessageInfo {
            handle,
            raw_type: message.raw_type,
            sid: message.sid,
            client: message.client,
            reverse_handle: None,
            in_sizes: message.in_sizes(),
            out_sizes: message.out_sizes(),
        };
        info.reverse_handle = self
            .channels
            .resolve(channel, id)
            .ok()
            .and_then(|channel| channel.reverse_handle);
        Ok(info)
    }

    /// Copy from input iovec `index` at its read cursor and advance it.
    ///
    /// Copies `min(buf.len(), remaining)` bytes; once the iovec is exhausted
    /// this returns 0 and leaves `buf` untouched.
    pub fn read(
        &mut self,
        id: PartitionId,
        handle: Handle,
        index: usize,
        buf: &mut [u8],
    ) -> Result<usize, ProtocolViolation> {
        let message = self.dispatched_mut(id, handle)?;
        check_iovec_index(index)?;
        let Some(vec) = message.in_vecs.get_mut(index) else {
            return Ok(0);
        };

        let remaining = &vec.data[vec.cursor..];
        let count = remaining.len().min(buf.len());
        buf[..count].copy_from_slice(&remaining[..count]);
        vec.cursor += count;
        Ok(count)
    }

    /// Copy from input iovec `index` at an absolute offset.
    ///
    /// Does not move the read cursor. An offset at or past the end copies
    /// nothing and returns 0.
    pub fn read_at(
        &self,
        id: PartitionId,
        handle: Handle,
        index: usize,
        offset: usize,
        buf: &mut [u8],
    ) -> Result<usize, ProtocolViolation> {
        let message = self.dispatched(id, handle)?;
        check_iovec_index(index)?;
        let Some(vec) = message.in_vecs.get(index) else {
            return Ok(0);
        };
        if offset >= vec.data.len() {
            return Ok(0);
        }

        let remaining = &vec.data[offset..];
        let count = remaining.len().min(buf.len());
        buf[..count].copy_from_slice(&remaining[..count]);
        Ok(count)
    }

    /// Advance the read cursor of input iovec `index` without copying.
    pub fn skip(
        &mut self,
        id: PartitionId,
        handle: Handle,
        index: usize,
        count: usize,
    ) -> Result<usize, ProtocolViolation> {
        let message = self.dispatched_mut(id, handle)?;
        check_iovec_index(index)?;
        let Some(vec) = message.in_vecs.get_mut(index) else {
            return Ok(0);
        };
        let skipped = (vec.data.len() - vec.cursor).min(count);
        vec.cursor += skipped;
        Ok(skipped)
    }

    /// Copy `data` into output iovec `index` at `offset`.
    ///
    /// Writing past the client's declared capacity is a violation, never a
    /// truncation.
    pub fn write(
        &mut self,
        id: PartitionId,
        handle: Handle,
        index: usize,
        offset: usize,
        data: &[u8],
    ) -> Result<(), ProtocolViolation> {
        let message = self.dispatched_mut(id, handle)?;
        check_iovec_index(index)?;
        let capacity = message.out_vecs.get(index).map_or(0, |vec| vec.buffer.len());
        let end = offset
            .checked_add(data.len())
            .filter(|&end| end <= capacity)
            .ok_or(ProtocolViolation::WriteOverflow {
                outvec: index,
                offset,
                len: data.len(),
                capacity,
            })?;

        if let Some(vec) = message.out_vecs.get_mut(index) {
            vec.buffer[offset..end].copy_from_slice(data);
            vec.written = vec.written.max(end);
        }
        Ok(())
    }

    /// Complete a dispatched message and store the client's completion.
    ///
    /// - `CONNECT` replied with an error destroys the channel
    /// - `DISCONNECT` always destroys the channel
    /// - any other type replied with `DROP_CONNECTION` marks the channel dropped
    pub fn reply(
        &mut self,
        id: PartitionId,
        handle: Handle,
        status: Status,
    ) -> Result<(), ProtocolViolation> {
        self.dispatched(id, handle)?;
        let mut message = self
            .messages
            .destroy(handle, id)
            .map_err(|error| ProtocolViolation::BadMessageHandle { handle, error })?;
        message.state = MessageState::Completed;

        let client = message.client;
        match MessageType::from_raw(message.raw_type) {
            Some(MessageType::Connect) if status.is_error() => {
                let _ = self.channels.destroy(message.channel, client);
            }
            Some(MessageType::Disconnect) => {
                let _ = self.channels.destroy(message.channel, client);
            }
            _ => {
                if let Ok(channel) = self.channels.resolve_mut(message.channel, client) {
                    channel.busy = false;
                    if status == Status::DROP_CONNECTION {
                        channel.dropped = true;
                    }
                }
            }
        }

        let ticket = message.ticket;
        self.store_completion(ticket, client, message.into_completion(status));
        Ok(())
    }

    /// Attach private state to the channel a message travelled on.
    pub fn set_reverse_handle(
        &mut self,
        id: PartitionId,
        handle: Handle,
        value: Option<u64>,
    ) -> Result<(), ProtocolViolation> {
        let channel = self.dispatched(id, handle)?.channel;
        let state = self
            .channels
            .resolve_mut(channel, id)
            .map_err(|error| ProtocolViolation::BadMessageHandle {
                handle: channel,
                error,
            })?;
        state.reverse_handle = value;
        Ok(())
    }

    /// Client identity of a dispatched message.
    pub fn identity(&self, id: PartitionId, handle: Handle) -> Result<PartitionId, ProtocolViolation> {
        Ok(self.dispatched(id, handle)?.client)
    }

    /// Assert the doorbell on `target`. Idempotent.
    pub fn notify(&mut self, target: PartitionId) -> Result<(), IpcError> {
        let partition = self
            .partitions
            .get_mut(&target)
            .ok_or(IpcError::UnknownPartition(target))?;
        partition.asserted |= signal::DOORBELL;
        Ok(())
    }

    /// Clear the caller's doorbell.
    pub fn clear(&mut self, id: PartitionId) -> Result<(), ProtocolViolation> {
        let partition = self
            .partitions
            .get_mut(&id)
            .ok_or(ProtocolViolation::UnknownPartition(id))?;
        partition.asserted &= !signal::DOORBELL;
        Ok(())
    }

    /// Assert an interrupt signal on `target` (interrupt context).
    pub fn assert_interrupt(&mut self, target: PartitionId, signal: u32) -> Result<(), IpcError> {
        let partition = self
            .partitions
            .get_mut(&target)
            .ok_or(IpcError::UnknownPartition(target))?;
        if !signal::is_single(signal) || partition.interrupt_signals & signal == 0 {
            return Err(IpcError::InvalidSignal(signal));
        }
        partition.asserted |= signal;
        Ok(())
    }

    /// End of interrupt: clear an asserted interrupt signal.
    pub fn eoi(&mut self, id: PartitionId, signal: u32) -> Result<(), ProtocolViolation> {
        let partition = self
            .partitions
            .get_mut(&id)
            .ok_or(ProtocolViolation::UnknownPartition(id))?;
        if !signal::is_single(signal) || partition.interrupt_signals & signal == 0 {
            return Err(ProtocolViolation::NotAnInterrupt(signal));
        }
        if partition.asserted & signal == 0 {
            return Err(ProtocolViolation::InterruptNotAsserted(signal));
        }
        partition.asserted &= !signal;
        Ok(())
    }

    // ========================================================================
    // Fault handling
    // ========================================================================

    /// Halt a partition after a protocol violation.
    ///
    /// Every message it holds completes with `CONNECTION_REFUSED` and every
    /// channel it serves is marked dropped. Returns the released tickets.
    pub fn halt_partition(&mut self, id: PartitionId) -> Vec<CallTicket> {
        let services = match self.partitions.get_mut(&id) {
            Some(partition) => {
                partition.state = PartitionState::Halted;
                partition.asserted = 0;
                partition.services.clone()
            }
            None => return Vec::new(),
        };
        for sid in &services {
            if let Some(service) = self.services.get_mut(sid) {
                service.pending.clear();
            }
        }

        let held: Vec<Handle> = self
            .messages
            .iter()
            .filter(|entry| entry.owner() == id)
            .map(|entry| entry.handle())
            .collect();

        let mut released = Vec::new();
        for handle in held {
            let Ok(mut message) = self.messages.destroy(handle, id) else {
                continue;
            };
            message.state = MessageState::Completed;
            match MessageType::from_raw(message.raw_type) {
                Some(MessageType::Connect) | Some(MessageType::Disconnect) => {
                    let _ = self.channels.destroy(message.channel, message.client);
                }
                _ => {}
            }
            let (ticket, client) = (message.ticket, message.client);
            released.push(ticket);
            self.store_completion(ticket, client, message.into_completion(Status::CONNECTION_REFUSED));
        }

        let served: Vec<(Handle, PartitionId)> = self
            .channels
            .iter()
            .filter(|entry| entry.value().server == id)
            .map(|entry| (entry.handle(), entry.owner()))
            .collect();
        for (handle, client) in served {
            if let Ok(channel) = self.channels.resolve_mut(handle, client) {
                channel.dropped = true;
                channel.busy = false;
            }
        }

        released
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn dispatched(&self, id: PartitionId, handle: Handle) -> Result<&Message, ProtocolViolation> {
        let message = self
            .messages
            .resolve(handle, id)
            .map_err(|error| ProtocolViolation::BadMessageHandle { handle, error })?;
        if message.state != MessageState::Dispatched {
            return Err(ProtocolViolation::MessageNotDispatched(handle));
        }
        Ok(message)
    }

    fn dispatched_mut(
        &mut self,
        id: PartitionId,
        handle: Handle,
    ) -> Result<&mut Message, ProtocolViolation> {
        let message = self
            .messages
            .resolve_mut(handle, id)
            .map_err(|error| ProtocolViolation::BadMessageHandle { handle, error })?;
        if message.state != MessageState::Dispatched {
            return Err(ProtocolViolation::MessageNotDispatched(handle));
        }
        Ok(message)
    }
}

fn check_iovec_index(index: usize) -> Result<(), ProtocolViolation> {
    if index >= MAX_IOVEC {
        return Err(ProtocolViolation::InvalidIovecIndex(index));
    }
    Ok(())
}
