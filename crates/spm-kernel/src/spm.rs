//! Blocking SPM runtime
//!
//! Wraps the pure `SpmCore` in one global mutex and gives every partition a
//! condition variable to park on.
//!
//! ```text
//!   client thread                 SPM state (Mutex)               partition thread
//!   ─────────────                 ─────────────────               ────────────────
//!   call() ──── admit message ──▶ SpmCore ◀── wait_any() parks on its Condvar
//!          ◀─── completions ───── Condvar ◀── reply() wakes every blocked client
//! ```
//!
//! # Fault handling
//!
//! A `ProtocolViolation` from any partition-side operation halts the caller:
//! its held messages complete with `CONNECTION_REFUSED`, its channels are
//! marked dropped, the violation is written to the HAL console and the
//! audit log, and `HAL::partition_faulted` is invoked with the lock held.
//! Every later call by the halted partition returns `SpmError::Halted`, and
//! completions addressed to it are discarded instead of stored.

use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use spm_axiom::{SpmEvent, SpmEventType, SysLog};
use spm_core::{
    check_all_invariants, AccessDecision, AccessRequest, CallTicket, Completion, Handle,
    InvariantViolation, IpcError, MessageInfo, PartitionId, PartitionState, ProtectionConfig,
    ProtocolViolation, Sid, SpmCore, Status, Timeout,
};
use spm_hal::HAL;
use spm_ipc::MessageType;

use crate::config::SpmConfig;
use crate::error::SpmError;

struct SpmState {
    core: SpmCore,
    syslog: SysLog,
    shutdown: bool,
}

struct Shared<H: HAL> {
    hal: H,
    state: Mutex<SpmState>,
    /// One per partition, all paired with `state`
    wakeups: BTreeMap<PartitionId, Condvar>,
    /// Signalled whenever a completion is stored
    completions: Condvar,
    protection: ProtectionConfig,
    irq_routes: BTreeMap<u32, (PartitionId, u32)>,
}

/// Handle to a running SPM. Cheap to clone; all clones share one state.
pub struct Spm<H: HAL> {
    shared: Arc<Shared<H>>,
}

impl<H: HAL> Clone for Spm<H> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<H: HAL> Spm<H> {
    /// Validate `config` and register every partition it declares.
    pub fn new(hal: H, config: SpmConfig) -> Result<Self, SpmError> {
        config.validate()?;

        let mut core = SpmCore::new(config.max_channels, config.max_messages);
        let mut syslog = SysLog::new();
        let mut wakeups = BTreeMap::new();

        for descriptor in config.descriptors() {
            let id = descriptor.id;
            let name = descriptor.name.clone();
            let services = descriptor.services.len() as u32;
            core.register_partition(descriptor)?;

            syslog.log(
                id.0,
                SpmEventType::PartitionRegistered {
                    name: name.clone(),
                    services,
                },
                hal.now_nanos(),
            );
            hal.debug_write(&format!("[spm] registered partition {} ({})", name, id));
            wakeups.insert(id, Condvar::new());
        }

        let irq_routes = config
            .irq_routes()
            .into_iter()
            .map(|(line, partition, signal)| (line, (partition, signal)))
            .collect();

        Ok(Self {
            shared: Arc::new(Shared {
                hal,
                state: Mutex::new(SpmState {
                    core,
                    syslog,
                    shutdown: false,
                }),
                wakeups,
                completions: Condvar::new(),
                protection: config.protection,
                irq_routes,
            }),
        })
    }

    pub fn hal(&self) -> &H {
        &self.shared.hal
    }

    /// Partition-side API for secure partition `id`.
    pub fn partition(&self, id: PartitionId) -> Result<PartitionContext<H>, SpmError> {
        if !self.shared.wakeups.contains_key(&id) {
            return Err(SpmError::UnknownPartition(id));
        }
        Ok(PartitionContext {
            spm: self.clone(),
            id,
        })
    }

    /// Client-side API for a registered secure partition.
    pub fn client(&self, id: PartitionId) -> Result<ClientContext<H>, SpmError> {
        if !id.is_non_secure() && !self.shared.wakeups.contains_key(&id) {
            return Err(SpmError::UnknownPartition(id));
        }
        Ok(ClientContext {
            spm: self.clone(),
            id,
        })
    }

    /// Client-side API for a non-secure caller.
    pub fn non_secure_client(&self, raw: i32) -> ClientContext<H> {
        ClientContext {
            spm: self.clone(),
            id: PartitionId::non_secure(raw),
        }
    }

    /// Assert an interrupt signal on `target` (interrupt context).
    pub fn assert_interrupt(&self, target: PartitionId, signal: u32) -> Result<(), SpmError> {
        let mut state = self.lock()?;
        state.core.assert_interrupt(target, signal)?;
        self.record(&mut state, target.0, SpmEventType::Interrupt { signal });
        self.wake(target);
        Ok(())
    }

    /// Raise the manifest-declared IRQ line `line`.
    pub fn raise_irq(&self, line: u32) -> Result<(), SpmError> {
        let &(partition, signal) = self
            .shared
            .irq_routes
            .get(&line)
            .ok_or(SpmError::UnknownIrqLine(line))?;
        self.assert_interrupt(partition, signal)
    }

    /// Stop the runtime. Every blocked wait and call returns `Shutdown`.
    pub fn shutdown(&self) {
        let mut state = match self.shared.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.shutdown = true;
        state.core.discard_all_completions();
        drop(state);

        for wakeup in self.shared.wakeups.values() {
            wakeup.notify_all();
        }
        self.shared.completions.notify_all();
        self.shared.hal.debug_write("[spm] shutdown");
    }

    pub fn partition_state(&self, id: PartitionId) -> Result<PartitionState, SpmError> {
        let state = self.lock()?;
        state
            .core
            .partition(id)
            .map(|p| p.state())
            .ok_or(SpmError::UnknownPartition(id))
    }

    /// Snapshot of the retained audit events.
    pub fn audit_events(&self) -> Result<Vec<SpmEvent>, SpmError> {
        Ok(self.lock()?.syslog.events().to_vec())
    }

    /// Retained audit events as a JSON array.
    pub fn audit_json(&self) -> Result<String, SpmError> {
        self.lock()?
            .syslog
            .export_json()
            .map_err(|e| SpmError::Audit(e.to_string()))
    }

    pub fn check_invariants(&self) -> Result<Vec<InvariantViolation>, SpmError> {
        Ok(check_all_invariants(&self.lock()?.core))
    }

    pub fn channels_in_use(&self) -> Result<usize, SpmError> {
        Ok(self.lock()?.core.channels_in_use())
    }

    /// Completions stored and not yet collected by their client.
    pub fn completions_pending(&self) -> Result<usize, SpmError> {
        Ok(self.lock()?.core.completions_pending())
    }

    pub fn protection(&self) -> &ProtectionConfig {
        &self.shared.protection
    }

    /// Judge a memory access against the configured MPU and SMPU tiers.
    pub fn memory_decision(&self, access: &AccessRequest) -> AccessDecision {
        let decision = self.shared.protection.memory_decision(access);
        self.log_denial(access, decision);
        decision
    }

    /// Judge a peripheral access against the configured PPU tiers.
    pub fn peripheral_decision(&self, access: &AccessRequest) -> AccessDecision {
        let decision = self.shared.protection.peripheral_decision(access);
        self.log_denial(access, decision);
        decision
    }

    fn log_denial(&self, access: &AccessRequest, decision: AccessDecision) {
        if !decision.is_allowed() {
            self.shared.hal.debug_write(&format!(
                "[spm] {:#x}+{:#x} from {}: {}",
                access.start, access.size, access.context, decision
            ));
        }
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn lock(&self) -> Result<MutexGuard<'_, SpmState>, SpmError> {
        self.shared.state.lock().map_err(|_| SpmError::Poisoned)
    }

    fn wake(&self, id: PartitionId) {
        if let Some(wakeup) = self.shared.wakeups.get(&id) {
            wakeup.notify_all();
        }
    }

    fn record(&self, state: &mut SpmState, partition: i32, event: SpmEventType) {
        let now = self.shared.hal.now_nanos();
        state.syslog.log(partition, event, now);
    }

    fn reject(&self, state: &mut SpmState, id: PartitionId, operation: &str, err: IpcError) -> SpmError {
        self.record(
            state,
            id.0,
            SpmEventType::Rejected {
                operation: operation.to_string(),
                status: err.status().0,
            },
        );
        SpmError::Ipc(err)
    }

    fn halt(&self, state: &mut SpmState, id: PartitionId, violation: ProtocolViolation) -> SpmError {
        let released = state.core.halt_partition(id);
        state.core.discard_completions(id);
        let reason = violation.to_string();

        self.record(state, id.0, SpmEventType::Violation { reason: reason.clone() });
        self.record(
            state,
            id.0,
            SpmEventType::Halted {
                released: released.len() as u32,
            },
        );
        self.shared.hal.debug_write(&format!(
            "[spm] partition {} halted: {} ({} messages released)",
            id,
            reason,
            released.len()
        ));
        self.shared.hal.partition_faulted(id.0, &reason);

        self.shared.completions.notify_all();
        self.wake(id);
        SpmError::Violation(violation)
    }

    fn await_completion<'a>(
        &'a self,
        mut state: MutexGuard<'a, SpmState>,
        client: PartitionId,
        ticket: CallTicket,
    ) -> Result<Completion, SpmError> {
        loop {
            if let Some(completion) = state.core.take_completion(ticket) {
                return Ok(completion);
            }
            if state.shutdown {
                return Err(SpmError::Shutdown);
            }
            if state.core.is_halted(client) {
                return Err(SpmError::Halted(client));
            }
            state = self
                .shared
                .completions
                .wait(state)
                .map_err(|_| SpmError::Poisoned)?;
        }
    }
}

// ============================================================================
// Partition side
// ============================================================================

/// Partition-side IPC API, bound to one secure partition.
pub struct PartitionContext<H: HAL> {
    spm: Spm<H>,
    id: PartitionId,
}

impl<H: HAL> Clone for PartitionContext<H> {
    fn clone(&self) -> Self {
        Self {
            spm: self.spm.clone(),
            id: self.id,
        }
    }
}

impl<H: HAL> PartitionContext<H> {
    pub fn id(&self) -> PartitionId {
        self.id
    }

    pub fn spm(&self) -> &Spm<H> {
        &self.spm
    }

    /// Client-side API for this partition, for calls into other partitions.
    pub fn client(&self) -> ClientContext<H> {
        ClientContext {
            spm: self.spm.clone(),
            id: self.id,
        }
    }

    /// Signal of service `sid`, if this partition hosts it.
    pub fn service_signal(&self, sid: Sid) -> Result<Option<u32>, SpmError> {
        let state = self.spm.lock()?;
        Ok(state
            .core
            .service(sid)
            .filter(|service| service.partition() == self.id)
            .map(|service| service.descriptor().signal))
    }

    /// Union of this partition's service signals.
    pub fn service_signals(&self) -> Result<u32, SpmError> {
        Ok(self.spm.lock()?.core.service_signals(self.id))
    }

    pub fn interrupt_signals(&self) -> Result<u32, SpmError> {
        let state = self.spm.lock()?;
        Ok(state
            .core
            .partition(self.id)
            .map_or(0, |partition| partition.interrupt_signals()))
    }

    /// Wait until any signal is asserted and return all of them.
    ///
    /// With `Timeout::Poll` the current set (possibly 0) is returned at once.
    pub fn wait_any(&self, timeout: Timeout) -> Result<u32, SpmError> {
        self.wait(timeout, |core, id| core.asserted_signals(id))
    }

    /// Wait on a subset of this partition's interrupt signals and doorbell.
    pub fn wait_interrupt(&self, mask: u32, timeout: Timeout) -> Result<u32, SpmError> {
        self.wait(timeout, move |core, id| core.asserted_interrupts(id, mask))
    }

    /// Fetch the oldest message behind service signal `signal`.
    pub fn get(&self, signal: u32) -> Result<MessageInfo, SpmError> {
        self.op(|spm, state, id| {
            let info = state.core.get(id, signal)?;
            spm.record(
                state,
                id.0,
                SpmEventType::Dispatched {
                    message: info.handle.raw(),
                    sid: info.sid.0,
                    raw_type: info.raw_type,
                },
            );
            Ok(info)
        })
    }

    /// Copy from input iovec `index` at its cursor. See `SpmCore::read`.
    pub fn read(&self, handle: Handle, index: usize, buf: &mut [u8]) -> Result<usize, SpmError> {
        self.op(|_, state, id| state.core.read(id, handle, index, buf))
    }

    pub fn read_at(
        &self,
        handle: Handle,
        index: usize,
        offset: usize,
        buf: &mut [u8],
    ) -> Result<usize, SpmError> {
        self.op(|_, state, id| state.core.read_at(id, handle, index, offset, buf))
    }

    pub fn skip(&self, handle: Handle, index: usize, count: usize) -> Result<usize, SpmError> {
        self.op(|_, state, id| state.core.skip(id, handle, index, count))
    }

    /// Copy into output iovec `index`. Overflowing its capacity halts the
    /// partition.
    pub fn write(&self, handle: Handle, index: usize, offset: usize, data: &[u8]) -> Result<(), SpmError> {
        self.op(|_, state, id| state.core.write(id, handle, index, offset, data))
    }

    /// Complete a message and release its client.
    pub fn reply(&self, handle: Handle, status: Status) -> Result<(), SpmError> {
        self.op(|spm, state, id| {
            let client = state.core.identity(id, handle)?;
            state.core.reply(id, handle, status)?;
            if state.shutdown {
                state.core.discard_all_completions();
            } else if state.core.is_halted(client) {
                state.core.discard_completions(client);
            }
            spm.record(
                state,
                id.0,
                SpmEventType::Completed {
                    message: handle.raw(),
                    status: status.0,
                },
            );
            Ok(())
        })?;
        self.spm.shared.completions.notify_all();
        Ok(())
    }

    pub fn set_reverse_handle(&self, handle: Handle, value: Option<u64>) -> Result<(), SpmError> {
        self.op(|_, state, id| state.core.set_reverse_handle(id, handle, value))
    }

    /// Identity of the client that sent a message.
    pub fn identity(&self, handle: Handle) -> Result<PartitionId, SpmError> {
        self.op(|_, state, id| state.core.identity(id, handle))
    }

    /// Ring the doorbell of `target`.
    pub fn notify(&self, target: PartitionId) -> Result<(), SpmError> {
        let mut state = self.spm.lock()?;
        self.check_running(&state)?;
        if let Err(err) = state.core.notify(target) {
            return Err(self.spm.reject(&mut state, self.id, "notify", err));
        }
        self.spm.record(&mut state, self.id.0, SpmEventType::Doorbell { target: target.0 });
        self.spm.wake(target);
        Ok(())
    }

    /// Clear this partition's doorbell.
    pub fn clear(&self) -> Result<(), SpmError> {
        self.op(|_, state, id| state.core.clear(id))
    }

    /// Acknowledge an interrupt signal.
    pub fn eoi(&self, signal: u32) -> Result<(), SpmError> {
        self.op(|_, state, id| state.core.eoi(id, signal))
    }

    /// Halt this partition for `violation`, as if an operation had failed.
    pub fn fault(&self, violation: ProtocolViolation) -> SpmError {
        match self.spm.lock() {
            Ok(mut state) => {
                if state.core.is_halted(self.id) {
                    return SpmError::Halted(self.id);
                }
                self.spm.halt(&mut state, self.id, violation)
            }
            Err(err) => err,
        }
    }

    fn check_running(&self, state: &SpmState) -> Result<(), SpmError> {
        if state.core.is_halted(self.id) {
            return Err(SpmError::Halted(self.id));
        }
        Ok(())
    }

    /// Run a partition-side operation under the lock; a violation halts us.
    fn op<R>(
        &self,
        f: impl FnOnce(&Spm<H>, &mut SpmState, PartitionId) -> Result<R, ProtocolViolation>,
    ) -> Result<R, SpmError> {
        let mut state = self.spm.lock()?;
        self.check_running(&state)?;
        match f(&self.spm, &mut *state, self.id) {
            Ok(value) => Ok(value),
            Err(violation) => Err(self.spm.halt(&mut state, self.id, violation)),
        }
    }

    fn wait(
        &self,
        timeout: Timeout,
        poll: impl Fn(&SpmCore, PartitionId) -> Result<u32, ProtocolViolation>,
    ) -> Result<u32, SpmError> {
        let wakeup = self
            .spm
            .shared
            .wakeups
            .get(&self.id)
            .ok_or(SpmError::UnknownPartition(self.id))?;

        let mut state = self.spm.lock()?;
        loop {
            if state.shutdown {
                return Err(SpmError::Shutdown);
            }
            self.check_running(&state)?;

            let signals = match poll(&state.core, self.id) {
                Ok(signals) => signals,
                Err(violation) => return Err(self.spm.halt(&mut state, self.id, violation)),
            };
            if signals != 0 || timeout == Timeout::Poll {
                state.core.set_blocked(self.id, false);
                return Ok(signals);
            }

            state.core.set_blocked(self.id, true);
            state = wakeup.wait(state).map_err(|_| SpmError::Poisoned)?;
        }
    }
}

// ============================================================================
// Client side
// ============================================================================

/// Client-side IPC API for a secure partition or a non-secure caller.
pub struct ClientContext<H: HAL> {
    spm: Spm<H>,
    id: PartitionId,
}

impl<H: HAL> Clone for ClientContext<H> {
    fn clone(&self) -> Self {
        Self {
            spm: self.spm.clone(),
            id: self.id,
        }
    }
}

impl<H: HAL> ClientContext<H> {
    pub fn id(&self) -> PartitionId {
        self.id
    }

    /// Connect to service `sid` and block until the service accepts.
    ///
    /// A service refusing the connection yields `SpmError::Rejected`.
    pub fn connect(&self, sid: Sid, minor_version: u32) -> Result<Handle, SpmError> {
        let mut state = self.spm.lock()?;
        self.check_running(&state)?;

        let (channel, ticket) = match state.core.connect(self.id, sid, minor_version) {
            Ok(admitted) => admitted,
            Err(err) => return Err(self.spm.reject(&mut state, self.id, "connect", err)),
        };
        self.spm.record(
            &mut state,
            self.id.0,
            SpmEventType::Connect {
                sid: sid.0,
                minor_version,
                channel: channel.raw(),
            },
        );
        if let Some(service) = state.core.service(sid) {
            self.spm.wake(service.partition());
        }

        let completion = self.spm.await_completion(state, self.id, ticket)?;
        if completion.status.is_error() {
            return Err(SpmError::Rejected(completion.status));
        }
        Ok(channel)
    }

    /// Send a `CALL` and block until the service replies.
    pub fn call(
        &self,
        channel: Handle,
        in_vecs: Vec<Vec<u8>>,
        out_capacities: &[usize],
    ) -> Result<Completion, SpmError> {
        self.submit(channel, MessageType::Call.as_raw(), in_vecs, out_capacities)
    }

    /// Send a message carrying a raw type tag and block for the reply.
    ///
    /// Only `CALL` is accepted; connect and close tags are reserved and any
    /// other tag is refused before it reaches the service.
    pub fn submit(
        &self,
        channel: Handle,
        raw_type: i32,
        in_vecs: Vec<Vec<u8>>,
        out_capacities: &[usize],
    ) -> Result<Completion, SpmError> {
        let mut state = self.spm.lock()?;
        self.check_running(&state)?;

        let ticket = match state
            .core
            .submit(self.id, channel, raw_type, in_vecs, out_capacities)
        {
            Ok(ticket) => ticket,
            Err(err) => return Err(self.spm.reject(&mut state, self.id, "call", err)),
        };
        self.spm.record(
            &mut state,
            self.id.0,
            SpmEventType::Call {
                channel: channel.raw(),
                raw_type,
            },
        );
        self.wake_server(&state, channel);
        self.spm.await_completion(state, self.id, ticket)
    }

    /// Close a channel, blocking until the service acknowledges.
    pub fn close(&self, channel: Handle) -> Result<(), SpmError> {
        let mut state = self.spm.lock()?;
        self.check_running(&state)?;

        let ticket = match state.core.close(self.id, channel) {
            Ok(ticket) => ticket,
            Err(err) => return Err(self.spm.reject(&mut state, self.id, "close", err)),
        };
        if ticket.is_some() {
            self.wake_server(&state, channel);
        }
        self.spm.record(
            &mut state,
            self.id.0,
            SpmEventType::Disconnect {
                channel: channel.raw(),
            },
        );

        if let Some(ticket) = ticket {
            self.spm.await_completion(state, self.id, ticket)?;
        }
        Ok(())
    }

    fn wake_server(&self, state: &SpmState, channel: Handle) {
        if let Ok(channel) = state.core.channel(channel, self.id) {
            self.spm.wake(channel.server);
        }
    }

    fn check_running(&self, state: &SpmState) -> Result<(), SpmError> {
        if !self.id.is_non_secure() && state.core.is_halted(self.id) {
            return Err(SpmError::Halted(self.id));
        }
        Ok(())
    }
}
