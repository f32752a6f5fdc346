//! Partition runtime loop
//!
//! A `PartitionRunner` drives one secure partition: it waits for signals,
//! fetches the pending message behind each service signal, hands it to the
//! registered handler and replies. Interrupt signals run their handler and
//! are acknowledged with `eoi`; the doorbell is cleared before its handler
//! runs.
//!
//! # Dispatch Rules
//!
//! | Message type | Action                                   |
//! |--------------|------------------------------------------|
//! | CONNECT      | `ServiceHandler::connect`, then reply     |
//! | CALL         | `ServiceHandler::call`, then always reply |
//! | DISCONNECT   | `ServiceHandler::disconnect`, then reply  |
//! | other        | partition halted (unknown message type)  |

use std::collections::BTreeMap;
use std::thread::{self, JoinHandle};

use spm_core::{
    Handle, IpcError, MessageInfo, MessageType, PartitionId, ProtocolViolation, Sid, Status,
    Timeout,
};
use spm_hal::HAL;
use spm_ipc::signal;

use crate::error::SpmError;
use crate::spm::PartitionContext;

// ============================================================================
// Message access
// ============================================================================

/// Payload access for a dispatched message, independent of the HAL type.
pub trait MessageAccess {
    fn read(&self, handle: Handle, index: usize, buf: &mut [u8]) -> Result<usize, SpmError>;
    fn read_at(&self, handle: Handle, index: usize, offset: usize, buf: &mut [u8]) -> Result<usize, SpmError>;
    fn skip(&self, handle: Handle, index: usize, count: usize) -> Result<usize, SpmError>;
    fn write(&self, handle: Handle, index: usize, offset: usize, data: &[u8]) -> Result<(), SpmError>;
    fn set_reverse_handle(&self, handle: Handle, value: Option<u64>) -> Result<(), SpmError>;
}

impl<H: HAL> MessageAccess for PartitionContext<H> {
    fn read(&self, handle: Handle, index: usize, buf: &mut [u8]) -> Result<usize, SpmError> {
        PartitionContext::read(self, handle, index, buf)
    }

    fn read_at(&self, handle: Handle, index: usize, offset: usize, buf: &mut [u8]) -> Result<usize, SpmError> {
        PartitionContext::read_at(self, handle, index, offset, buf)
    }

    fn skip(&self, handle: Handle, index: usize, count: usize) -> Result<usize, SpmError> {
        PartitionContext::skip(self, handle, index, count)
    }

    fn write(&self, handle: Handle, index: usize, offset: usize, data: &[u8]) -> Result<(), SpmError> {
        PartitionContext::write(self, handle, index, offset, data)
    }

    fn set_reverse_handle(&self, handle: Handle, value: Option<u64>) -> Result<(), SpmError> {
        PartitionContext::set_reverse_handle(self, handle, value)
    }
}

/// A dispatched message as seen by a service handler.
pub struct Request<'a> {
    access: &'a dyn MessageAccess,
    info: MessageInfo,
}

impl<'a> Request<'a> {
    pub fn new(access: &'a dyn MessageAccess, info: MessageInfo) -> Self {
        Self { access, info }
    }

    pub fn info(&self) -> &MessageInfo {
        &self.info
    }

    pub fn handle(&self) -> Handle {
        self.info.handle
    }

    pub fn sid(&self) -> Sid {
        self.info.sid
    }

    pub fn client(&self) -> PartitionId {
        self.info.client
    }

    pub fn raw_type(&self) -> i32 {
        self.info.raw_type
    }

    /// Size of input iovec `index`, 0 if absent or out of range.
    pub fn in_size(&self, index: usize) -> usize {
        self.info.in_sizes.get(index).copied().unwrap_or(0)
    }

    /// Capacity of output iovec `index`, 0 if absent or out of range.
    pub fn out_size(&self, index: usize) -> usize {
        self.info.out_sizes.get(index).copied().unwrap_or(0)
    }

    pub fn read(&self, index: usize, buf: &mut [u8]) -> Result<usize, SpmError> {
        self.access.read(self.info.handle, index, buf)
    }

    pub fn read_at(&self, index: usize, offset: usize, buf: &mut [u8]) -> Result<usize, SpmError> {
        self.access.read_at(self.info.handle, index, offset, buf)
    }

    /// Read the whole remainder of input iovec `index`.
    pub fn read_to_vec(&self, index: usize) -> Result<Vec<u8>, SpmError> {
        let mut buf = vec![0u8; self.in_size(index)];
        let count = self.read(index, &mut buf)?;
        buf.truncate(count);
        Ok(buf)
    }

    pub fn skip(&self, index: usize, count: usize) -> Result<usize, SpmError> {
        self.access.skip(self.info.handle, index, count)
    }

    pub fn write(&self, index: usize, offset: usize, data: &[u8]) -> Result<(), SpmError> {
        self.access.write(self.info.handle, index, offset, data)
    }

    pub fn reverse_handle(&self) -> Option<u64> {
        self.info.reverse_handle
    }

    pub fn set_reverse_handle(&mut self, value: Option<u64>) -> Result<(), SpmError> {
        self.access.set_reverse_handle(self.info.handle, value)?;
        self.info.reverse_handle = value;
        Ok(())
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Handler for the messages of one service.
pub trait ServiceHandler: Send {
    /// A client is connecting. An error status refuses the connection.
    fn connect(&mut self, _request: &mut Request<'_>) -> Status {
        Status::SUCCESS
    }

    /// A CALL arrived. An `Err` not caused by a protocol violation is
    /// replied as its status.
    fn call(&mut self, request: &mut Request<'_>) -> Result<Status, SpmError>;

    /// A client closed its channel. The status is delivered but cannot
    /// keep the channel open.
    fn disconnect(&mut self, _request: &mut Request<'_>) -> Status {
        Status::SUCCESS
    }
}

impl<F> ServiceHandler for F
where
    F: FnMut(&mut Request<'_>) -> Result<Status, SpmError> + Send,
{
    fn call(&mut self, request: &mut Request<'_>) -> Result<Status, SpmError> {
        self(request)
    }
}

/// Handler for one interrupt signal. The runner issues `eoi` afterwards.
pub trait InterruptHandler: Send {
    fn handle(&mut self, signal: u32) -> Result<(), SpmError>;
}

impl<F> InterruptHandler for F
where
    F: FnMut(u32) -> Result<(), SpmError> + Send,
{
    fn handle(&mut self, signal: u32) -> Result<(), SpmError> {
        self(signal)
    }
}

type DoorbellHandler = Box<dyn FnMut() -> Result<(), SpmError> + Send>;

enum Dispatch {
    Service(Box<dyn ServiceHandler>),
    Interrupt(Box<dyn InterruptHandler>),
}

// ============================================================================
// PartitionRunner
// ============================================================================

/// Signal dispatch loop for one partition.
pub struct PartitionRunner<H: HAL> {
    ctx: PartitionContext<H>,
    dispatch: BTreeMap<u32, Dispatch>,
    doorbell: Option<DoorbellHandler>,
}

impl<H: HAL> PartitionRunner<H> {
    pub fn new(ctx: PartitionContext<H>) -> Self {
        Self {
            ctx,
            dispatch: BTreeMap::new(),
            doorbell: None,
        }
    }

    pub fn context(&self) -> &PartitionContext<H> {
        &self.ctx
    }

    /// Route messages for `sid` (hosted by this partition) to `handler`.
    pub fn register_service(
        &mut self,
        sid: Sid,
        handler: impl ServiceHandler + 'static,
    ) -> Result<&mut Self, SpmError> {
        let signal = self
            .ctx
            .service_signal(sid)?
            .ok_or(SpmError::Ipc(IpcError::UnknownService(sid)))?;
        self.dispatch
            .insert(signal, Dispatch::Service(Box::new(handler)));
        Ok(self)
    }

    /// Route interrupt `signal` (declared for this partition) to `handler`.
    pub fn register_interrupt(
        &mut self,
        signal: u32,
        handler: impl InterruptHandler + 'static,
    ) -> Result<&mut Self, SpmError> {
        if !signal::is_single(signal) || self.ctx.interrupt_signals()? & signal == 0 {
            return Err(SpmError::Ipc(IpcError::InvalidSignal(signal)));
        }
        self.dispatch
            .insert(signal, Dispatch::Interrupt(Box::new(handler)));
        Ok(self)
    }

    /// Run `handler` each time the doorbell is rung.
    pub fn on_doorbell(
        &mut self,
        handler: impl FnMut() -> Result<(), SpmError> + Send + 'static,
    ) -> &mut Self {
        self.doorbell = Some(Box::new(handler));
        self
    }

    /// Wait once and dispatch every asserted signal. Returns the signal set.
    pub fn run_once(&mut self, timeout: Timeout) -> Result<u32, SpmError> {
        let signals = self.ctx.wait_any(timeout)?;

        for bit in signal::iter(signals) {
            if bit == signal::DOORBELL {
                self.ctx.clear()?;
                if let Some(handler) = self.doorbell.as_mut() {
                    handler()?;
                }
                continue;
            }

            match self.dispatch.get_mut(&bit) {
                Some(Dispatch::Service(handler)) => serve(&self.ctx, bit, handler.as_mut())?,
                Some(Dispatch::Interrupt(handler)) => {
                    handler.handle(bit)?;
                    self.ctx.eoi(bit)?;
                }
                None => return Err(SpmError::UnhandledSignal(bit)),
            }
        }
        Ok(signals)
    }

    /// Serve until the SPM shuts down.
    ///
    /// Every service and interrupt signal of the partition must have a
    /// handler. Returns the error that stopped the loop, e.g. the violation
    /// that halted the partition.
    pub fn run(&mut self) -> Result<(), SpmError> {
        let owned = self.ctx.service_signals()? | self.ctx.interrupt_signals()?;
        let handled = self.dispatch.keys().fold(0, |acc, bit| acc | bit);
        let missing = owned & !handled;
        if missing != 0 {
            return Err(SpmError::UnhandledSignal(missing));
        }

        loop {
            match self.run_once(Timeout::Block) {
                Ok(_) => {}
                Err(SpmError::Shutdown) => return Ok(()),
                Err(err) => {
                    self.ctx.spm().hal().debug_write(&format!(
                        "[spm] partition {} stopped: {}",
                        self.ctx.id(),
                        err
                    ));
                    return Err(err);
                }
            }
        }
    }

    /// Run the loop on a thread named after the partition.
    pub fn spawn(mut self) -> std::io::Result<JoinHandle<Result<(), SpmError>>> {
        thread::Builder::new()
            .name(format!("partition-{}", self.ctx.id()))
            .spawn(move || self.run())
    }
}

/// Fetch the message behind `signal`, run its handler and reply.
fn serve<H: HAL>(
    ctx: &PartitionContext<H>,
    signal: u32,
    handler: &mut dyn ServiceHandler,
) -> Result<(), SpmError> {
    let info = ctx.get(signal)?;
    let handle = info.handle;
    let kind = info.kind();
    let raw_type = info.raw_type;
    let mut request = Request::new(ctx, info);

    let status = match kind {
        Some(MessageType::Connect) => handler.connect(&mut request),
        Some(MessageType::Disconnect) => handler.disconnect(&mut request),
        Some(MessageType::Call) => match handler.call(&mut request) {
            Ok(status) => status,
            Err(err @ (SpmError::Violation(_)
            | SpmError::Halted(_)
            | SpmError::Shutdown
            | SpmError::Poisoned)) => return Err(err),
            Err(err) => {
                ctx.spm()
                    .hal()
                    .debug_write(&format!("[spm] handler for {} failed: {}", request.sid(), err));
                err.status()
            }
        },
        None => return Err(ctx.fault(ProtocolViolation::UnknownMessageType(raw_type))),
    };

    ctx.reply(handle, status)
}
