//! SPM runtime integration tests
//!
//! Each test boots an SPM from a JSON manifest, runs the serving partition
//! on its own thread and drives it from the test thread as a client.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

use spin::Mutex;
use spm_core::{
    AccessPermission, AccessRequest, IpcError, PartitionId, PartitionState, ProtectionContext,
    ProtocolViolation, Sid, Status, Timeout,
};
use spm_hal::HAL;
use spm_kernel::{
    PartitionRunner, Request, ServiceHandler, Spm, SpmConfig, SpmError, SpmEventType,
};

// ============================================================================
// Mock HAL for Testing
// ============================================================================

pub struct MockHal {
    time: AtomicU64,
    debug_log: Mutex<Vec<String>>,
    faults: Mutex<Vec<(i32, String)>>,
}

impl MockHal {
    pub fn new() -> Self {
        Self {
            time: AtomicU64::new(0),
            debug_log: Mutex::new(Vec::new()),
            faults: Mutex::new(Vec::new()),
        }
    }

    fn has_log_containing(&self, substr: &str) -> bool {
        self.debug_log.lock().iter().any(|msg| msg.contains(substr))
    }

    fn faults(&self) -> Vec<(i32, String)> {
        self.faults.lock().clone()
    }
}

impl Default for MockHal {
    fn default() -> Self {
        Self::new()
    }
}

impl HAL for MockHal {
    fn now_nanos(&self) -> u64 {
        self.time.fetch_add(1000, Ordering::SeqCst)
    }

    fn debug_write(&self, msg: &str) {
        self.debug_log.lock().push(msg.to_string());
    }

    fn partition_faulted(&self, partition: i32, reason: &str) {
        self.debug_log
            .lock()
            .push(format!("[mock-hal] partition {} faulted: {}", partition, reason));
        self.faults.lock().push((partition, reason.to_string()));
    }
}

// ============================================================================
// Fixtures
// ============================================================================

const SERVER: PartitionId = PartitionId(1);
const CLIENT: PartitionId = PartitionId(2);
const ECHO_SID: Sid = Sid(0x40);
const SECURE_SID: Sid = Sid(0x41);
const IRQ_LINE: u32 = 20;
const IRQ_SIGNAL: u32 = 1 << 9;

const MANIFEST: &str = r#"{
    "max_channels": 4,
    "max_messages": 4,
    "partitions": [
        {
            "name": "ECHO",
            "id": 1,
            "services": [
                { "name": "ECHO", "sid": 64, "signal": 4, "nspe_callable": true },
                { "name": "SECURE_ECHO", "sid": 65, "signal": 5 }
            ],
            "irqs": [{ "line_num": 20, "signal": 9 }]
        },
        {
            "name": "CLIENT",
            "id": 2,
            "services": [{ "name": "UNUSED", "sid": 80, "signal": 4 }],
            "extern_sids": [64, 65]
        }
    ]
}"#;

fn boot() -> Spm<MockHal> {
    let config = SpmConfig::from_json(MANIFEST).unwrap();
    Spm::new(MockHal::new(), config).unwrap()
}

fn echo(req: &mut Request<'_>) -> Result<Status, SpmError> {
    let data = req.read_to_vec(0)?;
    req.write(0, 0, &data)?;
    Ok(Status::SUCCESS)
}

fn ignore_irq(_signal: u32) -> Result<(), SpmError> {
    Ok(())
}

/// Server runner with every signal handled by `handler`, echo or a no-op.
fn server(spm: &Spm<MockHal>, handler: impl ServiceHandler + 'static) -> PartitionRunner<MockHal> {
    let mut runner = PartitionRunner::new(spm.partition(SERVER).unwrap());
    runner.register_service(ECHO_SID, handler).unwrap();
    runner.register_service(SECURE_SID, echo).unwrap();
    runner.register_interrupt(IRQ_SIGNAL, ignore_irq).unwrap();
    runner
}

fn stop(spm: &Spm<MockHal>, worker: JoinHandle<Result<(), SpmError>>) -> Result<(), SpmError> {
    spm.shutdown();
    worker.join().unwrap()
}

// ============================================================================
// Request/reply
// ============================================================================

#[test]
fn test_connect_call_close() {
    let spm = boot();
    let worker = server(&spm, echo).spawn().unwrap();

    let client = spm.non_secure_client(1);
    let channel = client.connect(ECHO_SID, 1).unwrap();
    let completion = client.call(channel, vec![b"hello".to_vec()], &[16]).unwrap();
    assert_eq!(completion.status, Status::SUCCESS);
    assert_eq!(completion.channel, channel);
    assert_eq!(completion.outputs[0], b"hello");

    client.close(channel).unwrap();
    assert_eq!(spm.channels_in_use().unwrap(), 0);
    assert!(spm.check_invariants().unwrap().is_empty());

    stop(&spm, worker).unwrap();
}

#[test]
fn test_audit_trail_records_lifecycle() {
    let spm = boot();
    let worker = server(&spm, echo).spawn().unwrap();

    let client = spm.non_secure_client(1);
    let channel = client.connect(ECHO_SID, 1).unwrap();
    client.call(channel, vec![b"x".to_vec()], &[1]).unwrap();
    client.close(channel).unwrap();
    stop(&spm, worker).unwrap();

    let events = spm.audit_events().unwrap();
    let has = |f: fn(&SpmEventType) -> bool| events.iter().any(|e| f(&e.event_type));
    assert!(has(|e| matches!(e, SpmEventType::PartitionRegistered { services: 2, .. })));
    assert!(has(|e| matches!(e, SpmEventType::Connect { sid: 0x40, .. })));
    assert!(has(|e| matches!(e, SpmEventType::Call { raw_type: 2, .. })));
    assert!(has(|e| matches!(e, SpmEventType::Dispatched { sid: 0x40, .. })));
    assert!(has(|e| matches!(e, SpmEventType::Completed { status: 0, .. })));
    assert!(has(|e| matches!(e, SpmEventType::Disconnect { .. })));

    let ids: Vec<u64> = events.iter().map(|e| e.id).collect();
    assert!(ids.windows(2).all(|w| w[0] < w[1]));
    assert!(spm.audit_json().unwrap().contains("Dispatched"));
}

#[test]
fn test_short_reads_truncate() {
    let spm = boot();
    let worker = server(&spm, |req: &mut Request<'_>| -> Result<Status, SpmError> {
        let mut chunk = [0u8; 4];
        let mut total = 0u8;
        loop {
            let count = req.read(0, &mut chunk)?;
            if count == 0 {
                break;
            }
            total += count as u8;
        }
        // Last copy was two bytes; the exhausted read left the rest untouched.
        assert_eq!(chunk, *b"ijgh");
        req.write(0, 0, &[total])?;
        Ok(Status::SUCCESS)
    })
    .spawn()
    .unwrap();

    let client = spm.non_secure_client(1);
    let channel = client.connect(ECHO_SID, 1).unwrap();
    let completion = client.call(channel, vec![b"abcdefghij".to_vec()], &[4]).unwrap();
    assert_eq!(completion.outputs[0], vec![10]);

    client.close(channel).unwrap();
    stop(&spm, worker).unwrap();
}

#[test]
fn test_reverse_handle_persists_across_calls() {
    struct Counter;

    impl ServiceHandler for Counter {
        fn connect(&mut self, request: &mut Request<'_>) -> Status {
            match request.set_reverse_handle(Some(0)) {
                Ok(()) => Status::SUCCESS,
                Err(err) => err.status(),
            }
        }

        fn call(&mut self, request: &mut Request<'_>) -> Result<Status, SpmError> {
            let next = request.reverse_handle().unwrap_or(0) + 1;
            request.set_reverse_handle(Some(next))?;
            request.write(0, 0, &next.to_le_bytes())?;
            Ok(Status::SUCCESS)
        }
    }

    let spm = boot();
    let worker = server(&spm, Counter).spawn().unwrap();

    let client = spm.non_secure_client(1);
    let channel = client.connect(ECHO_SID, 1).unwrap();
    for expected in 1u64..=3 {
        let completion = client.call(channel, vec![], &[8]).unwrap();
        assert_eq!(completion.outputs[0], expected.to_le_bytes());
    }

    client.close(channel).unwrap();
    stop(&spm, worker).unwrap();
}

#[test]
fn test_drop_connection_refuses_later_calls() {
    let spm = boot();
    let worker = server(&spm, |_req: &mut Request<'_>| -> Result<Status, SpmError> {
        Ok(Status::DROP_CONNECTION)
    })
    .spawn()
    .unwrap();

    let client = spm.non_secure_client(1);
    let channel = client.connect(ECHO_SID, 1).unwrap();
    let completion = client.call(channel, vec![], &[]).unwrap();
    assert_eq!(completion.status, Status::DROP_CONNECTION);

    let err = client.call(channel, vec![], &[]).unwrap_err();
    assert!(matches!(err, SpmError::Ipc(IpcError::ConnectionRefused)));
    assert_eq!(err.status(), Status::CONNECTION_REFUSED);

    client.close(channel).unwrap();
    assert_eq!(spm.channels_in_use().unwrap(), 0);
    stop(&spm, worker).unwrap();
}

#[test]
fn test_service_refuses_connection() {
    struct Closed;

    impl ServiceHandler for Closed {
        fn connect(&mut self, _request: &mut Request<'_>) -> Status {
            Status::NOT_PERMITTED
        }

        fn call(&mut self, _request: &mut Request<'_>) -> Result<Status, SpmError> {
            Ok(Status::SUCCESS)
        }
    }

    let spm = boot();
    let worker = server(&spm, Closed).spawn().unwrap();

    let err = spm.non_secure_client(1).connect(ECHO_SID, 1).unwrap_err();
    assert!(matches!(err, SpmError::Rejected(Status::NOT_PERMITTED)));
    assert_eq!(spm.channels_in_use().unwrap(), 0);

    stop(&spm, worker).unwrap();
}

#[test]
fn test_handler_error_is_replied_as_status() {
    let spm = boot();
    let worker = server(&spm, |_req: &mut Request<'_>| -> Result<Status, SpmError> {
        Err(SpmError::Rejected(Status::INSUFFICIENT_STORAGE))
    })
    .spawn()
    .unwrap();

    let client = spm.non_secure_client(1);
    let channel = client.connect(ECHO_SID, 1).unwrap();
    let completion = client.call(channel, vec![], &[]).unwrap();
    assert_eq!(completion.status, Status::INSUFFICIENT_STORAGE);
    assert!(spm.hal().has_log_containing("handler for 0x40 failed"));

    client.close(channel).unwrap();
    stop(&spm, worker).unwrap();
}

// ============================================================================
// Connection policy
// ============================================================================

#[test]
fn test_non_secure_client_cannot_reach_secure_only_service() {
    let spm = boot();
    let err = spm.non_secure_client(1).connect(SECURE_SID, 1).unwrap_err();
    assert!(matches!(err, SpmError::Ipc(IpcError::ServiceNotPermitted(sid)) if sid == SECURE_SID));
    assert_eq!(err.status(), Status::NOT_PERMITTED);

    let events = spm.audit_events().unwrap();
    assert!(events
        .iter()
        .any(|e| matches!(&e.event_type, SpmEventType::Rejected { operation, .. } if operation == "connect")));
}

#[test]
fn test_secure_client_uses_extern_sids() {
    let spm = boot();
    let worker = server(&spm, echo).spawn().unwrap();

    let client = spm.client(CLIENT).unwrap();
    let channel = client.connect(SECURE_SID, 1).unwrap();
    let completion = client.call(channel, vec![b"sec".to_vec()], &[3]).unwrap();
    assert_eq!(completion.outputs[0], b"sec");
    client.close(channel).unwrap();

    let server_as_client = spm.client(SERVER).unwrap();
    let err = server_as_client.connect(Sid(80), 1).unwrap_err();
    assert!(matches!(err, SpmError::Ipc(IpcError::ServiceNotPermitted(_))));

    stop(&spm, worker).unwrap();
}

#[test]
fn test_minor_version_mismatch() {
    let spm = boot();
    let err = spm.non_secure_client(1).connect(ECHO_SID, 2).unwrap_err();
    assert!(matches!(
        err,
        SpmError::Ipc(IpcError::VersionMismatch { requested: 2, declared: 1, .. })
    ));
}

#[test]
fn test_unknown_partition_and_service() {
    let spm = boot();
    assert!(matches!(
        spm.partition(PartitionId(9)),
        Err(SpmError::UnknownPartition(PartitionId(9)))
    ));
    let err = spm.non_secure_client(1).connect(Sid(0x99), 1).unwrap_err();
    assert_eq!(err.status(), Status::DOES_NOT_EXIST);
}

#[test]
fn test_channel_pool_exhaustion() {
    let spm = boot();
    let worker = server(&spm, echo).spawn().unwrap();

    let client = spm.non_secure_client(1);
    let channels: Vec<_> = (0..4).map(|_| client.connect(ECHO_SID, 1).unwrap()).collect();
    let err = client.connect(ECHO_SID, 1).unwrap_err();
    assert_eq!(err.status(), Status::INSUFFICIENT_MEMORY);

    for channel in channels {
        client.close(channel).unwrap();
    }
    stop(&spm, worker).unwrap();
}

#[test]
fn test_message_quota_is_per_client() {
    let mut config = SpmConfig::from_json(MANIFEST).unwrap();
    config.max_messages = 1;
    let spm = Spm::new(MockHal::new(), config).unwrap();
    let ctx = spm.partition(SERVER).unwrap();

    let first = spm.non_secure_client(1);
    let pending = {
        let first = first.clone();
        std::thread::spawn(move || first.connect(ECHO_SID, 1))
    };
    assert_eq!(ctx.wait_any(Timeout::Block).unwrap(), 1 << 4);

    // The pending connect uses the first client's only slot.
    let err = first.connect(ECHO_SID, 1).unwrap_err();
    assert_eq!(err.status(), Status::INSUFFICIENT_MEMORY);

    let second = spm.non_secure_client(2);
    let other = std::thread::spawn(move || {
        let channel = second.connect(ECHO_SID, 1)?;
        second.call(channel, vec![b"hi".to_vec()], &[2])
    });
    let worker = server(&spm, echo).spawn().unwrap();

    let channel = pending.join().unwrap().unwrap();
    assert_eq!(other.join().unwrap().unwrap().outputs[0], b"hi");

    let reply = first.call(channel, vec![b"ok".to_vec()], &[2]).unwrap();
    assert_eq!(reply.outputs[0], b"ok");

    first.close(channel).unwrap();
    stop(&spm, worker).unwrap();
}

// ============================================================================
// Faults
// ============================================================================

#[test]
fn test_write_overflow_halts_partition() {
    let spm = boot();
    let worker = server(&spm, |req: &mut Request<'_>| -> Result<Status, SpmError> {
        req.write(0, 0, &[0u8; 32])?;
        Ok(Status::SUCCESS)
    })
    .spawn()
    .unwrap();

    let client = spm.non_secure_client(1);
    let channel = client.connect(ECHO_SID, 1).unwrap();
    let completion = client.call(channel, vec![], &[4]).unwrap();
    assert_eq!(completion.status, Status::CONNECTION_REFUSED);

    let result = worker.join().unwrap();
    assert!(matches!(
        result,
        Err(SpmError::Violation(ProtocolViolation::WriteOverflow { capacity: 4, .. }))
    ));
    assert_eq!(spm.partition_state(SERVER).unwrap(), PartitionState::Halted);

    let faults = spm.hal().faults();
    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0].0, SERVER.0);
    assert!(spm.hal().has_log_containing("[spm] partition 1 halted"));

    // Channel is dropped; closing it tears it down without the server.
    let err = client.call(channel, vec![], &[]).unwrap_err();
    assert_eq!(err.status(), Status::CONNECTION_REFUSED);
    client.close(channel).unwrap();

    let err = client.connect(ECHO_SID, 1).unwrap_err();
    assert!(matches!(err, SpmError::Ipc(IpcError::ConnectionRefused)));

    let ctx = spm.partition(SERVER).unwrap();
    assert!(matches!(ctx.wait_any(Timeout::Poll), Err(SpmError::Halted(SERVER))));
    assert!(spm.check_invariants().unwrap().is_empty());
}

#[test]
fn test_unknown_message_type_refused_at_submit() {
    let spm = boot();
    let worker = server(&spm, echo).spawn().unwrap();

    let intruder = spm.non_secure_client(1);
    let channel = intruder.connect(ECHO_SID, 1).unwrap();
    for raw_type in [7, 0x1234, -1] {
        let err = intruder.submit(channel, raw_type, vec![], &[]).unwrap_err();
        assert!(matches!(err, SpmError::Ipc(IpcError::UnknownMessageType(t)) if t == raw_type));
        assert_eq!(err.status(), Status::INVALID_ARGUMENT);
    }

    // The service keeps serving the same channel and new clients.
    let reply = intruder.call(channel, vec![b"again".to_vec()], &[5]).unwrap();
    assert_eq!(reply.outputs[0], b"again");

    let other = spm.non_secure_client(2);
    let other_channel = other.connect(ECHO_SID, 1).unwrap();
    let reply = other.call(other_channel, vec![b"still up".to_vec()], &[8]).unwrap();
    assert_eq!(reply.outputs[0], b"still up");

    assert_ne!(spm.partition_state(SERVER).unwrap(), PartitionState::Halted);
    assert!(spm.hal().faults().is_empty());

    intruder.close(channel).unwrap();
    other.close(other_channel).unwrap();
    stop(&spm, worker).unwrap();
}

#[test]
fn test_halted_client_leaves_no_completion_behind() {
    let spm = boot();
    let ctx = spm.partition(SERVER).unwrap();
    let caller = spm.client(CLIENT).unwrap();
    let pending = std::thread::spawn(move || {
        let channel = caller.connect(ECHO_SID, 1)?;
        caller.call(channel, vec![b"late".to_vec()], &[4])
    });

    // Accept the connection, then hold on to the call.
    assert_eq!(ctx.wait_any(Timeout::Block).unwrap(), 1 << 4);
    let connect = ctx.get(1 << 4).unwrap();
    ctx.reply(connect.handle, Status::SUCCESS).unwrap();
    assert_eq!(ctx.wait_any(Timeout::Block).unwrap(), 1 << 4);
    let call = ctx.get(1 << 4).unwrap();

    let fault = spm
        .partition(CLIENT)
        .unwrap()
        .fault(ProtocolViolation::SignalNotAsserted(1 << 4));
    assert!(matches!(fault, SpmError::Violation(_)));
    assert!(matches!(pending.join().unwrap(), Err(SpmError::Halted(CLIENT))));

    ctx.write(call.handle, 0, 0, b"late").unwrap();
    ctx.reply(call.handle, Status::SUCCESS).unwrap();
    assert_eq!(spm.completions_pending().unwrap(), 0);
    assert!(spm.check_invariants().unwrap().is_empty());
}

#[test]
fn test_reserved_type_rejected_at_submit() {
    let spm = boot();
    let worker = server(&spm, echo).spawn().unwrap();

    let client = spm.non_secure_client(1);
    let channel = client.connect(ECHO_SID, 1).unwrap();
    let err = client.submit(channel, 1, vec![], &[]).unwrap_err();
    assert!(matches!(err, SpmError::Ipc(IpcError::ReservedMessageType(1))));

    client.close(channel).unwrap();
    stop(&spm, worker).unwrap();
}

#[test]
fn test_get_on_unasserted_signal_halts() {
    let spm = boot();
    let ctx = spm.partition(SERVER).unwrap();

    let err = ctx.get(1 << 4).unwrap_err();
    assert!(matches!(
        err,
        SpmError::Violation(ProtocolViolation::SignalNotAsserted(_))
    ));
    assert!(matches!(ctx.eoi(IRQ_SIGNAL), Err(SpmError::Halted(SERVER))));
    assert!(matches!(
        ctx.fault(ProtocolViolation::NotSingleSignal(0)),
        SpmError::Halted(SERVER)
    ));
}

// ============================================================================
// Doorbells and interrupts
// ============================================================================

#[test]
fn test_doorbell_wakes_partition() {
    let spm = boot();
    let (tx, rx) = mpsc::channel();
    let mut runner = server(&spm, echo);
    runner.on_doorbell(move || {
        let _ = tx.send(());
        Ok(())
    });
    let worker = runner.spawn().unwrap();

    let caller = spm.partition(CLIENT).unwrap();
    caller.notify(SERVER).unwrap();
    rx.recv_timeout(Duration::from_secs(5)).unwrap();

    assert!(matches!(
        caller.notify(PartitionId(9)),
        Err(SpmError::Ipc(IpcError::UnknownPartition(_)))
    ));
    stop(&spm, worker).unwrap();
}

#[test]
fn test_irq_line_routes_to_partition() {
    let spm = boot();
    let (tx, rx) = mpsc::channel();
    let mut runner = server(&spm, echo);
    runner
        .register_interrupt(IRQ_SIGNAL, move |signal: u32| -> Result<(), SpmError> {
            let _ = tx.send(signal);
            Ok(())
        })
        .unwrap();
    let worker = runner.spawn().unwrap();

    spm.raise_irq(IRQ_LINE).unwrap();
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), IRQ_SIGNAL);

    assert!(matches!(spm.raise_irq(99), Err(SpmError::UnknownIrqLine(99))));
    stop(&spm, worker).unwrap();

    let events = spm.audit_events().unwrap();
    assert!(events
        .iter()
        .any(|e| matches!(e.event_type, SpmEventType::Interrupt { signal } if signal == IRQ_SIGNAL)));
}

#[test]
fn test_wait_interrupt_polls_subset() {
    let spm = boot();
    let ctx = spm.partition(SERVER).unwrap();

    assert_eq!(ctx.wait_interrupt(IRQ_SIGNAL, Timeout::Poll).unwrap(), 0);
    spm.assert_interrupt(SERVER, IRQ_SIGNAL).unwrap();
    assert_eq!(ctx.wait_interrupt(IRQ_SIGNAL, Timeout::Block).unwrap(), IRQ_SIGNAL);
    ctx.eoi(IRQ_SIGNAL).unwrap();
    assert_eq!(ctx.wait_any(Timeout::Poll).unwrap(), 0);
}

#[test]
fn test_wait_interrupt_on_service_signal_halts() {
    let spm = boot();
    let ctx = spm.partition(SERVER).unwrap();
    let err = ctx.wait_interrupt(1 << 4, Timeout::Poll).unwrap_err();
    assert!(matches!(
        err,
        SpmError::Violation(ProtocolViolation::InterruptMaskNotSubset { .. })
    ));
    assert_eq!(spm.partition_state(SERVER).unwrap(), PartitionState::Halted);
}

// ============================================================================
// Runner lifecycle
// ============================================================================

#[test]
fn test_run_requires_every_signal_handled() {
    let spm = boot();
    let mut runner = PartitionRunner::new(spm.partition(SERVER).unwrap());
    runner.register_service(ECHO_SID, echo).unwrap();
    assert!(matches!(runner.run(), Err(SpmError::UnhandledSignal(missing)) if missing == (1 << 5) | IRQ_SIGNAL));
}

#[test]
fn test_register_rejects_foreign_signals() {
    let spm = boot();
    let mut runner = PartitionRunner::new(spm.partition(SERVER).unwrap());
    assert!(runner.register_service(Sid(80), echo).is_err());
    assert!(runner.register_interrupt(1 << 4, ignore_irq).is_err());
}

#[test]
fn test_shutdown_stops_runner() {
    let spm = boot();
    let worker = server(&spm, echo).spawn().unwrap();
    assert!(stop(&spm, worker).is_ok());
    assert!(spm.hal().has_log_containing("[spm] shutdown"));
}

#[test]
fn test_bad_manifest_rejected() {
    let mut config = SpmConfig::from_json(MANIFEST).unwrap();
    config.partitions[1].id = 1;
    assert!(matches!(
        Spm::new(MockHal::new(), config),
        Err(SpmError::Config(_))
    ));
}

#[test]
fn test_empty_protection_allows_everything() {
    let spm = boot();
    let access = AccessRequest {
        start: 0x1000,
        size: 4,
        privileged: false,
        secure: false,
        context: ProtectionContext(3),
        permission: AccessPermission::READ,
    };
    assert!(spm.memory_decision(&access).is_allowed());
    assert!(spm.peripheral_decision(&access).is_allowed());
}
