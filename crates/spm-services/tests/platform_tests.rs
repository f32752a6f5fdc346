//! Lifecycle service driven through a running SPM.

use spm_core::{IpcError, PartitionId, Sid, Status};
use spm_hal::HostHal;
use spm_kernel::{PartitionRunner, Spm, SpmConfig, SpmError};
use spm_services::{lifecycle, register_platform_services, MemoryLifecycle};

const PLATFORM: PartitionId = PartitionId(8);
const LC_GET: Sid = Sid(0x1000);
const LC_SET: Sid = Sid(0x1001);

const MANIFEST: &str = r#"{
    "max_channels": 8,
    "max_messages": 8,
    "partitions": [{
        "name": "PLATFORM",
        "id": 8,
        "services": [
            { "name": "LC_GET", "sid": 4096, "signal": 4, "nspe_callable": true },
            { "name": "LC_SET", "sid": 4097, "signal": 5, "nspe_callable": true }
        ]
    }]
}"#;

fn boot() -> (Spm<HostHal>, std::thread::JoinHandle<Result<(), SpmError>>) {
    let spm = Spm::new(HostHal::new(), SpmConfig::from_json(MANIFEST).unwrap()).unwrap();
    let mut runner = PartitionRunner::new(spm.partition(PLATFORM).unwrap());
    register_platform_services(&mut runner, LC_GET, LC_SET, MemoryLifecycle::default()).unwrap();
    let worker = runner.spawn().unwrap();
    (spm, worker)
}

#[test]
fn test_lifecycle_get_and_set() {
    let (spm, worker) = boot();
    let client = spm.non_secure_client(1);

    let get = client.connect(LC_GET, 1).unwrap();
    let reply = client.call(get, vec![], &[4]).unwrap();
    assert_eq!(reply.status, Status::SUCCESS);
    assert_eq!(reply.outputs[0], lifecycle::ASSEMBLY_AND_TEST.to_le_bytes());

    let set = client.connect(LC_SET, 1).unwrap();
    let reply = client
        .call(set, vec![lifecycle::SECURED.to_le_bytes().to_vec()], &[])
        .unwrap();
    assert_eq!(reply.status, Status::SUCCESS);

    let reply = client
        .call(set, vec![lifecycle::ASSEMBLY_AND_TEST.to_le_bytes().to_vec()], &[])
        .unwrap();
    assert_eq!(reply.status, Status::NOT_PERMITTED);

    let reply = client.call(get, vec![], &[4]).unwrap();
    assert_eq!(reply.outputs[0], lifecycle::SECURED.to_le_bytes());

    client.close(get).unwrap();
    client.close(set).unwrap();
    spm.shutdown();
    worker.join().unwrap().unwrap();
}

#[test]
fn test_wrong_size_drops_connection() {
    let (spm, worker) = boot();
    let client = spm.non_secure_client(1);

    let get = client.connect(LC_GET, 1).unwrap();
    let reply = client.call(get, vec![], &[2]).unwrap();
    assert_eq!(reply.status, Status::DROP_CONNECTION);
    assert!(reply.outputs[0].is_empty());
    assert!(matches!(
        client.call(get, vec![], &[4]),
        Err(SpmError::Ipc(IpcError::ConnectionRefused))
    ));

    let set = client.connect(LC_SET, 1).unwrap();
    let reply = client.call(set, vec![vec![0u8; 3]], &[]).unwrap();
    assert_eq!(reply.status, Status::DROP_CONNECTION);

    client.close(get).unwrap();
    client.close(set).unwrap();
    spm.shutdown();
    worker.join().unwrap().unwrap();
}
