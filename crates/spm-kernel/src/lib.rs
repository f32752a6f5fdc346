//! Secure Partition Manager Runtime
//!
//! This crate turns the pure `spm-core` state machine into a running SPM:
//! - Manifest loading and validation (`config`)
//! - Blocking partition-side and client-side IPC (`spm`)
//! - One dispatch loop per partition (`runtime`)
//! - Halting partitions that violate the IPC protocol
//!
//! All state lives behind one mutex; partitions park on their own condition
//! variable until a signal is asserted, clients park until their message
//! completes.
//!
//! # Example
//!
//! ```no_run
//! use spm_hal::HostHal;
//! use spm_kernel::{PartitionRunner, Request, Spm, SpmConfig, SpmError};
//! use spm_core::{PartitionId, Sid, Status};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SpmConfig::from_file("spm.json")?;
//! let spm = Spm::new(HostHal::new(), config)?;
//!
//! let mut runner = PartitionRunner::new(spm.partition(PartitionId(1))?);
//! runner.register_service(Sid(0x40), |_req: &mut Request<'_>| -> Result<Status, SpmError> {
//!     Ok(Status::SUCCESS)
//! })?;
//! let worker = runner.spawn()?;
//!
//! let client = spm.non_secure_client(1);
//! let channel = client.connect(Sid(0x40), 1)?;
//! client.call(channel, vec![b"ping".to_vec()], &[16])?;
//! client.close(channel)?;
//!
//! spm.shutdown();
//! let _ = worker.join();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod runtime;
pub mod spm;

pub use config::{ConfigError, IrqManifest, PartitionManifest, ServiceManifest, SpmConfig};
pub use error::SpmError;
pub use runtime::{InterruptHandler, MessageAccess, PartitionRunner, Request, ServiceHandler};
pub use spm::{ClientContext, PartitionContext, Spm};

// Re-export HAL and audit types
pub use spm_axiom::{SpmEvent, SpmEventType, SysLog};
pub use spm_hal::HAL as HalTrait;
