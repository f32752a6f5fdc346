//! Secure Partition Manager Boundary Services
//!
//! Services that sit at the edge of the SPM and talk to platform hardware:
//!
//! - **Platform**: device lifecycle get/set, served by a `PartitionRunner`
//! - **Storage**: the `TrustedStorage` backend interface and an in-memory
//!   implementation
//! - **Key store**: persistent key slots layered on `TrustedStorage`

pub mod key_store;
pub mod platform;
pub mod storage;

pub use key_store::{KeyId, KeyStore, KeyStoreError};
pub use platform::{
    lifecycle, register_platform_services, Lifecycle, MemoryLifecycle, LIFECYCLE_STATE_SIZE,
};
pub use storage::{
    FaultPlan, MemoryStorage, StorageError, StorageFlags, StorageInfo, TrustedStorage, Uid,
};
