//! Trusted storage boundary.
//!
//! Secure services persist data through `TrustedStorage`, a flat uid-keyed
//! store. `MemoryStorage` keeps everything in memory and can be told to
//! misbehave so callers' failure paths can be exercised.

use std::collections::BTreeMap;

use bitflags::bitflags;
use spin::Mutex;
use spm_core::Status;

/// Storage entry identifier. Uid 0 is invalid.
pub type Uid = u64;

bitflags! {
    /// Flags attached to an entry when it is created.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct StorageFlags: u32 {
        /// Entry can never be modified or removed once written.
        const WRITE_ONCE = 1 << 0;
    }
}

/// Metadata of a stored entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StorageInfo {
    /// Byte length of the entry
    pub size: usize,
    pub flags: StorageFlags,
}

/// Storage backend errors
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("uid {0} does not exist")]
    DoesNotExist(Uid),

    #[error("uid {0} is write-once")]
    WriteOnce(Uid),

    #[error("invalid argument")]
    InvalidArgument,

    #[error("insufficient storage")]
    InsufficientStorage,

    /// The physical store failed; not retried.
    #[error("storage failure")]
    StorageFailure,
}

impl StorageError {
    /// Status code reported across the IPC boundary.
    pub fn status(self) -> Status {
        match self {
            StorageError::DoesNotExist(_) => Status::DOES_NOT_EXIST,
            StorageError::WriteOnce(_) => Status::NOT_PERMITTED,
            StorageError::InvalidArgument => Status::INVALID_ARGUMENT,
            StorageError::InsufficientStorage => Status::INSUFFICIENT_STORAGE,
            StorageError::StorageFailure => Status::STORAGE_FAILURE,
        }
    }
}

/// Uid-keyed persistent store.
pub trait TrustedStorage: Send + Sync {
    /// Create or replace the entry `uid`.
    fn set(&self, uid: Uid, data: &[u8], flags: StorageFlags) -> Result<(), StorageError>;

    /// Copy from entry `uid` starting at `offset`. Returns the bytes copied.
    fn get(&self, uid: Uid, offset: usize, buf: &mut [u8]) -> Result<usize, StorageError>;

    fn get_info(&self, uid: Uid) -> Result<StorageInfo, StorageError>;

    fn remove(&self, uid: Uid) -> Result<(), StorageError>;
}

// ============================================================================
// MemoryStorage
// ============================================================================

/// Failures `MemoryStorage` injects into its own operations.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FaultPlan {
    /// `set` fails with `StorageFailure`
    pub fail_set: bool,
    /// `set` reports success but keeps only half the data
    pub truncate_on_set: bool,
    /// `get_info` fails with `StorageFailure`
    pub fail_get_info: bool,
    /// `remove` fails with `StorageFailure`
    pub fail_remove: bool,
    /// `remove` reports success but keeps the entry
    pub ignore_remove: bool,
}

struct Entry {
    data: Vec<u8>,
    flags: StorageFlags,
}

/// In-memory `TrustedStorage` for hosts and tests.
pub struct MemoryStorage {
    entries: Mutex<BTreeMap<Uid, Entry>>,
    /// Total byte budget, if bounded
    capacity: Option<usize>,
    faults: Mutex<FaultPlan>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            capacity: None,
            faults: Mutex::new(FaultPlan::default()),
        }
    }

    /// Storage that refuses to hold more than `bytes` in total.
    pub fn with_capacity(bytes: usize) -> Self {
        Self {
            capacity: Some(bytes),
            ..Self::new()
        }
    }

    /// Replace the active fault plan.
    pub fn inject(&self, plan: FaultPlan) {
        *self.faults.lock() = plan;
    }

    /// Drop every entry, including write-once ones, and clear faults.
    pub fn reset(&self) {
        self.entries.lock().clear();
        *self.faults.lock() = FaultPlan::default();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn used_bytes(entries: &BTreeMap<Uid, Entry>) -> usize {
        entries.values().map(|entry| entry.data.len()).sum()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl TrustedStorage for MemoryStorage {
    fn set(&self, uid: Uid, data: &[u8], flags: StorageFlags) -> Result<(), StorageError> {
        if uid == 0 {
            return Err(StorageError::InvalidArgument);
        }
        let faults = *self.faults.lock();
        if faults.fail_set {
            return Err(StorageError::StorageFailure);
        }

        let mut entries = self.entries.lock();
        let replaced = match entries.get(&uid) {
            Some(entry) if entry.flags.contains(StorageFlags::WRITE_ONCE) => {
                return Err(StorageError::WriteOnce(uid));
            }
            Some(entry) => entry.data.len(),
            None => 0,
        };
        if let Some(capacity) = self.capacity {
            if Self::used_bytes(&entries) - replaced + data.len() > capacity {
                return Err(StorageError::InsufficientStorage);
            }
        }

        let kept = if faults.truncate_on_set {
            &data[..data.len() / 2]
        } else {
            data
        };
        entries.insert(
            uid,
            Entry {
                data: kept.to_vec(),
                flags,
            },
        );
        Ok(())
    }

    fn get(&self, uid: Uid, offset: usize, buf: &mut [u8]) -> Result<usize, StorageError> {
        let entries = self.entries.lock();
        let entry = entries.get(&uid).ok_or(StorageError::DoesNotExist(uid))?;
        if offset > entry.data.len() {
            return Err(StorageError::InvalidArgument);
        }

        let remaining = &entry.data[offset..];
        let count = remaining.len().min(buf.len());
        buf[..count].copy_from_slice(&remaining[..count]);
        Ok(count)
    }

    fn get_info(&self, uid: Uid) -> Result<StorageInfo, StorageError> {
        if self.faults.lock().fail_get_info {
            return Err(StorageError::StorageFailure);
        }
        let entries = self.entries.lock();
        let entry = entries.get(&uid).ok_or(StorageError::DoesNotExist(uid))?;
        Ok(StorageInfo {
            size: entry.data.len(),
            flags: entry.flags,
        })
    }

    fn remove(&self, uid: Uid) -> Result<(), StorageError> {
        let faults = *self.faults.lock();
        if faults.fail_remove {
            return Err(StorageError::StorageFailure);
        }

        let mut entries = self.entries.lock();
        match entries.get(&uid) {
            None => return Err(StorageError::DoesNotExist(uid)),
            Some(entry) if entry.flags.contains(StorageFlags::WRITE_ONCE) => {
                return Err(StorageError::WriteOnce(uid));
            }
            Some(_) => {}
        }
        if !faults.ignore_remove {
            entries.remove(&uid);
        }
        Ok(())
    }
}
