//! Handle table
//!
//! Opaque, generation-tagged names for kernel objects (channels, in-flight
//! messages). Partitions only ever hold a `Handle`; the table owns the object
//! until `destroy` hands it back.
//!
//! # Handle Layout
//!
//! ```text
//!  31                         12 11            0
//! ┌──────────────────────────────┬──────────────┐
//! │          generation          │  slot index  │
//! └──────────────────────────────┴──────────────┘
//! ```
//!
//! The generation comes from a per-table counter that starts at 1, increases
//! on every `create`, and skips 0 when it wraps. Because the slot index is
//! part of the value, two live handles can never be equal even after the
//! counter wraps, and a handle of `0` is never issued (`Handle::NULL`).
//!
//! # Access Policy
//!
//! Access is enforced **inside the table**: `resolve` succeeds only for the
//! entry's owner or its friend, `destroy` only for the owner. Every user of
//! the table goes through these checks; there is no unchecked lookup.
//!
//! Allocation is first-fit: `create` takes the lowest free slot.

use alloc::vec::Vec;
use core::fmt;
use serde::{Deserialize, Serialize};
use spm_ipc::Status;

use crate::types::PartitionId;

/// Number of low bits holding the slot index.
const INDEX_BITS: u32 = 12;

const INDEX_MASK: u32 = (1 << INDEX_BITS) - 1;

/// Largest generation value before the counter wraps back to 1.
const GENERATION_MAX: u32 = u32::MAX >> INDEX_BITS;

/// Largest capacity a single table can address.
pub const MAX_TABLE_CAPACITY: usize = 1 << INDEX_BITS;

/// Opaque handle naming a kernel object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Handle(u32);

impl Handle {
    /// Reserved "no object" value. Never returned by `create`.
    pub const NULL: Handle = Handle(0);

    /// Rebuild a handle from its raw value (e.g. received over IPC).
    pub const fn from_raw(raw: u32) -> Self {
        Handle(raw)
    }

    /// Raw value
    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    fn index(self) -> usize {
        (self.0 & INDEX_MASK) as usize
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Handle table errors
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandleError {
    /// Every slot holds a live entry
    CapacityExhausted,
    /// No live entry carries this handle
    InvalidHandle,
    /// Requester is not allowed to perform this operation on the entry
    AccessDenied,
}

impl HandleError {
    /// Status code reported to a client for this error.
    pub fn status(self) -> Status {
        match self {
            HandleError::CapacityExhausted => Status::INSUFFICIENT_MEMORY,
            HandleError::InvalidHandle => Status::INVALID_HANDLE,
            HandleError::AccessDenied => Status::NOT_PERMITTED,
        }
    }
}

impl fmt::Display for HandleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandleError::CapacityExhausted => write!(f, "handle table capacity exhausted"),
            HandleError::InvalidHandle => write!(f, "invalid handle"),
            HandleError::AccessDenied => write!(f, "access denied"),
        }
    }
}

/// One live entry of a handle table.
#[derive(Debug)]
pub struct HandleEntry<T> {
    handle: Handle,
    owner: PartitionId,
    friend: Option<PartitionId>,
    value: T,
}

impl<T> HandleEntry<T> {
    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// Partition that created the entry; the only one allowed to destroy it.
    pub fn owner(&self) -> PartitionId {
        self.owner
    }

    /// Second partition allowed to resolve (never destroy) the entry.
    pub fn friend(&self) -> Option<PartitionId> {
        self.friend
    }

    pub(crate) fn value(&self) -> &T {
        &self.value
    }

    fn may_resolve(&self, requester: PartitionId) -> bool {
        requester == self.owner || Some(requester) == self.friend
    }
}

/// Fixed-capacity arena of owned objects named by generation-tagged handles.
#[derive(Debug)]
pub struct HandleTable<T> {
    slots: Vec<Option<HandleEntry<T>>>,
    generator: u32,
    live: usize,
}

impl<T> HandleTable<T> {
    /// Create a table with every slot free.
    ///
    /// `capacity` is clamped to `MAX_TABLE_CAPACITY`.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.min(MAX_TABLE_CAPACITY);
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            generator: 1,
            live: 0,
        }
    }

    /// Store `value` in the lowest free slot and return its new handle.
    pub fn create(
        &mut self,
        value: T,
        owner: PartitionId,
        friend: Option<PartitionId>,
    ) -> Result<Handle, HandleError> {
        let index = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(HandleError::CapacityExhausted)?;

        let generation = self.next_generation();
        let handle = Handle((generation << INDEX_BITS) | index as u32);
        self.slots[index] = Some(HandleEntry {
            handle,
            owner,
            friend,
            value,
        });
        self.live += 1;
        Ok(handle)
    }

    /// Look up the object named by `handle` on behalf of `requester`.
    pub fn resolve(&self, handle: Handle, requester: PartitionId) -> Result<&T, HandleError> {
        let entry = self.entry(handle)?;
        if !entry.may_resolve(requester) {
            return Err(HandleError::AccessDenied);
        }
        Ok(&entry.value)
    }

    /// Mutable variant of `resolve`.
    pub fn resolve_mut(
        &mut self,
        handle: Handle,
        requester: PartitionId,
    ) -> Result<&mut T, HandleError> {
        let entry = self
            .slots
            .get_mut(handle.index())
            .and_then(Option::as_mut)
            .filter(|entry| !handle.is_null() && entry.handle == handle)
            .ok_or(HandleError::InvalidHandle)?;
        if !entry.may_resolve(requester) {
            return Err(HandleError::AccessDenied);
        }
        Ok(&mut entry.value)
    }

    /// Free the slot named by `handle` and hand the object back.
    ///
    /// Only the owner may destroy; the friend gets `AccessDenied`.
    pub fn destroy(&mut self, handle: Handle, requester: PartitionId) -> Result<T, HandleError> {
        if self.entry(handle)?.owner != requester {
            return Err(HandleError::AccessDenied);
        }
        let entry = self.slots[handle.index()]
            .take()
            .ok_or(HandleError::InvalidHandle)?;
        self.live -= 1;
        Ok(entry.value)
    }

    /// True if `handle` names a live entry.
    pub fn contains(&self, handle: Handle) -> bool {
        self.entry(handle).is_ok()
    }

    /// Owner of the entry named by `handle`.
    pub fn owner(&self, handle: Handle) -> Result<PartitionId, HandleError> {
        self.entry(handle).map(HandleEntry::owner)
    }

    /// Friend of the entry named by `handle`.
    pub fn friend(&self, handle: Handle) -> Result<Option<PartitionId>, HandleError> {
        self.entry(handle).map(HandleEntry::friend)
    }

    /// Live entries in slot order.
    pub fn iter(&self) -> impl Iterator<Item = &HandleEntry<T>> {
        self.slots.iter().filter_map(Option::as_ref)
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn is_full(&self) -> bool {
        self.live == self.slots.len()
    }

    fn entry(&self, handle: Handle) -> Result<&HandleEntry<T>, HandleError> {
        if handle.is_null() {
            return Err(HandleError::InvalidHandle);
        }
        self.slots
            .get(handle.index())
            .and_then(Option::as_ref)
            .filter(|entry| entry.handle == handle)
            .ok_or(HandleError::InvalidHandle)
    }

    fn next_generation(&mut self) -> u32 {
        let generation = self.generator;
        self.generator = if generation >= GENERATION_MAX {
            1
        } else {
            generation + 1
        };
        generation
    }
}
