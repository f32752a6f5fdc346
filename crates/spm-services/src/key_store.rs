//! Persistent key slots over trusted storage.
//!
//! Each key id maps directly to a storage uid. A slot is either absent or
//! holds exactly the bytes that were stored: a write that cannot be
//! verified is rolled back.

use spm_core::Status;

use crate::storage::{StorageError, StorageFlags, TrustedStorage, Uid};

/// Persistent key identifier
pub type KeyId = u32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum KeyStoreError {
    #[error("key slot {0} is occupied")]
    Occupied(KeyId),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl KeyStoreError {
    pub fn status(self) -> Status {
        match self {
            KeyStoreError::Occupied(_) => Status::OCCUPIED_SLOT,
            KeyStoreError::Storage(err) => err.status(),
        }
    }
}

fn uid_of(key: KeyId) -> Uid {
    Uid::from(key)
}

/// Key slot helpers bound to one storage backend.
pub struct KeyStore<S: TrustedStorage> {
    storage: S,
}

impl<S: TrustedStorage> KeyStore<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Read the whole key material of `key`.
    pub fn load(&self, key: KeyId) -> Result<Vec<u8>, KeyStoreError> {
        let uid = uid_of(key);
        let info = self.storage.get_info(uid)?;

        let mut data = vec![0u8; info.size];
        let count = self.storage.get(uid, 0, &mut data)?;
        data.truncate(count);
        Ok(data)
    }

    /// True unless the backend positively reports the key as absent.
    pub fn is_present(&self, key: KeyId) -> bool {
        !matches!(
            self.storage.get_info(uid_of(key)),
            Err(StorageError::DoesNotExist(_))
        )
    }

    /// Persist `data` in an empty slot.
    ///
    /// The write is read back through `get_info`; if that fails or the
    /// stored size differs, the entry is removed again.
    pub fn store(&self, key: KeyId, data: &[u8]) -> Result<(), KeyStoreError> {
        if self.is_present(key) {
            return Err(KeyStoreError::Occupied(key));
        }

        let uid = uid_of(key);
        self.storage
            .set(uid, data, StorageFlags::empty())
            .map_err(|_| StorageError::StorageFailure)?;

        let verified = match self.storage.get_info(uid) {
            Ok(info) if info.size == data.len() => Ok(()),
            Ok(_) => Err(StorageError::StorageFailure),
            Err(err) => Err(err),
        };
        if verified.is_err() {
            let _ = self.storage.remove(uid);
        }
        verified.map_err(KeyStoreError::from)
    }

    /// Remove `key`. Destroying an absent key succeeds.
    pub fn destroy(&self, key: KeyId) -> Result<(), KeyStoreError> {
        let uid = uid_of(key);
        if let Err(StorageError::DoesNotExist(_)) = self.storage.get_info(uid) {
            return Ok(());
        }

        self.storage
            .remove(uid)
            .map_err(|_| StorageError::StorageFailure)?;

        match self.storage.get_info(uid) {
            Err(StorageError::DoesNotExist(_)) => Ok(()),
            _ => Err(StorageError::StorageFailure.into()),
        }
    }

    /// Byte length of the stored key material.
    pub fn data_length(&self, key: KeyId) -> Result<usize, KeyStoreError> {
        Ok(self.storage.get_info(uid_of(key))?.size)
    }
}
