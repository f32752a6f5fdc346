//! Bus master protection attributes.

use alloc::string::String;
use serde::{Deserialize, Serialize};

use super::region::{AccessPermission, AccessRequest, ContextMask, ProtectionContext};

/// Protection attributes of one bus master (CPU core, DMA engine, ...).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusMaster {
    /// Master number
    pub id: u8,
    /// Name (diagnostics only)
    #[serde(default)]
    pub name: String,
    /// Accesses are issued as privileged
    pub privileged: bool,
    /// Accesses are issued as secure
    pub secure: bool,
    /// Contexts this master may switch to
    pub context_mask: ContextMask,
    /// Context the master currently runs in
    pub active_context: ProtectionContext,
}

impl BusMaster {
    /// True if the active context is within range and allowed by the mask.
    pub fn is_consistent(&self) -> bool {
        self.context_mask.contains(self.active_context)
    }

    /// Access request for this master in its active context.
    pub fn request(&self, start: u32, size: u32, permission: AccessPermission) -> AccessRequest {
        AccessRequest {
            start,
            size,
            privileged: self.privileged,
            secure: self.secure,
            context: self.active_context,
            permission,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn master(active: u8) -> BusMaster {
        BusMaster {
            id: 0,
            name: "cm0p".into(),
            privileged: true,
            secure: true,
            context_mask: ContextMask::from_contexts(&[0, 1]),
            active_context: ProtectionContext(active),
        }
    }

    #[test]
    fn test_consistency() {
        assert!(master(1).is_consistent());
        assert!(!master(2).is_consistent());
        assert!(!master(16).is_consistent());
    }

    #[test]
    fn test_request_carries_master_attributes() {
        let request = master(1).request(0x1000, 4, AccessPermission::READ);
        assert!(request.privileged);
        assert!(request.secure);
        assert_eq!(request.context, ProtectionContext(1));
        assert_eq!(request.permission, AccessPermission::READ);
    }
}
