//! Typed region descriptors and access requests.
//!
//! Regions are immutable records populated once at configuration time. The
//! raw register layout lives in `regs`; nothing here depends on it.

use bitflags::bitflags;
use core::fmt;
use serde::{Deserialize, Serialize};

/// Number of equal slices a region is split into for subregion masking.
pub const SUBREGION_COUNT: u32 = 8;

/// Smallest `log2_size` at which subregion masking applies.
pub const SUBREGION_MIN_LOG2: u8 = 3;

/// Largest supported `log2_size` (a 4 GiB region).
pub const MAX_REGION_LOG2: u8 = 32;

bitflags! {
    /// Access rights requested by an access or granted by a region.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct AccessPermission: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

/// Hardware-tagged execution identity of a bus master (0..=15).
///
/// Context 0 is the fully trusted context.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProtectionContext(pub u8);

impl ProtectionContext {
    pub const TRUSTED: ProtectionContext = ProtectionContext(0);

    /// Highest context number a mask can express.
    pub const MAX: u8 = 15;

    pub fn is_trusted(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ProtectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PC{}", self.0)
    }
}

/// Set of protection contexts; bit `n` stands for context `n`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextMask(pub u16);

impl ContextMask {
    pub const NONE: ContextMask = ContextMask(0);
    pub const ALL: ContextMask = ContextMask(u16::MAX);

    /// Mask holding exactly the listed contexts. Numbers above 15 are ignored.
    pub fn from_contexts(contexts: &[u8]) -> Self {
        ContextMask(
            contexts
                .iter()
                .filter(|&&pc| pc <= ProtectionContext::MAX)
                .fold(0, |acc, &pc| acc | (1 << pc)),
        )
    }

    pub fn contains(self, context: ProtectionContext) -> bool {
        context.0 <= ProtectionContext::MAX && self.0 & (1 << context.0) != 0
    }
}

/// One protection-unit region.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectionRegion {
    pub enabled: bool,
    /// Start address
    pub base: u32,
    /// Region covers `2^log2_size` bytes
    pub log2_size: u8,
    /// Bit `n` set disables slice `n` of 8 (only when `log2_size >= 3`)
    #[serde(default)]
    pub subregion_disable: u8,
    /// Rights granted to unprivileged accesses
    #[serde(default)]
    pub user_permission: AccessPermission,
    /// Rights granted to privileged accesses
    #[serde(default)]
    pub privileged_permission: AccessPermission,
    /// Secure-only: non-secure accesses are denied
    #[serde(default)]
    pub secure: bool,
    /// Only consider this region for contexts in `context_mask`
    #[serde(default)]
    pub context_match: bool,
    /// Contexts allowed through this region
    #[serde(default = "all_contexts")]
    pub context_mask: ContextMask,
}

fn all_contexts() -> ContextMask {
    ContextMask::ALL
}

impl ProtectionRegion {
    /// Enabled region with no rights, open to every context.
    pub fn new(base: u32, log2_size: u8) -> Self {
        Self {
            enabled: true,
            base,
            log2_size,
            subregion_disable: 0,
            user_permission: AccessPermission::empty(),
            privileged_permission: AccessPermission::empty(),
            secure: false,
            context_match: false,
            context_mask: ContextMask::ALL,
        }
    }

    pub fn with_user(mut self, permission: AccessPermission) -> Self {
        self.user_permission = permission;
        self
    }

    pub fn with_privileged(mut self, permission: AccessPermission) -> Self {
        self.privileged_permission = permission;
        self
    }

    pub fn with_contexts(mut self, mask: ContextMask) -> Self {
        self.context_mask = mask;
        self
    }

    pub fn matching_context(mut self) -> Self {
        self.context_match = true;
        self
    }

    pub fn secure_only(mut self) -> Self {
        self.secure = true;
        self
    }

    pub fn with_disabled_subregions(mut self, disable: u8) -> Self {
        self.subregion_disable = disable;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn size(&self) -> u64 {
        1u64 << self.log2_size.min(MAX_REGION_LOG2)
    }

    /// Exclusive end address
    pub fn end(&self) -> u64 {
        self.base as u64 + self.size()
    }

    /// Rights for the given privilege level.
    pub fn permission_for(&self, privileged: bool) -> AccessPermission {
        if privileged {
            self.privileged_permission
        } else {
            self.user_permission
        }
    }

    /// Context filter: a matching region is only considered for contexts in
    /// its mask.
    pub fn considers(&self, context: ProtectionContext) -> bool {
        !self.context_match || self.context_mask.contains(context)
    }

    pub fn matches(&self, start: u32, size: u32) -> bool {
        range_matches(start, size, self.base, self.log2_size, self.subregion_disable)
    }
}

/// A memory or peripheral access to be judged.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRequest {
    pub start: u32,
    /// Length in bytes; 0 is treated as a single byte
    pub size: u32,
    pub privileged: bool,
    pub secure: bool,
    pub context: ProtectionContext,
    pub permission: AccessPermission,
}

/// True if `[access_start, access_start + access_size)` intersects the region.
///
/// Regions of at least `2^SUBREGION_MIN_LOG2` bytes are split into eight
/// equal slices; the access must then also intersect a slice whose bit in
/// `subregion_disable` is clear.
pub fn range_matches(
    access_start: u32,
    access_size: u32,
    region_start: u32,
    region_log2_size: u8,
    subregion_disable: u8,
) -> bool {
    let start = access_start as u64;
    let end = start + access_size.max(1) as u64;
    let log2 = region_log2_size.min(MAX_REGION_LOG2);
    let region_start = region_start as u64;
    let region_end = region_start + (1u64 << log2);

    if !intersects(start, end, region_start, region_end) {
        return false;
    }
    if log2 < SUBREGION_MIN_LOG2 || subregion_disable == 0 {
        return true;
    }

    let slice = 1u64 << (log2 - SUBREGION_MIN_LOG2);
    (0..SUBREGION_COUNT).any(|n| {
        let slice_start = region_start + n as u64 * slice;
        subregion_disable & (1 << n) == 0
            && intersects(start, end, slice_start, slice_start + slice)
    })
}

fn intersects(start: u64, end: u64, other_start: u64, other_end: u64) -> bool {
    start < other_end && other_start < end
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_range_matches_basic_intersection() {
        // Region [0x1000, 0x1100)
        assert!(range_matches(0x1050, 0x10, 0x1000, 8, 0));
        assert!(range_matches(0x0FF0, 0x20, 0x1000, 8, 0));
        assert!(range_matches(0x10FF, 0x10, 0x1000, 8, 0));
        assert!(!range_matches(0x1100, 0x10, 0x1000, 8, 0));
        assert!(!range_matches(0x0F00, 0x100, 0x1000, 8, 0));
    }

    #[test]
    fn test_range_matches_zero_size_is_one_byte() {
        assert!(range_matches(0x1000, 0, 0x1000, 8, 0));
        assert!(range_matches(0x10FF, 0, 0x1000, 8, 0));
        assert!(!range_matches(0x1100, 0, 0x1000, 8, 0));
    }

    #[test]
    fn test_range_matches_subregions() {
        // 256-byte region, 32-byte slices; slice 2 = [0x1040, 0x1060) disabled.
        let disable = 1 << 2;
        assert!(!range_matches(0x1040, 0x20, 0x1000, 8, disable));
        assert!(!range_matches(0x1050, 0x04, 0x1000, 8, disable));
        // Straddling into an enabled slice still matches.
        assert!(range_matches(0x1050, 0x20, 0x1000, 8, disable));
        // Everything disabled: no match at all.
        assert!(!range_matches(0x1000, 0x100, 0x1000, 8, 0xFF));
    }

    #[test]
    fn test_small_regions_ignore_subregion_bits() {
        assert!(range_matches(0x1000, 1, 0x1000, 2, 0xFF));
    }

    #[test]
    fn test_full_address_space_region() {
        assert!(range_matches(u32::MAX, 1, 0, 32, 0));
        assert!(range_matches(0xFFFF_FFF0, 0x100, 0xFFFF_FF00, 8, 0));
    }

    #[test]
    fn test_context_mask() {
        let mask = ContextMask::from_contexts(&[1, 3, 16]);
        assert_eq!(mask, ContextMask(0b1010));
        assert!(mask.contains(ProtectionContext(1)));
        assert!(!mask.contains(ProtectionContext(2)));
        assert!(!ContextMask::ALL.contains(ProtectionContext(16)));
    }

    #[test]
    fn test_region_builder() {
        let region = ProtectionRegion::new(0x2000, 12)
            .with_user(AccessPermission::READ)
            .with_privileged(AccessPermission::READ | AccessPermission::WRITE)
            .secure_only();
        assert_eq!(region.end(), 0x3000);
        assert_eq!(region.permission_for(false), AccessPermission::READ);
        assert!(region.permission_for(true).contains(AccessPermission::WRITE));
        assert!(region.secure);
    }

    #[test]
    fn test_region_serde_defaults() {
        let json = r#"{"enabled": true, "base": 4096, "log2_size": 8}"#;
        let region: ProtectionRegion = serde_json::from_str(json).unwrap();
        assert_eq!(region, ProtectionRegion::new(0x1000, 8));
    }

    proptest! {
        #[test]
        fn prop_matches_plain_interval_without_subregions(
            start in 0u32..0x4000,
            size in 0u32..0x400,
            base_slot in 0u32..16,
            log2 in 1u8..10,
        ) {
            let base = base_slot << log2;
            let region_end = base as u64 + (1u64 << log2);
            let access_end = start as u64 + size.max(1) as u64;
            let expected = (start as u64) < region_end && (base as u64) < access_end;
            prop_assert_eq!(range_matches(start, size, base, log2, 0), expected);
        }
    }
}
