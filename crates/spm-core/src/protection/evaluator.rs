//! Per-tier access evaluation.

use core::fmt;
use serde::{Deserialize, Serialize};

use super::region::{AccessRequest, ProtectionRegion};

/// Protection-unit tier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TierKind {
    /// Coarse memory protection (no protection contexts)
    Mpu,
    /// Fine-grained, context-aware memory protection
    Smpu,
    /// Peripheral group tier
    PpuGroup,
    /// Programmable peripheral regions
    PpuProgrammable,
    /// Fixed per-slave peripheral regions
    PpuFixedSlave,
    /// Fixed peripheral regions
    PpuFixedRegion,
}

impl TierKind {
    /// Memory tiers, in evaluation order.
    pub const MEMORY: [TierKind; 2] = [TierKind::Mpu, TierKind::Smpu];

    /// Peripheral tiers, in evaluation order.
    pub const PERIPHERAL: [TierKind; 4] = [
        TierKind::PpuGroup,
        TierKind::PpuProgrammable,
        TierKind::PpuFixedSlave,
        TierKind::PpuFixedRegion,
    ];

    /// Whether regions in this tier carry protection-context fields.
    pub fn is_context_aware(self) -> bool {
        !matches!(self, TierKind::Mpu)
    }

    pub fn name(self) -> &'static str {
        match self {
            TierKind::Mpu => "MPU",
            TierKind::Smpu => "SMPU",
            TierKind::PpuGroup => "PPU group",
            TierKind::PpuProgrammable => "PPU programmable",
            TierKind::PpuFixedSlave => "PPU fixed slave",
            TierKind::PpuFixedRegion => "PPU fixed region",
        }
    }
}

/// Why a matching region denied an access.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DenyReason {
    /// Access context is not in the region's context mask
    ContextMismatch,
    /// Non-secure access to a secure-only region
    SecureOnly,
    /// Requested rights exceed the region's rights for this privilege level
    PermissionMismatch,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::ContextMismatch => write!(f, "protection context not allowed"),
            DenyReason::SecureOnly => write!(f, "non-secure access to secure region"),
            DenyReason::PermissionMismatch => write!(f, "permission not granted"),
        }
    }
}

/// Outcome of evaluating one tier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TierVerdict {
    /// No region matched; the tier does not veto
    NoOpinion,
    /// Region `region` matched and allows the access
    Allowed { region: usize },
    /// Region `region` matched and denies the access
    Denied { region: usize, reason: DenyReason },
}

impl TierVerdict {
    pub fn is_allowed(self) -> bool {
        !matches!(self, TierVerdict::Denied { .. })
    }

    /// True if some region was authoritative.
    pub fn matched(self) -> bool {
        !matches!(self, TierVerdict::NoOpinion)
    }
}

/// Final decision over a sequence of tiers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessDecision {
    Allowed,
    Denied {
        tier: TierKind,
        region: usize,
        reason: DenyReason,
    },
}

impl AccessDecision {
    pub fn is_allowed(self) -> bool {
        matches!(self, AccessDecision::Allowed)
    }
}

impl fmt::Display for AccessDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessDecision::Allowed => write!(f, "allowed"),
            AccessDecision::Denied {
                tier,
                region,
                reason,
            } => write!(f, "denied by {} region {}: {}", tier.name(), region, reason),
        }
    }
}

/// Evaluate one tier.
///
/// Regions are scanned from the highest index down. The first enabled region
/// whose context filter accepts the access and whose range matches decides:
/// it denies on a context mask miss, a non-secure access to a secure-only
/// region, or rights that are not a subset of its privilege-selected rights.
/// With `context_aware` false the context fields are ignored.
pub fn evaluate_tier(
    access: &AccessRequest,
    regions: &[ProtectionRegion],
    context_aware: bool,
) -> TierVerdict {
    let matched = regions.iter().enumerate().rev().find(|(_, region)| {
        region.enabled
            && (!context_aware || region.considers(access.context))
            && region.matches(access.start, access.size)
    });

    let Some((index, region)) = matched else {
        return TierVerdict::NoOpinion;
    };

    let reason = if context_aware && !region.context_mask.contains(access.context) {
        Some(DenyReason::ContextMismatch)
    } else if region.secure && !access.secure {
        Some(DenyReason::SecureOnly)
    } else if !region
        .permission_for(access.privileged)
        .contains(access.permission)
    {
        Some(DenyReason::PermissionMismatch)
    } else {
        None
    };

    match reason {
        Some(reason) => TierVerdict::Denied {
            region: index,
            reason,
        },
        None => TierVerdict::Allowed { region: index },
    }
}
