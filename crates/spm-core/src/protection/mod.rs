//! Protection evaluator
//!
//! Answers "would the configured protection units permit this access?" for
//! memory (MPU then SMPU) and peripherals (PPU group, programmable, fixed
//! slave, fixed region). It is a decision oracle for privileged bring-up and
//! diagnostic code checking a mapping before it is committed; the hardware
//! enforces the committed configuration itself.
//!
//! # Evaluation Rules
//!
//! - Within a tier, the highest-index matching region is authoritative
//! - A tier with no matching region has no opinion and does not veto
//! - Tiers are evaluated in a fixed order and the first denial wins
//! - Protection context 0 is fully trusted: context-aware tiers (everything
//!   except the MPU) have no opinion on its accesses
//!
//! # Module Organization
//!
//! - `region` - Typed regions, access requests, `range_matches`
//! - `evaluator` - `evaluate_tier` and verdict types
//! - `regs` - Raw `ADDR0`/`ATT0` register decoding
//! - `bus_master` - Per-master protection attributes

pub mod bus_master;
pub mod evaluator;
pub mod region;
pub mod regs;

use alloc::vec::Vec;
use core::fmt;
use serde::{Deserialize, Serialize};

pub use bus_master::BusMaster;
pub use evaluator::{evaluate_tier, AccessDecision, DenyReason, TierKind, TierVerdict};
pub use region::{
    range_matches, AccessPermission, AccessRequest, ContextMask, ProtectionContext,
    ProtectionRegion, MAX_REGION_LOG2,
};
pub use regs::{RawProtectionTables, RawRegion};

/// Configuration errors
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtectionConfigError {
    /// `log2_size` outside `1..=32`
    RegionSize {
        tier: TierKind,
        index: usize,
        log2_size: u8,
    },
    /// Base address not aligned to the region size
    RegionMisaligned {
        tier: TierKind,
        index: usize,
        base: u32,
    },
    /// Active context not allowed by the master's own mask
    InconsistentBusMaster { master: u8 },
    /// Two bus masters share a number
    DuplicateBusMaster { master: u8 },
}

impl fmt::Display for ProtectionConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtectionConfigError::RegionSize {
                tier,
                index,
                log2_size,
            } => write!(
                f,
                "{} region {}: unsupported size 2^{}",
                tier.name(),
                index,
                log2_size
            ),
            ProtectionConfigError::RegionMisaligned { tier, index, base } => write!(
                f,
                "{} region {}: base {:#x} not aligned to its size",
                tier.name(),
                index,
                base
            ),
            ProtectionConfigError::InconsistentBusMaster { master } => {
                write!(f, "bus master {}: active context not in its mask", master)
            }
            ProtectionConfigError::DuplicateBusMaster { master } => {
                write!(f, "bus master {} declared twice", master)
            }
        }
    }
}

/// Every protection-unit tier plus bus master attributes.
///
/// Populated once at configuration time and read-only afterwards.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectionConfig {
    #[serde(default)]
    pub mpu: Vec<ProtectionRegion>,
    #[serde(default)]
    pub smpu: Vec<ProtectionRegion>,
    #[serde(default)]
    pub ppu_group: Vec<ProtectionRegion>,
    #[serde(default)]
    pub ppu_programmable: Vec<ProtectionRegion>,
    /// Fixed-slave regions flattened in (group, slave) ascending order
    #[serde(default)]
    pub ppu_fixed_slave: Vec<ProtectionRegion>,
    #[serde(default)]
    pub ppu_fixed_region: Vec<ProtectionRegion>,
    #[serde(default)]
    pub bus_masters: Vec<BusMaster>,
}

impl ProtectionConfig {
    /// Check region geometry and bus master consistency.
    pub fn validate(&self) -> Result<(), ProtectionConfigError> {
        for kind in TierKind::MEMORY.iter().chain(TierKind::PERIPHERAL.iter()) {
            for (index, region) in self.tier(*kind).iter().enumerate() {
                if region.log2_size == 0 || region.log2_size > MAX_REGION_LOG2 {
                    return Err(ProtectionConfigError::RegionSize {
                        tier: *kind,
                        index,
                        log2_size: region.log2_size,
                    });
                }
                if region.base as u64 % region.size() != 0 {
                    return Err(ProtectionConfigError::RegionMisaligned {
                        tier: *kind,
                        index,
                        base: region.base,
                    });
                }
            }
        }

        for (i, master) in self.bus_masters.iter().enumerate() {
            if !master.is_consistent() {
                return Err(ProtectionConfigError::InconsistentBusMaster { master: master.id });
            }
            if self.bus_masters[..i].iter().any(|m| m.id == master.id) {
                return Err(ProtectionConfigError::DuplicateBusMaster { master: master.id });
            }
        }
        Ok(())
    }

    /// Regions of one tier.
    pub fn tier(&self, kind: TierKind) -> &[ProtectionRegion] {
        match kind {
            TierKind::Mpu => &self.mpu,
            TierKind::Smpu => &self.smpu,
            TierKind::PpuGroup => &self.ppu_group,
            TierKind::PpuProgrammable => &self.ppu_programmable,
            TierKind::PpuFixedSlave => &self.ppu_fixed_slave,
            TierKind::PpuFixedRegion => &self.ppu_fixed_region,
        }
    }

    /// Evaluate one tier, applying the trusted-context bypass.
    pub fn evaluate(&self, kind: TierKind, access: &AccessRequest) -> TierVerdict {
        if kind.is_context_aware() && access.context.is_trusted() {
            return TierVerdict::NoOpinion;
        }
        evaluate_tier(access, self.tier(kind), kind.is_context_aware())
    }

    /// MPU then SMPU; the first denial decides.
    pub fn memory_decision(&self, access: &AccessRequest) -> AccessDecision {
        self.decide(&TierKind::MEMORY, access)
    }

    /// Group, programmable, fixed-slave, fixed-region; the first denial decides.
    pub fn peripheral_decision(&self, access: &AccessRequest) -> AccessDecision {
        self.decide(&TierKind::PERIPHERAL, access)
    }

    pub fn is_memory_access_allowed(&self, access: &AccessRequest) -> bool {
        self.memory_decision(access).is_allowed()
    }

    pub fn is_peripheral_access_allowed(&self, access: &AccessRequest) -> bool {
        self.peripheral_decision(access).is_allowed()
    }

    pub fn bus_master(&self, id: u8) -> Option<&BusMaster> {
        self.bus_masters.iter().find(|m| m.id == id)
    }

    fn decide(&self, tiers: &[TierKind], access: &AccessRequest) -> AccessDecision {
        for &kind in tiers {
            if let TierVerdict::Denied { region, reason } = self.evaluate(kind, access) {
                return AccessDecision::Denied {
                    tier: kind,
                    region,
                    reason,
                };
            }
        }
        AccessDecision::Allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    const RW: AccessPermission = AccessPermission::READ.union(AccessPermission::WRITE);

    fn request(context: u8, privileged: bool, permission: AccessPermission) -> AccessRequest {
        AccessRequest {
            start: 0x1050,
            size: 0x10,
            privileged,
            secure: true,
            context: ProtectionContext(context),
            permission,
        }
    }

    fn open_mpu() -> ProtectionRegion {
        ProtectionRegion::new(0, 32)
            .with_user(AccessPermission::all())
            .with_privileged(AccessPermission::all())
    }

    fn scenario_region() -> ProtectionRegion {
        ProtectionRegion::new(0x1000, 8)
            .with_user(AccessPermission::READ)
            .with_privileged(RW)
            .with_contexts(ContextMask::from_contexts(&[1]))
    }

    #[test]
    fn test_memory_scenario_through_smpu() {
        let config = ProtectionConfig {
            mpu: vec![open_mpu()],
            smpu: vec![scenario_region()],
            ..Default::default()
        };

        assert!(config.is_memory_access_allowed(&request(1, true, RW)));
        assert_eq!(
            config.memory_decision(&request(2, true, RW)),
            AccessDecision::Denied {
                tier: TierKind::Smpu,
                region: 0,
                reason: DenyReason::ContextMismatch
            }
        );
        assert_eq!(
            config.memory_decision(&request(1, false, AccessPermission::WRITE)),
            AccessDecision::Denied {
                tier: TierKind::Smpu,
                region: 0,
                reason: DenyReason::PermissionMismatch
            }
        );
    }

    #[test]
    fn test_mpu_denial_short_circuits() {
        let config = ProtectionConfig {
            mpu: vec![ProtectionRegion::new(0x1000, 8).with_privileged(AccessPermission::READ)],
            smpu: vec![scenario_region()],
            ..Default::default()
        };
        assert!(matches!(
            config.memory_decision(&request(1, true, RW)),
            AccessDecision::Denied {
                tier: TierKind::Mpu,
                ..
            }
        ));
    }

    #[test]
    fn test_trusted_context_bypasses_context_aware_tiers() {
        let config = ProtectionConfig {
            mpu: vec![open_mpu()],
            smpu: vec![ProtectionRegion::new(0x1000, 8)],
            ppu_group: vec![ProtectionRegion::new(0x1000, 8)],
            ..Default::default()
        };
        assert!(config.is_memory_access_allowed(&request(0, false, RW)));
        assert!(config.is_peripheral_access_allowed(&request(0, false, RW)));
        assert!(!config.is_memory_access_allowed(&request(1, false, RW)));

        // The MPU still applies to context 0.
        let config = ProtectionConfig {
            mpu: vec![ProtectionRegion::new(0x1000, 8)],
            ..Default::default()
        };
        assert!(!config.is_memory_access_allowed(&request(0, true, AccessPermission::READ)));
    }

    #[test]
    fn test_empty_config_allows_everything() {
        let config = ProtectionConfig::default();
        assert!(config.is_memory_access_allowed(&request(3, false, AccessPermission::all())));
        assert!(config.is_peripheral_access_allowed(&request(3, false, AccessPermission::all())));
    }

    #[test]
    fn test_peripheral_tier_order() {
        let allow = ProtectionRegion::new(0x1000, 8).with_user(RW).with_privileged(RW);
        let deny = ProtectionRegion::new(0x1000, 8);

        let config = ProtectionConfig {
            ppu_group: vec![allow],
            ppu_programmable: vec![deny],
            ppu_fixed_slave: vec![deny],
            ..Default::default()
        };
        assert!(matches!(
            config.peripheral_decision(&request(2, false, AccessPermission::READ)),
            AccessDecision::Denied {
                tier: TierKind::PpuProgrammable,
                ..
            }
        ));

        let config = ProtectionConfig {
            ppu_group: vec![allow],
            ppu_programmable: vec![allow],
            ppu_fixed_slave: vec![allow],
            ppu_fixed_region: vec![deny],
            ..Default::default()
        };
        assert!(matches!(
            config.peripheral_decision(&request(2, false, AccessPermission::READ)),
            AccessDecision::Denied {
                tier: TierKind::PpuFixedRegion,
                ..
            }
        ));
    }

    #[test]
    fn test_bus_master_request() {
        let config = ProtectionConfig {
            mpu: vec![open_mpu()],
            smpu: vec![scenario_region()],
            bus_masters: vec![BusMaster {
                id: 1,
                name: "cm4".into(),
                privileged: false,
                secure: true,
                context_mask: ContextMask::from_contexts(&[1, 2]),
                active_context: ProtectionContext(1),
            }],
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        let master = config.bus_master(1).unwrap();
        assert!(config.is_memory_access_allowed(&master.request(0x1050, 4, AccessPermission::READ)));
        assert!(!config.is_memory_access_allowed(&master.request(0x1050, 4, AccessPermission::WRITE)));
        assert!(config.bus_master(9).is_none());
    }

    #[test]
    fn test_validate_rejects_bad_geometry() {
        let config = ProtectionConfig {
            smpu: vec![ProtectionRegion::new(0x1080, 8)],
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ProtectionConfigError::RegionMisaligned {
                tier: TierKind::Smpu,
                index: 0,
                base: 0x1080
            })
        );

        let config = ProtectionConfig {
            mpu: vec![ProtectionRegion::new(0, 0)],
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ProtectionConfigError::RegionSize { log2_size: 0, .. })
        ));
    }

    #[test]
    fn test_validate_rejects_bad_bus_masters() {
        let master = BusMaster {
            id: 3,
            name: "dma".into(),
            privileged: true,
            secure: false,
            context_mask: ContextMask::from_contexts(&[2]),
            active_context: ProtectionContext(2),
        };
        let mut config = ProtectionConfig {
            bus_masters: vec![master.clone(), master.clone()],
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ProtectionConfigError::DuplicateBusMaster { master: 3 })
        );

        config.bus_masters = vec![BusMaster {
            active_context: ProtectionContext(4),
            ..master
        }];
        assert_eq!(
            config.validate(),
            Err(ProtectionConfigError::InconsistentBusMaster { master: 3 })
        );
    }

    #[test]
    fn test_config_from_json() {
        let json = r#"{
            "smpu": [{
                "enabled": true,
                "base": 4096,
                "log2_size": 8,
                "user_permission": "READ",
                "privileged_permission": "READ | WRITE",
                "context_mask": 2
            }]
        }"#;
        let config: ProtectionConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.smpu, vec![scenario_region()]);
        assert!(config.validate().is_ok());
    }
}
