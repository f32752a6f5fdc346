//! Register adapter
//!
//! Decodes raw `ADDR0`/`ATT0` register pairs, as dumped from PSoC6-style
//! protection units, into typed `ProtectionRegion`s.
//!
//! # ADDR0
//!
//! | Bits  | Field                 |
//! |-------|-----------------------|
//! | 0-7   | Subregion disable     |
//! | 8-31  | Base address [31:8]   |
//!
//! # ATT0
//!
//! | Bits  | Field                                          |
//! |-------|------------------------------------------------|
//! | 0-2   | User read / write / execute                    |
//! | 3-5   | Privileged read / write / execute              |
//! | 6     | Non-secure (clear = secure-only)               |
//! | 8-23  | Protection context mask (bit 8 = PC0)          |
//! | 24-28 | Region size `n`, region covers `2^(n+1)` bytes |
//! | 30    | Protection context match                       |
//! | 31    | Enabled                                        |
//!
//! The MPU tier has no protection-context fields; they decode as "any
//! context".

use alloc::vec::Vec;
use serde::{Deserialize, Serialize};

use super::evaluator::TierKind;
use super::region::{AccessPermission, ContextMask, ProtectionRegion};
use super::ProtectionConfig;

const ADDR_SUBREGION_MASK: u32 = 0xFF;
const ADDR_BASE_MASK: u32 = 0xFFFF_FF00;

const ATT_USER_SHIFT: u32 = 0;
const ATT_PRIV_SHIFT: u32 = 3;
const ATT_PERM_MASK: u32 = 0b111;
const ATT_NS: u32 = 1 << 6;
const ATT_PC_MASK_SHIFT: u32 = 8;
const ATT_PC_MASK_MASK: u32 = 0xFFFF;
const ATT_REGION_SIZE_SHIFT: u32 = 24;
const ATT_REGION_SIZE_MASK: u32 = 0x1F;
const ATT_PC_MATCH: u32 = 1 << 30;
const ATT_ENABLED: u32 = 1 << 31;

/// One raw register pair.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRegion {
    pub addr: u32,
    pub att: u32,
}

/// Raw register dumps of every tier.
///
/// `ppu_fixed_slave` keeps the hardware's nesting: one list of slave regions
/// per group.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawProtectionTables {
    #[serde(default)]
    pub mpu: Vec<RawRegion>,
    #[serde(default)]
    pub smpu: Vec<RawRegion>,
    #[serde(default)]
    pub ppu_group: Vec<RawRegion>,
    #[serde(default)]
    pub ppu_programmable: Vec<RawRegion>,
    #[serde(default)]
    pub ppu_fixed_slave: Vec<Vec<RawRegion>>,
    #[serde(default)]
    pub ppu_fixed_region: Vec<RawRegion>,
}

impl RawProtectionTables {
    /// Decode every tier into typed regions. Bus masters are left empty.
    pub fn decode(&self) -> ProtectionConfig {
        ProtectionConfig {
            mpu: decode_tier(&self.mpu, TierKind::Mpu),
            smpu: decode_tier(&self.smpu, TierKind::Smpu),
            ppu_group: decode_tier(&self.ppu_group, TierKind::PpuGroup),
            ppu_programmable: decode_tier(&self.ppu_programmable, TierKind::PpuProgrammable),
            ppu_fixed_slave: flatten_fixed_slaves(&self.ppu_fixed_slave),
            ppu_fixed_region: decode_tier(&self.ppu_fixed_region, TierKind::PpuFixedRegion),
            bus_masters: Vec::new(),
        }
    }
}

/// Decode one register pair.
pub fn decode_region(raw: RawRegion, context_aware: bool) -> ProtectionRegion {
    let att = raw.att;
    let size_field = (att >> ATT_REGION_SIZE_SHIFT) & ATT_REGION_SIZE_MASK;

    let (context_match, context_mask) = if context_aware {
        (
            att & ATT_PC_MATCH != 0,
            ContextMask(((att >> ATT_PC_MASK_SHIFT) & ATT_PC_MASK_MASK) as u16),
        )
    } else {
        (false, ContextMask::ALL)
    };

    ProtectionRegion {
        enabled: att & ATT_ENABLED != 0,
        base: raw.addr & ADDR_BASE_MASK,
        log2_size: size_field as u8 + 1,
        subregion_disable: (raw.addr & ADDR_SUBREGION_MASK) as u8,
        user_permission: permission_bits(att >> ATT_USER_SHIFT),
        privileged_permission: permission_bits(att >> ATT_PRIV_SHIFT),
        secure: att & ATT_NS == 0,
        context_match,
        context_mask,
    }
}

/// Encode a region back into its register pair.
///
/// Base bits below 8 and a zero `log2_size` cannot be expressed and are
/// dropped.
pub fn encode_region(region: &ProtectionRegion, context_aware: bool) -> RawRegion {
    let mut att = (region.user_permission.bits() as u32) << ATT_USER_SHIFT
        | (region.privileged_permission.bits() as u32) << ATT_PRIV_SHIFT
        | ((region.log2_size.saturating_sub(1) as u32) & ATT_REGION_SIZE_MASK)
            << ATT_REGION_SIZE_SHIFT;
    if !region.secure {
        att |= ATT_NS;
    }
    if region.enabled {
        att |= ATT_ENABLED;
    }
    if context_aware {
        att |= (region.context_mask.0 as u32) << ATT_PC_MASK_SHIFT;
        if region.context_match {
            att |= ATT_PC_MATCH;
        }
    }

    RawRegion {
        addr: (region.base & ADDR_BASE_MASK) | region.subregion_disable as u32,
        att,
    }
}

/// Decode a whole tier, preserving priority order.
pub fn decode_tier(raw: &[RawRegion], kind: TierKind) -> Vec<ProtectionRegion> {
    raw.iter()
        .map(|&r| decode_region(r, kind.is_context_aware()))
        .collect()
}

/// Flatten the nested fixed-slave layout into one priority-ordered tier.
///
/// Groups and slaves are laid out in ascending order, so the evaluator's
/// highest-index-first scan visits the last group's last slave first.
pub fn flatten_fixed_slaves(groups: &[Vec<RawRegion>]) -> Vec<ProtectionRegion> {
    groups
        .iter()
        .flat_map(|slaves| slaves.iter())
        .map(|&r| decode_region(r, TierKind::PpuFixedSlave.is_context_aware()))
        .collect()
}

fn permission_bits(value: u32) -> AccessPermission {
    AccessPermission::from_bits_truncate((value & ATT_PERM_MASK) as u8)
}
