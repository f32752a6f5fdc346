//! Partition manifests
//!
//! The SPM is configured from a JSON document describing pool sizes, every
//! secure partition with its services and interrupt lines, and the
//! protection-unit tables.
//!
//! ```json
//! {
//!   "max_channels": 16,
//!   "max_messages": 16,
//!   "partitions": [{
//!     "name": "PLATFORM",
//!     "id": 8,
//!     "services": [
//!       { "name": "LC_GET", "sid": 4096, "signal": 4, "nspe_callable": true }
//!     ],
//!     "irqs": [{ "line_num": 20, "signal": 9 }],
//!     "extern_sids": []
//!   }]
//! }
//! ```
//!
//! Signals are given as bit numbers; bits 0-3 are reserved for the runtime.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

use spm_core::{
    MinorPolicy, PartitionDescriptor, PartitionId, ProtectionConfig, ProtectionConfigError,
    ServiceDescriptor, Sid, MAX_TABLE_CAPACITY,
};
use spm_ipc::signal;

/// Lowest signal bit a manifest may assign.
pub const MIN_SIGNAL_BIT: u8 = signal::FIRST_ASSIGNABLE_BIT as u8;

/// Highest signal bit a manifest may assign.
pub const MAX_SIGNAL_BIT: u8 = 31;

/// Manifest errors
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read manifest: {0}")]
    Io(String),

    #[error("manifest parse error: {0}")]
    Parse(String),

    #[error("{0} must be non-zero")]
    ZeroCapacity(&'static str),

    #[error("{field} of {value} exceeds the limit of {limit}")]
    CapacityTooLarge {
        field: &'static str,
        value: usize,
        limit: usize,
    },

    #[error("manifest declares no partitions")]
    NoPartitions,

    #[error("partition {0} declares neither services nor IRQs")]
    EmptyPartition(String),

    #[error("partition {name} has invalid id {id}")]
    InvalidPartitionId { name: String, id: i32 },

    #[error("partition id {0} declared twice")]
    DuplicatePartitionId(i32),

    #[error("partition name {0} declared twice")]
    DuplicatePartitionName(String),

    #[error("SID {0:#x} declared twice")]
    DuplicateSid(u32),

    #[error("partition {partition}: signal bit {bit} outside 4..=31")]
    SignalOutOfRange { partition: String, bit: u8 },

    #[error("partition {partition}: signal bit {bit} assigned twice")]
    DuplicateSignal { partition: String, bit: u8 },

    #[error("IRQ line {0} routed twice")]
    DuplicateIrqLine(u32),

    #[error("partition {partition}: extern SID {sid:#x} listed twice")]
    DuplicateExternSid { partition: String, sid: u32 },

    #[error("partition {partition}: extern SID {sid:#x} is not declared by any partition")]
    UnknownExternSid { partition: String, sid: u32 },

    #[error("protection tables: {0}")]
    Protection(ProtectionConfigError),
}

/// Top-level SPM configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpmConfig {
    /// Channel handle table capacity
    pub max_channels: usize,
    /// In-flight messages allowed per client partition
    pub max_messages: usize,
    pub partitions: Vec<PartitionManifest>,
    #[serde(default)]
    pub protection: ProtectionConfig,
}

/// One secure partition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionManifest {
    pub name: String,
    pub id: i32,
    #[serde(default)]
    pub services: Vec<ServiceManifest>,
    #[serde(default)]
    pub irqs: Vec<IrqManifest>,
    /// SIDs of services in other partitions this one may connect to
    #[serde(default)]
    pub extern_sids: Vec<u32>,
}

/// One service exposed by a partition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceManifest {
    pub name: String,
    pub sid: u32,
    /// Signal bit number
    pub signal: u8,
    #[serde(default)]
    pub nspe_callable: bool,
    #[serde(default = "default_minor_version")]
    pub minor_version: u32,
    #[serde(default)]
    pub minor_policy: MinorPolicy,
}

/// One interrupt line routed to a partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IrqManifest {
    pub line_num: u32,
    /// Signal bit number
    pub signal: u8,
}

fn default_minor_version() -> u32 {
    1
}

impl SpmConfig {
    /// Parse and validate a JSON manifest.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: SpmConfig =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON manifest file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ConfigError::Io(format!("{}: {}", path.as_ref().display(), e))
        })?;
        Self::from_json(&json)
    }

    /// Check the manifest for consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_channels == 0 {
            return Err(ConfigError::ZeroCapacity("max_channels"));
        }
        if self.max_messages == 0 {
            return Err(ConfigError::ZeroCapacity("max_messages"));
        }
        for (field, value) in [
            ("max_channels", self.max_channels),
            ("max_messages", self.max_messages),
        ] {
            if value > MAX_TABLE_CAPACITY {
                return Err(ConfigError::CapacityTooLarge {
                    field,
                    value,
                    limit: MAX_TABLE_CAPACITY,
                });
            }
        }
        if self.partitions.is_empty() {
            return Err(ConfigError::NoPartitions);
        }

        let mut ids = BTreeSet::new();
        let mut names = BTreeSet::new();
        let mut sids = BTreeSet::new();
        let mut irq_lines = BTreeSet::new();

        for partition in &self.partitions {
            if PartitionId(partition.id).is_non_secure() {
                return Err(ConfigError::InvalidPartitionId {
                    name: partition.name.clone(),
                    id: partition.id,
                });
            }
            if !ids.insert(partition.id) {
                return Err(ConfigError::DuplicatePartitionId(partition.id));
            }
            if !names.insert(partition.name.as_str()) {
                return Err(ConfigError::DuplicatePartitionName(partition.name.clone()));
            }
            if partition.services.is_empty() && partition.irqs.is_empty() {
                return Err(ConfigError::EmptyPartition(partition.name.clone()));
            }

            let mut bits = BTreeSet::new();
            let signal_bits = partition
                .services
                .iter()
                .map(|s| s.signal)
                .chain(partition.irqs.iter().map(|irq| irq.signal));
            for bit in signal_bits {
                if !(MIN_SIGNAL_BIT..=MAX_SIGNAL_BIT).contains(&bit) {
                    return Err(ConfigError::SignalOutOfRange {
                        partition: partition.name.clone(),
                        bit,
                    });
                }
                if !bits.insert(bit) {
                    return Err(ConfigError::DuplicateSignal {
                        partition: partition.name.clone(),
                        bit,
                    });
                }
            }

            for service in &partition.services {
                if !sids.insert(service.sid) {
                    return Err(ConfigError::DuplicateSid(service.sid));
                }
            }
            for irq in &partition.irqs {
                if !irq_lines.insert(irq.line_num) {
                    return Err(ConfigError::DuplicateIrqLine(irq.line_num));
                }
            }
        }

        for partition in &self.partitions {
            let mut seen = BTreeSet::new();
            for &sid in &partition.extern_sids {
                if !seen.insert(sid) {
                    return Err(ConfigError::DuplicateExternSid {
                        partition: partition.name.clone(),
                        sid,
                    });
                }
                if !sids.contains(&sid) {
                    return Err(ConfigError::UnknownExternSid {
                        partition: partition.name.clone(),
                        sid,
                    });
                }
            }
        }

        self.protection.validate().map_err(ConfigError::Protection)
    }

    /// Descriptors to register with the core, in manifest order.
    pub fn descriptors(&self) -> Vec<PartitionDescriptor> {
        self.partitions.iter().map(PartitionManifest::descriptor).collect()
    }

    /// IRQ line routing: `(line, partition, signal mask)`.
    pub fn irq_routes(&self) -> Vec<(u32, PartitionId, u32)> {
        self.partitions
            .iter()
            .flat_map(|p| {
                p.irqs
                    .iter()
                    .map(move |irq| (irq.line_num, PartitionId(p.id), signal::from_bit(irq.signal as u32)))
            })
            .collect()
    }
}

impl PartitionManifest {
    pub fn descriptor(&self) -> PartitionDescriptor {
        PartitionDescriptor {
            id: PartitionId(self.id),
            name: self.name.clone(),
            services: self
                .services
                .iter()
                .map(|s| ServiceDescriptor {
                    sid: Sid(s.sid),
                    signal: signal::from_bit(s.signal as u32),
                    nspe_callable: s.nspe_callable,
                    minor_version: s.minor_version,
                    minor_policy: s.minor_policy,
                })
                .collect(),
            interrupt_signals: self
                .irqs
                .iter()
                .fold(0, |acc, irq| acc | signal::from_bit(irq.signal as u32)),
            extern_sids: self.extern_sids.iter().map(|&sid| Sid(sid)).collect(),
        }
    }
}
