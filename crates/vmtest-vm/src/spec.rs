//! VM specification types.

use crate::error::{Result, VmError};
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// Guest firmware boot mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BootType {
    /// UEFI boot through a pflash firmware loader.
    Efi,
    /// Legacy BIOS boot.
    Legacy,
}

impl fmt::Display for BootType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Efi => write!(f, "efi"),
            Self::Legacy => write!(f, "legacy"),
        }
    }
}

/// Guest CPU architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub enum Architecture {
    /// 64-bit x86.
    #[serde(rename = "x86_64")]
    X86_64,
    /// 64-bit Arm.
    #[serde(rename = "aarch64")]
    Aarch64,
}

impl Architecture {
    /// Architecture of the machine the harness is running on, when it is
    /// one the harness supports.
    pub fn host() -> Option<Self> {
        match std::env::consts::ARCH {
            "x86_64" => Some(Self::X86_64),
            "aarch64" => Some(Self::Aarch64),
            _ => None,
        }
    }

    /// The wire name used in domain descriptors and firmware targets.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::X86_64 => "x86_64",
            Self::Aarch64 => "aarch64",
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Specification of one ephemeral test VM.
///
/// Immutable once constructed; the caller owns it until it is handed to the
/// lifecycle manager. The disk image behind `disk_image_path` is exclusively
/// owned by one VM at a time; the harness does no locking beyond that
/// convention.
#[derive(Debug, Clone)]
pub struct VmSpec {
    /// Domain name, unique within the test run.
    pub name: String,
    /// Guest memory in MiB.
    pub memory_mib: u32,
    /// Number of virtual CPUs.
    pub vcpu_count: u32,
    /// Path to the OS image the VM boots from.
    pub disk_image_path: PathBuf,
    /// Firmware boot mode.
    pub boot_type: BootType,
    /// Whether to request secure-boot firmware with enrolled keys.
    pub secure_boot: bool,
    /// Guest CPU architecture.
    pub architecture: Architecture,
}

impl VmSpec {
    /// Validate the spec before it is turned into a domain descriptor.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(VmError::Configuration("VM name must not be empty".into()));
        }
        if self.memory_mib == 0 {
            return Err(VmError::Configuration("memory_mib must be > 0".into()));
        }
        if self.vcpu_count == 0 {
            return Err(VmError::Configuration("vcpu_count must be > 0".into()));
        }
        if self.disk_image_path.as_os_str().is_empty() {
            return Err(VmError::Configuration(
                "disk_image_path must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Derive a run-unique VM name from a test name.
///
/// Parallel runs against the same hypervisor must not collide on domain
/// names, so a short random suffix is appended.
pub fn unique_name(test_name: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", test_name, &suffix[..8])
}
