//! Harness configuration.

use crate::error::{Result, VmError};
use crate::firmware::DEFAULT_FIRMWARE_DIR;
use crate::spec::Architecture;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Which lease-table entry to use when a domain reports several addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AddressPolicy {
    /// Use the last address in the lease list.
    ///
    /// On arm64 guests two addresses are assigned transiently and the first
    /// becomes unusable shortly after boot; the last entry is the one that
    /// works everywhere observed so far. This is a workaround, not a
    /// documented hypervisor contract.
    #[default]
    LastLease,
    /// Use the first address in the lease list.
    FirstLease,
}

impl AddressPolicy {
    /// Apply the policy to one lease snapshot.
    pub fn select<'a>(&self, addresses: &'a [String]) -> Option<&'a str> {
        match self {
            Self::LastLease => addresses.last().map(String::as_str),
            Self::FirstLease => addresses.first().map(String::as_str),
        }
    }
}

/// Tunables for the VM test harness.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Directory holding firmware descriptor JSON files.
    pub firmware_dir: PathBuf,
    /// Machine model used for x86_64 guests.
    pub machine_model_x86_64: String,
    /// Machine model used for aarch64 guests.
    pub machine_model_aarch64: String,
    /// Interval between lease-table polls.
    pub address_poll_interval: Duration,
    /// How long one address wait may take before it times out.
    pub address_timeout: Duration,
    /// Pause between failed remote connection attempts.
    pub connect_backoff: Duration,
    /// Overall deadline across all remote connection attempts.
    pub connect_timeout: Duration,
    /// Address selection policy for multi-address leases.
    pub address_policy: AddressPolicy,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            firmware_dir: PathBuf::from(DEFAULT_FIRMWARE_DIR),
            machine_model_x86_64: "q35".into(),
            machine_model_aarch64: "virt-6.2".into(),
            address_poll_interval: Duration::from_secs(1),
            address_timeout: Duration::from_secs(30),
            connect_backoff: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(360),
            address_policy: AddressPolicy::default(),
        }
    }
}

impl HarnessConfig {
    /// Machine model for the given guest architecture.
    pub fn machine_model(&self, architecture: Architecture) -> &str {
        match architecture {
            Architecture::X86_64 => &self.machine_model_x86_64,
            Architecture::Aarch64 => &self.machine_model_aarch64,
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.firmware_dir.as_os_str().is_empty() {
            return Err(VmError::Configuration(
                "firmware_dir must not be empty".into(),
            ));
        }
        if self.address_poll_interval.is_zero() {
            return Err(VmError::Configuration(
                "address_poll_interval must be > 0".into(),
            ));
        }
        if self.address_timeout < self.address_poll_interval {
            return Err(VmError::Configuration(
                "address_timeout must be at least the poll interval".into(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(VmError::Configuration(
                "connect_timeout must be > 0".into(),
            ));
        }
        Ok(())
    }
}
