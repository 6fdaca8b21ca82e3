//! Boot firmware resolution.
//!
//! QEMU installations describe their firmware binaries in JSON documents
//! under a well-known directory (`/usr/share/qemu/firmware`). Each document
//! names the architectures and machine models the binary supports plus
//! feature tags such as `secure-boot` and `enrolled-keys`. Resolution loads
//! one snapshot of that directory and runs a pure filter pipeline over it:
//! architecture, machine-model glob, vendor exclusions, secure-boot.

use crate::error::{Result, VmError};
use crate::spec::Architecture;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Well-known location of QEMU firmware descriptor files.
pub const DEFAULT_FIRMWARE_DIR: &str = "/usr/share/qemu/firmware";

/// Confidential-computing and image-format variants the harness never
/// boots: Intel TDX, AMD SEV, and qcow2-packaged firmware builds.
const EXCLUDED_EXECUTABLE_TAGS: &[&str] = &["inteltdx", "amdsev", "qcow2"];

#[derive(Debug, Deserialize)]
struct FirmwareDocument {
    #[serde(default)]
    targets: Vec<FirmwareTarget>,
    #[serde(default)]
    features: Vec<String>,
    #[serde(default)]
    mapping: FirmwareMapping,
}

#[derive(Debug, Deserialize)]
struct FirmwareTarget {
    architecture: String,
    #[serde(default)]
    machines: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FirmwareMapping {
    executable: Option<FirmwareFile>,
    #[serde(rename = "nvram-template")]
    nvram_template: Option<FirmwareFile>,
}

#[derive(Debug, Deserialize)]
struct FirmwareFile {
    filename: PathBuf,
}

/// One boot-firmware binary and the machine combinations it supports.
#[derive(Debug, Clone)]
pub struct FirmwareDescriptor {
    /// Architecture of the descriptor's first target.
    pub architecture: String,
    /// Machine-model glob patterns from the first target.
    pub machine_patterns: Vec<String>,
    /// Whether the `secure-boot` feature tag is present.
    pub supports_secure_boot: bool,
    /// Whether the `enrolled-keys` feature tag is present.
    pub requires_enrolled_keys: bool,
    /// Path to the firmware executable (the pflash loader image).
    pub executable_path: PathBuf,
    /// NVRAM variable-store template shipped with the firmware, if any.
    pub nvram_template: Option<PathBuf>,
}

impl FirmwareDescriptor {
    fn from_document(doc: FirmwareDocument) -> Option<Self> {
        let target = doc.targets.into_iter().next()?;
        let executable = doc.mapping.executable?;
        Some(Self {
            architecture: target.architecture,
            machine_patterns: target.machines,
            supports_secure_boot: doc.features.iter().any(|f| f == "secure-boot"),
            requires_enrolled_keys: doc.features.iter().any(|f| f == "enrolled-keys"),
            executable_path: executable.filename,
            nvram_template: doc.mapping.nvram_template.map(|f| f.filename),
        })
    }

    fn matches_machine(&self, machine_model: &str) -> Result<bool> {
        for pattern in &self.machine_patterns {
            let glob = glob::Pattern::new(pattern).map_err(|source| VmError::MachinePattern {
                pattern: pattern.clone(),
                source,
            })?;
            if glob.matches(machine_model) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn is_excluded(&self) -> bool {
        let filename = self.executable_path.to_string_lossy();
        EXCLUDED_EXECUTABLE_TAGS
            .iter()
            .any(|tag| filename.contains(tag))
    }
}

/// A read-only snapshot of a firmware descriptor directory.
///
/// Loaded once per resolution so repeated [`FirmwareSnapshot::resolve`]
/// calls over the same snapshot are deterministic.
#[derive(Debug, Default)]
pub struct FirmwareSnapshot {
    descriptors: Vec<FirmwareDescriptor>,
}

impl FirmwareSnapshot {
    /// Load every `*.json` descriptor in `dir`.
    ///
    /// Files are read in filename order so enumeration order (and therefore
    /// first-match selection) does not depend on directory layout. A single
    /// file may hold several concatenated JSON documents; all are read.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        let mut descriptors = Vec::new();
        for path in paths {
            let data = std::fs::read_to_string(&path)?;
            let stream = serde_json::Deserializer::from_str(&data)
                .into_iter::<FirmwareDocument>();
            for doc in stream {
                let doc = doc.map_err(|source| VmError::FirmwareParse {
                    path: path.clone(),
                    source,
                })?;
                descriptors.extend(FirmwareDescriptor::from_document(doc));
            }
        }
        tracing::debug!(dir = %dir.display(), count = descriptors.len(), "loaded firmware descriptors");
        Ok(Self { descriptors })
    }

    /// Build a snapshot from descriptors already in memory (tests).
    pub fn from_descriptors(descriptors: Vec<FirmwareDescriptor>) -> Self {
        Self { descriptors }
    }

    /// Select firmware for the requested architecture/machine/secure-boot
    /// combination.
    ///
    /// The pipeline keeps descriptors that (a) target `architecture`,
    /// (b) have a machine glob matching `machine_model`, (c) are not one of
    /// the excluded vendor/format variants, and (d) satisfy the secure-boot
    /// request: secure boot requires both `secure-boot` and `enrolled-keys`
    /// feature tags, while a non-secure request rejects any secure-boot
    /// firmware. The first survivor in enumeration order wins.
    pub fn resolve(
        &self,
        architecture: Architecture,
        machine_model: &str,
        secure_boot: bool,
    ) -> Result<&FirmwareDescriptor> {
        for descriptor in &self.descriptors {
            if descriptor.architecture != architecture.as_str() {
                continue;
            }
            if !descriptor.matches_machine(machine_model)? {
                continue;
            }
            if descriptor.is_excluded() {
                continue;
            }
            let secure_ok = if secure_boot {
                descriptor.supports_secure_boot && descriptor.requires_enrolled_keys
            } else {
                !descriptor.supports_secure_boot
            };
            if !secure_ok {
                continue;
            }
            tracing::debug!(
                firmware = %descriptor.executable_path.display(),
                %architecture,
                machine_model,
                secure_boot,
                "resolved firmware"
            );
            return Ok(descriptor);
        }

        Err(VmError::FirmwareNotFound {
            architecture,
            machine_model: machine_model.to_string(),
            secure_boot,
        })
    }
}

/// Load the descriptor directory and resolve in one step.
pub fn resolve_firmware(
    dir: impl AsRef<Path>,
    architecture: Architecture,
    machine_model: &str,
    secure_boot: bool,
) -> Result<FirmwareDescriptor> {
    let snapshot = FirmwareSnapshot::load(dir)?;
    snapshot
        .resolve(architecture, machine_model, secure_boot)
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(
        architecture: &str,
        machines: &[&str],
        features: &[&str],
        executable: &str,
    ) -> FirmwareDescriptor {
        FirmwareDescriptor {
            architecture: architecture.to_string(),
            machine_patterns: machines.iter().map(|m| m.to_string()).collect(),
            supports_secure_boot: features.contains(&"secure-boot"),
            requires_enrolled_keys: features.contains(&"enrolled-keys"),
            executable_path: PathBuf::from(executable),
            nvram_template: None,
        }
    }

    #[test]
    fn test_resolve_first_match_in_order() {
        let snapshot = FirmwareSnapshot::from_descriptors(vec![
            descriptor("x86_64", &["pc-q35-*"], &[], "/fw/OVMF_CODE_a.fd"),
            descriptor("x86_64", &["pc-q35-*"], &[], "/fw/OVMF_CODE_b.fd"),
        ]);
        let fw = snapshot
            .resolve(Architecture::X86_64, "pc-q35-6.2", false)
            .unwrap();
        assert_eq!(fw.executable_path, PathBuf::from("/fw/OVMF_CODE_a.fd"));
    }

    #[test]
    fn test_resolve_is_deterministic() {
        let snapshot = FirmwareSnapshot::from_descriptors(vec![
            descriptor("x86_64", &["pc-q35-*"], &[], "/fw/a.fd"),
            descriptor("x86_64", &["pc-*"], &[], "/fw/b.fd"),
        ]);
        let first = snapshot
            .resolve(Architecture::X86_64, "pc-q35-6.2", false)
            .unwrap()
            .executable_path
            .clone();
        for _ in 0..10 {
            let again = snapshot
                .resolve(Architecture::X86_64, "pc-q35-6.2", false)
                .unwrap();
            assert_eq!(again.executable_path, first);
        }
    }

    #[test]
    fn test_architecture_mismatch_filtered() {
        let snapshot = FirmwareSnapshot::from_descriptors(vec![descriptor(
            "x86_64",
            &["pc-q35-*"],
            &[],
            "/fw/ovmf.fd",
        )]);
        let err = snapshot
            .resolve(Architecture::Aarch64, "virt-6.2", false)
            .unwrap_err();
        assert!(matches!(err, VmError::FirmwareNotFound { .. }));
    }

    #[test]
    fn test_secure_boot_requires_enrolled_keys() {
        // Only a non-secure-boot aarch64 descriptor is present: requesting
        // secure boot must fail.
        let snapshot = FirmwareSnapshot::from_descriptors(vec![descriptor(
            "aarch64",
            &["virt-*"],
            &[],
            "/fw/AAVMF_CODE.fd",
        )]);
        let err = snapshot
            .resolve(Architecture::Aarch64, "virt-6.2", true)
            .unwrap_err();
        assert!(matches!(
            err,
            VmError::FirmwareNotFound {
                architecture: Architecture::Aarch64,
                secure_boot: true,
                ..
            }
        ));

        // secure-boot without enrolled-keys is still not enough.
        let snapshot = FirmwareSnapshot::from_descriptors(vec![descriptor(
            "aarch64",
            &["virt-*"],
            &["secure-boot"],
            "/fw/AAVMF_CODE.secboot.fd",
        )]);
        assert!(snapshot
            .resolve(Architecture::Aarch64, "virt-6.2", true)
            .is_err());
    }

    #[test]
    fn test_non_secure_request_rejects_secure_firmware() {
        let snapshot = FirmwareSnapshot::from_descriptors(vec![
            descriptor(
                "x86_64",
                &["pc-q35-*"],
                &["secure-boot", "enrolled-keys"],
                "/fw/OVMF_CODE.secboot.fd",
            ),
            descriptor("x86_64", &["pc-q35-*"], &[], "/fw/OVMF_CODE.fd"),
        ]);
        let fw = snapshot
            .resolve(Architecture::X86_64, "pc-q35-6.2", false)
            .unwrap();
        assert_eq!(fw.executable_path, PathBuf::from("/fw/OVMF_CODE.fd"));
    }

    #[test]
    fn test_vendor_variants_excluded() {
        for tag in ["inteltdx", "amdsev", "qcow2"] {
            let snapshot = FirmwareSnapshot::from_descriptors(vec![descriptor(
                "x86_64",
                &["pc-q35-*"],
                &[],
                &format!("/fw/OVMF.{tag}.fd"),
            )]);
            assert!(
                snapshot
                    .resolve(Architecture::X86_64, "pc-q35-6.2", false)
                    .is_err(),
                "{tag} variant should be excluded"
            );
        }
    }

    #[test]
    fn test_load_concatenated_documents() {
        let dir = tempfile::tempdir().unwrap();
        // Two documents in one file, as shipped by some distros.
        std::fs::write(
            dir.path().join("60-ovmf.json"),
            r#"
            {
                "targets": [{"architecture": "x86_64", "machines": ["pc-q35-*"]}],
                "features": [],
                "mapping": {"executable": {"filename": "/fw/first.fd"}}
            }
            {
                "targets": [{"architecture": "x86_64", "machines": ["pc-i440fx-*"]}],
                "features": ["secure-boot", "enrolled-keys"],
                "mapping": {
                    "executable": {"filename": "/fw/second.fd"},
                    "nvram-template": {"filename": "/fw/second_VARS.fd"}
                }
            }
            "#,
        )
        .unwrap();
        // Non-JSON files are ignored.
        std::fs::write(dir.path().join("README"), "not firmware").unwrap();

        let snapshot = FirmwareSnapshot::load(dir.path()).unwrap();
        let fw = snapshot
            .resolve(Architecture::X86_64, "pc-i440fx-6.2", true)
            .unwrap();
        assert_eq!(fw.executable_path, PathBuf::from("/fw/second.fd"));
        assert_eq!(fw.nvram_template, Some(PathBuf::from("/fw/second_VARS.fd")));
    }

    #[test]
    fn test_load_rejects_malformed_json() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.json"), "{ not json").unwrap();
        let err = FirmwareSnapshot::load(dir.path()).unwrap_err();
        assert!(matches!(err, VmError::FirmwareParse { .. }));
    }

    #[test]
    fn test_file_order_is_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let doc = |exe: &str| {
            format!(
                r#"{{"targets": [{{"architecture": "x86_64", "machines": ["pc-q35-*"]}}],
                    "features": [], "mapping": {{"executable": {{"filename": "{exe}"}}}}}}"#
            )
        };
        std::fs::write(dir.path().join("90-late.json"), doc("/fw/late.fd")).unwrap();
        std::fs::write(dir.path().join("10-early.json"), doc("/fw/early.fd")).unwrap();

        let fw = resolve_firmware(dir.path(), Architecture::X86_64, "pc-q35-6.2", false).unwrap();
        assert_eq!(fw.executable_path, PathBuf::from("/fw/early.fd"));
    }
}
