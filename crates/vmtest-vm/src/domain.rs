//! Domain descriptor construction.
//!
//! Turns a [`VmSpec`], resolved firmware and a console log path into the
//! XML wire document the hypervisor expects. The document is recomputed on
//! every build and is deterministic for identical inputs; it has no
//! lifecycle of its own.

use crate::error::{Result, VmError};
use crate::firmware::FirmwareDescriptor;
use crate::spec::{Architecture, BootType, VmSpec};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use xml::writer::{EmitterConfig, EventWriter, XmlEvent};

/// Default machine model per guest architecture.
pub fn default_machine_model(architecture: Architecture) -> &'static str {
    match architecture {
        Architecture::X86_64 => "q35",
        Architecture::Aarch64 => "virt-6.2",
    }
}

/// Named CPU model used when the guest architecture differs from the host
/// and host-passthrough is not available.
fn emulated_cpu_model(architecture: Architecture) -> &'static str {
    match architecture {
        Architecture::X86_64 => "qemu64",
        Architecture::Aarch64 => "cortex-a57",
    }
}

/// Generate the Nth device name for a disk prefix.
///
/// "vd"/"sd" follow the Linux device naming scheme (vda, vdb, ... vdz);
/// only the first 26 indexes are supported. Other prefixes get the numeric
/// index appended.
pub fn disk_device_name(prefix: &str, index: usize) -> Result<String> {
    if prefix == "vd" || prefix == "sd" {
        if index > 25 {
            return Err(VmError::UnsupportedDiskIndex(index));
        }
        let suffix = (b'a' + index as u8) as char;
        Ok(format!("{prefix}{suffix}"))
    } else {
        Ok(format!("{prefix}{index}"))
    }
}

/// Per-prefix running counter for disk device names.
///
/// Deterministic: the same sequence of `next` calls always yields the same
/// names.
#[derive(Debug, Default)]
pub struct DiskNameAllocator {
    next_index: HashMap<String, usize>,
}

impl DiskNameAllocator {
    /// Create an allocator with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next device name for `prefix`.
    pub fn next(&mut self, prefix: &str) -> Result<String> {
        let index = self.next_index.entry(prefix.to_string()).or_insert(0);
        let name = disk_device_name(prefix, *index)?;
        *index += 1;
        Ok(name)
    }
}

/// How the boot disk is wired into the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootDiskKind {
    /// Read-write qcow2 disk on the virtio bus.
    VirtioDisk,
    /// Read-only raw optical device on the platform bus (SATA on x86_64,
    /// SCSI on aarch64).
    Cdrom,
}

struct DiskLayout {
    kind: BootDiskKind,
    device: &'static str,
    image_type: &'static str,
    bus: &'static str,
    prefix: &'static str,
    boot_dev: &'static str,
    read_only: bool,
}

fn disk_layout(spec: &VmSpec) -> DiskLayout {
    let is_iso = spec
        .disk_image_path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("iso"));
    if is_iso {
        DiskLayout {
            kind: BootDiskKind::Cdrom,
            device: "cdrom",
            image_type: "raw",
            bus: match spec.architecture {
                Architecture::X86_64 => "sata",
                Architecture::Aarch64 => "scsi",
            },
            prefix: "sd",
            boot_dev: "cdrom",
            read_only: true,
        }
    } else {
        DiskLayout {
            kind: BootDiskKind::VirtioDisk,
            device: "disk",
            image_type: "qcow2",
            bus: "virtio",
            prefix: "vd",
            boot_dev: "hd",
            read_only: false,
        }
    }
}

/// A fully built domain wire document plus the facts later stages need.
#[derive(Debug, Clone)]
pub struct DomainDescriptor {
    name: String,
    boot_disk_device: String,
    boot_disk_kind: BootDiskKind,
    xml: String,
}

impl DomainDescriptor {
    /// Domain name, as placed in the document.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Device name assigned to the boot disk ("vda", "sda", ...).
    pub fn boot_disk_device(&self) -> &str {
        &self.boot_disk_device
    }

    /// How the boot disk was classified.
    pub fn boot_disk_kind(&self) -> BootDiskKind {
        self.boot_disk_kind
    }

    /// The XML wire document.
    pub fn xml(&self) -> &str {
        &self.xml
    }
}

/// Builder for [`DomainDescriptor`].
pub struct DomainBuilder<'a> {
    spec: &'a VmSpec,
    firmware: Option<&'a FirmwareDescriptor>,
    console_log_path: PathBuf,
    machine_model: Option<String>,
    host_architecture: Option<Architecture>,
}

impl<'a> DomainBuilder<'a> {
    /// Start a builder for the given spec and console log path.
    pub fn new(spec: &'a VmSpec, console_log_path: impl AsRef<Path>) -> Self {
        Self {
            spec,
            firmware: None,
            console_log_path: console_log_path.as_ref().to_path_buf(),
            machine_model: None,
            host_architecture: Architecture::host(),
        }
    }

    /// Attach resolved firmware (required for EFI boot).
    pub fn firmware(mut self, firmware: &'a FirmwareDescriptor) -> Self {
        self.firmware = Some(firmware);
        self
    }

    /// Override the machine model (defaults per architecture).
    pub fn machine_model(mut self, model: impl Into<String>) -> Self {
        self.machine_model = Some(model.into());
        self
    }

    /// Override host-architecture detection (tests).
    pub fn host_architecture(mut self, arch: Option<Architecture>) -> Self {
        self.host_architecture = arch;
        self
    }

    /// Build the descriptor.
    ///
    /// # Errors
    /// Fails when the spec is invalid, when EFI boot is requested without
    /// firmware, or when XML emission fails.
    pub fn build(self) -> Result<DomainDescriptor> {
        self.spec.validate()?;
        if self.spec.boot_type == BootType::Efi && self.firmware.is_none() {
            return Err(VmError::Configuration(
                "EFI boot requires a resolved firmware descriptor".into(),
            ));
        }

        let spec = self.spec;
        let machine_model = self
            .machine_model
            .clone()
            .unwrap_or_else(|| default_machine_model(spec.architecture).to_string());
        let host_matches = self.host_architecture == Some(spec.architecture);
        let layout = disk_layout(spec);

        let mut names = DiskNameAllocator::new();
        let boot_disk_device = names.next(layout.prefix)?;

        let mut buf = Vec::new();
        let mut w = EmitterConfig::new()
            .perform_indent(true)
            .write_document_declaration(false)
            .create_writer(&mut buf);

        let domain_type = if host_matches { "kvm" } else { "qemu" };
        w.write(XmlEvent::start_element("domain").attr("type", domain_type))?;

        text_element(&mut w, "name", &spec.name)?;
        w.write(XmlEvent::start_element("memory").attr("unit", "MiB"))?;
        w.write(XmlEvent::characters(&spec.memory_mib.to_string()))?;
        w.write(XmlEvent::end_element())?;
        text_element(&mut w, "vcpu", &spec.vcpu_count.to_string())?;

        // <os>
        w.write(XmlEvent::start_element("os"))?;
        w.write(
            XmlEvent::start_element("type")
                .attr("arch", spec.architecture.as_str())
                .attr("machine", &machine_model),
        )?;
        w.write(XmlEvent::characters("hvm"))?;
        w.write(XmlEvent::end_element())?;
        if spec.boot_type == BootType::Efi {
            // Checked above.
            let firmware = self.firmware.ok_or_else(|| {
                VmError::Configuration("EFI boot requires firmware".into())
            })?;
            if let Some(template) = &firmware.nvram_template {
                w.write(
                    XmlEvent::start_element("nvram")
                        .attr("template", &template.to_string_lossy()),
                )?;
                w.write(XmlEvent::end_element())?;
            }
            w.write(XmlEvent::start_element("boot").attr("dev", layout.boot_dev))?;
            w.write(XmlEvent::end_element())?;
            let secure = if spec.secure_boot { "yes" } else { "no" };
            w.write(
                XmlEvent::start_element("loader")
                    .attr("readonly", "yes")
                    .attr("secure", secure)
                    .attr("type", "pflash"),
            )?;
            w.write(XmlEvent::characters(
                &firmware.executable_path.to_string_lossy(),
            ))?;
            w.write(XmlEvent::end_element())?;
        } else {
            w.write(XmlEvent::start_element("boot").attr("dev", layout.boot_dev))?;
            w.write(XmlEvent::end_element())?;
        }
        w.write(XmlEvent::end_element())?; // </os>

        // <features>
        w.write(XmlEvent::start_element("features"))?;
        empty_element(&mut w, "acpi")?;
        match spec.architecture {
            Architecture::X86_64 => empty_element(&mut w, "apic")?,
            Architecture::Aarch64 => {
                w.write(XmlEvent::start_element("gic").attr("version", "2"))?;
                w.write(XmlEvent::end_element())?;
            }
        }
        w.write(XmlEvent::end_element())?;

        // <cpu>
        if host_matches {
            w.write(XmlEvent::start_element("cpu").attr("mode", "host-passthrough"))?;
            w.write(XmlEvent::end_element())?;
        } else {
            w.write(
                XmlEvent::start_element("cpu")
                    .attr("mode", "custom")
                    .attr("match", "exact")
                    .attr("check", "none"),
            )?;
            w.write(XmlEvent::start_element("model").attr("fallback", "forbid"))?;
            w.write(XmlEvent::characters(emulated_cpu_model(spec.architecture)))?;
            w.write(XmlEvent::end_element())?;
            w.write(XmlEvent::end_element())?;
        }

        w.write(XmlEvent::start_element("clock").attr("offset", "utc"))?;
        w.write(XmlEvent::end_element())?;

        text_element(&mut w, "on_poweroff", "destroy")?;
        text_element(&mut w, "on_reboot", "restart")?;
        text_element(&mut w, "on_crash", "destroy")?;

        // <devices>
        w.write(XmlEvent::start_element("devices"))?;

        if layout.bus == "scsi" {
            w.write(
                XmlEvent::start_element("controller")
                    .attr("type", "scsi")
                    .attr("index", "0")
                    .attr("model", "virtio-scsi"),
            )?;
            w.write(XmlEvent::end_element())?;
        }

        let console_path = self.console_log_path.to_string_lossy();
        for device in ["serial", "console"] {
            w.write(XmlEvent::start_element(device).attr("type", "file"))?;
            w.write(XmlEvent::start_element("source").attr("path", &console_path))?;
            w.write(XmlEvent::end_element())?;
            w.write(XmlEvent::end_element())?;
        }

        w.write(XmlEvent::start_element("video"))?;
        w.write(XmlEvent::start_element("model").attr("type", "vga"))?;
        w.write(XmlEvent::end_element())?;
        w.write(XmlEvent::end_element())?;

        w.write(XmlEvent::start_element("interface").attr("type", "network"))?;
        w.write(XmlEvent::start_element("source").attr("network", "default"))?;
        w.write(XmlEvent::end_element())?;
        w.write(XmlEvent::start_element("model").attr("type", "virtio"))?;
        w.write(XmlEvent::end_element())?;
        w.write(XmlEvent::end_element())?;

        // Exactly one boot disk.
        w.write(
            XmlEvent::start_element("disk")
                .attr("type", "file")
                .attr("device", layout.device),
        )?;
        w.write(
            XmlEvent::start_element("driver")
                .attr("name", "qemu")
                .attr("type", layout.image_type),
        )?;
        w.write(XmlEvent::end_element())?;
        w.write(
            XmlEvent::start_element("target")
                .attr("dev", &boot_disk_device)
                .attr("bus", layout.bus),
        )?;
        w.write(XmlEvent::end_element())?;
        w.write(
            XmlEvent::start_element("source")
                .attr("file", &spec.disk_image_path.to_string_lossy()),
        )?;
        w.write(XmlEvent::end_element())?;
        if layout.read_only {
            empty_element(&mut w, "readonly")?;
        }
        w.write(XmlEvent::end_element())?; // </disk>

        w.write(XmlEvent::end_element())?; // </devices>
        w.write(XmlEvent::end_element())?; // </domain>

        let xml = String::from_utf8(buf)
            .map_err(|e| VmError::Configuration(format!("descriptor is not UTF-8: {e}")))?;

        Ok(DomainDescriptor {
            name: spec.name.clone(),
            boot_disk_device,
            boot_disk_kind: layout.kind,
            xml,
        })
    }
}

fn text_element<W: std::io::Write>(
    w: &mut EventWriter<W>,
    name: &str,
    text: &str,
) -> Result<()> {
    w.write(XmlEvent::start_element(name))?;
    w.write(XmlEvent::characters(text))?;
    w.write(XmlEvent::end_element())?;
    Ok(())
}

fn empty_element<W: std::io::Write>(w: &mut EventWriter<W>, name: &str) -> Result<()> {
    w.write(XmlEvent::start_element(name))?;
    w.write(XmlEvent::end_element())?;
    Ok(())
}
