//! End-to-end boot flow against the mock hypervisor backend.
//!
//! Drives the whole provisioning pipeline the way a test harness would:
//! resolve firmware, build a domain descriptor, define and boot the VM,
//! capture console output through the event loop, wait for an address,
//! and tear everything down.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use vmtest_hv::{EventLoop, Hypervisor, MockHypervisor};
use vmtest_vm::{
    close_all, line_log_path, unique_name, Architecture, BootType, DomainBuilder,
    FirmwareDescriptor, FirmwareSnapshot, HarnessConfig, Vm, VmSpec,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn efi_firmware() -> FirmwareDescriptor {
    FirmwareDescriptor {
        architecture: "x86_64".to_string(),
        machine_patterns: vec!["pc-q35-*".to_string()],
        supports_secure_boot: false,
        requires_enrolled_keys: false,
        executable_path: PathBuf::from("/fw/OVMF_CODE.fd"),
        nvram_template: Some(PathBuf::from("/fw/OVMF_VARS.fd")),
    }
}

fn harness_config() -> HarnessConfig {
    HarnessConfig {
        address_poll_interval: Duration::from_millis(10),
        address_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_full_boot_flow() {
    init_tracing();
    let spec = VmSpec {
        name: unique_name("boot-flow"),
        memory_mib: 4096,
        vcpu_count: 4,
        disk_image_path: PathBuf::from("/images/disk.qcow2"),
        boot_type: BootType::Efi,
        secure_boot: false,
        architecture: Architecture::X86_64,
    };
    spec.validate().unwrap();

    let snapshot = FirmwareSnapshot::from_descriptors(vec![efi_firmware()]);
    let firmware = snapshot
        .resolve(spec.architecture, "pc-q35-6.2", spec.secure_boot)
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let console_log = dir.path().join("console.log");

    let descriptor = DomainBuilder::new(&spec, &console_log)
        .firmware(firmware)
        .machine_model("pc-q35-6.2")
        .host_architecture(Some(Architecture::X86_64))
        .build()
        .unwrap();

    // EFI with secure boot off: pflash loader present but not secured,
    // and the boot disk is a writable virtio disk.
    assert!(descriptor.xml().contains(r#"secure="no""#));
    assert!(descriptor.xml().contains("/fw/OVMF_CODE.fd"));
    assert_eq!(descriptor.boot_disk_device(), "vda");

    let hv = Arc::new(MockHypervisor::new());
    let events = {
        let hv = hv.clone();
        EventLoop::with_interval(move || hv.pump(), Duration::from_millis(5))
    };
    events.ensure_started().unwrap();
    events.ensure_started().unwrap(); // idempotent

    let mut vm = Vm::define(
        hv.clone() as Arc<dyn Hypervisor>,
        &descriptor,
        harness_config(),
    )
    .await
    .unwrap();
    vm.start(&console_log).await.unwrap();

    hv.push_console(vm.id(), b"\x1b[1mGRUB\x1b[0m loading\nkernel up\n");
    hv.script_leases(
        vm.id(),
        vec![vec![], vec!["192.168.122.41".to_string()]],
    );

    let address = vm.address_default().await.unwrap();
    assert_eq!(address, "192.168.122.41");

    // Give the event loop a tick to deliver the queued console bytes.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut vms = [vm];
    let report = close_all(&mut vms).await;
    assert!(report.is_clean(), "teardown failed: {report}");
    assert!(!hv.is_defined(&spec.name));

    let raw = std::fs::read(&console_log).unwrap();
    assert_eq!(raw, b"\x1b[1mGRUB\x1b[0m loading\nkernel up\n");
    let lines = std::fs::read_to_string(line_log_path(&console_log)).unwrap();
    assert_eq!(lines, "GRUB loading\nkernel up\n");

    events.shutdown().unwrap();
}

#[tokio::test]
async fn test_boot_flow_survives_console_hangup() {
    init_tracing();
    let spec = VmSpec {
        name: unique_name("hangup-flow"),
        memory_mib: 2048,
        vcpu_count: 2,
        disk_image_path: PathBuf::from("/images/disk.qcow2"),
        boot_type: BootType::Legacy,
        secure_boot: false,
        architecture: Architecture::X86_64,
    };

    let dir = tempfile::tempdir().unwrap();
    let console_log = dir.path().join("console.log");
    let descriptor = DomainBuilder::new(&spec, &console_log)
        .host_architecture(Some(Architecture::X86_64))
        .build()
        .unwrap();

    let hv = Arc::new(MockHypervisor::new());
    let mut vm = Vm::define(
        hv.clone() as Arc<dyn Hypervisor>,
        &descriptor,
        harness_config(),
    )
    .await
    .unwrap();
    vm.start(&console_log).await.unwrap();

    hv.push_console(vm.id(), b"halting\n");
    // Pump once by hand the way the real event thread would, and let the
    // logger drain the channel before teardown aborts the stream.
    hv.pump().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let failures = vm.close().await;
    assert!(failures.is_empty());

    let raw = std::fs::read_to_string(&console_log).unwrap();
    assert_eq!(raw, "halting\n");
}
