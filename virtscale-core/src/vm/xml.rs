//! Domain XML generation.
//!
//! The emitted XML is the external contract consumed by libvirt: a kvm
//! domain with a single qcow2 virtio disk, one bridged virtio interface,
//! virtio balloon, VNC graphics and a qemu-guest-agent channel.

use crate::types::vm::VmConfig;

/// Render the persistent domain definition for `config`.
pub fn domain_xml(config: &VmConfig) -> String {
    format!(
        r#"<domain type='kvm'>
  <name>{name}</name>
  <memory unit='MiB'>{memory}</memory>
  <currentMemory unit='MiB'>{memory}</currentMemory>
  <vcpu placement='static'>{vcpus}</vcpu>
  <os>
    <type arch='{arch}'>{os_type}</type>
    <boot dev='hd'/>
  </os>
  <features>
    <acpi/>
    <apic/>
    <vmport state='off'/>
  </features>
  <cpu mode='host-passthrough' check='none'/>
  <clock offset='utc'/>
  <on_poweroff>destroy</on_poweroff>
  <on_reboot>restart</on_reboot>
  <on_crash>destroy</on_crash>
  <devices>
    <emulator>/usr/bin/qemu-system-{arch}</emulator>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2' cache='none' io='native'/>
      <source file='{image}'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <controller type='usb' index='0' model='qemu-xhci' ports='15'/>
    <controller type='pci' index='0' model='pcie-root'/>
    <controller type='virtio-serial' index='0'/>
    <interface type='bridge'>
      <mac address='{mac}'/>
      <source bridge='{bridge}'/>
      <model type='virtio'/>
    </interface>
    <serial type='pty'>
      <target type='isa-serial' port='0'/>
    </serial>
    <console type='pty'/>
    <channel type='unix'>
      <target type='virtio' name='org.qemu.guest_agent.0'/>
    </channel>
    <input type='tablet' bus='usb'/>
    <input type='mouse' bus='ps2'/>
    <input type='keyboard' bus='ps2'/>
    <graphics type='vnc' port='-1' listen='0.0.0.0'/>
    <video>
      <model type='{video_model}' vram='{vram}' heads='1'/>
    </video>
    <memballoon model='virtio'/>
  </devices>
</domain>
"#,
        name = config.name,
        memory = config.memory_mb,
        vcpus = config.vcpus,
        arch = config.arch,
        os_type = config.os_type,
        image = config.image_path.display(),
        mac = generate_mac_address(),
        bridge = config.network_bridge,
        video_model = config.video_model,
        vram = config.video_vram_kib,
    )
}

/// Render the snapshot definition XML.
pub fn snapshot_xml(name: &str, description: &str) -> String {
    format!(
        "<domainsnapshot><name>{name}</name><description>{description}</description></domainsnapshot>"
    )
}

/// Generate a locally-administered unicast MAC address.
///
/// Uses the 52:54:00 prefix (QEMU/KVM convention) with a time-seeded suffix.
pub fn generate_mac_address() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let seed = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos();
    format!(
        "52:54:00:{:02x}:{:02x}:{:02x}",
        (seed >> 16) & 0xff,
        (seed >> 8) & 0xff,
        seed & 0xff
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn config() -> VmConfig {
        VmConfig {
            name: "web1".to_string(),
            image_path: PathBuf::from("/var/lib/images/web1.qcow2"),
            vcpus: 4,
            memory_mb: 4096,
            ..Default::default()
        }
    }

    #[test]
    fn domain_xml_declares_required_devices() {
        let xml = domain_xml(&config());

        assert!(xml.contains("<domain type='kvm'>"));
        assert!(xml.contains("<name>web1</name>"));
        assert!(xml.contains("<memory unit='MiB'>4096</memory>"));
        assert!(xml.contains("<vcpu placement='static'>4</vcpu>"));
        assert!(xml.contains("<cpu mode='host-passthrough'"));
        assert!(xml.contains("type='qcow2' cache='none' io='native'"));
        assert!(xml.contains("<source file='/var/lib/images/web1.qcow2'/>"));
        assert!(xml.contains("<source bridge='virbr0'/>"));
        assert!(xml.contains("<memballoon model='virtio'/>"));
        assert!(xml.contains("<graphics type='vnc' port='-1' listen='0.0.0.0'/>"));
        assert!(xml.contains("org.qemu.guest_agent.0"));
    }

    #[test]
    fn mac_is_locally_administered_unicast() {
        let mac = generate_mac_address();
        assert!(mac.starts_with("52:54:00:"));
        assert_eq!(mac.len(), 17);
        assert_eq!(mac.split(':').count(), 6);
        for octet in mac.split(':') {
            assert!(u8::from_str_radix(octet, 16).is_ok());
        }
    }

    #[test]
    fn snapshot_xml_embeds_name() {
        let xml = snapshot_xml("pre-upgrade", "before kernel update");
        assert!(xml.contains("<name>pre-upgrade</name>"));
        assert!(xml.contains("before kernel update"));
    }
}
