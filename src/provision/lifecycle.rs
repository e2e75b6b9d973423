//! Build-VM lifecycle: collision removal, creation, start.
//!
//! No two VMs may share a name on a host, and a failed earlier run can
//! leave a same-named survivor behind, so creation always force-removes a
//! colliding VM first. Starting the VM does not wait for the guest — that
//! is the readiness probe's job.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tracing::{info, warn};

use crate::hypervisor::{Hypervisor, VmSpec};
use crate::provision::{ProvisioningRequest, VmHandle, VM_CPU_COUNT, VM_MEMORY_MB};

/// Extra data disks are lettered `d` through `z` after the boot disk.
pub const MAX_DATA_DISKS: usize = 23;

pub struct VmLifecycleController {
    hypervisor: Arc<dyn Hypervisor>,
}

impl VmLifecycleController {
    pub fn new(hypervisor: Arc<dyn Hypervisor>) -> Self {
        Self { hypervisor }
    }

    /// Create a generation-2 VM booting from the staged disk and start it.
    ///
    /// Steps:
    /// 1. force power-off and delete any same-named VM on the host
    /// 2. translate a network-share disk path to the host's local path
    /// 3. create the VM (fixed memory, one vCPU, first available switch)
    /// 4. pin the network adapter's hardware address when requested
    /// 5. attach any extra blank data disks
    /// 6. start
    ///
    /// Returns the handle without waiting for guest readiness.
    pub async fn create_and_start(&self, request: &ProvisioningRequest) -> Result<VmHandle> {
        let name = &request.machine_name;
        let host = &request.host;

        if self.hypervisor.vm_exists(name, host).await? {
            warn!(vm = %name, host = %host, "colliding VM found — removing");
            self.hypervisor
                .force_stop_vm(name, host)
                .await
                .with_context(|| format!("force-stop colliding VM {name} on {host}"))?;
            self.hypervisor
                .delete_vm(name, host)
                .await
                .with_context(|| format!("delete colliding VM {name} on {host}"))?;
        }

        // The hypervisor opens the disk on the host it runs on, so a
        // \\host\x$\… path must become the host-local X:\… form.
        let disk_local = translate_share_path(&request.disk_path, host);

        let switch_name = self
            .hypervisor
            .first_switch(host)
            .await
            .with_context(|| format!("find a virtual switch on {host}"))?;

        self.hypervisor
            .create_vm(&VmSpec {
                name: name.clone(),
                host: host.clone(),
                disk_path: disk_local,
                memory_mb: VM_MEMORY_MB,
                cpu_count: VM_CPU_COUNT,
                switch_name,
            })
            .await
            .with_context(|| format!("create VM {name} on {host}"))?;

        if let Some(mac) = &request.fixed_mac {
            self.hypervisor
                .set_fixed_mac(name, host, mac)
                .await
                .with_context(|| format!("pin hardware address of {name}"))?;
        }

        // Extra blank data disks take the next drive-letter-style
        // identifiers after the boot disk (C), so the first one is D and
        // the last possible one is Z.
        if request.data_disk_sizes.len() > MAX_DATA_DISKS {
            bail!(
                "{} data disks requested; at most {MAX_DATA_DISKS} fit the identifiers d..z",
                request.data_disk_sizes.len()
            );
        }
        for (index, size_bytes) in request.data_disk_sizes.iter().enumerate() {
            let letter = (b'd' + index as u8) as char;
            let data_disk = data_disk_path(&request.disk_path, name, letter);
            self.hypervisor
                .attach_data_disk(name, host, &data_disk, *size_bytes)
                .await
                .with_context(|| format!("attach data disk {}", data_disk.display()))?;
        }

        self.hypervisor
            .start_vm(name, host)
            .await
            .with_context(|| format!("start VM {name} on {host}"))?;

        info!(vm = %name, host = %host, "VM created and started");
        Ok(VmHandle {
            name: name.clone(),
            host: host.clone(),
        })
    }
}

/// Sibling path for an extra data disk: `machine-d.vhdx` beside the boot
/// disk.
fn data_disk_path(boot_disk: &Path, machine: &str, letter: char) -> PathBuf {
    let dir = boot_disk.parent().unwrap_or_else(|| Path::new(""));
    dir.join(format!("{machine}-{letter}.vhdx"))
}

/// Translate an administrative-share path (`\\host\d$\dir\disk.vhdx`) into
/// the host-local form (`D:\dir\disk.vhdx`) when it addresses `host`.
///
/// Paths that are not administrative shares on that host pass through
/// unchanged.
pub fn translate_share_path(path: &Path, host: &str) -> PathBuf {
    let raw = path.to_string_lossy();
    let Some(rest) = raw.strip_prefix(r"\\") else {
        return path.to_path_buf();
    };

    let mut parts = rest.splitn(3, '\\');
    let (Some(share_host), Some(share)) = (parts.next(), parts.next()) else {
        return path.to_path_buf();
    };

    if !share_host.eq_ignore_ascii_case(host) {
        return path.to_path_buf();
    }

    // Administrative shares are a single drive letter plus '$'.
    let mut chars = share.chars();
    match (chars.next(), chars.next(), chars.next()) {
        (Some(drive), Some('$'), None) if drive.is_ascii_alphabetic() => {
            let tail = parts.next().unwrap_or("");
            PathBuf::from(format!(r"{}:\{}", drive.to_ascii_uppercase(), tail))
        }
        _ => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn administrative_share_on_matching_host_becomes_local() {
        let translated =
            translate_share_path(Path::new(r"\\buildhost01\d$\images\tmpl.vhdx"), "buildhost01");
        assert_eq!(translated, PathBuf::from(r"D:\images\tmpl.vhdx"));
    }

    #[test]
    fn host_match_is_case_insensitive() {
        let translated =
            translate_share_path(Path::new(r"\\BUILDHOST01\e$\tmpl.vhdx"), "buildhost01");
        assert_eq!(translated, PathBuf::from(r"E:\tmpl.vhdx"));
    }

    #[test]
    fn share_on_other_host_passes_through() {
        let path = Path::new(r"\\otherhost\d$\tmpl.vhdx");
        assert_eq!(translate_share_path(path, "buildhost01"), path.to_path_buf());
    }

    #[test]
    fn named_share_passes_through() {
        let path = Path::new(r"\\buildhost01\images\tmpl.vhdx");
        assert_eq!(translate_share_path(path, "buildhost01"), path.to_path_buf());
    }

    #[test]
    fn local_path_passes_through() {
        let path = Path::new(r"D:\images\tmpl.vhdx");
        assert_eq!(translate_share_path(path, "buildhost01"), path.to_path_buf());
    }

    #[test]
    fn data_disk_paths_take_letters_after_boot_disk() {
        let boot = Path::new(r"D:\images\web01.vhdx");
        assert_eq!(
            data_disk_path(boot, "web01", 'd'),
            PathBuf::from(r"D:\images\web01-d.vhdx")
        );
    }
}
