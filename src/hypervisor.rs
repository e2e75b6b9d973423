//! Hypervisor management surface.
//!
//! The provisioning pipeline never talks to a hypervisor directly — it goes
//! through the [`Hypervisor`] trait so every stage can be tested against a
//! fake. The production implementation, [`HyperVHost`], shells out to the
//! PowerShell Hyper-V module (`Get-VM`, `New-VM`, `Mount-VHD`, …) the same
//! way the rest of the crate drives external tools.
//!
//! ## Architecture
//!
//! ```text
//! ProvisioningPipeline
//!     └─► Arc<dyn Hypervisor>
//!             ├─► HyperVHost        (Windows: powershell.exe child process)
//!             └─► fakes in tests/   (scripted responses, call counting)
//! ```
//!
//! # Platform gating
//!
//! The full implementation is compiled only on Windows. On other platforms a
//! stub is provided that returns an explanatory error so the crate compiles
//! and the fake-backed tests run everywhere.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

// ---------------------------------------------------------------------------
// Shared types (available on all platforms)
// ---------------------------------------------------------------------------

/// Everything needed to create one VM. Plain data, no hidden state.
#[derive(Debug, Clone)]
pub struct VmSpec {
    /// VM name, unique per host.
    pub name: String,

    /// Hypervisor host the VM is created on.
    pub host: String,

    /// Boot disk path, already resolved to a path the host can open locally.
    pub disk_path: PathBuf,

    /// Fixed memory allocation in megabytes.
    pub memory_mb: u64,

    /// Number of virtual processors.
    pub cpu_count: u32,

    /// Name of the virtual switch to connect the network adapter to.
    pub switch_name: String,
}

/// One guest-integration service's reported status.
///
/// An empty `status` means the service reports nothing — the host-side
/// signal that the guest has fully powered off is *every* service reporting
/// empty, not just one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStatus {
    pub service: String,
    pub status: String,
}

impl ServiceStatus {
    pub fn is_silent(&self) -> bool {
        self.status.is_empty()
    }
}

/// Quote a value for embedding in a PowerShell script as a single-quoted
/// string. Embedded single quotes are doubled, PowerShell's escape for
/// them, so names and paths containing `'` cannot break out of the quoting.
#[cfg_attr(not(windows), allow(dead_code))]
fn ps_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Hypervisor VM/switch/disk management operations used by the pipeline.
///
/// All methods reach across to a possibly-remote host and may block for the
/// transport's full timeout. Query methods return whatever the hypervisor
/// reports *right now*; callers own the polling and retry policy.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// `true` when a VM with `name` exists on `host`.
    async fn vm_exists(&self, name: &str, host: &str) -> anyhow::Result<bool>;

    /// Hard power-off, equivalent to pulling the plug. Must succeed on an
    /// already-off VM.
    async fn force_stop_vm(&self, name: &str, host: &str) -> anyhow::Result<()>;

    /// Delete the VM shell. Leaves its disk files untouched.
    async fn delete_vm(&self, name: &str, host: &str) -> anyhow::Result<()>;

    /// Name of the first virtual switch available on `host`.
    async fn first_switch(&self, host: &str) -> anyhow::Result<String>;

    /// Create a generation-2 VM per `spec`, booting from its disk.
    /// Does not start it.
    async fn create_vm(&self, spec: &VmSpec) -> anyhow::Result<()>;

    /// Pin the VM's network adapter to a fixed hardware address.
    /// Must be called before the first start.
    async fn set_fixed_mac(&self, name: &str, host: &str, mac: &str) -> anyhow::Result<()>;

    /// Create a blank dynamically-growing disk of `size_bytes` at `disk_path`
    /// and attach it to the VM after its existing disks.
    async fn attach_data_disk(
        &self,
        name: &str,
        host: &str,
        disk_path: &Path,
        size_bytes: u64,
    ) -> anyhow::Result<()>;

    async fn start_vm(&self, name: &str, host: &str) -> anyhow::Result<()>;

    /// Raw guest-integration heartbeat status string (e.g. `OkApplicationsHealthy`).
    async fn heartbeat(&self, name: &str, host: &str) -> anyhow::Result<String>;

    /// Network addresses currently reported for the VM's adapters.
    /// Empty until guest networking comes up.
    async fn guest_addresses(&self, name: &str, host: &str) -> anyhow::Result<Vec<String>>;

    /// Status of every guest-integration service.
    async fn integration_statuses(
        &self,
        name: &str,
        host: &str,
    ) -> anyhow::Result<Vec<ServiceStatus>>;

    /// Mount a virtual disk file and return its mount point (drive root).
    ///
    /// At most one mount of a given disk may exist system-wide; callers pair
    /// every mount with [`Hypervisor::dismount_disk`] on all exit paths.
    async fn mount_disk(&self, disk_path: &Path) -> anyhow::Result<PathBuf>;

    /// Dismount a previously mounted virtual disk file.
    async fn dismount_disk(&self, disk_path: &Path) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// Windows implementation (PowerShell Hyper-V module)
// ---------------------------------------------------------------------------

#[cfg(windows)]
mod imp {
    use std::path::{Path, PathBuf};

    use anyhow::{Context, Result, bail};
    use async_trait::async_trait;
    use tokio::process::Command;
    use tracing::{debug, info};

    use super::{Hypervisor, ServiceStatus, VmSpec, ps_quote};

    /// Hyper-V implementation driving `powershell.exe`.
    #[derive(Debug, Clone, Default)]
    pub struct HyperVHost;

    impl HyperVHost {
        pub fn new() -> Self {
            Self
        }

        /// Run a PowerShell script fragment and return its trimmed stdout.
        ///
        /// Non-zero exit becomes an `Err` carrying the script's stderr, so
        /// failures surface the cmdlet's own diagnostic text.
        async fn ps(&self, script: &str) -> Result<String> {
            debug!(script, "powershell");

            let output = Command::new("powershell.exe")
                .args(["-NoProfile", "-NonInteractive", "-Command", script])
                .output()
                .await
                .context("failed to spawn powershell.exe")?;

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                bail!(
                    "powershell failed (exit {}): {}",
                    output.status.code().unwrap_or(-1),
                    stderr.trim()
                );
            }

            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        }
    }

    #[async_trait]
    impl Hypervisor for HyperVHost {
        async fn vm_exists(&self, name: &str, host: &str) -> Result<bool> {
            let out = self
                .ps(&format!(
                    "(Get-VM -ComputerName {host} -Name {name} \
                     -ErrorAction SilentlyContinue) -ne $null",
                    host = ps_quote(host),
                    name = ps_quote(name),
                ))
                .await?;
            Ok(out.eq_ignore_ascii_case("true"))
        }

        async fn force_stop_vm(&self, name: &str, host: &str) -> Result<()> {
            info!(vm = name, host, "force power-off");
            self.ps(&format!(
                "Stop-VM -ComputerName {host} -Name {name} -TurnOff -Force",
                host = ps_quote(host),
                name = ps_quote(name),
            ))
            .await?;
            Ok(())
        }

        async fn delete_vm(&self, name: &str, host: &str) -> Result<()> {
            info!(vm = name, host, "delete VM shell");
            self.ps(&format!(
                "Remove-VM -ComputerName {host} -Name {name} -Force",
                host = ps_quote(host),
                name = ps_quote(name),
            ))
            .await?;
            Ok(())
        }

        async fn first_switch(&self, host: &str) -> Result<String> {
            let out = self
                .ps(&format!(
                    "(Get-VMSwitch -ComputerName {host} | Select-Object -First 1).Name",
                    host = ps_quote(host),
                ))
                .await?;
            if out.is_empty() {
                bail!("no virtual switch available on host {host}");
            }
            Ok(out)
        }

        async fn create_vm(&self, spec: &VmSpec) -> Result<()> {
            info!(
                vm = %spec.name,
                host = %spec.host,
                disk = %spec.disk_path.display(),
                memory_mb = spec.memory_mb,
                cpus = spec.cpu_count,
                switch = %spec.switch_name,
                "create generation-2 VM"
            );
            self.ps(&format!(
                "New-VM -ComputerName {host} -Name {name} -Generation 2 \
                 -MemoryStartupBytes {mem}MB -VHDPath {disk} -SwitchName {switch} | Out-Null; \
                 Set-VM -ComputerName {host} -Name {name} -ProcessorCount {cpus}",
                host = ps_quote(&spec.host),
                name = ps_quote(&spec.name),
                mem = spec.memory_mb,
                disk = ps_quote(&spec.disk_path.to_string_lossy()),
                switch = ps_quote(&spec.switch_name),
                cpus = spec.cpu_count,
            ))
            .await?;
            Ok(())
        }

        async fn set_fixed_mac(&self, name: &str, host: &str, mac: &str) -> Result<()> {
            info!(vm = name, host, mac, "pin network adapter hardware address");
            self.ps(&format!(
                "Set-VMNetworkAdapter -ComputerName {host} -VMName {name} \
                 -StaticMacAddress {mac}",
                host = ps_quote(host),
                name = ps_quote(name),
                mac = ps_quote(mac),
            ))
            .await?;
            Ok(())
        }

        async fn attach_data_disk(
            &self,
            name: &str,
            host: &str,
            disk_path: &Path,
            size_bytes: u64,
        ) -> Result<()> {
            info!(
                vm = name,
                host,
                disk = %disk_path.display(),
                size_bytes,
                "attach blank data disk"
            );
            self.ps(&format!(
                "New-VHD -ComputerName {host} -Path {disk} -Dynamic \
                 -SizeBytes {size_bytes} | Out-Null; \
                 Add-VMHardDiskDrive -ComputerName {host} -VMName {name} -Path {disk}",
                host = ps_quote(host),
                name = ps_quote(name),
                disk = ps_quote(&disk_path.to_string_lossy()),
            ))
            .await?;
            Ok(())
        }

        async fn start_vm(&self, name: &str, host: &str) -> Result<()> {
            info!(vm = name, host, "start VM");
            self.ps(&format!(
                "Start-VM -ComputerName {host} -Name {name}",
                host = ps_quote(host),
                name = ps_quote(name),
            ))
            .await?;
            Ok(())
        }

        async fn heartbeat(&self, name: &str, host: &str) -> Result<String> {
            self.ps(&format!(
                "(Get-VM -ComputerName {host} -Name {name}).Heartbeat",
                host = ps_quote(host),
                name = ps_quote(name),
            ))
            .await
        }

        async fn guest_addresses(&self, name: &str, host: &str) -> Result<Vec<String>> {
            let out = self
                .ps(&format!(
                    "(Get-VMNetworkAdapter -ComputerName {host} -VMName {name}).IPAddresses",
                    host = ps_quote(host),
                    name = ps_quote(name),
                ))
                .await?;
            Ok(out
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect())
        }

        async fn integration_statuses(&self, name: &str, host: &str) -> Result<Vec<ServiceStatus>> {
            let out = self
                .ps(&format!(
                    "Get-VMIntegrationService -ComputerName {host} -VMName {name} | \
                     ForEach-Object {{ \"$($_.Name)`t$($_.PrimaryStatusDescription)\" }}",
                    host = ps_quote(host),
                    name = ps_quote(name),
                ))
                .await?;
            Ok(out
                .lines()
                .filter(|l| !l.trim().is_empty())
                .map(|line| {
                    let (service, status) = line.split_once('\t').unwrap_or((line, ""));
                    ServiceStatus {
                        service: service.trim().to_string(),
                        status: status.trim().to_string(),
                    }
                })
                .collect())
        }

        async fn mount_disk(&self, disk_path: &Path) -> Result<PathBuf> {
            // Mount-VHD -Passthru hands us the disk object directly, so the
            // drive letter comes from the API rather than from diffing the
            // volume list before and after.
            let letter = self
                .ps(&format!(
                    "(Mount-VHD -Path {disk} -Passthru | Get-Disk | Get-Partition | \
                     Get-Volume | Where-Object DriveLetter | \
                     Select-Object -First 1).DriveLetter",
                    disk = ps_quote(&disk_path.to_string_lossy()),
                ))
                .await?;

            if letter.is_empty() {
                bail!(
                    "mounted {} but no volume received a drive letter",
                    disk_path.display()
                );
            }

            let root = PathBuf::from(format!("{letter}:\\"));
            info!(disk = %disk_path.display(), mount = %root.display(), "disk mounted");
            Ok(root)
        }

        async fn dismount_disk(&self, disk_path: &Path) -> Result<()> {
            info!(disk = %disk_path.display(), "dismount disk");
            self.ps(&format!(
                "Dismount-VHD -Path {}",
                ps_quote(&disk_path.to_string_lossy())
            ))
            .await?;
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Non-Windows stub — keeps the crate compilable everywhere
// ---------------------------------------------------------------------------

#[cfg(not(windows))]
mod imp {
    use std::path::{Path, PathBuf};

    use anyhow::{Result, bail};
    use async_trait::async_trait;

    use super::{Hypervisor, ServiceStatus, VmSpec};

    /// Stub — every operation errors outside Windows.
    #[derive(Debug, Clone, Default)]
    pub struct HyperVHost;

    impl HyperVHost {
        pub fn new() -> Self {
            Self
        }
    }

    macro_rules! unsupported {
        () => {
            bail!("Hyper-V management requires a Windows host with the Hyper-V PowerShell module")
        };
    }

    #[async_trait]
    impl Hypervisor for HyperVHost {
        async fn vm_exists(&self, _name: &str, _host: &str) -> Result<bool> {
            unsupported!()
        }
        async fn force_stop_vm(&self, _name: &str, _host: &str) -> Result<()> {
            unsupported!()
        }
        async fn delete_vm(&self, _name: &str, _host: &str) -> Result<()> {
            unsupported!()
        }
        async fn first_switch(&self, _host: &str) -> Result<String> {
            unsupported!()
        }
        async fn create_vm(&self, _spec: &VmSpec) -> Result<()> {
            unsupported!()
        }
        async fn set_fixed_mac(&self, _name: &str, _host: &str, _mac: &str) -> Result<()> {
            unsupported!()
        }
        async fn attach_data_disk(
            &self,
            _name: &str,
            _host: &str,
            _disk_path: &Path,
            _size_bytes: u64,
        ) -> Result<()> {
            unsupported!()
        }
        async fn start_vm(&self, _name: &str, _host: &str) -> Result<()> {
            unsupported!()
        }
        async fn heartbeat(&self, _name: &str, _host: &str) -> Result<String> {
            unsupported!()
        }
        async fn guest_addresses(&self, _name: &str, _host: &str) -> Result<Vec<String>> {
            unsupported!()
        }
        async fn integration_statuses(
            &self,
            _name: &str,
            _host: &str,
        ) -> Result<Vec<ServiceStatus>> {
            unsupported!()
        }
        async fn mount_disk(&self, _disk_path: &Path) -> Result<PathBuf> {
            unsupported!()
        }
        async fn dismount_disk(&self, _disk_path: &Path) -> Result<()> {
            unsupported!()
        }
    }
}

pub use imp::HyperVHost;
