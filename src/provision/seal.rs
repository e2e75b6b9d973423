//! Template sealing: offline cleanup of the captured disk and archival.
//!
//! Runs only after the guest has generalized itself and powered off. The
//! VM shell is deleted first (its disk file stays), then the disk is
//! mounted for offline cleanup: guest logs out, machine-unique and
//! transient state removed, component store compacted, volume
//! defragmented. The dismount runs on every path once the mount has
//! succeeded, and the disk is copied to its template destination only when
//! every fatal step completed.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tracing::{debug, info};

use crate::hypervisor::Hypervisor;
use crate::provision::disk::MountedDisk;
use crate::provision::logs::{copy_logs_with_suffix, relocate_logs};
use crate::provision::{PipelineOptions, ProvisioningRequest, VmHandle};
use crate::tools::ServicingTools;

/// Guest directories whose log files are preserved before cleanup. Each
/// contributes its last path component as the disambiguating suffix.
const GUEST_LOG_DIRS: &[&str] = &[
    "Windows/Panther",
    "Windows/Debug",
    "Windows/Logs/DISM",
];

/// Known-transient guest paths removed best-effort. Any of these may
/// legitimately be absent; failures are swallowed per path.
const TRANSIENT_PATHS: &[&str] = &[
    "Windows/SoftwareDistribution/Download",
    "Windows/Temp",
    "Windows/Panther",
    "Windows/Logs/CBS",
    "Windows/WinSxS/ManifestCache",
    "Windows/Prefetch",
];

/// User profile directories that survive sealing.
const KEPT_PROFILES: &[&str] = &["Default", "Default User", "Public"];

pub struct TemplateSealer {
    hypervisor: Arc<dyn Hypervisor>,
    tools: Arc<dyn ServicingTools>,
    options: PipelineOptions,
}

impl TemplateSealer {
    pub fn new(
        hypervisor: Arc<dyn Hypervisor>,
        tools: Arc<dyn ServicingTools>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            hypervisor,
            tools,
            options,
        }
    }

    /// Seal the powered-off machine's disk into a template.
    ///
    /// Precondition: the guest is generalized and off. Postcondition on
    /// success: the VM shell is gone, the disk is clean and dismounted, and
    /// a copy exists at the request's template path.
    pub async fn seal(&self, handle: &VmHandle, request: &ProvisioningRequest) -> Result<()> {
        self.hypervisor
            .delete_vm(&handle.name, &handle.host)
            .await
            .with_context(|| format!("delete VM shell {} on {}", handle.name, handle.host))?;

        // Mount failure aborts before any cleanup starts.
        let mounted = MountedDisk::mount(self.hypervisor.clone(), &request.disk_path).await?;

        let cleanup_result = self.clean_mounted_disk(&mounted, request).await;
        let dismount_result = mounted.dismount().await;

        cleanup_result?;
        dismount_result?;

        archive_disk(&request.disk_path, &request.template_path)?;

        info!(
            template = %request.template_path.display(),
            vm = %handle.name,
            "template sealed"
        );
        Ok(())
    }

    /// Cleanup steps against the mounted disk. Each is fatal except the
    /// declared best-effort transient-path removals.
    async fn clean_mounted_disk(
        &self,
        mounted: &MountedDisk,
        request: &ProvisioningRequest,
    ) -> Result<()> {
        collect_guest_logs(mounted, &request.log_dir)?;
        remove_paging_file(mounted)?;
        remove_user_profiles(mounted)?;
        remove_event_logs(mounted)?;

        self.tools
            .component_cleanup(mounted.root())
            .await
            .context("offline component-store cleanup")?;

        self.remove_transient_paths(mounted)?;

        // Sweep anything external tools left beside the disk file during
        // this stage, deleting the disk-side copies.
        if let Some(beside_disk) = request.disk_path.parent() {
            relocate_logs(beside_disk, &request.log_dir, "seal")
                .context("relocate stray logs beside disk")?;
        }

        // The volume must still be mounted for this.
        self.tools
            .defragment(mounted.root())
            .await
            .context("defragment sealed volume")?;

        Ok(())
    }

    /// One declared list of optional cleanup operations, each swallowing
    /// its own failure. `strict_cleanup` promotes failures to fatal.
    fn remove_transient_paths(&self, mounted: &MountedDisk) -> Result<()> {
        for relative in TRANSIENT_PATHS {
            let target = mounted.path(relative);
            match remove_path(&target) {
                Ok(removed) => {
                    if removed {
                        debug!(path = %target.display(), "transient path removed");
                    }
                }
                Err(e) if self.options.strict_cleanup => {
                    return Err(e)
                        .with_context(|| format!("remove transient path {}", target.display()));
                }
                Err(e) => {
                    debug!(path = %target.display(), error = %e, "transient path removal skipped");
                }
            }
        }
        Ok(())
    }
}

/// Preserve guest setup/installation logs, suffixed with their source
/// subdirectory.
fn collect_guest_logs(mounted: &MountedDisk, log_dir: &Path) -> Result<()> {
    for guest_dir in GUEST_LOG_DIRS {
        let source = mounted.path(guest_dir);
        let suffix = guest_dir
            .rsplit('/')
            .next()
            .unwrap_or(guest_dir)
            .to_ascii_lowercase();
        copy_logs_with_suffix(&source, log_dir, &suffix)
            .with_context(|| format!("collect guest logs from {}", source.display()))?;
    }
    Ok(())
}

/// Delete the paging file. Its attributes are cleared first; with them set
/// the delete is refused.
fn remove_paging_file(mounted: &MountedDisk) -> Result<()> {
    let paging_file = mounted.path("pagefile.sys");
    if !paging_file.exists() {
        debug!("no paging file on disk");
        return Ok(());
    }

    let metadata = std::fs::metadata(&paging_file)
        .with_context(|| format!("stat paging file {}", paging_file.display()))?;
    let mut permissions = metadata.permissions();
    if permissions.readonly() {
        #[allow(clippy::permissions_set_readonly_false)]
        permissions.set_readonly(false);
        std::fs::set_permissions(&paging_file, permissions)
            .with_context(|| format!("clear attributes on {}", paging_file.display()))?;
    }

    std::fs::remove_file(&paging_file)
        .with_context(|| format!("remove paging file {}", paging_file.display()))?;
    info!("paging file removed");
    Ok(())
}

/// Delete every per-user profile directory except the defaults the
/// template must keep.
fn remove_user_profiles(mounted: &MountedDisk) -> Result<()> {
    let users_dir = mounted.path("Users");
    if !users_dir.is_dir() {
        debug!("no Users directory on disk");
        return Ok(());
    }

    for entry in std::fs::read_dir(&users_dir)
        .with_context(|| format!("read {}", users_dir.display()))?
    {
        let path = entry?.path();
        if !path.is_dir() {
            continue;
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if KEPT_PROFILES.iter().any(|kept| kept.eq_ignore_ascii_case(&name)) {
            continue;
        }

        std::fs::remove_dir_all(&path)
            .with_context(|| format!("remove profile {}", path.display()))?;
        info!(profile = %name, "user profile removed");
    }
    Ok(())
}

/// Delete all event-log files.
fn remove_event_logs(mounted: &MountedDisk) -> Result<()> {
    let logs_dir = mounted.path("Windows/System32/winevt/Logs");
    if !logs_dir.is_dir() {
        debug!("no event-log directory on disk");
        return Ok(());
    }

    let mut removed = 0usize;
    for entry in std::fs::read_dir(&logs_dir)
        .with_context(|| format!("read {}", logs_dir.display()))?
    {
        let path = entry?.path();
        if path.is_file() {
            std::fs::remove_file(&path)
                .with_context(|| format!("remove event log {}", path.display()))?;
            removed += 1;
        }
    }
    info!(count = removed, "event logs removed");
    Ok(())
}

/// Remove a file or directory tree. `Ok(false)` when the path was already
/// absent.
fn remove_path(path: &Path) -> std::io::Result<bool> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };

    if metadata.is_dir() {
        std::fs::remove_dir_all(path)?;
    } else {
        std::fs::remove_file(path)?;
    }
    Ok(true)
}

/// Copy the finished disk to its template destination.
fn archive_disk(disk_path: &Path, template_path: &Path) -> Result<()> {
    if !disk_path.is_file() {
        bail!("sealed disk file missing: {}", disk_path.display());
    }
    if let Some(parent) = template_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create template directory {}", parent.display()))?;
    }
    std::fs::copy(disk_path, template_path).with_context(|| {
        format!(
            "copy {} to template destination {}",
            disk_path.display(),
            template_path.display()
        )
    })?;
    Ok(())
}
