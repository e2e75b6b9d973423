//! Disk staging: image conversion plus the per-machine config payload.
//!
//! [`MountedDisk`] is the scoped-acquisition guard every mount in the crate
//! goes through. A disk left mounted blocks all later operations on the
//! same file, so each mount is paired with exactly one dismount on every
//! exit path: callers run their work, then call `dismount()` and join both
//! results. Dropping a guard without dismounting logs an error — it cannot
//! dismount for you, the hypervisor call is async.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tracing::{error, info};

use crate::hypervisor::Hypervisor;
use crate::provision::{ProvisioningRequest, DISK_SIZE_BYTES, RESOURCE_DIR};
use crate::tools::{ConvertSpec, ServicingTools};

// ---------------------------------------------------------------------------
// MountedDisk
// ---------------------------------------------------------------------------

/// A virtual disk file mounted into the local filesystem.
///
/// Exposes exactly one drive-root mount point for the duration of the
/// mount.
pub struct MountedDisk {
    hypervisor: Arc<dyn Hypervisor>,
    disk_path: PathBuf,
    root: PathBuf,
    dismounted: bool,
}

impl MountedDisk {
    /// Mount `disk_path` and capture the mount point the hypervisor
    /// reports.
    pub async fn mount(hypervisor: Arc<dyn Hypervisor>, disk_path: &Path) -> Result<Self> {
        let root = hypervisor
            .mount_disk(disk_path)
            .await
            .with_context(|| format!("mount disk {}", disk_path.display()))?;

        Ok(Self {
            hypervisor,
            disk_path: disk_path.to_path_buf(),
            root,
            dismounted: false,
        })
    }

    /// Drive root of the mounted volume.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a path relative to the mounted volume's root.
    pub fn path(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    /// Release the mount. Consumes the guard; call on every exit path.
    pub async fn dismount(mut self) -> Result<()> {
        self.dismounted = true;
        self.hypervisor
            .dismount_disk(&self.disk_path)
            .await
            .with_context(|| format!("dismount disk {}", self.disk_path.display()))
    }
}

impl Drop for MountedDisk {
    fn drop(&mut self) {
        if !self.dismounted {
            // Dismounting needs an async hypervisor call, which Drop cannot
            // make. Surface the leak loudly; the disk stays locked until an
            // operator dismounts it.
            error!(
                disk = %self.disk_path.display(),
                "MountedDisk dropped without dismount — disk file is still locked"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// DiskImageStager
// ---------------------------------------------------------------------------

/// Builds the bootable disk: external image conversion, then the config
/// payload copied into the disk's well-known resource directory.
pub struct DiskImageStager {
    hypervisor: Arc<dyn Hypervisor>,
    tools: Arc<dyn ServicingTools>,
}

impl DiskImageStager {
    pub fn new(hypervisor: Arc<dyn Hypervisor>, tools: Arc<dyn ServicingTools>) -> Self {
        Self { hypervisor, tools }
    }

    /// Convert the image and stage the config payload. The disk stays
    /// unattached to any VM throughout.
    ///
    /// # Errors
    ///
    /// Missing inputs (image, config dir, answer file) fail immediately
    /// before any external tool runs. The dismount runs even when the
    /// payload copy fails.
    pub async fn build_disk(&self, request: &ProvisioningRequest) -> Result<()> {
        // Validate eagerly so callers get a clear configuration error.
        if !request.image_path.exists() {
            bail!("source image does not exist: {}", request.image_path.display());
        }
        if !request.config_dir.is_dir() {
            bail!("config directory does not exist: {}", request.config_dir.display());
        }
        let answer_file = request.config_dir.join("unattend.xml");
        if !answer_file.is_file() {
            bail!("answer file missing from config dir: {}", answer_file.display());
        }

        self.tools
            .convert_image(&ConvertSpec {
                image_path: request.image_path.clone(),
                edition: request.edition.clone(),
                output_disk: request.disk_path.clone(),
                size_bytes: DISK_SIZE_BYTES,
                answer_file,
            })
            .await
            .context("image conversion")?;

        let mounted = MountedDisk::mount(self.hypervisor.clone(), &request.disk_path).await?;

        let copy_result = stage_config_payload(&mounted, &request.config_dir);
        let dismount_result = mounted.dismount().await;

        copy_result?;
        dismount_result?;

        info!(
            disk = %request.disk_path.display(),
            machine = %request.machine_name,
            "disk staged"
        );
        Ok(())
    }
}

/// Copy every file from `config_dir` into the disk's resource directory,
/// creating it if absent.
fn stage_config_payload(mounted: &MountedDisk, config_dir: &Path) -> Result<()> {
    let resource_dir = mounted.path(RESOURCE_DIR);
    std::fs::create_dir_all(&resource_dir)
        .with_context(|| format!("create resource directory {}", resource_dir.display()))?;

    let mut copied = 0usize;
    for entry in std::fs::read_dir(config_dir)
        .with_context(|| format!("read config directory {}", config_dir.display()))?
    {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let name = path
            .file_name()
            .with_context(|| format!("config file has no name: {}", path.display()))?;
        let dest = resource_dir.join(name);
        std::fs::copy(&path, &dest)
            .with_context(|| format!("copy {} to {}", path.display(), dest.display()))?;
        copied += 1;
    }

    info!(count = copied, dest = %resource_dir.display(), "config payload staged");
    Ok(())
}
