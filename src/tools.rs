//! External servicing tools invoked by the pipeline.
//!
//! Four opaque operations live behind the [`ServicingTools`] trait: the
//! image-to-disk converter, the offline patch tool, offline component-store
//! cleanup, and volume defragmentation. Each is an external collaborator
//! with known pre/postconditions — the pipeline never looks inside them,
//! and tests substitute a fake that records the calls.
//!
//! # Platform gating
//!
//! The production implementation shells out to Windows tooling
//! (`Convert-WindowsImage.ps1`, the offline patch installer, `dism.exe`,
//! `defrag.exe`) and is compiled only on Windows; elsewhere a stub errors.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

// ---------------------------------------------------------------------------
// Shared types (available on all platforms)
// ---------------------------------------------------------------------------

/// Inputs for one image-to-disk conversion.
#[derive(Debug, Clone)]
pub struct ConvertSpec {
    /// Source install image (ISO or WIM).
    pub image_path: PathBuf,
    /// Edition selector inside the image (e.g. `ServerStandardCore`).
    pub edition: String,
    /// Where the bootable disk file is written.
    pub output_disk: PathBuf,
    /// Full disk size quota in bytes.
    pub size_bytes: u64,
    /// Unattended answer file embedded into the disk.
    pub answer_file: PathBuf,
}

/// Inputs for one offline patch run against a disk file.
#[derive(Debug, Clone)]
pub struct PatchSpec {
    /// Disk file to service; no VM may have it attached.
    pub disk_path: PathBuf,
    /// Scratch directory the tool mounts into.
    pub scratch_dir: PathBuf,
    /// Patch server host name.
    pub server: String,
    /// Patch server port.
    pub port: u16,
    /// Target group whose approved patches are applied.
    pub target_group: String,
    /// UNC share holding patch content.
    pub content_share: String,
}

/// External tool operations the pipeline delegates to.
#[async_trait]
pub trait ServicingTools: Send + Sync {
    /// Convert a source image into a bootable, dynamically-growing,
    /// GPT-partitioned disk file with the answer file embedded.
    async fn convert_image(&self, spec: &ConvertSpec) -> anyhow::Result<()>;

    /// Apply approved patches to the disk in place (offline servicing).
    /// The tool drops its log files beside the disk; the caller relocates
    /// them afterwards.
    async fn apply_patches(&self, spec: &PatchSpec) -> anyhow::Result<()>;

    /// Offline component-store cleanup with supersede removal against a
    /// mounted disk. Irreversible: superseded updates can no longer be
    /// uninstalled from the resulting template.
    async fn component_cleanup(&self, mount_root: &Path) -> anyhow::Result<()>;

    /// Defragment the mounted volume with whichever facility is available.
    async fn defragment(&self, mount_root: &Path) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// Windows implementation
// ---------------------------------------------------------------------------

#[cfg(windows)]
mod imp {
    use std::path::{Path, PathBuf};

    use anyhow::{Context, Result, bail};
    use async_trait::async_trait;
    use tokio::process::Command;
    use tracing::{info, warn};

    use super::{ConvertSpec, PatchSpec, ServicingTools};

    /// Production tool driver.
    ///
    /// Tool locations are plain fields so the CLI can point at non-default
    /// installs; `Default` picks the conventional paths.
    #[derive(Debug, Clone)]
    pub struct WindowsServicingTools {
        /// Path to `Convert-WindowsImage.ps1`.
        pub converter_script: PathBuf,
        /// Path to the offline patch installer executable.
        pub patch_tool: PathBuf,
    }

    impl Default for WindowsServicingTools {
        fn default() -> Self {
            Self {
                converter_script: PathBuf::from(
                    r"C:\Program Files\WindowsImageTools\Convert-WindowsImage.ps1",
                ),
                patch_tool: PathBuf::from(
                    r"C:\Program Files\OfflinePatch\UpdateInstaller.exe",
                ),
            }
        }
    }

    async fn run_tool(program: &str, args: &[String], label: &str) -> Result<()> {
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .with_context(|| format!("failed to spawn `{program}` for: {label}"))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "`{program}` failed (exit {}) during {label}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            );
        }
        Ok(())
    }

    #[async_trait]
    impl ServicingTools for WindowsServicingTools {
        async fn convert_image(&self, spec: &ConvertSpec) -> Result<()> {
            if !self.converter_script.exists() {
                bail!(
                    "converter script not found: {}",
                    self.converter_script.display()
                );
            }

            info!(
                image = %spec.image_path.display(),
                edition = %spec.edition,
                disk = %spec.output_disk.display(),
                "converting install image to bootable disk"
            );

            // Dynamic VHDX, GPT layout, boot-from-VM (UEFI), answer file
            // embedded — the constants the template format requires.
            let script = format!(
                ". '{converter}'; Convert-WindowsImage \
                 -SourcePath '{image}' -Edition '{edition}' -VHDPath '{disk}' \
                 -SizeBytes {size} -VHDFormat VHDX -DiskLayout UEFI \
                 -UnattendPath '{answer}'",
                converter = self.converter_script.display(),
                image = spec.image_path.display(),
                edition = spec.edition,
                disk = spec.output_disk.display(),
                size = spec.size_bytes,
                answer = spec.answer_file.display(),
            );
            run_tool(
                "powershell.exe",
                &[
                    "-NoProfile".to_string(),
                    "-NonInteractive".to_string(),
                    "-Command".to_string(),
                    script,
                ],
                "image conversion",
            )
            .await
        }

        async fn apply_patches(&self, spec: &PatchSpec) -> Result<()> {
            if !self.patch_tool.exists() {
                bail!("patch tool not found: {}", self.patch_tool.display());
            }

            info!(
                disk = %spec.disk_path.display(),
                server = %spec.server,
                port = spec.port,
                group = %spec.target_group,
                "applying patches offline"
            );

            run_tool(
                &self.patch_tool.to_string_lossy(),
                &[
                    format!("/disk:{}", spec.disk_path.display()),
                    format!("/scratch:{}", spec.scratch_dir.display()),
                    format!("/server:{}:{}", spec.server, spec.port),
                    format!("/group:{}", spec.target_group),
                    format!("/content:{}", spec.content_share),
                ],
                "offline patching",
            )
            .await
        }

        async fn component_cleanup(&self, mount_root: &Path) -> Result<()> {
            info!(mount = %mount_root.display(), "offline component-store cleanup");
            run_tool(
                "dism.exe",
                &[
                    format!("/Image:{}", mount_root.display()),
                    "/Cleanup-Image".to_string(),
                    "/StartComponentCleanup".to_string(),
                    "/ResetBase".to_string(),
                ],
                "component-store cleanup",
            )
            .await
        }

        async fn defragment(&self, mount_root: &Path) -> Result<()> {
            // defrag.exe wants a drive designator; fall back to
            // Optimize-Volume when defrag.exe is unavailable.
            let drive = mount_root
                .to_string_lossy()
                .trim_end_matches('\\')
                .to_string();

            let direct = run_tool(
                "defrag.exe",
                &[drive.clone(), "/O".to_string()],
                "volume defragmentation",
            )
            .await;

            match direct {
                Ok(()) => Ok(()),
                Err(e) => {
                    warn!(error = %e, "defrag.exe unavailable, trying Optimize-Volume");
                    let letter = drive.trim_end_matches(':').to_string();
                    run_tool(
                        "powershell.exe",
                        &[
                            "-NoProfile".to_string(),
                            "-NonInteractive".to_string(),
                            "-Command".to_string(),
                            format!("Optimize-Volume -DriveLetter '{letter}' -Defrag"),
                        ],
                        "volume defragmentation (Optimize-Volume)",
                    )
                    .await
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Non-Windows stub
// ---------------------------------------------------------------------------

#[cfg(not(windows))]
mod imp {
    use std::path::Path;

    use anyhow::{Result, bail};
    use async_trait::async_trait;

    use super::{ConvertSpec, PatchSpec, ServicingTools};

    /// Stub — every operation errors outside Windows.
    #[derive(Debug, Clone, Default)]
    pub struct WindowsServicingTools;

    #[async_trait]
    impl ServicingTools for WindowsServicingTools {
        async fn convert_image(&self, _spec: &ConvertSpec) -> Result<()> {
            bail!("image conversion requires Windows servicing tools")
        }
        async fn apply_patches(&self, _spec: &PatchSpec) -> Result<()> {
            bail!("offline patching requires Windows servicing tools")
        }
        async fn component_cleanup(&self, _mount_root: &Path) -> Result<()> {
            bail!("component-store cleanup requires Windows servicing tools")
        }
        async fn defragment(&self, _mount_root: &Path) -> Result<()> {
            bail!("volume defragmentation requires Windows servicing tools")
        }
    }
}

pub use imp::WindowsServicingTools;
