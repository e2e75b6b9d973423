//! Offline patching of the staged disk.
//!
//! Classic offline servicing: the external patch tool operates directly on
//! the disk file, no VM involved. The tool writes its log files beside the
//! disk; they are relocated into the run's log directory with a `patch`
//! suffix so the seal stage's logs for the same disk never collide.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::provision::logs::relocate_logs;
use crate::provision::{ProvisioningRequest, PATCH_SERVER_PORT};
use crate::tools::{PatchSpec, ServicingTools};

pub struct PatchApplier {
    tools: Arc<dyn ServicingTools>,
}

impl PatchApplier {
    pub fn new(tools: Arc<dyn ServicingTools>) -> Self {
        Self { tools }
    }

    /// Apply the target group's approved patches to the disk in place, then
    /// sweep the tool's logs into the log directory.
    ///
    /// Precondition: the disk is not attached to any VM.
    pub async fn apply_patches(&self, request: &ProvisioningRequest) -> Result<()> {
        let scratch_dir = request.work_dir.join("patch-scratch");
        std::fs::create_dir_all(&scratch_dir)
            .with_context(|| format!("create patch scratch dir {}", scratch_dir.display()))?;

        self.tools
            .apply_patches(&PatchSpec {
                disk_path: request.disk_path.clone(),
                scratch_dir,
                server: request.patch_server.clone(),
                port: PATCH_SERVER_PORT,
                target_group: request.patch_group.clone(),
                content_share: format!(r"\\{}\Content", request.patch_server),
            })
            .await
            .context("offline patching")?;

        if let Some(beside_disk) = request.disk_path.parent() {
            relocate_logs(beside_disk, &request.log_dir, "patch")
                .context("relocate patch tool logs")?;
        }

        info!(
            disk = %request.disk_path.display(),
            server = %request.patch_server,
            group = %request.patch_group,
            "offline patching complete"
        );
        Ok(())
    }
}
