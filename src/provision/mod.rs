//! Provisioning pipeline for sealed VM disk templates.
//!
//! Takes a raw OS install image to a generalized, reusable template disk:
//! stage the disk, patch it offline, boot a VM from it, establish a remote
//! administrative session, sysprep the guest, and capture the disk while
//! collecting diagnostic logs at every stage.
//!
//! Submodules are the pipeline's stages, leaf-first; shared plain-data types
//! live here. External subsystems (hypervisor, remote transport, servicing
//! tools) are injected as trait objects so every stage can be driven against
//! fakes.

use std::path::PathBuf;
use std::time::Duration;

use crate::poll::{DEFAULT_WAIT_TIMEOUT, POLL_INTERVAL};
use crate::remoting::{Credential, RemoteSession};

pub mod disk;
pub mod lifecycle;
pub mod logs;
pub mod patch;
pub mod pipeline;
pub mod readiness;
pub mod seal;
pub mod sysprep;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Full size quota for the staged boot disk (the file grows dynamically).
pub const DISK_SIZE_BYTES: u64 = 64 * 1024 * 1024 * 1024;

/// Fixed memory allocation for the build VM.
pub const VM_MEMORY_MB: u64 = 4096;

/// The build VM runs on a single virtual processor.
pub const VM_CPU_COUNT: u32 = 1;

/// Port the offline patch tool contacts the patch server on.
pub const PATCH_SERVER_PORT: u16 = 8530;

/// Well-known directory on the staged disk that receives the per-machine
/// configuration payload. Relative to the mount root, with `/` separators
/// (accepted by Windows path APIs as well).
pub const RESOURCE_DIR: &str = "Windows/Setup/Scripts";

// ---------------------------------------------------------------------------
// Shared types used across submodules
// ---------------------------------------------------------------------------

/// Immutable input describing one template build.
///
/// Created once at pipeline start; never mutated.
#[derive(Debug, Clone)]
pub struct ProvisioningRequest {
    /// Source install image (ISO or WIM).
    pub image_path: PathBuf,

    /// Edition selector inside the image.
    pub edition: String,

    /// Directory whose files (answer file, first-boot scripts) are copied
    /// onto the staged disk.
    pub config_dir: PathBuf,

    /// Name of the build VM; unique per host.
    pub machine_name: String,

    /// Administrative credential for the guest.
    pub credential: Credential,

    /// Where the staged boot disk is written and serviced.
    pub disk_path: PathBuf,

    /// Hypervisor host the build VM runs on.
    pub host: String,

    /// Optional fixed hardware address for the VM's network adapter.
    ///
    /// Needed when remote-connection targets are allow-listed by address
    /// rather than domain membership: a fixed MAC gives the guest a
    /// predictable address.
    pub fixed_mac: Option<String>,

    /// Patch server host name.
    pub patch_server: String,

    /// Patch target group whose approved patches are applied.
    pub patch_group: String,

    /// Scratch directory for offline servicing.
    pub work_dir: PathBuf,

    /// Directory collecting diagnostic logs from every stage.
    pub log_dir: PathBuf,

    /// Final destination for the sealed template disk.
    pub template_path: PathBuf,

    /// Sizes (bytes) of extra blank data disks to attach after the boot
    /// disk. Empty for a plain template.
    pub data_disk_sizes: Vec<u64>,
}

/// Identifies one hypervisor-managed VM instance.
///
/// Exactly one handle exists per pipeline run; the sealer destroys the VM
/// once its disk has been captured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmHandle {
    pub name: String,
    pub host: String,
}

/// A booted, reachable, authenticated guest.
///
/// The address is not stable across reboots (unless a fixed MAC was
/// requested), so a fresh `ConnectionInfo` must be established after any VM
/// restart.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub machine_name: String,
    pub address: String,
    pub session: RemoteSession,
}

/// Explicit pipeline policy, threaded through every component constructor.
/// Never ambient.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Interval between poll attempts in every bounded wait.
    pub poll_interval: Duration,

    /// Deadline for each individual bounded wait (boot heartbeat, address
    /// assignment, transport readiness, shutdown-after-sysprep).
    pub wait_timeout: Duration,

    /// Attempt budget for the guest-readiness sequence, which is retried
    /// whole when the guest reboots mid-sequence.
    pub readiness_attempts: u32,

    /// When set, best-effort cleanup failures become fatal instead of being
    /// swallowed.
    pub strict_cleanup: bool,

    /// Per-poll progress logging.
    pub verbose: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            poll_interval: POLL_INTERVAL,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            readiness_attempts: 10,
            strict_cleanup: false,
            verbose: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use disk::{DiskImageStager, MountedDisk};
pub use lifecycle::VmLifecycleController;
pub use patch::PatchApplier;
pub use pipeline::{ProvisioningPipeline, RunReport, StageReport};
pub use readiness::GuestReadinessProbe;
pub use seal::TemplateSealer;
pub use sysprep::SysprepOrchestrator;
