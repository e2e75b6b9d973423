//! vmseal: build a sealed VM disk template from an install image.
//!
//! Drives the provisioning pipeline end to end against a Hyper-V host:
//! stage a disk, patch it offline, boot it, sysprep the guest, seal and
//! archive the disk. See the `provision` module for the stage breakdown.
//!
//! The administrative password is never taken as a flag — set
//! `VMSEAL_ADMIN_PASSWORD` in the environment.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde::Deserialize;

use vmseal::hypervisor::HyperVHost;
use vmseal::provision::{PipelineOptions, ProvisioningPipeline, ProvisioningRequest};
use vmseal::remoting::{Credential, WinRmTransport};
use vmseal::tools::WindowsServicingTools;

/// Sealed VM template builder
#[derive(Parser, Debug)]
#[command(name = "vmseal", version, about = "Build a sealed VM disk template")]
struct Args {
    /// TOML request file; replaces the per-field flags below
    #[arg(long, conflicts_with_all = ["image", "name"])]
    request_file: Option<PathBuf>,

    /// Source install image (ISO or WIM)
    #[arg(long, required_unless_present = "request_file")]
    image: Option<PathBuf>,

    /// Edition selector inside the image
    #[arg(long, default_value = "ServerStandard")]
    edition: String,

    /// Directory with unattend.xml and first-boot payload
    #[arg(long, default_value = "config")]
    config_dir: PathBuf,

    /// Build VM name
    #[arg(long, required_unless_present = "request_file")]
    name: Option<String>,

    /// Administrative user inside the guest
    #[arg(long, default_value = "Administrator")]
    admin_user: String,

    /// Staged boot disk path
    #[arg(long, required_unless_present = "request_file")]
    disk: Option<PathBuf>,

    /// Hypervisor host
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Fixed hardware address for the VM's network adapter
    #[arg(long)]
    mac: Option<String>,

    /// Patch server host name
    #[arg(long, required_unless_present = "request_file")]
    patch_server: Option<String>,

    /// Patch target group
    #[arg(long, default_value = "Templates")]
    patch_group: String,

    /// Scratch directory
    #[arg(long, default_value = "work")]
    work_dir: PathBuf,

    /// Directory collecting stage logs
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,

    /// Destination for the sealed template disk
    #[arg(long, required_unless_present = "request_file")]
    template: Option<PathBuf>,

    /// Extra blank data disk size in bytes; repeatable
    #[arg(long = "data-disk-size")]
    data_disk_sizes: Vec<u64>,

    /// Per-wait timeout in seconds
    #[arg(long, default_value_t = 900)]
    timeout_secs: u64,

    /// Treat best-effort cleanup failures as fatal
    #[arg(long)]
    strict_cleanup: bool,

    /// Per-poll progress logging
    #[arg(short, long)]
    verbose: bool,
}

/// TOML shape of `--request-file`. The password still comes from the
/// environment, never from the file.
#[derive(Debug, Deserialize)]
struct RequestFile {
    image: PathBuf,
    #[serde(default = "default_edition")]
    edition: String,
    config_dir: PathBuf,
    name: String,
    #[serde(default = "default_admin_user")]
    admin_user: String,
    disk: PathBuf,
    host: String,
    mac: Option<String>,
    patch_server: String,
    #[serde(default = "default_patch_group")]
    patch_group: String,
    work_dir: PathBuf,
    log_dir: PathBuf,
    template: PathBuf,
    #[serde(default)]
    data_disk_sizes: Vec<u64>,
}

fn default_edition() -> String {
    "ServerStandard".to_string()
}

fn default_admin_user() -> String {
    "Administrator".to_string()
}

fn default_patch_group() -> String {
    "Templates".to_string()
}

fn admin_password() -> Result<String> {
    std::env::var("VMSEAL_ADMIN_PASSWORD")
        .context("VMSEAL_ADMIN_PASSWORD is not set — the guest credential needs it")
}

fn build_request(args: &Args) -> Result<ProvisioningRequest> {
    let password = admin_password()?;

    if let Some(path) = &args.request_file {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read request file {}", path.display()))?;
        let file: RequestFile = toml::from_str(&raw)
            .with_context(|| format!("parse request file {}", path.display()))?;

        return Ok(ProvisioningRequest {
            image_path: file.image,
            edition: file.edition,
            config_dir: file.config_dir,
            machine_name: file.name,
            credential: Credential::new(file.admin_user, password),
            disk_path: file.disk,
            host: file.host,
            fixed_mac: file.mac,
            patch_server: file.patch_server,
            patch_group: file.patch_group,
            work_dir: file.work_dir,
            log_dir: file.log_dir,
            template_path: file.template,
            data_disk_sizes: file.data_disk_sizes,
        });
    }

    let (Some(image), Some(name), Some(disk), Some(patch_server), Some(template)) = (
        args.image.clone(),
        args.name.clone(),
        args.disk.clone(),
        args.patch_server.clone(),
        args.template.clone(),
    ) else {
        bail!("--image, --name, --disk, --patch-server and --template are required without --request-file");
    };

    Ok(ProvisioningRequest {
        image_path: image,
        edition: args.edition.clone(),
        config_dir: args.config_dir.clone(),
        machine_name: name,
        credential: Credential::new(args.admin_user.clone(), password),
        disk_path: disk,
        host: args.host.clone(),
        fixed_mac: args.mac.clone(),
        patch_server,
        patch_group: args.patch_group.clone(),
        work_dir: args.work_dir.clone(),
        log_dir: args.log_dir.clone(),
        template_path: template,
        data_disk_sizes: args.data_disk_sizes.clone(),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let request = build_request(&args)?;

    let _log_guard = vmseal::logging::init(&request.log_dir);

    let options = PipelineOptions {
        wait_timeout: Duration::from_secs(args.timeout_secs),
        strict_cleanup: args.strict_cleanup,
        verbose: args.verbose,
        ..PipelineOptions::default()
    };

    let pipeline = ProvisioningPipeline::new(
        Arc::new(HyperVHost::new()),
        Arc::new(WinRmTransport::new()),
        Arc::new(WindowsServicingTools::default()),
        options,
    );

    let report = pipeline.run(&request).await?;

    println!(
        "template sealed: {} ({} stages, {:.0}s)",
        request.template_path.display(),
        report.stages.len(),
        report
            .stages
            .iter()
            .map(|s| s.duration_secs)
            .sum::<f64>()
    );
    Ok(())
}
