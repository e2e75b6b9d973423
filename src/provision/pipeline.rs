//! Top-level provisioning driver.
//!
//! A strictly sequential run of named stages, each with logged entry/exit
//! and timing. The first unrecoverable failure aborts the whole run; no
//! template file is published unless every stage completed. A JSON run
//! report lands in the log directory either way, alongside whatever stage
//! logs were collected before the failure.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info};

use crate::hypervisor::Hypervisor;
use crate::provision::lifecycle::MAX_DATA_DISKS;
use crate::provision::{
    DiskImageStager, GuestReadinessProbe, PatchApplier, PipelineOptions, ProvisioningRequest,
    SysprepOrchestrator, TemplateSealer, VmLifecycleController,
};
use crate::remoting::RemoteTransport;
use crate::tools::ServicingTools;

/// File name of the JSON run report written into the log directory.
pub const REPORT_FILE: &str = "vmseal-report.json";

// ---------------------------------------------------------------------------
// Stage names and run report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    StageDisk,
    ApplyPatches,
    CreateAndStartVm,
    GuestReadiness,
    Generalize,
    SealTemplate,
}

impl Stage {
    fn name(self) -> &'static str {
        match self {
            Stage::StageDisk => "stage-disk",
            Stage::ApplyPatches => "apply-patches",
            Stage::CreateAndStartVm => "create-and-start-vm",
            Stage::GuestReadiness => "guest-readiness",
            Stage::Generalize => "generalize",
            Stage::SealTemplate => "seal-template",
        }
    }
}

/// Outcome of one pipeline stage, as recorded in the run report.
#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub stage: String,
    pub outcome: String,
    pub duration_secs: f64,
}

/// Full run record, serialized to [`REPORT_FILE`] at the end of every run,
/// successful or not.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub machine_name: String,
    pub host: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub succeeded: bool,
    pub stages: Vec<StageReport>,
}

impl RunReport {
    fn new(request: &ProvisioningRequest) -> Self {
        Self {
            machine_name: request.machine_name.clone(),
            host: request.host.clone(),
            started_at: Utc::now(),
            finished_at: None,
            succeeded: false,
            stages: Vec::new(),
        }
    }

    fn record<T>(&mut self, stage: Stage, result: &Result<T>, elapsed: std::time::Duration) {
        let outcome = match result {
            Ok(_) => "ok".to_string(),
            Err(e) => format!("failed: {e:#}"),
        };
        self.stages.push(StageReport {
            stage: stage.name().to_string(),
            outcome,
            duration_secs: elapsed.as_secs_f64(),
        });
    }

    fn write_to(&self, log_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(log_dir)
            .with_context(|| format!("create log directory {}", log_dir.display()))?;
        let path = log_dir.join(REPORT_FILE);
        let json = serde_json::to_string_pretty(self).context("serialize run report")?;
        std::fs::write(&path, json)
            .with_context(|| format!("write run report {}", path.display()))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ProvisioningPipeline
// ---------------------------------------------------------------------------

/// Composes the stages into the end-to-end template build.
pub struct ProvisioningPipeline {
    hypervisor: Arc<dyn Hypervisor>,
    transport: Arc<dyn RemoteTransport>,
    tools: Arc<dyn ServicingTools>,
    options: PipelineOptions,
}

impl ProvisioningPipeline {
    pub fn new(
        hypervisor: Arc<dyn Hypervisor>,
        transport: Arc<dyn RemoteTransport>,
        tools: Arc<dyn ServicingTools>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            hypervisor,
            transport,
            tools,
            options,
        }
    }

    /// Run the whole build. Blocking in the pipeline sense: no stage starts
    /// before the previous one completed.
    ///
    /// A run report is written to the request's log directory on every
    /// path. The template file exists at the requested path only on
    /// `Ok`.
    pub async fn run(&self, request: &ProvisioningRequest) -> Result<RunReport> {
        validate_request(request)?;
        std::fs::create_dir_all(&request.log_dir)
            .with_context(|| format!("create log directory {}", request.log_dir.display()))?;
        std::fs::create_dir_all(&request.work_dir)
            .with_context(|| format!("create work directory {}", request.work_dir.display()))?;

        info!(
            machine = %request.machine_name,
            host = %request.host,
            image = %request.image_path.display(),
            "provisioning run started"
        );

        let mut report = RunReport::new(request);
        let outcome = self.execute(request, &mut report).await;
        report.succeeded = outcome.is_ok();
        report.finished_at = Some(Utc::now());

        if let Err(e) = report.write_to(&request.log_dir) {
            // The report is diagnostics; its failure must not mask the
            // run's own outcome.
            error!(error = %e, "failed to write run report");
        }

        match outcome {
            Ok(()) => {
                info!(
                    machine = %request.machine_name,
                    template = %request.template_path.display(),
                    "provisioning run succeeded"
                );
                Ok(report)
            }
            Err(e) => {
                error!(
                    machine = %request.machine_name,
                    host = %request.host,
                    disk = %request.disk_path.display(),
                    error = %e,
                    "provisioning run aborted"
                );
                Err(e)
            }
        }
    }

    async fn execute(&self, request: &ProvisioningRequest, report: &mut RunReport) -> Result<()> {
        let stager = DiskImageStager::new(self.hypervisor.clone(), self.tools.clone());
        let patcher = PatchApplier::new(self.tools.clone());
        let lifecycle = VmLifecycleController::new(self.hypervisor.clone());
        let probe = GuestReadinessProbe::new(
            self.hypervisor.clone(),
            self.transport.clone(),
            self.options.clone(),
        );
        let sysprep = SysprepOrchestrator::new(
            self.hypervisor.clone(),
            self.transport.clone(),
            self.options.clone(),
        );
        let sealer = TemplateSealer::new(
            self.hypervisor.clone(),
            self.tools.clone(),
            self.options.clone(),
        );

        run_stage(report, request, Stage::StageDisk, stager.build_disk(request)).await?;
        run_stage(
            report,
            request,
            Stage::ApplyPatches,
            patcher.apply_patches(request),
        )
        .await?;
        let handle = run_stage(
            report,
            request,
            Stage::CreateAndStartVm,
            lifecycle.create_and_start(request),
        )
        .await?;

        let connection = run_stage(report, request, Stage::GuestReadiness, async {
            match probe.establish(&handle, &request.credential).await? {
                Some(connection) => Ok(connection),
                None => bail!(
                    "guest never became ready after {} attempts",
                    self.options.readiness_attempts
                ),
            }
        })
        .await?;

        run_stage(
            report,
            request,
            Stage::Generalize,
            sysprep.generalize(&handle, &connection),
        )
        .await?;
        run_stage(
            report,
            request,
            Stage::SealTemplate,
            sealer.seal(&handle, request),
        )
        .await?;

        Ok(())
    }
}

/// Time one stage, record it in the report, and wrap failures with the
/// parameters in play so the abort names the stage and machine.
async fn run_stage<T, F>(
    report: &mut RunReport,
    request: &ProvisioningRequest,
    stage: Stage,
    work: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    info!(stage = stage.name(), "stage started");
    let start = Instant::now();
    let result = work.await;
    let elapsed = start.elapsed();
    report.record(stage, &result, elapsed);

    match &result {
        Ok(_) => info!(
            stage = stage.name(),
            duration_secs = elapsed.as_secs_f64(),
            "stage complete"
        ),
        Err(_) => error!(stage = stage.name(), "stage failed"),
    }

    result.with_context(|| {
        format!(
            "stage '{}' failed (machine {}, host {}, disk {})",
            stage.name(),
            request.machine_name,
            request.host,
            request.disk_path.display()
        )
    })
}

/// Reject malformed input before any external operation runs.
fn validate_request(request: &ProvisioningRequest) -> Result<()> {
    if request.machine_name.trim().is_empty() {
        bail!("machine name must not be empty");
    }
    if request.credential.username.trim().is_empty() {
        bail!("administrative credential has no username");
    }
    if request.disk_path.as_os_str().is_empty() {
        bail!("disk path must not be empty");
    }
    if let Some(mac) = &request.fixed_mac {
        // Separators are cosmetic; what remains must be exactly 12 hex
        // digits and nothing else.
        let bare: String = mac.chars().filter(|c| !matches!(c, '-' | ':')).collect();
        if bare.len() != 12 || !bare.chars().all(|c| c.is_ascii_hexdigit()) {
            bail!("fixed hardware address '{mac}' is not 12 hex digits");
        }
    }
    if request.data_disk_sizes.len() > MAX_DATA_DISKS {
        bail!(
            "{} data disks requested; at most {MAX_DATA_DISKS} fit the identifiers d..z",
            request.data_disk_sizes.len()
        );
    }
    Ok(())
}
