//! Guest generalization and the shutdown wait that follows it.
//!
//! Sysprep strips machine-specific identity from the guest so the disk can
//! be cloned. The generalize command ends with the guest powering itself
//! off; the host-side signal for "fully off" is every guest-integration
//! service reporting an empty status. A guest mid-shutdown shows a mix of
//! empty and still-reporting services, so the wait checks all of them, not
//! just one — and this poll is deliberately distinct from the boot
//! heartbeat poll, which only looks at a single service.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tracing::{debug, info};

use crate::hypervisor::Hypervisor;
use crate::poll::{Probe, WaitOutcome, wait_until};
use crate::provision::{ConnectionInfo, PipelineOptions, VmHandle};
use crate::remoting::RemoteTransport;

/// Generalize command run inside the guest. `/shutdown` makes the guest
/// power itself off when sealing completes.
const SYSPREP_COMMAND: &str =
    r"C:\Windows\System32\Sysprep\sysprep.exe /generalize /oobe /quiet /shutdown";

pub struct SysprepOrchestrator {
    hypervisor: Arc<dyn Hypervisor>,
    transport: Arc<dyn RemoteTransport>,
    options: PipelineOptions,
}

impl SysprepOrchestrator {
    pub fn new(
        hypervisor: Arc<dyn Hypervisor>,
        transport: Arc<dyn RemoteTransport>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            hypervisor,
            transport,
            options,
        }
    }

    /// Run generalization through the established session, then wait for
    /// the guest to power off.
    ///
    /// # Errors
    ///
    /// Fatal when the generalize command fails to launch or the power-off
    /// is not observed within the configured timeout.
    pub async fn generalize(&self, handle: &VmHandle, connection: &ConnectionInfo) -> Result<()> {
        info!(
            vm = %handle.name,
            address = %connection.address,
            "generalizing guest"
        );

        self.transport
            .run(&connection.session, SYSPREP_COMMAND, "sysprep generalize")
            .await
            .context("run sysprep in guest")?;

        self.wait_stopped(handle).await
    }

    /// Poll integration-service statuses until every one reports empty.
    async fn wait_stopped(&self, handle: &VmHandle) -> Result<()> {
        let hypervisor = self.hypervisor.clone();
        let name = handle.name.clone();
        let host = handle.host.clone();

        let outcome = wait_until(
            "post-sysprep shutdown",
            self.options.poll_interval,
            self.options.wait_timeout,
            move || {
                let hypervisor = hypervisor.clone();
                let name = name.clone();
                let host = host.clone();
                async move {
                    match hypervisor.integration_statuses(&name, &host).await {
                        Ok(statuses) => {
                            let reporting: Vec<&str> = statuses
                                .iter()
                                .filter(|s| !s.is_silent())
                                .map(|s| s.service.as_str())
                                .collect();
                            if reporting.is_empty() {
                                Probe::Ready(())
                            } else {
                                debug!(
                                    vm = %name,
                                    still_reporting = ?reporting,
                                    "guest still shutting down"
                                );
                                Probe::NotYetReady
                            }
                        }
                        Err(e) => {
                            debug!(vm = %name, error = %e, "integration status query errored");
                            Probe::NotYetReady
                        }
                    }
                }
            },
        )
        .await?;

        match outcome {
            WaitOutcome::Ready(()) => {
                info!(vm = %handle.name, "guest powered off after generalization");
                Ok(())
            }
            WaitOutcome::TimedOut => bail!(
                "guest {} did not power off within {}s after sysprep",
                handle.name,
                self.options.wait_timeout.as_secs()
            ),
        }
    }
}
