//! Guest readiness: from "VM started" to an authenticated remote session.
//!
//! Three bounded waits followed by session establishment, the whole
//! sequence retried from the top when any part fails:
//!
//! ```text
//! attempt (×10 max)
//!   ├─ heartbeat wait    guest-integration heartbeat reports OK
//!   ├─ address wait      first non-empty reported network address
//!   ├─ transport wait    remote-administration service answers there
//!   └─ session open      authenticated session against that address
//! ```
//!
//! A guest running first-boot initialization can reboot between any two of
//! these, invalidating the address or dropping the half-open session. Those
//! failures are expected: the attempt is abandoned and the sequence
//! restarts at the heartbeat, never from partial state. Individual poll
//! errors (host momentarily unreachable) count as "not yet ready", never as
//! fatal.

use std::sync::Arc;

use anyhow::{Result, bail};
use tracing::{debug, info, warn};

use crate::hypervisor::Hypervisor;
use crate::poll::{Probe, WaitOutcome, wait_until};
use crate::provision::{ConnectionInfo, PipelineOptions, VmHandle};
use crate::remoting::{Credential, RemoteTransport};

pub struct GuestReadinessProbe {
    hypervisor: Arc<dyn Hypervisor>,
    transport: Arc<dyn RemoteTransport>,
    options: PipelineOptions,
}

impl GuestReadinessProbe {
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

    /// Establish an authenticated session with the booted guest.
    ///
    /// Makes up to `options.readiness_attempts` full-sequence attempts.
    /// Returns `Ok(None)` when the budget is exhausted — the caller decides
    /// that is fatal; this function never propagates a per-attempt failure.
    pub async fn establish(
        &self,
        handle: &VmHandle,
        credential: &Credential,
    ) -> Result<Option<ConnectionInfo>> {
        for attempt in 1..=self.options.readiness_attempts {
            debug!(
                vm = %handle.name,
                attempt,
                max_attempts = self.options.readiness_attempts,
                "guest readiness attempt"
            );

            match self.attempt(handle, credential).await {
                Ok(connection) => {
                    info!(
                        vm = %handle.name,
                        address = %connection.address,
                        attempt,
                        "guest ready — session established"
                    );
                    return Ok(Some(connection));
                }
                Err(e) => {
                    warn!(
                        vm = %handle.name,
                        attempt,
                        error = %e,
                        "readiness attempt failed — retrying from heartbeat"
                    );
                }
            }
        }

        warn!(
            vm = %handle.name,
            attempts = self.options.readiness_attempts,
            "readiness retry budget exhausted — no session"
        );
        Ok(None)
    }

    /// One full readiness sequence. Any error abandons the attempt.
    async fn attempt(&self, handle: &VmHandle, credential: &Credential) -> Result<ConnectionInfo> {
        self.wait_heartbeat(handle).await?;
        let address = self.wait_address(handle).await?;
        self.wait_transport(&address).await?;

        let session = self.transport.open_session(&address, credential).await?;

        Ok(ConnectionInfo {
            machine_name: handle.name.clone(),
            address,
            session,
        })
    }

    async fn wait_heartbeat(&self, handle: &VmHandle) -> Result<()> {
        let hypervisor = self.hypervisor.clone();
        let name = handle.name.clone();
        let host = handle.host.clone();
        let verbose = self.options.verbose;

        let outcome = wait_until(
            "guest heartbeat",
            self.options.poll_interval,
            self.options.wait_timeout,
            move || {
                let hypervisor = hypervisor.clone();
                let name = name.clone();
                let host = host.clone();
                async move {
                    match hypervisor.heartbeat(&name, &host).await {
                        Ok(status) if status.starts_with("Ok") => Probe::Ready(()),
                        Ok(status) => {
                            if verbose {
                                debug!(vm = %name, status = %status, "heartbeat not OK yet");
                            }
                            Probe::NotYetReady
                        }
                        Err(e) => {
                            debug!(vm = %name, error = %e, "heartbeat query errored");
                            Probe::NotYetReady
                        }
                    }
                }
            },
        )
        .await?;

        match outcome {
            WaitOutcome::Ready(()) => Ok(()),
            WaitOutcome::TimedOut => bail!(
                "guest heartbeat for {} not OK within {}s",
                handle.name,
                self.options.wait_timeout.as_secs()
            ),
        }
    }

    /// Wait until the VM reports at least one network address; takes the
    /// first.
    async fn wait_address(&self, handle: &VmHandle) -> Result<String> {
        let hypervisor = self.hypervisor.clone();
        let name = handle.name.clone();
        let host = handle.host.clone();

        let outcome = wait_until(
            "guest network address",
            self.options.poll_interval,
            self.options.wait_timeout,
            move || {
                let hypervisor = hypervisor.clone();
                let name = name.clone();
                let host = host.clone();
                async move {
                    match hypervisor.guest_addresses(&name, &host).await {
                        Ok(addresses) => match addresses.into_iter().next() {
                            Some(first) => Probe::Ready(first),
                            None => Probe::NotYetReady,
                        },
                        Err(e) => {
                            debug!(vm = %name, error = %e, "address query errored");
                            Probe::NotYetReady
                        }
                    }
                }
            },
        )
        .await?;

        match outcome {
            WaitOutcome::Ready(address) => Ok(address),
            WaitOutcome::TimedOut => bail!(
                "no network address reported for {} within {}s",
                handle.name,
                self.options.wait_timeout.as_secs()
            ),
        }
    }

    async fn wait_transport(&self, address: &str) -> Result<()> {
        let transport = self.transport.clone();
        let address_owned = address.to_string();

        let outcome = wait_until(
            "remote transport",
            self.options.poll_interval,
            self.options.wait_timeout,
            move || {
                let transport = transport.clone();
                let address = address_owned.clone();
                async move {
                    match transport.is_reachable(&address).await {
                        Ok(true) => Probe::Ready(()),
                        Ok(false) => Probe::NotYetReady,
                        Err(e) => {
                            debug!(address = %address, error = %e, "transport probe errored");
                            Probe::NotYetReady
                        }
                    }
                }
            },
        )
        .await?;

        match outcome {
            WaitOutcome::Ready(()) => Ok(()),
            WaitOutcome::TimedOut => bail!(
                "remote transport at {address} not reachable within {}s",
                self.options.wait_timeout.as_secs()
            ),
        }
    }
}
