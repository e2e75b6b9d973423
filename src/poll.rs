//! Bounded-timeout polling primitive.
//!
//! Every long wait in the provisioning pipeline (guest heartbeat, address
//! assignment, remote-transport readiness, post-sysprep shutdown) goes
//! through [`wait_until`]: evaluate a probe at a fixed interval until it
//! reports ready or a deadline passes. The probe returns a typed
//! [`Probe`] verdict so "not yet" and "never" are distinct decisions made
//! at the probe site, not inferred from caught errors.
//!
//! Timeouts are never errors here — [`wait_until`] returns
//! [`WaitOutcome::TimedOut`] and the caller decides whether that is fatal
//! for its stage. Only a `Probe::Failed` verdict (a non-retriable
//! configuration problem) aborts the wait with an `Err`.

use std::future::Future;
use std::time::Duration;

use anyhow::bail;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Fixed interval between poll attempts.
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Default deadline for a single bounded wait unless the caller overrides.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(900);

/// One probe evaluation's verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe<T> {
    /// The awaited condition holds; carries the observed value
    /// (e.g. the guest address that became non-empty).
    Ready(T),
    /// Not there yet — includes transient query errors such as the host
    /// being momentarily unreachable while the guest reboots.
    NotYetReady,
    /// Non-retriable problem (malformed input, missing prerequisite).
    /// Aborts the wait immediately.
    Failed(String),
}

/// Final verdict of one [`wait_until`] call. Exactly one per call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome<T> {
    /// The probe reported ready before the deadline.
    Ready(T),
    /// The deadline passed without the probe reporting ready.
    TimedOut,
}

impl<T> WaitOutcome<T> {
    pub fn is_ready(&self) -> bool {
        matches!(self, WaitOutcome::Ready(_))
    }
}

/// Poll `probe` every `poll_interval` until it returns `Ready` or `timeout`
/// elapses.
///
/// The deadline is computed once at call time. On each iteration the
/// deadline is checked first: once `now >= deadline` the call returns
/// `TimedOut` without evaluating the probe again.
///
/// # Errors
///
/// Returns `Err` only when the probe reports [`Probe::Failed`]; a timeout
/// is an `Ok(WaitOutcome::TimedOut)`.
pub async fn wait_until<T, F, Fut>(
    label: &str,
    poll_interval: Duration,
    timeout: Duration,
    mut probe: F,
) -> anyhow::Result<WaitOutcome<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Probe<T>>,
{
    let deadline = Instant::now() + timeout;

    loop {
        if Instant::now() >= deadline {
            warn!(
                wait = label,
                timeout_secs = timeout.as_secs(),
                "wait deadline passed"
            );
            return Ok(WaitOutcome::TimedOut);
        }

        match probe().await {
            Probe::Ready(value) => {
                debug!(wait = label, "condition reached");
                return Ok(WaitOutcome::Ready(value));
            }
            Probe::NotYetReady => {
                debug!(wait = label, "not ready yet");
            }
            Probe::Failed(reason) => {
                bail!("wait '{label}' aborted: {reason}");
            }
        }

        tokio::time::sleep(poll_interval).await;
    }
}
