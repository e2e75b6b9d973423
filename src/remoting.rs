//! Remote administration transport for the guest OS.
//!
//! The sysprep stage needs to run commands inside a booted guest. That goes
//! through the [`RemoteTransport`] trait: a reachability probe, an
//! authenticated session open, and command execution over the session. The
//! production implementation targets WinRM via `powershell.exe`
//! (`Test-WSMan` / `Invoke-Command`); tests substitute a scripted fake.
//!
//! A guest address is not stable across reboots, so a [`RemoteSession`] is
//! only valid until the next VM restart — the readiness probe re-establishes
//! one after every reboot it observes.
//!
//! # Platform gating
//!
//! Full implementation on Windows only; elsewhere a stub returns an
//! explanatory error so the crate compiles and fake-backed tests run.

use std::fmt;

use async_trait::async_trait;

// ---------------------------------------------------------------------------
// Shared types (available on all platforms)
// ---------------------------------------------------------------------------

/// Administrative credential for the guest.
#[derive(Clone)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

impl Credential {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

// Manual impl so the password never lands in logs or error chains.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// An authenticated session with one guest at one address.
///
/// Invalidated by any guest reboot; obtain a fresh one via the readiness
/// probe afterwards.
#[derive(Debug, Clone)]
pub struct RemoteSession {
    /// Opaque identifier, for log correlation only.
    pub id: String,
    /// Guest address the session was opened against.
    pub address: String,
    credential: Credential,
}

impl RemoteSession {
    /// Assemble a session handle. Transport implementations call this after
    /// their own authentication succeeded.
    pub fn new(id: impl Into<String>, address: impl Into<String>, credential: Credential) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            credential,
        }
    }

    /// Credential the session authenticates with.
    pub fn credential(&self) -> &Credential {
        &self.credential
    }
}

/// Remote command-execution transport between the build host and a guest.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// `true` when the remote-administration service at `address` answers.
    /// A refused or dropped probe is `Ok(false)`, not an error — the guest
    /// may simply still be booting.
    async fn is_reachable(&self, address: &str) -> anyhow::Result<bool>;

    /// Open an authenticated session. Errors here are expected during
    /// first-boot reboot cycles and are absorbed by the readiness retry loop.
    async fn open_session(
        &self,
        address: &str,
        credential: &Credential,
    ) -> anyhow::Result<RemoteSession>;

    /// Run `command` inside the guest over `session`.
    /// Non-zero guest exit status is an error.
    async fn run(&self, session: &RemoteSession, command: &str, label: &str)
        -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// Windows implementation (WinRM via powershell.exe)
// ---------------------------------------------------------------------------

#[cfg(windows)]
mod imp {
    use anyhow::{Context, Result, bail};
    use async_trait::async_trait;
    use tokio::process::Command;
    use tracing::{debug, info};

    use super::{Credential, RemoteSession, RemoteTransport};

    /// WinRM transport driving `powershell.exe` on the build machine.
    #[derive(Debug, Clone, Default)]
    pub struct WinRmTransport;

    impl WinRmTransport {
        pub fn new() -> Self {
            Self
        }
    }

    /// PowerShell preamble binding `$cred` to the guest credential.
    ///
    /// Single quotes in the secret are doubled — the PowerShell single-quote
    /// escape — so arbitrary passwords survive the trip.
    fn credential_preamble(credential: &Credential) -> String {
        let user = credential.username.replace('\'', "''");
        let pass = credential.password.replace('\'', "''");
        format!(
            "$pw = ConvertTo-SecureString '{pass}' -AsPlainText -Force; \
             $cred = New-Object System.Management.Automation.PSCredential('{user}', $pw); "
        )
    }

    async fn ps(script: &str, label: &str) -> Result<String> {
        let output = Command::new("powershell.exe")
            .args(["-NoProfile", "-NonInteractive", "-Command", script])
            .output()
            .await
            .with_context(|| format!("failed to spawn powershell.exe for: {label}"))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "remote operation '{label}' failed (exit {}): {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    #[async_trait]
    impl RemoteTransport for WinRmTransport {
        async fn is_reachable(&self, address: &str) -> Result<bool> {
            let script = format!(
                "Test-WSMan -ComputerName '{address}' -ErrorAction SilentlyContinue | Out-Null; $?"
            );
            match ps(&script, "WinRM reachability probe").await {
                Ok(out) => Ok(out.eq_ignore_ascii_case("true")),
                Err(e) => {
                    debug!(address, error = %e, "reachability probe errored");
                    Ok(false)
                }
            }
        }

        async fn open_session(
            &self,
            address: &str,
            credential: &Credential,
        ) -> Result<RemoteSession> {
            // Authenticate with a trivial remote command; WinRM sessions do
            // not outlive a powershell.exe invocation, so each later `run`
            // re-presents the credential.
            let script = format!(
                "{preamble}Invoke-Command -ComputerName '{address}' -Credential $cred \
                 -ScriptBlock {{ $env:COMPUTERNAME }}",
                preamble = credential_preamble(credential),
            );
            let guest_name = ps(&script, "open remote session").await?;

            let session = RemoteSession::new(
                format!("{address}/{guest_name}"),
                address,
                credential.clone(),
            );
            info!(session = %session.id, "remote session established");
            Ok(session)
        }

        async fn run(&self, session: &RemoteSession, command: &str, label: &str) -> Result<()> {
            info!(session = %session.id, label, "run remote command");
            let script = format!(
                "{preamble}Invoke-Command -ComputerName '{address}' -Credential $cred \
                 -ScriptBlock {{ {command}; if ($LASTEXITCODE -and $LASTEXITCODE -ne 0) \
                 {{ exit $LASTEXITCODE }} }}",
                preamble = credential_preamble(session.credential()),
                address = session.address,
            );
            ps(&script, label).await?;
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Non-Windows stub
// ---------------------------------------------------------------------------

#[cfg(not(windows))]
mod imp {
    use anyhow::{Result, bail};
    use async_trait::async_trait;

    use super::{Credential, RemoteSession, RemoteTransport};

    /// Stub — every operation errors outside Windows.
    #[derive(Debug, Clone, Default)]
    pub struct WinRmTransport;

    impl WinRmTransport {
        pub fn new() -> Self {
            Self
        }
    }

    #[async_trait]
    impl RemoteTransport for WinRmTransport {
        async fn is_reachable(&self, _address: &str) -> Result<bool> {
            bail!("WinRM remoting requires a Windows build host")
        }

        async fn open_session(
            &self,
            _address: &str,
            _credential: &Credential,
        ) -> Result<RemoteSession> {
            bail!("WinRM remoting requires a Windows build host")
        }

        async fn run(
            &self,
            _session: &RemoteSession,
            _command: &str,
            _label: &str,
        ) -> Result<()> {
            bail!("WinRM remoting requires a Windows build host")
        }
    }
}

pub use imp::WinRmTransport;
