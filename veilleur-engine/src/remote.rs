//! Remote command execution and credentials.
//!
//! One collaborator serves the shutdown command, the remote update
//! strategies and the load/inventory collection: run a script block on a
//! target host under a remoting credential. The default implementation
//! shells out to PowerShell remoting with a per-command timeout; tests
//! substitute scripted executors.

use crate::error::EngineError;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::debug;

/// Remoting credential. The secret never reaches logs or serialized
/// output.
#[derive(Clone)]
pub struct Credential {
    pub username: String,
    secret: String,
}

impl Credential {
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: secret.into(),
        }
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("secret", &"***")
            .finish()
    }
}

/// Supplies the remoting credential. Acquisition mechanics stay outside
/// the engine; a missing credential is a fatal configuration error.
pub trait CredentialProvider: Send + Sync {
    fn credential(&self) -> Result<Credential, EngineError>;
}

/// OS keyring entry with an environment fallback for headless runs.
pub struct KeyringCredentials {
    service: String,
    username: String,
}

impl KeyringCredentials {
    pub fn new(service: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            username: username.into(),
        }
    }
}

impl CredentialProvider for KeyringCredentials {
    fn credential(&self) -> Result<Credential, EngineError> {
        if let Ok(secret) = std::env::var("VEILLEUR_REMOTE_PASSWORD") {
            return Ok(Credential::new(&self.username, secret));
        }
        let entry = keyring::Entry::new(&self.service, &self.username)
            .map_err(|e| EngineError::Configuration(format!("keyring unavailable: {e}")))?;
        let secret = entry.get_password().map_err(|e| {
            EngineError::Configuration(format!(
                "no remoting credential for '{}': {e}",
                self.username
            ))
        })?;
        Ok(Credential::new(&self.username, secret))
    }
}

/// Output of one remote (or local) command.
#[derive(Debug, Clone, Serialize)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub execution_time_ms: u128,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run a script block on `host` under `credential`. Errors here are
    /// always caught at the per-host boundary by the orchestrators.
    async fn run(
        &self,
        host: &str,
        credential: &Credential,
        script: &str,
    ) -> Result<ExecOutput, EngineError>;
}

/// PowerShell remoting executor: wraps the script block in an
/// `Invoke-Command` against the target. The credential secret travels
/// through the child environment, never through the command line.
pub struct PowerShellExecutor {
    timeout: Duration,
}

impl PowerShellExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn shell() -> &'static str {
        if cfg!(target_os = "windows") {
            "powershell"
        } else {
            "pwsh"
        }
    }
}

#[async_trait]
impl RemoteExecutor for PowerShellExecutor {
    async fn run(
        &self,
        host: &str,
        credential: &Credential,
        script: &str,
    ) -> Result<ExecOutput, EngineError> {
        let wrapper = format!(
            "$sec = ConvertTo-SecureString $env:VEILLEUR_EXEC_SECRET -AsPlainText -Force; \
             $cred = New-Object System.Management.Automation.PSCredential($env:VEILLEUR_EXEC_USER, $sec); \
             Invoke-Command -ComputerName '{host}' -Credential $cred -ScriptBlock {{ {script} }}"
        );
        debug!("remote exec on {}: {} bytes of script", host, script.len());

        let start = Instant::now();
        let child = Command::new(Self::shell())
            .args(["-NoProfile", "-NonInteractive", "-Command", &wrapper])
            .env("VEILLEUR_EXEC_USER", &credential.username)
            .env("VEILLEUR_EXEC_SECRET", credential.secret())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output();

        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| {
                EngineError::remote(host, format!("command timed out after {:?}", self.timeout))
            })?
            .map_err(|e| EngineError::remote(host, e.to_string()))?;

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
            execution_time_ms: start.elapsed().as_millis(),
        })
    }
}

/// Run a script block in-process on the orchestrating machine. Used when
/// an update strategy targets the local host.
pub async fn run_local(script: &str, timeout: Duration) -> Result<ExecOutput, EngineError> {
    let start = Instant::now();
    let child = Command::new(PowerShellExecutor::shell())
        .args(["-NoProfile", "-NonInteractive", "-Command", script])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output();

    let output = tokio::time::timeout(timeout, child)
        .await
        .map_err(|_| EngineError::remote("localhost", format!("command timed out after {timeout:?}")))?
        .map_err(|e| EngineError::remote("localhost", e.to_string()))?;

    Ok(ExecOutput {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        exit_code: output.status.code().unwrap_or(-1),
        execution_time_ms: start.elapsed().as_millis(),
    })
}

/// Does `target` resolve to the orchestrating machine itself? Decides
/// in-process versus remote dispatch for the update strategies.
pub fn is_local_host(target: &str) -> bool {
    let target = target.trim().to_ascii_lowercase();
    if target == "localhost" || target == "127.0.0.1" || target == "::1" {
        return true;
    }
    let local = gethostname::gethostname().to_string_lossy().to_ascii_lowercase();
    // Match both the short name and the FQDN form.
    target == local || target.split('.').next() == local.split('.').next()
}
