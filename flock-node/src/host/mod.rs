//! Host-side collaborators
//!
//! Everything that touches the operating system beyond sockets lives here:
//! - Configuration apply (NixOS module or plain k3s config)
//! - Join token issuance through the k3s CLI
//! - Post-install verification over a per-OS `HostInspector`

pub mod apply;
pub mod token;
pub mod verify;

use crate::error::{FlockError, Result};
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

pub use apply::{ApplyRequest, ConfigApplier, K3sConfigApplier, NixosApplier};
pub use token::{K3sTokenIssuer, TokenIssuer, TokenSource};
pub use verify::{K3sVerifier, Verifier};

/// Captured result of a host command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Run a program with arguments (no shell), bounded by `timeout`.
///
/// A program still running at the deadline is killed.
pub async fn run_command(program: &str, args: &[&str], timeout: Duration) -> Result<CommandOutput> {
    debug!("Executing: {} {}", program, args.join(" "));
    let output = tokio::time::timeout(
        timeout,
        Command::new(program)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output(),
    )
    .await
    .map_err(|_| FlockError::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, format!("{} timed out", program))))??;

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        exit_code: output.status.code().unwrap_or(-1),
    })
}

const INSPECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Read-only view of host state used by verification
#[async_trait]
pub trait HostInspector: Send + Sync {
    /// Unit state as reported by the service manager, e.g. "active"
    async fn service_state(&self, unit: &str) -> Result<String>;
    /// Full command line of the first process matching `name`
    async fn process_command_line(&self, name: &str) -> Result<Option<String>>;
    /// Listing of the firewall chain holding user-opened ports
    async fn firewall_rules(&self) -> Result<String>;
    /// Kernel/distribution banner, `uname -a` style
    async fn system_banner(&self) -> Result<String>;
    fn file_exists(&self, path: &Path) -> bool;
}

/// systemd + iptables hosts (NixOS keeps opened ports in `nixos-fw`)
#[derive(Debug, Clone)]
pub struct LinuxInspector {
    pub firewall_chain: String,
}

impl Default for LinuxInspector {
    fn default() -> Self {
        Self { firewall_chain: "nixos-fw".to_string() }
    }
}

#[async_trait]
impl HostInspector for LinuxInspector {
    async fn service_state(&self, unit: &str) -> Result<String> {
        // `is-active` exits non-zero for inactive units but still prints the state
        let out = run_command("systemctl", &["is-active", unit], INSPECT_TIMEOUT).await?;
        Ok(out.stdout.trim().to_string())
    }

    async fn process_command_line(&self, name: &str) -> Result<Option<String>> {
        let out = run_command("pgrep", &["-a", name], INSPECT_TIMEOUT).await?;
        if !out.success() {
            return Ok(None);
        }
        Ok(out.stdout.lines().next().map(str::to_string))
    }

    async fn firewall_rules(&self) -> Result<String> {
        let out = run_command("iptables", &["-L", &self.firewall_chain, "-n"], INSPECT_TIMEOUT).await?;
        if !out.success() {
            return Err(FlockError::Verification(vec![format!(
                "could not inspect iptables chain {} (are you root?): {}",
                self.firewall_chain,
                out.stderr.trim()
            )]));
        }
        Ok(out.stdout)
    }

    async fn system_banner(&self) -> Result<String> {
        let out = run_command("uname", &["-a"], INSPECT_TIMEOUT).await?;
        Ok(out.stdout.trim().to_string())
    }

    fn file_exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

/// Platforms without an inspector implementation
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedInspector;

impl UnsupportedInspector {
    fn unsupported<T>() -> Result<T> {
        Err(FlockError::Verification(vec![format!(
            "host inspection is not supported on {}",
            std::env::consts::OS
        )]))
    }
}

#[async_trait]
impl HostInspector for UnsupportedInspector {
    async fn service_state(&self, _unit: &str) -> Result<String> {
        Self::unsupported()
    }

    async fn process_command_line(&self, _name: &str) -> Result<Option<String>> {
        Self::unsupported()
    }

    async fn firewall_rules(&self) -> Result<String> {
        Self::unsupported()
    }

    async fn system_banner(&self) -> Result<String> {
        Self::unsupported()
    }

    fn file_exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

/// Inspector for the platform this binary was built for
pub fn host_inspector() -> Box<dyn HostInspector> {
    if cfg!(target_os = "linux") {
        Box::new(LinuxInspector::default())
    } else {
        Box::new(UnsupportedInspector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unsupported_inspector_reports_error() {
        let inspector = UnsupportedInspector;
        assert!(matches!(inspector.service_state("k3s").await, Err(FlockError::Verification(_))));
        assert!(inspector.process_command_line("k3s").await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_command_captures_exit_code() {
        let ok = run_command("sh", &["-c", "echo hello"], Duration::from_secs(5)).await.unwrap();
        assert!(ok.success());
        assert_eq!(ok.stdout.trim(), "hello");

        let failed = run_command("sh", &["-c", "exit 3"], Duration::from_secs(5)).await.unwrap();
        assert_eq!(failed.exit_code, 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_command_kills_program_on_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("finished");
        let script = format!("sleep 1; touch {}", marker.display());

        let result = run_command("sh", &["-c", &script], Duration::from_millis(100)).await;
        assert!(matches!(result, Err(FlockError::Io(ref e)) if e.kind() == std::io::ErrorKind::TimedOut));

        tokio::time::sleep(Duration::from_millis(1800)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_run_command_missing_binary() {
        let result = run_command("definitely-not-a-flock-binary", &[], Duration::from_secs(5)).await;
        assert!(matches!(result, Err(FlockError::Io(_))));
    }
}
