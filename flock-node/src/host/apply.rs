//! Applying cluster configuration after adoption
//!
//! Appliers may take minutes and may restart the whole process (a NixOS
//! switch restarts the flock service itself); callers never wait on them
//! from an RPC handler.

use crate::error::{FlockError, Result};
use crate::host::run_command;
use crate::model::{NodeId, TargetRole};
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::info;

const NIXOS_TEMPLATE: &str = include_str!("../../templates/k3s.nix.tmpl");
const K3S_API_PORT: u16 = 6443;

#[derive(Clone, PartialEq, Eq)]
pub struct ApplyRequest {
    pub role: TargetRole,
    pub token: String,
    pub controller_address: IpAddr,
    pub cluster_init: bool,
}

impl fmt::Debug for ApplyRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplyRequest")
            .field("role", &self.role)
            .field("token", &"<redacted>")
            .field("controller_address", &self.controller_address)
            .field("cluster_init", &self.cluster_init)
            .finish()
    }
}

impl ApplyRequest {
    fn server_url(&self) -> String {
        match self.controller_address {
            IpAddr::V4(v4) => format!("https://{}:{}", v4, K3S_API_PORT),
            IpAddr::V6(v6) => format!("https://[{}]:{}", v6, K3S_API_PORT),
        }
    }
}

#[async_trait]
pub trait ConfigApplier: Send + Sync {
    /// Render and apply host configuration for the given role.
    ///
    /// Allowed to terminate the process as part of applying.
    async fn apply(&self, request: &ApplyRequest) -> Result<()>;
}

async fn write_file(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| FlockError::Apply(format!("create {}: {}", parent.display(), e)))?;
    }
    tokio::fs::write(path, content)
        .await
        .map_err(|e| FlockError::Apply(format!("write {}: {}", path.display(), e)))
}

/// Renders a NixOS module and switches to it
#[derive(Debug, Clone)]
pub struct NixosApplier {
    pub module_path: PathBuf,
    pub rebuild_command: Vec<String>,
}

impl NixosApplier {
    pub fn new(module_path: PathBuf) -> Self {
        Self {
            module_path,
            rebuild_command: vec!["nixos-rebuild".to_string(), "switch".to_string()],
        }
    }

    pub fn render(request: &ApplyRequest) -> String {
        let server_addr = if request.cluster_init {
            String::new()
        } else {
            format!("    serverAddr = \"{}\";\n", nix_escape(&request.server_url()))
        };
        NIXOS_TEMPLATE
            .replace("{{role}}", request.role.as_str())
            .replace("{{token}}", &nix_escape(&request.token))
            .replace("{{cluster_init}}", if request.cluster_init { "true" } else { "false" })
            .replace("{{server_addr}}", &server_addr)
    }
}

/// Escape for a double-quoted Nix string
fn nix_escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace("${", "\\${")
}

#[async_trait]
impl ConfigApplier for NixosApplier {
    async fn apply(&self, request: &ApplyRequest) -> Result<()> {
        write_file(&self.module_path, &Self::render(request)).await?;
        info!("Wrote NixOS k3s module to {}", self.module_path.display());

        let (program, args) = self
            .rebuild_command
            .split_first()
            .ok_or_else(|| FlockError::Apply("empty rebuild command".into()))?;

        info!("Applying NixOS configuration... this may take a while.");
        // No timeout: a rebuild runs to completion or restarts us
        let status = Command::new(program)
            .args(args)
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await
            .map_err(|e| FlockError::Apply(format!("failed to run {}: {}", program, e)))?;

        if !status.success() {
            return Err(FlockError::Apply(format!("{} exited with {}", program, status)));
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
struct K3sConfigFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    server: Option<String>,
    token: String,
    node_name: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    cluster_init: bool,
}

/// Writes `/etc/rancher/k3s/config.yaml` and restarts the k3s unit
#[derive(Debug, Clone)]
pub struct K3sConfigApplier {
    pub config_path: PathBuf,
    pub unit: String,
    pub node_name: NodeId,
}

impl K3sConfigApplier {
    pub fn new(config_path: PathBuf, unit: impl Into<String>, node_name: NodeId) -> Self {
        Self { config_path, unit: unit.into(), node_name }
    }

    pub fn render(&self, request: &ApplyRequest) -> Result<String> {
        let file = K3sConfigFile {
            server: (!request.cluster_init).then(|| request.server_url()),
            token: request.token.clone(),
            node_name: self.node_name.to_string(),
            cluster_init: request.cluster_init,
        };
        serde_yaml::to_string(&file).map_err(|e| FlockError::Apply(format!("render k3s config: {}", e)))
    }
}

#[async_trait]
impl ConfigApplier for K3sConfigApplier {
    async fn apply(&self, request: &ApplyRequest) -> Result<()> {
        write_file(&self.config_path, &self.render(request)?).await?;
        info!("Wrote k3s config to {}", self.config_path.display());

        let out = run_command("systemctl", &["restart", &self.unit], Duration::from_secs(120)).await?;
        if !out.success() {
            return Err(FlockError::Apply(format!(
                "restart of {} failed: {}",
                self.unit,
                out.stderr.trim()
            )));
        }
        info!("Restarted {}", self.unit);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent_request() -> ApplyRequest {
        ApplyRequest {
            role: TargetRole::Agent,
            token: "t1".into(),
            controller_address: "10.0.0.9".parse().unwrap(),
            cluster_init: false,
        }
    }

    #[test]
    fn test_render_nixos_agent_module() {
        let module = NixosApplier::render(&agent_request());
        assert!(module.contains("role = \"agent\";"));
        assert!(module.contains("token = \"t1\";"));
        assert!(module.contains("clusterInit = false;"));
        assert!(module.contains("serverAddr = \"https://10.0.0.9:6443\";"));
        assert!(!module.contains("{{"));
    }

    #[test]
    fn test_render_nixos_cluster_init_omits_server() {
        let mut request = agent_request();
        request.role = TargetRole::Server;
        request.cluster_init = true;
        let module = NixosApplier::render(&request);
        assert!(module.contains("role = \"server\";"));
        assert!(module.contains("clusterInit = true;"));
        assert!(!module.contains("serverAddr"));
    }

    #[test]
    fn test_nix_escape() {
        assert_eq!(nix_escape(r#"a"b\c${d}"#), r#"a\"b\\c\${d}"#);
    }

    #[test]
    fn test_render_k3s_config() {
        let applier = K3sConfigApplier::new("/tmp/config.yaml".into(), "k3s", NodeId::new("node-a"));
        let yaml = applier.render(&agent_request()).unwrap();
        assert!(yaml.contains("server: https://10.0.0.9:6443"));
        assert!(yaml.contains("token: t1"));
        assert!(yaml.contains("node-name: node-a"));
        assert!(!yaml.contains("cluster-init"));
    }

    #[test]
    fn test_ipv6_server_url() {
        let mut request = agent_request();
        request.controller_address = "fd00::9".parse().unwrap();
        assert_eq!(request.server_url(), "https://[fd00::9]:6443");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nixos_apply_reports_rebuild_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut applier = NixosApplier::new(dir.path().join("imports/k3s-generated.nix"));
        applier.rebuild_command = vec!["false".to_string()];

        let result = applier.apply(&agent_request()).await;
        assert!(matches!(result, Err(FlockError::Apply(_))));
        // The module is still written before the switch is attempted
        assert!(dir.path().join("imports/k3s-generated.nix").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nixos_apply_success() {
        let dir = tempfile::tempdir().unwrap();
        let mut applier = NixosApplier::new(dir.path().join("k3s-generated.nix"));
        applier.rebuild_command = vec!["true".to_string()];
        applier.apply(&agent_request()).await.unwrap();
    }
}
