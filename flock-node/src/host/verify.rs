//! Post-install health checks
//!
//! Every check runs even when an earlier one failed; the caller gets the
//! full list of problems in one `FlockError::Verification`.

use crate::error::{FlockError, Result};
use crate::host::HostInspector;
use crate::model::Role;
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::{debug, info};

const API_PORT_MARKER: &str = "dpt:6443";

#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(&self, role: Role) -> Result<()>;
}

pub struct K3sVerifier {
    inspector: Box<dyn HostInspector>,
    pub unit: String,
    pub process: String,
    pub config_path: PathBuf,
    pub expected_distribution: Option<String>,
}

impl K3sVerifier {
    pub fn new(inspector: Box<dyn HostInspector>, unit: impl Into<String>, config_path: PathBuf) -> Self {
        Self {
            inspector,
            unit: unit.into(),
            process: "k3s".to_string(),
            config_path,
            expected_distribution: None,
        }
    }

    pub fn with_expected_distribution(mut self, marker: Option<String>) -> Self {
        self.expected_distribution = marker;
        self
    }

    async fn check_service(&self, failures: &mut Vec<String>) {
        match self.inspector.service_state(&self.unit).await {
            Ok(state) if state == "active" => debug!("{} service is active", self.unit),
            Ok(state) => failures.push(format!("{} service is not active (state: {})", self.unit, state)),
            Err(e) => failures.push(format!("could not query {} service: {}", self.unit, e)),
        }
    }

    async fn check_distribution(&self, failures: &mut Vec<String>) {
        let Some(marker) = &self.expected_distribution else {
            return;
        };
        match self.inspector.system_banner().await {
            Ok(banner) if banner.contains(marker.as_str()) => {}
            Ok(banner) => failures.push(format!("system does not look like {} ({})", marker, banner)),
            Err(e) => failures.push(format!("could not read system banner: {}", e)),
        }
    }

    async fn check_process(&self, role: Role, failures: &mut Vec<String>) {
        if !self.inspector.file_exists(&self.config_path) {
            failures.push(format!("config file {} is missing", self.config_path.display()));
        }

        let cmdline = match self.inspector.process_command_line(&self.process).await {
            Ok(Some(cmdline)) => cmdline,
            Ok(None) => {
                failures.push(format!("{} process is not running", self.process));
                return;
            }
            Err(e) => {
                failures.push(format!("could not inspect {} process: {}", self.process, e));
                return;
            }
        };

        let config_flag = format!("--config {}", self.config_path.display());
        if !cmdline.contains(&config_flag) {
            failures.push(format!("{} process is not using {}", self.process, self.config_path.display()));
        }

        let expected = match role {
            Role::Controller => Some("server"),
            Role::Compute => Some("agent"),
            Role::Pending => None,
        };
        if let Some(arg) = expected {
            if !cmdline.split_whitespace().any(|a| a == arg) {
                failures.push(format!("{} process is not running as {}", self.process, arg));
            }
        }
    }

    async fn check_firewall(&self, failures: &mut Vec<String>) {
        match self.inspector.firewall_rules().await {
            Ok(rules) => {
                let open = rules
                    .lines()
                    .any(|line| line.contains(API_PORT_MARKER) && line.contains("tcp"));
                if !open {
                    failures.push("firewall does not allow 6443/tcp".to_string());
                }
            }
            Err(e) => failures.push(e.to_string()),
        }
    }
}

#[async_trait]
impl Verifier for K3sVerifier {
    async fn verify(&self, role: Role) -> Result<()> {
        if role == Role::Pending {
            return Ok(());
        }
        let mut failures = Vec::new();

        self.check_service(&mut failures).await;
        self.check_distribution(&mut failures).await;
        self.check_process(role, &mut failures).await;
        if role == Role::Controller {
            self.check_firewall(&mut failures).await;
        }

        if failures.is_empty() {
            info!("Verification passed for {}", role);
            Ok(())
        } else {
            Err(FlockError::Verification(failures))
        }
    }
}
