/*!
Stub host collaborators

Each stub records what it was asked to do so tests can assert on it.
*/

use async_trait::async_trait;
use flock_node::fingerprint::{MetadataProvider, SystemInfo};
use flock_node::host::{ApplyRequest, ConfigApplier, TokenIssuer, Verifier};
use flock_node::{FlockError, Result, Role};
use parking_lot::Mutex;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::info;

/// Applier that records requests and can be told to fail
#[derive(Default)]
pub struct RecordingApplier {
    applied: Mutex<Vec<ApplyRequest>>,
    failures_left: AtomicUsize,
}

impl RecordingApplier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` applies fail
    pub fn fail_next(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    pub fn applied(&self) -> Vec<ApplyRequest> {
        self.applied.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.applied.lock().len()
    }
}

#[async_trait]
impl ConfigApplier for RecordingApplier {
    async fn apply(&self, request: &ApplyRequest) -> Result<()> {
        self.applied.lock().push(request.clone());
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            info!("[stub] failing apply for {}", request.role);
            return Err(FlockError::Apply("stub apply failure".into()));
        }
        info!("[stub] applied {} pointing at {}", request.role, request.controller_address);
        Ok(())
    }
}

/// Verifier that records the roles it checked and always passes
#[derive(Default)]
pub struct RecordingVerifier {
    checked: Mutex<Vec<Role>>,
}

impl RecordingVerifier {
    pub fn checked(&self) -> Vec<Role> {
        self.checked.lock().clone()
    }
}

#[async_trait]
impl Verifier for RecordingVerifier {
    async fn verify(&self, role: Role) -> Result<()> {
        self.checked.lock().push(role);
        Ok(())
    }
}

/// Fixed host facts
pub struct StaticMetadata {
    pub info: SystemInfo,
}

impl StaticMetadata {
    pub fn for_addr(addr: IpAddr) -> Self {
        Self {
            info: SystemInfo {
                os: "linux".into(),
                distro: "nixos".into(),
                cpu_cores: 4,
                total_memory_gb: 8.0,
                total_disk_gb: 64.0,
                main_ip: addr.to_string(),
                main_mac: "02:00:00:00:00:01".into(),
            },
        }
    }
}

#[async_trait]
impl MetadataProvider for StaticMetadata {
    async fn system_info(&self) -> Result<SystemInfo> {
        Ok(self.info.clone())
    }
}

/// Issues the same token every time and counts the calls
pub struct StaticTokenIssuer {
    token: String,
    issued: AtomicUsize,
}

impl StaticTokenIssuer {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into(), issued: AtomicUsize::new(0) }
    }

    pub fn issued(&self) -> usize {
        self.issued.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenIssuer for StaticTokenIssuer {
    async fn create(&self, _description: &str, _ttl: Duration) -> Result<String> {
        self.issued.fetch_add(1, Ordering::SeqCst);
        Ok(self.token.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flock_node::TargetRole;

    fn request() -> ApplyRequest {
        ApplyRequest {
            role: TargetRole::Agent,
            token: "t1".into(),
            controller_address: "10.0.0.9".parse().unwrap(),
            cluster_init: false,
        }
    }

    #[tokio::test]
    async fn test_applier_fails_requested_number_of_times() {
        let applier = RecordingApplier::new();
        applier.fail_next(1);
        assert!(applier.apply(&request()).await.is_err());
        assert!(applier.apply(&request()).await.is_ok());
        assert_eq!(applier.count(), 2);
    }
}
