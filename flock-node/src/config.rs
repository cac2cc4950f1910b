//! Configuration management
//!
//! Handles:
//! - Node identity and RPC port
//! - Discovery channels, timings and retry policy
//! - Adoption credentials (operator-supplied or issued per session)
//! - Provisioning backend selection

use crate::discovery::mdns::check_channel;
use crate::discovery::Channel;
use crate::error::{FlockError, Result};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming an explicit config file
pub const CONFIG_ENV: &str = "FLOCK_CONFIG";
/// Environment variable carrying the operator-supplied join token
pub const TOKEN_ENV: &str = "FLOCK_CLUSTER_TOKEN";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FlockConfig {
    pub node: NodeConfig,
    pub discovery: DiscoveryConfig,
    pub adoption: AdoptionConfig,
    pub survival: SurvivalConfig,
    pub provision: ProvisionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub port: u16,
    /// Overrides the hostname-derived node id
    pub node_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// DNS-SD service types, e.g. `_flock-pending._tcp`
    pub pending_channel: Channel,
    pub controller_channel: Channel,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdoptionConfig {
    /// Operator-supplied join token; issued per session when absent
    #[serde(skip_serializing)]
    pub cluster_token: Option<String>,
    pub token_ttl_secs: u64,
    pub rpc_timeout_secs: u64,
    /// Address pushed to adopted nodes; detected when absent
    pub controller_address: Option<IpAddr>,
    pub outbound_probe: String,
    pub heartbeat_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SurvivalConfig {
    pub interval_secs: u64,
    pub probe_timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApplierKind {
    Nixos,
    K3sConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionConfig {
    pub applier: ApplierKind,
    pub nixos_module_path: PathBuf,
    pub k3s_config_path: PathBuf,
    pub k3s_binary: String,
    pub k3s_unit: String,
    /// Marker expected in `uname -a`, e.g. "NixOS"
    pub expected_distribution: Option<String>,
    pub verify_strict: bool,
    /// Initialize a new cluster when a controller finds no working k3s server
    pub bootstrap_controller: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self { port: 9000, node_id: None }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            pending_channel: Channel::new("_flock-pending._tcp"),
            controller_channel: Channel::new("_flock-ctrl._tcp"),
            retry: RetryPolicy::default(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 10_000,
        }
    }
}

impl Default for AdoptionConfig {
    fn default() -> Self {
        Self {
            cluster_token: None,
            token_ttl_secs: 3600,
            rpc_timeout_secs: 10,
            controller_address: None,
            outbound_probe: "8.8.8.8:80".to_string(),
            heartbeat_interval_secs: 30,
        }
    }
}

impl Default for SurvivalConfig {
    fn default() -> Self {
        Self { interval_secs: 10, probe_timeout_secs: 5 }
    }
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            applier: ApplierKind::Nixos,
            nixos_module_path: PathBuf::from("/etc/nixos/imports/k3s-generated.nix"),
            k3s_config_path: PathBuf::from("/etc/rancher/k3s/config.yaml"),
            k3s_binary: "k3s".to_string(),
            k3s_unit: "k3s".to_string(),
            expected_distribution: None,
            verify_strict: false,
            bootstrap_controller: false,
        }
    }
}

// Token stays out of logs
impl std::fmt::Debug for AdoptionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdoptionConfig")
            .field("cluster_token", &self.cluster_token.as_ref().map(|_| "<redacted>"))
            .field("token_ttl_secs", &self.token_ttl_secs)
            .field("rpc_timeout_secs", &self.rpc_timeout_secs)
            .field("controller_address", &self.controller_address)
            .field("outbound_probe", &self.outbound_probe)
            .field("heartbeat_interval_secs", &self.heartbeat_interval_secs)
            .finish()
    }
}

impl RetryPolicy {
    /// Delay before the given retry (0-based), doubling up to the cap
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let ms = self.initial_backoff_ms.saturating_mul(factor).min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

impl AdoptionConfig {
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

impl SurvivalConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

impl FlockConfig {
    /// Load config from an explicit path, `FLOCK_CONFIG`, or the OS config dir
    pub async fn load(explicit: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let path = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => match std::env::var(CONFIG_ENV) {
                Ok(path) => Some(PathBuf::from(path)),
                Err(_) => Self::config_file_path(),
            },
        };

        let mut config = match path {
            Some(path) if path.exists() => {
                let content = tokio::fs::read_to_string(&path).await?;
                Self::from_toml(&content)
                    .map_err(|e| FlockError::Config(format!("{}: {}", path.display(), e)))?
            }
            Some(path) if explicit.is_some() => {
                return Err(FlockError::Config(format!("{} does not exist", path.display())));
            }
            _ => Self::default(),
        };

        if let Ok(token) = std::env::var(TOKEN_ENV) {
            if !token.trim().is_empty() {
                config.adoption.cluster_token = Some(token.trim().to_string());
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Get OS-specific config file path
    pub fn config_file_path() -> Option<PathBuf> {
        let mut path = dirs::config_dir()?;
        path.push("flock");
        path.push("config.toml");
        Some(path)
    }

    pub fn validate(&self) -> Result<()> {
        if self.discovery.pending_channel == self.discovery.controller_channel {
            return Err(FlockError::Config(
                "pending and controller channels must differ".into(),
            ));
        }
        check_channel(&self.discovery.pending_channel)?;
        check_channel(&self.discovery.controller_channel)?;

        if self.node.port == 0 {
            return Err(FlockError::Config("node port must be set".into()));
        }
        if self.discovery.retry.attempts == 0 {
            return Err(FlockError::Config("discovery retry needs at least one attempt".into()));
        }

        // Periods feed tokio intervals and timeouts, which need a non-zero duration
        let periods = [
            ("survival.interval_secs", self.survival.interval_secs),
            ("survival.probe_timeout_secs", self.survival.probe_timeout_secs),
            ("adoption.heartbeat_interval_secs", self.adoption.heartbeat_interval_secs),
            ("adoption.rpc_timeout_secs", self.adoption.rpc_timeout_secs),
            ("adoption.token_ttl_secs", self.adoption.token_ttl_secs),
        ];
        if let Some((name, _)) = periods.iter().find(|(_, value)| *value == 0) {
            return Err(FlockError::Config(format!("{} must be positive", name)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = FlockConfig::default();
        assert_eq!(config.node.port, 9000);
        assert_eq!(config.survival.interval(), Duration::from_secs(10));
        assert_eq!(config.survival.probe_timeout(), Duration::from_secs(5));
        assert_eq!(config.provision.applier, ApplierKind::Nixos);
        assert!(config.adoption.cluster_token.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = FlockConfig::from_toml(
            r#"
            [node]
            node_id = "rack-3"

            [adoption]
            cluster_token = "t1"
            controller_address = "10.0.0.9"

            [provision]
            applier = "k3s-config"
            "#,
        )
        .unwrap();

        assert_eq!(config.node.node_id.as_deref(), Some("rack-3"));
        assert_eq!(config.node.port, 9000);
        assert_eq!(config.adoption.cluster_token.as_deref(), Some("t1"));
        assert_eq!(config.adoption.controller_address, Some("10.0.0.9".parse().unwrap()));
        assert_eq!(config.adoption.rpc_timeout_secs, 10);
        assert_eq!(config.provision.applier, ApplierKind::K3sConfig);
        assert_eq!(config.discovery.pending_channel.as_str(), "_flock-pending._tcp");
    }

    #[test]
    fn test_validate_rejects_same_channels() {
        let mut config = FlockConfig::default();
        config.discovery.controller_channel = config.discovery.pending_channel.clone();
        assert!(matches!(config.validate(), Err(FlockError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_periods() {
        let cases: [fn(&mut FlockConfig); 5] = [
            |c| c.survival.interval_secs = 0,
            |c| c.survival.probe_timeout_secs = 0,
            |c| c.adoption.heartbeat_interval_secs = 0,
            |c| c.adoption.rpc_timeout_secs = 0,
            |c| c.adoption.token_ttl_secs = 0,
        ];
        for zero_out in cases {
            let mut config = FlockConfig::default();
            zero_out(&mut config);
            let err = config.validate().unwrap_err();
            assert!(matches!(&err, FlockError::Config(msg) if msg.ends_with("must be positive")), "{}", err);
        }
    }

    #[test]
    fn test_validate_rejects_unusable_discovery() {
        let mut config = FlockConfig::default();
        config.discovery.controller_channel = Channel::new("_flock-controller._tcp");
        assert!(matches!(config.validate(), Err(FlockError::Config(_))));

        let mut config = FlockConfig::default();
        config.discovery.retry.attempts = 0;
        assert!(matches!(config.validate(), Err(FlockError::Config(_))));

        let mut config = FlockConfig::default();
        config.node.port = 0;
        assert!(matches!(config.validate(), Err(FlockError::Config(_))));
    }

    #[tokio::test]
    async fn test_load_rejects_zero_survival_interval() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flock.toml");
        tokio::fs::write(&path, "[survival]\ninterval_secs = 0\n").await.unwrap();
        assert!(matches!(FlockConfig::load(Some(&path)).await, Err(FlockError::Config(_))));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy { attempts: 5, initial_backoff_ms: 500, max_backoff_ms: 3000 };
        assert_eq!(policy.backoff(0), Duration::from_millis(500));
        assert_eq!(policy.backoff(1), Duration::from_millis(1000));
        assert_eq!(policy.backoff(2), Duration::from_millis(2000));
        assert_eq!(policy.backoff(3), Duration::from_millis(3000));
        assert_eq!(policy.backoff(40), Duration::from_millis(3000));
    }

    #[test]
    fn test_debug_redacts_token() {
        let mut config = FlockConfig::default();
        config.adoption.cluster_token = Some("K10secret".into());
        let printed = format!("{:?}", config);
        assert!(!printed.contains("K10secret"));
    }

    #[tokio::test]
    async fn test_load_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flock.toml");
        tokio::fs::write(&path, "[survival]\ninterval_secs = 30\n").await.unwrap();

        let config = FlockConfig::load(Some(&path)).await.unwrap();
        assert_eq!(config.survival.interval_secs, 30);
        assert_eq!(config.survival.probe_timeout_secs, 5);
    }

    #[tokio::test]
    async fn test_load_missing_explicit_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(matches!(FlockConfig::load(Some(&path)).await, Err(FlockError::Config(_))));
    }
}
