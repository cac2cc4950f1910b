//! Hardware and network fingerprinting for advertisements
//!
//! This module handles:
//! - Primary interface detection with priority (Ethernet > WiFi > Other)
//! - CPU, memory and disk totals
//! - Rendering the advertised metadata (`key=value` entries)
//! - Parsing metadata received from other nodes

use crate::error::{FlockError, Result};
use async_trait::async_trait;
use if_addrs::{get_if_addrs, IfAddr};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use sysinfo::{Disks, System};
use tracing::{debug, info, warn};

/// Advertised protocol version
pub const PROTOCOL_VERSION: &str = "1.0";

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Hardware and network facts about this machine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub os: String,
    pub distro: String,
    pub cpu_cores: usize,
    pub total_memory_gb: f64,
    pub total_disk_gb: f64,
    pub main_ip: String,
    pub main_mac: String,
}

/// Interface type classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceType {
    Ethernet,
    Wireless,
    Loopback,
    Other,
}

#[derive(Debug, Clone)]
struct Interface {
    name: String,
    ip: String,
    mac: String,
    kind: InterfaceType,
}

/// Source of the facts advertised by a node
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    async fn system_info(&self) -> Result<SystemInfo>;
}

/// Reads facts from the running host
#[derive(Debug, Default, Clone, Copy)]
pub struct HostMetadataProvider;

#[async_trait]
impl MetadataProvider for HostMetadataProvider {
    async fn system_info(&self) -> Result<SystemInfo> {
        tokio::task::spawn_blocking(SystemInfo::discover)
            .await
            .map_err(|e| FlockError::Metadata(format!("fingerprint task failed: {}", e)))?
    }
}

impl SystemInfo {
    /// Discover complete system information
    pub fn discover() -> Result<Self> {
        debug!("Starting system fingerprint...");

        let mut sys = System::new();
        sys.refresh_cpu();
        sys.refresh_memory();

        let disks = Disks::new_with_refreshed_list();
        let total_disk: u64 = disks.list().iter().map(|d| d.total_space()).sum();

        let primary = primary_interface()?;

        let info = SystemInfo {
            os: std::env::consts::OS.to_string(),
            distro: System::distribution_id(),
            cpu_cores: sys.cpus().len(),
            total_memory_gb: sys.total_memory() as f64 / GIB,
            total_disk_gb: total_disk as f64 / GIB,
            main_ip: primary.ip,
            main_mac: primary.mac,
        };

        info!(
            "Fingerprint complete - {} cores, {:.1} GB RAM, {} ({})",
            info.cpu_cores, info.total_memory_gb, info.main_ip, info.main_mac
        );
        Ok(info)
    }
}

fn primary_interface() -> Result<Interface> {
    let if_addrs = get_if_addrs()
        .map_err(|e| FlockError::Metadata(format!("failed to enumerate interfaces: {}", e)))?;

    let mut interfaces = Vec::new();
    for if_addr in if_addrs {
        if if_addr.is_loopback() {
            continue;
        }
        // Only IPv4 endpoints are advertised as the main address
        let ip = match if_addr.addr {
            IfAddr::V4(v4) => v4.ip.to_string(),
            IfAddr::V6(_) => continue,
        };

        match mac_address::mac_address_by_name(&if_addr.name) {
            Ok(Some(mac)) => {
                let b = mac.bytes();
                interfaces.push(Interface {
                    name: if_addr.name.clone(),
                    ip,
                    mac: format!(
                        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
                        b[0], b[1], b[2], b[3], b[4], b[5]
                    ),
                    kind: classify_interface(&if_addr.name),
                });
            }
            Ok(None) => debug!("No MAC found for interface: {}", if_addr.name),
            Err(e) => debug!("Error getting MAC for {}: {}", if_addr.name, e),
        }
    }

    select_primary(&interfaces)
        .cloned()
        .ok_or_else(|| FlockError::Metadata("no suitable network interface found".into()))
}

/// Classify interface type based on name patterns
pub fn classify_interface(name: &str) -> InterfaceType {
    let name = name.to_lowercase();

    if name == "lo" || name.starts_with("lo0") {
        return InterfaceType::Loopback;
    }
    if name.starts_with("wlan") || name.starts_with("wlp") || name.starts_with("wlo") || name.contains("wifi") {
        return InterfaceType::Wireless;
    }
    if name.starts_with("eth") || name.starts_with("en") {
        return InterfaceType::Ethernet;
    }
    InterfaceType::Other
}

fn select_primary(interfaces: &[Interface]) -> Option<&Interface> {
    let by_kind = |kind| interfaces.iter().find(|i| i.kind == kind);

    if let Some(i) = by_kind(InterfaceType::Ethernet) {
        debug!("Selected Ethernet interface as primary: {}", i.name);
        return Some(i);
    }
    if let Some(i) = by_kind(InterfaceType::Wireless) {
        debug!("Selected WiFi interface as primary: {}", i.name);
        return Some(i);
    }
    let first = interfaces.first();
    if let Some(i) = first {
        warn!("No Ethernet/WiFi found, using first interface: {}", i.name);
    }
    first
}

/// Ordered key/value attributes attached to an advertisement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeMetadata {
    entries: Vec<(String, String)>,
}

impl NodeMetadata {
    pub fn from_info(info: &SystemInfo) -> Self {
        Self {
            entries: vec![
                ("version".into(), PROTOCOL_VERSION.into()),
                ("cpu".into(), info.cpu_cores.to_string()),
                ("distro".into(), info.distro.clone()),
                ("ip".into(), info.main_ip.clone()),
                ("mac".into(), info.main_mac.clone()),
                ("os".into(), info.os.clone()),
                ("disk".into(), format!("{:.6}", info.total_disk_gb)),
                ("mem".into(), format!("{:.6}", info.total_memory_gb)),
            ],
        }
    }

    /// Metadata published when fingerprinting failed
    pub fn degraded(error: &str) -> Self {
        Self {
            entries: vec![
                ("version".into(), PROTOCOL_VERSION.into()),
                ("error".into(), error.to_string()),
            ],
        }
    }

    /// Never fails: a degraded set is still advertised
    pub async fn collect(provider: &dyn MetadataProvider) -> Self {
        match provider.system_info().await {
            Ok(info) => Self::from_info(&info),
            Err(e) => {
                warn!("Failed to get system info: {}", e);
                Self::degraded(&e.to_string())
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn entries(&self) -> &[(String, String)] {
        &self.entries
    }

    pub fn to_text(&self) -> Vec<String> {
        self.entries.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
    }
}

/// Parse `key=value` entries, splitting on the first `=` and dropping the rest
pub fn parse_metadata<S: AsRef<str>>(records: &[S]) -> BTreeMap<String, String> {
    records
        .iter()
        .filter_map(|r| r.as_ref().split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
