//! Shared node and RPC types
//!
//! Wire messages for the adoption service live here alongside the node's
//! identity so both the service and the pusher speak the same structures.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Stable node identifier, derived from the hostname
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive the identifier from this machine's hostname
    pub fn from_hostname() -> Self {
        Self(gethostname::gethostname().to_string_lossy().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Node role, owned by the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Pending,
    Controller,
    Compute,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Pending => f.write_str("PENDING"),
            Role::Controller => f.write_str("CONTROLLER"),
            Role::Compute => f.write_str("COMPUTE"),
        }
    }
}

/// Role pushed by a controller, in cluster-runtime vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetRole {
    Server,
    Agent,
}

impl TargetRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetRole::Server => "server",
            TargetRole::Agent => "agent",
        }
    }

    /// Node role a target ends up in once adopted
    pub fn node_role(&self) -> Role {
        match self {
            TargetRole::Server => Role::Controller,
            TargetRole::Agent => Role::Compute,
        }
    }
}

impl fmt::Display for TargetRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub id: NodeId,
    pub port: u16,
}

impl NodeIdentity {
    pub fn new(id: NodeId, port: u16) -> Self {
        Self { id, port }
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdoptRequest {
    pub cluster_token: String,
    pub controller_address: IpAddr,
    pub role: TargetRole,
}

// Never print the join credential
impl fmt::Debug for AdoptRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdoptRequest")
            .field("cluster_token", &"<redacted>")
            .field("controller_address", &self.controller_address)
            .field("role", &self.role)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdoptResponse {
    pub accepted: bool,
    pub message: String,
}

impl AdoptResponse {
    pub fn accepted(message: impl Into<String>) -> Self {
        Self { accepted: true, message: message.into() }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self { accepted: false, message: message.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub node_id: NodeId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub node_id: NodeId,
    pub reconfigure: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_role_wire_format() {
        let json = serde_json::to_string(&TargetRole::Agent).unwrap();
        assert_eq!(json, "\"agent\"");
        let parsed: TargetRole = serde_json::from_str("\"server\"").unwrap();
        assert_eq!(parsed, TargetRole::Server);
        assert!(serde_json::from_str::<TargetRole>("\"worker\"").is_err());
    }

    #[test]
    fn test_target_role_mapping() {
        assert_eq!(TargetRole::Agent.node_role(), Role::Compute);
        assert_eq!(TargetRole::Server.node_role(), Role::Controller);
    }

    #[test]
    fn test_adopt_request_debug_redacts_token() {
        let req = AdoptRequest {
            cluster_token: "K10supersecret".into(),
            controller_address: "10.0.0.9".parse().unwrap(),
            role: TargetRole::Agent,
        };
        let printed = format!("{:?}", req);
        assert!(!printed.contains("supersecret"));
        assert!(printed.contains("10.0.0.9"));
    }
}
