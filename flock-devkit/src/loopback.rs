/*!
Loopback adoption RPC

Routes Adopt and Heartbeat calls by target IP straight into the agent
registered for that address, skipping HTTP entirely. Every call and its
outcome is recorded.
*/

use async_trait::async_trait;
use flock_node::model::{AdoptRequest, AdoptResponse, HeartbeatRequest, HeartbeatResponse};
use flock_node::pusher::AdoptionClient;
use flock_node::{FlockError, NodeAgent, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct AdoptCall {
    pub target: SocketAddr,
    pub request: AdoptRequest,
    pub accepted: Option<bool>,
}

#[derive(Default)]
struct Routes {
    agents: HashMap<IpAddr, Arc<NodeAgent>>,
    unreachable: HashSet<IpAddr>,
    adopts: Vec<AdoptCall>,
    heartbeats: Vec<(SocketAddr, HeartbeatResponse)>,
}

#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    routes: Arc<Mutex<Routes>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, addr: IpAddr, agent: Arc<NodeAgent>) {
        self.routes.lock().agents.insert(addr, agent);
    }

    /// Calls to `addr` fail as if the host were down
    pub fn set_unreachable(&self, addr: IpAddr, unreachable: bool) {
        let mut routes = self.routes.lock();
        if unreachable {
            routes.unreachable.insert(addr);
        } else {
            routes.unreachable.remove(&addr);
        }
    }

    pub fn adopt_calls(&self) -> Vec<AdoptCall> {
        self.routes.lock().adopts.clone()
    }

    pub fn accepted_adopts(&self) -> usize {
        self.routes.lock().adopts.iter().filter(|c| c.accepted == Some(true)).count()
    }

    pub fn heartbeats(&self) -> Vec<(SocketAddr, HeartbeatResponse)> {
        self.routes.lock().heartbeats.clone()
    }

    fn route(&self, target: SocketAddr) -> Result<Arc<NodeAgent>> {
        let routes = self.routes.lock();
        if routes.unreachable.contains(&target.ip()) {
            return Err(FlockError::Rpc { target, message: "host unreachable".into() });
        }
        routes
            .agents
            .get(&target.ip())
            .cloned()
            .ok_or_else(|| FlockError::Rpc { target, message: "connection refused".into() })
    }
}

#[async_trait]
impl AdoptionClient for LoopbackNetwork {
    async fn adopt(&self, target: SocketAddr, request: &AdoptRequest) -> Result<AdoptResponse> {
        let outcome = self.route(target).map(|agent| agent.adopt(request.clone()));
        self.routes.lock().adopts.push(AdoptCall {
            target,
            request: request.clone(),
            accepted: outcome.as_ref().ok().map(|r| r.accepted),
        });
        outcome
    }

    async fn heartbeat(&self, target: SocketAddr, request: &HeartbeatRequest) -> Result<HeartbeatResponse> {
        let response = self.route(target)?.heartbeat(request.clone());
        self.routes.lock().heartbeats.push((target, response.clone()));
        Ok(response)
    }
}
