//! Controller-side adoption
//!
//! Discovery callbacks only decide and spawn; the RPC itself runs in its own
//! task so a slow or dead node never stalls the watch loop.

use crate::discovery::{DiscoveryEvent, Operation};
use crate::error::{FlockError, Result};
use crate::host::TokenSource;
use crate::ledger::{AdoptionLedger, AttemptTicket};
use crate::model::{AdoptRequest, AdoptResponse, HeartbeatRequest, HeartbeatResponse, NodeId, TargetRole};
use crate::shutdown;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const ADOPT_PATH: &str = "/flock/v1/adopt";
pub const HEARTBEAT_PATH: &str = "/flock/v1/heartbeat";

/// Client half of the adoption RPC
#[async_trait]
pub trait AdoptionClient: Send + Sync {
    async fn adopt(&self, target: SocketAddr, request: &AdoptRequest) -> Result<AdoptResponse>;
    async fn heartbeat(&self, target: SocketAddr, request: &HeartbeatRequest) -> Result<HeartbeatResponse>;
}

/// HTTP/JSON client
#[derive(Clone)]
pub struct HttpAdoptionClient {
    client: reqwest::Client,
}

impl HttpAdoptionClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FlockError::Config(format!("http client: {}", e)))?;
        Ok(Self { client })
    }

    async fn call<Req, Resp>(&self, target: SocketAddr, path: &str, request: &Req) -> Result<Resp>
    where
        Req: serde::Serialize + Sync,
        Resp: serde::de::DeserializeOwned,
    {
        let rpc_err = |message: String| FlockError::Rpc { target, message };
        let url = format!("http://{}{}", target, path);

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| rpc_err(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(rpc_err(format!("HTTP {}", status)));
        }
        response.json::<Resp>().await.map_err(|e| rpc_err(format!("invalid response: {}", e)))
    }
}

#[async_trait]
impl AdoptionClient for HttpAdoptionClient {
    async fn adopt(&self, target: SocketAddr, request: &AdoptRequest) -> Result<AdoptResponse> {
        self.call(target, ADOPT_PATH, request).await
    }

    async fn heartbeat(&self, target: SocketAddr, request: &HeartbeatRequest) -> Result<HeartbeatResponse> {
        self.call(target, HEARTBEAT_PATH, request).await
    }
}

/// Local address of the interface that routes toward `probe`.
///
/// Connecting a UDP socket only selects a route; nothing is sent.
pub fn local_reachable_ip(probe: &str) -> Result<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.connect(probe)?;
    Ok(socket.local_addr()?.ip())
}

#[derive(Clone)]
pub struct AdoptionPusher {
    self_id: NodeId,
    own_addr: IpAddr,
    target_role: TargetRole,
    ledger: Arc<AdoptionLedger>,
    client: Arc<dyn AdoptionClient>,
    tokens: Arc<TokenSource>,
    members: Arc<Mutex<BTreeMap<NodeId, SocketAddr>>>,
}

impl AdoptionPusher {
    pub fn new(
        self_id: NodeId,
        own_addr: IpAddr,
        ledger: Arc<AdoptionLedger>,
        client: Arc<dyn AdoptionClient>,
        tokens: Arc<TokenSource>,
    ) -> Self {
        Self {
            self_id,
            own_addr,
            target_role: TargetRole::Agent,
            ledger,
            client,
            tokens,
            members: Arc::default(),
        }
    }

    pub fn own_addr(&self) -> IpAddr {
        self.own_addr
    }

    pub fn ledger(&self) -> &Arc<AdoptionLedger> {
        &self.ledger
    }

    /// Nodes that accepted an adoption from this controller
    pub fn members(&self) -> Vec<(NodeId, SocketAddr)> {
        self.members.lock().iter().map(|(id, addr)| (id.clone(), *addr)).collect()
    }

    /// Scanner callback. Returns the spawned push, if one was started.
    pub fn on_event(&self, event: DiscoveryEvent) -> Option<JoinHandle<bool>> {
        let node_id = NodeId::new(event.name.clone());

        if event.op == Operation::Removed {
            if let Some(entry) = self.ledger.evict(&node_id) {
                debug!("{} left the pending channel ({:?})", node_id, entry.status);
            }
            return None;
        }

        if node_id == self.self_id || event.addrs.contains(&self.own_addr) {
            debug!("Ignoring own advertisement");
            return None;
        }
        let addr = event.preferred_addr()?;
        let ticket = self.ledger.try_begin(&node_id, addr)?;

        info!("Found pending node {} at {}", node_id, addr);
        let pusher = self.clone();
        let port = event.port;
        Some(tokio::spawn(async move { pusher.push(ticket, port).await }))
    }

    /// Send one Adopt and settle the ledger entry; true when accepted
    pub async fn push(&self, ticket: AttemptTicket, port: u16) -> bool {
        let target = SocketAddr::new(ticket.address, port);

        let token = match self.tokens.current().await {
            Ok(token) => token,
            Err(e) => {
                error!("No join token for {}: {}", ticket.node_id, e);
                self.ledger.release(&ticket);
                return false;
            }
        };

        let request = AdoptRequest {
            cluster_token: token,
            controller_address: self.own_addr,
            role: self.target_role,
        };

        match self.client.adopt(target, &request).await {
            Ok(response) if response.accepted => {
                info!("Adopted {} at {} as {}", ticket.node_id, target, self.target_role);
                self.members.lock().insert(ticket.node_id.clone(), target);
                self.ledger.mark_adopted(&ticket);
                true
            }
            Ok(response) => {
                warn!("{} declined adoption: {}", ticket.node_id, response.message);
                self.ledger.release(&ticket);
                false
            }
            Err(e) => {
                warn!("Adoption of {} failed: {}", ticket.node_id, e);
                self.ledger.release(&ticket);
                false
            }
        }
    }

    /// One heartbeat round over every adopted node
    pub async fn heartbeat_round(&self) {
        let request = HeartbeatRequest { node_id: self.self_id.clone() };
        for (node_id, target) in self.members() {
            match self.client.heartbeat(target, &request).await {
                Ok(response) if response.reconfigure => {
                    warn!("{} requests reconfiguration", node_id);
                }
                Ok(_) => debug!("{} is alive", node_id),
                Err(e) => warn!("{} unreachable: {}", node_id, e),
            }
        }
    }

    pub async fn monitor_heartbeats(&self, every: Duration, mut shutdown: watch::Receiver<bool>) {
        info!("Starting heartbeat monitor (every {:?})", every);
        let mut interval = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = shutdown::requested(&mut shutdown) => return,
                _ = interval.tick() => {}
            }
            self.heartbeat_round().await;
        }
    }
}
