//! Node role state machine
//!
//! A node starts as Pending, Controller or Compute depending on its mode.
//! Pending nodes advertise themselves and wait to be adopted; an accepted
//! adoption moves the role immediately and applies cluster configuration
//! in the background. If that apply fails the node goes back to Pending and
//! advertises again so a controller can retry.

use crate::advertiser::Advertiser;
use crate::config::FlockConfig;
use crate::discovery::DiscoveryTransport;
use crate::error::{FlockError, Result};
use crate::fingerprint::MetadataProvider;
use crate::host::{ApplyRequest, ConfigApplier, TokenSource, Verifier};
use crate::ledger::AdoptionLedger;
use crate::model::{
    AdoptRequest, AdoptResponse, HeartbeatRequest, HeartbeatResponse, NodeIdentity, Role, TargetRole,
};
use crate::pusher::{local_reachable_ip, AdoptionClient, AdoptionPusher};
use crate::scanner::Scanner;
use crate::shutdown;
use crate::survival::SurvivalLoop;
use chrono::{DateTime, Utc};
use clap::ValueEnum;
use parking_lot::Mutex;
use serde::Serialize;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Startup mode selected on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    Controller,
    Compute,
    /// Advertise as pending and wait for a controller
    Auto,
}

impl Mode {
    pub fn initial_role(&self) -> Role {
        match self {
            Mode::Controller => Role::Controller,
            Mode::Compute => Role::Compute,
            Mode::Auto => Role::Pending,
        }
    }
}

/// Adoption accepted by this node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Adoption {
    pub controller: IpAddr,
    pub role: TargetRole,
    pub applied: bool,
    pub accepted_at: DateTime<Utc>,
}

#[derive(Debug)]
struct NodeState {
    role: Role,
    adoption: Option<Adoption>,
}

/// Collaborators a node is wired with
#[derive(Clone)]
pub struct NodeServices {
    pub transport: Arc<dyn DiscoveryTransport>,
    pub metadata: Arc<dyn MetadataProvider>,
    pub applier: Arc<dyn ConfigApplier>,
    pub verifier: Arc<dyn Verifier>,
    pub client: Arc<dyn AdoptionClient>,
    pub tokens: Arc<TokenSource>,
}

pub struct NodeAgent {
    config: FlockConfig,
    identity: NodeIdentity,
    services: NodeServices,
    advertiser: Advertiser,
    scanner: Scanner,
    state: Mutex<NodeState>,
    reconfigure: AtomicBool,
    activation: watch::Sender<Option<Role>>,
    ledger: Arc<AdoptionLedger>,
    survival: Mutex<Option<watch::Receiver<Option<IpAddr>>>>,
}

impl NodeAgent {
    pub fn new(config: FlockConfig, identity: NodeIdentity, mode: Mode, services: NodeServices) -> Arc<Self> {
        let advertiser = Advertiser::new(services.transport.clone(), services.metadata.clone(), identity.clone());
        let scanner = Scanner::new(services.transport.clone(), config.discovery.retry.clone());
        let (activation, _) = watch::channel(None);
        Arc::new(Self {
            config,
            identity,
            services,
            advertiser,
            scanner,
            state: Mutex::new(NodeState { role: mode.initial_role(), adoption: None }),
            reconfigure: AtomicBool::new(false),
            activation,
            ledger: Arc::new(AdoptionLedger::new()),
            survival: Mutex::new(None),
        })
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn role(&self) -> Role {
        self.state.lock().role
    }

    pub fn adoption(&self) -> Option<Adoption> {
        self.state.lock().adoption.clone()
    }

    /// Controller-side ledger; empty on nodes that never ran as controller
    pub fn ledger(&self) -> &Arc<AdoptionLedger> {
        &self.ledger
    }

    pub fn advertiser(&self) -> &Advertiser {
        &self.advertiser
    }

    /// Controller address last seen by the compute survival loop
    pub fn tracked_controller(&self) -> Option<IpAddr> {
        self.survival.lock().as_ref().and_then(|seen| *seen.borrow())
    }

    /// Ask the controller, through the next heartbeat, to reconfigure this node
    pub fn request_reconfigure(&self) {
        self.reconfigure.store(true, Ordering::SeqCst);
    }

    pub fn reconfigure_requested(&self) -> bool {
        self.reconfigure.load(Ordering::SeqCst)
    }

    /// Handle an incoming Adopt.
    ///
    /// Accepts at most once while Pending. Returns before configuration is
    /// applied; the apply runs in a detached task.
    pub fn adopt(self: &Arc<Self>, request: AdoptRequest) -> AdoptResponse {
        if request.cluster_token.trim().is_empty() {
            warn!("Rejecting adoption from {}: empty cluster token", request.controller_address);
            return AdoptResponse::rejected("missing cluster token");
        }

        {
            let mut state = self.state.lock();
            if state.role != Role::Pending {
                info!("Rejecting adoption from {}: already {}", request.controller_address, state.role);
                return AdoptResponse::rejected(format!("node is already {}", state.role));
            }
            if let Some(current) = &state.adoption {
                return AdoptResponse::rejected(format!("adoption by {} already in progress", current.controller));
            }
            state.role = request.role.node_role();
            state.adoption = Some(Adoption {
                controller: request.controller_address,
                role: request.role,
                applied: false,
                accepted_at: Utc::now(),
            });
        }

        info!("Adopted by {} as {}", request.controller_address, request.role);
        let agent = self.clone();
        let role = request.role;
        tokio::spawn(async move { agent.apply_adoption(request).await });
        AdoptResponse::accepted(format!("adopting as {}", role))
    }

    async fn apply_adoption(&self, request: AdoptRequest) {
        self.advertiser.retract().await;

        let apply = ApplyRequest {
            role: request.role,
            token: request.cluster_token,
            controller_address: request.controller_address,
            cluster_init: false,
        };
        match self.services.applier.apply(&apply).await {
            Ok(()) => {
                let role = request.role.node_role();
                if let Some(adoption) = self.state.lock().adoption.as_mut() {
                    adoption.applied = true;
                }
                info!("Configuration applied, continuing as {}", role);
                self.activation.send_replace(Some(role));
            }
            Err(e) => {
                error!("Configuration apply failed: {}", e);
                // A new adoption accepted once the role is reverted retracts
                // only after this republish
                let republished = self
                    .advertiser
                    .publish_after(&self.config.discovery.pending_channel, || {
                        let mut state = self.state.lock();
                        state.role = Role::Pending;
                        state.adoption = None;
                        warn!("Reverted to {}, advertising again", Role::Pending);
                    })
                    .await;
                if let Err(e) = republished {
                    error!("Failed to re-advertise as pending: {}", e);
                }
            }
        }
    }

    pub fn heartbeat(&self, request: HeartbeatRequest) -> HeartbeatResponse {
        debug!("Heartbeat from {}", request.node_id);
        HeartbeatResponse {
            node_id: self.identity.id.clone(),
            reconfigure: self.reconfigure_requested(),
        }
    }

    /// Run the loop for the current role until shutdown
    pub async fn run(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<()> {
        let role = self.role();
        info!("Starting {} as {}", self.identity.id, role);
        match role {
            Role::Pending => self.run_pending(shutdown).await,
            Role::Controller => self.run_controller(shutdown).await,
            Role::Compute => self.run_compute(shutdown).await,
        }
    }

    async fn run_pending(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut activation = self.activation.subscribe();
        self.advertiser.publish(&self.config.discovery.pending_channel).await?;
        info!("Waiting for a controller to adopt this node");

        let activated = async {
            match activation.wait_for(|role| role.is_some()).await {
                Ok(role) => *role,
                Err(_) => None,
            }
        };
        let role = tokio::select! {
            _ = shutdown::requested(&mut shutdown) => None,
            role = activated => role,
        };

        match role {
            Some(Role::Controller) => self.run_controller(shutdown).await,
            Some(Role::Compute) => self.run_compute(shutdown).await,
            _ => {
                self.advertiser.retract().await;
                Ok(())
            }
        }
    }

    /// Check the installed runtime; strict policy turns failures into errors
    async fn verify_installation(&self, role: Role) -> Result<()> {
        match self.services.verifier.verify(role).await {
            Ok(()) => Ok(()),
            Err(e) if self.config.provision.verify_strict => Err(e),
            Err(e) => {
                warn!("{}", e);
                self.request_reconfigure();
                Ok(())
            }
        }
    }

    /// Apply a cluster-initializing server config unless the controller
    /// already passes verification. Needs an operator token: nothing can
    /// issue one before the server runs.
    async fn bootstrap_cluster(&self, own_addr: IpAddr) -> Result<()> {
        let missing = match self.services.verifier.verify(Role::Controller).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        info!("{}; initializing a new cluster", missing);

        let token = self.services.tokens.current().await?;
        let request = ApplyRequest {
            role: TargetRole::Server,
            token,
            controller_address: own_addr,
            cluster_init: true,
        };
        self.services.applier.apply(&request).await?;
        info!("Cluster initialized at {}", own_addr);
        Ok(())
    }

    fn controller_address(&self) -> Result<IpAddr> {
        if let Some(addr) = self.config.adoption.controller_address {
            return Ok(addr);
        }
        local_reachable_ip(&self.config.adoption.outbound_probe).map_err(|e| {
            FlockError::Config(format!(
                "cannot determine a reachable address via {}: {}",
                self.config.adoption.outbound_probe, e
            ))
        })
    }

    async fn run_controller(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let own_addr = self.controller_address()?;
        if self.config.provision.bootstrap_controller {
            self.bootstrap_cluster(own_addr).await?;
        }
        self.verify_installation(Role::Controller).await?;
        self.advertiser.publish(&self.config.discovery.controller_channel).await?;
        info!("Controller ready at {}", own_addr);

        let pusher = AdoptionPusher::new(
            self.identity.id.clone(),
            own_addr,
            self.ledger.clone(),
            self.services.client.clone(),
            self.services.tokens.clone(),
        );

        let monitor = tokio::spawn({
            let pusher = pusher.clone();
            let shutdown = shutdown.clone();
            let every = self.config.adoption.heartbeat_interval();
            async move { pusher.monitor_heartbeats(every, shutdown).await }
        });

        let pending = &self.config.discovery.pending_channel;
        loop {
            let watched = self
                .scanner
                .watch(pending, shutdown.clone(), |event| {
                    pusher.on_event(event);
                })
                .await;

            match watched {
                Ok(()) => break,
                Err(e) => {
                    let pause = self.config.discovery.retry.max_backoff();
                    error!("{}; resuming in {:?}", e, pause);
                    tokio::select! {
                        _ = shutdown::requested(&mut shutdown) => break,
                        _ = tokio::time::sleep(pause) => {}
                    }
                }
            }
        }

        self.advertiser.retract().await;
        if let Err(e) = monitor.await {
            warn!("Heartbeat monitor ended abnormally: {}", e);
        }
        info!("Controller stopped");
        Ok(())
    }

    async fn run_compute(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<()> {
        self.verify_installation(Role::Compute).await?;
        // Compute nodes are not advertised on any channel
        self.advertiser.retract().await;

        let mut survival = SurvivalLoop::new(
            self.scanner.clone(),
            self.config.discovery.controller_channel.clone(),
            self.config.survival.interval(),
            self.config.survival.probe_timeout(),
        );
        *self.survival.lock() = Some(survival.subscribe());
        survival.run(shutdown).await;
        info!("Compute loop stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{Channel, MemoryBus};
    use crate::fingerprint::SystemInfo;
    use crate::host::TokenIssuer;
    use crate::model::NodeId;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct Stub {
        fail_apply: AtomicBool,
        applies: Mutex<Vec<ApplyRequest>>,
        verifications: AtomicUsize,
        verify_ok: bool,
    }

    impl Stub {
        fn new() -> Arc<Self> {
            Self::verifying(true)
        }

        fn verifying(verify_ok: bool) -> Arc<Self> {
            Arc::new(Self {
                fail_apply: AtomicBool::new(false),
                applies: Mutex::new(Vec::new()),
                verifications: AtomicUsize::new(0),
                verify_ok,
            })
        }
    }

    #[async_trait]
    impl ConfigApplier for Stub {
        async fn apply(&self, request: &ApplyRequest) -> Result<()> {
            self.applies.lock().push(request.clone());
            if self.fail_apply.load(Ordering::SeqCst) {
                return Err(FlockError::Apply("rebuild failed".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Verifier for Stub {
        async fn verify(&self, _role: Role) -> Result<()> {
            self.verifications.fetch_add(1, Ordering::SeqCst);
            if self.verify_ok {
                Ok(())
            } else {
                Err(FlockError::Verification(vec!["k3s service is not active".into()]))
            }
        }
    }

    #[async_trait]
    impl MetadataProvider for Stub {
        async fn system_info(&self) -> Result<SystemInfo> {
            Err(FlockError::Metadata("stub".into()))
        }
    }

    #[async_trait]
    impl TokenIssuer for Stub {
        async fn create(&self, _description: &str, _ttl: Duration) -> Result<String> {
            Ok("issued".into())
        }
    }

    #[async_trait]
    impl AdoptionClient for Stub {
        async fn adopt(&self, _target: std::net::SocketAddr, _request: &AdoptRequest) -> Result<AdoptResponse> {
            Ok(AdoptResponse::rejected("stub"))
        }

        async fn heartbeat(
            &self,
            _target: std::net::SocketAddr,
            _request: &HeartbeatRequest,
        ) -> Result<HeartbeatResponse> {
            Ok(HeartbeatResponse { node_id: NodeId::new("stub"), reconfigure: false })
        }
    }

    fn test_config() -> FlockConfig {
        let mut config = FlockConfig::default();
        config.adoption.controller_address = Some("10.0.0.5".parse().unwrap());
        config.survival.probe_timeout_secs = 1;
        config
    }

    fn agent_from(
        bus: &MemoryBus,
        stub: Arc<Stub>,
        mode: Mode,
        config: FlockConfig,
        operator_token: Option<&str>,
    ) -> Arc<NodeAgent> {
        let tokens = TokenSource::new(operator_token.map(str::to_string), stub.clone(), "flock", Duration::from_secs(60));
        let services = NodeServices {
            transport: Arc::new(bus.endpoint("10.0.0.5".parse().unwrap())),
            metadata: stub.clone(),
            applier: stub.clone(),
            verifier: stub.clone(),
            client: stub,
            tokens: Arc::new(tokens),
        };
        NodeAgent::new(config, NodeIdentity::new(NodeId::new("node-a"), 9000), mode, services)
    }

    fn agent_with(bus: &MemoryBus, stub: Arc<Stub>, mode: Mode) -> Arc<NodeAgent> {
        agent_from(bus, stub, mode, test_config(), None)
    }

    fn controller() -> Channel {
        Channel::new("_flock-ctrl._tcp")
    }

    fn request() -> AdoptRequest {
        AdoptRequest {
            cluster_token: "t1".into(),
            controller_address: "10.0.0.9".parse().unwrap(),
            role: TargetRole::Agent,
        }
    }

    fn pending() -> Channel {
        Channel::new("_flock-pending._tcp")
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_adopt_accepts_once_and_applies() {
        let bus = MemoryBus::new();
        let stub = Stub::new();
        let agent = agent_with(&bus, stub.clone(), Mode::Auto);

        let response = agent.adopt(request());
        assert!(response.accepted);
        assert_eq!(agent.role(), Role::Compute);

        wait_until(|| agent.adoption().map(|a| a.applied).unwrap_or(false)).await;
        let applies = stub.applies.lock().clone();
        assert_eq!(applies.len(), 1);
        assert_eq!(applies[0].role, TargetRole::Agent);
        assert_eq!(applies[0].token, "t1");
        assert_eq!(applies[0].controller_address, "10.0.0.9".parse::<IpAddr>().unwrap());
        assert!(!applies[0].cluster_init);
    }

    #[tokio::test]
    async fn test_adopt_rejected_when_not_pending() {
        let bus = MemoryBus::new();
        let stub = Stub::new();
        let agent = agent_with(&bus, stub.clone(), Mode::Controller);

        let response = agent.adopt(request());
        assert!(!response.accepted);
        assert_eq!(agent.role(), Role::Controller);
        assert!(agent.adoption().is_none());
        assert!(agent.ledger().is_empty());
    }

    #[tokio::test]
    async fn test_second_adopt_is_rejected() {
        let bus = MemoryBus::new();
        let stub = Stub::new();
        let agent = agent_with(&bus, stub.clone(), Mode::Auto);

        assert!(agent.adopt(request()).accepted);
        let mut other = request();
        other.controller_address = "10.0.0.10".parse().unwrap();
        assert!(!agent.adopt(other).accepted);
        assert_eq!(agent.adoption().unwrap().controller, "10.0.0.9".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_empty_token_is_rejected() {
        let bus = MemoryBus::new();
        let agent = agent_with(&bus, Stub::new(), Mode::Auto);
        let mut req = request();
        req.cluster_token = "  ".into();
        assert!(!agent.adopt(req).accepted);
        assert_eq!(agent.role(), Role::Pending);
    }

    #[tokio::test]
    async fn test_concurrent_adopts_single_winner() {
        let bus = MemoryBus::new();
        let stub = Stub::new();
        let agent = agent_with(&bus, stub.clone(), Mode::Auto);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let agent = agent.clone();
                tokio::spawn(async move { agent.adopt(request()).accepted })
            })
            .collect();
        let mut accepted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 1);
        wait_until(|| stub.applies.lock().len() == 1).await;
    }

    #[tokio::test]
    async fn test_apply_failure_reverts_and_readvertises() {
        let bus = MemoryBus::new();
        let stub = Stub::new();
        stub.fail_apply.store(true, Ordering::SeqCst);
        let agent = agent_with(&bus, stub.clone(), Mode::Auto);
        agent.advertiser().publish(&pending()).await.unwrap();

        assert!(agent.adopt(request()).accepted);
        wait_until(|| stub.applies.lock().len() == 1 && agent.role() == Role::Pending).await;
        assert!(agent.adoption().is_none());
        wait_until(|| bus.is_published(&pending(), "node-a")).await;
        // Withdrawn once for the attempt, then published again
        assert_eq!(bus.publish_history().len(), 2);

        stub.fail_apply.store(false, Ordering::SeqCst);
        assert!(agent.adopt(request()).accepted);
    }

    #[tokio::test]
    async fn test_heartbeat_reports_reconfigure_flag() {
        let bus = MemoryBus::new();
        let agent = agent_with(&bus, Stub::new(), Mode::Auto);
        let hb = agent.heartbeat(HeartbeatRequest { node_id: NodeId::new("ctl") });
        assert_eq!(hb.node_id, NodeId::new("node-a"));
        assert!(!hb.reconfigure);

        agent.request_reconfigure();
        assert!(agent.heartbeat(HeartbeatRequest { node_id: NodeId::new("ctl") }).reconfigure);
        // Reading the flag does not clear it
        assert!(agent.heartbeat(HeartbeatRequest { node_id: NodeId::new("ctl") }).reconfigure);
    }

    #[tokio::test]
    async fn test_pending_run_continues_as_compute_after_adoption() {
        let bus = MemoryBus::new();
        let stub = Stub::new();
        let agent = agent_with(&bus, stub.clone(), Mode::Auto);
        let (stop_tx, stop_rx) = watch::channel(false);

        let runner = tokio::spawn({
            let agent = agent.clone();
            async move { agent.run(stop_rx).await }
        });
        wait_until(|| bus.is_published(&pending(), "node-a")).await;

        assert!(agent.adopt(request()).accepted);
        // Verification runs when the compute loop starts
        wait_until(|| stub.verifications.load(Ordering::SeqCst) == 1).await;
        assert!(bus.published().is_empty());

        stop_tx.send(true).unwrap();
        runner.await.unwrap().unwrap();
        assert_eq!(agent.role(), Role::Compute);
    }

    #[tokio::test]
    async fn test_pending_run_shutdown_retracts() {
        let bus = MemoryBus::new();
        let agent = agent_with(&bus, Stub::new(), Mode::Auto);
        let (stop_tx, stop_rx) = watch::channel(false);

        let runner = tokio::spawn({
            let agent = agent.clone();
            async move { agent.run(stop_rx).await }
        });
        wait_until(|| bus.is_published(&pending(), "node-a")).await;
        stop_tx.send(true).unwrap();
        runner.await.unwrap().unwrap();
        assert!(bus.published().is_empty());
    }

    #[tokio::test]
    async fn test_mode_loops_are_send() {
        fn assert_send<T: Send>(_: &T) {}
        let bus = MemoryBus::new();
        let agent = agent_with(&bus, Stub::new(), Mode::Auto);
        let (_stop_tx, stop_rx) = watch::channel(false);
        assert_send(&agent.run(stop_rx));
    }

    #[tokio::test]
    async fn test_controller_publishes_and_stops() {
        let bus = MemoryBus::new();
        let agent = agent_with(&bus, Stub::new(), Mode::Controller);
        let (stop_tx, stop_rx) = watch::channel(false);

        let runner = tokio::spawn({
            let agent = agent.clone();
            async move { agent.run(stop_rx).await }
        });
        wait_until(|| bus.is_published(&controller(), "node-a") && bus.open_sessions_on(&pending()) == 1).await;
        stop_tx.send(true).unwrap();
        runner.await.unwrap().unwrap();
        assert!(bus.published().is_empty());
        assert_eq!(bus.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_strict_verification_failure_stops_controller() {
        let bus = MemoryBus::new();
        let mut config = test_config();
        config.provision.verify_strict = true;
        let agent = agent_from(&bus, Stub::verifying(false), Mode::Controller, config, None);
        let (_stop_tx, stop_rx) = watch::channel(false);

        let result = agent.run(stop_rx).await;
        assert!(matches!(result, Err(FlockError::Verification(_))));
        assert!(bus.published().is_empty());
    }

    #[tokio::test]
    async fn test_lenient_verification_failure_requests_reconfigure() {
        let bus = MemoryBus::new();
        let agent = agent_with(&bus, Stub::verifying(false), Mode::Compute);
        let (stop_tx, stop_rx) = watch::channel(false);
        stop_tx.send(true).unwrap();

        agent.run(stop_rx).await.unwrap();
        assert!(agent.reconfigure_requested());
    }

    #[tokio::test]
    async fn test_controller_bootstraps_cluster_when_unverified() {
        let bus = MemoryBus::new();
        let stub = Stub::verifying(false);
        let mut config = test_config();
        config.provision.bootstrap_controller = true;
        let agent = agent_from(&bus, stub.clone(), Mode::Controller, config, Some("t0"));
        let (stop_tx, stop_rx) = watch::channel(false);

        let runner = tokio::spawn({
            let agent = agent.clone();
            async move { agent.run(stop_rx).await }
        });
        wait_until(|| bus.is_published(&controller(), "node-a")).await;
        stop_tx.send(true).unwrap();
        runner.await.unwrap().unwrap();

        let applies = stub.applies.lock().clone();
        assert_eq!(
            applies,
            vec![ApplyRequest {
                role: TargetRole::Server,
                token: "t0".into(),
                controller_address: "10.0.0.5".parse().unwrap(),
                cluster_init: true,
            }]
        );
        assert_eq!(stub.verifications.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_bootstrap_skipped_for_working_controller() {
        let bus = MemoryBus::new();
        let stub = Stub::new();
        let mut config = test_config();
        config.provision.bootstrap_controller = true;
        let agent = agent_from(&bus, stub.clone(), Mode::Controller, config, Some("t0"));
        let (stop_tx, stop_rx) = watch::channel(false);

        let runner = tokio::spawn({
            let agent = agent.clone();
            async move { agent.run(stop_rx).await }
        });
        wait_until(|| bus.is_published(&controller(), "node-a")).await;
        stop_tx.send(true).unwrap();
        runner.await.unwrap().unwrap();
        assert!(stub.applies.lock().is_empty());
    }

    #[tokio::test]
    async fn test_compute_tracks_controller() {
        let bus = MemoryBus::new();
        let agent = agent_with(&bus, Stub::new(), Mode::Compute);
        let _ctl = bus
            .endpoint("10.0.0.9".parse().unwrap())
            .publish(crate::discovery::ServiceRecord {
                channel: controller(),
                name: "ctl".into(),
                port: 9000,
                text: vec![],
            })
            .await
            .unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);

        let runner = tokio::spawn({
            let agent = agent.clone();
            async move { agent.run(stop_rx).await }
        });
        wait_until(|| agent.tracked_controller() == Some("10.0.0.9".parse().unwrap())).await;
        stop_tx.send(true).unwrap();
        runner.await.unwrap().unwrap();
    }
}
