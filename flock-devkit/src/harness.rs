/*!
Multi-node harness

Nodes share one in-memory discovery bus and one loopback RPC network.
Timings are shortened so a full adoption completes in milliseconds.
*/

use crate::loopback::LoopbackNetwork;
use crate::stubs::{RecordingApplier, RecordingVerifier, StaticMetadata, StaticTokenIssuer};
use anyhow::{bail, Result};
use flock_node::config::RetryPolicy;
use flock_node::discovery::MemoryBus;
use flock_node::host::TokenSource;
use flock_node::{FlockConfig, Mode, NodeAgent, NodeId, NodeIdentity, NodeServices};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

pub const NODE_PORT: u16 = 9000;

/// One node inside the harness, with handles on its stubs
pub struct TestNode {
    pub agent: Arc<NodeAgent>,
    pub addr: IpAddr,
    pub applier: Arc<RecordingApplier>,
    pub verifier: Arc<RecordingVerifier>,
    pub issuer: Arc<StaticTokenIssuer>,
}

pub struct FlockHarness {
    pub bus: MemoryBus,
    pub network: LoopbackNetwork,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<flock_node::Result<()>>>,
}

impl Default for FlockHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl FlockHarness {
    pub fn new() -> Self {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "flock_node=debug,flock_devkit=info".into()),
            )
            .try_init()
            .ok();

        let (shutdown, _) = watch::channel(false);
        Self { bus: MemoryBus::new(), network: LoopbackNetwork::new(), shutdown, tasks: Vec::new() }
    }

    /// Config with test timings; `token` stands in for an operator token
    pub fn config(addr: IpAddr, token: Option<&str>) -> FlockConfig {
        let mut config = FlockConfig::default();
        config.node.port = NODE_PORT;
        config.discovery.retry = RetryPolicy { attempts: 3, initial_backoff_ms: 5, max_backoff_ms: 50 };
        config.adoption.cluster_token = token.map(str::to_string);
        config.adoption.controller_address = Some(addr);
        config.adoption.heartbeat_interval_secs = 1;
        config.survival.interval_secs = 1;
        config.survival.probe_timeout_secs = 1;
        config
    }

    /// Build a node and route RPCs to it without starting its loop
    pub fn add_node(&self, name: &str, addr: IpAddr, mode: Mode, config: FlockConfig) -> TestNode {
        let applier = Arc::new(RecordingApplier::new());
        let verifier = Arc::new(RecordingVerifier::default());
        let issuer = Arc::new(StaticTokenIssuer::new(format!("issued-by-{}", name)));

        let tokens = TokenSource::new(
            config.adoption.cluster_token.clone(),
            issuer.clone(),
            "flock test",
            config.adoption.token_ttl(),
        );
        let services = NodeServices {
            transport: Arc::new(self.bus.endpoint(addr)),
            metadata: Arc::new(StaticMetadata::for_addr(addr)),
            applier: applier.clone(),
            verifier: verifier.clone(),
            client: Arc::new(self.network.clone()),
            tokens: Arc::new(tokens),
        };

        let identity = NodeIdentity::new(NodeId::new(name), config.node.port);
        let agent = NodeAgent::new(config, identity, mode, services);
        self.network.register(addr, agent.clone());
        TestNode { agent, addr, applier, verifier, issuer }
    }

    /// Build a node and run its mode loop until the harness shuts down
    pub fn spawn_node(&mut self, name: &str, addr: IpAddr, mode: Mode, token: Option<&str>) -> TestNode {
        let node = self.add_node(name, addr, mode, Self::config(addr, token));
        let agent = node.agent.clone();
        let shutdown = self.shutdown.subscribe();
        info!("Spawning {} at {} ({:?})", name, addr, mode);
        self.tasks.push(tokio::spawn(async move { agent.run(shutdown).await }));
        node
    }

    /// Poll `check` until it holds or `timeout` passes
    pub async fn wait_until<F>(&self, timeout: Duration, mut check: F) -> Result<()>
    where
        F: FnMut() -> bool,
    {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if check() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        bail!("condition not met within {:?}", timeout)
    }

    /// Stop every node and collect the result of each loop
    pub async fn shutdown(self) -> Result<Vec<flock_node::Result<()>>> {
        let _ = self.shutdown.send(true);
        let mut results = Vec::new();
        for task in self.tasks {
            results.push(task.await?);
        }
        Ok(results)
    }
}
