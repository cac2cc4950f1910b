//! Flock Node - LAN discovery and adoption agent
//!
//! Runs the adoption RPC service next to the loop for the selected mode:
//! - auto: advertise as pending and wait to be adopted
//! - controller: adopt every pending node found on the LAN
//! - compute: keep track of the controller

use anyhow::{Context, Result};
use clap::Parser;
use flock_node::config::{ApplierKind, FlockConfig};
use flock_node::discovery::MdnsTransport;
use flock_node::fingerprint::HostMetadataProvider;
use flock_node::host::{
    host_inspector, ConfigApplier, K3sConfigApplier, K3sTokenIssuer, K3sVerifier, NixosApplier, TokenSource,
};
use flock_node::pusher::HttpAdoptionClient;
use flock_node::{service, Mode, NodeAgent, NodeId, NodeIdentity, NodeServices};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(name = "flock-node", version, about = "Self-organizing compute node")]
struct Args {
    /// Startup mode
    #[arg(long, value_enum, default_value = "auto")]
    mode: Mode,

    /// Config file (defaults to $FLOCK_CONFIG, then the OS config dir)
    #[arg(long)]
    config: Option<PathBuf>,
}

fn build_services(config: &FlockConfig, node_id: &NodeId, transport: MdnsTransport) -> Result<NodeServices> {
    let provision = &config.provision;

    let applier: Arc<dyn ConfigApplier> = match provision.applier {
        ApplierKind::Nixos => Arc::new(NixosApplier::new(provision.nixos_module_path.clone())),
        ApplierKind::K3sConfig => Arc::new(K3sConfigApplier::new(
            provision.k3s_config_path.clone(),
            provision.k3s_unit.clone(),
            node_id.clone(),
        )),
    };

    let verifier = K3sVerifier::new(host_inspector(), provision.k3s_unit.clone(), provision.k3s_config_path.clone())
        .with_expected_distribution(provision.expected_distribution.clone());

    let tokens = TokenSource::new(
        config.adoption.cluster_token.clone(),
        Arc::new(K3sTokenIssuer::new(provision.k3s_binary.clone())),
        format!("flock adoption by {}", node_id),
        config.adoption.token_ttl(),
    );

    let client = HttpAdoptionClient::new(config.adoption.rpc_timeout()).context("Failed to build RPC client")?;

    Ok(NodeServices {
        transport: Arc::new(transport),
        metadata: Arc::new(HostMetadataProvider),
        applier,
        verifier: Arc::new(verifier),
        client: Arc::new(client),
        tokens: Arc::new(tokens),
    })
}

/// Flip the shutdown flag on Ctrl-C or SIGTERM
async fn wait_for_signal(stop: watch::Sender<bool>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("Shutdown requested...");
    let _ = stop.send(true);
}

async fn run(args: Args) -> Result<()> {
    let config = FlockConfig::load(args.config.as_deref())
        .await
        .context("Failed to load configuration")?;

    let node_id = config
        .node
        .node_id
        .clone()
        .map(NodeId::new)
        .unwrap_or_else(NodeId::from_hostname);
    let identity = NodeIdentity::new(node_id.clone(), config.node.port);
    info!("Node {} (mode: {:?})", node_id, args.mode);

    let listen = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.node.port));
    let listener = service::bind(listen).await.context("Adoption service unavailable")?;

    let transport = MdnsTransport::new().context("Discovery unavailable")?;
    let services = build_services(&config, &node_id, transport.clone())?;
    let agent = NodeAgent::new(config, identity, args.mode, services);

    let (stop_tx, stop_rx) = watch::channel(false);
    let server = tokio::spawn(service::serve(listener, agent.clone(), stop_rx.clone()));
    let signals = tokio::spawn(wait_for_signal(stop_tx.clone()));

    let outcome = agent.run(stop_rx).await;

    // Whatever ended the loop, take the RPC service down with it
    let _ = stop_tx.send(true);
    signals.abort();
    match server.await {
        Ok(Err(e)) => error!("Adoption service failed: {}", e),
        Err(e) => error!("Adoption service task panicked: {}", e),
        Ok(Ok(())) => {}
    }
    transport.shutdown();

    if let Err(e) = &outcome {
        if e.is_startup_fatal() {
            error!("Startup failed: {}", e);
        }
    }
    outcome.context("Node stopped with an error")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flock_node=info".into()),
        )
        .init();

    info!("Flock node starting...");
    run(Args::parse()).await
}
