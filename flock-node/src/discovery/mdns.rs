//! LAN discovery over DNS-SD (multicast DNS)
//!
//! A channel such as `_flock-pending._tcp` is the service type
//! `_flock-pending._tcp.local.`; the node id is the instance name and node
//! metadata travels as TXT properties. One `ServiceDaemon` owns the
//! multicast socket and serves every registration and browse of the process.
//!
//! The daemon keeps a single querier per service type, so a process runs at
//! most one browse per channel at a time.

use super::{BrowseSession, Channel, DiscoveryEvent, DiscoveryTransport, Operation, Registration, ServiceRecord};
use crate::error::{FlockError, Result};
use async_trait::async_trait;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const DOMAIN: &str = "local.";

/// Longest service name label allowed by RFC 6763, underscore excluded
pub const MAX_SERVICE_NAME: usize = 15;

/// Fully qualified DNS-SD service type for a channel
pub fn service_type(channel: &Channel) -> String {
    let name = channel.as_str().trim_end_matches('.');
    let name = name.strip_suffix(".local").unwrap_or(name);
    format!("{}.{}", name, DOMAIN)
}

/// Reject channels that are not a `_name._tcp` / `_name._udp` service type
pub fn check_channel(channel: &Channel) -> Result<()> {
    let ty = service_type(channel);
    let mut labels = ty.split('.');
    let service = labels.next().unwrap_or_default();
    let proto = labels.next().unwrap_or_default();

    let name = service
        .strip_prefix('_')
        .ok_or_else(|| FlockError::Config(format!("channel {} must start with '_'", channel)))?;
    if name.is_empty() || name.len() > MAX_SERVICE_NAME {
        return Err(FlockError::Config(format!(
            "channel {}: service name must be 1-{} characters",
            channel, MAX_SERVICE_NAME
        )));
    }
    if proto != "_tcp" && proto != "_udp" {
        return Err(FlockError::Config(format!("channel {} must end in _tcp or _udp", channel)));
    }
    Ok(())
}

/// Instance label of `fullname` within service type `ty`
fn instance_name(ty: &str, fullname: &str) -> String {
    fullname
        .strip_suffix(ty)
        .map(|name| name.trim_end_matches('.'))
        .unwrap_or(fullname)
        .to_string()
}

/// Non-loopback addresses of this host
fn local_addrs() -> Vec<IpAddr> {
    match if_addrs::get_if_addrs() {
        Ok(ifaces) => ifaces
            .into_iter()
            .filter(|i| !i.is_loopback())
            .map(|i| i.ip())
            .collect(),
        Err(e) => {
            warn!("Failed to enumerate interfaces for advertisement: {}", e);
            Vec::new()
        }
    }
}

fn service_info(record: &ServiceRecord, addrs: &[IpAddr]) -> Result<ServiceInfo> {
    let ty = service_type(&record.channel);
    let host = format!("{}.{}", record.name, DOMAIN);
    let ips = addrs.iter().map(ToString::to_string).collect::<Vec<_>>().join(",");
    let properties: HashMap<String, String> = record
        .text
        .iter()
        .map(|entry| match entry.split_once('=') {
            Some((key, value)) => (key.to_string(), value.to_string()),
            None => (entry.clone(), String::new()),
        })
        .collect();

    ServiceInfo::new(&ty, &record.name, &host, ips.as_str(), record.port, properties)
        .map_err(|e| FlockError::Publish(format!("{} on {}: {}", record.name, ty, e)))
}

fn resolved_event(ty: &str, info: &ServiceInfo) -> DiscoveryEvent {
    let mut addrs: Vec<IpAddr> = info.get_addresses().iter().copied().collect();
    addrs.sort();
    let mut text: Vec<String> = info
        .get_properties()
        .iter()
        .map(|p| format!("{}={}", p.key(), p.val_str()))
        .collect();
    text.sort();

    DiscoveryEvent {
        op: Operation::Added,
        name: instance_name(ty, info.get_fullname()),
        addrs,
        port: info.get_port(),
        text,
    }
}

/// Instances resolved by one browse. Repeated resolutions with unchanged
/// data are swallowed; a removal is reported only for a known instance.
#[derive(Default)]
struct Resolved {
    known: HashMap<String, DiscoveryEvent>,
}

impl Resolved {
    fn added(&mut self, event: DiscoveryEvent) -> Option<DiscoveryEvent> {
        if self.known.get(&event.name) == Some(&event) {
            return None;
        }
        self.known.insert(event.name.clone(), event.clone());
        Some(event)
    }

    fn removed(&mut self, name: &str) -> Option<DiscoveryEvent> {
        self.known.remove(name).map(|mut event| {
            event.op = Operation::Removed;
            event
        })
    }
}

/// Live browse per service type; a closed session only stops the daemon
/// querier if no newer browse took it over
#[derive(Default)]
struct ActiveBrowses {
    next: u64,
    current: HashMap<String, u64>,
}

impl ActiveBrowses {
    fn begin(&mut self, ty: &str) -> u64 {
        self.next += 1;
        self.current.insert(ty.to_string(), self.next);
        self.next
    }

    fn end(&mut self, ty: &str, id: u64) -> bool {
        if self.current.get(ty) == Some(&id) {
            self.current.remove(ty);
            true
        } else {
            false
        }
    }
}

#[derive(Clone)]
pub struct MdnsTransport {
    daemon: ServiceDaemon,
    browses: Arc<Mutex<ActiveBrowses>>,
}

impl MdnsTransport {
    /// Start the multicast DNS daemon
    pub fn new() -> Result<Self> {
        let daemon = ServiceDaemon::new().map_err(|e| FlockError::Publish(format!("start mDNS daemon: {}", e)))?;
        info!("mDNS responder started");
        Ok(Self { daemon, browses: Arc::default() })
    }

    /// Stop the daemon; live registrations are withdrawn with goodbyes
    pub fn shutdown(&self) {
        if let Err(e) = self.daemon.shutdown() {
            debug!("[discovery] daemon shutdown: {}", e);
        }
    }
}

#[async_trait]
impl DiscoveryTransport for MdnsTransport {
    async fn publish(&self, service: ServiceRecord) -> Result<Registration> {
        let addrs = local_addrs();
        if addrs.is_empty() {
            return Err(FlockError::Publish("no non-loopback interface to advertise on".into()));
        }

        let info = service_info(&service, &addrs)?;
        let fullname = info.get_fullname().to_string();
        self.daemon
            .register(info)
            .map_err(|e| FlockError::Publish(format!("register {}: {}", fullname, e)))?;
        debug!("[discovery] registered {}", fullname);

        let daemon = self.daemon.clone();
        Ok(Registration::new(service.channel, service.name, move || {
            if let Err(e) = daemon.unregister(&fullname) {
                debug!("[discovery] unregister {}: {}", fullname, e);
            }
        }))
    }

    async fn browse(&self, channel: &Channel) -> Result<BrowseSession> {
        let ty = service_type(channel);
        let receiver = self
            .daemon
            .browse(&ty)
            .map_err(|e| FlockError::DiscoverySession(format!("browse {}: {}", ty, e)))?;
        let generation = self.browses.lock().begin(&ty);

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn({
            let ty = ty.clone();
            async move {
                let mut resolved = Resolved::default();
                loop {
                    let event = tokio::select! {
                        _ = tx.closed() => return,
                        event = receiver.recv_async() => event,
                    };
                    let update = match event {
                        Ok(ServiceEvent::ServiceResolved(info)) => resolved.added(resolved_event(&ty, &info)),
                        Ok(ServiceEvent::ServiceRemoved(_, fullname)) => resolved.removed(&instance_name(&ty, &fullname)),
                        Ok(ServiceEvent::SearchStopped(_)) | Err(_) => {
                            debug!("[discovery] browse of {} stopped", ty);
                            return;
                        }
                        Ok(_) => None,
                    };
                    if let Some(update) = update {
                        if tx.send(update).is_err() {
                            return;
                        }
                    }
                }
            }
        });

        let daemon = self.daemon.clone();
        let browses = self.browses.clone();
        Ok(BrowseSession::new(channel.clone(), rx, move || {
            task.abort();
            if browses.lock().end(&ty, generation) {
                if let Err(e) = daemon.stop_browse(&ty) {
                    debug!("[discovery] stop browse {}: {}", ty, e);
                }
            }
        }))
    }
}
