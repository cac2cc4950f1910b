//! In-process discovery bus
//!
//! Lets several nodes discover each other inside one process without
//! touching the network. Records every publish and tracks open browse
//! sessions so tests can assert on them.

use super::{
    BrowseSession, Channel, DiscoveryEvent, DiscoveryTransport, Operation, Registration,
    ServiceRecord,
};
use crate::error::{FlockError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

struct Published {
    id: u64,
    record: ServiceRecord,
    addr: IpAddr,
}

struct Subscriber {
    channel: Channel,
    tx: mpsc::UnboundedSender<DiscoveryEvent>,
}

#[derive(Default)]
struct BusState {
    next_id: u64,
    live: Vec<Published>,
    sessions: HashMap<u64, Subscriber>,
    history: Vec<ServiceRecord>,
    failing_browses: usize,
    failing_publishes: usize,
}

impl BusState {
    fn broadcast(&mut self, channel: &Channel, event: &DiscoveryEvent) {
        // Subscribers whose receiver is gone are dropped on the way
        self.sessions
            .retain(|_, s| s.channel != *channel || s.tx.send(event.clone()).is_ok());
    }
}

fn event_for(op: Operation, published: &Published) -> DiscoveryEvent {
    DiscoveryEvent {
        op,
        name: published.record.name.clone(),
        addrs: vec![published.addr],
        port: published.record.port,
        text: published.record.text.clone(),
    }
}

/// Shared in-memory discovery medium
#[derive(Clone, Default)]
pub struct MemoryBus {
    state: Arc<Mutex<BusState>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport for a node reachable at `addr`
    pub fn endpoint(&self, addr: IpAddr) -> MemoryTransport {
        MemoryTransport { bus: self.clone(), addr }
    }

    /// Deliver an arbitrary event to every session browsing `channel`
    pub fn inject(&self, channel: &Channel, event: DiscoveryEvent) {
        self.state.lock().broadcast(channel, &event);
    }

    pub fn open_sessions(&self) -> usize {
        self.state.lock().sessions.len()
    }

    pub fn open_sessions_on(&self, channel: &Channel) -> usize {
        self.state.lock().sessions.values().filter(|s| s.channel == *channel).count()
    }

    /// Currently live advertisements
    pub fn published(&self) -> Vec<ServiceRecord> {
        self.state.lock().live.iter().map(|p| p.record.clone()).collect()
    }

    pub fn is_published(&self, channel: &Channel, name: &str) -> bool {
        self.state
            .lock()
            .live
            .iter()
            .any(|p| p.record.channel == *channel && p.record.name == name)
    }

    /// Every record ever published, in order
    pub fn publish_history(&self) -> Vec<ServiceRecord> {
        self.state.lock().history.clone()
    }

    pub fn fail_next_browses(&self, count: usize) {
        self.state.lock().failing_browses = count;
    }

    pub fn fail_next_publishes(&self, count: usize) {
        self.state.lock().failing_publishes = count;
    }

    /// Simulate the medium dropping every session on a channel
    pub fn end_sessions(&self, channel: &Channel) {
        self.state.lock().sessions.retain(|_, s| s.channel != *channel);
    }
}

#[derive(Clone)]
pub struct MemoryTransport {
    bus: MemoryBus,
    addr: IpAddr,
}

impl MemoryTransport {
    pub fn addr(&self) -> IpAddr {
        self.addr
    }
}

#[async_trait]
impl DiscoveryTransport for MemoryTransport {
    async fn publish(&self, service: ServiceRecord) -> Result<Registration> {
        let mut state = self.bus.state.lock();
        if state.failing_publishes > 0 {
            state.failing_publishes -= 1;
            return Err(FlockError::Publish("memory bus refused publish".into()));
        }

        let id = state.next_id;
        state.next_id += 1;
        let published = Published { id, record: service.clone(), addr: self.addr };
        let added = event_for(Operation::Added, &published);
        state.broadcast(&service.channel, &added);
        state.history.push(service.clone());
        state.live.push(published);
        debug!("[memory] published {} on {}", service.name, service.channel);

        let bus = self.bus.clone();
        Ok(Registration::new(service.channel, service.name, move || {
            let mut state = bus.state.lock();
            if let Some(pos) = state.live.iter().position(|p| p.id == id) {
                let published = state.live.remove(pos);
                let removed = event_for(Operation::Removed, &published);
                state.broadcast(&published.record.channel, &removed);
            }
        }))
    }

    async fn browse(&self, channel: &Channel) -> Result<BrowseSession> {
        let mut state = self.bus.state.lock();
        if state.failing_browses > 0 {
            state.failing_browses -= 1;
            return Err(FlockError::DiscoverySession("memory bus refused browse".into()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        for published in state.live.iter().filter(|p| p.record.channel == *channel) {
            let _ = tx.send(event_for(Operation::Added, published));
        }

        let id = state.next_id;
        state.next_id += 1;
        state.sessions.insert(id, Subscriber { channel: channel.clone(), tx });

        let bus = self.bus.clone();
        Ok(BrowseSession::new(channel.clone(), rx, move || {
            bus.state.lock().sessions.remove(&id);
        }))
    }
}
