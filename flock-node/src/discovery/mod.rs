//! Discovery channel abstraction
//!
//! A transport publishes service records and opens browse sessions that
//! yield `DiscoveryEvent`s. Both registrations and sessions close when
//! dropped, so an early return can never leak an open session.

pub mod mdns;
pub mod memory;

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use tokio::sync::mpsc;

pub use memory::{MemoryBus, MemoryTransport};
pub use mdns::MdnsTransport;

/// Logical service type distinguishing the advertised role
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Channel(String);

impl Channel {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Added,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryEvent {
    pub op: Operation,
    pub name: String,
    pub addrs: Vec<IpAddr>,
    pub port: u16,
    pub text: Vec<String>,
}

impl DiscoveryEvent {
    /// First IPv4 address, falling back to the first address of any family
    pub fn preferred_addr(&self) -> Option<IpAddr> {
        self.addrs
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| self.addrs.first())
            .copied()
    }

    /// Added with at least one address to reach the node on
    pub fn is_reachable_addition(&self) -> bool {
        self.op == Operation::Added && !self.addrs.is_empty()
    }
}

/// What a node publishes on a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub channel: Channel,
    pub name: String,
    pub port: u16,
    pub text: Vec<String>,
}

type Closer = Box<dyn FnOnce() + Send>;

/// Live advertisement; withdrawn on `close` or drop
pub struct Registration {
    channel: Channel,
    name: String,
    closer: Option<Closer>,
}

impl Registration {
    pub fn new(channel: Channel, name: String, closer: impl FnOnce() + Send + 'static) -> Self {
        Self { channel, name, closer: Some(Box::new(closer)) }
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(closer) = self.closer.take() {
            closer();
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Open browse session on one channel; closed on `close` or drop
pub struct BrowseSession {
    channel: Channel,
    events: mpsc::UnboundedReceiver<DiscoveryEvent>,
    closer: Option<Closer>,
}

impl BrowseSession {
    pub fn new(
        channel: Channel,
        events: mpsc::UnboundedReceiver<DiscoveryEvent>,
        closer: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self { channel, events, closer: Some(Box::new(closer)) }
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// `None` once the transport has ended the session
    pub async fn next_event(&mut self) -> Option<DiscoveryEvent> {
        self.events.recv().await
    }

    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(closer) = self.closer.take() {
            closer();
        }
        self.events.close();
    }
}

impl Drop for BrowseSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[async_trait]
pub trait DiscoveryTransport: Send + Sync {
    async fn publish(&self, service: ServiceRecord) -> Result<Registration>;
    async fn browse(&self, channel: &Channel) -> Result<BrowseSession>;
}
