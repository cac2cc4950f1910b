//! Compute-side controller watch
//!
//! Periodically probes the controller channel and reports whether the
//! controller is still there. Purely observational: nothing here is fatal.

use crate::discovery::Channel;
use crate::scanner::Scanner;
use crate::shutdown;
use std::net::IpAddr;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub struct SurvivalLoop {
    scanner: Scanner,
    channel: Channel,
    interval: Duration,
    probe_timeout: Duration,
    seen: watch::Sender<Option<IpAddr>>,
    checked: bool,
}

impl SurvivalLoop {
    pub fn new(scanner: Scanner, channel: Channel, interval: Duration, probe_timeout: Duration) -> Self {
        let (seen, _) = watch::channel(None);
        Self { scanner, channel, interval, probe_timeout, seen, checked: false }
    }

    /// Address of the controller seen by the latest probe
    pub fn controller(&self) -> Option<IpAddr> {
        *self.seen.borrow()
    }

    /// Follow probe results from outside the loop
    pub fn subscribe(&self) -> watch::Receiver<Option<IpAddr>> {
        self.seen.subscribe()
    }

    /// Run one probe and log the result
    pub async fn tick(&mut self) -> Option<IpAddr> {
        let found = match self.scanner.probe(&self.channel, self.probe_timeout).await {
            Ok(candidate) => candidate.map(|c| c.addr),
            Err(e) => {
                warn!("Controller probe failed: {}", e);
                None
            }
        };

        let changed = !self.checked || found != self.controller();
        match found {
            Some(addr) if changed => info!("Connected to controller at {}", addr),
            Some(addr) => debug!("Connected to controller at {}", addr),
            None if changed => info!("Lost controller, scanning..."),
            None => debug!("Lost controller, scanning..."),
        }

        self.checked = true;
        self.seen.send_replace(found);
        found
    }

    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Starting survival loop on {}", self.channel);
        let mut interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = shutdown::requested(&mut shutdown) => return,
                _ = interval.tick() => {}
            }
            // Dropping an in-flight probe closes its session
            tokio::select! {
                _ = shutdown::requested(&mut shutdown) => return,
                _ = self.tick() => {}
            }
        }
    }
}
