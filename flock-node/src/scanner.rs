//! Browsing the discovery channel
//!
//! Two modes: a bounded probe that returns the first reachable node (used by
//! the survival loop), and an indefinite watch that feeds a callback (used by
//! the controller). Sessions are closed on every exit path.

use crate::config::RetryPolicy;
use crate::discovery::{BrowseSession, Channel, DiscoveryEvent, DiscoveryTransport, Operation};
use crate::error::{FlockError, Result};
use crate::fingerprint::parse_metadata;
use crate::shutdown;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// A node found by a probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub name: String,
    pub addr: IpAddr,
    pub port: u16,
    pub metadata: BTreeMap<String, String>,
}

impl Candidate {
    fn from_event(event: &DiscoveryEvent) -> Option<Self> {
        Some(Self {
            name: event.name.clone(),
            addr: event.preferred_addr()?,
            port: event.port,
            metadata: parse_metadata(&event.text),
        })
    }
}

#[derive(Clone)]
pub struct Scanner {
    transport: Arc<dyn DiscoveryTransport>,
    retry: RetryPolicy,
}

impl Scanner {
    pub fn new(transport: Arc<dyn DiscoveryTransport>, retry: RetryPolicy) -> Self {
        Self { transport, retry }
    }

    /// First reachable node on `channel` within `timeout`, or `None`
    pub async fn probe(&self, channel: &Channel, timeout: Duration) -> Result<Option<Candidate>> {
        let mut session = self.transport.browse(channel).await?;

        let found = tokio::time::timeout(timeout, async {
            while let Some(event) = session.next_event().await {
                if event.is_reachable_addition() {
                    return Candidate::from_event(&event);
                }
            }
            None
        })
        .await
        .unwrap_or(None);

        session.close();
        if let Some(candidate) = &found {
            debug!("Discovered {} on {} at {}", candidate.name, channel, candidate.addr);
        }
        Ok(found)
    }

    /// Deliver events until `shutdown` flips to true.
    ///
    /// The callback sees every Added event that carries an address and every
    /// Removed event, one at a time in arrival order. It must not block.
    /// Sessions ended by the transport are reopened with backoff; the call
    /// only fails once a reopen exhausts the retry policy.
    pub async fn watch<F>(&self, channel: &Channel, mut shutdown: watch::Receiver<bool>, mut on_event: F) -> Result<()>
    where
        F: FnMut(DiscoveryEvent) + Send,
    {
        loop {
            let mut session = match self.open_with_retry(channel, &mut shutdown).await? {
                Some(session) => session,
                None => return Ok(()),
            };
            info!("Watching {} for nodes", channel);

            loop {
                tokio::select! {
                    _ = shutdown::requested(&mut shutdown) => {
                        session.close();
                        return Ok(());
                    }
                    event = session.next_event() => match event {
                        Some(event) if event.is_reachable_addition() || event.op == Operation::Removed => {
                            on_event(event);
                        }
                        Some(event) => debug!("Ignoring address-less event for {}", event.name),
                        None => {
                            warn!("Discovery session on {} ended, reopening", channel);
                            break;
                        }
                    },
                }
            }
        }
    }

    /// `Ok(None)` when shutdown was requested while waiting
    async fn open_with_retry(
        &self,
        channel: &Channel,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<BrowseSession>> {
        let mut attempt = 0;
        loop {
            if *shutdown.borrow() {
                return Ok(None);
            }
            match self.transport.browse(channel).await {
                Ok(session) => return Ok(Some(session)),
                Err(e) if attempt + 1 < self.retry.attempts => {
                    let delay = self.retry.backoff(attempt);
                    warn!("Failed to open browse session on {} ({}), retrying in {:?}", channel, e, delay);
                    attempt += 1;
                    tokio::select! {
                        _ = shutdown::requested(shutdown) => return Ok(None),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    return Err(FlockError::DiscoverySession(format!(
                        "{} after {} attempts: {}",
                        channel,
                        attempt + 1,
                        e
                    )))
                }
            }
        }
    }
}
