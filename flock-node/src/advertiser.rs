//! Node advertisement
//!
//! At most one registration is live per node. Publishing on a new channel
//! withdraws the old record first, so a browser never sees the node on two
//! channels at once.

use crate::discovery::{Channel, DiscoveryTransport, Registration, ServiceRecord};
use crate::error::{FlockError, Result};
use crate::fingerprint::{MetadataProvider, NodeMetadata};
use crate::model::NodeIdentity;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

pub struct Advertiser {
    transport: Arc<dyn DiscoveryTransport>,
    metadata: Arc<dyn MetadataProvider>,
    identity: NodeIdentity,
    current: Mutex<Option<Registration>>,
}

impl Advertiser {
    pub fn new(
        transport: Arc<dyn DiscoveryTransport>,
        metadata: Arc<dyn MetadataProvider>,
        identity: NodeIdentity,
    ) -> Self {
        Self { transport, metadata, identity, current: Mutex::new(None) }
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    /// Advertise on `channel` with freshly collected metadata
    pub async fn publish(&self, channel: &Channel) -> Result<()> {
        let mut current = self.current.lock().await;
        self.replace(&mut current, channel).await
    }

    /// Run `update`, then advertise on `channel`, with no publish or
    /// retraction from another task in between
    pub async fn publish_after<F>(&self, channel: &Channel, update: F) -> Result<()>
    where
        F: FnOnce() + Send,
    {
        let mut current = self.current.lock().await;
        update();
        self.replace(&mut current, channel).await
    }

    async fn replace(&self, current: &mut Option<Registration>, channel: &Channel) -> Result<()> {
        if let Some(previous) = current.take() {
            previous.close();
        }

        let metadata = NodeMetadata::collect(self.metadata.as_ref()).await;
        let record = ServiceRecord {
            channel: channel.clone(),
            name: self.identity.id.to_string(),
            port: self.identity.port,
            text: metadata.to_text(),
        };

        let registration = self.transport.publish(record).await.map_err(|e| match e {
            FlockError::Publish(_) => e,
            other => FlockError::Publish(other.to_string()),
        })?;
        info!("Advertising {} on {}", self.identity.id, channel);
        *current = Some(registration);
        Ok(())
    }

    /// Withdraw the live advertisement, if any
    pub async fn retract(&self) {
        if let Some(registration) = self.current.lock().await.take() {
            info!("Withdrawing advertisement on {}", registration.channel());
            registration.close();
        }
    }

    pub async fn current_channel(&self) -> Option<Channel> {
        self.current.lock().await.as_ref().map(|r| r.channel().clone())
    }
}
