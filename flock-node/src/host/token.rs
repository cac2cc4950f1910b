//! Cluster join credentials
//!
//! The controller never ships a built-in secret. It uses the operator's
//! token when one is configured, otherwise it asks the cluster runtime for a
//! short-lived token and issues a fresh one once that expires.

use crate::error::{FlockError, Result};
use crate::host::run_command;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::info;

#[async_trait]
pub trait TokenIssuer: Send + Sync {
    async fn create(&self, description: &str, ttl: Duration) -> Result<String>;
}

/// `k3s token create`
#[derive(Debug, Clone)]
pub struct K3sTokenIssuer {
    pub binary: String,
}

impl K3sTokenIssuer {
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }
}

/// Go-style duration accepted by the k3s CLI, e.g. `1h0m0s`
pub fn go_duration(d: Duration) -> String {
    let secs = d.as_secs();
    format!("{}h{}m{}s", secs / 3600, (secs % 3600) / 60, secs % 60)
}

#[async_trait]
impl TokenIssuer for K3sTokenIssuer {
    async fn create(&self, description: &str, ttl: Duration) -> Result<String> {
        let ttl_arg = go_duration(ttl);
        let mut args = vec!["token", "create"];
        if !description.is_empty() {
            args.extend(["--description", description]);
        }
        if !ttl.is_zero() {
            args.extend(["--ttl", ttl_arg.as_str()]);
        }

        let out = run_command(&self.binary, &args, Duration::from_secs(30))
            .await
            .map_err(|e| FlockError::Token(format!("{} binary not usable: {}", self.binary, e)))?;
        if !out.success() {
            return Err(FlockError::Token(format!(
                "failed to create token (stderr: {})",
                out.stderr.trim()
            )));
        }

        let token = out.stdout.trim().to_string();
        if token.is_empty() {
            return Err(FlockError::Token("k3s command succeeded but returned empty token".into()));
        }
        Ok(token)
    }
}

struct IssuedToken {
    value: String,
    expires_at: Instant,
}

/// Yields the token pushed to adopted nodes
pub struct TokenSource {
    fixed: Option<String>,
    issuer: Arc<dyn TokenIssuer>,
    description: String,
    ttl: Duration,
    cached: Mutex<Option<IssuedToken>>,
}

impl TokenSource {
    pub fn new(
        fixed: Option<String>,
        issuer: Arc<dyn TokenIssuer>,
        description: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self { fixed, issuer, description: description.into(), ttl, cached: Mutex::new(None) }
    }

    pub async fn current(&self) -> Result<String> {
        if let Some(token) = &self.fixed {
            return Ok(token.clone());
        }

        let mut cached = self.cached.lock().await;
        // Rotate a little before the runtime expires the token
        let margin = self.ttl / 10;
        if let Some(token) = cached.as_ref() {
            if Instant::now() + margin < token.expires_at {
                return Ok(token.value.clone());
            }
        }

        let value = self.issuer.create(&self.description, self.ttl).await?;
        info!("Issued new join token (ttl {:?})", self.ttl);
        *cached = Some(IssuedToken { value: value.clone(), expires_at: Instant::now() + self.ttl });
        Ok(value)
    }
}
