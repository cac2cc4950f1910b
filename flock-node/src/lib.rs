//! Flock Node - self-organizing compute cluster member
//!
//! A freshly booted machine advertises itself on the LAN as pending. One
//! machine runs as controller, watches for pending nodes and adopts each of
//! them exactly once by pushing a role and a join token; the adopted node
//! applies cluster configuration and continues in its new role.
//!
//! - `discovery` / `advertiser` / `scanner`: LAN presence
//! - `service` / `pusher` / `ledger`: adoption RPC, both sides
//! - `agent`: role state machine and mode loops
//! - `survival`: compute-side controller watch
//! - `host` / `fingerprint`: operating-system collaborators

pub mod advertiser;
pub mod agent;
pub mod config;
pub mod discovery;
pub mod error;
pub mod fingerprint;
pub mod host;
pub mod ledger;
pub mod model;
pub mod pusher;
pub mod scanner;
pub mod service;
pub mod shutdown;
pub mod survival;

pub use agent::{Mode, NodeAgent, NodeServices};
pub use config::FlockConfig;
pub use error::{FlockError, Result};
pub use model::{NodeId, NodeIdentity, Role, TargetRole};
