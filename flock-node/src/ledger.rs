//! Controller-side record of adoption attempts
//!
//! One entry per node id. `try_begin` is the only way to start an attempt and
//! is an atomic check-and-set, so duplicate discovery events for the same node
//! can never produce two concurrent pushes. Outcomes are applied through the
//! returned ticket and ignored when the entry has since been replaced.

use crate::model::NodeId;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::net::IpAddr;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AdoptionStatus {
    Pending,
    Adopted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerEntry {
    pub status: AdoptionStatus,
    pub address: IpAddr,
    pub attempt: u64,
    pub updated_at: DateTime<Utc>,
}

/// Proof of a started attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptTicket {
    pub node_id: NodeId,
    pub address: IpAddr,
    attempt: u64,
}

#[derive(Default)]
struct LedgerState {
    next_attempt: u64,
    entries: HashMap<NodeId, LedgerEntry>,
}

#[derive(Default)]
pub struct AdoptionLedger {
    state: Mutex<LedgerState>,
}

impl AdoptionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `node_id` pending unless an attempt is already pending or succeeded
    pub fn try_begin(&self, node_id: &NodeId, address: IpAddr) -> Option<AttemptTicket> {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.get(node_id) {
            debug!("Skipping {}: attempt already {:?}", node_id, entry.status);
            return None;
        }
        state.next_attempt += 1;
        let attempt = state.next_attempt;
        state.entries.insert(
            node_id.clone(),
            LedgerEntry { status: AdoptionStatus::Pending, address, attempt, updated_at: Utc::now() },
        );
        Some(AttemptTicket { node_id: node_id.clone(), address, attempt })
    }

    /// Record a successful push; false if the ticket is stale
    pub fn mark_adopted(&self, ticket: &AttemptTicket) -> bool {
        let mut state = self.state.lock();
        match state.entries.get_mut(&ticket.node_id) {
            Some(entry) if entry.attempt == ticket.attempt => {
                entry.status = AdoptionStatus::Adopted;
                entry.updated_at = Utc::now();
                true
            }
            _ => false,
        }
    }

    /// Forget a failed attempt so a later discovery event can retry
    pub fn release(&self, ticket: &AttemptTicket) -> bool {
        let mut state = self.state.lock();
        let current = state.entries.get(&ticket.node_id).map(|e| e.attempt);
        if current == Some(ticket.attempt) {
            state.entries.remove(&ticket.node_id);
            true
        } else {
            false
        }
    }

    /// Drop whatever is recorded for a node that left the network
    pub fn evict(&self, node_id: &NodeId) -> Option<LedgerEntry> {
        self.state.lock().entries.remove(node_id)
    }

    pub fn get(&self, node_id: &NodeId) -> Option<LedgerEntry> {
        self.state.lock().entries.get(node_id).cloned()
    }

    pub fn status(&self, node_id: &NodeId) -> Option<AdoptionStatus> {
        self.get(node_id).map(|e| e.status)
    }

    pub fn adopted(&self) -> Vec<(NodeId, LedgerEntry)> {
        self.state
            .lock()
            .entries
            .iter()
            .filter(|(_, e)| e.status == AdoptionStatus::Adopted)
            .map(|(id, e)| (id.clone(), e.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn addr() -> IpAddr {
        "10.0.0.5".parse().unwrap()
    }

    #[test]
    fn test_second_begin_is_refused() {
        let ledger = AdoptionLedger::new();
        let id = NodeId::new("node-a");
        let ticket = ledger.try_begin(&id, addr()).unwrap();
        assert!(ledger.try_begin(&id, addr()).is_none());

        assert!(ledger.mark_adopted(&ticket));
        assert_eq!(ledger.status(&id), Some(AdoptionStatus::Adopted));
        assert!(ledger.try_begin(&id, addr()).is_none());
        assert_eq!(ledger.adopted().len(), 1);
    }

    #[test]
    fn test_release_allows_retry() {
        let ledger = AdoptionLedger::new();
        let id = NodeId::new("node-a");
        let ticket = ledger.try_begin(&id, addr()).unwrap();
        assert!(ledger.release(&ticket));
        assert!(ledger.is_empty());
        assert!(ledger.try_begin(&id, addr()).is_some());
    }

    #[test]
    fn test_stale_ticket_does_not_touch_new_attempt() {
        let ledger = AdoptionLedger::new();
        let id = NodeId::new("node-a");
        let old = ledger.try_begin(&id, addr()).unwrap();
        ledger.evict(&id);
        let fresh = ledger.try_begin(&id, addr()).unwrap();

        assert!(!ledger.release(&old));
        assert!(!ledger.mark_adopted(&old));
        assert_eq!(ledger.status(&id), Some(AdoptionStatus::Pending));
        assert!(ledger.mark_adopted(&fresh));
    }

    #[test]
    fn test_evict_after_adoption_allows_readoption() {
        let ledger = AdoptionLedger::new();
        let id = NodeId::new("node-a");
        let ticket = ledger.try_begin(&id, addr()).unwrap();
        ledger.mark_adopted(&ticket);
        let evicted = ledger.evict(&id).unwrap();
        assert_eq!(evicted.status, AdoptionStatus::Adopted);
        assert!(ledger.try_begin(&id, addr()).is_some());
    }

    #[test]
    fn test_concurrent_begin_single_winner() {
        let ledger = Arc::new(AdoptionLedger::new());
        let id = NodeId::new("node-a");
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let ledger = ledger.clone();
                let id = id.clone();
                std::thread::spawn(move || ledger.try_begin(&id, addr()).is_some())
            })
            .collect();
        let winners = handles.into_iter().map(|h| h.join().unwrap()).filter(|won| *won).count();
        assert_eq!(winners, 1);
    }
}
