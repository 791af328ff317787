//! Registry of monitored agents.
//!
//! Agents are created once at startup from configuration; each one also
//! exists as an identity object in the store so graph traversal can start
//! at an agent node. The registry itself only tracks addressing and
//! liveness bookkeeping.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;

/// A monitored host and its addressing.
#[derive(Debug, Clone, Serialize)]
pub struct AgentRecord {
    /// Human name from configuration.
    pub name: String,
    /// Identity object id in the store.
    pub object_id: String,
    /// Address the agent connects from inside the monitored network.
    pub internal_ip: String,
    /// NAT or edge address, when the agent roams.
    pub external_ip: Option<String>,
    /// RFC 3339 timestamp of the last telemetry seen from this agent.
    pub last_seen: Option<String>,
}

/// Ordered set of agent records keyed by identity object id.
#[derive(Default)]
pub struct AgentRegistry {
    agents: RwLock<BTreeMap<String, AgentRecord>>,
}

impl AgentRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an agent; refuses a duplicate object id.
    pub fn create(
        &self,
        name: &str,
        object_id: &str,
        internal_ip: &str,
        external_ip: Option<&str>,
    ) -> bool {
        let mut agents = self.agents.write();
        if agents.contains_key(object_id) {
            return false;
        }
        agents.insert(
            object_id.to_string(),
            AgentRecord {
                name: name.to_string(),
                object_id: object_id.to_string(),
                internal_ip: internal_ip.to_string(),
                external_ip: external_ip.map(str::to_string),
                last_seen: None,
            },
        );
        true
    }

    /// Record for one agent by identity object id.
    pub fn read(&self, object_id: &str) -> Option<AgentRecord> {
        self.agents.read().get(object_id).cloned()
    }

    /// Removes an agent record.
    pub fn delete(&self, object_id: &str) -> bool {
        self.agents.write().remove(object_id).is_some()
    }

    /// Whether an object id names a registered agent.
    pub fn contains(&self, object_id: &str) -> bool {
        self.agents.read().contains_key(object_id)
    }

    /// Resolves an agent by either of its addresses.
    pub fn find_by_ip(&self, ip: &str) -> Option<AgentRecord> {
        self.agents
            .read()
            .values()
            .find(|a| a.internal_ip == ip || a.external_ip.as_deref() == Some(ip))
            .cloned()
    }

    /// Stamps the last-seen timestamp for an agent.
    pub fn mark_seen(&self, object_id: &str) {
        if let Some(agent) = self.agents.write().get_mut(object_id) {
            agent.last_seen = Some(crate::object::timestamp());
        }
    }

    /// Identity object ids in stable order.
    pub fn ids(&self) -> Vec<String> {
        self.agents.read().keys().cloned().collect()
    }

    /// All records in stable order.
    pub fn list(&self) -> Vec<AgentRecord> {
        self.agents.read().values().cloned().collect()
    }
}
