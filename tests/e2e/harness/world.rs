//! Builds an assembled data plane for scenarios, without TLS or sockets.

use cti_core::alert::{AlertConfig, AlertEngine};
use cti_core::channel::run_session;
use cti_core::object::{self, Tlp};
use cti_core::registry::AgentRegistry;
use cti_core::rules::{Rule, RuleEngine, RuleType};
use cti_core::store::CtiStore;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::client::AgentClient;

/// Assembled store, registry, rule engine and alert engine, sharing one
/// cancellation token, ready to run sessions over in-memory pipes.
pub struct World {
    pub store: Arc<CtiStore>,
    pub registry: Arc<AgentRegistry>,
    pub rules: Arc<RuleEngine>,
    pub alerts: Arc<AlertEngine>,
    pub cancel: CancellationToken,
}

/// Declarative setup for a [`World`].
pub struct WorldBuilder {
    agents: Vec<(String, String)>,
    rules: BTreeMap<String, Rule>,
    alert_config: AlertConfig,
}

impl World {
    pub fn builder() -> WorldBuilder {
        WorldBuilder {
            agents: Vec::new(),
            rules: BTreeMap::new(),
            alert_config: AlertConfig {
                period: Duration::from_millis(50),
                ..AlertConfig::default()
            },
        }
    }

    /// Identity object id of an agent registered by name.
    pub fn agent_id(&self, name: &str) -> String {
        self.registry
            .list()
            .into_iter()
            .find(|a| a.name == name)
            .map(|a| a.object_id)
            .expect("agent registered")
    }

    /// Opens a session as the agent connecting from `ip`, over a duplex
    /// pipe. Returns the client half with the session task attached.
    pub fn connect(&self, ip: &str) -> AgentClient {
        let (server_io, client_io) = tokio::io::duplex(256 * 1024);
        let session = self.spawn_session(server_io, ip);
        AgentClient::new(client_io, session)
    }

    fn spawn_session(
        &self,
        server_io: DuplexStream,
        ip: &str,
    ) -> JoinHandle<cti_core::Result<()>> {
        let rules = self.rules.clone();
        let cancel = self.cancel.clone();
        let ip = ip.to_string();
        tokio::spawn(run_session(server_io, ip, rules, cancel))
    }
}

impl WorldBuilder {
    /// Registers an agent with one internal address.
    pub fn agent(mut self, name: &str, ip: &str) -> Self {
        self.agents.push((name.to_string(), ip.to_string()));
        self
    }

    /// Adds a rule to the table.
    pub fn rule(mut self, name: &str, target: RuleType, threshold: f64, enabled: bool) -> Self {
        self.rules.insert(
            name.to_string(),
            Rule {
                target,
                query: format!("select * from {name}"),
                relationship: "reported".to_string(),
                threshold,
                enabled,
            },
        );
        self
    }

    /// Overrides the alert tunables.
    pub fn alert_config(mut self, config: AlertConfig) -> Self {
        self.alert_config = config;
        self
    }

    pub fn build(self) -> World {
        let store = Arc::new(CtiStore::new());
        let registry = Arc::new(AgentRegistry::new());

        for (name, ip) in &self.agents {
            let (_, id) = store.create(object::identity(name), "server", Tlp::Red, 0);
            let (_, ip_id) = store.create(object::ipv4_address(ip), "server", Tlp::Red, 0);
            store.create(
                object::relationship(&id, &ip_id, "resolved_by"),
                "server",
                Tlp::Red,
                0,
            );
            registry.create(name, &id, ip, None);
        }

        let rules = Arc::new(RuleEngine::new(self.rules, store.clone(), registry.clone()));
        let alerts = Arc::new(AlertEngine::new(
            store.clone(),
            registry.clone(),
            rules.clone(),
            self.alert_config,
        ));

        World {
            store,
            registry,
            rules,
            alerts,
            cancel: CancellationToken::new(),
        }
    }
}
