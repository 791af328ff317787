//! Server assembly: component wiring, agent bootstrap, lifecycle.

use crate::alert::{Alert, AlertConfig, AlertEngine, AlertStatus};
use crate::channel::{self, Channel};
use crate::config::{split_agent_hosts, ServerConfig};
use crate::error::Result;
use crate::feed::FeedIngestor;
use crate::object::{self, Tlp};
use crate::registry::{AgentRecord, AgentRegistry};
use crate::rules::RuleEngine;
use crate::store::{CtiStore, EdgeDetail};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// The assembled data plane: store, registry, rule engine, alert engine,
/// feed ingestor and the agent channel, sharing one cancellation token.
pub struct Server {
    config: ServerConfig,
    store: Arc<CtiStore>,
    registry: Arc<AgentRegistry>,
    rules: Arc<RuleEngine>,
    alerts: Arc<AlertEngine>,
    feeds: Arc<FeedIngestor>,
    cancel: CancellationToken,
}

impl Server {
    /// Builds every component from configuration and seeds the store with
    /// the configured agents. Fails only on configuration problems.
    pub fn new(config: ServerConfig) -> Result<Self> {
        let store = Arc::new(CtiStore::new());
        let registry = Arc::new(AgentRegistry::new());
        bootstrap_agents(&config, &store, &registry);

        let rules = Arc::new(RuleEngine::load(
            &config.server.queryfile,
            store.clone(),
            registry.clone(),
        )?);
        let alerts = Arc::new(AlertEngine::new(
            store.clone(),
            registry.clone(),
            rules.clone(),
            AlertConfig::default(),
        ));
        let feeds = Arc::new(FeedIngestor::new(store.clone(), config.feeds.clone())?);

        Ok(Self {
            config,
            store,
            registry,
            rules,
            alerts,
            feeds,
            cancel: CancellationToken::new(),
        })
    }

    /// Token that stops every loop and session when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Requests a graceful shutdown.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Runs the accept loop, feed loop and alert loop until shutdown, then
    /// joins everything. Sessions drain inside the channel's own teardown.
    pub async fn run(&self) -> Result<()> {
        let acceptor =
            channel::load_tls_acceptor(&self.config.server.certfile, &self.config.server.keyfile)?;
        let addr = self.config.server.host_addr()?;
        let agent_channel = Channel::new(addr, acceptor, self.rules.clone());

        let feed_task = {
            let feeds = self.feeds.clone();
            let cancel = self.cancel.clone();
            tokio::spawn(async move { feeds.run(cancel).await })
        };
        let alert_task = {
            let alerts = self.alerts.clone();
            let cancel = self.cancel.clone();
            tokio::spawn(async move { alerts.run(cancel).await })
        };

        let outcome = agent_channel.serve(self.cancel.clone()).await;

        // serve() only returns once cancelled; the loops observe the same
        // token at their next suspension point.
        let _ = feed_task.await;
        let _ = alert_task.await;
        info!("server stopped");
        outcome
    }

    // ------------------------------------------------------------------
    // Component handles
    // ------------------------------------------------------------------

    pub fn store(&self) -> &Arc<CtiStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn rules(&self) -> &Arc<RuleEngine> {
        &self.rules
    }

    pub fn alerts(&self) -> &Arc<AlertEngine> {
        &self.alerts
    }

    pub fn feeds(&self) -> &Arc<FeedIngestor> {
        &self.feeds
    }

    // ------------------------------------------------------------------
    // Read surface for the operator interface
    // ------------------------------------------------------------------

    /// Where the log is written, if a file was configured.
    pub fn log_location(&self) -> Option<&Path> {
        self.config.server.logfile.as_deref()
    }

    /// The configured operator-interface address.
    pub fn interface_addr(&self) -> Option<&str> {
        self.config.server.interface.as_deref()
    }

    /// Everything, as one exportable bundle.
    pub fn all_data(&self) -> Value {
        self.store.export_bundle()
    }

    /// All observables (non-relationship, non-traffic objects).
    pub fn observables(&self) -> Vec<Value> {
        self.store.observables()
    }

    /// One observable plus its one-hop neighborhood.
    pub fn observable(&self, id: &str) -> Option<(Value, Value)> {
        let view = self.store.read(id)?;
        let graph = self.store.export_object_graph(id, 1).ok()?;
        Some((view, graph))
    }

    /// All network-traffic records.
    pub fn traffic(&self) -> Vec<Value> {
        self.store.all_of_type("network-traffic")
    }

    /// All relationship records.
    pub fn relationships(&self) -> Vec<Value> {
        self.store.all_of_type("relationship")
    }

    /// An edge object resolved with both endpoints.
    pub fn relationship_detail(&self, id: &str) -> Option<EdgeDetail> {
        self.store.edge_detail(id)
    }

    /// Registered agents.
    pub fn agents(&self) -> Vec<AgentRecord> {
        self.registry.list()
    }

    /// One agent record.
    pub fn agent(&self, object_id: &str) -> Option<AgentRecord> {
        self.registry.read(object_id)
    }

    /// Whether an object id names a registered agent.
    pub fn has_agent(&self, object_id: &str) -> bool {
        self.registry.contains(object_id)
    }

    /// An agent's neighborhood at the requested depth.
    pub fn agent_graph(&self, object_id: &str, depth: u32) -> Result<Value> {
        self.store.export_object_graph(object_id, depth)
    }

    /// Currently enabled rules, name to query body.
    pub fn queries(&self) -> BTreeMap<String, String> {
        self.rules.export_enabled()
    }

    /// Alerts in one lifecycle state.
    pub fn alerts_by_status(&self, status: AlertStatus) -> Vec<Alert> {
        self.alerts.by_status(status)
    }

    /// One alert with its induced subgraph.
    pub fn alert(&self, id: &str) -> Option<Alert> {
        self.alerts.by_id(id)
    }
}

/// Inserts each configured agent's identity and addresses into the store
/// and registers it. The identity is linked to its addresses with
/// `resolved_by` relationships so traversal can reach the network from the
/// agent node.
fn bootstrap_agents(config: &ServerConfig, store: &CtiStore, registry: &AgentRegistry) {
    for (name, hosts) in &config.agents {
        let (internal_ip, external_ip) = split_agent_hosts(hosts);

        let (_, agent_id) = store.create(object::identity(name), "server", Tlp::Red, 0);

        let (_, internal_id) =
            store.create(object::ipv4_address(&internal_ip), "server", Tlp::Red, 0);
        store.create(
            object::relationship(&agent_id, &internal_id, "resolved_by"),
            "server",
            Tlp::Red,
            0,
        );

        if let Some(external_ip) = &external_ip {
            let (_, external_id) =
                store.create(object::ipv4_address(external_ip), "server", Tlp::Red, 0);
            store.create(
                object::relationship(&agent_id, &external_id, "resolved_by"),
                "server",
                Tlp::Red,
                0,
            );
        }

        registry.create(name, &agent_id, &internal_ip, external_ip.as_deref());
        info!(agent = %name, id = %agent_id, "agent registered");
    }
}
