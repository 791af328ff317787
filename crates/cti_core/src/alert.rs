//! Attack-path discovery and alerting.
//!
//! Every tick the engine pulls each agent's object graph, enumerates the
//! directed paths linking the agent with every positive-risk node, scores
//! them with depth attenuation, and raises an alert the first time a
//! `(agent, object)` pair, or a previously unseen route between them,
//! crosses the threshold. The tick ends by decaying store risk and feeding
//! the per-type means back into the rule engine.

use crate::graph::{GraphEdge, ObjectGraph};
use crate::object;
use crate::registry::AgentRegistry;
use crate::rules::RuleEngine;
use crate::store::CtiStore;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Tunables for the alert loop.
#[derive(Debug, Clone)]
pub struct AlertConfig {
    /// Minimum attenuated score an alert must exceed.
    pub threshold: u8,
    /// Risk amplification applied before depth attenuation.
    pub depth_multiplier: u32,
    /// Traversal depth when pulling an agent's graph.
    pub depth_threshold: u32,
    /// How much risk every object loses per tick.
    pub decay_step: u8,
    /// Tick period.
    pub period: Duration,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            threshold: 40,
            depth_multiplier: 3,
            depth_threshold: 5,
            decay_step: 1,
            period: Duration::from_secs(30),
        }
    }
}

/// Lifecycle of an alert; terminal states are kept for history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Active,
    Resolved,
    Dismissed,
}

/// An attack path that crossed the scoring threshold.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    /// `alert--<uuid>` identifier.
    pub id: String,
    /// Identity object id of the threatened agent.
    pub agent: String,
    /// Id of the risky object the path reaches.
    pub object: String,
    /// Attenuated score at creation time.
    pub risk: u8,
    /// Alternating node and edge ids, agent first.
    pub path: Vec<String>,
    /// Subgraph induced by the path's nodes.
    pub graph: ObjectGraph,
    /// Creation timestamp, RFC 3339 UTC.
    pub timestamp: String,
    /// Current lifecycle state.
    pub status: AlertStatus,
}

#[derive(Default)]
struct Book {
    alerts: Vec<Alert>,
    /// Previously observed node sequences per `(agent, object)` pair.
    paths: HashMap<(String, String), HashSet<Vec<String>>>,
}

/// The periodic correlation loop and its alert book.
pub struct AlertEngine {
    store: Arc<CtiStore>,
    registry: Arc<AgentRegistry>,
    rules: Arc<RuleEngine>,
    config: AlertConfig,
    book: RwLock<Book>,
}

impl AlertEngine {
    pub fn new(
        store: Arc<CtiStore>,
        registry: Arc<AgentRegistry>,
        rules: Arc<RuleEngine>,
        config: AlertConfig,
    ) -> Self {
        Self {
            store,
            registry,
            rules,
            config,
            book: RwLock::new(Book::default()),
        }
    }

    /// One full pass: correlate every agent, decay, refresh rule gates.
    pub fn tick(&self) {
        for agent_id in self.registry.ids() {
            self.process_agent(&agent_id);
        }
        self.store.decay(self.config.decay_step);
        let risks = self.store.aggregate_risks();
        info!(?risks, "mean risks by type");
        self.rules.update_thresholds(&risks);
    }

    /// Runs ticks until cancellation; the sleep is the suspension point.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(period = ?self.config.period, "alert loop started");
        loop {
            self.tick();
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.period) => {}
            }
        }
        info!("alert loop stopped");
    }

    fn process_agent(&self, agent_id: &str) {
        let graph = self.store.object_graph(agent_id, self.config.depth_threshold);
        let adj = adjacency(&graph.edges);

        for node in &graph.nodes {
            let risk = node.risk();
            if risk == 0 {
                continue;
            }
            for path in find_all_paths(&adj, agent_id, &node.id) {
                let hop_count = (path.len() - 1) / 2;
                if hop_count == 0 {
                    continue;
                }
                let score = ((risk as u32 * self.config.depth_multiplier * 2)
                    / hop_count as u32)
                    .min(100) as u8;

                let node_seq: Vec<String> = path.iter().step_by(2).cloned().collect();
                let mut book = self.book.write();
                let (new_pair, new_seq) = record_path(&mut book, agent_id, &node.id, node_seq);
                if (new_pair || new_seq) && score > self.config.threshold {
                    if new_pair {
                        warn!(object = %node.id, agent = %agent_id, score, "new alert");
                    } else {
                        warn!(object = %node.id, agent = %agent_id, score, "new attack path on existing alert");
                    }
                    let alert = Alert {
                        id: object::new_object_id("alert"),
                        agent: agent_id.to_string(),
                        object: node.id.clone(),
                        risk: score,
                        graph: induced_subgraph(&path, &graph),
                        path,
                        timestamp: object::timestamp(),
                        status: AlertStatus::Active,
                    };
                    book.alerts.push(alert);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Alert book access
    // ------------------------------------------------------------------

    /// Alerts currently in the given state.
    pub fn by_status(&self, status: AlertStatus) -> Vec<Alert> {
        self.book
            .read()
            .alerts
            .iter()
            .filter(|a| a.status == status)
            .cloned()
            .collect()
    }

    /// Open alerts.
    pub fn active(&self) -> Vec<Alert> {
        self.by_status(AlertStatus::Active)
    }

    /// Alerts an operator marked handled.
    pub fn resolved(&self) -> Vec<Alert> {
        self.by_status(AlertStatus::Resolved)
    }

    /// Alerts an operator waved off.
    pub fn dismissed(&self) -> Vec<Alert> {
        self.by_status(AlertStatus::Dismissed)
    }

    /// Every alert regardless of state.
    pub fn all(&self) -> Vec<Alert> {
        self.book.read().alerts.clone()
    }

    /// One alert by id.
    pub fn by_id(&self, id: &str) -> Option<Alert> {
        self.book.read().alerts.iter().find(|a| a.id == id).cloned()
    }

    /// Marks an active alert handled; terminal states never transition.
    pub fn resolve(&self, id: &str) -> bool {
        self.transition(id, AlertStatus::Resolved)
    }

    /// Marks an active alert as noise; terminal states never transition.
    pub fn dismiss(&self, id: &str) -> bool {
        self.transition(id, AlertStatus::Dismissed)
    }

    fn transition(&self, id: &str, to: AlertStatus) -> bool {
        let mut book = self.book.write();
        match book
            .alerts
            .iter_mut()
            .find(|a| a.id == id && a.status == AlertStatus::Active)
        {
            Some(alert) => {
                alert.status = to;
                true
            }
            None => false,
        }
    }

    /// Drops an alert entirely, in whatever state it is.
    pub fn delete(&self, id: &str) -> bool {
        let mut book = self.book.write();
        let before = book.alerts.len();
        book.alerts.retain(|a| a.id != id);
        book.alerts.len() != before
    }
}

/// `adj[source] = [(edge_id, target), ...]` in stored edge direction.
fn adjacency(edges: &[GraphEdge]) -> HashMap<&str, Vec<(&str, &str)>> {
    let mut adj: HashMap<&str, Vec<(&str, &str)>> = HashMap::new();
    for edge in edges {
        adj.entry(edge.source.as_str())
            .or_default()
            .push((edge.id.as_str(), edge.target.as_str()));
    }
    adj
}

/// All simple paths from `start` to `end`.
///
/// Simplicity is per `(edge, target)` pair, not per node: a node may be
/// re-entered through a different edge, so topologically distinct routes
/// over shared nodes are all found while cycles cannot recurse forever.
fn find_all_paths(
    adj: &HashMap<&str, Vec<(&str, &str)>>,
    start: &str,
    end: &str,
) -> Vec<Vec<String>> {
    let mut found = Vec::new();
    let mut visited: HashSet<(String, String)> = HashSet::new();
    let mut path = vec![start.to_string()];
    dfs(adj, start, end, &mut path, &mut visited, &mut found);
    found
}

fn dfs(
    adj: &HashMap<&str, Vec<(&str, &str)>>,
    current: &str,
    end: &str,
    path: &mut Vec<String>,
    visited: &mut HashSet<(String, String)>,
    found: &mut Vec<Vec<String>>,
) {
    if current == end {
        found.push(path.clone());
        return;
    }
    if let Some(next) = adj.get(current) {
        for (edge_id, target) in next {
            let step = (edge_id.to_string(), target.to_string());
            if visited.insert(step.clone()) {
                path.push(step.0.clone());
                path.push(step.1.clone());
                dfs(adj, target, end, path, visited, found);
                path.pop();
                path.pop();
                visited.remove(&step);
            }
        }
    }
}

fn record_path(book: &mut Book, agent: &str, object: &str, node_seq: Vec<String>) -> (bool, bool) {
    let key = (agent.to_string(), object.to_string());
    match book.paths.get_mut(&key) {
        None => {
            book.paths.insert(key, HashSet::from([node_seq]));
            (true, true)
        }
        Some(seen) => {
            let fresh = seen.insert(node_seq);
            (false, fresh)
        }
    }
}

/// The subgraph induced by a path: its nodes, and every graph edge whose
/// endpoints both lie on the path.
fn induced_subgraph(path: &[String], graph: &ObjectGraph) -> ObjectGraph {
    let node_set: HashSet<&str> = path.iter().step_by(2).map(String::as_str).collect();
    ObjectGraph {
        nodes: graph
            .nodes
            .iter()
            .filter(|n| node_set.contains(n.id.as_str()))
            .cloned()
            .collect(),
        edges: graph
            .edges
            .iter()
            .filter(|e| node_set.contains(e.source.as_str()) && node_set.contains(e.target.as_str()))
            .cloned()
            .collect(),
    }
}
