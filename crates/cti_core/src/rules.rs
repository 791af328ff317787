//! Adaptive query rules: what agents collect, and when.
//!
//! Each rule binds an opaque query body (executed verbatim by the agent's
//! collector) to the CTI type its rows produce, a relationship label, and a
//! risk threshold. The alert loop feeds aggregated risk back through
//! [`RuleEngine::update_thresholds`], so collection concentrates on the
//! object types that are currently hot.

use crate::error::{CtiError, Result};
use crate::object::{self, timestamp, Tlp};
use crate::registry::{AgentRecord, AgentRegistry};
use crate::store::CtiStore;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// CTI type a rule's rows are parsed into.
///
/// Unknown types are a first-class case: configuration may ship rules this
/// build does not understand, and they must be skipped, not rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RuleType {
    Ipv4Addr,
    Process,
    File,
    Vulnerability,
    NetworkTraffic,
    Other(String),
}

impl RuleType {
    /// The wire/type-string form, matching object `type` fields.
    pub fn as_str(&self) -> &str {
        match self {
            RuleType::Ipv4Addr => "ipv4-addr",
            RuleType::Process => "process",
            RuleType::File => "file",
            RuleType::Vulnerability => "vulnerability",
            RuleType::NetworkTraffic => "network-traffic",
            RuleType::Other(s) => s,
        }
    }
}

impl From<String> for RuleType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "ipv4-addr" => RuleType::Ipv4Addr,
            "process" => RuleType::Process,
            "file" => RuleType::File,
            "vulnerability" => RuleType::Vulnerability,
            "network-traffic" => RuleType::NetworkTraffic,
            _ => RuleType::Other(s),
        }
    }
}

impl From<RuleType> for String {
    fn from(t: RuleType) -> Self {
        t.as_str().to_string()
    }
}

/// A named collection directive pushed to agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    /// CTI type the rows construct.
    #[serde(rename = "type")]
    pub target: RuleType,
    /// Query body, passed opaquely to the agent.
    pub query: String,
    /// Label attached to relationships created from this rule's rows.
    pub relationship: String,
    /// Mean risk at which the rule switches on.
    pub threshold: f64,
    /// Whether agents should currently run this rule.
    #[serde(default)]
    pub enabled: bool,
}

/// The rule table plus its change broadcast.
///
/// `export_enabled` is read on every session turn; `update_thresholds` is
/// written once per alert tick. Sessions subscribe to the watch channel
/// and push a fresh rule set to their agent when the version bumps.
pub struct RuleEngine {
    rules: RwLock<BTreeMap<String, Rule>>,
    store: Arc<CtiStore>,
    registry: Arc<AgentRegistry>,
    changed: watch::Sender<u64>,
}

impl RuleEngine {
    /// Builds an engine over an explicit rule table.
    pub fn new(
        rules: BTreeMap<String, Rule>,
        store: Arc<CtiStore>,
        registry: Arc<AgentRegistry>,
    ) -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            rules: RwLock::new(rules),
            store,
            registry,
            changed,
        }
    }

    /// Loads the rule bundle from a JSON file, tolerating a UTF-8 BOM.
    pub fn load(
        path: &Path,
        store: Arc<CtiStore>,
        registry: Arc<AgentRegistry>,
    ) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let bytes = bytes
            .strip_prefix(b"\xef\xbb\xbf".as_slice())
            .unwrap_or(&bytes);
        let rules: BTreeMap<String, Rule> = serde_json::from_slice(bytes)?;
        info!(count = rules.len(), path = %path.display(), "loaded query rules");
        Ok(Self::new(rules, store, registry))
    }

    /// Subscribe to rule-set version bumps.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changed.subscribe()
    }

    fn bump(&self) {
        self.changed.send_modify(|v| *v += 1);
    }

    /// What the agents should currently run: name to query body.
    pub fn export_enabled(&self) -> BTreeMap<String, String> {
        self.rules
            .read()
            .iter()
            .filter(|(_, rule)| rule.enabled)
            .map(|(name, rule)| (name.clone(), rule.query.clone()))
            .collect()
    }

    /// Re-evaluates every rule against the per-type mean risks.
    ///
    /// A type absent from `risks` contributes zero. Only transitions are
    /// logged; the watch version bumps once when anything flipped.
    pub fn update_thresholds(&self, risks: &HashMap<String, f64>) {
        let mut flipped = false;
        {
            let mut rules = self.rules.write();
            for (name, rule) in rules.iter_mut() {
                let mean = risks.get(rule.target.as_str()).copied().unwrap_or(0.0);
                let enable = rule.threshold <= mean;
                if enable != rule.enabled {
                    info!(rule = %name, from = rule.enabled, to = enable, mean, "rule enable state changed");
                    rule.enabled = enable;
                    flipped = true;
                }
            }
        }
        if flipped {
            self.bump();
        }
    }

    /// Adds a rule; refuses a duplicate name.
    pub fn add_rule(&self, name: &str, rule: Rule) -> bool {
        let inserted = {
            let mut rules = self.rules.write();
            if rules.contains_key(name) {
                false
            } else {
                rules.insert(name.to_string(), rule);
                true
            }
        };
        if inserted {
            self.bump();
        }
        inserted
    }

    /// A rule by name.
    pub fn rule(&self, name: &str) -> Option<Rule> {
        self.rules.read().get(name).cloned()
    }

    /// Replaces an existing rule.
    pub fn set_rule(&self, name: &str, rule: Rule) -> bool {
        let replaced = {
            let mut rules = self.rules.write();
            match rules.get_mut(name) {
                Some(slot) => {
                    *slot = rule;
                    true
                }
                None => false,
            }
        };
        if replaced {
            self.bump();
        }
        replaced
    }

    /// Removes a rule.
    pub fn remove_rule(&self, name: &str) -> bool {
        let removed = self.rules.write().remove(name).is_some();
        if removed {
            self.bump();
        }
        removed
    }

    /// Ingests one telemetry entry: rows reported by an agent for a rule.
    ///
    /// The agent is resolved by the address it connected from and stamped
    /// as seen. Malformed rows are logged and skipped; an unknown rule or
    /// an unregistered address is an error the session reports back.
    pub fn apply(&self, agent_ip: &str, rule_name: &str, rows: Vec<Map<String, Value>>) -> Result<()> {
        let rule = self
            .rule(rule_name)
            .ok_or_else(|| CtiError::UnknownRule(rule_name.to_string()))?;
        let agent = self
            .registry
            .find_by_ip(agent_ip)
            .ok_or_else(|| CtiError::UnknownAgent(agent_ip.to_string()))?;
        self.registry.mark_seen(&agent.object_id);

        if let RuleType::Other(ty) = &rule.target {
            warn!(rule = %rule_name, rule_type = %ty, "unknown rule type, rows skipped");
            return Ok(());
        }

        for row in rows {
            if let Err(err) = self.insert_row(&rule, rule_name, &agent, &row) {
                warn!(rule = %rule_name, agent = %agent.name, %err, "row skipped");
            }
        }
        Ok(())
    }

    fn insert_row(
        &self,
        rule: &Rule,
        rule_name: &str,
        agent: &AgentRecord,
        row: &Map<String, Value>,
    ) -> Result<()> {
        let obj = match rule.target {
            RuleType::Ipv4Addr => object::ipv4_address(str_field(row, rule_name, "value")?),
            RuleType::Process => object::process(
                int_field(row, rule_name, "pid")?,
                str_field(row, rule_name, "path")?,
                str_field(row, rule_name, "cmdline")?,
            ),
            RuleType::File => {
                let mut hashes = Map::new();
                hashes.insert("MD5".into(), str_field(row, rule_name, "md5")?.into());
                hashes.insert("SHA-1".into(), str_field(row, rule_name, "sha1")?.into());
                hashes.insert("SHA-256".into(), str_field(row, rule_name, "sha256")?.into());
                object::file(
                    str_field(row, rule_name, "path")?,
                    int_field(row, rule_name, "size")?,
                    &epoch_field(row, rule_name, "ctime")?,
                    &epoch_field(row, rule_name, "mtime")?,
                    &epoch_field(row, rule_name, "atime")?,
                    hashes,
                )
            }
            RuleType::Vulnerability => object::vulnerability(
                str_field(row, rule_name, "name")?,
                str_field(row, rule_name, "description")?,
                row.get("external_references").cloned(),
            ),
            RuleType::NetworkTraffic => {
                return self.insert_traffic_row(rule, rule_name, agent, row);
            }
            RuleType::Other(_) => unreachable!("filtered in apply"),
        };

        let (created, obj_id) = self.store.create(obj, &agent.name, Tlp::Red, 0);
        if created {
            info!(id = %obj_id, rule_type = %rule.target.as_str(), agent = %agent.name, "stored telemetry object");
        }

        if matches!(rule.target, RuleType::Process | RuleType::File) {
            let rel = object::relationship(&agent.object_id, &obj_id, &rule.relationship);
            let (rel_created, rel_id) = self.store.create(rel, &agent.name, Tlp::Red, 0);
            if rel_created {
                let line = format!(
                    "{}: Detected {} relationship {} linking {} and {}",
                    timestamp(),
                    rule.relationship,
                    rel_id,
                    agent.object_id,
                    obj_id
                );
                self.store.append_history(&agent.object_id, line.clone());
                self.store.append_history(&obj_id, line);
                info!(id = %rel_id, agent = %agent.name, "stored relationship");
            }
        }
        Ok(())
    }

    /// Traffic rows name two addresses; both become ipv4-addr objects and
    /// the traffic tuple references whatever ids the store settled on.
    fn insert_traffic_row(
        &self,
        rule: &Rule,
        rule_name: &str,
        agent: &AgentRecord,
        row: &Map<String, Value>,
    ) -> Result<()> {
        let (_, src_id) = self.store.create(
            object::ipv4_address(str_field(row, rule_name, "local_address")?),
            &agent.name,
            Tlp::Red,
            0,
        );
        let (_, dst_id) = self.store.create(
            object::ipv4_address(str_field(row, rule_name, "remote_address")?),
            &agent.name,
            Tlp::Red,
            0,
        );

        let traffic = object::network_traffic(
            &src_id,
            &dst_id,
            int_field(row, rule_name, "local_port")?,
            int_field(row, rule_name, "remote_port")?,
            str_field(row, rule_name, "protocol")?,
        );
        let (created, traffic_id) = self.store.create(traffic, &agent.name, Tlp::Red, 0);
        if created {
            let label = &rule.relationship;
            let forward = format!(
                "{}: Detected network traffic {} {} > {} > {}",
                timestamp(),
                traffic_id,
                src_id,
                label,
                dst_id
            );
            let reverse = format!(
                "{}: Detected network traffic {} {} < {} < {}",
                timestamp(),
                traffic_id,
                dst_id,
                label,
                src_id
            );
            self.store.append_history(&agent.object_id, forward.clone());
            self.store.append_history(&src_id, forward);
            self.store.append_history(&dst_id, reverse);
            info!(id = %traffic_id, src = %src_id, dst = %dst_id, agent = %agent.name, "stored network traffic");
        }
        Ok(())
    }
}

fn str_field<'a>(row: &'a Map<String, Value>, rule: &str, key: &str) -> Result<&'a str> {
    row.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| CtiError::BadRow {
            rule: rule.to_string(),
            reason: format!("missing or non-string field `{key}`"),
        })
}

fn int_field(row: &Map<String, Value>, rule: &str, key: &str) -> Result<i64> {
    let raw = str_field(row, rule, key)?;
    raw.parse().map_err(|_| CtiError::BadRow {
        rule: rule.to_string(),
        reason: format!("field `{key}` is not an integer: {raw}"),
    })
}

fn epoch_field(row: &Map<String, Value>, rule: &str, key: &str) -> Result<String> {
    Ok(object::iso_from_epoch(int_field(row, rule, key)?))
}
