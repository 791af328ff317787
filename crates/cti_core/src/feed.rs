//! Threat-intelligence feed ingestion.
//!
//! A background loop fetches each configured feed over HTTP and folds the
//! returned bundles into the store. Content the store already holds (by
//! fingerprint) only has its metadata merged; novel content is inserted
//! after feed-local ids are stitched to the canonical ids the store
//! assigned earlier in the same bundle. The ingestor never deletes.

use crate::error::Result;
use crate::object::{self, CtiObject, Tlp};
use crate::store::CtiStore;
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const FETCH_TIMEOUT: Duration = Duration::from_secs(15);

/// One bundle as a feed publishes it; all three lists are optional.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct FeedBundle {
    #[serde(default)]
    pub objects: Vec<Map<String, Value>>,
    #[serde(default)]
    pub relationships: Vec<Map<String, Value>>,
    #[serde(default)]
    pub network_traffic: Vec<Map<String, Value>>,
}

/// Periodic feed reader.
pub struct FeedIngestor {
    feeds: RwLock<BTreeMap<String, String>>,
    store: Arc<CtiStore>,
    client: reqwest::Client,
    period: Duration,
}

impl FeedIngestor {
    /// Builds an ingestor over the configured `name -> url` table.
    pub fn new(store: Arc<CtiStore>, feeds: BTreeMap<String, String>) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(FETCH_TIMEOUT).build()?;
        Ok(Self {
            feeds: RwLock::new(feeds),
            store,
            client,
            period: Duration::from_secs(60),
        })
    }

    /// Overrides the polling period.
    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Adds a feed; refuses a duplicate name.
    pub fn create(&self, name: &str, url: &str) -> bool {
        let mut feeds = self.feeds.write();
        if feeds.contains_key(name) {
            return false;
        }
        feeds.insert(name.to_string(), url.to_string());
        true
    }

    /// Url for a feed.
    pub fn read(&self, name: &str) -> Option<String> {
        self.feeds.read().get(name).cloned()
    }

    /// Repoints an existing feed.
    pub fn update(&self, name: &str, url: &str) -> bool {
        match self.feeds.write().get_mut(name) {
            Some(slot) => {
                *slot = url.to_string();
                true
            }
            None => false,
        }
    }

    /// Drops a feed from the rotation.
    pub fn remove(&self, name: &str) -> bool {
        self.feeds.write().remove(name).is_some()
    }

    /// Configured feeds, name to url.
    pub fn list(&self) -> BTreeMap<String, String> {
        self.feeds.read().clone()
    }

    /// Polls every feed until cancellation; errors only cost one cycle.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(period = ?self.period, "feed loop started");
        loop {
            let snapshot = self.list();
            for (name, url) in snapshot {
                if let Err(e) = self.read_feed(&name, &url).await {
                    warn!(feed = %name, %e, "feed fetch failed, retrying next cycle");
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.period) => {}
            }
        }
        info!("feed loop stopped");
    }

    async fn read_feed(&self, name: &str, url: &str) -> Result<()> {
        debug!(feed = %name, url, "reading feed");
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            warn!(feed = %name, status = %response.status(), "feed returned non-success");
            return Ok(());
        }
        let bundles: Vec<FeedBundle> = response.json().await?;
        info!(feed = %name, bundles = bundles.len(), "feed read");
        for bundle in bundles {
            self.ingest_bundle(bundle, name);
        }
        Ok(())
    }

    /// Folds one bundle into the store.
    ///
    /// Items are processed in publication order (objects, traffic,
    /// relationships) sharing one rebind map, so a relationship authored
    /// against a feed-local id stitches to the canonical id before its own
    /// fingerprint is computed.
    pub fn ingest_bundle(&self, bundle: FeedBundle, origin: &str) {
        let mut rebound: HashMap<String, String> = HashMap::new();
        let items = bundle
            .objects
            .into_iter()
            .chain(bundle.network_traffic)
            .chain(bundle.relationships);
        for item in items {
            self.ingest_item(&mut rebound, item, origin);
        }
    }

    fn ingest_item(
        &self,
        rebound: &mut HashMap<String, String>,
        mut item: Map<String, Value>,
        origin: &str,
    ) {
        for value in item.values_mut() {
            if let Value::String(s) = value {
                if let Some(canonical) = rebound.get(s.as_str()) {
                    *value = Value::String(canonical.clone());
                }
            }
        }

        // tlp/risk ride along in feed items but are metadata, not content.
        let tlp: Option<Tlp> = item
            .remove("tlp")
            .and_then(|v| v.as_str().and_then(|s| s.parse().ok()));
        let risk: Option<u8> = item
            .remove("risk")
            .and_then(|v| v.as_u64())
            .map(|r| r.min(100) as u8);

        let Some(obj) = CtiObject::from_map(item) else {
            warn!(feed = %origin, "feed item without id/type skipped");
            return;
        };
        let feed_id = obj.id().to_string();

        if let Some(existing) = self.store.lookup(&obj) {
            self.store.merge_metadata(&existing, origin, tlp, risk);
            rebound.insert(feed_id, existing);
            return;
        }

        let obj = if obj.object_type() == "relationship" {
            // Relationships are re-minted so the server owns their ids and
            // their content is reduced to the canonical triple.
            match (
                obj.get_str("source_ref"),
                obj.get_str("target_ref"),
                obj.get_str("relationship_type"),
            ) {
                (Some(source), Some(target), Some(label)) => {
                    object::relationship(source, target, label)
                }
                _ => {
                    warn!(feed = %origin, id = %feed_id, "incomplete relationship skipped");
                    return;
                }
            }
        } else {
            obj
        };

        let (created, id) = self.store.create(
            obj,
            origin,
            tlp.unwrap_or(Tlp::White),
            risk.unwrap_or(0),
        );
        if created {
            info!(feed = %origin, %id, "added feed object");
        }
    }
}
