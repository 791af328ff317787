//! Host-telemetry and threat-intelligence correlation core.
//!
//! This crate is the server-side data plane for a fleet of monitoring
//! agents:
//!
//! - a content-addressed CTI object store with fingerprint deduplication,
//!   TLP/risk metadata and a composite graph index ([`CtiStore`])
//! - a graph-walking alert engine with path enumeration, depth-attenuated
//!   scoring and novelty tracking ([`AlertEngine`])
//! - an adaptive query-rule engine that turns agent telemetry into typed
//!   objects and maps aggregated risk back into collection rules
//!   ([`RuleEngine`])
//! - a TLS channel multiplexing long-lived agent sessions with framed
//!   JSON messages ([`channel`])
//! - a periodic ingestor for external intelligence feeds ([`FeedIngestor`])
//!
//! # Quick start
//!
//! ```
//! use cti_core::{object, CtiStore, Tlp};
//!
//! let store = CtiStore::new();
//!
//! // First sighting creates the object.
//! let (created, id) = store.create(object::ipv4_address("1.2.3.4"), "agent_a", Tlp::Red, 10);
//! assert!(created);
//!
//! // The same content from another source deduplicates onto it, and the
//! // metadata only ever moves up.
//! let (created, same) = store.create(object::ipv4_address("1.2.3.4"), "feed_x", Tlp::Amber, 20);
//! assert!(!created);
//! assert_eq!(id, same);
//!
//! let view = store.read(&id).unwrap();
//! assert_eq!(view["tlp"], "red");
//! assert_eq!(view["risk"], 20);
//! ```

pub mod alert;
pub mod channel;
pub mod codec;
pub mod config;
pub mod error;
pub mod feed;
pub mod fingerprint;
pub mod graph;
pub mod object;
pub mod registry;
pub mod rules;
pub mod server;
pub mod store;

pub use alert::{Alert, AlertConfig, AlertEngine, AlertStatus};
pub use config::ServerConfig;
pub use error::{CtiError, Result};
pub use feed::{FeedBundle, FeedIngestor};
pub use fingerprint::Fingerprint;
pub use graph::{GraphEdge, GraphNode, ObjectGraph};
pub use object::{CtiObject, Metadata, Tlp};
pub use registry::{AgentRecord, AgentRegistry};
pub use rules::{Rule, RuleEngine, RuleType};
pub use server::Server;
pub use store::{CtiStore, FilterOp, QueryFilter};
