//! Server configuration, read once at startup from an INI file.

use crate::error::{CtiError, Result};
use config::{Config, File, FileFormat};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// The `[server]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    /// Address the agent channel listens on, `ip:port`.
    pub host: String,
    /// Address reserved for the operator interface, `ip:port`.
    pub interface: Option<String>,
    /// PEM certificate chain presented to agents.
    pub certfile: PathBuf,
    /// PEM private key for the certificate.
    pub keyfile: PathBuf,
    /// Agent heartbeat interval in seconds, consumed by the agent harness.
    #[serde(default = "default_heartbeat")]
    pub heartbeat: u64,
    /// Log destination; stderr when absent.
    pub logfile: Option<PathBuf>,
    /// Path to the JSON query-rule bundle.
    pub queryfile: PathBuf,
}

fn default_heartbeat() -> u64 {
    60
}

impl ServerSection {
    /// The agent listener address, parsed.
    pub fn host_addr(&self) -> Result<SocketAddr> {
        self.host
            .parse()
            .map_err(|_| CtiError::Config(format!("invalid host address: {}", self.host)))
    }
}

/// Whole configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Required `[server]` section.
    pub server: ServerSection,
    /// `[agents]`: name to `internal_ip` or `internal_ip|external_ip`.
    #[serde(default)]
    pub agents: BTreeMap<String, String>,
    /// `[feeds]`: name to fetch url.
    #[serde(default)]
    pub feeds: BTreeMap<String, String>,
}

impl ServerConfig {
    /// Loads and deserializes the INI file; a missing or incomplete
    /// `[server]` section is fatal here and nowhere else.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = Config::builder()
            .add_source(File::from(path).format(FileFormat::Ini))
            .build()
            .map_err(|e| CtiError::Config(e.to_string()))?;
        raw.try_deserialize()
            .map_err(|e| CtiError::Config(e.to_string()))
    }
}

/// Splits an `[agents]` value into internal and optional external address.
pub fn split_agent_hosts(value: &str) -> (String, Option<String>) {
    match value.split_once('|') {
        Some((internal, external)) => (internal.trim().to_string(), Some(external.trim().to_string())),
        None => (value.trim().to_string(), None),
    }
}
