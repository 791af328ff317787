//! Error types for cti_core operations.

use thiserror::Error;

/// Core error type for cti_core operations.
#[derive(Error, Debug)]
pub enum CtiError {
    /// Invalid hex string for fingerprint parsing.
    #[error("invalid hex string: {0}")]
    InvalidHex(String),

    /// An inbound ip address did not resolve to a registered agent.
    #[error("no registered agent for address {0}")]
    UnknownAgent(String),

    /// A telemetry payload referenced a rule that is not loaded.
    #[error("unknown rule: {0}")]
    UnknownRule(String),

    /// A telemetry row was missing a field or carried an unparsable value.
    #[error("bad row for rule {rule}: {reason}")]
    BadRow {
        /// The rule the row was reported under
        rule: String,
        /// What was wrong with the row
        reason: String,
    },

    /// A wire frame announced a length above the configured cap.
    #[error("frame of {len} bytes exceeds the {limit} byte limit")]
    FrameTooLarge {
        /// Announced frame length
        len: usize,
        /// Maximum accepted length
        limit: usize,
    },

    /// A peer sent something that is not a valid protocol message.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Configuration file was missing, malformed, or incomplete.
    #[error("configuration error: {0}")]
    Config(String),

    /// TLS material could not be loaded or the acceptor could not be built.
    #[error("tls error: {0}")]
    Tls(String),

    /// JSON serialization or deserialization failure.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Underlying I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Feed fetch failure.
    #[error("feed error: {0}")]
    Feed(#[from] reqwest::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CtiError>;
