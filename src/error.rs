//! Error types for tielink

use thiserror::Error;

/// Main error type for tielink
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Host unreachable: {0}")]
    UnreachableHost(String),

    #[error("Timeout")]
    Timeout,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Router {0} not connected")]
    RouterNotConnected(crate::common::RouterId),

    #[error("Invalid index: {0}")]
    InvalidIndex(String),

    #[error("Request rejected by router")]
    Rejected,

    #[error("Route failed: {0}")]
    RouteFailed(String),

    #[error("No tie-lines available ({in_use}/{total} in use)")]
    NoTieLinesAvailable { in_use: usize, total: usize },

    #[error("Partial failure: source leg committed, destination leg failed: {0}")]
    PartialFailure(String),

    #[error("Configuration error: {0}")]
    ConfigInvalid(String),

    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Bridge error: {0}")]
    Bridge(String),
}

impl Error {
    /// Short kind name used in events and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Io(_) => "io",
            Error::UnreachableHost(_) => "unreachable-host",
            Error::Timeout => "timeout",
            Error::Protocol(_) => "protocol-error",
            Error::RouterNotConnected(_) => "router-not-connected",
            Error::InvalidIndex(_) => "invalid-index",
            Error::Rejected => "rejected",
            Error::RouteFailed(_) => "route-failed",
            Error::NoTieLinesAvailable { .. } => "no-tie-lines",
            Error::PartialFailure(_) => "partial-failure",
            Error::ConfigInvalid(_) => "config-invalid",
            Error::UnsupportedProtocol(_) => "unsupported-protocol",
            Error::ConnectionClosed => "connection-closed",
            Error::Bridge(_) => "bridge",
        }
    }
}

/// Result type alias for tielink
pub type Result<T> = std::result::Result<T, Error>;
