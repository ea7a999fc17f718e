//! Proxy error types
use std::io;

/// Configuration load/reload/validation failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("config validation failed: {0}")]
    Invalid(String),
}

/// Rover-facing protocol failures, recovered locally by the session engine.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("request line missing or unrecognized")]
    UnrecognizedRequest,

    #[error("malformed GPGGA sentence: {0}")]
    MalformedGpgga(String),
}

/// Upstream caster dial/transport failures.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("upstream config invalid: {0}")]
    Config(String),

    #[error("upstream connect to {host}:{port} timed out after {secs}s")]
    Timeout { host: String, port: u16, secs: u64 },

    #[error("upstream transport error: {0}")]
    Io(#[from] io::Error),
}

/// Top-level proxy error, composed from each component's error kind.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}
