use std::io;
use thiserror::Error;

/// Errors surfaced by the server core.
///
/// Configuration and bind errors are fatal at startup; the remaining kinds
/// are attributable to a single connection or request and are caught at the
/// request boundary.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid endpoint, route, auth or scheduler configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Socket bind failure (address in use, permission denied).
    #[error("failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    /// TLS material could not be loaded or the handshake failed.
    #[error("tls error: {0}")]
    Tls(String),

    /// The peer sent bytes that do not parse as the endpoint's protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Request exceeded a configured limit (body size, header count).
    #[error("request limit exceeded: {0}")]
    LimitExceeded(String),

    /// A route handler or middleware returned an error.
    #[error("handler error: {0}")]
    Handler(#[from] anyhow::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
