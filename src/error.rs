use thiserror::Error;

/// Errors that cross module boundaries in wakegate.
///
/// Transient connectivity failures never appear here — probing and waking
/// report plain booleans, and per-connection failures are logged and
/// absorbed at the task boundary. What remains is configuration problems
/// and per-service listener bind failures.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("config error: {0}")]
    Config(String),

    #[error("invalid MAC address: {0}")]
    InvalidMac(String),

    #[error("bind failed on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
}

impl From<toml::de::Error> for ProxyError {
    fn from(e: toml::de::Error) -> Self {
        ProxyError::Config(e.to_string())
    }
}

impl From<serde_json::Error> for ProxyError {
    fn from(e: serde_json::Error) -> Self {
        ProxyError::Config(e.to_string())
    }
}

pub type ProxyResult<T> = Result<T, ProxyError>;
