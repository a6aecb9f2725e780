use thiserror::Error;

/// Errors surfaced by the proxy, its registry and its connection pool.
///
/// Configuration and registry errors are fatal at initialization time.
/// Everything else is reported to the individual caller and leaves the
/// shared proxy usable (see [`ProxyError::is_recoverable`]).
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Registry build failed for service '{service}': {reason}")]
    RegistryBuild { service: String, reason: String },

    #[error("Pool exhausted: no connection available after {waited_ms}ms")]
    PoolExhausted { waited_ms: u64 },

    #[error("Transport error during {operation}: {source}")]
    Transport {
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Procedure not found: {0}")]
    NotFound(String),

    #[error("Cannot {operation} while proxy is {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    #[error("Connection pool is closed")]
    PoolClosed,

    #[error("Invalid connection handle: {0}")]
    InvalidHandle(String),

    #[error("Handler error: {0}")]
    Handler(String),
}

impl ProxyError {
    /// Wraps an I/O error with the name of the operation that observed it.
    pub fn transport(operation: &'static str, source: std::io::Error) -> Self {
        ProxyError::Transport { operation, source }
    }

    /// Returns true for per-request failures that leave the proxy serviceable.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProxyError::PoolExhausted { .. }
                | ProxyError::Transport { .. }
                | ProxyError::NotFound(_)
                | ProxyError::InvalidHandle(_)
                | ProxyError::Handler(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_transport_error_keeps_operation_and_source() {
        let err = ProxyError::transport(
            "connect",
            std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
        );
        assert_eq!(err.to_string(), "Transport error during connect: refused");
        assert!(err.source().is_some());
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(ProxyError::PoolExhausted { waited_ms: 100 }.is_recoverable());
        assert!(ProxyError::NotFound("add".into()).is_recoverable());
        assert!(!ProxyError::Configuration("missing host".into()).is_recoverable());
        assert!(!ProxyError::RegistryBuild {
            service: "svc".into(),
            reason: "no interface".into(),
        }
        .is_recoverable());
        assert!(!ProxyError::PoolClosed.is_recoverable());
    }
}
