//! Transport Layer
//!
//! This module defines how the connection pool obtains sockets to the
//! downstream RPC server. The pool never opens sockets itself; it is handed a
//! [`TransportFactory`] and calls it whenever it needs a new connection or
//! wants to check that an idle one is still alive.
//!
//! # Components
//!
//! - **[`Endpoint`]**: host, port and per-call timeout of the target server
//! - **[`TransportFactory`]**: creates and validates connections
//! - **[`TcpConnector`]**: the TCP implementation used in production
//!
//! # Example
//!
//! ```no_run
//! use rpcproxy_common::transport::{Endpoint, TcpConnector, TransportFactory};
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let endpoint = Endpoint::new("svc.internal", 9090, Duration::from_millis(500));
//! let mut stream = TcpConnector::new().connect(&endpoint).await?;
//! assert!(TcpConnector::new().validate(&mut stream).await);
//! # Ok(())
//! # }
//! ```

pub mod tcp;

pub use tcp::TcpConnector;

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;

/// Address and timeout of the single downstream server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    /// Per-call timeout. `Duration::ZERO` means no timeout.
    pub timeout: Duration,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            timeout,
        }
    }

    /// Returns the timeout to apply, or `None` when it is unbounded.
    pub fn bounded_timeout(&self) -> Option<Duration> {
        if self.timeout.is_zero() {
            None
        } else {
            Some(self.timeout)
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Creates and checks connections for a connection pool.
///
/// Implementations must be cheap to share; the pool keeps one instance behind
/// an `Arc` and calls it from the borrowing task and from the background
/// evictor. Neither method is ever called while the pool's lock is held.
pub trait TransportFactory: Send + Sync + 'static {
    /// The connection type handed out by the pool.
    type Connection: Send + 'static;

    /// Opens a new connection to `endpoint`.
    fn connect(
        &self,
        endpoint: &Endpoint,
    ) -> impl Future<Output = Result<Self::Connection>> + Send;

    /// Checks that an idle connection is still usable.
    ///
    /// Must complete in bounded time.
    fn validate(&self, conn: &mut Self::Connection) -> impl Future<Output = bool> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_display() {
        let endpoint = Endpoint::new("svc.internal", 9090, Duration::from_millis(500));
        assert_eq!(endpoint.to_string(), "svc.internal:9090");
    }

    #[test]
    fn test_zero_timeout_is_unbounded() {
        let endpoint = Endpoint::new("localhost", 1, Duration::ZERO);
        assert!(endpoint.bounded_timeout().is_none());

        let endpoint = Endpoint::new("localhost", 1, Duration::from_millis(20));
        assert_eq!(endpoint.bounded_timeout(), Some(Duration::from_millis(20)));
    }
}
