use std::future::Future;
use std::io;
use std::time::Duration;

use tokio::net::TcpStream;

use crate::error::{ProxyError, Result};
use crate::transport::{Endpoint, TransportFactory};

/// Upper bound on how long an idle-socket check may take.
const VALIDATION_TIMEOUT: Duration = Duration::from_millis(10);

/// TCP transport factory.
///
/// Resolves the endpoint host (which may yield several addresses) and tries
/// each until one accepts, bounded by the endpoint timeout. Connected sockets
/// have `TCP_NODELAY` set since RPC traffic is request/response shaped.
///
/// # Validation
///
/// An idle socket should have nothing to read. [`validate`](TransportFactory::validate)
/// peeks with a short timeout:
/// - the peek times out: nothing pending, the peer is still there (valid)
/// - the peek returns 0 bytes: the peer closed the connection (invalid)
/// - the peek fails: the socket is broken (invalid)
/// - data is pending: unsolicited bytes on an idle RPC socket (invalid)
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl TcpConnector {
    pub fn new() -> Self {
        Self
    }

    async fn connect_any(endpoint: &Endpoint) -> Result<TcpStream> {
        let addrs = tokio::net::lookup_host((endpoint.host.as_str(), endpoint.port))
            .await
            .map_err(|e| ProxyError::transport("resolve", e))?;

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    tracing::debug!(%addr, error = %e, "Connect attempt failed");
                    last_err = Some(e);
                }
            }
        }

        Err(ProxyError::transport(
            "connect",
            last_err.unwrap_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("{} resolved to no addresses", endpoint),
                )
            }),
        ))
    }

    /// Map IO errors to transport errors, normalizing timeouts.
    fn map_io_error(err: io::Error, operation: &'static str) -> ProxyError {
        match err.kind() {
            io::ErrorKind::WouldBlock => ProxyError::transport(
                operation,
                io::Error::new(io::ErrorKind::TimedOut, err.to_string()),
            ),
            _ => ProxyError::transport(operation, err),
        }
    }
}

impl TransportFactory for TcpConnector {
    type Connection = TcpStream;

    fn connect(&self, endpoint: &Endpoint) -> impl Future<Output = Result<TcpStream>> + Send {
        let endpoint = endpoint.clone();
        async move {
            let stream = match endpoint.bounded_timeout() {
                Some(limit) => tokio::time::timeout(limit, Self::connect_any(&endpoint))
                    .await
                    .map_err(|_| {
                        ProxyError::transport(
                            "connect",
                            io::Error::new(
                                io::ErrorKind::TimedOut,
                                format!("connecting to {} took longer than {}ms", endpoint, limit.as_millis()),
                            ),
                        )
                    })??,
                None => Self::connect_any(&endpoint).await?,
            };

            stream
                .set_nodelay(true)
                .map_err(|e| Self::map_io_error(e, "configure socket"))?;

            Ok(stream)
        }
    }

    fn validate(&self, conn: &mut TcpStream) -> impl Future<Output = bool> + Send {
        async move {
            let mut buf = [0u8; 1];
            match tokio::time::timeout(VALIDATION_TIMEOUT, conn.peek(&mut buf)).await {
                Err(_) => true,
                Ok(Ok(0)) => false,
                Ok(Ok(_)) => false,
                Ok(Err(e)) => {
                    tracing::debug!(error = %e, "Idle socket failed validation");
                    false
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn listener() -> (TcpListener, Endpoint) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, Endpoint::new("127.0.0.1", port, Duration::from_millis(500)))
    }

    #[tokio::test]
    async fn test_connect_and_validate_open_socket() {
        let (listener, endpoint) = listener().await;
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
            drop(socket);
        });

        let connector = TcpConnector::new();
        let mut stream = connector.connect(&endpoint).await.unwrap();
        assert!(stream.nodelay().unwrap());
        assert!(connector.validate(&mut stream).await);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_validate_detects_closed_peer() {
        let (listener, endpoint) = listener().await;
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let connector = TcpConnector::new();
        let mut stream = connector.connect(&endpoint).await.unwrap();
        server.await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!connector.validate(&mut stream).await);
    }

    #[tokio::test]
    async fn test_validate_rejects_unsolicited_data() {
        let (listener, endpoint) = listener().await;
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"x").await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let connector = TcpConnector::new();
        let mut stream = connector.connect(&endpoint).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!connector.validate(&mut stream).await);
        server.abort();
    }

    #[tokio::test]
    async fn test_connect_refused_is_transport_error() {
        // Bind then drop to get a port nobody listens on
        let (listener, endpoint) = listener().await;
        drop(listener);

        let result = TcpConnector::new().connect(&endpoint).await;
        match result {
            Err(ProxyError::Transport { operation, .. }) => assert_eq!(operation, "connect"),
            other => panic!("Expected transport error, got {:?}", other.map(|_| ())),
        }
    }
}
