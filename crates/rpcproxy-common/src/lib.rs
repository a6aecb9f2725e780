//! RPC Proxy Common Types and Transport
//!
//! This crate provides the pieces shared by every part of the RPC proxy:
//!
//! - [`error`] - the [`ProxyError`] taxonomy and `Result` alias
//! - [`transport`] - the [`Endpoint`] type, the [`TransportFactory`] abstraction
//!   the connection pool depends on, and the [`TcpConnector`] that implements it
//!   over TCP
//!
//! The RPC wire format itself (framing and argument encoding) is not handled
//! here; callers run their own protocol over the sockets the pool hands out.

pub mod error;
pub mod transport;

pub use error::{ProxyError, Result};
pub use transport::{Endpoint, TcpConnector, TransportFactory};
