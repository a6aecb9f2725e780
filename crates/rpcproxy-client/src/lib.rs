//! Connection pooling for the RPC proxy.
//!
//! [`ConnectionPool`] keeps a bounded set of live connections to a single
//! downstream endpoint, hands them out as [`PooledConnection`] leases and
//! takes them back through `release` (healthy) or `invalidate` (broken).
//! Idle connections are swept on a fixed interval by a background evictor.

pub mod config;
pub mod evictor;
pub mod pool;

pub use config::{ExhaustionPolicy, PoolConfig};
pub use evictor::SweepReport;
pub use pool::{ConnectionPool, PoolStats, PooledConnection};
