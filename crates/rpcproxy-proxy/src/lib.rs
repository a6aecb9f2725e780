//! RPC Proxy
//!
//! A client-side proxy that lets a host process invoke procedures on one
//! downstream RPC server over pooled connections.
//!
//! # Components
//!
//! - [`MethodRegistry`]: procedure name to handler mapping, built once at
//!   initialization through a [`ServiceResolver`]
//! - [`ServiceCatalog`]: in-process resolver that finds interface and handler
//!   types by naming convention
//! - [`Proxy`]: lifecycle state machine owning the registry and the
//!   connection pool
//! - [`ProxyConfig`]: endpoint, timeout, service and pool settings
//!
//! # Request Flow
//!
//! 1. Look up the handler for a procedure with [`Proxy::lookup_handler`]
//! 2. Borrow a connection with [`Proxy::borrow_connection`]
//! 3. Run the call over the connection
//! 4. Hand the connection back with [`Proxy::release_connection`], passing
//!    `false` if a transport fault was observed

pub mod catalog;
pub mod config;
pub mod context;
pub mod proxy;
pub mod registry;

pub use catalog::ServiceCatalog;
pub use config::ProxyConfig;
pub use context::LifecycleContext;
pub use proxy::{Proxy, ProxyState, HANDLER_TYPE};
pub use registry::{
    FnHandler, HandlerFactory, MethodRegistry, ProcedureHandler, ServiceDescriptor,
    ServiceResolver,
};
