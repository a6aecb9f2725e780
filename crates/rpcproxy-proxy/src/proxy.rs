use rpcproxy_client::{ConnectionPool, PoolStats, PooledConnection};
use rpcproxy_common::error::{ProxyError, Result};
use rpcproxy_common::transport::{TcpConnector, TransportFactory};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::ProxyConfig;
use crate::context::LifecycleContext;
use crate::registry::{MethodRegistry, ProcedureHandler, ServiceResolver};

/// Handler type reported to the host framework.
pub const HANDLER_TYPE: &str = "RpcProxy";

/// Lifecycle state of a [`Proxy`].
///
/// Transitions only move forward:
/// `Unconfigured -> Validated -> Initialized -> ShutDown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProxyState {
    Unconfigured = 0,
    Validated = 1,
    /// Ready to serve requests
    Initialized = 2,
    ShutDown = 3,
}

impl ProxyState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ProxyState::Unconfigured,
            1 => ProxyState::Validated,
            2 => ProxyState::Initialized,
            _ => ProxyState::ShutDown,
        }
    }
}

impl fmt::Display for ProxyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProxyState::Unconfigured => "unconfigured",
            ProxyState::Validated => "validated",
            ProxyState::Initialized => "initialized",
            ProxyState::ShutDown => "shut down",
        };
        f.write_str(name)
    }
}

/// Client-side proxy for one downstream RPC service.
///
/// Combines a [`MethodRegistry`] built from the configured service descriptor
/// with a [`ConnectionPool`] bound to the configured endpoint. The host drives
/// the lifecycle ([`validate`](Self::validate), [`initialize`](Self::initialize),
/// [`shutdown`](Self::shutdown)) once each, in that order; request-serving code
/// then shares the proxy (typically behind an `Arc`) and calls
/// [`lookup_handler`](Self::lookup_handler),
/// [`borrow_connection`](Self::borrow_connection) and
/// [`release_connection`](Self::release_connection) concurrently.
///
/// # Example
///
/// ```rust,no_run
/// use rpcproxy_proxy::{LifecycleContext, Proxy, ProxyConfig, ServiceCatalog, ServiceDescriptor};
/// use std::sync::Arc;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// # let catalog = ServiceCatalog::new();
/// let config = ProxyConfig::new("svc.internal", 9090, ServiceDescriptor::new("calc.Calculator"))
///     .with_timeout_ms(500);
/// let mut proxy = Proxy::new(config, Arc::new(catalog));
/// proxy.validate()?;
/// proxy.initialize(&LifecycleContext::new())?;
///
/// let handler = proxy.lookup_handler("add")?;
/// let conn = proxy.borrow_connection().await?;
/// // Run the call over `conn` with `handler`...
/// proxy.release_connection(conn, true)?;
/// # Ok(())
/// # }
/// ```
pub struct Proxy<F: TransportFactory = TcpConnector> {
    config: ProxyConfig,
    resolver: Arc<dyn ServiceResolver>,
    factory: F,
    state: AtomicU8,
    registry: MethodRegistry,
    pool: Option<ConnectionPool<F>>,
}

impl Proxy<TcpConnector> {
    /// Creates a proxy that connects over TCP.
    pub fn new(config: ProxyConfig, resolver: Arc<dyn ServiceResolver>) -> Self {
        Self::with_factory(config, resolver, TcpConnector::new())
    }
}

impl<F: TransportFactory + Clone> Proxy<F> {
    /// Creates a proxy with a custom transport factory.
    pub fn with_factory(config: ProxyConfig, resolver: Arc<dyn ServiceResolver>, factory: F) -> Self {
        Self {
            config,
            resolver,
            factory,
            state: AtomicU8::new(ProxyState::Unconfigured as u8),
            registry: MethodRegistry::empty(),
            pool: None,
        }
    }

    pub fn state(&self) -> ProxyState {
        ProxyState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&mut self, state: ProxyState) {
        *self.state.get_mut() = state as u8;
    }

    fn expect_state(&self, expected: ProxyState, operation: &'static str) -> Result<()> {
        let state = self.state();
        if state == expected {
            Ok(())
        } else {
            Err(ProxyError::InvalidState {
                operation,
                state: state.to_string(),
            })
        }
    }

    /// Checks that all mandatory configuration is present.
    pub fn validate(&mut self) -> Result<()> {
        self.expect_state(ProxyState::Unconfigured, "validate configuration")?;
        self.config.validate()?;
        self.set_state(ProxyState::Validated);
        info!(service = %self.name(), "Proxy configuration validated");
        Ok(())
    }

    /// Builds the method registry and the connection pool.
    ///
    /// Fails, leaving the proxy not ready, when the service descriptor is
    /// absent, the registry comes out empty, or the per-call timeout was
    /// never set.
    pub fn initialize(&mut self, context: &LifecycleContext) -> Result<()> {
        self.expect_state(ProxyState::Validated, "initialize")?;

        let service = self.config.service.clone().ok_or_else(|| {
            ProxyError::Configuration("'service' may not be absent".to_string())
        })?;

        let (registry, build_error) = match MethodRegistry::build(&service, self.resolver.as_ref()) {
            Ok(registry) => (registry, None),
            Err(e) => {
                error!(service = %service, error = %e, "Unable to inspect service definition");
                (MethodRegistry::empty(), Some(e))
            }
        };
        if registry.is_empty() {
            return Err(build_error.unwrap_or_else(|| ProxyError::RegistryBuild {
                service: service.id().to_string(),
                reason: "no procedure handlers were registered; is the service descriptor valid?"
                    .to_string(),
            }));
        }

        let endpoint = self.config.endpoint()?;
        let pool = ConnectionPool::new(self.factory.clone(), endpoint, self.config.pool.clone())?;

        info!(
            service = %service,
            endpoint = %pool.endpoint(),
            procedures = registry.len(),
            context = ?context.properties(),
            "Proxy initialized"
        );

        self.registry = registry;
        self.pool = Some(pool);
        self.set_state(ProxyState::Initialized);
        Ok(())
    }

    /// Deactivates the proxy.
    ///
    /// New requests are refused from here on. Idle connections are closed;
    /// connections still leased are destroyed as they are released.
    pub fn shutdown(&self, context: &LifecycleContext) -> Result<()> {
        self.state
            .compare_exchange(
                ProxyState::Initialized as u8,
                ProxyState::ShutDown as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|current| ProxyError::InvalidState {
                operation: "shut down",
                state: ProxyState::from_u8(current).to_string(),
            })?;

        if let Some(pool) = &self.pool {
            pool.close();
        }
        info!(service = %self.name(), context = ?context.properties(), "Proxy shut down");
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.state() == ProxyState::Initialized
    }

    fn ready_pool(&self, operation: &'static str) -> Result<&ConnectionPool<F>> {
        self.expect_state(ProxyState::Initialized, operation)?;
        self.pool.as_ref().ok_or(ProxyError::InvalidState {
            operation,
            state: ProxyState::Validated.to_string(),
        })
    }

    /// Finds the handler for `procedure`.
    pub fn lookup_handler(&self, procedure: &str) -> Result<Arc<dyn ProcedureHandler>> {
        self.expect_state(ProxyState::Initialized, "look up handler")?;
        self.registry.get(procedure)
    }

    /// Borrows a pooled connection to the downstream server.
    pub async fn borrow_connection(&self) -> Result<PooledConnection<F>> {
        let pool = self.ready_pool("borrow connection")?;
        pool.borrow().await.map_err(|e| {
            error!(service = %self.name(), error = %e, "Error while borrowing connection");
            e
        })
    }

    /// Ends the lease on `conn`.
    ///
    /// `was_valid` is false when the caller saw a transport fault on the
    /// connection; it is then destroyed instead of returned. Accepted after
    /// shutdown too, so outstanding leases can still be settled.
    pub fn release_connection(&self, conn: PooledConnection<F>, was_valid: bool) -> Result<()> {
        let pool = self.pool.as_ref().ok_or(ProxyError::InvalidState {
            operation: "release connection",
            state: self.state().to_string(),
        })?;

        let result = if was_valid {
            pool.release(conn)
        } else {
            pool.invalidate(conn)
        };
        result.map_err(|e| {
            warn!(service = %self.name(), error = %e, "Error while returning connection");
            e
        })
    }

    /// Name of this proxy: the configured service identifier.
    pub fn name(&self) -> &str {
        self.config
            .service
            .as_ref()
            .map(|service| service.id())
            .unwrap_or_default()
    }

    pub fn handler_type(&self) -> &'static str {
        HANDLER_TYPE
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn procedure_names(&self) -> Vec<String> {
        self.registry.procedure_names()
    }

    pub fn pool_stats(&self) -> Option<PoolStats> {
        self.pool.as_ref().map(ConnectionPool::stats)
    }
}
