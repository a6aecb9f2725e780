use rpcproxy_common::error::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Identifies which remote service's interface and handlers to resolve.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceDescriptor(String);

impl ServiceDescriptor {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn id(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Executes one procedure given its decoded arguments.
pub trait ProcedureHandler: Send + Sync {
    fn name(&self) -> &str;

    fn execute(&self, args: Value) -> Result<Value>;
}

/// Instantiates the handler for one procedure.
pub trait HandlerFactory: Send + Sync {
    fn instantiate(&self) -> Result<Arc<dyn ProcedureHandler>>;
}

impl<F> HandlerFactory for F
where
    F: Fn() -> Result<Arc<dyn ProcedureHandler>> + Send + Sync,
{
    fn instantiate(&self) -> Result<Arc<dyn ProcedureHandler>> {
        self()
    }
}

/// Resolves a service descriptor into its procedures and handler types.
///
/// This is the introspection seam: the registry only asks which procedures the
/// service interface declares and which handler type serves each one.
pub trait ServiceResolver: Send + Sync {
    /// Procedure names declared on the service interface.
    fn resolve_interface(&self, service: &ServiceDescriptor) -> Result<Vec<String>>;

    /// Handler type for one declared procedure.
    fn resolve_handler(
        &self,
        service: &ServiceDescriptor,
        procedure: &str,
    ) -> Result<Arc<dyn HandlerFactory>>;
}

/// Handler backed by a closure.
pub struct FnHandler {
    name: String,
    func: Box<dyn Fn(Value) -> Result<Value> + Send + Sync>,
}

impl FnHandler {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Box::new(func),
        }
    }
}

impl ProcedureHandler for FnHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, args: Value) -> Result<Value> {
        (self.func)(args)
    }
}

/// Procedure name to handler mapping.
///
/// Built once from a service descriptor and read-only afterwards, so lookups
/// need no synchronization.
#[derive(Default, Clone)]
pub struct MethodRegistry {
    handlers: HashMap<String, Arc<dyn ProcedureHandler>>,
}

impl MethodRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds the registry for `service`.
    ///
    /// Every procedure declared on the service interface must resolve to a
    /// handler type that instantiates; any failure fails the whole build.
    /// No network or disk I/O happens here beyond what the resolver does.
    pub fn build(service: &ServiceDescriptor, resolver: &dyn ServiceResolver) -> Result<Self> {
        let build_error = |reason: String| ProxyError::RegistryBuild {
            service: service.id().to_string(),
            reason,
        };

        let procedures = resolver
            .resolve_interface(service)
            .map_err(|e| build_error(format!("cannot resolve service interface: {}", e)))?;

        let mut handlers = HashMap::with_capacity(procedures.len());
        for procedure in procedures {
            let factory = resolver
                .resolve_handler(service, &procedure)
                .map_err(|e| build_error(format!("no handler type for '{}': {}", procedure, e)))?;
            let handler = factory
                .instantiate()
                .map_err(|e| build_error(format!("cannot instantiate handler for '{}': {}", procedure, e)))?;

            debug!(service = %service, procedure = %procedure, "Registered procedure handler");
            if handlers.insert(procedure.clone(), handler).is_some() {
                return Err(build_error(format!("procedure '{}' declared twice", procedure)));
            }
        }

        Ok(Self { handlers })
    }

    /// Looks up the handler for `procedure`.
    pub fn get(&self, procedure: &str) -> Result<Arc<dyn ProcedureHandler>> {
        self.handlers
            .get(procedure)
            .cloned()
            .ok_or_else(|| ProxyError::NotFound(procedure.to_string()))
    }

    pub fn contains(&self, procedure: &str) -> bool {
        self.handlers.contains_key(procedure)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered procedure names, sorted.
    pub fn procedure_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodRegistry")
            .field("procedures", &self.procedure_names())
            .finish()
    }
}
