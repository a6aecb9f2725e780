use rpcproxy_common::error::{ProxyError, Result};
use std::collections::HashMap;
use std::sync::Arc;

use crate::registry::{HandlerFactory, ServiceDescriptor, ServiceResolver};

/// Name under which a service's interface is registered.
pub fn interface_type_name(service: &ServiceDescriptor) -> String {
    format!("{}.Iface", service.id())
}

/// Name under which the handler type for one procedure is registered.
pub fn handler_type_name(service: &ServiceDescriptor, procedure: &str) -> String {
    format!("{}.Processor.{}", service.id(), procedure)
}

/// In-process [`ServiceResolver`] backed by named types.
///
/// Generated service code registers an interface type listing its procedures
/// and one handler type per procedure. Resolution goes purely by name, so an
/// interface whose procedures have no matching handler types fails to
/// resolve.
///
/// # Example
///
/// ```rust
/// use rpcproxy_proxy::{FnHandler, MethodRegistry, ProcedureHandler, ServiceCatalog, ServiceDescriptor};
/// use std::sync::Arc;
///
/// let service = ServiceDescriptor::new("calc.Calculator");
/// let mut catalog = ServiceCatalog::new();
/// catalog.register_interface(&service, ["add"]);
/// catalog.register_handler(&service, "add", || -> rpcproxy_common::Result<Arc<dyn ProcedureHandler>> {
///     Ok(Arc::new(FnHandler::new("add", |args| Ok(args))))
/// });
///
/// let registry = MethodRegistry::build(&service, &catalog).unwrap();
/// assert!(registry.contains("add"));
/// ```
#[derive(Default, Clone)]
pub struct ServiceCatalog {
    interfaces: HashMap<String, Vec<String>>,
    handler_types: HashMap<String, Arc<dyn HandlerFactory>>,
}

impl ServiceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the interface type of `service` with its declared procedures.
    pub fn register_interface<I, S>(&mut self, service: &ServiceDescriptor, procedures: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.interfaces.insert(
            interface_type_name(service),
            procedures.into_iter().map(Into::into).collect(),
        );
    }

    /// Registers the handler type serving `procedure` of `service`.
    pub fn register_handler<H>(&mut self, service: &ServiceDescriptor, procedure: &str, factory: H)
    where
        H: HandlerFactory + 'static,
    {
        self.handler_types
            .insert(handler_type_name(service, procedure), Arc::new(factory));
    }

    pub fn has_service(&self, service: &ServiceDescriptor) -> bool {
        self.interfaces.contains_key(&interface_type_name(service))
    }
}

impl ServiceResolver for ServiceCatalog {
    fn resolve_interface(&self, service: &ServiceDescriptor) -> Result<Vec<String>> {
        let name = interface_type_name(service);
        self.interfaces
            .get(&name)
            .cloned()
            .ok_or_else(|| ProxyError::NotFound(format!("interface type '{}'", name)))
    }

    fn resolve_handler(
        &self,
        service: &ServiceDescriptor,
        procedure: &str,
    ) -> Result<Arc<dyn HandlerFactory>> {
        let name = handler_type_name(service, procedure);
        self.handler_types
            .get(&name)
            .cloned()
            .ok_or_else(|| ProxyError::NotFound(format!("handler type '{}'", name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{FnHandler, MethodRegistry, ProcedureHandler};

    fn echo(name: &'static str) -> impl Fn() -> Result<Arc<dyn ProcedureHandler>> + Send + Sync {
        move || -> Result<Arc<dyn ProcedureHandler>> { Ok(Arc::new(FnHandler::new(name, Ok))) }
    }

    #[test]
    fn test_type_names_follow_convention() {
        let service = ServiceDescriptor::new("calc.Calculator");
        assert_eq!(interface_type_name(&service), "calc.Calculator.Iface");
        assert_eq!(handler_type_name(&service, "add"), "calc.Calculator.Processor.add");
    }

    #[test]
    fn test_catalog_resolves_registered_service() {
        let service = ServiceDescriptor::new("calc.Calculator");
        let mut catalog = ServiceCatalog::new();
        catalog.register_interface(&service, ["add", "subtract"]);
        catalog.register_handler(&service, "add", echo("add"));
        catalog.register_handler(&service, "subtract", echo("subtract"));

        assert!(catalog.has_service(&service));
        let registry = MethodRegistry::build(&service, &catalog).unwrap();
        assert_eq!(registry.procedure_names(), vec!["add", "subtract"]);
    }

    #[test]
    fn test_catalog_handler_from_other_service_not_used() {
        let calc = ServiceDescriptor::new("calc.Calculator");
        let other = ServiceDescriptor::new("calc.Other");
        let mut catalog = ServiceCatalog::new();
        catalog.register_interface(&calc, ["add"]);
        catalog.register_handler(&other, "add", echo("add"));

        let result = MethodRegistry::build(&calc, &catalog);
        assert!(matches!(result, Err(ProxyError::RegistryBuild { .. })));
    }

    #[test]
    fn test_catalog_unknown_interface() {
        let catalog = ServiceCatalog::new();
        let service = ServiceDescriptor::new("calc.Calculator");
        assert!(!catalog.has_service(&service));
        assert!(matches!(
            catalog.resolve_interface(&service),
            Err(ProxyError::NotFound(_))
        ));
    }
}
