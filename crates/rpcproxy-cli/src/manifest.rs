//! Service manifests.
//!
//! A manifest names a service and the procedures its interface declares:
//!
//! ```json
//! { "service": "calc.Calculator", "procedures": ["add", "subtract"] }
//! ```
//!
//! The CLI turns a manifest into a [`ServiceCatalog`] whose handlers echo
//! their arguments, which is enough to exercise registry construction and
//! the connection pool against a live server.

use anyhow::{Context, Result};
use rpcproxy_proxy::{FnHandler, ProcedureHandler, ServiceCatalog, ServiceDescriptor};
use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceManifest {
    pub service: ServiceDescriptor,
    pub procedures: Vec<String>,
}

impl ServiceManifest {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Invalid manifest {}", path.display()))
    }

    /// Builds a catalog with one echo handler per declared procedure.
    pub fn into_catalog(self) -> ServiceCatalog {
        let mut catalog = ServiceCatalog::new();
        catalog.register_interface(&self.service, self.procedures.iter().cloned());
        for procedure in self.procedures {
            let name = procedure.clone();
            catalog.register_handler(
                &self.service,
                &procedure,
                move || -> rpcproxy_common::Result<Arc<dyn ProcedureHandler>> {
                    let name = name.clone();
                    Ok(Arc::new(FnHandler::new(name.clone(), move |args| {
                        Ok(json!({ "procedure": name, "args": args }))
                    })))
                },
            );
        }
        catalog
    }
}
