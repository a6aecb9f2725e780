use std::collections::BTreeMap;

/// Ambient environment handed to lifecycle hooks by the host.
///
/// The proxy does not interpret these properties; they are carried through
/// for logging.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LifecycleContext {
    properties: BTreeMap<String, String>,
}

impl LifecycleContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_properties() {
        let ctx = LifecycleContext::new().with_property("host", "task-runner-1");
        assert_eq!(ctx.property("host"), Some("task-runner-1"));
        assert!(ctx.property("missing").is_none());
        assert_eq!(ctx.properties().len(), 1);
    }
}
