use rpcproxy_client::PoolConfig;
use rpcproxy_common::error::{ProxyError, Result};
use rpcproxy_common::transport::Endpoint;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::registry::ServiceDescriptor;

/// Proxy configuration, set once before initialization.
///
/// `host` and `service` are required by validation. `timeout_ms` starts out
/// unset and must be given a value (0 meaning no timeout) before
/// initialization.
///
/// # Example
///
/// ```rust
/// use rpcproxy_proxy::ProxyConfig;
///
/// let config = ProxyConfig::from_json_str(r#"{
///     "host": "svc.internal",
///     "port": 9090,
///     "timeout_ms": 500,
///     "service": "calc.Calculator",
///     "pool": { "max_size": 2 }
/// }"#).unwrap();
/// assert_eq!(config.pool.max_size, 2);
/// assert_eq!(config.pool.max_wait_ms, 100);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Downstream server host
    pub host: Option<String>,
    /// Downstream server port
    pub port: u16,
    /// Per-call timeout in milliseconds
    pub timeout_ms: Option<u64>,
    /// Service whose procedures this proxy serves
    pub service: Option<ServiceDescriptor>,
    pub pool: PoolConfig,
}

impl ProxyConfig {
    pub fn new(host: impl Into<String>, port: u16, service: ServiceDescriptor) -> Self {
        Self {
            host: Some(host.into()),
            port,
            service: Some(service),
            ..Self::default()
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| ProxyError::Configuration(format!("invalid proxy config: {}", e)))
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&contents)
    }

    /// Checks the fields required before initialization can be attempted.
    pub fn validate(&self) -> Result<()> {
        match self.host.as_deref() {
            Some(host) if !host.trim().is_empty() => {}
            Some(_) => {
                return Err(ProxyError::Configuration(
                    "'host' may not be empty".to_string(),
                ))
            }
            None => {
                return Err(ProxyError::Configuration(
                    "'host' may not be absent".to_string(),
                ))
            }
        }
        if self.service.is_none() {
            return Err(ProxyError::Configuration(
                "'service' may not be absent".to_string(),
            ));
        }
        self.pool.validate()
    }

    /// Endpoint for the connection pool; requires host and timeout to be set.
    pub fn endpoint(&self) -> Result<Endpoint> {
        let host = self
            .host
            .clone()
            .ok_or_else(|| ProxyError::Configuration("'host' may not be absent".to_string()))?;
        let timeout_ms = self.timeout_ms.ok_or_else(|| {
            ProxyError::Configuration("'timeout_ms' must be set to a non-negative value".to_string())
        })?;
        Ok(Endpoint::new(host, self.port, Duration::from_millis(timeout_ms)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn valid() -> ProxyConfig {
        ProxyConfig::new("svc.internal", 9090, ServiceDescriptor::new("calc.Calculator"))
            .with_timeout_ms(500)
    }

    #[test]
    fn test_default_timeout_is_unset() {
        let config = ProxyConfig::default();
        assert!(config.timeout_ms.is_none());
        assert_eq!(config.pool, PoolConfig::default());
    }

    #[test]
    fn test_validate_accepts_complete_config() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_validate_requires_host() {
        let mut config = valid();
        config.host = None;
        assert!(matches!(config.validate(), Err(ProxyError::Configuration(_))));

        config.host = Some("  ".to_string());
        assert!(matches!(config.validate(), Err(ProxyError::Configuration(_))));
    }

    #[test]
    fn test_validate_requires_service() {
        let mut config = valid();
        config.service = None;
        assert!(matches!(config.validate(), Err(ProxyError::Configuration(_))));
    }

    #[test]
    fn test_validate_checks_pool_sizing() {
        let mut config = valid();
        config.pool.max_size = 0;
        assert!(matches!(config.validate(), Err(ProxyError::Configuration(_))));
    }

    #[test]
    fn test_endpoint_requires_timeout() {
        let mut config = valid();
        config.timeout_ms = None;
        assert!(matches!(config.endpoint(), Err(ProxyError::Configuration(_))));

        let endpoint = valid().endpoint().unwrap();
        assert_eq!(endpoint.to_string(), "svc.internal:9090");
        assert_eq!(endpoint.timeout, Duration::from_millis(500));
    }

    #[test]
    fn test_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"host": "svc.internal", "port": 9090, "service": "calc.Calculator"}}"#
        )
        .unwrap();

        let config = ProxyConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.host.as_deref(), Some("svc.internal"));
        assert_eq!(config.service, Some(ServiceDescriptor::new("calc.Calculator")));
        assert!(config.timeout_ms.is_none());
    }

    #[test]
    fn test_from_json_rejects_negative_timeout() {
        let result = ProxyConfig::from_json_str(r#"{"timeout_ms": -1}"#);
        assert!(matches!(result, Err(ProxyError::Configuration(_))));
    }
}
