//! Gateway configuration.

use std::time::Duration;

use agent_gateway_core::{MarkerPolicy, push::DEFAULT_IDLE_TIMEOUT};
use agent_gateway_session::DEFAULT_SESSION_TTL;
use thiserror::Error;

/// How the debug path reaches the direct path.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LoopbackMode {
    /// Run the direct path on a spawned task in this process.
    #[default]
    InProcess,
    /// Re-issue the call over HTTP to this server's own port.
    Http { port: u16 },
}

/// Errors that can occur during configuration validation
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Session TTL must be greater than zero")]
    ZeroSessionTtl,

    #[error("Idle timeout must be greater than zero")]
    ZeroIdleTimeout,

    #[error("HTTP loopback requires a non-zero port")]
    InvalidLoopbackPort,
}

/// Configuration for the gateway
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub debugger_enabled: bool,
    pub monitor_enabled: bool,
    pub triggers_enabled: bool,
    pub session_ttl: Duration,
    pub idle_timeout: Duration,
    pub test_domain: Option<String>,
    pub loopback: LoopbackMode,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            debugger_enabled: false,
            monitor_enabled: false,
            triggers_enabled: false,
            session_ttl: DEFAULT_SESSION_TTL,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            test_domain: None,
            loopback: LoopbackMode::InProcess,
        }
    }
}

impl GatewayConfig {
    /// Create a new config with validation
    pub fn try_new(
        session_ttl: Duration,
        idle_timeout: Duration,
        loopback: LoopbackMode,
    ) -> Result<Self, ConfigError> {
        if session_ttl.is_zero() {
            return Err(ConfigError::ZeroSessionTtl);
        }
        if idle_timeout.is_zero() {
            return Err(ConfigError::ZeroIdleTimeout);
        }
        if loopback == (LoopbackMode::Http { port: 0 }) {
            return Err(ConfigError::InvalidLoopbackPort);
        }

        Ok(Self {
            session_ttl,
            idle_timeout,
            loopback,
            ..Self::default()
        })
    }

    /// Enable or disable the live debugger.
    #[must_use]
    pub const fn with_debugger(mut self, enabled: bool) -> Self {
        self.debugger_enabled = enabled;
        self
    }

    /// Enable or disable push monitors.
    #[must_use]
    pub const fn with_monitor(mut self, enabled: bool) -> Self {
        self.monitor_enabled = enabled;
        self
    }

    /// Enable or disable trigger endpoints.
    #[must_use]
    pub const fn with_triggers(mut self, enabled: bool) -> Self {
        self.triggers_enabled = enabled;
        self
    }

    /// Host suffix identifying test callers. Empty values are ignored.
    #[must_use]
    pub fn with_test_domain(mut self, domain: Option<String>) -> Self {
        self.test_domain = domain.filter(|d| !d.trim().is_empty());
        self
    }

    /// Which caller markers survive at the boundary.
    #[must_use]
    pub const fn marker_policy(&self) -> MarkerPolicy {
        MarkerPolicy {
            debugger_enabled: self.debugger_enabled,
            monitor_enabled: self.monitor_enabled,
        }
    }

    /// Whether a request host belongs to a test identity.
    #[must_use]
    pub fn is_test_host(&self, host: &str) -> bool {
        let hostname = host.split(':').next().unwrap_or(host);
        if hostname.contains("localhost") || hostname == "127.0.0.1" {
            return true;
        }
        self.test_domain
            .as_deref()
            .is_some_and(|domain| hostname.contains(domain))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_durations() {
        assert_eq!(
            GatewayConfig::try_new(Duration::ZERO, DEFAULT_IDLE_TIMEOUT, LoopbackMode::InProcess)
                .unwrap_err(),
            ConfigError::ZeroSessionTtl
        );
        assert_eq!(
            GatewayConfig::try_new(DEFAULT_SESSION_TTL, Duration::ZERO, LoopbackMode::InProcess)
                .unwrap_err(),
            ConfigError::ZeroIdleTimeout
        );
    }

    #[test]
    fn rejects_http_loopback_without_port() {
        let err = GatewayConfig::try_new(
            DEFAULT_SESSION_TTL,
            DEFAULT_IDLE_TIMEOUT,
            LoopbackMode::Http { port: 0 },
        )
        .unwrap_err();
        assert_eq!(err, ConfigError::InvalidLoopbackPort);
    }

    #[test]
    fn classifies_test_hosts() {
        let config = GatewayConfig::default().with_test_domain(Some("agents.test".into()));
        assert!(config.is_test_host("localhost:3000"));
        assert!(config.is_test_host("a1.agents.test"));
        assert!(!config.is_test_host("a1.agents.prod"));

        let blank = GatewayConfig::default().with_test_domain(Some("  ".into()));
        assert!(blank.test_domain.is_none());
        assert!(!blank.is_test_host("a1.agents.prod"));
    }
}
