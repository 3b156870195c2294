//! Client configuration.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::endpoint::Endpoint;
use crate::logging::LogLevel;
use crate::timing::TimingPolicy;

/// Header carrying the client's user agent.
pub const USER_AGENT_HEADER: &str = "User-Agent";

/// Configuration for the sync client.
///
/// Plain data: the manager copies what it needs when a connection is opened,
/// so a config value is never observed half-updated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Application identifier, prefixed to the user agent.
    pub app_id: Option<String>,
    /// Application user agent, sent in the `User-Agent` header.
    pub user_agent: Option<String>,
    /// Lifecycle log threshold.
    pub log_level: LogLevel,
    /// Header the authorization token is sent in; `None` uses the
    /// transport's default.
    pub authorization_header_name: Option<String>,
    /// Extra headers sent with every connection request.
    pub custom_request_headers: BTreeMap<String, String>,
    /// Pinned certificate files, keyed by server host name.
    pub pinned_certificate_paths: BTreeMap<String, PathBuf>,
    /// Connection timing.
    pub timing: TimingPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            app_id: None,
            user_agent: None,
            log_level: LogLevel::Info,
            authorization_header_name: None,
            custom_request_headers: BTreeMap::new(),
            pinned_certificate_paths: BTreeMap::new(),
            timing: TimingPolicy::default(),
        }
    }
}

impl ClientConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the application identifier.
    pub fn with_app_id(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = Some(app_id.into());
        self
    }

    /// Sets the user agent.
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Sets the log level.
    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    /// Sets the authorization header name.
    pub fn with_authorization_header_name(mut self, name: impl Into<String>) -> Self {
        self.authorization_header_name = Some(name.into());
        self
    }

    /// Adds a custom request header.
    pub fn with_custom_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_request_headers.insert(name.into(), value.into());
        self
    }

    /// Pins a certificate for `host`.
    pub fn with_pinned_certificate(mut self, host: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.pinned_certificate_paths.insert(host.into(), path.into());
        self
    }

    /// Sets the timing policy.
    pub fn with_timing(mut self, timing: TimingPolicy) -> Self {
        self.timing = timing;
        self
    }

    /// The full user agent: `"{app_id} {user_agent}"`, or whichever of the
    /// two is set.
    pub fn effective_user_agent(&self) -> Option<String> {
        match (&self.app_id, &self.user_agent) {
            (Some(app), Some(agent)) => Some(format!("{app} {agent}")),
            (Some(app), None) => Some(app.clone()),
            (None, Some(agent)) => Some(agent.clone()),
            (None, None) => None,
        }
    }

    /// Resolves the endpoint for a server address, attaching the pinned
    /// certificate, headers and authorization header name in effect now.
    ///
    /// Certificates are only pinned for TLS endpoints.
    pub fn endpoint(&self, host: &str, port: u16, tls: bool) -> Endpoint {
        let mut endpoint = Endpoint::new(host, port, tls);
        if tls {
            if let Some(path) = self.pinned_certificate_paths.get(host) {
                endpoint = endpoint.with_pinned_certificate(path.clone());
            }
        }
        for (name, value) in &self.custom_request_headers {
            endpoint = endpoint.with_header(name.clone(), value.clone());
        }
        if let Some(agent) = self.effective_user_agent() {
            endpoint = endpoint.with_header(USER_AGENT_HEADER, agent);
        }
        if let Some(name) = &self.authorization_header_name {
            endpoint = endpoint.with_authorization_header_name(name.clone());
        }
        endpoint
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.log_level, LogLevel::Info);
        assert_eq!(config.timing, TimingPolicy::default());
        assert!(config.effective_user_agent().is_none());
    }

    #[test]
    fn config_builder() {
        let config = ClientConfig::new()
            .with_app_id("notes")
            .with_user_agent("notes-ios/2.1")
            .with_log_level(LogLevel::Debug)
            .with_authorization_header_name("X-Token")
            .with_custom_header("X-Region", "eu")
            .with_pinned_certificate("sync.example.com", "/etc/pins/sync.der");

        assert_eq!(config.effective_user_agent().as_deref(), Some("notes notes-ios/2.1"));
        assert_eq!(config.log_level, LogLevel::Debug);

        let endpoint = config.endpoint("sync.example.com", 443, true);
        assert_eq!(endpoint.headers.get("X-Region").map(String::as_str), Some("eu"));
        assert_eq!(
            endpoint.headers.get(USER_AGENT_HEADER).map(String::as_str),
            Some("notes notes-ios/2.1")
        );
        assert_eq!(endpoint.authorization_header_name.as_deref(), Some("X-Token"));
        assert_eq!(endpoint.pinned_certificate, Some(PathBuf::from("/etc/pins/sync.der")));
    }

    #[test]
    fn pins_only_apply_to_tls_endpoints() {
        let config = ClientConfig::new().with_pinned_certificate("sync.example.com", "/pin.der");
        assert!(config.endpoint("sync.example.com", 80, false).pinned_certificate.is_none());
        assert!(config.endpoint("other.example.com", 443, true).pinned_certificate.is_none());
    }

    #[test]
    fn parses_partial_json() {
        let json = r#"{
            "app_id": "notes",
            "log_level": "detail",
            "timing": { "connect_timeout_ms": 5000, "fast_reconnect_limit_ms": 0 }
        }"#;
        let config: ClientConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.app_id.as_deref(), Some("notes"));
        assert_eq!(config.log_level, LogLevel::Detail);
        assert_eq!(config.timing.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.timing.fast_reconnect_limit, Duration::ZERO);
        assert_eq!(
            config.timing.connection_linger_time,
            TimingPolicy::default().connection_linger_time
        );
    }
}
