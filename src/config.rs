//! Configuration module for tunnelcore
//!
//! JSON configuration; read once at startup and immutable afterwards.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use crate::common::Address;
use crate::error::{Error, Result};
use crate::reactor::ReactorConfig;
use crate::router::{OperatingMode, RoutingRule, Ruleset, TunnelKind};
use crate::tunnel::{FactoryConfig, UpstreamProxy};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log configuration
    #[serde(default)]
    pub log: LogConfig,

    /// Operating mode, fixed for the process lifetime
    #[serde(default)]
    pub mode: OperatingMode,

    /// Inbound listeners
    #[serde(default)]
    pub inbounds: Vec<InboundConfig>,

    /// Capture server and the hosts redirected to it
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Optional Local-mode hook redirect
    #[serde(default)]
    pub hook: Option<HookConfig>,

    /// Upstream HTTP proxy for HTTP_CONNECT tunnels
    #[serde(default)]
    pub upstream_proxy: Option<UpstreamProxyConfig>,

    /// Routing rules
    #[serde(default)]
    pub routing: RoutingConfig,

    /// Reactor tuning
    #[serde(default)]
    pub reactor: ReactorSettings,
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;
        Self::from_json(&content)
    }

    /// Parse and validate configuration from a JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Create a default client configuration
    pub fn default_client() -> Self {
        Config {
            log: LogConfig::default(),
            mode: OperatingMode::Compatible,
            inbounds: vec![InboundConfig {
                tag: "socks-in".to_string(),
                listen: SocketAddr::from((Ipv4Addr::LOCALHOST, 1080)),
            }],
            capture: CaptureConfig::default(),
            hook: None,
            upstream_proxy: None,
            routing: RoutingConfig::default(),
            reactor: ReactorSettings::default(),
        }
    }

    /// Check cross-field constraints serde cannot express
    pub fn validate(&self) -> Result<()> {
        let mut tags = HashSet::new();
        for inbound in &self.inbounds {
            if !tags.insert(inbound.tag.as_str()) {
                return Err(Error::Config(format!(
                    "Duplicate inbound tag: {}",
                    inbound.tag
                )));
            }
        }

        if self.reactor.max_pending_bytes == 0 {
            return Err(Error::Config(
                "reactor.max_pending_bytes must be greater than zero".into(),
            ));
        }
        if self.reactor.connect_timeout_ms == 0 {
            return Err(Error::Config(
                "reactor.connect_timeout_ms must be greater than zero".into(),
            ));
        }

        for (index, rule) in self.routing.rules.iter().enumerate() {
            if rule.kind == TunnelKind::CaptureRedirect && rule.target.is_none() {
                return Err(Error::Config(format!(
                    "Routing rule #{} redirects to capture but has no target",
                    index
                )));
            }
        }

        if self.routing.fallback == Some(TunnelKind::CaptureRedirect) {
            return Err(Error::Config(
                "routing.fallback cannot be capture_redirect, it has no target".into(),
            ));
        }

        if self.ruleset().uses_http_connect() && self.upstream_proxy.is_none() {
            return Err(Error::Config(
                "Routing uses http_connect but no upstream_proxy is configured".into(),
            ));
        }

        Ok(())
    }

    /// Build the ruleset.
    ///
    /// Explicit `routing.rules` are used as given. Otherwise the default
    /// ruleset is derived from `capture` and `hook`. An upstream proxy with
    /// `route_all` turns the fallback into HTTP_CONNECT in both cases.
    pub fn ruleset(&self) -> Ruleset {
        let ruleset = if self.routing.rules.is_empty() {
            let mut ruleset = Ruleset::capture_defaults(
                &self.capture.domains,
                self.capture.port,
                self.capture.address.clone(),
            );
            if let Some(hook) = &self.hook {
                ruleset = ruleset.with_hook(&hook.host, hook.address.clone());
            }
            ruleset.with_fallback(self.routing.fallback)
        } else {
            Ruleset::new(self.routing.rules.clone(), self.routing.fallback)
        };

        match &self.upstream_proxy {
            Some(proxy) if proxy.route_all => ruleset.with_fallback(Some(TunnelKind::HttpConnect)),
            _ => ruleset,
        }
    }

    pub fn factory_config(&self) -> FactoryConfig {
        FactoryConfig {
            mode: self.mode,
            upstream_proxy: self.upstream_proxy.as_ref().map(|proxy| UpstreamProxy {
                address: proxy.address.clone(),
                username: proxy.username.clone(),
                password: proxy.password.clone(),
            }),
        }
    }

    pub fn reactor_config(&self) -> ReactorConfig {
        let drain_timeout = match self.reactor.drain_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };

        ReactorConfig {
            max_pending_bytes: self.reactor.max_pending_bytes,
            connect_timeout: Duration::from_millis(self.reactor.connect_timeout_ms),
            drain_timeout,
            ..ReactorConfig::default()
        }
    }
}

/// Log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// SOCKS5 inbound listener
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundConfig {
    /// Unique tag for this inbound
    pub tag: String,

    /// Listen address
    pub listen: SocketAddr,
}

/// Capture redirect settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Local capture server
    #[serde(default = "default_capture_address")]
    pub address: Address,

    /// Host suffixes redirected to the capture server
    #[serde(default = "default_capture_domains")]
    pub domains: Vec<String>,

    /// Destination port the redirect applies to
    #[serde(default = "default_capture_port")]
    pub port: u16,
}

fn default_capture_address() -> Address {
    Address::from(SocketAddr::from((Ipv4Addr::LOCALHOST, 8284)))
}

fn default_capture_domains() -> Vec<String> {
    vec!["wahlap.com".to_string()]
}

fn default_capture_port() -> u16 {
    80
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            address: default_capture_address(),
            domains: default_capture_domains(),
            port: default_capture_port(),
        }
    }
}

/// Local-mode hook redirect
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookConfig {
    /// Host suffix or IP literal to redirect
    pub host: String,

    /// Local hook server
    pub address: Address,
}

/// Upstream HTTP proxy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamProxyConfig {
    pub address: Address,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Send every non-captured connection through the proxy
    #[serde(default)]
    pub route_all: bool,
}

/// Routing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Ordered rules, first match wins. Empty means the default ruleset.
    #[serde(default)]
    pub rules: Vec<RoutingRule>,

    /// Kind used when no rule matches, `null` makes unmatched destinations an error
    #[serde(default = "default_fallback")]
    pub fallback: Option<TunnelKind>,
}

fn default_fallback() -> Option<TunnelKind> {
    Some(TunnelKind::Raw)
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            rules: vec![],
            fallback: default_fallback(),
        }
    }
}

/// Reactor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactorSettings {
    #[serde(default = "default_max_pending_bytes")]
    pub max_pending_bytes: usize,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Half-closed inactivity bound, 0 disables it
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

fn default_max_pending_bytes() -> usize {
    64 * 1024
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_drain_timeout_ms() -> u64 {
    30_000
}

impl Default for ReactorSettings {
    fn default() -> Self {
        Self {
            max_pending_bytes: default_max_pending_bytes(),
            connect_timeout_ms: default_connect_timeout_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Destination;
    use crate::router::RouteSelector;

    const FULL: &str = r#"{
        "log": { "level": "debug" },
        "mode": "local",
        "inbounds": [ { "tag": "socks-in", "listen": "127.0.0.1:1080" } ],
        "capture": { "address": "127.0.0.1:8284", "domains": ["wahlap.com"], "port": 80 },
        "hook": { "host": "hook.example", "address": "127.0.0.1:8283" },
        "upstream_proxy": { "address": "10.0.0.1:3128", "username": "u", "password": "p", "route_all": false },
        "routing": { "rules": [], "fallback": "raw" },
        "reactor": { "max_pending_bytes": 32768, "connect_timeout_ms": 5000, "drain_timeout_ms": 0 }
    }"#;

    #[test]
    fn test_default_client_config() {
        let config = Config::default_client();
        assert_eq!(config.inbounds.len(), 1);
        assert_eq!(config.mode, OperatingMode::Compatible);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default_client();
        let json = serde_json::to_string_pretty(&config).unwrap();
        let parsed = Config::from_json(&json).unwrap();
        assert_eq!(parsed.inbounds.len(), config.inbounds.len());
        assert_eq!(parsed.capture.address, config.capture.address);
        assert_eq!(parsed.reactor_config(), config.reactor_config());
    }

    #[test]
    fn test_empty_object_uses_defaults() {
        let config = Config::from_json("{}").unwrap();
        assert_eq!(config.log.level, "info");
        assert_eq!(config.routing.fallback, Some(TunnelKind::Raw));
        assert_eq!(config.reactor_config(), ReactorConfig::default());
    }

    #[test]
    fn test_full_config() {
        let config = Config::from_json(FULL).unwrap();
        assert_eq!(config.mode, OperatingMode::Local);

        let reactor = config.reactor_config();
        assert_eq!(reactor.max_pending_bytes, 32768);
        assert_eq!(reactor.connect_timeout, Duration::from_secs(5));
        assert_eq!(reactor.drain_timeout, None);

        let factory = config.factory_config();
        let proxy = factory.upstream_proxy.unwrap();
        assert_eq!(proxy.address, "10.0.0.1:3128".parse::<Address>().unwrap());
        assert_eq!(proxy.username.as_deref(), Some("u"));
    }

    #[test]
    fn test_default_ruleset_includes_hook() {
        let config = Config::from_json(FULL).unwrap();
        let ruleset = config.ruleset();

        let hook = ruleset
            .decide(&Destination::unresolved("api.hook.example", 443), OperatingMode::Local)
            .unwrap();
        assert_eq!(hook.kind, TunnelKind::Raw);
        assert_eq!(hook.target, "127.0.0.1:8283".parse::<Address>().unwrap());

        let capture = ruleset
            .decide(&Destination::unresolved("x.wahlap.com", 80), OperatingMode::Local)
            .unwrap();
        assert_eq!(capture.kind, TunnelKind::CaptureRedirect);
    }

    #[test]
    fn test_route_all_switches_fallback() {
        let json = r#"{
            "upstream_proxy": { "address": "10.0.0.1:3128", "route_all": true }
        }"#;
        let config = Config::from_json(json).unwrap();
        let ruleset = config.ruleset();
        assert_eq!(ruleset.fallback(), Some(TunnelKind::HttpConnect));

        let decision = ruleset
            .decide(&Destination::unresolved("example.com", 443), config.mode)
            .unwrap();
        assert_eq!(decision.kind, TunnelKind::HttpConnect);
        assert_eq!(decision.target, Address::domain("example.com", 443));
    }

    #[test]
    fn test_http_connect_without_proxy_is_rejected() {
        let json = r#"{ "routing": { "fallback": "http_connect" } }"#;
        assert!(matches!(Config::from_json(json), Err(Error::Config(_))));
    }

    #[test]
    fn test_capture_fallback_rejected() {
        let json = r#"{ "routing": { "fallback": "capture_redirect" } }"#;
        assert!(matches!(
            Config::from_json(json),
            Err(Error::Config(msg)) if msg.contains("routing.fallback")
        ));
    }

    #[test]
    fn test_duplicate_inbound_tags_rejected() {
        let json = r#"{
            "inbounds": [
                { "tag": "in", "listen": "127.0.0.1:1080" },
                { "tag": "in", "listen": "127.0.0.1:1081" }
            ]
        }"#;
        assert!(matches!(Config::from_json(json), Err(Error::Config(_))));
    }

    #[test]
    fn test_explicit_rules_replace_defaults() {
        let json = r#"{
            "routing": {
                "rules": [ { "host": { "exact": "example.com" }, "kind": "raw" } ],
                "fallback": null
            }
        }"#;
        let config = Config::from_json(json).unwrap();
        let ruleset = config.ruleset();
        assert_eq!(ruleset.rules().len(), 1);
        assert!(ruleset
            .decide(&Destination::unresolved("x.wahlap.com", 80), config.mode)
            .is_err());
    }
}
