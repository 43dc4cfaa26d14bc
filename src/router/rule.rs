//! Rule-driven route selection

use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::common::{Address, Destination};

use super::{Decision, OperatingMode, RouteDecisionError, RouteSelector, TunnelKind};

/// Host matcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostMatch {
    /// Case-insensitive string suffix of the destination host
    Suffix(String),
    /// Case-insensitive full host match
    Exact(String),
    /// Resolved address (or literal IP host) inside a network
    Ip(IpNet),
}

impl HostMatch {
    fn matches(&self, destination: &Destination) -> bool {
        match self {
            HostMatch::Suffix(suffix) => destination
                .host
                .to_ascii_lowercase()
                .ends_with(&suffix.to_ascii_lowercase()),
            HostMatch::Exact(host) => destination.host.eq_ignore_ascii_case(host),
            HostMatch::Ip(net) => destination
                .resolved
                .or_else(|| destination.host.parse::<IpAddr>().ok())
                .map(|ip| net.contains(&ip))
                .unwrap_or(false),
        }
    }
}

/// Port predicate
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortPredicate {
    #[default]
    Any,
    Eq(u16),
    NotEq(u16),
    /// Inclusive range
    Range(u16, u16),
}

impl PortPredicate {
    fn matches(&self, port: u16) -> bool {
        match *self {
            PortPredicate::Any => true,
            PortPredicate::Eq(p) => port == p,
            PortPredicate::NotEq(p) => port != p,
            PortPredicate::Range(start, end) => port >= start && port <= end,
        }
    }
}

/// Routing rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingRule {
    /// Host matcher, `None` matches every host
    #[serde(default)]
    pub host: Option<HostMatch>,
    /// Port predicate
    #[serde(default)]
    pub port: PortPredicate,
    /// Modes this rule is active in, empty means all
    #[serde(default)]
    pub modes: Vec<OperatingMode>,
    /// Selected tunnel kind
    pub kind: TunnelKind,
    /// Target override (required for capture_redirect)
    #[serde(default)]
    pub target: Option<Address>,
}

impl Default for RoutingRule {
    fn default() -> Self {
        Self {
            host: None,
            port: PortPredicate::Any,
            modes: vec![],
            kind: TunnelKind::Raw,
            target: None,
        }
    }
}

impl RoutingRule {
    fn matches(&self, destination: &Destination, mode: OperatingMode) -> bool {
        // Check mode
        if !self.modes.is_empty() && !self.modes.contains(&mode) {
            return false;
        }

        // Check port
        if !self.port.matches(destination.port) {
            return false;
        }

        // Check host
        match &self.host {
            Some(host) => host.matches(destination),
            None => true,
        }
    }
}

/// Ordered ruleset, first match wins
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ruleset {
    rules: Vec<RoutingRule>,
    fallback: Option<TunnelKind>,
}

impl Ruleset {
    pub fn new(rules: Vec<RoutingRule>, fallback: Option<TunnelKind>) -> Self {
        Self { rules, fallback }
    }

    /// Capture `domains` on `port` to `capture`, relay everything else raw.
    pub fn capture_defaults(domains: &[String], port: u16, capture: Address) -> Self {
        let rules = domains
            .iter()
            .map(|domain| RoutingRule {
                host: Some(HostMatch::Suffix(domain.clone())),
                port: PortPredicate::Eq(port),
                modes: vec![],
                kind: TunnelKind::CaptureRedirect,
                target: Some(capture.clone()),
            })
            .collect();

        Self::new(rules, Some(TunnelKind::Raw))
    }

    /// Prepend a Local-mode rule sending `host` to the local hook server.
    ///
    /// An IP literal matches the resolved address, anything else is a host suffix.
    pub fn with_hook(mut self, host: &str, hook: Address) -> Self {
        let matcher = match host.parse::<IpAddr>() {
            Ok(ip) => HostMatch::Ip(IpNet::from(ip)),
            Err(_) => HostMatch::Suffix(host.to_string()),
        };

        self.rules.insert(
            0,
            RoutingRule {
                host: Some(matcher),
                port: PortPredicate::Any,
                modes: vec![OperatingMode::Local],
                kind: TunnelKind::Raw,
                target: Some(hook),
            },
        );
        self
    }

    pub fn with_fallback(mut self, fallback: Option<TunnelKind>) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn rules(&self) -> &[RoutingRule] {
        &self.rules
    }

    pub fn fallback(&self) -> Option<TunnelKind> {
        self.fallback
    }

    /// Whether any decision of this ruleset can be HTTP_CONNECT
    pub fn uses_http_connect(&self) -> bool {
        self.fallback == Some(TunnelKind::HttpConnect)
            || self.rules.iter().any(|r| r.kind == TunnelKind::HttpConnect)
    }

    fn apply(
        index: usize,
        rule: &RoutingRule,
        destination: &Destination,
    ) -> Result<Decision, RouteDecisionError> {
        let target = match rule.kind {
            TunnelKind::CaptureRedirect => {
                rule.target
                    .clone()
                    .ok_or(RouteDecisionError::MissingTarget {
                        rule: index,
                        kind: rule.kind,
                    })?
            }
            TunnelKind::Raw => rule
                .target
                .clone()
                .unwrap_or_else(|| destination.target()),
            TunnelKind::HttpConnect => destination.target(),
        };

        Ok(Decision {
            kind: rule.kind,
            target,
            rule: Some(index),
        })
    }
}

impl RouteSelector for Ruleset {
    fn decide(
        &self,
        destination: &Destination,
        mode: OperatingMode,
    ) -> Result<Decision, RouteDecisionError> {
        for (index, rule) in self.rules.iter().enumerate() {
            if rule.matches(destination, mode) {
                return Self::apply(index, rule, destination);
            }
        }

        match self.fallback {
            Some(TunnelKind::CaptureRedirect) | None => Err(RouteDecisionError::NoMatch {
                destination: destination.to_string(),
            }),
            Some(kind) => Ok(Decision {
                kind,
                target: destination.target(),
                rule: None,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_predicates() {
        assert!(PortPredicate::Any.matches(1));
        assert!(PortPredicate::Eq(80).matches(80));
        assert!(!PortPredicate::Eq(80).matches(8080));
        assert!(PortPredicate::NotEq(80).matches(443));
        assert!(!PortPredicate::NotEq(80).matches(80));
        assert!(PortPredicate::Range(1000, 2000).matches(1000));
        assert!(PortPredicate::Range(1000, 2000).matches(2000));
        assert!(!PortPredicate::Range(1000, 2000).matches(2001));
    }

    #[test]
    fn test_suffix_is_case_insensitive() {
        let matcher = HostMatch::Suffix("wahlap.com".to_string());
        assert!(matcher.matches(&Destination::unresolved("X.WAHLAP.COM", 80)));
        assert!(matcher.matches(&Destination::unresolved("wahlap.com", 80)));
        assert!(!matcher.matches(&Destination::unresolved("wahlap.com.evil", 80)));
    }

    #[test]
    fn test_ip_matcher() {
        let matcher = HostMatch::Ip("10.0.0.0/8".parse().unwrap());
        assert!(matcher.matches(&Destination::from_ip("10.1.2.3".parse().unwrap(), 80)));
        assert!(matcher.matches(&Destination::resolved(
            "internal.example",
            "10.9.9.9".parse().unwrap(),
            80
        )));
        assert!(!matcher.matches(&Destination::unresolved("internal.example", 80)));
    }

    #[test]
    fn test_rule_from_json() {
        let json = r#"{
            "host": { "suffix": "wahlap.com" },
            "port": { "eq": 80 },
            "kind": "capture_redirect",
            "target": "127.0.0.1:8284"
        }"#;
        let rule: RoutingRule = serde_json::from_str(json).unwrap();
        assert_eq!(rule.kind, TunnelKind::CaptureRedirect);
        assert_eq!(rule.port, PortPredicate::Eq(80));
        assert!(rule.modes.is_empty());
        assert_eq!(rule.target, Some("127.0.0.1:8284".parse::<Address>().unwrap()));
    }
}
