//! Router Layer
//!
//! Responsibilities:
//! - Tunnel kind and target selection based on Destination
//! - NO IO operations
//! - NO async operations
//!
//! The selector is a pure function: (Destination, OperatingMode, Ruleset) -> Decision

pub mod rule;

pub use rule::{HostMatch, PortPredicate, RoutingRule, Ruleset};

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::common::{Address, Destination};

/// How an accepted connection is carried upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelKind {
    /// Transparent byte relay to the real destination
    Raw,
    /// Relay to a fixed local inspection endpoint
    CaptureRedirect,
    /// Relay through an upstream HTTP CONNECT proxy
    HttpConnect,
}

impl TunnelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelKind::Raw => "raw",
            TunnelKind::CaptureRedirect => "capture_redirect",
            TunnelKind::HttpConnect => "http_connect",
        }
    }
}

impl fmt::Display for TunnelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Process-wide operating mode, chosen once at startup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatingMode {
    /// Capture through the online service
    #[default]
    Compatible,
    /// Capture through the local service
    Local,
}

/// Result of a routing decision. Fixed for the tunnel's whole life.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub kind: TunnelKind,
    /// Where the tunnel connects (RAW, CAPTURE_REDIRECT) or what the CONNECT
    /// request names (HTTP_CONNECT)
    pub target: Address,
    /// Index of the matched rule, `None` when the fallback applied
    pub rule: Option<usize>,
}

/// No usable decision for a destination. Fatal to the single connection attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouteDecisionError {
    #[error("No routing rule matched {destination} and the ruleset has no fallback")]
    NoMatch { destination: String },

    #[error("Rule #{rule} selects {kind} but has no target address")]
    MissingTarget { rule: usize, kind: TunnelKind },
}

/// RouteSelector trait - pure function for routing decisions
///
/// IMPORTANT: implementations must NOT perform any IO or async operations
/// and must return the same decision for the same inputs.
pub trait RouteSelector: Send + Sync {
    fn decide(
        &self,
        destination: &Destination,
        mode: OperatingMode,
    ) -> Result<Decision, RouteDecisionError>;
}
