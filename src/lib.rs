//! tunnelcore - traffic interception and relay core
//!
//! # Architecture
//!
//! ```text
//! Inbound (SOCKS5 acceptor)
//! → TunnelFactory ── RouteSelector (pure, no IO)
//! → Reactor thread (single poll loop over every Tunnel)
//! → Connector (RAW / CAPTURE_REDIRECT / HTTP_CONNECT)
//! ```
//!
//! ## Core Principles
//!
//! - Routing depends only on the Destination, never on the channel
//! - A Tunnel is mutated only by the Reactor thread
//! - Outside threads hold handles and talk through a command queue
//! - Per-direction buffers are bounded; a full buffer pauses its source
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── common/          # Core types: Address, Destination
//! ├── router/          # RouteSelector, rules, decisions
//! ├── tunnel/          # Tunnel state machine, connectors, factory
//! ├── reactor/         # Reactor thread, registry, handle
//! ├── inbound/         # SOCKS5 acceptor
//! └── app/             # Runtime, metrics
//! ```

// Core types
pub mod common;
pub mod error;

// Layered architecture
pub mod router;
pub mod tunnel;
pub mod reactor;
pub mod inbound;
pub mod app;

// Supporting modules
pub mod config;

// Re-exports for convenience
pub use common::{Address, Destination};
pub use error::{Error, Result, TunnelError};
pub use config::Config;

// Architecture re-exports
pub use app::Runtime;
pub use reactor::{Reactor, ReactorConfig, ReactorHandle};
pub use router::{Decision, OperatingMode, RouteSelector, Ruleset, TunnelKind};
pub use tunnel::{TunnelFactory, TunnelHandle, TunnelReport, TunnelState};
