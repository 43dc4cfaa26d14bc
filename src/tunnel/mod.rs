//! Tunnel Layer
//!
//! A Tunnel is one bidirectional relay session between an intercepted client
//! connection and its upstream. Every variant shares the same lifecycle:
//!
//! ```text
//! Init → Connecting → Relaying → HalfClosed → Closed
//!            └──────────────────────────────────┘ (connect failure / timeout)
//! ```
//!
//! Variants differ only in how the upstream channel is obtained (see
//! [`Connector`]). Once registered, a Tunnel is mutated exclusively by the
//! Reactor; the outside world holds a [`TunnelHandle`].

mod connector;
pub mod factory;
mod http_connect;
mod relay;

pub use connector::{CaptureRedirect, Connector, RawRelay, Upstream};
pub use factory::{FactoryConfig, TunnelFactory, UpstreamProxy};
pub use http_connect::HttpConnect;
pub use relay::Tunnel;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::common::{Address, Result};
use crate::error::{Error, TunnelError};
use crate::reactor::ReactorHandle;
use crate::router::TunnelKind;

/// Tunnel identifier, unique per Reactor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TunnelId(pub u64);

impl fmt::Display for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Tunnel lifecycle state. Ordered: a tunnel only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TunnelState {
    Init,
    Connecting,
    Relaying,
    HalfClosed,
    Closed,
}

/// One end of a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Upstream,
}

impl Side {
    pub const BOTH: [Side; 2] = [Side::Client, Side::Upstream];

    pub fn peer(self) -> Side {
        match self {
            Side::Client => Side::Upstream,
            Side::Upstream => Side::Client,
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Side::Client => 0,
            Side::Upstream => 1,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Client => f.write_str("client"),
            Side::Upstream => f.write_str("upstream"),
        }
    }
}

/// Why a tunnel reached `Closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Both directions reached end-of-stream and were flushed
    Completed,
    /// `close()` was requested
    Requested,
    /// HalfClosed drain bound elapsed
    DrainTimeout,
    /// Terminated by a [`TunnelError`]
    Failed,
    /// The Reactor shut down
    Shutdown,
}

/// Terminal event of a tunnel
#[derive(Debug, Clone)]
pub struct TunnelReport {
    pub id: TunnelId,
    pub kind: TunnelKind,
    pub target: Address,
    pub reason: CloseReason,
    pub error: Option<TunnelError>,
    /// Bytes delivered to the upstream channel
    pub bytes_to_upstream: u64,
    /// Bytes delivered to the client channel
    pub bytes_to_client: u64,
    pub duration: Duration,
}

impl TunnelReport {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Observable status, published by the Reactor on every state change
#[derive(Debug, Clone)]
pub struct TunnelStatus {
    pub state: TunnelState,
    pub report: Option<Arc<TunnelReport>>,
}

/// Point-in-time view of a registered tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSnapshot {
    pub id: TunnelId,
    pub kind: TunnelKind,
    pub state: TunnelState,
    pub pending_to_upstream: usize,
    pub pending_to_client: usize,
    pub client_read_paused: bool,
    pub upstream_read_paused: bool,
    pub bytes_from_client: u64,
    pub bytes_from_upstream: u64,
    pub bytes_to_upstream: u64,
    pub bytes_to_client: u64,
    /// Times the Reactor drove this tunnel
    pub turns: u64,
}

/// External handle to a tunnel owned by the Reactor.
///
/// Cheap to clone and safe to use from any thread. Closing goes through the
/// Reactor's command queue; the handle never touches the channels.
#[derive(Clone)]
pub struct TunnelHandle {
    id: TunnelId,
    kind: TunnelKind,
    target: Address,
    reactor: ReactorHandle,
    close_requested: Arc<AtomicBool>,
    status: watch::Receiver<TunnelStatus>,
}

impl TunnelHandle {
    pub(crate) fn new(
        id: TunnelId,
        kind: TunnelKind,
        target: Address,
        reactor: ReactorHandle,
        status: watch::Receiver<TunnelStatus>,
    ) -> Self {
        Self {
            id,
            kind,
            target,
            reactor,
            close_requested: Arc::new(AtomicBool::new(false)),
            status,
        }
    }

    pub fn id(&self) -> TunnelId {
        self.id
    }

    pub fn kind(&self) -> TunnelKind {
        self.kind
    }

    pub fn target(&self) -> &Address {
        &self.target
    }

    /// Current lifecycle state
    pub fn state(&self) -> TunnelState {
        self.status.borrow().state
    }

    /// Request the tunnel to close. Idempotent; only the first call is queued.
    pub fn close(&self) {
        if self.close_requested.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.state() == TunnelState::Closed {
            return;
        }
        self.reactor.close(self.id);
    }

    /// Wait for the tunnel to reach `Closed` and return its report
    pub async fn closed(&self) -> Result<TunnelReport> {
        let mut status = self.status.clone();
        let report = status
            .wait_for(|s| s.report.is_some())
            .await
            .map_err(|_| Error::ReactorClosed)?
            .report
            .clone();

        report.map(|r| (*r).clone()).ok_or(Error::ReactorClosed)
    }

    /// Wait until the tunnel reaches at least `state`
    pub async fn reached(&self, state: TunnelState) -> Result<TunnelState> {
        let mut status = self.status.clone();
        let current = status
            .wait_for(|s| s.state >= state)
            .await
            .map_err(|_| Error::ReactorClosed)?
            .state;
        Ok(current)
    }
}

impl fmt::Debug for TunnelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelHandle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("target", &self.target)
            .field("state", &self.state())
            .finish()
    }
}
