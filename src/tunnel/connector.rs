//! Upstream connectors - the variant-specific part of a tunnel
//!
//! A connector runs while the tunnel is `Connecting`. Its future is polled by
//! the Reactor on the Reactor thread, so it must never block.

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::net::TcpStream;

use crate::common::Address;
use crate::error::TunnelError;
use crate::router::TunnelKind;

/// An established upstream channel
#[derive(Debug)]
pub struct Upstream {
    pub stream: TcpStream,
    /// Bytes already received from upstream during the handshake; delivered
    /// to the client before anything read later.
    pub early_data: BytesMut,
}

impl Upstream {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            early_data: BytesMut::new(),
        }
    }
}

/// Connector trait - establishes the upstream side of a tunnel
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect (and handshake, if the variant needs one)
    async fn connect(&self) -> Result<Upstream, TunnelError>;

    /// Tunnel kind this connector implements
    fn kind(&self) -> TunnelKind;

    /// Address the connector dials
    fn dial_address(&self) -> &Address;
}

/// Open a TCP connection; domain targets are resolved here, not on the
/// routing path.
pub(crate) async fn connect_tcp(addr: &Address) -> Result<TcpStream, TunnelError> {
    let result = match addr {
        Address::Socket(socket_addr) => TcpStream::connect(socket_addr).await,
        Address::Domain(domain, port) => TcpStream::connect((domain.as_str(), *port)).await,
    };
    let stream = result.map_err(|e| TunnelError::connect(addr, &e))?;

    // Disable Nagle's algorithm for lower latency
    stream
        .set_nodelay(true)
        .map_err(|e| TunnelError::connect(addr, &e))?;

    Ok(stream)
}

/// Transparent relay to the real destination
pub struct RawRelay {
    target: Address,
}

impl RawRelay {
    pub fn new(target: Address) -> Self {
        Self { target }
    }
}

#[async_trait]
impl Connector for RawRelay {
    async fn connect(&self) -> Result<Upstream, TunnelError> {
        connect_tcp(&self.target).await.map(Upstream::new)
    }

    fn kind(&self) -> TunnelKind {
        TunnelKind::Raw
    }

    fn dial_address(&self) -> &Address {
        &self.target
    }
}

/// Relay to the fixed local capture endpoint.
///
/// The client still believes it talks to its original destination.
pub struct CaptureRedirect {
    capture: Address,
}

impl CaptureRedirect {
    pub fn new(capture: Address) -> Self {
        Self { capture }
    }
}

#[async_trait]
impl Connector for CaptureRedirect {
    async fn connect(&self) -> Result<Upstream, TunnelError> {
        connect_tcp(&self.capture).await.map(Upstream::new)
    }

    fn kind(&self) -> TunnelKind {
        TunnelKind::CaptureRedirect
    }

    fn dial_address(&self) -> &Address {
        &self.capture
    }
}
