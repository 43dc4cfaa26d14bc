//! Tunnel state machine and byte relay
//!
//! A [`Tunnel`] is owned and mutated only by the Reactor thread. It never
//! blocks: every I/O step is a readiness poll followed by a `try_read` /
//! `try_write`, and a side whose outgoing buffer is full simply stops being
//! polled for reads until the buffer drains.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use bytes::{Buf, BytesMut};
use tokio::io::AsyncWrite;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::app::metrics::BACKPRESSURE_PAUSES;
use crate::common::{Address, Destination};
use crate::error::TunnelError;
use crate::reactor::{ReactorConfig, ReactorHandle};
use crate::router::TunnelKind;

use super::connector::{Connector, Upstream};
use super::{
    CloseReason, Side, TunnelHandle, TunnelId, TunnelReport, TunnelSnapshot, TunnelState,
    TunnelStatus,
};

type ConnectFuture = Pin<Box<dyn Future<Output = Result<Upstream, TunnelError>> + Send>>;

/// Per-side bookkeeping
#[derive(Debug, Default, Clone, Copy)]
struct End {
    /// Read side reached end-of-stream
    eof: bool,
    /// Write half was shut down
    shut: bool,
    /// Reads suspended by backpressure
    paused: bool,
}

/// One relay session. Arrays are indexed by [`Side::index`].
pub struct Tunnel {
    id: TunnelId,
    kind: TunnelKind,
    target: Address,
    destination: Destination,
    state: TunnelState,
    connector: Arc<dyn Connector>,

    /// Client channel as handed over by the acceptor, until registration
    pending_client: Option<std::net::TcpStream>,
    connecting: Option<ConnectFuture>,
    channels: [Option<TcpStream>; 2],

    /// Bytes waiting to be written to each side
    outbound: [BytesMut; 2],
    ends: [End; 2],
    bytes_read: [u64; 2],
    bytes_written: [u64; 2],
    /// Reactor turns spent on this tunnel
    turns: u64,

    created: Instant,
    connect_started: Option<Instant>,
    last_activity: Instant,

    status: watch::Sender<TunnelStatus>,
    report: Option<Arc<TunnelReport>>,
}

impl Tunnel {
    pub(crate) fn new(
        id: TunnelId,
        destination: Destination,
        target: Address,
        connector: Arc<dyn Connector>,
        client: std::net::TcpStream,
        reactor: ReactorHandle,
    ) -> (Self, TunnelHandle) {
        let kind = connector.kind();
        let (status, status_rx) = watch::channel(TunnelStatus {
            state: TunnelState::Init,
            report: None,
        });
        let now = Instant::now();

        let tunnel = Self {
            id,
            kind,
            target: target.clone(),
            destination,
            state: TunnelState::Init,
            connector,
            pending_client: Some(client),
            connecting: None,
            channels: [None, None],
            outbound: [BytesMut::new(), BytesMut::new()],
            ends: [End::default(); 2],
            bytes_read: [0; 2],
            bytes_written: [0; 2],
            turns: 0,
            created: now,
            connect_started: None,
            last_activity: now,
            status,
            report: None,
        };
        let handle = TunnelHandle::new(id, kind, target, reactor, status_rx);

        (tunnel, handle)
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

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn state(&self) -> TunnelState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == TunnelState::Closed
    }

    /// Final report, once closed
    pub fn report(&self) -> Option<Arc<TunnelReport>> {
        self.report.clone()
    }

    /// Adopt the client channel and start connecting. Runs on the Reactor thread.
    pub(crate) fn register(&mut self, now: Instant) {
        let client = match self.pending_client.take() {
            Some(client) => client,
            None => return,
        };

        match TcpStream::from_std(client) {
            Ok(stream) => self.channels[Side::Client.index()] = Some(stream),
            Err(e) => {
                self.fail(TunnelError::io(&e), now);
                return;
            }
        }

        let connector = self.connector.clone();
        self.connecting = Some(Box::pin(async move { connector.connect().await }));
        self.connect_started = Some(now);
        self.last_activity = now;
        self.advance(TunnelState::Connecting);

        trace!(
            "Tunnel {} connecting to {} for {}",
            self.id,
            self.connector.dial_address(),
            self.destination
        );
    }

    /// Run one Reactor turn for this tunnel.
    ///
    /// Returns `true` when the per-turn budget ran out while progress was
    /// still being made, so the Reactor must schedule another turn.
    pub(crate) fn drive(
        &mut self,
        cx: &mut Context<'_>,
        config: &ReactorConfig,
        scratch: &mut [u8],
        now: Instant,
    ) -> bool {
        self.turns += 1;
        if self.is_closed() || self.state == TunnelState::Init {
            return false;
        }

        if let Some(deadline) = self.deadline(config) {
            if now >= deadline {
                self.expire(config, now);
                return false;
            }
        }

        if self.state == TunnelState::Connecting && !self.poll_connect(cx, now) {
            return false;
        }

        for _ in 0..config.turn_budget {
            if self.is_closed() {
                return false;
            }
            match self.relay_once(cx, config, scratch, now) {
                Ok(true) => {}
                Ok(false) => return false,
                Err(e) => {
                    self.fail(e, now);
                    return false;
                }
            }
        }

        !self.is_closed()
    }

    /// Poll the connector. Returns `true` once the tunnel left `Connecting`.
    fn poll_connect(&mut self, cx: &mut Context<'_>, now: Instant) -> bool {
        let future = match self.connecting.as_mut() {
            Some(future) => future,
            None => return false,
        };

        match future.as_mut().poll(cx) {
            Poll::Pending => false,
            Poll::Ready(Ok(upstream)) => {
                self.connecting = None;

                let Upstream { stream, early_data } = upstream;
                if !early_data.is_empty() {
                    trace!(
                        "Tunnel {} received {} bytes with the handshake",
                        self.id,
                        early_data.len()
                    );
                    self.bytes_read[Side::Upstream.index()] += early_data.len() as u64;
                    self.outbound[Side::Client.index()].unsplit(early_data);
                }
                self.channels[Side::Upstream.index()] = Some(stream);
                self.last_activity = now;
                self.advance(TunnelState::Relaying);

                debug!(
                    "Tunnel {} [{}] relaying {} via {}",
                    self.id,
                    self.kind,
                    self.destination,
                    self.connector.dial_address()
                );
                true
            }
            Poll::Ready(Err(e)) => {
                self.connecting = None;
                self.fail(e, now);
                false
            }
        }
    }

    /// One pass over both sides: flush, then read where allowed
    fn relay_once(
        &mut self,
        cx: &mut Context<'_>,
        config: &ReactorConfig,
        scratch: &mut [u8],
        now: Instant,
    ) -> Result<bool, TunnelError> {
        let mut progress = false;

        for side in Side::BOTH {
            progress |= self.on_writable(side, cx, now)?;
        }
        self.update_backpressure(config);

        for side in Side::BOTH {
            progress |= self.on_readable(side, cx, config, scratch, now)?;
        }
        self.update_backpressure(config);

        if self.is_drained() {
            self.close(CloseReason::Completed, now);
            return Ok(false);
        }

        Ok(progress)
    }

    /// Read from `side` into the buffer bound for its peer.
    ///
    /// Never reads more than the space left under `max_pending_bytes`; a
    /// paused side is not polled, so no read interest is registered for it.
    pub(crate) fn on_readable(
        &mut self,
        side: Side,
        cx: &mut Context<'_>,
        config: &ReactorConfig,
        scratch: &mut [u8],
        now: Instant,
    ) -> Result<bool, TunnelError> {
        let src = side.index();
        let dst = side.peer().index();

        if self.ends[src].eof || self.ends[src].paused {
            return Ok(false);
        }
        let room = config
            .max_pending_bytes
            .saturating_sub(self.outbound[dst].len())
            .min(scratch.len());
        if room == 0 {
            return Ok(false);
        }

        let stream = match self.channels[src].as_ref() {
            Some(stream) => stream,
            None => return Ok(false),
        };

        loop {
            match stream.poll_read_ready(cx) {
                Poll::Pending => return Ok(false),
                Poll::Ready(Err(e)) => return Err(TunnelError::io(&e)),
                Poll::Ready(Ok(())) => {}
            }

            match stream.try_read(&mut scratch[..room]) {
                Ok(0) => {
                    self.on_eof(side, now);
                    return Ok(true);
                }
                Ok(n) => {
                    self.outbound[dst].extend_from_slice(&scratch[..n]);
                    self.bytes_read[src] += n as u64;
                    self.last_activity = now;
                    trace!("Tunnel {} read {} bytes from {}", self.id, n, side);
                    return Ok(true);
                }
                // Readiness was stale; poll again to register interest
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(TunnelError::io(&e)),
            }
        }
    }

    /// Flush the buffer bound for `side`, then propagate FIN if its source
    /// already reached end-of-stream.
    pub(crate) fn on_writable(
        &mut self,
        side: Side,
        cx: &mut Context<'_>,
        now: Instant,
    ) -> Result<bool, TunnelError> {
        let dst = side.index();
        let src = side.peer().index();
        let mut progress = false;

        let stream = match self.channels[dst].as_ref() {
            Some(stream) => stream,
            None => return Ok(false),
        };

        while !self.outbound[dst].is_empty() {
            match stream.poll_write_ready(cx) {
                Poll::Pending => return Ok(progress),
                Poll::Ready(Err(e)) => return Err(TunnelError::io(&e)),
                Poll::Ready(Ok(())) => {}
            }

            match stream.try_write(&self.outbound[dst]) {
                Ok(0) => return Err(TunnelError::io(&io::Error::from(io::ErrorKind::WriteZero))),
                Ok(n) => {
                    self.outbound[dst].advance(n);
                    self.bytes_written[dst] += n as u64;
                    self.last_activity = now;
                    trace!("Tunnel {} wrote {} bytes to {}", self.id, n, side);
                    progress = true;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(TunnelError::io(&e)),
            }
        }

        if self.ends[src].eof && !self.ends[dst].shut {
            let stream = match self.channels[dst].as_mut() {
                Some(stream) => stream,
                None => return Ok(progress),
            };
            match Pin::new(stream).poll_shutdown(cx) {
                Poll::Pending => return Ok(progress),
                Poll::Ready(Ok(())) => {}
                // Peer already gone; nothing left to signal
                Poll::Ready(Err(e)) if e.kind() == io::ErrorKind::NotConnected => {}
                Poll::Ready(Err(e)) => return Err(TunnelError::io(&e)),
            }
            self.ends[dst].shut = true;
            debug!("Tunnel {} propagated FIN to {}", self.id, side);
            progress = true;
        }

        Ok(progress)
    }

    fn on_eof(&mut self, side: Side, now: Instant) {
        self.ends[side.index()].eof = true;
        self.last_activity = now;
        debug!("Tunnel {} {} reached end of stream", self.id, side);
        self.advance(TunnelState::HalfClosed);
    }

    /// Pause reads from a side whose outgoing buffer is at the bound, resume
    /// once it drained below.
    fn update_backpressure(&mut self, config: &ReactorConfig) {
        for side in Side::BOTH {
            let pending = self.outbound[side.peer().index()].len();
            let full = pending >= config.max_pending_bytes;
            let end = &mut self.ends[side.index()];

            if full && !end.paused {
                end.paused = true;
                BACKPRESSURE_PAUSES.inc();
                debug!(
                    "Tunnel {} paused reads from {} ({} bytes pending)",
                    self.id, side, pending
                );
            } else if !full && end.paused {
                end.paused = false;
                debug!(
                    "Tunnel {} resumed reads from {} ({} bytes pending)",
                    self.id, side, pending
                );
            }
        }
    }

    /// Both directions finished: EOF seen, buffers flushed, FIN propagated
    fn is_drained(&self) -> bool {
        Side::BOTH.iter().all(|side| {
            let end = &self.ends[side.index()];
            end.eof && end.shut && self.outbound[side.index()].is_empty()
        })
    }

    /// Next instant at which this tunnel must be expired, if any
    pub(crate) fn deadline(&self, config: &ReactorConfig) -> Option<Instant> {
        match self.state {
            TunnelState::Connecting => self
                .connect_started
                .map(|started| started + config.connect_timeout),
            TunnelState::HalfClosed => config
                .drain_timeout
                .map(|timeout| self.last_activity + timeout),
            _ => None,
        }
    }

    fn expire(&mut self, config: &ReactorConfig, now: Instant) {
        match self.state {
            TunnelState::Connecting => self.fail(
                TunnelError::ConnectTimeout {
                    target: self.connector.dial_address().to_string(),
                    timeout: config.connect_timeout,
                },
                now,
            ),
            TunnelState::HalfClosed => {
                debug!("Tunnel {} idle while half-closed, closing", self.id);
                self.close(CloseReason::DrainTimeout, now);
            }
            _ => {}
        }
    }

    /// Close without error. No-op once closed.
    pub(crate) fn close(&mut self, reason: CloseReason, now: Instant) {
        self.finish(reason, None, now);
    }

    /// Close with a terminal error. No-op once closed.
    pub(crate) fn fail(&mut self, error: TunnelError, now: Instant) {
        self.finish(CloseReason::Failed, Some(error), now);
    }

    fn finish(&mut self, reason: CloseReason, error: Option<TunnelError>, now: Instant) {
        if self.report.is_some() {
            return;
        }

        // Dropping the streams closes both channels
        self.connecting = None;
        self.pending_client = None;
        self.channels = [None, None];
        self.outbound = [BytesMut::new(), BytesMut::new()];

        let report = Arc::new(TunnelReport {
            id: self.id,
            kind: self.kind,
            target: self.target.clone(),
            reason,
            error,
            bytes_to_upstream: self.bytes_written[Side::Upstream.index()],
            bytes_to_client: self.bytes_written[Side::Client.index()],
            duration: now.saturating_duration_since(self.created),
        });

        self.state = TunnelState::Closed;
        self.report = Some(report.clone());
        self.status.send_replace(TunnelStatus {
            state: TunnelState::Closed,
            report: Some(report),
        });
    }

    /// Move forward in the lifecycle; never backwards
    fn advance(&mut self, state: TunnelState) {
        if state <= self.state {
            return;
        }
        self.state = state;
        self.status.send_modify(|status| status.state = state);
    }

    pub(crate) fn snapshot(&self) -> TunnelSnapshot {
        let client = Side::Client.index();
        let upstream = Side::Upstream.index();

        TunnelSnapshot {
            id: self.id,
            kind: self.kind,
            state: self.state,
            pending_to_upstream: self.outbound[upstream].len(),
            pending_to_client: self.outbound[client].len(),
            client_read_paused: self.ends[client].paused,
            upstream_read_paused: self.ends[upstream].paused,
            bytes_from_client: self.bytes_read[client],
            bytes_from_upstream: self.bytes_read[upstream],
            bytes_to_upstream: self.bytes_written[upstream],
            bytes_to_client: self.bytes_written[client],
            turns: self.turns,
        }
    }
}
