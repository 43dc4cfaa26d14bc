//! Reactor - single-threaded, readiness-based tunnel multiplexer
//!
//! One dedicated OS thread runs a current-thread tokio runtime whose only
//! task is the Reactor loop. Every registered tunnel lives in the Reactor's
//! registry and is driven from a single `poll_fn` future, so channel state
//! and interest are never shared across threads and the dispatch path takes
//! no locks. A turn only drives the tunnels whose own waker fired or whose
//! deadline passed. Other threads talk to the Reactor through [`ReactorHandle`],
//! which enqueues commands on an unbounded channel.

mod registry;

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Sleep;
use tracing::{debug, error, info, warn};

use crate::app::metrics::{
    format_bytes, RELAY_BYTES, TUNNELS_ACTIVE, TUNNELS_CREATED, TUNNELS_FAILED,
    TUNNEL_DURATION_SECONDS,
};
use crate::common::Result;
use crate::error::Error;
use crate::tunnel::{CloseReason, Tunnel, TunnelId, TunnelReport, TunnelSnapshot};

use registry::Registry;

/// Commands handled per turn before tunnels get their share
const COMMAND_BUDGET: usize = 64;

/// Woken tunnels driven per turn
const READY_BUDGET: usize = 1024;

/// Reactor tuning, fixed at construction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactorConfig {
    /// Backpressure bound per direction
    pub max_pending_bytes: usize,
    /// Bound on the Connecting state
    pub connect_timeout: Duration,
    /// Inactivity bound while half-closed, `None` waits forever
    pub drain_timeout: Option<Duration>,
    /// Largest single read
    pub read_chunk: usize,
    /// Relay passes per tunnel per turn
    pub turn_budget: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            max_pending_bytes: 64 * 1024,
            connect_timeout: Duration::from_secs(10),
            drain_timeout: Some(Duration::from_secs(30)),
            read_chunk: 16 * 1024,
            turn_budget: 32,
        }
    }
}

pub(crate) enum Command {
    Register(Box<Tunnel>),
    Close(TunnelId),
    Inspect(TunnelId, oneshot::Sender<Option<TunnelSnapshot>>),
    Count(oneshot::Sender<usize>),
    Shutdown,
}

/// Handle to a running Reactor. Cheap to clone, usable from any thread.
#[derive(Clone)]
pub struct ReactorHandle {
    commands: mpsc::UnboundedSender<Command>,
    next_id: Arc<AtomicU64>,
    thread: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ReactorHandle {
    pub(crate) fn allocate_id(&self) -> TunnelId {
        TunnelId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Queue a tunnel for registration
    pub(crate) fn register(&self, tunnel: Tunnel) -> Result<()> {
        self.commands
            .send(Command::Register(Box::new(tunnel)))
            .map_err(|_| Error::ReactorClosed)
    }

    /// Queue a close request. Unknown or already closed ids are ignored.
    pub fn close(&self, id: TunnelId) {
        let _ = self.commands.send(Command::Close(id));
    }

    /// Snapshot of a registered tunnel, `None` once it was removed
    pub async fn inspect(&self, id: TunnelId) -> Result<Option<TunnelSnapshot>> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Inspect(id, tx))
            .map_err(|_| Error::ReactorClosed)?;
        rx.await.map_err(|_| Error::ReactorClosed)
    }

    /// Number of tunnels currently registered
    pub async fn active_tunnels(&self) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Count(tx))
            .map_err(|_| Error::ReactorClosed)?;
        rx.await.map_err(|_| Error::ReactorClosed)
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    /// Close every tunnel and stop the Reactor thread. Blocks until the
    /// thread exits; call it from a blocking context.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);

        let thread = self.thread.lock().take();
        if let Some(thread) = thread {
            if thread.thread().id() == std::thread::current().id() {
                return;
            }
            if thread.join().is_err() {
                error!("Reactor thread panicked");
            }
        }
    }
}

/// The Reactor loop state. Lives on the Reactor thread once spawned.
pub struct Reactor {
    config: ReactorConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    /// Ids of tunnels whose waker fired
    ready: mpsc::UnboundedReceiver<TunnelId>,
    registry: Registry,
    scratch: Vec<u8>,
    shutting_down: bool,
}

impl Reactor {
    /// Create a Reactor and its handle without starting it
    pub fn new(config: ReactorConfig) -> (Self, ReactorHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        let scratch = vec![0u8; config.read_chunk.max(1)];

        let reactor = Self {
            config,
            commands: rx,
            ready: ready_rx,
            registry: Registry::new(ready_tx),
            scratch,
            shutting_down: false,
        };
        let handle = ReactorHandle {
            commands: tx,
            next_id: Arc::new(AtomicU64::new(1)),
            thread: Arc::new(Mutex::new(None)),
        };

        (reactor, handle)
    }

    /// Start a Reactor on its own thread
    pub fn spawn(config: ReactorConfig) -> Result<ReactorHandle> {
        let (reactor, handle) = Self::new(config);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let thread = std::thread::Builder::new()
            .name("tunnel-reactor".to_string())
            .spawn(move || runtime.block_on(reactor.run()))?;

        *handle.thread.lock() = Some(thread);
        Ok(handle)
    }

    /// Run until shutdown is requested or every handle is dropped
    pub async fn run(mut self) {
        info!(
            "Reactor started (max pending {}, connect timeout {:?}, drain timeout {:?})",
            format_bytes(self.config.max_pending_bytes as u64),
            self.config.connect_timeout,
            self.config.drain_timeout
        );

        // Sleep needs the runtime, so the timer is created here
        let mut timer = Box::pin(tokio::time::sleep(Duration::ZERO));
        std::future::poll_fn(|cx| self.poll_turn(cx, timer.as_mut())).await;

        info!("Reactor stopped");
    }

    fn poll_turn(&mut self, cx: &mut Context<'_>, mut timer: Pin<&mut Sleep>) -> Poll<()> {
        let now = Instant::now();
        let mut more = false;

        // 1. Commands
        let mut handled = 0;
        loop {
            if handled == COMMAND_BUDGET {
                more = true;
                break;
            }
            match self.commands.poll_recv(cx) {
                Poll::Ready(Some(command)) => self.handle(command, now),
                Poll::Ready(None) => self.shutting_down = true,
                Poll::Pending => break,
            }
            if self.shutting_down {
                break;
            }
            handled += 1;
        }

        if self.shutting_down {
            let reports = self.registry.close_all(CloseReason::Shutdown, now);
            info!("Reactor shutting down, closed {} tunnels", reports.len());
            for report in &reports {
                record_report(report);
            }
            return Poll::Ready(());
        }

        // 2. Readiness dispatch: only tunnels whose waker fired
        let mut ready = Vec::new();
        loop {
            if ready.len() == READY_BUDGET {
                more = true;
                break;
            }
            match self.ready.poll_recv(cx) {
                Poll::Ready(Some(id)) => ready.push(id),
                // The registry holds a sender for the Reactor's lifetime
                Poll::Ready(None) | Poll::Pending => break,
            }
        }

        // 3. Expired deadlines
        ready.extend(self.registry.expired(now));

        for id in ready {
            if let Some(report) = self.registry.drive(id, &self.config, &mut self.scratch, now) {
                record_report(&report);
            }
        }

        // 4. Timer for the nearest deadline
        if let Some(deadline) = self.registry.next_deadline() {
            timer
                .as_mut()
                .reset(tokio::time::Instant::from_std(deadline));
            if timer.poll(cx).is_ready() {
                more = true;
            }
        }

        if more {
            cx.waker().wake_by_ref();
        }
        Poll::Pending
    }

    fn handle(&mut self, command: Command, now: Instant) {
        match command {
            Command::Register(mut tunnel) => {
                tunnel.register(now);
                TUNNELS_CREATED
                    .with_label_values(&[tunnel.kind().as_str()])
                    .inc();
                TUNNELS_ACTIVE.inc();
                debug!(
                    "Registered tunnel {} [{}] {} -> {}",
                    tunnel.id(),
                    tunnel.kind(),
                    tunnel.destination(),
                    tunnel.target()
                );
                self.registry.insert(*tunnel);
            }
            Command::Close(id) => {
                debug!("Close requested for tunnel {}", id);
                let closed = self
                    .registry
                    .close(id, CloseReason::Requested, &self.config, now);
                if let Some(report) = closed {
                    record_report(&report);
                }
            }
            Command::Inspect(id, reply) => {
                let _ = reply.send(self.registry.get(id).map(Tunnel::snapshot));
            }
            Command::Count(reply) => {
                let _ = reply.send(self.registry.len());
            }
            Command::Shutdown => self.shutting_down = true,
        }
    }
}

/// Publish a closed tunnel's report to logs and metrics
fn record_report(report: &TunnelReport) {
    TUNNELS_ACTIVE.dec();
    RELAY_BYTES
        .with_label_values(&["upstream"])
        .inc_by(report.bytes_to_upstream);
    RELAY_BYTES
        .with_label_values(&["client"])
        .inc_by(report.bytes_to_client);
    TUNNEL_DURATION_SECONDS
        .with_label_values(&[report.kind.as_str()])
        .observe(report.duration.as_secs_f64());

    match &report.error {
        Some(e) => {
            TUNNELS_FAILED.with_label_values(&[e.label()]).inc();
            warn!(
                "Tunnel {} [{}] to {} failed: {}",
                report.id, report.kind, report.target, e
            );
        }
        None => info!(
            "Closed: {} [{}] -> {} (↑{} ↓{} {:?}, {:?})",
            report.id,
            report.kind,
            report.target,
            format_bytes(report.bytes_to_upstream),
            format_bytes(report.bytes_to_client),
            report.duration,
            report.reason
        ),
    }
}
