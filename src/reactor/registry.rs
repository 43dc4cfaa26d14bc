//! Tunnel registry, owned by the Reactor thread
//!
//! Every tunnel is polled with its own [`Waker`]. Waking it queues the
//! tunnel's id on the Reactor's ready channel, so a readiness event only
//! drives the tunnel that owns the channel. Deadlines are kept ordered so
//! the timer never scans idle tunnels.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Wake, Waker};
use std::time::Instant;

use tokio::sync::mpsc;

use crate::tunnel::{CloseReason, Tunnel, TunnelId, TunnelReport};

use super::ReactorConfig;

/// Waker handed to every poll made on behalf of one tunnel
struct TunnelWaker {
    id: TunnelId,
    /// Set while the id sits in the ready queue
    queued: AtomicBool,
    ready: mpsc::UnboundedSender<TunnelId>,
}

impl Wake for TunnelWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        if !self.queued.swap(true, Ordering::AcqRel) {
            // Fails only once the Reactor is gone
            let _ = self.ready.send(self.id);
        }
    }
}

struct Entry {
    tunnel: Tunnel,
    wake: Arc<TunnelWaker>,
    waker: Waker,
    /// Deadline currently stored in `Registry::deadlines`
    deadline: Option<Instant>,
}

/// Registered tunnels keyed by id. Each tunnel owns its two channels, so a
/// channel is addressed as `(TunnelId, Side)`.
pub(crate) struct Registry {
    tunnels: HashMap<TunnelId, Entry>,
    deadlines: BTreeSet<(Instant, TunnelId)>,
    ready: mpsc::UnboundedSender<TunnelId>,
}

impl Registry {
    pub fn new(ready: mpsc::UnboundedSender<TunnelId>) -> Self {
        Self {
            tunnels: HashMap::new(),
            deadlines: BTreeSet::new(),
            ready,
        }
    }

    /// Adopt a tunnel and queue its first turn
    pub fn insert(&mut self, tunnel: Tunnel) {
        let wake = Arc::new(TunnelWaker {
            id: tunnel.id(),
            queued: AtomicBool::new(false),
            ready: self.ready.clone(),
        });
        let waker = Waker::from(wake.clone());
        waker.wake_by_ref();

        self.tunnels.insert(
            tunnel.id(),
            Entry {
                tunnel,
                wake,
                waker,
                deadline: None,
            },
        );
    }

    pub fn get(&self, id: TunnelId) -> Option<&Tunnel> {
        self.tunnels.get(&id).map(|entry| &entry.tunnel)
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    /// Run one turn of a woken tunnel. Returns its report if it closed.
    pub fn drive(
        &mut self,
        id: TunnelId,
        config: &ReactorConfig,
        scratch: &mut [u8],
        now: Instant,
    ) -> Option<Arc<TunnelReport>> {
        let entry = self.tunnels.get_mut(&id)?;

        // Cleared first so wakes raised during the turn queue it again
        entry.wake.queued.store(false, Ordering::Release);
        let mut cx = Context::from_waker(&entry.waker);
        if entry.tunnel.drive(&mut cx, config, scratch, now) {
            entry.waker.wake_by_ref();
        }

        self.settle(id, config)
    }

    /// Close one tunnel. Unknown ids are ignored.
    pub fn close(
        &mut self,
        id: TunnelId,
        reason: CloseReason,
        config: &ReactorConfig,
        now: Instant,
    ) -> Option<Arc<TunnelReport>> {
        self.tunnels.get_mut(&id)?.tunnel.close(reason, now);
        self.settle(id, config)
    }

    /// Close and remove every tunnel with `reason`
    pub fn close_all(&mut self, reason: CloseReason, now: Instant) -> Vec<Arc<TunnelReport>> {
        self.deadlines.clear();
        self.tunnels
            .drain()
            .filter_map(|(_, mut entry)| {
                entry.tunnel.close(reason, now);
                entry.tunnel.report()
            })
            .collect()
    }

    /// Remove and return the ids whose deadline passed
    pub fn expired(&mut self, now: Instant) -> Vec<TunnelId> {
        let mut ids = Vec::new();
        while let Some(&(deadline, id)) = self.deadlines.first() {
            if deadline > now {
                break;
            }
            self.deadlines.remove(&(deadline, id));
            if let Some(entry) = self.tunnels.get_mut(&id) {
                entry.deadline = None;
            }
            ids.push(id);
        }
        ids
    }

    /// Earliest deadline over all tunnels
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.first().map(|&(deadline, _)| deadline)
    }

    /// Remove a closed tunnel, or re-file its deadline after a state change
    fn settle(&mut self, id: TunnelId, config: &ReactorConfig) -> Option<Arc<TunnelReport>> {
        let entry = self.tunnels.get_mut(&id)?;

        if let Some(report) = entry.tunnel.report() {
            if let Some(deadline) = entry.deadline {
                self.deadlines.remove(&(deadline, id));
            }
            self.tunnels.remove(&id);
            return Some(report);
        }

        let deadline = entry.tunnel.deadline(config);
        if deadline != entry.deadline {
            if let Some(previous) = entry.deadline {
                self.deadlines.remove(&(previous, id));
            }
            if let Some(next) = deadline {
                self.deadlines.insert((next, id));
            }
            entry.deadline = deadline;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::common::{Address, Destination};
    use crate::reactor::Reactor;
    use crate::tunnel::{RawRelay, TunnelState};

    fn tunnel(reactor: &crate::reactor::ReactorHandle) -> (Tunnel, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (accepted, _) = listener.accept().unwrap();

        let target = Address::from(addr);
        let (tunnel, _handle) = Tunnel::new(
            reactor.allocate_id(),
            Destination::from_ip(addr.ip(), addr.port()),
            target.clone(),
            Arc::new(RawRelay::new(target)),
            accepted,
            reactor.clone(),
        );
        (tunnel, client)
    }

    #[test]
    fn test_repeated_wakes_queue_once() {
        let (_reactor, handle) = Reactor::new(ReactorConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut registry = Registry::new(tx);

        let (tunnel, _client) = tunnel(&handle);
        let id = tunnel.id();
        registry.insert(tunnel);

        let waker = registry.tunnels[&id].waker.clone();
        waker.wake_by_ref();
        waker.wake();

        assert_eq!(rx.try_recv().unwrap(), id);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_close_removes_tunnel_and_deadline() {
        let config = ReactorConfig::default();
        let (_reactor, handle) = Reactor::new(config.clone());
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut registry = Registry::new(tx);

        let (first, _c1) = tunnel(&handle);
        let (second, _c2) = tunnel(&handle);
        let (first_id, second_id) = (first.id(), second.id());
        registry.insert(first);
        registry.insert(second);
        assert_eq!(registry.next_deadline(), None);

        let report = registry
            .close(first_id, CloseReason::Requested, &config, Instant::now())
            .unwrap();
        assert_eq!(report.reason, CloseReason::Requested);
        assert_eq!(registry.len(), 1);
        assert!(registry.get(first_id).is_none());
        assert_eq!(registry.get(second_id).unwrap().state(), TunnelState::Init);

        // Unknown ids are ignored
        assert!(registry
            .close(first_id, CloseReason::Requested, &config, Instant::now())
            .is_none());

        let reports = registry.close_all(CloseReason::Shutdown, Instant::now());
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].reason, CloseReason::Shutdown);
        assert_eq!(registry.len(), 0);
    }
}
