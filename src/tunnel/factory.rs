//! TunnelFactory - turns an accepted connection into a registered tunnel

use std::sync::Arc;

use tracing::{debug, warn};

use crate::app::metrics::ROUTE_DECISION_ERRORS;
use crate::common::{Address, Destination, Result};
use crate::error::Error;
use crate::reactor::ReactorHandle;
use crate::router::{Decision, OperatingMode, RouteSelector, TunnelKind};

use super::connector::{CaptureRedirect, Connector, RawRelay};
use super::http_connect::HttpConnect;
use super::relay::Tunnel;
use super::TunnelHandle;

/// Upstream HTTP proxy used by HTTP_CONNECT tunnels
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamProxy {
    pub address: Address,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Read-only settings consumed by the factory
#[derive(Debug, Clone, Default)]
pub struct FactoryConfig {
    pub mode: OperatingMode,
    pub upstream_proxy: Option<UpstreamProxy>,
}

/// Builds tunnels for accepted connections.
///
/// Never performs network I/O; safe to call from any thread. The connect
/// step runs later, on the Reactor thread.
pub struct TunnelFactory {
    config: FactoryConfig,
    selector: Arc<dyn RouteSelector>,
    reactor: ReactorHandle,
}

impl TunnelFactory {
    pub fn new(
        config: FactoryConfig,
        selector: Arc<dyn RouteSelector>,
        reactor: ReactorHandle,
    ) -> Self {
        Self {
            config,
            selector,
            reactor,
        }
    }

    /// Route `destination`, build the tunnel and queue its registration.
    ///
    /// On error no tunnel exists and `client` is closed.
    pub fn create(
        &self,
        destination: Destination,
        client: std::net::TcpStream,
    ) -> Result<TunnelHandle> {
        let decision = self
            .selector
            .decide(&destination, self.config.mode)
            .map_err(|e| {
                ROUTE_DECISION_ERRORS.inc();
                warn!("No route for {}: {}", destination, e);
                e
            })?;

        let connector = self.connector(&decision)?;
        client.set_nonblocking(true)?;

        let id = self.reactor.allocate_id();
        let (tunnel, handle) = Tunnel::new(
            id,
            destination,
            decision.target,
            connector,
            client,
            self.reactor.clone(),
        );

        debug!(
            "Created tunnel {} [{}] for {} (rule {:?})",
            id,
            tunnel.kind(),
            tunnel.destination(),
            decision.rule
        );

        self.reactor.register(tunnel)?;
        Ok(handle)
    }

    fn connector(&self, decision: &Decision) -> Result<Arc<dyn Connector>> {
        let connector: Arc<dyn Connector> = match decision.kind {
            TunnelKind::Raw => Arc::new(RawRelay::new(decision.target.clone())),
            TunnelKind::CaptureRedirect => Arc::new(CaptureRedirect::new(decision.target.clone())),
            TunnelKind::HttpConnect => {
                let proxy = self.config.upstream_proxy.as_ref().ok_or_else(|| {
                    Error::Config(format!(
                        "{} selected for {} but no upstream proxy is configured",
                        decision.kind, decision.target
                    ))
                })?;
                Arc::new(
                    HttpConnect::new(proxy.address.clone(), decision.target.clone())
                        .with_credentials(proxy.username.clone(), proxy.password.clone()),
                )
            }
        };
        Ok(connector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::{Reactor, ReactorConfig};
    use crate::router::{RouteDecisionError, Ruleset};
    use crate::tunnel::TunnelState;

    fn intercepted() -> std::net::TcpStream {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let _client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        listener.accept().unwrap().0
    }

    fn factory(ruleset: Ruleset, upstream_proxy: Option<UpstreamProxy>) -> (TunnelFactory, Reactor) {
        let (reactor, handle) = Reactor::new(ReactorConfig::default());
        let config = FactoryConfig {
            mode: OperatingMode::Compatible,
            upstream_proxy,
        };
        (TunnelFactory::new(config, Arc::new(ruleset), handle), reactor)
    }

    #[test]
    fn test_no_route_creates_no_tunnel() {
        let (factory, _reactor) = factory(Ruleset::new(vec![], None), None);
        let err = factory
            .create(Destination::unresolved("example.com", 443), intercepted())
            .unwrap_err();
        assert!(matches!(
            err,
            Error::RouteDecision(RouteDecisionError::NoMatch { .. })
        ));
    }

    #[test]
    fn test_http_connect_requires_proxy() {
        let (factory, _reactor) =
            factory(Ruleset::new(vec![], Some(TunnelKind::HttpConnect)), None);
        let err = factory
            .create(Destination::unresolved("example.com", 443), intercepted())
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_create_queues_registration() {
        let proxy = UpstreamProxy {
            address: "127.0.0.1:3128".parse().unwrap(),
            username: Some("user".into()),
            password: Some("pass".into()),
        };
        let (factory, _reactor) = factory(
            Ruleset::new(vec![], Some(TunnelKind::HttpConnect)),
            Some(proxy),
        );

        let first = factory
            .create(Destination::unresolved("example.com", 443), intercepted())
            .unwrap();
        let second = factory
            .create(Destination::unresolved("example.org", 443), intercepted())
            .unwrap();

        assert_eq!(first.kind(), TunnelKind::HttpConnect);
        assert_eq!(first.target(), &Address::domain("example.com", 443));
        // Nothing runs until the Reactor picks the tunnel up
        assert_eq!(first.state(), TunnelState::Init);
        assert_ne!(first.id(), second.id());
    }
}
