//! Inbound Layer
//!
//! Accepts client connections, learns their Destination and hands the raw
//! channel to the [`TunnelFactory`]. Everything after the handoff happens on
//! the Reactor thread.

pub mod socks5;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::common::Result;
use crate::config::InboundConfig;
use crate::tunnel::{TunnelFactory, TunnelHandle};

/// A SOCKS5 listener feeding the factory
pub struct Inbound {
    tag: String,
    listen: SocketAddr,
    factory: Arc<TunnelFactory>,
}

impl Inbound {
    pub fn new(config: &InboundConfig, factory: Arc<TunnelFactory>) -> Self {
        Self {
            tag: config.tag.clone(),
            listen: config.listen,
            factory,
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Accept connections until shutdown
    pub async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let listener = TcpListener::bind(self.listen).await?;
        info!("[{}] Listening on {} (protocol: socks5)", self.tag, self.listen);

        let mut conn_count: u64 = 0;

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, source)) => {
                            conn_count += 1;
                            let conn_id = conn_count;
                            debug!("[{}] New connection #{} from {}", self.tag, conn_id, source);

                            let inbound = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = inbound.handle_connection(stream).await {
                                    warn!("Connection #{} from {} error: {}", conn_id, source, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("[{}] Accept error: {}", self.tag, e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("[{}] Shutting down (handled {} connections)", self.tag, conn_count);
                    break;
                }
            }
        }

        Ok(())
    }

    /// Handshake, then hand the channel over to a new tunnel
    async fn handle_connection(&self, mut stream: TcpStream) -> Result<TunnelHandle> {
        let destination = socks5::handshake(&mut stream).await?;
        let client = stream.into_std()?;
        let handle = self.factory.create(destination, client)?;

        debug!(
            "[{}] Tunnel {} [{}] -> {}",
            self.tag,
            handle.id(),
            handle.kind(),
            handle.target()
        );
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use crate::reactor::{Reactor, ReactorConfig};
    use crate::router::{RouteSelector, Ruleset, TunnelKind};
    use crate::tunnel::FactoryConfig;

    #[tokio::test]
    async fn test_socks_client_reaches_upstream() {
        let reactor = Reactor::spawn(ReactorConfig::default()).unwrap();
        let selector: Arc<dyn RouteSelector> =
            Arc::new(Ruleset::new(vec![], Some(TunnelKind::Raw)));
        let factory = Arc::new(TunnelFactory::new(
            FactoryConfig::default(),
            selector,
            reactor.clone(),
        ));

        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = upstream.accept().await.unwrap();
            stream.write_all(b"welcome").await.unwrap();
        });

        // Reserve a port for the inbound
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let listen = probe.local_addr().unwrap();
        drop(probe);

        let inbound = Arc::new(Inbound::new(
            &InboundConfig {
                tag: "socks-in".to_string(),
                listen,
            },
            factory,
        ));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let server = tokio::spawn(inbound.run(shutdown_rx));

        let mut client = loop {
            match TcpStream::connect(listen).await {
                Ok(stream) => break stream,
                Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        };

        let mut request = vec![5, 1, 0, 5, 1, 0, 1];
        match upstream_addr.ip() {
            std::net::IpAddr::V4(ip) => request.extend_from_slice(&ip.octets()),
            std::net::IpAddr::V6(_) => unreachable!(),
        }
        request.extend_from_slice(&upstream_addr.port().to_be_bytes());
        client.write_all(&request).await.unwrap();

        let mut replies = [0u8; 12];
        client.read_exact(&mut replies).await.unwrap();
        assert_eq!(replies[1], 0x00);
        assert_eq!(replies[3], 0x00);

        let mut greeting = Vec::new();
        client.read_to_end(&mut greeting).await.unwrap();
        assert_eq!(greeting, b"welcome");

        let _ = shutdown_tx.send(());
        server.await.unwrap().unwrap();
        reactor.shutdown();
    }
}
