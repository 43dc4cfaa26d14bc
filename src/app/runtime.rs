//! Runtime - configuration-driven assembly and lifecycle
//!
//! The runtime is responsible for:
//! - Spawning the Reactor thread
//! - Building the ruleset and the TunnelFactory
//! - Running inbound listeners
//! - Periodic stats logging and orderly shutdown

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::common::Result;
use crate::config::Config;
use crate::inbound::Inbound;
use crate::reactor::{Reactor, ReactorHandle};
use crate::router::RouteSelector;
use crate::tunnel::TunnelFactory;

use super::metrics::{gather_text, init_metrics};

/// Runtime manages the process lifecycle
pub struct Runtime {
    inbounds: Vec<Arc<Inbound>>,
    reactor: ReactorHandle,
    shutdown_tx: broadcast::Sender<()>,
}

impl Runtime {
    /// Build runtime from configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        init_metrics();

        let ruleset = config.ruleset();
        debug!(
            "Ruleset: {} rules, fallback {:?}, mode {:?}",
            ruleset.rules().len(),
            ruleset.fallback(),
            config.mode
        );
        let selector: Arc<dyn RouteSelector> = Arc::new(ruleset);

        let reactor = Reactor::spawn(config.reactor_config())?;
        let factory = Arc::new(TunnelFactory::new(
            config.factory_config(),
            selector,
            reactor.clone(),
        ));

        let inbounds = config
            .inbounds
            .iter()
            .map(|inbound| Arc::new(Inbound::new(inbound, factory.clone())))
            .collect();

        Ok(Self {
            inbounds,
            reactor,
            shutdown_tx,
        })
    }

    pub fn reactor(&self) -> &ReactorHandle {
        &self.reactor
    }

    /// Run until Ctrl+C
    pub async fn run(self) -> Result<()> {
        let mut handles = Vec::new();

        for inbound in &self.inbounds {
            let inbound = inbound.clone();
            let shutdown_rx = self.shutdown_tx.subscribe();

            let handle = tokio::spawn(async move {
                let tag = inbound.tag().to_string();
                if let Err(e) = inbound.run(shutdown_rx).await {
                    error!("[{}] Inbound error: {}", tag, e);
                }
            });

            handles.push(handle);
        }

        info!("Runtime started with {} inbounds", self.inbounds.len());

        // Start stats reporter task
        let reactor = self.reactor.clone();
        let stats_shutdown_rx = self.shutdown_tx.subscribe();
        let stats_handle = tokio::spawn(async move {
            Self::stats_reporter(reactor, stats_shutdown_rx).await;
        });

        // Wait for shutdown signal (Ctrl+C)
        tokio::signal::ctrl_c().await?;
        info!("Shutting down...");

        Self::log_stats(&self.reactor).await;

        // Stop accepting, then close every tunnel
        let _ = self.shutdown_tx.send(());
        for handle in handles {
            let _ = handle.await;
        }
        let _ = stats_handle.await;

        let reactor = self.reactor.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || reactor.shutdown()).await {
            error!("Reactor shutdown failed: {}", e);
        }

        Ok(())
    }

    /// Stats reporter task - logs stats periodically
    async fn stats_reporter(reactor: ReactorHandle, mut shutdown_rx: broadcast::Receiver<()>) {
        // Stats interval: 1 minute
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    Self::log_stats(&reactor).await;
                }
                _ = shutdown_rx.recv() => {
                    break;
                }
            }
        }
    }

    async fn log_stats(reactor: &ReactorHandle) {
        match reactor.active_tunnels().await {
            Ok(active) => info!("Active tunnels: {}", active),
            Err(e) => error!("Failed to query reactor: {}", e),
        }
        debug!("Metrics:\n{}", gather_text());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_runtime_from_default_config() {
        let mut config = Config::default_client();
        config.inbounds.clear();

        let runtime = Runtime::from_config(&config).unwrap();
        assert!(runtime.reactor().is_running());
        assert_eq!(runtime.reactor().active_tunnels().await.unwrap(), 0);

        let reactor = runtime.reactor().clone();
        tokio::task::spawn_blocking(move || reactor.shutdown())
            .await
            .unwrap();
        assert!(!runtime.reactor().is_running());
    }
}
