/// Wires the registry, listener and upstream client together

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::address::AddressValidator;
use crate::config::ProxyConfig;
use crate::registry::SessionRegistry;
use crate::stats::StatsAggregator;
use crate::stratum::StratumServer;
use crate::upstream::{Backoff, DaemonClient, UpstreamClient};

pub struct Proxy<D: DaemonClient> {
    config: ProxyConfig,
    registry: Arc<SessionRegistry>,
    aggregator: Arc<StatsAggregator>,
    server: Arc<StratumServer>,
    listener: TcpListener,
    upstream: UpstreamClient<D>,
}

impl<D: DaemonClient> Proxy<D> {
    /// Bind the miner listener and build every component. Nothing runs yet.
    pub fn bind(config: ProxyConfig, daemon: Arc<D>, validator: Arc<dyn AddressValidator>) -> Result<Self> {
        let registry = Arc::new(SessionRegistry::new(config.nonce_editing, config.prefix_bits));
        let aggregator = Arc::new(StatsAggregator::new(
            Arc::clone(&registry),
            config.mode,
            config.identity.clone(),
        ));
        let (upstream, handle) = UpstreamClient::new(daemon, Arc::clone(&registry), config.poll_interval);
        let server = Arc::new(StratumServer::new(&config, Arc::clone(&registry), handle, validator));
        let listener = StratumServer::bind(config.listen_addr)?;

        Ok(Self {
            config,
            registry,
            aggregator,
            server,
            listener,
            upstream,
        })
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.upstream = self.upstream.with_backoff(backoff);
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn aggregator(&self) -> Arc<StatsAggregator> {
        Arc::clone(&self.aggregator)
    }

    /// Serve miners; the upstream starts once the first miner has registered.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let Self {
            config,
            registry,
            server,
            listener,
            upstream,
            ..
        } = self;

        tracing::info!(
            "⚙️  mode={:?} nonce_editing={} prefix_bits={} log_interval={}s daemon={}",
            config.mode,
            config.nonce_editing,
            config.prefix_bits,
            config.log_interval.as_secs(),
            config.daemon_url
        );

        let server_task = tokio::spawn(server.serve(listener, shutdown.clone()));

        tracing::info!("⏳ Waiting for the first miner before contacting the daemon");
        let first = tokio::select! {
            _ = shutdown.cancelled() => None,
            identity = registry.wait_until_ready() => Some(identity),
        };
        let identity = first.map(|first| match config.identity {
            Some(configured) => {
                tracing::info!("💼 Mining for {}", configured);
                configured
            }
            None => {
                tracing::info!("💼 Mining for first miner's wallet {}", first);
                first
            }
        });

        let upstream_task = identity.map(|identity| tokio::spawn(upstream.start(identity, shutdown.clone())));

        server_task.await??;
        if let Some(task) = upstream_task {
            task.await?;
        }
        Ok(())
    }
}
