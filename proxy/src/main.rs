use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use getwork_proxy::address::Bech32AddressValidator;
use getwork_proxy::api::{self, ApiState};
use getwork_proxy::config::{non_empty_path, Args, ProxyConfig};
use getwork_proxy::logging;
use getwork_proxy::reporter::StatsReporter;
use getwork_proxy::upstream::JsonRpcDaemon;
use getwork_proxy::Proxy;

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => tracing::info!("SIGTERM — shutting down"),
                    _ = tokio::signal::ctrl_c() => tracing::info!("SIGINT — shutting down"),
                }
            }
            Err(e) => {
                tracing::warn!("Failed to register SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("SIGINT — shutting down");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Ctrl+C — shutting down");
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let log_file = non_empty_path(&args.log_file);
    if let Err(e) = logging::init(log_file.as_deref()) {
        eprintln!("Failed to initialise logging: {:#}", e);
        return ExitCode::FAILURE;
    }

    let validator = Arc::new(Bech32AddressValidator::new(args.address_prefixes.clone()));
    let config = match ProxyConfig::from_args(&args, validator.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("❌ Configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    println!("🚀 getwork-proxy v{}", env!("CARGO_PKG_VERSION"));

    match run(config, validator).await {
        Ok(()) => {
            tracing::info!("🏁 Proxy shut down cleanly");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("❌ {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: ProxyConfig, validator: Arc<Bech32AddressValidator>) -> anyhow::Result<()> {
    let daemon = Arc::new(JsonRpcDaemon::new(config.daemon_url.clone(), None));
    let proxy = Proxy::bind(config.clone(), daemon, validator)?;
    tracing::info!("🔌 Listening for miners on {}", proxy.local_addr()?);

    let shutdown = CancellationToken::new();

    let reporter = StatsReporter::new(proxy.aggregator(), config.log_interval, config.stats_file.clone());
    let reporter_task = tokio::spawn(reporter.run(shutdown.clone()));

    let api_task = config.api_listen.map(|addr| {
        let state = ApiState::new(proxy.registry(), proxy.aggregator());
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = api::serve(addr, state, shutdown).await {
                tracing::error!("Stats API failed: {:#}", e);
            }
        })
    });

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            shutdown.cancel();
        });
    }

    let result = proxy.run(shutdown.clone()).await;
    shutdown.cancel();

    let _ = reporter_task.await;
    if let Some(task) = api_task {
        let _ = task.await;
    }
    result
}
