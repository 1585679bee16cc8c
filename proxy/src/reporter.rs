/// Periodic stats reporter
///
/// Every log interval: take a snapshot, log a per-wallet table and rewrite
/// the stats file. The file is replaced atomically (write + rename).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use crate::stats::{format_hashrate, StatsAggregator, StatsSnapshot};

pub struct StatsReporter {
    aggregator: Arc<StatsAggregator>,
    interval: Duration,
    stats_file: Option<PathBuf>,
}

impl StatsReporter {
    pub fn new(aggregator: Arc<StatsAggregator>, interval: Duration, stats_file: Option<PathBuf>) -> Self {
        Self {
            aggregator,
            interval,
            stats_file,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        // first tick completes immediately
        interval.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.report().await {
                        tracing::error!("Failed to write stats: {:#}", e);
                    }
                }
            }
        }
    }

    pub async fn report(&self) -> Result<StatsSnapshot> {
        let snapshot = self.aggregator.snapshot().await;
        log_table(&snapshot);
        if let Some(path) = &self.stats_file {
            write_stats_file(path, &snapshot).await?;
        }
        Ok(snapshot)
    }
}

/// `{"wallets": {addr: {"hashrate": "1.00 KH/s", "shares": n}}, ...}`
pub fn stats_document(snapshot: &StatsSnapshot) -> Value {
    let mut wallets = Map::new();
    for (wallet, stats) in &snapshot.wallets {
        wallets.insert(
            wallet.clone(),
            json!({
                "hashrate": stats.hashrate,
                "shares": stats.shares,
                "rejected": stats.rejected,
                "sessions": stats.sessions,
            }),
        );
    }

    json!({
        "wallets": wallets,
        "total": {
            "hashrate": format_hashrate(snapshot.aggregate_hashrate),
            "shares": snapshot.aggregate_shares,
            "rejected": snapshot.aggregate_rejected,
            "sessions": snapshot.session_count,
        },
        "sessions": snapshot.sessions,
    })
}

pub async fn write_stats_file(path: &Path, snapshot: &StatsSnapshot) -> Result<()> {
    let body = serde_json::to_vec_pretty(&stats_document(snapshot))?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, body)
        .await
        .with_context(|| format!("writing {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}

fn log_table(snapshot: &StatsSnapshot) {
    tracing::info!(
        "📊 {} miner(s) | {} | {} shares accepted, {} rejected",
        snapshot.session_count,
        format_hashrate(snapshot.aggregate_hashrate),
        snapshot.aggregate_shares,
        snapshot.aggregate_rejected
    );
    for (wallet, stats) in &snapshot.wallets {
        tracing::info!(
            "   {:<24} {:>14} {:>8} shares {:>4} session(s)",
            short_wallet(wallet),
            stats.hashrate,
            stats.shares,
            stats.sessions
        );
    }
}

fn short_wallet(wallet: &str) -> String {
    if wallet.chars().count() <= 24 {
        return wallet.to_string();
    }
    let head: String = wallet.chars().take(12).collect();
    let tail: String = wallet.chars().rev().take(9).collect::<Vec<_>>().into_iter().rev().collect();
    format!("{}...{}", head, tail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Mode;
    use crate::registry::SessionRegistry;
    use crate::session::tests::test_session;
    use crate::stats::aggregate;

    #[test]
    fn test_short_wallet() {
        assert_eq!(short_wallet("short"), "short");
        let long = "dero1qyw4fl3dupcg5qlrcsvcedze507q9u67lxfpu8kgnzp04aq73yheqqg2ctjn4";
        let short = short_wallet(long);
        assert!(short.starts_with("dero1qyw4fl3"));
        assert!(short.ends_with("qqg2ctjn4"));
        assert_eq!(short.chars().count(), 24);
    }

    #[test]
    fn test_stats_document_shape() {
        let (session, _rx) = test_session(1, "walletA");
        session.record_accepted(1000);
        let snapshot = aggregate(vec![session.stats()], Mode::Pool, None);
        let doc = stats_document(&snapshot);
        assert_eq!(doc["wallets"]["walletA"]["shares"], 1);
        assert!(doc["wallets"]["walletA"]["hashrate"].as_str().unwrap().ends_with("H/s"));
        assert_eq!(doc["total"]["sessions"], 1);
        assert_eq!(doc["sessions"][0]["wallet"], "walletA");
    }

    #[tokio::test]
    async fn test_report_writes_file() {
        let path = std::env::temp_dir().join(format!("getwork-proxy-stats-{}.json", std::process::id()));
        let registry = Arc::new(SessionRegistry::new(false, 8));
        let aggregator = Arc::new(StatsAggregator::new(registry, Mode::Pool, None));
        let reporter = StatsReporter::new(aggregator, Duration::from_secs(60), Some(path.clone()));

        let snapshot = reporter.report().await.unwrap();
        assert_eq!(snapshot.session_count, 0);

        let written: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert!(written["wallets"].as_object().unwrap().is_empty());
        let _ = std::fs::remove_file(&path);
    }
}
