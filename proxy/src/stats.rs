/// Read-only statistics snapshots
///
/// Built from a registry snapshot; never touches the structural lock while
/// reading per-session counters.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::address::Identity;
use crate::config::Mode;
use crate::registry::SessionRegistry;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStats {
    pub id: u64,
    pub remote_addr: String,
    pub wallet: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce_prefix: Option<u32>,
    pub shares_accepted: u64,
    pub shares_rejected: u64,
    pub hashrate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletStats {
    /// Human readable, e.g. "1.50 KH/s"
    pub hashrate: String,
    pub hashrate_hs: f64,
    pub shares: u64,
    pub rejected: u64,
    pub sessions: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub wallets: BTreeMap<String, WalletStats>,
    pub sessions: Vec<SessionStats>,
    pub aggregate_hashrate: f64,
    pub aggregate_shares: u64,
    pub aggregate_rejected: u64,
    pub session_count: usize,
}

pub struct StatsAggregator {
    registry: Arc<SessionRegistry>,
    mode: Mode,
    identity: Option<Identity>,
}

impl StatsAggregator {
    pub fn new(registry: Arc<SessionRegistry>, mode: Mode, identity: Option<Identity>) -> Self {
        Self {
            registry,
            mode,
            identity,
        }
    }

    pub async fn snapshot(&self) -> StatsSnapshot {
        let sessions: Vec<SessionStats> = self
            .registry
            .snapshot()
            .await
            .iter()
            .map(|s| s.stats())
            .collect();
        let identity = match self.mode {
            Mode::Solo => self.identity.clone().or_else(|| self.registry.ready_identity()),
            Mode::Pool => None,
        };
        aggregate(sessions, self.mode, identity.as_ref())
    }
}

/// Group session stats per wallet (pool) or under the proxy identity (solo).
pub fn aggregate(sessions: Vec<SessionStats>, mode: Mode, identity: Option<&Identity>) -> StatsSnapshot {
    let mut wallets: BTreeMap<String, WalletStats> = BTreeMap::new();

    for s in &sessions {
        let key = match (mode, identity) {
            (Mode::Solo, Some(identity)) => identity.to_string(),
            _ => s.wallet.clone(),
        };
        let entry = wallets.entry(key).or_insert_with(|| WalletStats {
            hashrate: String::new(),
            hashrate_hs: 0.0,
            shares: 0,
            rejected: 0,
            sessions: 0,
        });
        entry.hashrate_hs += s.hashrate;
        entry.shares += s.shares_accepted;
        entry.rejected += s.shares_rejected;
        entry.sessions += 1;
    }
    for entry in wallets.values_mut() {
        entry.hashrate = format_hashrate(entry.hashrate_hs);
    }

    StatsSnapshot {
        aggregate_hashrate: sessions.iter().map(|s| s.hashrate).sum(),
        aggregate_shares: sessions.iter().map(|s| s.shares_accepted).sum(),
        aggregate_rejected: sessions.iter().map(|s| s.shares_rejected).sum(),
        session_count: sessions.len(),
        wallets,
        sessions,
    }
}

pub fn format_hashrate(hs: f64) -> String {
    const UNITS: [&str; 6] = ["H/s", "KH/s", "MH/s", "GH/s", "TH/s", "PH/s"];
    let mut value = hs.max(0.0);
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::test_session;
    use serde_json::json;

    fn stats(id: u64, wallet: &str, hashrate: f64, shares: u64) -> SessionStats {
        let (session, _rx) = test_session(id, wallet);
        let mut s = session.stats();
        s.hashrate = hashrate;
        s.shares_accepted = shares;
        s
    }

    #[test]
    fn test_format_hashrate() {
        assert_eq!(format_hashrate(0.0), "0.00 H/s");
        assert_eq!(format_hashrate(999.0), "999.00 H/s");
        assert_eq!(format_hashrate(1500.0), "1.50 KH/s");
        assert_eq!(format_hashrate(2_500_000.0), "2.50 MH/s");
    }

    #[test]
    fn test_pool_mode_groups_per_wallet() {
        let sessions = vec![stats(1, "a", 100.0, 2), stats(2, "b", 50.0, 1), stats(3, "a", 10.0, 3)];
        let snap = aggregate(sessions, Mode::Pool, None);
        assert_eq!(snap.wallets.len(), 2);
        assert_eq!(snap.wallets["a"].shares, 5);
        assert_eq!(snap.wallets["a"].sessions, 2);
        assert_eq!(snap.aggregate_shares, 6);
        assert!((snap.aggregate_hashrate - 160.0).abs() < 1e-9);
        assert_eq!(snap.session_count, 3);
    }

    #[test]
    fn test_solo_mode_single_identity() {
        let identity = Identity::new("proxywallet", Some("rig".into()));
        let sessions = vec![stats(1, "a", 100.0, 2), stats(2, "b", 50.0, 1)];
        let snap = aggregate(sessions, Mode::Solo, Some(&identity));
        assert_eq!(snap.wallets.len(), 1);
        assert_eq!(snap.wallets["proxywallet.rig"].shares, 3);
        assert_eq!(snap.wallets["proxywallet.rig"].hashrate, "150.00 H/s");
    }

    #[tokio::test]
    async fn test_consecutive_snapshots_identical() {
        let registry = Arc::new(SessionRegistry::new(false, 8));
        let (s, _rx) = test_session(registry.next_session_id(), "a");
        let s = Arc::new(s);
        registry.register(Arc::clone(&s), |_| json!({})).await.unwrap();
        s.record_accepted(1000);

        let aggregator = StatsAggregator::new(Arc::clone(&registry), Mode::Pool, None);
        let first = aggregator.snapshot().await;
        let second = aggregator.snapshot().await;
        assert_eq!(first, second);
        assert_eq!(first.aggregate_shares, 1);
    }
}
