/// Miner sessions
///
/// A session is created once the handshake succeeds and lives until the
/// registry drops it. Share counters and hashrate sit behind a per-session
/// lock so the registry's structural lock is never needed for them.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::address::Identity;
use crate::nonce::NoncePartition;
use crate::stats::SessionStats;

pub type SessionId = u64;

/// Window over which accepted work is averaged into a hashrate.
pub const HASHRATE_WINDOW: Duration = Duration::from_secs(600);

/// Rolling hashrate from accepted share difficulty.
///
/// The value is only recomputed when a share is recorded, so reading it twice
/// without share activity yields the same number.
#[derive(Debug)]
pub struct HashrateEstimator {
    window: Duration,
    started: Instant,
    shares: VecDeque<(Instant, u64)>,
    hashrate: f64,
}

impl HashrateEstimator {
    pub fn new(window: Duration) -> Self {
        Self::starting_at(window, Instant::now())
    }

    pub fn starting_at(window: Duration, started: Instant) -> Self {
        Self {
            window,
            started,
            shares: VecDeque::new(),
            hashrate: 0.0,
        }
    }

    pub fn record(&mut self, difficulty: u64) {
        self.record_at(Instant::now(), difficulty);
    }

    pub fn record_at(&mut self, now: Instant, difficulty: u64) {
        self.shares.push_back((now, difficulty));
        while let Some((at, _)) = self.shares.front() {
            if now.duration_since(*at) > self.window {
                self.shares.pop_front();
            } else {
                break;
            }
        }

        let span = now.duration_since(self.started).min(self.window);
        let work: u64 = self.shares.iter().map(|(_, d)| *d).sum();
        self.hashrate = work as f64 / span.as_secs_f64().max(1.0);
    }

    /// Hashes per second.
    pub fn hashrate(&self) -> f64 {
        self.hashrate
    }
}

#[derive(Debug)]
struct SessionState {
    partition: Option<NoncePartition>,
    current_seq: u64,
    last_activity: DateTime<Utc>,
    shares_accepted: u64,
    shares_rejected: u64,
    estimator: HashrateEstimator,
}

pub struct Session {
    pub id: SessionId,
    pub remote_addr: SocketAddr,
    pub identity: Identity,
    pub agent: Option<String>,
    pub connected_at: DateTime<Utc>,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    state: Mutex<SessionState>,
}

impl Session {
    pub fn new(
        id: SessionId,
        remote_addr: SocketAddr,
        identity: Identity,
        agent: Option<String>,
        outbound: mpsc::UnboundedSender<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            remote_addr,
            identity,
            agent,
            connected_at: now,
            outbound: Mutex::new(Some(outbound)),
            state: Mutex::new(SessionState {
                partition: None,
                current_seq: 0,
                last_activity: now,
                shares_accepted: 0,
                shares_rejected: 0,
                estimator: HashrateEstimator::new(HASHRATE_WINDOW),
            }),
        }
    }

    /// Queue one line for the writer task. False once the session is closing.
    pub fn send(&self, line: String) -> bool {
        match self.outbound.lock().as_ref() {
            Some(tx) => tx.send(line).is_ok(),
            None => false,
        }
    }

    pub fn send_json(&self, message: &Value) -> bool {
        match serde_json::to_string(message) {
            Ok(payload) => self.send(payload + "\n"),
            Err(e) => {
                tracing::error!("Failed to encode message for session {}: {}", self.id, e);
                false
            }
        }
    }

    /// Stop all further writes. The writer task drains what is queued and exits.
    pub fn close(&self) {
        self.outbound.lock().take();
    }

    pub fn touch(&self) {
        self.state.lock().last_activity = Utc::now();
    }

    /// Called by the registry under its structural lock on every template.
    pub fn assign_job(&self, seq: u64, partition: Option<NoncePartition>) {
        let mut state = self.state.lock();
        state.current_seq = seq;
        state.partition = partition;
    }

    pub fn current_seq(&self) -> u64 {
        self.state.lock().current_seq
    }

    pub fn partition(&self) -> Option<NoncePartition> {
        self.state.lock().partition
    }

    pub fn is_stale(&self, seq: u64) -> bool {
        seq < self.current_seq()
    }

    pub fn record_accepted(&self, difficulty: u64) {
        let mut state = self.state.lock();
        state.shares_accepted += 1;
        state.last_activity = Utc::now();
        state.estimator.record(difficulty);
    }

    pub fn record_rejected(&self) {
        let mut state = self.state.lock();
        state.shares_rejected += 1;
        state.last_activity = Utc::now();
    }

    pub fn shares_accepted(&self) -> u64 {
        self.state.lock().shares_accepted
    }

    pub fn shares_rejected(&self) -> u64 {
        self.state.lock().shares_rejected
    }

    pub fn hashrate(&self) -> f64 {
        self.state.lock().estimator.hashrate()
    }

    pub fn stats(&self) -> SessionStats {
        let state = self.state.lock();
        SessionStats {
            id: self.id,
            remote_addr: self.remote_addr.to_string(),
            wallet: self.identity.wallet.clone(),
            worker: self.identity.worker.clone(),
            agent: self.agent.clone(),
            connected_at: self.connected_at,
            last_activity: state.last_activity,
            nonce_prefix: state.partition.map(|p| p.prefix()),
            shares_accepted: state.shares_accepted,
            shares_rejected: state.shares_rejected,
            hashrate: state.estimator.hashrate(),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("identity", &self.identity.to_string())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    pub(crate) fn test_session(
        id: SessionId,
        wallet: &str,
    ) -> (Session, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 40000 + id as u16);
        (Session::new(id, addr, Identity::new(wallet, None), None, tx), rx)
    }

    #[test]
    fn test_hashrate_window() {
        let start = Instant::now();
        let mut est = HashrateEstimator::starting_at(Duration::from_secs(100), start);
        assert_eq!(est.hashrate(), 0.0);

        est.record_at(start + Duration::from_secs(10), 1000);
        assert!((est.hashrate() - 100.0).abs() < 1e-9);

        est.record_at(start + Duration::from_secs(20), 1000);
        assert!((est.hashrate() - 100.0).abs() < 1e-9);

        // first share falls out of the window
        est.record_at(start + Duration::from_secs(200), 1000);
        assert!((est.hashrate() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_share_counters() {
        let (session, _rx) = test_session(1, "dero1abc");
        session.record_accepted(500);
        session.record_accepted(500);
        session.record_rejected();

        assert_eq!(session.shares_accepted(), 2);
        assert_eq!(session.shares_rejected(), 1);
        assert!(session.hashrate() > 0.0);

        let a = session.stats();
        let b = session.stats();
        assert_eq!(a, b);
    }

    #[test]
    fn test_no_writes_after_close() {
        let (session, mut rx) = test_session(2, "dero1abc");
        assert!(session.send_json(&serde_json::json!({"a": 1})));
        assert_eq!(rx.try_recv().unwrap(), "{\"a\":1}\n");

        session.close();
        assert!(!session.send("late\n".to_string()));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_staleness_tracks_assigned_seq() {
        let (session, _rx) = test_session(3, "dero1abc");
        session.assign_job(5, Some(NoncePartition::new(1, 8)));
        assert!(session.is_stale(4));
        assert!(!session.is_stale(5));
        assert_eq!(session.partition().map(|p| p.prefix()), Some(1));
    }
}
