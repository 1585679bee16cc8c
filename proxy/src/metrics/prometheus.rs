use prometheus::core::Collector;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, TextEncoder};
use std::sync::OnceLock;

static CONNECTIONS_TOTAL: OnceLock<IntCounter> = OnceLock::new();
static HANDSHAKE_FAILURES: OnceLock<IntCounter> = OnceLock::new();
static ACTIVE_SESSIONS: OnceLock<IntGauge> = OnceLock::new();

static TEMPLATES_PUBLISHED: OnceLock<IntCounter> = OnceLock::new();
static TEMPLATE_HEIGHT: OnceLock<IntGauge> = OnceLock::new();
static JOB_PUSHES: OnceLock<IntCounter> = OnceLock::new();

static SHARES: OnceLock<IntCounterVec> = OnceLock::new();

static RPC_REQUESTS: OnceLock<IntCounter> = OnceLock::new();
static RPC_ERRORS: OnceLock<IntCounter> = OnceLock::new();
static UPSTREAM_RECONNECTS: OnceLock<IntCounter> = OnceLock::new();

fn connections_total() -> &'static IntCounter {
    CONNECTIONS_TOTAL.get_or_init(|| {
        IntCounter::new("proxy_connections_total", "Total miner connections accepted").unwrap()
    })
}

fn handshake_failures() -> &'static IntCounter {
    HANDSHAKE_FAILURES.get_or_init(|| {
        IntCounter::new("proxy_handshake_failures_total", "Connections closed before login completed")
            .unwrap()
    })
}

fn active_sessions() -> &'static IntGauge {
    ACTIVE_SESSIONS.get_or_init(|| IntGauge::new("proxy_active_sessions", "Registered miner sessions").unwrap())
}

fn templates_published() -> &'static IntCounter {
    TEMPLATES_PUBLISHED.get_or_init(|| {
        IntCounter::new("proxy_templates_published_total", "Templates fanned out to miners").unwrap()
    })
}

fn template_height() -> &'static IntGauge {
    TEMPLATE_HEIGHT.get_or_init(|| IntGauge::new("proxy_template_height", "Height of the current template").unwrap())
}

fn job_pushes() -> &'static IntCounter {
    JOB_PUSHES.get_or_init(|| IntCounter::new("proxy_job_pushes_total", "Job notifications queued to miners").unwrap())
}

fn shares() -> &'static IntCounterVec {
    SHARES.get_or_init(|| {
        IntCounterVec::new(
            Opts::new("proxy_shares_total", "Shares by outcome"),
            &["status"],
        )
        .unwrap()
    })
}

fn rpc_requests() -> &'static IntCounter {
    RPC_REQUESTS.get_or_init(|| IntCounter::new("proxy_rpc_requests_total", "Total RPC requests to the daemon").unwrap())
}

fn rpc_errors() -> &'static IntCounter {
    RPC_ERRORS.get_or_init(|| IntCounter::new("proxy_rpc_errors_total", "Total failed daemon RPC requests").unwrap())
}

fn upstream_reconnects() -> &'static IntCounter {
    UPSTREAM_RECONNECTS.get_or_init(|| {
        IntCounter::new("proxy_upstream_reconnects_total", "Daemon recoveries after a transport failure").unwrap()
    })
}

pub fn inc_connections() {
    connections_total().inc();
}

pub fn inc_handshake_failures() {
    handshake_failures().inc();
}

pub fn set_active_sessions(count: usize) {
    active_sessions().set(count as i64);
}

pub fn inc_templates_published(height: u64) {
    templates_published().inc();
    template_height().set(height as i64);
}

pub fn inc_job_pushes_by(n: u64) {
    job_pushes().inc_by(n);
}

/// `status` is one of accepted, rejected, stale, duplicate, invalid.
pub fn inc_share(status: &str) {
    shares().with_label_values(&[status]).inc();
}

pub fn inc_rpc_requests() {
    rpc_requests().inc();
}

pub fn inc_rpc_errors() {
    rpc_errors().inc();
}

pub fn inc_upstream_reconnects() {
    upstream_reconnects().inc();
}

pub fn render() -> String {
    let enc = TextEncoder::new();
    let mut mfs = Vec::new();

    mfs.extend(connections_total().collect());
    mfs.extend(handshake_failures().collect());
    mfs.extend(active_sessions().collect());
    mfs.extend(templates_published().collect());
    mfs.extend(template_height().collect());
    mfs.extend(job_pushes().collect());
    mfs.extend(shares().collect());
    mfs.extend(rpc_requests().collect());
    mfs.extend(rpc_errors().collect());
    mfs.extend(upstream_reconnects().collect());

    let mut buf = Vec::new();
    let _ = enc.encode(&mfs, &mut buf);
    String::from_utf8_lossy(&buf).to_string()
}
