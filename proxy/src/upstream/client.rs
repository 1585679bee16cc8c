/// Upstream client - the proxy's single relationship with the daemon
///
/// Polls for templates, publishes changed ones to the registry and forwards
/// share submissions one at a time in arrival order. Transport failures put
/// the loop into exponential backoff; sessions stay connected meanwhile.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use super::rpc_client::{DaemonClient, ShareSubmission, SubmitOutcome};
use crate::address::Identity;
use crate::error::ShareError;
use crate::metrics::prometheus as metrics;
use crate::registry::SessionRegistry;
use crate::work::BlockTemplate;

/// Pending submissions buffered between sessions and the upstream task.
pub const SUBMIT_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct Backoff {
    failures: u32,
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            failures: 0,
            base,
            max,
        }
    }

    /// Delay before the next attempt; doubles per consecutive failure.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32 << self.failures.min(16);
        self.failures = self.failures.saturating_add(1);
        self.base.saturating_mul(factor).min(self.max)
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

struct SubmitRequest {
    share: ShareSubmission,
    reply: oneshot::Sender<Result<(), ShareError>>,
}

/// Cheap handle the server uses to hand shares to the upstream task.
#[derive(Clone)]
pub struct UpstreamHandle {
    tx: mpsc::Sender<SubmitRequest>,
}

impl UpstreamHandle {
    /// Forward a share and wait for the daemon's verdict.
    pub async fn submit(&self, share: ShareSubmission) -> Result<(), ShareError> {
        let (reply, verdict) = oneshot::channel();
        self.tx
            .send(SubmitRequest { share, reply })
            .await
            .map_err(|_| ShareError::Unavailable("upstream stopped".to_string()))?;
        verdict
            .await
            .unwrap_or_else(|_| Err(ShareError::Unavailable("upstream stopped".to_string())))
    }
}

pub struct UpstreamClient<D: DaemonClient> {
    daemon: Arc<D>,
    registry: Arc<SessionRegistry>,
    poll_interval: Duration,
    backoff: Backoff,
    requests: mpsc::Receiver<SubmitRequest>,
}

impl<D: DaemonClient> UpstreamClient<D> {
    pub fn new(
        daemon: Arc<D>,
        registry: Arc<SessionRegistry>,
        poll_interval: Duration,
    ) -> (Self, UpstreamHandle) {
        let (tx, requests) = mpsc::channel(SUBMIT_QUEUE_CAPACITY);
        let client = Self {
            daemon,
            registry,
            poll_interval,
            backoff: Backoff::default(),
            requests,
        };
        (client, UpstreamHandle { tx })
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Run until shutdown, fetching work for `identity`.
    pub async fn start(mut self, identity: Identity, shutdown: CancellationToken) {
        tracing::info!("⛏️  Upstream started for {}", identity);

        let mut last: Option<BlockTemplate> = None;
        // First template, and the first after every outage, is always published.
        let mut force_publish = true;
        let mut next_poll = Instant::now();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep_until(next_poll) => {
                    match self.daemon.get_block_template(&identity).await {
                        Ok(template) => {
                            if self.backoff.failures() > 0 {
                                tracing::info!(
                                    "✅ Daemon reachable again after {} failed attempt(s)",
                                    self.backoff.failures()
                                );
                                metrics::inc_upstream_reconnects();
                                self.backoff.reset();
                            }

                            let changed = last.as_ref().map_or(true, |prev| !prev.same_work(&template));
                            if force_publish || changed {
                                match self.registry.publish(template.clone()).await {
                                    Ok(_) => {
                                        last = Some(template);
                                        force_publish = false;
                                    }
                                    Err(e) => tracing::error!("Failed to publish template: {}", e),
                                }
                            }
                            next_poll = Instant::now() + self.poll_interval;
                        }
                        Err(e) => {
                            let delay = self.backoff.next_delay();
                            force_publish = true;
                            tracing::warn!(
                                "🔌 Daemon unavailable ({}); retry {} in {:?}",
                                e,
                                self.backoff.failures(),
                                delay
                            );
                            next_poll = Instant::now() + delay;
                        }
                    }
                }
                request = self.requests.recv() => {
                    match request {
                        Some(request) => self.forward(request).await,
                        None => break,
                    }
                }
            }
        }

        tracing::info!("Upstream stopped");
    }

    async fn forward(&self, request: SubmitRequest) {
        let share = &request.share;
        let verdict = match self.daemon.submit_share(share).await {
            Ok(SubmitOutcome::Accepted) => {
                tracing::info!(
                    "✅ Share accepted: session {} job {}-{} nonce {:08x}",
                    share.session_id,
                    share.seq,
                    share.height,
                    share.nonce
                );
                Ok(())
            }
            Ok(SubmitOutcome::Rejected(reason)) => {
                tracing::warn!(
                    "❌ Share rejected by daemon: session {} job {}-{}: {}",
                    share.session_id,
                    share.seq,
                    share.height,
                    reason
                );
                Err(ShareError::Rejected(reason))
            }
            Err(e) => {
                tracing::warn!("❌ Share submit failed for session {}: {}", share.session_id, e);
                Err(ShareError::Unavailable(e.to_string()))
            }
        };
        // The session may have gone away meanwhile.
        let _ = request.reply.send(verdict);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Result};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::work::tests::sample_template;

    struct FlakyDaemon {
        up: AtomicBool,
        template: Mutex<BlockTemplate>,
        submitted: Mutex<Vec<u32>>,
    }

    impl DaemonClient for FlakyDaemon {
        async fn get_block_template(&self, _identity: &Identity) -> Result<BlockTemplate> {
            if self.up.load(Ordering::SeqCst) {
                Ok(self.template.lock().clone())
            } else {
                Err(anyhow!("connection refused"))
            }
        }

        async fn submit_share(&self, share: &ShareSubmission) -> Result<SubmitOutcome> {
            if !self.up.load(Ordering::SeqCst) {
                return Err(anyhow!("connection refused"));
            }
            self.submitted.lock().push(share.nonce);
            if share.nonce % 2 == 0 {
                Ok(SubmitOutcome::Accepted)
            } else {
                Ok(SubmitOutcome::Rejected("low difficulty".into()))
            }
        }
    }

    fn share(nonce: u32) -> ShareSubmission {
        ShareSubmission {
            session_id: 1,
            seq: 1,
            height: 1,
            blob: String::new(),
            nonce,
            identity: Identity::new("w", None),
            result: None,
        }
    }

    #[test]
    fn test_backoff_doubles_to_cap() {
        let mut backoff = Backoff::default();
        let delays: Vec<u64> = (0..7).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    async fn wait_for_seq(registry: &SessionRegistry, seq: u64) {
        for _ in 0..200 {
            if registry.current_template().await.map(|w| w.seq) >= Some(seq) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("template {} never published", seq);
    }

    #[tokio::test]
    async fn test_publish_only_on_change_and_after_recovery() {
        let daemon = Arc::new(FlakyDaemon {
            up: AtomicBool::new(true),
            template: Mutex::new(sample_template(1)),
            submitted: Mutex::new(Vec::new()),
        });
        let registry = Arc::new(SessionRegistry::new(false, 8));
        let (client, _handle) =
            UpstreamClient::new(Arc::clone(&daemon), Arc::clone(&registry), Duration::from_millis(10));
        let client = client.with_backoff(Backoff::new(Duration::from_millis(10), Duration::from_millis(40)));

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(client.start(Identity::new("w", None), shutdown.clone()));

        wait_for_seq(&registry, 1).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        // unchanged template is not republished
        assert_eq!(registry.current_template().await.unwrap().seq, 1);

        daemon.up.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(60)).await;
        daemon.up.store(true, Ordering::SeqCst);

        // same template, fresh sequence after the outage
        wait_for_seq(&registry, 2).await;
        assert_eq!(registry.current_template().await.unwrap().height(), 1);

        *daemon.template.lock() = sample_template(2);
        wait_for_seq(&registry, 3).await;

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_submissions_forwarded_in_order() {
        let daemon = Arc::new(FlakyDaemon {
            up: AtomicBool::new(true),
            template: Mutex::new(sample_template(1)),
            submitted: Mutex::new(Vec::new()),
        });
        let registry = Arc::new(SessionRegistry::new(false, 8));
        let (client, handle) =
            UpstreamClient::new(Arc::clone(&daemon), Arc::clone(&registry), Duration::from_secs(5));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(client.start(Identity::new("w", None), shutdown.clone()));

        for nonce in [2u32, 4, 6] {
            handle.submit(share(nonce)).await.unwrap();
        }
        assert_eq!(
            handle.submit(share(7)).await,
            Err(ShareError::Rejected("low difficulty".into()))
        );
        assert_eq!(*daemon.submitted.lock(), vec![2, 4, 6, 7]);

        daemon.up.store(false, Ordering::SeqCst);
        assert!(matches!(handle.submit(share(8)).await, Err(ShareError::Unavailable(_))));

        shutdown.cancel();
        task.await.unwrap();
        assert!(matches!(handle.submit(share(10)).await, Err(ShareError::Unavailable(_))));
    }
}
