/// Session registry - the single source of truth for connected miners
///
/// Holds the live sessions, the nonce allocator and the current template
/// behind one structural lock, so registration, partition assignment and job
/// fan-out are atomic with respect to each other. Job lines are queued under
/// that lock (unbounded sends never suspend), which keeps every session's
/// view of templates in sequence order.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;
use tokio::sync::{watch, RwLock};

use crate::address::Identity;
use crate::error::{RegistryError, ShareError};
use crate::metrics::prometheus as metrics;
use crate::nonce::{self, NonceAllocator};
use crate::session::{Session, SessionId};
use crate::stratum::protocol::job_push;
use crate::work::{parse_job_id, BlockTemplate, Job, WorkTemplate};

struct RegistryInner {
    sessions: BTreeMap<SessionId, Arc<Session>>,
    allocator: NonceAllocator,
    current: Option<Arc<WorkTemplate>>,
    /// Upstream nonces already taken for the current template.
    seen_nonces: HashSet<u32>,
    seq: u64,
}

/// A share that passed local validation and may be forwarded.
#[derive(Debug, Clone)]
pub struct ShareTicket {
    pub session_id: SessionId,
    pub seq: u64,
    pub height: u64,
    pub difficulty: u64,
    /// Reconstructed upstream nonce
    pub nonce: u32,
    /// Hashing blob with the upstream nonce filled in (hex)
    pub blob: String,
}

pub struct SessionRegistry {
    inner: RwLock<RegistryInner>,
    next_id: AtomicU64,
    ready_tx: watch::Sender<Option<Identity>>,
}

impl SessionRegistry {
    pub fn new(nonce_editing: bool, prefix_bits: u8) -> Self {
        let (ready_tx, _) = watch::channel(None);
        Self {
            inner: RwLock::new(RegistryInner {
                sessions: BTreeMap::new(),
                allocator: NonceAllocator::new(nonce_editing, prefix_bits),
                current: None,
                seen_nonces: HashSet::new(),
                seq: 0,
            }),
            next_id: AtomicU64::new(1),
            ready_tx,
        }
    }

    /// Allocate a session id. Ids are never reused.
    pub fn next_session_id(&self) -> SessionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn nonce_editing(&self) -> bool {
        self.inner.read().await.allocator.is_enabled()
    }

    /// Add a session and queue its greeting.
    ///
    /// `greet` receives the session's first job (if a template exists) and
    /// returns the login response; it is queued before any later job push.
    pub async fn register<F>(&self, session: Arc<Session>, greet: F) -> Result<(), RegistryError>
    where
        F: FnOnce(Option<Job>) -> Value,
    {
        let count = {
            let mut guard = self.inner.write().await;
            let inner = &mut *guard;

            if inner.sessions.contains_key(&session.id) {
                return Err(RegistryError::DuplicateId(session.id));
            }
            if let Some(capacity) = inner.allocator.capacity() {
                if inner.sessions.len() >= capacity {
                    return Err(nonce::AllocatorError::Exhausted(capacity).into());
                }
            }

            let job = match inner.current.clone() {
                Some(work) => {
                    let partition = inner.allocator.assign(session.id)?;
                    session.assign_job(work.seq, partition);
                    Some(work.job_for(partition))
                }
                None => None,
            };

            session.send_json(&greet(job));
            inner.sessions.insert(session.id, Arc::clone(&session));
            inner.sessions.len()
        };

        metrics::set_active_sessions(count);
        self.ready_tx.send_if_modified(|ready| {
            if ready.is_none() {
                *ready = Some(session.identity.clone());
                true
            } else {
                false
            }
        });

        tracing::debug!("📝 Session {} registered ({} live)", session.id, count);
        Ok(())
    }

    /// Remove a session and free its partition. Safe to call more than once.
    pub async fn unregister(&self, id: SessionId) -> Option<Arc<Session>> {
        let (removed, count) = {
            let mut inner = self.inner.write().await;
            let removed = inner.sessions.remove(&id);
            if removed.is_some() {
                inner.allocator.release(id);
            }
            (removed, inner.sessions.len())
        };

        if let Some(session) = &removed {
            session.close();
            metrics::set_active_sessions(count);
            tracing::debug!("🗑️  Session {} unregistered ({} live)", id, count);
        }
        removed
    }

    pub async fn count(&self) -> usize {
        self.inner.read().await.sessions.len()
    }

    /// Point-in-time copy of the live sessions in registration order.
    pub async fn snapshot(&self) -> Vec<Arc<Session>> {
        self.inner.read().await.sessions.values().cloned().collect()
    }

    /// Visit a snapshot; the structural lock is not held while `visitor` runs.
    pub async fn for_each<F>(&self, mut visitor: F)
    where
        F: FnMut(&Arc<Session>),
    {
        for session in self.snapshot().await {
            visitor(&session);
        }
    }

    pub async fn current_template(&self) -> Option<Arc<WorkTemplate>> {
        self.inner.read().await.current.clone()
    }

    /// Publish a new template: bump the sequence, reassign partitions in
    /// registration order and push a job to every session.
    pub async fn publish(&self, template: BlockTemplate) -> Result<u64> {
        let (seq, height, pushed) = {
            let mut guard = self.inner.write().await;
            let inner = &mut *guard;

            let seq = inner.seq + 1;
            let work = Arc::new(WorkTemplate::new(seq, template)?);
            let ids: Vec<SessionId> = inner.sessions.keys().copied().collect();
            inner.allocator.begin_template(ids)?;
            inner.seq = seq;
            inner.seen_nonces.clear();

            let mut pushed = 0u64;
            for session in inner.sessions.values() {
                let partition = inner.allocator.partition_of(session.id);
                session.assign_job(seq, partition);
                if session.send_json(&job_push(&work.job_for(partition))) {
                    pushed += 1;
                }
            }

            let height = work.height();
            inner.current = Some(work);
            (seq, height, pushed)
        };

        metrics::inc_templates_published(height);
        metrics::inc_job_pushes_by(pushed);
        tracing::info!(
            "📋 New job {}-{} sent to {} miner(s)",
            seq,
            height,
            pushed
        );
        Ok(seq)
    }

    /// Current job for one session (`getjob`).
    pub async fn job_for(&self, session: &Session) -> Option<Job> {
        let inner = self.inner.read().await;
        let work = inner.current.as_ref()?;
        Some(work.job_for(inner.allocator.partition_of(session.id)))
    }

    /// Validate a submission against the current template and reserve its
    /// reconstructed nonce.
    pub async fn accept_share(
        &self,
        session: &Session,
        job_id: &str,
        reported_nonce: &str,
    ) -> Result<ShareTicket, ShareError> {
        let (seq, height) =
            parse_job_id(job_id).ok_or_else(|| ShareError::UnknownJob(job_id.to_string()))?;
        let reported = nonce::parse_nonce_hex(reported_nonce)
            .ok_or_else(|| ShareError::InvalidParams(format!("bad nonce '{}'", reported_nonce)))?;

        let mut guard = self.inner.write().await;
        let inner = &mut *guard;

        let work = inner
            .current
            .clone()
            .ok_or_else(|| ShareError::UnknownJob(job_id.to_string()))?;

        if seq < work.seq || session.is_stale(seq) {
            return Err(ShareError::Stale {
                submitted: seq,
                current: work.seq,
            });
        }
        if seq != work.seq || height != work.height() || session.current_seq() != work.seq {
            return Err(ShareError::UnknownJob(job_id.to_string()));
        }

        let partition = inner.allocator.partition_of(session.id);
        if let Some(p) = partition {
            if !p.contains(reported) {
                return Err(ShareError::InvalidParams(format!(
                    "nonce {} outside assigned range",
                    reported_nonce
                )));
            }
        }
        let upstream_nonce = nonce::reconstruct(partition, reported);
        if !inner.seen_nonces.insert(upstream_nonce) {
            return Err(ShareError::Duplicate);
        }

        Ok(ShareTicket {
            session_id: session.id,
            seq,
            height,
            difficulty: work.template.difficulty,
            nonce: upstream_nonce,
            blob: work.solved_blob(upstream_nonce),
        })
    }

    /// Wait for the first registration and return that miner's identity.
    pub async fn wait_until_ready(&self) -> Identity {
        let mut rx = self.ready_tx.subscribe();
        loop {
            if let Some(identity) = rx.borrow_and_update().clone() {
                return identity;
            }
            if rx.changed().await.is_err() {
                // sender lives as long as the registry
                std::future::pending::<()>().await;
            }
        }
    }

    /// Identity of the first registered miner, if any has registered yet.
    pub fn ready_identity(&self) -> Option<Identity> {
        self.ready_tx.borrow().clone()
    }

    /// Close and drop every session (shutdown).
    pub async fn close_all(&self) {
        let sessions: Vec<Arc<Session>> = {
            let mut inner = self.inner.write().await;
            let ids: Vec<SessionId> = inner.sessions.keys().copied().collect();
            for id in ids {
                inner.allocator.release(id);
            }
            std::mem::take(&mut inner.sessions).into_values().collect()
        };
        for session in &sessions {
            session.close();
        }
        metrics::set_active_sessions(0);
    }
}
