/// Miner-facing listener
///
/// One task per connection plus a writer task draining the session's
/// outbound queue. The first message must be `login`; after that the session
/// is registered and receives every template until it closes.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

use super::handshake::{resolve_identity, share_identity, ConnectionPhase};
use super::protocol::{login_result, StratumError, StratumRequest, StratumResponse};
use crate::address::{AddressValidator, Identity};
use crate::config::{Mode, ProxyConfig};
use crate::error::{HandshakeError, ShareError};
use crate::metrics::prometheus as metrics;
use crate::registry::SessionRegistry;
use crate::session::Session;
use crate::upstream::{ShareSubmission, UpstreamHandle};

/// Longest accepted request line.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

type Lines = FramedRead<OwnedReadHalf, LinesCodec>;

enum Flow {
    Continue,
    Close,
}

pub struct StratumServer {
    mode: Mode,
    identity: Option<Identity>,
    handshake_timeout: Duration,
    idle_timeout: Duration,
    max_connections: usize,
    registry: Arc<SessionRegistry>,
    upstream: UpstreamHandle,
    validator: Arc<dyn AddressValidator>,
    connection_count: AtomicUsize,
}

impl StratumServer {
    pub fn new(
        config: &ProxyConfig,
        registry: Arc<SessionRegistry>,
        upstream: UpstreamHandle,
        validator: Arc<dyn AddressValidator>,
    ) -> Self {
        Self {
            mode: config.mode,
            identity: config.identity.clone(),
            handshake_timeout: config.handshake_timeout,
            idle_timeout: config.idle_timeout,
            max_connections: config.max_connections,
            registry,
            upstream,
            validator,
            connection_count: AtomicUsize::new(0),
        }
    }

    /// Bind with SO_REUSEADDR so a restart does not hit "address in use".
    pub fn bind(addr: SocketAddr) -> Result<TcpListener> {
        let socket = socket2::Socket::new(
            socket2::Domain::for_address(addr),
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket
            .bind(&socket2::SockAddr::from(addr))
            .map_err(|e| anyhow!("Failed to bind {}: {}", addr, e))?;
        socket.listen(1024)?;
        let std_listener: std::net::TcpListener = socket.into();
        Ok(TcpListener::from_std(std_listener)?)
    }

    pub fn connection_count(&self) -> usize {
        self.connection_count.load(Ordering::Relaxed)
    }

    /// Accept miners until shutdown.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        tracing::info!("✅ Miner listener on {} (SO_REUSEADDR)", listener.local_addr()?);

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((mut socket, peer_addr)) => {
                    if self.connection_count() >= self.max_connections {
                        tracing::warn!(
                            "🚫 Max connections ({}) reached, rejecting {}",
                            self.max_connections,
                            peer_addr
                        );
                        let _ = socket.shutdown().await;
                        continue;
                    }

                    self.connection_count.fetch_add(1, Ordering::Relaxed);
                    metrics::inc_connections();
                    tracing::info!("🔌 New connection from {}", peer_addr);

                    let server = Arc::clone(&self);
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        server.handle_connection(socket, peer_addr, shutdown).await;
                        server.connection_count.fetch_sub(1, Ordering::Relaxed);
                    });
                }
                Err(e) => {
                    tracing::error!("Failed to accept connection: {}", e);
                }
            }
        }

        self.registry.close_all().await;
        tracing::info!("Miner listener stopped");
        Ok(())
    }

    async fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr, shutdown: CancellationToken) {
        let _ = socket.set_nodelay(true);
        let (reader, writer) = socket.into_split();
        let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));

        let (tx, rx) = mpsc::unbounded_channel::<String>();
        let writer_task = tokio::spawn(write_loop(writer, rx));

        tracing::debug!("{} {:?}", peer_addr, ConnectionPhase::Handshaking);

        let handshake = tokio::select! {
            _ = shutdown.cancelled() => Err(HandshakeError::Closed),
            res = tokio::time::timeout(self.handshake_timeout, self.handshake(&mut lines, tx, peer_addr)) => {
                res.unwrap_or(Err(HandshakeError::Timeout(self.handshake_timeout.as_secs())))
            }
        };

        let session = match handshake {
            Ok(session) => session,
            Err(e) => {
                metrics::inc_handshake_failures();
                tracing::warn!("🚫 Handshake failed for {}: {}", peer_addr, e);
                // Any sender left was dropped with the handshake future.
                let _ = writer_task.await;
                tracing::debug!("{} {:?}", peer_addr, ConnectionPhase::Closed);
                return;
            }
        };

        tracing::debug!("Session {} {:?}", session.id, ConnectionPhase::Active);
        tracing::info!(
            "👷 Session {} active: {} ({})",
            session.id,
            session.identity,
            session.agent.as_deref().unwrap_or("unknown agent")
        );

        let reason = loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => break "shutdown".to_string(),
                next = tokio::time::timeout(self.idle_timeout, lines.next()) => next,
            };

            match next {
                Err(_) => break format!("idle for {}s", self.idle_timeout.as_secs()),
                Ok(None) => break "closed by miner".to_string(),
                Ok(Some(Err(LinesCodecError::MaxLineLengthExceeded))) => {
                    break "line too long".to_string()
                }
                Ok(Some(Err(LinesCodecError::Io(e)))) => break format!("read error: {}", e),
                Ok(Some(Ok(line))) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    session.touch();
                    tracing::debug!("📨 Received from {}: {}", peer_addr, line);
                    if let Flow::Close = self.handle_message(&session, line).await {
                        break "protocol violation".to_string();
                    }
                }
            }
        };

        tracing::debug!("Session {} {:?}", session.id, ConnectionPhase::Closing);
        self.registry.unregister(session.id).await;
        session.close();
        let _ = writer_task.await;
        tracing::debug!("Session {} {:?}", session.id, ConnectionPhase::Closed);

        tracing::info!(
            "🔌 Connection closed: session {} ({}) - {}",
            session.id,
            peer_addr,
            reason
        );
    }

    /// Read the login, resolve the identity and register the session.
    async fn handshake(
        &self,
        lines: &mut Lines,
        tx: mpsc::UnboundedSender<String>,
        peer_addr: SocketAddr,
    ) -> Result<Arc<Session>, HandshakeError> {
        let line = loop {
            match lines.next().await {
                None => return Err(HandshakeError::Closed),
                Some(Err(e)) => return Err(HandshakeError::Malformed(e.to_string())),
                Some(Ok(line)) if line.trim().is_empty() => continue,
                Some(Ok(line)) => break line,
            }
        };

        let request: StratumRequest = match serde_json::from_str(line.trim()) {
            Ok(request) => request,
            Err(e) => {
                let err = HandshakeError::Malformed(e.to_string());
                reply(&tx, StratumResponse::error(Value::Null, err.to_stratum()));
                return Err(err);
            }
        };

        let result = self.login(&request, tx.clone(), peer_addr).await;
        if let Err(e) = &result {
            reply(&tx, StratumResponse::error(request.id.clone(), e.to_stratum()));
        }
        result
    }

    async fn login(
        &self,
        request: &StratumRequest,
        tx: mpsc::UnboundedSender<String>,
        peer_addr: SocketAddr,
    ) -> Result<Arc<Session>, HandshakeError> {
        if request.method != "login" {
            return Err(HandshakeError::NotLogin(request.method.clone()));
        }
        let params = request
            .login_params()
            .ok_or_else(|| HandshakeError::Malformed("login params".to_string()))?;

        let identity = resolve_identity(&params, self.mode, self.identity.as_ref(), self.validator.as_ref())?;

        let session = Arc::new(Session::new(
            self.registry.next_session_id(),
            peer_addr,
            identity,
            params.agent.clone(),
            tx,
        ));

        let nicehash = self.registry.nonce_editing().await;
        let request_id = request.id.clone();
        let session_id = session.id;
        self.registry
            .register(Arc::clone(&session), move |job| {
                StratumResponse::success(request_id, login_result(session_id, job.as_ref(), nicehash))
                    .to_value()
            })
            .await?;

        Ok(session)
    }

    async fn handle_message(&self, session: &Session, line: &str) -> Flow {
        let request: StratumRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!("Invalid JSON from session {}: {}", session.id, e);
                session.send_json(
                    &StratumResponse::error(Value::Null, StratumError::invalid_params(format!("Invalid JSON: {}", e)))
                        .to_value(),
                );
                return Flow::Close;
            }
        };

        let response = match request.method.as_str() {
            "submit" => self.handle_submit(session, &request).await,
            "keepalived" => StratumResponse::success(request.id.clone(), json!({"status": "KEEPALIVED"})),
            "getjob" => match self.registry.job_for(session).await {
                Some(job) => StratumResponse::success(request.id.clone(), json!(job)),
                None => StratumResponse::error(
                    request.id.clone(),
                    StratumError::new(StratumError::JOB_NOT_FOUND, "No job available yet"),
                ),
            },
            "login" => StratumResponse::error(
                request.id.clone(),
                StratumError::new(StratumError::UNKNOWN, "Already logged in"),
            ),
            other => {
                tracing::warn!("Unknown method '{}' from session {}", other, session.id);
                session.send_json(&StratumResponse::error(request.id.clone(), StratumError::invalid_method(other)).to_value());
                return Flow::Close;
            }
        };

        session.send_json(&response.to_value());
        Flow::Continue
    }

    async fn handle_submit(&self, session: &Session, request: &StratumRequest) -> StratumResponse {
        match self.submit(session, request).await {
            Ok(()) => {
                metrics::inc_share("accepted");
                StratumResponse::success(request.id.clone(), json!({"status": "OK"}))
            }
            Err(e) => {
                session.record_rejected();
                metrics::inc_share(match &e {
                    ShareError::Stale { .. } => "stale",
                    ShareError::Duplicate => "duplicate",
                    ShareError::InvalidParams(_) | ShareError::UnknownJob(_) => "invalid",
                    ShareError::Rejected(_) | ShareError::Unavailable(_) => "rejected",
                });
                if e.is_local() {
                    tracing::debug!("Share from session {} rejected locally: {}", session.id, e);
                }
                StratumResponse::error(request.id.clone(), e.to_stratum())
            }
        }
    }

    /// Validate locally, forward, and wait for the daemon's verdict.
    async fn submit(&self, session: &Session, request: &StratumRequest) -> Result<(), ShareError> {
        let params = request.submit_params().map_err(ShareError::InvalidParams)?;
        let ticket = self
            .registry
            .accept_share(session, &params.job_id, &params.nonce)
            .await?;

        self.upstream
            .submit(ShareSubmission {
                session_id: session.id,
                seq: ticket.seq,
                height: ticket.height,
                blob: ticket.blob,
                nonce: ticket.nonce,
                identity: share_identity(
                    self.mode,
                    self.identity.as_ref(),
                    self.registry.ready_identity(),
                    &session.identity,
                ),
                result: params.result,
            })
            .await?;

        session.record_accepted(ticket.difficulty);
        Ok(())
    }
}

fn reply(tx: &mpsc::UnboundedSender<String>, response: StratumResponse) {
    if let Ok(line) = serde_json::to_string(&response) {
        let _ = tx.send(line + "\n");
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(msg) = rx.recv().await {
        if writer.write_all(msg.as_bytes()).await.is_err() {
            break;
        }
        let _ = writer.flush().await;
    }
    let _ = writer.shutdown().await;
}
