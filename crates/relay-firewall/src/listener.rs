//! Inbound listener: terminates peer TLS and feeds local inboxes.
//!
//! Each accepted connection runs in its own session task. The accept loop
//! never touches the broker. A session resolves its inbox from the TLS
//! server name (or the `Open` address), then acknowledges each transfer
//! only after the sink has accepted it.

use async_trait::async_trait;
use relay_core::names::PEER_FINGERPRINT_PROPERTY;
use relay_core::{read_frame, short_fingerprint, write_frame, Envelope, PeerFrame, RelayError, RelayResult};
use rustls::ServerConfig;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep, timeout};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::activation::ActivationAware;
use crate::backoff::{Backoff, BackoffPolicy};
use crate::broker::Broker;
use crate::inbox::InboxRegistry;
use crate::tls::peer_fingerprint;

/// An authenticated inbound connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundSession {
    pub id: u64,
    pub peer_addr: SocketAddr,
    pub peer_fingerprint: String,
    pub sni_host: Option<String>,
    pub inbox: String,
}

/// Where inbound envelopes go.
#[async_trait]
pub trait InboundSink: Send + Sync {
    async fn has_inbox(&self, inbox: &str) -> bool;

    /// Returns once the envelope is safely stored.
    async fn deliver(&self, session: &InboundSession, envelope: Envelope) -> RelayResult<()>;
}

/// Publishes straight to the local broker.
pub struct BrokerSink {
    broker: Arc<dyn Broker>,
}

impl BrokerSink {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl InboundSink for BrokerSink {
    async fn has_inbox(&self, inbox: &str) -> bool {
        self.broker.queue_exists(inbox).await.unwrap_or(false)
    }

    async fn deliver(&self, session: &InboundSession, envelope: Envelope) -> RelayResult<()> {
        self.broker.publish(&session.inbox, envelope).await
    }
}

#[derive(Debug, Clone)]
pub struct ListenerSettings {
    pub handshake_timeout: Duration,
    pub max_message_size: usize,
    pub drain_timeout: Duration,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            max_message_size: 10 * 1024 * 1024,
            drain_timeout: Duration::from_secs(10),
        }
    }
}

struct SessionContext {
    registry: Arc<InboxRegistry>,
    sink: Arc<dyn InboundSink>,
    settings: ListenerSettings,
    next_id: AtomicU64,
}

struct Running {
    stop_tx: watch::Sender<bool>,
    accept_tasks: Vec<JoinHandle<()>>,
    sessions: Arc<std::sync::Mutex<JoinSet<()>>>,
    local_addrs: Vec<SocketAddr>,
}

/// Public TLS listener.
pub struct InboundListener {
    addrs: Vec<String>,
    ctx: Arc<SessionContext>,
    tls: Mutex<Option<Arc<ServerConfig>>>,
    running: Mutex<Option<Running>>,
}

impl InboundListener {
    pub fn new(
        addrs: Vec<String>,
        registry: Arc<InboxRegistry>,
        sink: Arc<dyn InboundSink>,
        settings: ListenerSettings,
    ) -> Self {
        Self {
            addrs,
            ctx: Arc::new(SessionContext {
                registry,
                sink,
                settings,
                next_id: AtomicU64::new(1),
            }),
            tls: Mutex::new(None),
            running: Mutex::new(None),
        }
    }

    /// Install the TLS context used by the next `start`.
    pub async fn set_tls(&self, config: Arc<ServerConfig>) {
        *self.tls.lock().await = Some(config);
    }

    /// Addresses actually bound while running.
    pub async fn local_addrs(&self) -> Vec<SocketAddr> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|r| r.local_addrs.clone())
            .unwrap_or_default()
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Bind every configured address and start accepting.
    pub async fn start(&self) -> RelayResult<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }
        let tls = self
            .tls
            .lock()
            .await
            .clone()
            .ok_or_else(|| RelayError::Config("listener has no TLS context".into()))?;
        let acceptor = TlsAcceptor::from(tls);

        let mut listeners = Vec::with_capacity(self.addrs.len());
        for addr in &self.addrs {
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|e| RelayError::Transport(format!("bind {addr}: {e}")))?;
            listeners.push(listener);
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let sessions = Arc::new(std::sync::Mutex::new(JoinSet::new()));
        let mut local_addrs = Vec::new();
        let mut accept_tasks = Vec::new();
        for listener in listeners {
            let local = listener.local_addr()?;
            info!(addr = %local, "inbound listener started");
            local_addrs.push(local);
            accept_tasks.push(tokio::spawn(accept_loop(
                listener,
                acceptor.clone(),
                self.ctx.clone(),
                sessions.clone(),
                stop_rx.clone(),
            )));
        }

        *running = Some(Running {
            stop_tx,
            accept_tasks,
            sessions,
            local_addrs,
        });
        Ok(())
    }

    /// Stop accepting, let sessions finish their current message, and
    /// close whatever is still open after the drain timeout.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        let _ = running.stop_tx.send(true);
        for task in running.accept_tasks {
            let _ = task.await;
        }

        let mut sessions = match running.sessions.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        let open = sessions.len();
        let drained = timeout(self.ctx.settings.drain_timeout, async {
            while sessions.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = sessions.len(), "sessions still open after drain timeout, closing");
            sessions.shutdown().await;
        }
        info!(sessions = open, "inbound listener stopped");
    }
}

#[async_trait]
impl ActivationAware for InboundListener {
    fn name(&self) -> &str {
        "inbound-listener"
    }

    async fn activate(&self) -> RelayResult<()> {
        self.start().await
    }

    async fn deactivate(&self) {
        self.stop().await
    }
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    ctx: Arc<SessionContext>,
    sessions: Arc<std::sync::Mutex<JoinSet<()>>>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::new(BackoffPolicy::accept_errors());
    loop {
        tokio::select! {
            _ = crate::stopped(&mut stop_rx) => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    backoff.reset();
                    let _ = stream.set_nodelay(true);
                    let fut = handle_connection(stream, peer_addr, acceptor.clone(), ctx.clone(), stop_rx.clone());
                    if let Ok(mut set) = sessions.lock() {
                        while set.try_join_next().is_some() {}
                        set.spawn(fut);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    if !pause_after_accept_error(&mut backoff, &mut stop_rx).await {
                        break;
                    }
                }
            }
        }
    }
    debug!("accept loop ended");
}

/// Sit out a failed `accept` so a persistent error does not spin the loop.
/// Returns false if stop arrived meanwhile.
pub(crate) async fn pause_after_accept_error(backoff: &mut Backoff, stop_rx: &mut watch::Receiver<bool>) -> bool {
    let delay = backoff.next_delay();
    debug!(delay_ms = delay.as_millis() as u64, "pausing accept");
    tokio::select! {
        _ = sleep(delay) => true,
        _ = crate::stopped(stop_rx) => false,
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    acceptor: TlsAcceptor,
    ctx: Arc<SessionContext>,
    stop_rx: watch::Receiver<bool>,
) {
    let tls = match timeout(ctx.settings.handshake_timeout, acceptor.accept(stream)).await {
        Ok(Ok(tls)) => tls,
        Ok(Err(e)) => {
            warn!(peer = %peer_addr, error = %e, "peer handshake rejected");
            return;
        }
        Err(_) => {
            warn!(peer = %peer_addr, "peer handshake timed out");
            return;
        }
    };
    let (_, conn) = tls.get_ref();
    let sni_host = conn.server_name().map(str::to_string);
    let Some(fingerprint) = peer_fingerprint(conn) else {
        warn!(peer = %peer_addr, "peer presented no certificate");
        return;
    };
    let id = ctx.next_id.fetch_add(1, Ordering::Relaxed);
    run_session(tls, id, peer_addr, fingerprint, sni_host, &ctx, stop_rx).await;
}

async fn run_session<S>(
    mut stream: S,
    id: u64,
    peer_addr: SocketAddr,
    fingerprint: String,
    sni_host: Option<String>,
    ctx: &SessionContext,
    mut stop_rx: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let peer = short_fingerprint(&fingerprint, 12).to_string();
    let open = timeout(ctx.settings.handshake_timeout, read_frame(&mut stream, 64 * 1024)).await;
    let address = match open {
        Ok(Ok(Some(PeerFrame::Open { address }))) => address,
        Ok(Ok(Some(other))) => {
            warn!(session = id, peer = %peer, frame = ?other, "expected open");
            close(&mut stream, "expected open").await;
            return;
        }
        Ok(Ok(None)) => return,
        Ok(Err(e)) => {
            warn!(session = id, peer = %peer, error = %e, "bad open frame");
            return;
        }
        Err(_) => {
            warn!(session = id, peer = %peer, "no open frame before timeout");
            close(&mut stream, "open timeout").await;
            return;
        }
    };

    let inbox = match ctx.registry.resolve(sni_host.as_deref(), address.as_deref()) {
        Ok(inbox) => inbox,
        Err(e) => {
            warn!(session = id, peer = %peer, sni = ?sni_host, error = %e, "cannot route session");
            close(&mut stream, &e.to_string()).await;
            return;
        }
    };
    if !ctx.sink.has_inbox(&inbox).await {
        warn!(session = id, peer = %peer, inbox = %inbox, "inbox does not exist");
        close(&mut stream, &format!("no such inbox {inbox}")).await;
        return;
    }
    if write_frame(&mut stream, &PeerFrame::Opened { inbox: inbox.clone() }).await.is_err() {
        return;
    }

    let session = InboundSession {
        id,
        peer_addr,
        peer_fingerprint: fingerprint,
        sni_host,
        inbox,
    };
    info!(
        session = id,
        peer = %peer,
        addr = %peer_addr,
        sni = ?session.sni_host,
        inbox = %session.inbox,
        "inbound session opened"
    );

    // Room for properties on top of the largest accepted payload.
    let frame_limit = ctx.settings.max_message_size + 64 * 1024;
    loop {
        let frame = tokio::select! {
            biased;
            _ = crate::stopped(&mut stop_rx) => {
                close(&mut stream, "listener stopping").await;
                break;
            }
            f = read_frame::<_, PeerFrame>(&mut stream, frame_limit) => f,
        };
        match frame {
            Ok(Some(PeerFrame::Transfer { seq, properties, payload })) => {
                if payload.len() > ctx.settings.max_message_size {
                    warn!(session = id, seq, size = payload.len(), "message exceeds maximum size");
                    let reject = PeerFrame::Reject {
                        seq,
                        reason: "message too large".into(),
                    };
                    if write_frame(&mut stream, &reject).await.is_err() {
                        break;
                    }
                    continue;
                }
                let envelope = Envelope { properties, payload }
                    .with_property(PEER_FINGERPRINT_PROPERTY, session.peer_fingerprint.clone());
                let answer = match ctx.sink.deliver(&session, envelope).await {
                    Ok(()) => {
                        debug!(session = id, seq, "inbound message stored");
                        PeerFrame::Ack { seq }
                    }
                    Err(e @ (RelayError::QueueNotFound(_) | RelayError::Rejected(_))) => {
                        warn!(session = id, seq, error = %e, "inbound message refused");
                        PeerFrame::Reject {
                            seq,
                            reason: e.to_string(),
                        }
                    }
                    Err(e) => {
                        warn!(session = id, seq, error = %e, "cannot store inbound message, closing session");
                        close(&mut stream, "temporarily unavailable").await;
                        break;
                    }
                };
                if write_frame(&mut stream, &answer).await.is_err() {
                    break;
                }
            }
            Ok(Some(PeerFrame::Close { reason })) => {
                debug!(session = id, reason = %reason, "peer closed session");
                break;
            }
            Ok(Some(other)) => {
                warn!(session = id, frame = ?other, "unexpected frame");
                close(&mut stream, "protocol error").await;
                break;
            }
            Ok(None) => break,
            Err(e) => {
                warn!(session = id, error = %e, "session read failed");
                if matches!(e, RelayError::FrameTooLarge { .. }) {
                    close(&mut stream, "frame too large").await;
                }
                break;
            }
        }
    }
    let _ = stream.shutdown().await;
    info!(session = id, peer = %peer, "inbound session closed");
}

async fn close<S: AsyncWrite + Unpin>(stream: &mut S, reason: &str) {
    let _ = write_frame(
        stream,
        &PeerFrame::Close {
            reason: reason.to_string(),
        },
    )
    .await;
}
