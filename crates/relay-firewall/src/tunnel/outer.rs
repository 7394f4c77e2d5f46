//! Outer side of the split deployment.
//!
//! The outer process holds no broker connection and no lease. It serves
//! exactly one inner peer over the tunnel, follows its activation, runs
//! the public listener on its behalf and dials outbound links when asked.
//! Routing state is whatever the inner peer last sent: each session's
//! first snapshot replaces it wholesale.

use async_trait::async_trait;
use relay_core::{BridgeEntry, Envelope, HostPort, IdentityMaterial, RelayError, RelayResult, TunnelControl, TunnelData};
use rustls::ServerConfig;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use super::mux::{TunnelMux, TunnelSender};
use super::frame_limit;
use crate::activation::{ActivationCoordinator, ActiveState};
use crate::backoff::{Backoff, BackoffPolicy};
use crate::config::{ActivationSettings, LinkSettings};
use crate::connector::{LinkConnector, PeerConnection, SendOutcome, TlsConnector};
use crate::inbox::{InboxRegistry, LocalIdentity};
use crate::listener::{pause_after_accept_error, InboundListener, InboundSession, InboundSink, ListenerSettings};
use crate::lock;
use crate::tls::PeerTls;

/// Counters describing what the inner peer has sent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TunnelStats {
    pub sessions: u64,
    pub snapshots: u64,
    pub diffs: u64,
}

#[derive(Debug, Default)]
struct Routing {
    inboxes: Vec<String>,
    entries: BTreeMap<String, BridgeEntry>,
}

type LinkMap = HashMap<u64, mpsc::Sender<(u64, Envelope)>>;

/// Outbound side of the public half. `epoch` counts activation changes so
/// a slow deactivation never undoes a newer activation.
#[derive(Default)]
struct PublicSide {
    epoch: u64,
    connector: Option<Arc<dyn LinkConnector>>,
}

type InboundReply = oneshot::Sender<RelayResult<()>>;

/// Inbound deliveries waiting for the inner side's broker.
struct InboundRelay {
    session_tx: watch::Sender<Option<TunnelSender>>,
    pending: StdMutex<HashMap<u64, InboundReply>>,
    next_request_id: AtomicU64,
    ack_timeout: Duration,
}

impl InboundRelay {
    fn complete(&self, request_id: u64, error: Option<String>, transient: bool) {
        let Some(reply) = lock(&self.pending).remove(&request_id) else {
            return;
        };
        let outcome = match error {
            None => Ok(()),
            Some(e) if transient => Err(RelayError::Broker(e)),
            Some(e) => Err(RelayError::Rejected(e)),
        };
        let _ = reply.send(outcome);
    }

    fn fail_all(&self) {
        for (_, reply) in lock(&self.pending).drain() {
            let _ = reply.send(Err(RelayError::Closed));
        }
    }
}

/// Listener sink that hands envelopes to the inner side.
struct TunnelSink {
    relay: Arc<InboundRelay>,
    registry: Arc<InboxRegistry>,
}

#[async_trait]
impl InboundSink for TunnelSink {
    async fn has_inbox(&self, inbox: &str) -> bool {
        self.registry.has_inbox(inbox)
    }

    async fn deliver(&self, session: &InboundSession, envelope: Envelope) -> RelayResult<()> {
        let sender = self
            .relay
            .session_tx
            .borrow()
            .clone()
            .ok_or_else(|| RelayError::Transport("tunnel to inner is down".into()))?;
        let request_id = self.relay.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.relay.pending).insert(request_id, tx);

        let msg = TunnelData::Inbound {
            request_id,
            inbox: session.inbox.clone(),
            envelope,
        };
        if let Err(e) = sender.send_data(msg).await {
            lock(&self.relay.pending).remove(&request_id);
            return Err(e);
        }
        match timeout(self.relay.ack_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(RelayError::Closed),
            Err(_) => {
                lock(&self.relay.pending).remove(&request_id);
                Err(RelayError::Timeout("inner did not acknowledge delivery".into()))
            }
        }
    }
}

struct OuterShared {
    tls: Arc<ServerConfig>,
    link: LinkSettings,
    registry: Arc<InboxRegistry>,
    listener: Arc<InboundListener>,
    coordinator: Arc<ActivationCoordinator>,
    relay: Arc<InboundRelay>,
    routing: StdMutex<Routing>,
    stats: StdMutex<TunnelStats>,
    public: StdMutex<PublicSide>,
    links: Arc<StdMutex<LinkMap>>,
    /// Bumped to end the current session.
    generation: watch::Sender<u64>,
}

struct Running {
    stop_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    local_addr: SocketAddr,
}

/// Tunnel server run by the outer process.
pub struct TunnelServer {
    bind: String,
    shared: Arc<OuterShared>,
    running: Mutex<Option<Running>>,
}

impl TunnelServer {
    pub fn new(
        bind: String,
        tls: Arc<ServerConfig>,
        public_listen: Vec<String>,
        listener_settings: ListenerSettings,
        link: LinkSettings,
        activation: ActivationSettings,
    ) -> Self {
        let registry = Arc::new(InboxRegistry::default());
        let (session_tx, _) = watch::channel(None);
        let relay = Arc::new(InboundRelay {
            session_tx,
            pending: StdMutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
            ack_timeout: link.ack_timeout,
        });
        let sink = Arc::new(TunnelSink {
            relay: relay.clone(),
            registry: registry.clone(),
        });
        let listener = Arc::new(InboundListener::new(
            public_listen,
            registry.clone(),
            sink,
            listener_settings,
        ));
        let coordinator = Arc::new(ActivationCoordinator::local(activation));
        coordinator.add_dependent(listener.clone());
        let (generation, _) = watch::channel(0);

        Self {
            bind,
            shared: Arc::new(OuterShared {
                tls,
                link,
                registry,
                listener,
                coordinator,
                relay,
                routing: StdMutex::new(Routing::default()),
                stats: StdMutex::new(TunnelStats::default()),
                public: StdMutex::new(PublicSide::default()),
                links: Arc::new(StdMutex::new(HashMap::new())),
                generation,
            }),
            running: Mutex::new(None),
        }
    }

    pub fn listener(&self) -> Arc<InboundListener> {
        self.shared.listener.clone()
    }

    pub fn coordinator(&self) -> Arc<ActivationCoordinator> {
        self.shared.coordinator.clone()
    }

    /// Inboxes and identities the public listener serves.
    pub fn registry(&self) -> Arc<InboxRegistry> {
        self.shared.registry.clone()
    }

    /// Bind the tunnel address and start serving inner peers.
    pub async fn start(&self) -> RelayResult<SocketAddr> {
        let mut running = self.running.lock().await;
        if let Some(r) = running.as_ref() {
            return Ok(r.local_addr);
        }
        let listener = TcpListener::bind(self.bind.as_str())
            .await
            .map_err(|e| RelayError::Transport(format!("bind tunnel {}: {e}", self.bind)))?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "tunnel server listening");

        let (stop_tx, stop_rx) = watch::channel(false);
        let (stream_tx, stream_rx) = mpsc::channel(1);
        let accept = tokio::spawn(accept_loop(
            listener,
            TlsAcceptor::from(self.shared.tls.clone()),
            self.shared.clone(),
            stream_tx,
            stop_rx.clone(),
        ));
        let sessions = tokio::spawn(session_loop(self.shared.clone(), stream_rx, stop_rx));
        *running = Some(Running {
            stop_tx,
            tasks: vec![accept, sessions],
            local_addr,
        });
        Ok(local_addr)
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.local_addr)
    }

    /// Stop serving. The public side goes passive with the session.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        let _ = running.stop_tx.send(true);
        self.kick();
        for task in running.tasks {
            let _ = task.await;
        }
        info!("tunnel server stopped");
    }

    /// End the current inner session; the inner side reconnects.
    pub fn kick(&self) {
        self.shared.generation.send_modify(|g| *g += 1);
    }

    pub fn is_connected(&self) -> bool {
        self.shared.relay.session_tx.borrow().is_some()
    }

    pub fn stats(&self) -> TunnelStats {
        *lock(&self.shared.stats)
    }

    /// Bridge entries as last sent by the inner peer, ordered by queue.
    pub fn routing_entries(&self) -> Vec<BridgeEntry> {
        lock(&self.shared.routing).entries.values().cloned().collect()
    }

    pub fn routing_inboxes(&self) -> Vec<String> {
        lock(&self.shared.routing).inboxes.clone()
    }
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    shared: Arc<OuterShared>,
    stream_tx: mpsc::Sender<tokio_rustls::server::TlsStream<tokio::net::TcpStream>>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::new(BackoffPolicy::accept_errors());
    loop {
        let (tcp, peer_addr) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "tunnel accept failed");
                    if !pause_after_accept_error(&mut backoff, &mut stop_rx).await {
                        break;
                    }
                    continue;
                }
            },
            _ = crate::stopped(&mut stop_rx) => break,
        };
        backoff.reset();
        let _ = tcp.set_nodelay(true);

        let handshake = timeout(shared.link.connect_timeout, acceptor.accept(tcp)).await;
        let stream = match handshake {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!(peer = %peer_addr, error = %e, "tunnel handshake failed");
                continue;
            }
            Err(_) => {
                warn!(peer = %peer_addr, "tunnel handshake timed out");
                continue;
            }
        };

        // A new authenticated inner supersedes whatever session is open.
        if shared.relay.session_tx.borrow().is_some() {
            info!(peer = %peer_addr, "new inner connection replaces current session");
            shared.generation.send_modify(|g| *g += 1);
        }
        if stream_tx.send(stream).await.is_err() {
            break;
        }
    }
}

async fn session_loop(
    shared: Arc<OuterShared>,
    mut stream_rx: mpsc::Receiver<tokio_rustls::server::TlsStream<tokio::net::TcpStream>>,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        let stream = tokio::select! {
            Some(stream) = stream_rx.recv() => stream,
            _ = crate::stopped(&mut stop_rx) => break,
            else => break,
        };
        shared.run_session(stream).await;
    }
}

impl OuterShared {
    async fn run_session(self: &Arc<Self>, stream: tokio_rustls::server::TlsStream<tokio::net::TcpStream>) {
        let mut generation = self.generation.subscribe();
        generation.borrow_and_update();

        let (mux, mut rx) = TunnelMux::new(stream, frame_limit(self.link.max_message_size));
        let sender = mux.sender();
        lock(&self.stats).sessions += 1;
        self.relay.session_tx.send_replace(Some(sender.clone()));
        info!("inner connected");

        loop {
            tokio::select! {
                _ = mux.closed() => break,
                Ok(()) = generation.changed() => {
                    info!("tunnel session ended locally");
                    break;
                }
                Some(msg) = rx.control.recv() => self.on_control(msg, &sender).await,
                Some(msg) = rx.data.recv() => self.on_data(msg, &sender).await,
            }
        }
        drop(mux);

        self.relay.session_tx.send_replace(None);
        self.relay.fail_all();
        self.begin_transition();
        self.coordinator.become_state(ActiveState::Passive);
        self.coordinator.wait_for(ActiveState::Passive).await;
        self.close_links(None);
        *lock(&self.routing) = Routing::default();
        self.registry.set_inboxes(Vec::new());
        warn!("inner disconnected, public traffic suspended");
    }

    async fn on_control(self: &Arc<Self>, msg: TunnelControl, sender: &TunnelSender) {
        match msg {
            TunnelControl::Activate {
                identities,
                trust_roots_pem,
                enable_sni,
            } => {
                self.begin_transition();
                if let Err(e) = self.activate(identities, trust_roots_pem, enable_sni).await {
                    error!(error = %e, "cannot activate with identities from inner");
                    let _ = sender
                        .send_control(TunnelControl::ActivateFailed { reason: e.to_string() })
                        .await;
                }
            }
            TunnelControl::Deactivate => {
                let epoch = self.begin_transition();
                // Queued ahead of any later activation.
                self.coordinator.become_state(ActiveState::Passive);
                // The listener drains in-flight deliveries, which need this
                // session loop to keep reading acks.
                let shared = self.clone();
                let sender = sender.clone();
                tokio::spawn(async move {
                    let mut states = shared.coordinator.subscribe();
                    while let Some(transition) = states.recv().await {
                        if transition.state == ActiveState::Passive || shared.epoch() != epoch {
                            break;
                        }
                    }
                    if shared.close_links(Some(epoch)) {
                        let _ = sender.send_control(TunnelControl::Deactivated).await;
                    } else {
                        debug!("deactivation superseded by a later activation");
                    }
                });
            }
            TunnelControl::Snapshot { inboxes, entries } => {
                let entries: BTreeMap<_, _> = entries
                    .into_iter()
                    .map(|e| (e.queue_name.clone(), e))
                    .collect();
                info!(entries = entries.len(), inboxes = inboxes.len(), "routing replaced from snapshot");
                self.registry.set_inboxes(inboxes.iter().cloned());
                *lock(&self.routing) = Routing { inboxes, entries };
                lock(&self.stats).snapshots += 1;
            }
            TunnelControl::Add { entry } => {
                debug!(queue = %entry.queue_name, "routing entry added");
                lock(&self.routing).entries.insert(entry.queue_name.clone(), entry);
                lock(&self.stats).diffs += 1;
            }
            TunnelControl::Remove { queue_name } => {
                debug!(queue = %queue_name, "routing entry removed");
                lock(&self.routing).entries.remove(&queue_name);
                lock(&self.stats).diffs += 1;
            }
            TunnelControl::Connect {
                link_id,
                queue_name,
                target,
            } => self.open_link(link_id, queue_name, target, sender).await,
            TunnelControl::CloseLink { link_id } => {
                lock(&self.links).remove(&link_id);
            }
            other => warn!(message = ?other, "unexpected control message from inner"),
        }
    }

    async fn activate(
        &self,
        identities: Vec<IdentityMaterial>,
        trust_roots_pem: Vec<u8>,
        enable_sni: bool,
    ) -> RelayResult<()> {
        let peer = PeerTls {
            identities,
            trust_roots_pem,
            enable_sni,
        };
        let server = peer.server_config()?;
        let client = peer.client_config()?;
        self.listener.set_tls(server).await;
        self.registry
            .set_identities(peer.identities.iter().map(LocalIdentity::from).collect());
        lock(&self.public).connector = Some(Arc::new(TlsConnector::new(client)));
        info!(identities = peer.identities.len(), "activating public side");
        self.coordinator.become_state(ActiveState::Active);
        Ok(())
    }

    /// Start a new activation epoch and return it.
    fn begin_transition(&self) -> u64 {
        let mut public = lock(&self.public);
        public.epoch += 1;
        public.epoch
    }

    fn epoch(&self) -> u64 {
        lock(&self.public).epoch
    }

    async fn open_link(&self, link_id: u64, queue_name: String, target: HostPort, sender: &TunnelSender) {
        let entry = lock(&self.routing).entries.get(&queue_name).cloned();
        let connector = lock(&self.public).connector.clone();
        let checked = match (entry, connector) {
            (None, _) => Err(format!("no routing entry for {queue_name}")),
            (Some(entry), _) if !entry.targets.contains(&target) => {
                Err(format!("{target} is not a target of {queue_name}"))
            }
            (_, None) => Err("public side is not active".to_string()),
            (Some(entry), Some(connector)) => Ok((entry, connector)),
        };
        let (entry, connector) = match checked {
            Ok(found) => found,
            Err(reason) => {
                warn!(link_id, queue = %queue_name, reason = %reason, "refusing link");
                let _ = sender
                    .send_control(TunnelControl::ConnectResult {
                        link_id,
                        error: Some(reason),
                    })
                    .await;
                return;
            }
        };

        let sender = sender.clone();
        let links = self.links.clone();
        let link = self.link.clone();
        tokio::spawn(async move {
            let conn = match timeout(link.connect_timeout, connector.connect(&target, &entry)).await {
                Ok(Ok(conn)) => conn,
                Ok(Err(e)) => {
                    debug!(link_id, target = %target, error = %e, "outer link connect failed");
                    let _ = sender
                        .send_control(TunnelControl::ConnectResult {
                            link_id,
                            error: Some(e.to_string()),
                        })
                        .await;
                    return;
                }
                Err(_) => {
                    let _ = sender
                        .send_control(TunnelControl::ConnectResult {
                            link_id,
                            error: Some(format!("connect {target} timed out")),
                        })
                        .await;
                    return;
                }
            };

            let (tx, rx) = mpsc::channel(16);
            lock(&links).insert(link_id, tx.clone());
            let _ = sender
                .send_control(TunnelControl::ConnectResult { link_id, error: None })
                .await;
            info!(link_id, queue = %entry.queue_name, target = %target, "outer link connected");

            run_outer_link(link_id, conn, rx, &sender, link.ack_timeout).await;

            let mut links = lock(&links);
            if links.get(&link_id).is_some_and(|current| current.same_channel(&tx)) {
                links.remove(&link_id);
            }
        });
    }

    async fn on_data(&self, msg: TunnelData, sender: &TunnelSender) {
        match msg {
            TunnelData::Outbound {
                link_id,
                seq,
                envelope,
            } => {
                let link = lock(&self.links).get(&link_id).cloned();
                let delivered = match link {
                    Some(tx) => tx.send((seq, envelope)).await.is_ok(),
                    None => false,
                };
                if !delivered {
                    let _ = sender
                        .send_control(TunnelControl::LinkClosed {
                            link_id,
                            reason: "unknown link".into(),
                        })
                        .await;
                }
            }
            TunnelData::InboundAck {
                request_id,
                error,
                transient,
            } => self.relay.complete(request_id, error, transient),
            other => warn!(message = ?other, "unexpected data message from inner"),
        }
    }

    /// Drop the connector and every outer link, unless `epoch` is given
    /// and a newer transition has begun. Returns whether anything was reset.
    fn close_links(&self, epoch: Option<u64>) -> bool {
        let mut public = lock(&self.public);
        if epoch.is_some_and(|e| e != public.epoch) {
            return false;
        }
        public.connector = None;
        let closed = std::mem::take(&mut *lock(&self.links));
        if !closed.is_empty() {
            info!(links = closed.len(), "closing outer links");
        }
        true
    }
}

/// Carry one link's envelopes to the peer, one at a time.
async fn run_outer_link(
    link_id: u64,
    mut conn: Box<dyn PeerConnection>,
    mut rx: mpsc::Receiver<(u64, Envelope)>,
    sender: &TunnelSender,
    ack_timeout: Duration,
) {
    while let Some((seq, envelope)) = rx.recv().await {
        let failure = match timeout(ack_timeout, conn.send(&envelope)).await {
            Ok(Ok(outcome)) => {
                let rejected = match outcome {
                    SendOutcome::Accepted => None,
                    SendOutcome::Rejected(reason) => Some(reason),
                };
                let ack = TunnelData::OutboundAck { link_id, seq, rejected };
                if sender.send_data(ack).await.is_err() {
                    break;
                }
                continue;
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => "acknowledgement timed out".to_string(),
        };
        warn!(link_id, reason = %failure, "outer link failed");
        let _ = sender
            .send_control(TunnelControl::LinkClosed {
                link_id,
                reason: failure,
            })
            .await;
        break;
    }
    conn.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::tests::test_settings;
    use crate::tls::{self, test_pki::TestCa};
    use crate::tunnel::TunnelReceivers;

    struct Harness {
        ca: TestCa,
        server: TunnelServer,
        sender: TunnelSender,
        inner_rx: TunnelReceivers,
        _mux: TunnelMux,
        _inner: TunnelMux,
        _rx: TunnelReceivers,
    }

    /// A server whose control handlers are driven directly, with the
    /// tunnel replaced by an in-memory pipe.
    fn harness() -> Harness {
        let ca = TestCa::new();
        let (cert, key) = ca.issue(&["float.relay.internal"]);
        let server = TunnelServer::new(
            "127.0.0.1:0".into(),
            tls::server_config(&cert, &key, &ca.pem()).unwrap(),
            vec!["127.0.0.1:0".into()],
            ListenerSettings {
                drain_timeout: Duration::from_secs(1),
                ..ListenerSettings::default()
            },
            test_settings(),
            ActivationSettings::new("outer", "outer-test"),
        );
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (mux, rx) = TunnelMux::new(a, 1 << 20);
        let (inner, inner_rx) = TunnelMux::new(b, 1 << 20);
        Harness {
            sender: mux.sender(),
            ca,
            server,
            inner_rx,
            _mux: mux,
            _inner: inner,
            _rx: rx,
        }
    }

    fn activate(ca: &TestCa) -> TunnelControl {
        let mut identity = ca.identity("O=Bank A, L=London, C=GB", "p2p.inbound.bank-a", &[]);
        identity.default = true;
        TunnelControl::Activate {
            identities: vec![identity],
            trust_roots_pem: ca.pem(),
            enable_sni: true,
        }
    }

    fn has_connector(server: &TunnelServer) -> bool {
        lock(&server.shared.public).connector.is_some()
    }

    #[tokio::test]
    async fn deactivation_confirms_and_drops_the_connector() {
        let mut h = harness();
        let shared = h.server.shared.clone();
        shared.on_control(activate(&h.ca), &h.sender).await;
        timeout(Duration::from_secs(10), h.server.coordinator().wait_for(ActiveState::Active))
            .await
            .unwrap();
        assert!(has_connector(&h.server));

        shared.on_control(TunnelControl::Deactivate, &h.sender).await;
        let reply = timeout(Duration::from_secs(10), h.inner_rx.control.recv()).await.unwrap();
        assert!(matches!(reply, Some(TunnelControl::Deactivated)));
        assert_eq!(h.server.coordinator().current_state(), ActiveState::Passive);
        assert!(!has_connector(&h.server));
        assert!(!h.server.listener().is_running().await);
    }

    #[tokio::test]
    async fn activation_right_after_deactivation_stays_active() {
        let h = harness();
        let shared = h.server.shared.clone();
        shared.on_control(activate(&h.ca), &h.sender).await;
        timeout(Duration::from_secs(10), h.server.coordinator().wait_for(ActiveState::Active))
            .await
            .unwrap();

        shared.on_control(TunnelControl::Deactivate, &h.sender).await;
        shared.on_control(activate(&h.ca), &h.sender).await;
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(h.server.coordinator().current_state(), ActiveState::Active);
        assert!(has_connector(&h.server));
        assert!(h.server.listener().is_running().await);
        h.server.coordinator().stop().await;
    }

    #[tokio::test]
    async fn unusable_activation_is_reported_back() {
        let mut h = harness();
        let shared = h.server.shared.clone();
        let unusable = TunnelControl::Activate {
            identities: Vec::new(),
            trust_roots_pem: h.ca.pem(),
            enable_sni: true,
        };
        shared.on_control(unusable, &h.sender).await;

        let reply = timeout(Duration::from_secs(10), h.inner_rx.control.recv()).await.unwrap();
        assert!(matches!(reply, Some(TunnelControl::ActivateFailed { .. })));
        assert_eq!(h.server.coordinator().current_state(), ActiveState::Passive);
        assert!(!has_connector(&h.server));
    }
}
