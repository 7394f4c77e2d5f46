//! Inner side of the split deployment.
//!
//! The inner process owns the broker connection and the lease. It keeps a
//! single tunnel open to the outer process, mirrors the desired bridge
//! state onto it and runs outbound links through it. Every new tunnel
//! session starts with a full snapshot; later changes go across as diffs.

use async_trait::async_trait;
use relay_core::{
    BridgeEntry, Envelope, HostPort, RelayError, RelayResult, TunnelControl, TunnelData,
};
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::mux::{TunnelMux, TunnelSender};
use super::frame_limit;
use crate::activation::{ActivationAware, FaultReporter};
use crate::backoff::Backoff;
use crate::broker::Broker;
use crate::config::{LinkSettings, TunnelConfig};
use crate::connector::{LinkConnector, PeerConnection, SendOutcome};
use crate::control::DesiredSnapshot;
use crate::lock;
use crate::tls::PeerTls;

/// Extra time granted to the outer side beyond its own drain timeout.
const DEACTIVATE_GRACE: Duration = Duration::from_secs(5);

type ConnectReply = oneshot::Sender<Result<(), String>>;
type AckReply = oneshot::Sender<RelayResult<SendOutcome>>;

struct InnerShared {
    address: String,
    server_name: ServerName<'static>,
    tls: Arc<ClientConfig>,
    material: PeerTls,
    broker: Arc<dyn Broker>,
    link: LinkSettings,
    drain_timeout: Duration,
    session_tx: watch::Sender<Option<TunnelSender>>,
    active_tx: watch::Sender<bool>,
    pending_connects: StdMutex<HashMap<u64, ConnectReply>>,
    pending_acks: StdMutex<HashMap<(u64, u64), AckReply>>,
    deactivated: StdMutex<Vec<oneshot::Sender<()>>>,
    faults: OnceLock<FaultReporter>,
    next_link_id: AtomicU64,
}

struct Running {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Tunnel client run by the inner process.
pub struct TunnelInner {
    shared: Arc<InnerShared>,
    running: Mutex<Option<Running>>,
}

impl TunnelInner {
    pub fn new(
        tunnel: &TunnelConfig,
        tls: Arc<ClientConfig>,
        material: PeerTls,
        broker: Arc<dyn Broker>,
        link: LinkSettings,
        drain_timeout: Duration,
    ) -> RelayResult<Self> {
        let server_name = ServerName::try_from(tunnel.server_name.clone())
            .map_err(|e| RelayError::Config(format!("invalid tunnel server name: {e}")))?;
        let (session_tx, _) = watch::channel(None);
        let (active_tx, _) = watch::channel(false);
        Ok(Self {
            shared: Arc::new(InnerShared {
                address: tunnel.address.clone(),
                server_name,
                tls,
                material,
                broker,
                link,
                drain_timeout,
                session_tx,
                active_tx,
                pending_connects: StdMutex::new(HashMap::new()),
                pending_acks: StdMutex::new(HashMap::new()),
                deactivated: StdMutex::new(Vec::new()),
                faults: OnceLock::new(),
                next_link_id: AtomicU64::new(1),
            }),
            running: Mutex::new(None),
        })
    }

    /// Link connector that opens links on the outer side.
    pub fn connector(&self) -> Arc<TunnelConnector> {
        Arc::new(TunnelConnector {
            shared: self.shared.clone(),
        })
    }

    /// Step down through `reporter` when the outer side cannot serve.
    pub fn report_faults_to(&self, reporter: FaultReporter) {
        if self.shared.faults.set(reporter).is_err() {
            debug!("tunnel fault reporter already set");
        }
    }

    /// Start the connect loop, mirroring `desired` onto every session.
    pub async fn start(&self, desired: watch::Receiver<DesiredSnapshot>) {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return;
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(connect_loop(self.shared.clone(), desired, stop_rx));
        *running = Some(Running { stop_tx, task });
    }

    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        let _ = running.stop_tx.send(true);
        let _ = running.task.await;
        info!("tunnel client stopped");
    }

    pub fn is_connected(&self) -> bool {
        self.shared.session_tx.borrow().is_some()
    }

    pub async fn wait_connected(&self) {
        let mut rx = self.shared.session_tx.subscribe();
        let _ = rx.wait_for(Option::is_some).await;
    }
}

#[async_trait]
impl ActivationAware for TunnelInner {
    fn name(&self) -> &str {
        "tunnel-inner"
    }

    async fn activate(&self) -> RelayResult<()> {
        self.shared.active_tx.send_replace(true);
        Ok(())
    }

    /// Returns once the outer side confirms its listener has stopped, the
    /// tunnel is gone, or the confirmation deadline passes.
    async fn deactivate(&self) {
        let waiter = if self.is_connected() {
            let (tx, rx) = oneshot::channel();
            lock(&self.shared.deactivated).push(tx);
            Some(rx)
        } else {
            None
        };
        self.shared.active_tx.send_replace(false);

        if let Some(rx) = waiter {
            match timeout(self.shared.drain_timeout + DEACTIVATE_GRACE, rx).await {
                Ok(Ok(())) => debug!("outer listener stopped"),
                Ok(Err(_)) => debug!("tunnel closed during deactivation"),
                Err(_) => warn!("outer did not confirm deactivation"),
            }
        }
    }
}

async fn connect_loop(
    shared: Arc<InnerShared>,
    mut desired: watch::Receiver<DesiredSnapshot>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::new(shared.link.backoff.clone());
    loop {
        let attempt = tokio::select! {
            result = shared.dial() => result,
            _ = crate::stopped(&mut stop_rx) => break,
        };
        match attempt {
            Ok(stream) => {
                info!(address = %shared.address, "tunnel connected");
                backoff.reset();
                shared.run_session(stream, &mut desired, &mut stop_rx).await;
                if *stop_rx.borrow() {
                    break;
                }
                warn!(address = %shared.address, "tunnel lost");
            }
            Err(e) => {
                warn!(
                    address = %shared.address,
                    attempt = backoff.attempts() + 1,
                    error = %e,
                    "tunnel connect failed"
                );
            }
        }

        let delay = backoff.next_delay();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = crate::stopped(&mut stop_rx) => break,
        }
    }
}

impl InnerShared {
    async fn dial(&self) -> RelayResult<tokio_rustls::client::TlsStream<TcpStream>> {
        let tcp = timeout(self.link.connect_timeout, TcpStream::connect(self.address.as_str()))
            .await
            .map_err(|_| RelayError::Timeout(format!("connect {}", self.address)))?
            .map_err(|e| RelayError::Transport(format!("connect {}: {e}", self.address)))?;
        let _ = tcp.set_nodelay(true);

        let handshake = tokio_rustls::TlsConnector::from(self.tls.clone()).connect(self.server_name.clone(), tcp);
        timeout(self.link.connect_timeout, handshake)
            .await
            .map_err(|_| RelayError::Timeout("tunnel handshake".into()))?
            .map_err(|e| RelayError::Tls(format!("tunnel handshake: {e}")))
    }

    async fn run_session<S>(
        self: &Arc<Self>,
        stream: S,
        desired: &mut watch::Receiver<DesiredSnapshot>,
        stop_rx: &mut watch::Receiver<bool>,
    ) where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mux, mut rx) = TunnelMux::new(stream, frame_limit(self.link.max_message_size));
        let sender = mux.sender();

        let mut sent = desired.borrow_and_update().clone();
        if sender.send_control(snapshot_message(&sent)).await.is_err() {
            return;
        }
        debug!(entries = sent.entries.len(), "sent bridge snapshot to outer");

        let mut active_rx = self.active_tx.subscribe();
        let active = *active_rx.borrow_and_update();
        if active && sender.send_control(self.activate_message()).await.is_err() {
            return;
        }

        // Links may connect from here on; their requests queue behind the
        // snapshot and the activation.
        self.session_tx.send_replace(Some(sender.clone()));

        loop {
            tokio::select! {
                _ = mux.closed() => break,
                _ = crate::stopped(stop_rx) => break,
                Ok(()) = desired.changed() => {
                    let next = desired.borrow_and_update().clone();
                    if forward_changes(&sender, &sent, &next).await.is_err() {
                        break;
                    }
                    sent = next;
                }
                Ok(()) = active_rx.changed() => {
                    let msg = if *active_rx.borrow_and_update() {
                        self.activate_message()
                    } else {
                        TunnelControl::Deactivate
                    };
                    let _ = sender.send_control(msg).await;
                }
                Some(msg) = rx.control.recv() => self.on_control(msg),
                Some(msg) = rx.data.recv() => self.on_data(msg, &sender),
            }
        }

        self.session_tx.send_replace(None);
        self.fail_pending();
    }

    fn activate_message(&self) -> TunnelControl {
        TunnelControl::Activate {
            identities: self.material.identities.clone(),
            trust_roots_pem: self.material.trust_roots_pem.clone(),
            enable_sni: self.material.enable_sni,
        }
    }

    fn on_control(&self, msg: TunnelControl) {
        match msg {
            TunnelControl::ConnectResult { link_id, error } => {
                if let Some(reply) = lock(&self.pending_connects).remove(&link_id) {
                    let _ = reply.send(error.map_or(Ok(()), Err));
                }
            }
            TunnelControl::LinkClosed { link_id, reason } => {
                debug!(link_id, reason = %reason, "outer closed link");
                self.fail_link(link_id, &reason);
            }
            TunnelControl::Deactivated => {
                for waiter in lock(&self.deactivated).drain(..) {
                    let _ = waiter.send(());
                }
            }
            TunnelControl::ActivateFailed { reason } => {
                if !*self.active_tx.borrow() {
                    debug!(reason = %reason, "stale activation failure from outer");
                    return;
                }
                warn!(reason = %reason, "outer could not activate");
                if let Some(faults) = self.faults.get() {
                    faults.report(format!("outer activation failed: {reason}"));
                }
            }
            other => warn!(message = ?other, "unexpected control message from outer"),
        }
    }

    fn on_data(&self, msg: TunnelData, sender: &TunnelSender) {
        match msg {
            TunnelData::OutboundAck { link_id, seq, rejected } => {
                if let Some(reply) = lock(&self.pending_acks).remove(&(link_id, seq)) {
                    let outcome = match rejected {
                        None => SendOutcome::Accepted,
                        Some(reason) => SendOutcome::Rejected(reason),
                    };
                    let _ = reply.send(Ok(outcome));
                }
            }
            TunnelData::Inbound {
                request_id,
                inbox,
                envelope,
            } => {
                let broker = self.broker.clone();
                let sender = sender.clone();
                tokio::spawn(async move {
                    let (error, transient) = match broker.publish(&inbox, envelope).await {
                        Ok(()) => (None, false),
                        Err(e) => {
                            warn!(inbox = %inbox, error = %e, "inbound publish failed");
                            (Some(e.to_string()), e.is_transient())
                        }
                    };
                    let ack = TunnelData::InboundAck {
                        request_id,
                        error,
                        transient,
                    };
                    let _ = sender.send_data(ack).await;
                });
            }
            other => warn!(message = ?other, "unexpected data message from outer"),
        }
    }

    fn fail_link(&self, link_id: u64, reason: &str) {
        let mut acks = lock(&self.pending_acks);
        let keys: Vec<_> = acks.keys().filter(|(id, _)| *id == link_id).copied().collect();
        for key in keys {
            if let Some(reply) = acks.remove(&key) {
                let _ = reply.send(Err(RelayError::Transport(reason.to_string())));
            }
        }
    }

    fn fail_pending(&self) {
        for (_, reply) in lock(&self.pending_connects).drain() {
            let _ = reply.send(Err("tunnel lost".into()));
        }
        for (_, reply) in lock(&self.pending_acks).drain() {
            let _ = reply.send(Err(RelayError::Closed));
        }
        lock(&self.deactivated).clear();
    }
}

fn snapshot_message(snapshot: &DesiredSnapshot) -> TunnelControl {
    TunnelControl::Snapshot {
        inboxes: snapshot.inboxes.clone(),
        entries: snapshot.entries.values().cloned().collect(),
    }
}

/// Send whatever turns `sent` into `next`. A change of inboxes resends
/// the whole snapshot.
async fn forward_changes(sender: &TunnelSender, sent: &DesiredSnapshot, next: &DesiredSnapshot) -> RelayResult<()> {
    if sent.inboxes != next.inboxes {
        return sender.send_control(snapshot_message(next)).await;
    }
    for queue_name in sent.entries.keys().filter(|q| !next.entries.contains_key(*q)) {
        sender
            .send_control(TunnelControl::Remove {
                queue_name: queue_name.clone(),
            })
            .await?;
    }
    for (queue_name, entry) in &next.entries {
        if sent.entries.get(queue_name) != Some(entry) {
            sender
                .send_control(TunnelControl::Add { entry: entry.clone() })
                .await?;
        }
    }
    Ok(())
}

// ── Links through the tunnel ──────────────────────────────────────────

/// Opens links on the outer side. Ready only while the tunnel is up.
pub struct TunnelConnector {
    shared: Arc<InnerShared>,
}

#[async_trait]
impl LinkConnector for TunnelConnector {
    fn is_ready(&self) -> bool {
        self.shared.session_tx.borrow().is_some()
    }

    async fn wait_ready(&self) {
        let mut rx = self.shared.session_tx.subscribe();
        let _ = rx.wait_for(Option::is_some).await;
    }

    async fn connect(&self, target: &HostPort, entry: &BridgeEntry) -> RelayResult<Box<dyn PeerConnection>> {
        let sender = self
            .shared
            .session_tx
            .borrow()
            .clone()
            .ok_or_else(|| RelayError::Transport("tunnel is down".into()))?;
        let link_id = self.shared.next_link_id.fetch_add(1, Ordering::Relaxed);

        let (tx, rx) = oneshot::channel();
        lock(&self.shared.pending_connects).insert(link_id, tx);
        let mut guard = PendingConnect {
            shared: &self.shared,
            sender: &sender,
            link_id,
            armed: true,
        };

        sender
            .send_control(TunnelControl::Connect {
                link_id,
                queue_name: entry.queue_name.clone(),
                target: target.clone(),
            })
            .await?;
        let result = rx.await;
        guard.armed = false;
        drop(guard);

        match result {
            Ok(Ok(())) => Ok(Box::new(TunnelLink {
                link_id,
                next_seq: 0,
                sender,
                shared: self.shared.clone(),
                closed: false,
            })),
            Ok(Err(reason)) => Err(RelayError::Transport(reason)),
            Err(_) => Err(RelayError::Closed),
        }
    }
}

/// Cleans up a connect request abandoned before the outer side answered.
struct PendingConnect<'a> {
    shared: &'a InnerShared,
    sender: &'a TunnelSender,
    link_id: u64,
    armed: bool,
}

impl Drop for PendingConnect<'_> {
    fn drop(&mut self) {
        if self.armed {
            lock(&self.shared.pending_connects).remove(&self.link_id);
            self.sender
                .try_send_control(TunnelControl::CloseLink { link_id: self.link_id });
        }
    }
}

/// One outbound link running on the outer side.
struct TunnelLink {
    link_id: u64,
    next_seq: u64,
    sender: TunnelSender,
    shared: Arc<InnerShared>,
    closed: bool,
}

#[async_trait]
impl PeerConnection for TunnelLink {
    async fn send(&mut self, envelope: &Envelope) -> RelayResult<SendOutcome> {
        self.next_seq += 1;
        let seq = self.next_seq;
        let (tx, rx) = oneshot::channel();
        lock(&self.shared.pending_acks).insert((self.link_id, seq), tx);

        let msg = TunnelData::Outbound {
            link_id: self.link_id,
            seq,
            envelope: envelope.clone(),
        };
        if let Err(e) = self.sender.send_data(msg).await {
            lock(&self.shared.pending_acks).remove(&(self.link_id, seq));
            return Err(e);
        }
        rx.await.map_err(|_| RelayError::Closed)?
    }

    async fn close(&mut self) {
        self.closed = true;
        self.shared.fail_link(self.link_id, "link closing");
        let _ = self
            .sender
            .send_control(TunnelControl::CloseLink { link_id: self.link_id })
            .await;
    }
}

impl Drop for TunnelLink {
    fn drop(&mut self) {
        if !self.closed {
            self.shared.fail_link(self.link_id, "link dropped");
            self.sender
                .try_send_control(TunnelControl::CloseLink { link_id: self.link_id });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::{ActivationCoordinator, ActiveState};
    use crate::broker::InMemoryBroker;
    use crate::config::ActivationSettings;
    use crate::link::tests::test_settings;
    use std::collections::BTreeMap;

    fn entry(queue: &str) -> BridgeEntry {
        BridgeEntry::new(queue, vec![HostPort::new("peer.example", 10002)], ["O=Peer".to_string()])
    }

    fn snapshot(queues: &[&str]) -> DesiredSnapshot {
        DesiredSnapshot {
            inboxes: vec!["p2p.inbound.local".into()],
            entries: queues
                .iter()
                .map(|q| (q.to_string(), entry(q)))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    #[tokio::test]
    async fn diffs_cover_adds_removes_and_changes() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (left, _left_rx) = TunnelMux::new(a, 1 << 20);
        let (_right, mut right_rx) = TunnelMux::new(b, 1 << 20);

        let sent = snapshot(&["internal.peers.a", "internal.peers.b"]);
        let mut next = snapshot(&["internal.peers.b", "internal.peers.c"]);
        next.entries
            .get_mut("internal.peers.b")
            .unwrap()
            .targets
            .push(HostPort::new("backup.example", 10002));

        forward_changes(&left.sender(), &sent, &next).await.unwrap();

        let mut removed = Vec::new();
        let mut added = Vec::new();
        for _ in 0..3 {
            match right_rx.control.recv().await.unwrap() {
                TunnelControl::Remove { queue_name } => removed.push(queue_name),
                TunnelControl::Add { entry } => added.push(entry.queue_name),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(removed, vec!["internal.peers.a".to_string()]);
        assert_eq!(
            added,
            vec!["internal.peers.b".to_string(), "internal.peers.c".to_string()]
        );
    }

    #[tokio::test]
    async fn inbox_change_resends_the_snapshot() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (left, _left_rx) = TunnelMux::new(a, 1 << 20);
        let (_right, mut right_rx) = TunnelMux::new(b, 1 << 20);

        let sent = snapshot(&["internal.peers.a"]);
        let mut next = sent.clone();
        next.inboxes.push("p2p.inbound.other".into());

        forward_changes(&left.sender(), &sent, &next).await.unwrap();
        match right_rx.control.recv().await.unwrap() {
            TunnelControl::Snapshot { inboxes, entries } => {
                assert_eq!(inboxes.len(), 2);
                assert_eq!(entries.len(), 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    fn test_inner() -> TunnelInner {
        let tunnel = TunnelConfig {
            address: "127.0.0.1:1".into(),
            cert_path: "unused".into(),
            key_path: "unused".into(),
            trust_path: "unused".into(),
            server_name: "float.relay.internal".into(),
        };
        let ca = crate::tls::test_pki::TestCa::new();
        let id = ca.identity("O=Bank A, L=London, C=GB", "p2p.inbound.a", &[]);
        let material = PeerTls {
            identities: vec![id.clone()],
            trust_roots_pem: ca.pem(),
            enable_sni: true,
        };
        let client = material.client_config().unwrap();
        TunnelInner::new(
            &tunnel,
            client,
            material,
            Arc::new(InMemoryBroker::new()),
            test_settings(),
            Duration::from_secs(1),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn connector_is_not_ready_without_a_tunnel() {
        let inner = test_inner();
        let connector = inner.connector();
        assert!(!connector.is_ready());
        let err = connector
            .connect(&HostPort::new("peer.example", 10002), &entry("internal.peers.a"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RelayError::Transport(_)));
    }

    #[tokio::test]
    async fn session_opens_with_snapshot_then_activation() {
        let inner = test_inner();
        inner.activate().await.unwrap();
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (_outer, mut outer_rx) = TunnelMux::new(b, 1 << 20);
        let (_desired_tx, mut desired) = watch::channel(snapshot(&["internal.peers.a"]));
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let shared = inner.shared.clone();
        let session = tokio::spawn(async move { shared.run_session(a, &mut desired, &mut stop_rx).await });

        let connector = inner.connector();
        connector.wait_ready().await;
        let connect = tokio::spawn(async move {
            connector
                .connect(&HostPort::new("peer.example", 10002), &entry("internal.peers.a"))
                .await
                .map(|_| ())
        });

        // A link never reaches the outer side ahead of the activation.
        assert!(matches!(outer_rx.control.recv().await.unwrap(), TunnelControl::Snapshot { .. }));
        assert!(matches!(outer_rx.control.recv().await.unwrap(), TunnelControl::Activate { .. }));
        assert!(matches!(outer_rx.control.recv().await.unwrap(), TunnelControl::Connect { .. }));

        stop_tx.send_replace(true);
        session.await.unwrap();
        assert!(connect.await.unwrap().is_err());
        assert!(!inner.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_outer_activation_reports_a_fault() {
        let inner = test_inner();
        let coord = ActivationCoordinator::local(ActivationSettings::new("relay", "a"));
        inner.report_faults_to(coord.fault_reporter());
        coord.become_state(ActiveState::Active);
        coord.wait_for(ActiveState::Active).await;

        // Left over from an earlier activation.
        inner.shared.on_control(TunnelControl::ActivateFailed { reason: "stale".into() });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(coord.is_active());

        inner.activate().await.unwrap();
        inner.shared.on_control(TunnelControl::ActivateFailed {
            reason: "bad trust roots".into(),
        });
        timeout(Duration::from_secs(1), coord.wait_for(ActiveState::Passive))
            .await
            .unwrap();
        coord.stop().await;
    }
}
