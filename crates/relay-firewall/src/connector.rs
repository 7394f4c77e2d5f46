//! Outbound connections used by links.
//!
//! A [`LinkConnector`] turns a target address into a [`PeerConnection`]
//! that carries one envelope at a time. Direct mutual TLS, the inner side
//! of the tunnel and the self-addressed loopback path all sit behind it.

use async_trait::async_trait;
use relay_core::codec::DEFAULT_MAX_FRAME_SIZE;
use relay_core::names::{inbox_for_peer_queue, sni_host_for, LOOPBACK_PROPERTY};
use relay_core::{read_frame, write_frame, BridgeEntry, Envelope, HostPort, PeerFrame, RelayError, RelayResult};
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::broker::Broker;
use crate::inbox::InboxRegistry;

/// How the remote end answered one envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Accepted,
    /// The remote end refused the envelope permanently; it is not resent.
    Rejected(String),
}

#[async_trait]
pub trait PeerConnection: Send {
    /// Send one envelope and wait for its answer.
    async fn send(&mut self, envelope: &Envelope) -> RelayResult<SendOutcome>;

    async fn close(&mut self);
}

#[async_trait]
pub trait LinkConnector: Send + Sync {
    /// Whether connections can currently be attempted at all.
    fn is_ready(&self) -> bool {
        true
    }

    /// Suspend until [`is_ready`](Self::is_ready) may be true again.
    async fn wait_ready(&self) {}

    async fn connect(&self, target: &HostPort, entry: &BridgeEntry) -> RelayResult<Box<dyn PeerConnection>>;
}

// ── Peer protocol over any byte stream ────────────────────────────────

/// Client side of the peer protocol.
pub struct FramedPeer<S> {
    stream: S,
    next_seq: u64,
    inbox: String,
}

impl<S> FramedPeer<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Send `Open` and wait for the listener to name the inbox it chose.
    pub async fn open(mut stream: S, address: Option<String>) -> RelayResult<Self> {
        write_frame(&mut stream, &PeerFrame::Open { address }).await?;
        match read_frame(&mut stream, DEFAULT_MAX_FRAME_SIZE).await? {
            Some(PeerFrame::Opened { inbox }) => Ok(Self {
                stream,
                next_seq: 0,
                inbox,
            }),
            Some(PeerFrame::Close { reason }) => Err(RelayError::Rejected(reason)),
            Some(other) => Err(RelayError::InvalidMessage(format!(
                "expected opened, got {other:?}"
            ))),
            None => Err(RelayError::Closed),
        }
    }

    /// Inbox the remote listener resolved for this session.
    pub fn inbox(&self) -> &str {
        &self.inbox
    }
}

#[async_trait]
impl<S> PeerConnection for FramedPeer<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, envelope: &Envelope) -> RelayResult<SendOutcome> {
        self.next_seq += 1;
        let seq = self.next_seq;
        let frame = PeerFrame::Transfer {
            seq,
            properties: envelope.properties.clone(),
            payload: envelope.payload.clone(),
        };
        write_frame(&mut self.stream, &frame).await?;

        match read_frame(&mut self.stream, DEFAULT_MAX_FRAME_SIZE).await? {
            Some(PeerFrame::Ack { seq: acked }) if acked == seq => Ok(SendOutcome::Accepted),
            Some(PeerFrame::Reject { seq: rejected, reason }) if rejected == seq => {
                Ok(SendOutcome::Rejected(reason))
            }
            Some(PeerFrame::Close { reason }) => Err(RelayError::Transport(format!(
                "peer closed session: {reason}"
            ))),
            Some(other) => Err(RelayError::InvalidMessage(format!(
                "unexpected answer to transfer {seq}: {other:?}"
            ))),
            None => Err(RelayError::Closed),
        }
    }

    async fn close(&mut self) {
        let _ = write_frame(
            &mut self.stream,
            &PeerFrame::Close {
                reason: "link closing".into(),
            },
        )
        .await;
        let _ = tokio::io::AsyncWriteExt::shutdown(&mut self.stream).await;
    }
}

// ── Direct mutual TLS ─────────────────────────────────────────────────

/// Opens mutual-TLS peer sessions.
///
/// The server name presented is derived from the entry's first legal name,
/// so the remote certificate must be issued for that name.
#[derive(Clone)]
pub struct TlsConnector {
    config: Arc<ClientConfig>,
}

impl TlsConnector {
    pub fn new(config: Arc<ClientConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl LinkConnector for TlsConnector {
    async fn connect(&self, target: &HostPort, entry: &BridgeEntry) -> RelayResult<Box<dyn PeerConnection>> {
        let legal_name = entry
            .primary_legal_name()
            .ok_or_else(|| RelayError::Config(format!("entry {} has no legal names", entry.queue_name)))?;
        let server_name = ServerName::try_from(sni_host_for(legal_name))
            .map_err(|e| RelayError::Tls(format!("invalid server name: {e}")))?;

        let tcp = TcpStream::connect((target.host.as_str(), target.port))
            .await
            .map_err(|e| RelayError::Transport(format!("connect {target}: {e}")))?;
        let _ = tcp.set_nodelay(true);

        let tls = tokio_rustls::TlsConnector::from(self.config.clone())
            .connect(server_name, tcp)
            .await
            .map_err(|e| RelayError::Tls(format!("handshake with {target}: {e}")))?;

        let peer = FramedPeer::open(tls, inbox_for_peer_queue(&entry.queue_name)).await?;
        info!(
            queue = %entry.queue_name,
            target = %target,
            inbox = %peer.inbox(),
            "peer session opened"
        );
        Ok(Box::new(peer))
    }
}

// ── Loopback ──────────────────────────────────────────────────────────

/// Short-circuits links whose destination is served by this relay.
///
/// A target is local when the queue's inbox lives here and either the
/// target is one of our public addresses or one of the entry's legal
/// names is ours. Such messages are published straight to the inbox.
pub struct LoopbackConnector {
    inner: Arc<dyn LinkConnector>,
    broker: Arc<dyn Broker>,
    registry: Arc<InboxRegistry>,
    public_addresses: Vec<HostPort>,
}

impl LoopbackConnector {
    pub fn new(
        inner: Arc<dyn LinkConnector>,
        broker: Arc<dyn Broker>,
        registry: Arc<InboxRegistry>,
        public_addresses: Vec<HostPort>,
    ) -> Self {
        Self {
            inner,
            broker,
            registry,
            public_addresses,
        }
    }

    fn local_inbox(&self, target: &HostPort, entry: &BridgeEntry) -> Option<String> {
        let inbox = inbox_for_peer_queue(&entry.queue_name)?;
        if !self.registry.has_inbox(&inbox) {
            return None;
        }
        let ours = self.public_addresses.contains(target)
            || entry.legal_names.iter().any(|n| self.registry.is_local_legal_name(n));
        ours.then_some(inbox)
    }
}

#[async_trait]
impl LinkConnector for LoopbackConnector {
    fn is_ready(&self) -> bool {
        self.inner.is_ready()
    }

    async fn wait_ready(&self) {
        self.inner.wait_ready().await
    }

    async fn connect(&self, target: &HostPort, entry: &BridgeEntry) -> RelayResult<Box<dyn PeerConnection>> {
        match self.local_inbox(target, entry) {
            Some(inbox) => {
                debug!(queue = %entry.queue_name, inbox = %inbox, "target is local, using loopback");
                Ok(Box::new(LoopbackConnection {
                    broker: self.broker.clone(),
                    inbox,
                }))
            }
            None => self.inner.connect(target, entry).await,
        }
    }
}

struct LoopbackConnection {
    broker: Arc<dyn Broker>,
    inbox: String,
}

#[async_trait]
impl PeerConnection for LoopbackConnection {
    async fn send(&mut self, envelope: &Envelope) -> RelayResult<SendOutcome> {
        let envelope = envelope.clone().with_property(LOOPBACK_PROPERTY, "true");
        match self.broker.publish(&self.inbox, envelope).await {
            Ok(()) => Ok(SendOutcome::Accepted),
            Err(RelayError::QueueNotFound(q)) => Ok(SendOutcome::Rejected(format!("no such queue {q}"))),
            Err(e) => Err(e),
        }
    }

    async fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::inbox::LocalIdentity;

    /// Answers every transfer after the first with `Reject`.
    async fn fake_listener(mut stream: tokio::io::DuplexStream) {
        let open: PeerFrame = read_frame(&mut stream, 1024).await.unwrap().unwrap();
        let inbox = match open {
            PeerFrame::Open { address } => address.unwrap_or_default(),
            other => panic!("unexpected {other:?}"),
        };
        write_frame(&mut stream, &PeerFrame::Opened { inbox }).await.unwrap();
        while let Some(frame) = read_frame::<_, PeerFrame>(&mut stream, 1024).await.unwrap() {
            match frame {
                PeerFrame::Transfer { seq: 1, .. } => {
                    write_frame(&mut stream, &PeerFrame::Ack { seq: 1 }).await.unwrap()
                }
                PeerFrame::Transfer { seq, .. } => write_frame(
                    &mut stream,
                    &PeerFrame::Reject {
                        seq,
                        reason: "too big".into(),
                    },
                )
                .await
                .unwrap(),
                PeerFrame::Close { .. } => break,
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn framed_peer_round_trip() {
        let (client, server) = tokio::io::duplex(4096);
        let listener = tokio::spawn(fake_listener(server));

        let mut peer = FramedPeer::open(client, Some("p2p.inbound.bankB".into())).await.unwrap();
        assert_eq!(peer.inbox(), "p2p.inbound.bankB");
        let env = Envelope::new(b"m1".to_vec());
        assert_eq!(peer.send(&env).await.unwrap(), SendOutcome::Accepted);
        assert_eq!(
            peer.send(&env).await.unwrap(),
            SendOutcome::Rejected("too big".into())
        );
        peer.close().await;
        listener.await.unwrap();
    }

    #[tokio::test]
    async fn open_refused_by_close() {
        let (client, mut server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let _: Option<PeerFrame> = read_frame(&mut server, 1024).await.unwrap();
            write_frame(&mut server, &PeerFrame::Close { reason: "no inbox".into() })
                .await
                .unwrap();
        });
        let err = FramedPeer::open(client, None).await.err().unwrap();
        assert!(matches!(err, RelayError::Rejected(_)));
    }

    struct Unreachable;

    #[async_trait]
    impl LinkConnector for Unreachable {
        async fn connect(&self, target: &HostPort, _: &BridgeEntry) -> RelayResult<Box<dyn PeerConnection>> {
            Err(RelayError::Transport(format!("{target} unreachable")))
        }
    }

    #[tokio::test]
    async fn loopback_publishes_to_local_inbox() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.create_queue("p2p.inbound.bankA").await.unwrap();
        let registry = Arc::new(InboxRegistry::new(vec![LocalIdentity {
            legal_name: "O=Bank A".into(),
            sni_hosts: vec![],
            inbox: "p2p.inbound.bankA".into(),
            default: true,
        }]));
        let loopback = LoopbackConnector::new(
            Arc::new(Unreachable),
            broker.clone(),
            registry,
            vec![HostPort::new("relay.example", 10005)],
        );

        let local = BridgeEntry::new(
            "internal.peers.bankA",
            vec![HostPort::new("unreachable.example", 10005)],
            ["O=Bank A".to_string()],
        );
        let mut conn = loopback.connect(&local.targets[0], &local).await.unwrap();
        assert_eq!(
            conn.send(&Envelope::new(b"hi".to_vec())).await.unwrap(),
            SendOutcome::Accepted
        );
        let delivered = broker.snapshot("p2p.inbound.bankA").await;
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].properties.get(LOOPBACK_PROPERTY).map(String::as_str), Some("true"));

        let remote = BridgeEntry::new(
            "internal.peers.bankB",
            vec![HostPort::new("10.0.0.5", 10005)],
            ["O=Bank B".to_string()],
        );
        assert!(loopback.connect(&remote.targets[0], &remote).await.is_err());
    }
}
