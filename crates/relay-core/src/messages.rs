//! Message types exchanged by the relay.
//!
//! Three vocabularies share the CBOR codec:
//! - [`BridgeControl`]: desired bridge state published by the node on the
//!   control address, plus the relay's snapshot request.
//! - [`PeerFrame`]: the per-connection protocol between an outbound link
//!   and a remote inbound listener.
//! - [`TunnelFrame`]: the multiplexing envelope between the inner and outer
//!   halves of a split deployment, carrying [`TunnelControl`] and
//!   [`TunnelData`] payloads.

use crate::codec::{cbor_decode, cbor_encode};
use crate::error::{RelayError, RelayResult};
use crate::names::is_valid_queue_name;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

// ── Addresses ─────────────────────────────────────────────────────────

/// A remote endpoint as advertised in a bridge entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl HostPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn validate(&self) -> RelayResult<()> {
        if self.host.is_empty() || self.host.len() > 253 {
            return Err(RelayError::Config(format!("invalid host '{}'", self.host)));
        }
        if self.host.chars().any(char::is_whitespace) {
            return Err(RelayError::Config(format!("invalid host '{}'", self.host)));
        }
        if self.port == 0 {
            return Err(RelayError::Config(format!("invalid port 0 for host {}", self.host)));
        }
        Ok(())
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for HostPort {
    type Err = RelayError;

    fn from_str(s: &str) -> RelayResult<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| RelayError::Config(format!("expected host:port, got '{s}'")))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let port: u16 = port
            .parse()
            .map_err(|_| RelayError::Config(format!("invalid port in '{s}'")))?;
        let hp = HostPort::new(host, port);
        hp.validate()?;
        Ok(hp)
    }
}

// ── Bridge control ────────────────────────────────────────────────────

/// Desired state for one outbound queue: where its messages must go.
///
/// Immutable once received; a later snapshot or `Add` for the same queue
/// supersedes it wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeEntry {
    pub queue_name: String,
    /// Failover list, tried in order.
    pub targets: Vec<HostPort>,
    /// Identities the remote end may present.
    pub legal_names: BTreeSet<String>,
    #[serde(default)]
    pub service_address: bool,
}

impl BridgeEntry {
    pub fn new(
        queue_name: impl Into<String>,
        targets: Vec<HostPort>,
        legal_names: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            queue_name: queue_name.into(),
            targets,
            legal_names: legal_names.into_iter().collect(),
            service_address: false,
        }
    }

    /// Reject entries whose queue or target data is malformed.
    pub fn validate(&self) -> RelayResult<()> {
        if !is_valid_queue_name(&self.queue_name) {
            return Err(RelayError::Config(format!(
                "invalid queue name '{}'",
                self.queue_name
            )));
        }
        if self.targets.is_empty() {
            return Err(RelayError::Config(format!(
                "entry for {} has no targets",
                self.queue_name
            )));
        }
        for target in &self.targets {
            target.validate()?;
        }
        if self.legal_names.is_empty() || self.legal_names.iter().any(|n| n.trim().is_empty()) {
            return Err(RelayError::Config(format!(
                "entry for {} has no usable legal names",
                self.queue_name
            )));
        }
        Ok(())
    }

    /// The legal name presented as TLS server name when connecting.
    pub fn primary_legal_name(&self) -> Option<&str> {
        self.legal_names.iter().next().map(String::as_str)
    }
}

/// Messages on the bridge control and notify addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeControl {
    /// Full desired state: every inbox the node owns and every queue that
    /// needs an outbound link.
    Snapshot {
        node_identity: String,
        inboxes: Vec<String>,
        entries: Vec<BridgeEntry>,
    },
    Add {
        node_identity: String,
        entry: BridgeEntry,
    },
    Remove {
        node_identity: String,
        queue_name: String,
    },
    /// Sent by the relay to ask the node for a fresh `Snapshot`.
    SnapshotRequest { bridge_identity: String },
}

// ── Application messages ──────────────────────────────────────────────

/// An opaque application message plus string properties.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            properties: BTreeMap::new(),
            payload: payload.into(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Serialized envelope for carriage on a broker queue.
    pub fn to_bytes(&self) -> RelayResult<Vec<u8>> {
        cbor_encode(self)
    }

    pub fn from_bytes(data: &[u8]) -> RelayResult<Self> {
        cbor_decode(data)
    }
}

// ── Peer protocol ─────────────────────────────────────────────────────

/// Frames exchanged on a peer connection.
///
/// The connecting side opens with `Open`, the listener answers `Opened` or
/// `Close`. Each `Transfer` is answered by exactly one `Ack` or `Reject`
/// with the same sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerFrame {
    Open {
        /// Inbox the sender expects to reach, used when no SNI host was sent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        address: Option<String>,
    },
    Opened {
        inbox: String,
    },
    Transfer {
        seq: u64,
        #[serde(default)]
        properties: BTreeMap<String, String>,
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },
    Ack {
        seq: u64,
    },
    Reject {
        seq: u64,
        reason: String,
    },
    Close {
        reason: String,
    },
}

// ── Tunnel ────────────────────────────────────────────────────────────

/// Tunnel channel carrying [`TunnelControl`] messages.
pub const CHANNEL_CONTROL: u8 = 0;
/// Tunnel channel carrying [`TunnelData`] messages.
pub const CHANNEL_DATA: u8 = 1;

/// Multiplexing envelope on the inner/outer tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelFrame {
    pub channel_id: u8,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

impl TunnelFrame {
    pub fn control(msg: &TunnelControl) -> RelayResult<Self> {
        Ok(Self {
            channel_id: CHANNEL_CONTROL,
            payload: cbor_encode(msg)?,
        })
    }

    pub fn data(msg: &TunnelData) -> RelayResult<Self> {
        Ok(Self {
            channel_id: CHANNEL_DATA,
            payload: cbor_encode(msg)?,
        })
    }

    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> RelayResult<T> {
        cbor_decode(&self.payload)
    }
}

/// Peer-facing identity pushed from the inner to the outer process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityMaterial {
    pub legal_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sni_host: Option<String>,
    pub inbox: String,
    #[serde(default)]
    pub default: bool,
    #[serde(with = "serde_bytes")]
    pub cert_pem: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub key_pem: Vec<u8>,
}

/// Control channel messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TunnelControl {
    /// Inner → outer: peer TLS material; the outer may start its public
    /// listener.
    Activate {
        identities: Vec<IdentityMaterial>,
        #[serde(with = "serde_bytes")]
        trust_roots_pem: Vec<u8>,
        enable_sni: bool,
    },
    /// Inner → outer: stop public traffic.
    Deactivate,
    /// Outer → inner: the public listener has stopped.
    Deactivated,
    /// Outer → inner: the `Activate` material was unusable; the public
    /// listener is not running.
    ActivateFailed { reason: String },
    /// Inner → outer: full routing state; replaces whatever the outer had.
    Snapshot {
        inboxes: Vec<String>,
        entries: Vec<BridgeEntry>,
    },
    Add {
        entry: BridgeEntry,
    },
    Remove {
        queue_name: String,
    },
    /// Inner → outer: open a public connection on behalf of a link.
    Connect {
        link_id: u64,
        queue_name: String,
        target: HostPort,
    },
    /// Outer → inner: outcome of a `Connect`.
    ConnectResult {
        link_id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Inner → outer: the link is done with its connection.
    CloseLink { link_id: u64 },
    /// Outer → inner: the public connection behind a link went away.
    LinkClosed { link_id: u64, reason: String },
}

/// Data channel messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TunnelData {
    /// Inner → outer: one envelope for a link's public connection.
    Outbound {
        link_id: u64,
        seq: u64,
        envelope: Envelope,
    },
    /// Outer → inner: the remote peer answered an `Outbound`.
    OutboundAck {
        link_id: u64,
        seq: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rejected: Option<String>,
    },
    /// Outer → inner: an envelope received on the public listener.
    Inbound {
        request_id: u64,
        inbox: String,
        envelope: Envelope,
    },
    /// Inner → outer: broker outcome for an `Inbound`.
    InboundAck {
        request_id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        /// The failure may clear up; the peer should resend later.
        #[serde(default)]
        transient: bool,
    },
}

// ── Helper for bytes serde ────────────────────────────────────────────

mod serde_bytes {
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let buf: ByteBuf = Deserialize::deserialize(deserializer)?;
        Ok(buf.0)
    }

    struct ByteBuf(Vec<u8>);

    impl<'de> Deserialize<'de> for ByteBuf {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: Deserializer<'de>,
        {
            struct ByteBufVisitor;

            impl<'de> serde::de::Visitor<'de> for ByteBufVisitor {
                type Value = ByteBuf;

                fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                    formatter.write_str("bytes")
                }

                fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E> {
                    Ok(ByteBuf(v.to_vec()))
                }

                fn visit_byte_buf<E>(self, v: Vec<u8>) -> Result<Self::Value, E> {
                    Ok(ByteBuf(v))
                }

                fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
                where
                    A: serde::de::SeqAccess<'de>,
                {
                    let mut bytes = Vec::new();
                    while let Some(b) = seq.next_element::<u8>()? {
                        bytes.push(b);
                    }
                    Ok(ByteBuf(bytes))
                }
            }

            deserializer.deserialize_any(ByteBufVisitor)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{cbor_decode, frame_encode};

    fn entry(queue: &str, targets: &[(&str, u16)]) -> BridgeEntry {
        BridgeEntry::new(
            queue,
            targets.iter().map(|(h, p)| HostPort::new(*h, *p)).collect(),
            ["O=Bank A, L=London, C=GB".to_string()],
        )
    }

    #[test]
    fn host_port_parse_and_display() {
        let hp: HostPort = "10.0.0.5:10005".parse().unwrap();
        assert_eq!(hp, HostPort::new("10.0.0.5", 10005));
        assert_eq!(hp.to_string(), "10.0.0.5:10005");

        let v6: HostPort = "[::1]:443".parse().unwrap();
        assert_eq!(v6.host, "::1");
        assert_eq!(v6.to_string(), "[::1]:443");

        assert!("no-port".parse::<HostPort>().is_err());
        assert!("host:0".parse::<HostPort>().is_err());
        assert!(":80".parse::<HostPort>().is_err());
    }

    #[test]
    fn entry_validation_rejects_malformed_targets() {
        assert!(entry("peer-A-out", &[("10.0.0.5", 10005)]).validate().is_ok());
        assert!(entry("peer-A-out", &[]).validate().is_err());
        assert!(entry("peer-A-out", &[("", 10005)]).validate().is_err());
        assert!(entry("peer-A-out", &[("10.0.0.5", 0)]).validate().is_err());
        assert!(entry("", &[("10.0.0.5", 10005)]).validate().is_err());

        let mut nameless = entry("peer-A-out", &[("10.0.0.5", 10005)]);
        nameless.legal_names.clear();
        assert!(nameless.validate().is_err());
    }

    #[test]
    fn control_snapshot_survives_cbor() {
        let msg = BridgeControl::Snapshot {
            node_identity: "O=Bank A, L=London, C=GB".into(),
            inboxes: vec!["p2p.inbound.bankA".into()],
            entries: vec![entry("internal.peers.bankB", &[("10.0.0.5", 10005), ("10.0.0.6", 10005)])],
        };
        let frame = frame_encode(&msg).unwrap();
        let decoded: BridgeControl = cbor_decode(&frame[4..]).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn envelope_payload_is_cbor_bytes() {
        let env = Envelope::new(vec![0u8, 1, 2, 255]).with_property("TestProp", "1");
        let bytes = env.to_bytes().unwrap();
        // Major type 2 (byte string) rather than an array of integers.
        assert!(bytes.windows(2).any(|w| w == [0x44, 0x00]));
        assert_eq!(Envelope::from_bytes(&bytes).unwrap(), env);
    }

    #[test]
    fn tunnel_frame_carries_typed_payloads() {
        let ctl = TunnelControl::Connect {
            link_id: 7,
            queue_name: "internal.peers.bankB".into(),
            target: HostPort::new("10.0.0.5", 10005),
        };
        let frame = TunnelFrame::control(&ctl).unwrap();
        assert_eq!(frame.channel_id, CHANNEL_CONTROL);
        assert_eq!(cbor_decode::<TunnelControl>(&frame.payload).unwrap(), ctl);

        let data = TunnelData::Outbound {
            link_id: 7,
            seq: 1,
            envelope: Envelope::new(b"hello".to_vec()),
        };
        let frame = TunnelFrame::data(&data).unwrap();
        assert_eq!(frame.channel_id, CHANNEL_DATA);
        assert_eq!(cbor_decode::<TunnelData>(&frame.payload).unwrap(), data);
    }
}
