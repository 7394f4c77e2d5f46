//! Broker address conventions and TLS server-name derivation.

use sha2::{Digest, Sha256};

/// Prefix of the queues the node fills with messages for one remote peer.
pub const PEERS_PREFIX: &str = "internal.peers.";

/// Prefix of local inbox queues fed by the inbound listener.
pub const P2P_PREFIX: &str = "p2p.inbound.";

/// Address the node publishes desired bridge state to.
pub const BRIDGE_CONTROL: &str = "internal.bridge.control";

/// Address the relay publishes snapshot requests and notifications to.
pub const BRIDGE_NOTIFY: &str = "internal.bridge.notify";

/// DNS suffix for server names derived from legal names.
pub const SNI_DOMAIN: &str = "relay.p2p";

/// Property stamped on inbound messages with the sender's certificate fingerprint.
pub const PEER_FINGERPRINT_PROPERTY: &str = "relay-peer-fingerprint";

/// Property stamped on messages delivered through the loopback path.
pub const LOOPBACK_PROPERTY: &str = "relay-loopback";

/// Map an outbound peer queue to the inbox that queue feeds on the remote side.
///
/// `internal.peers.X` → `p2p.inbound.X`. Returns `None` for queues outside
/// the peers namespace.
pub fn inbox_for_peer_queue(queue: &str) -> Option<String> {
    queue
        .strip_prefix(PEERS_PREFIX)
        .filter(|rest| !rest.is_empty())
        .map(|rest| format!("{P2P_PREFIX}{rest}"))
}

/// Derive the TLS server name a peer with `legal_name` is reachable under.
///
/// Legal names are X.500-style strings that are not valid DNS names, so the
/// name is hashed into a single DNS label.
pub fn sni_host_for(legal_name: &str) -> String {
    let hash = hex::encode(Sha256::digest(legal_name.as_bytes()));
    format!("{}.{SNI_DOMAIN}", &hash[..32])
}

/// Queue names must be non-empty and free of whitespace.
pub fn is_valid_queue_name(name: &str) -> bool {
    !name.is_empty() && !name.chars().any(char::is_whitespace)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_queue_maps_to_remote_inbox() {
        assert_eq!(
            inbox_for_peer_queue("internal.peers.DL3abc").as_deref(),
            Some("p2p.inbound.DL3abc")
        );
        assert_eq!(inbox_for_peer_queue("internal.peers."), None);
        assert_eq!(inbox_for_peer_queue("peer-A-out"), None);
    }

    #[test]
    fn sni_host_is_a_stable_dns_name() {
        let host = sni_host_for("O=Bank B, L=London, C=GB");
        assert_eq!(host, sni_host_for("O=Bank B, L=London, C=GB"));
        assert_ne!(host, sni_host_for("O=Bank A, L=London, C=GB"));
        let (label, domain) = host.split_once('.').unwrap();
        assert_eq!(label.len(), 32);
        assert!(label.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(domain, SNI_DOMAIN);
    }

    #[test]
    fn queue_name_validation() {
        assert!(is_valid_queue_name("internal.peers.abc"));
        assert!(!is_valid_queue_name(""));
        assert!(!is_valid_queue_name("bad queue"));
    }
}
