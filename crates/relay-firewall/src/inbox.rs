//! Local identities and inboxes, and inbound routing between them.

use relay_core::{IdentityMaterial, RelayError, RelayResult};
use std::collections::BTreeSet;
use std::sync::RwLock;

use crate::tls::sni_hosts;

/// A peer-facing identity served by this relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub legal_name: String,
    /// Lowercase server names that select this identity.
    pub sni_hosts: Vec<String>,
    pub inbox: String,
    pub default: bool,
}

impl From<&IdentityMaterial> for LocalIdentity {
    fn from(m: &IdentityMaterial) -> Self {
        Self {
            legal_name: m.legal_name.clone(),
            sni_hosts: sni_hosts(m),
            inbox: m.inbox.clone(),
            default: m.default,
        }
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    identities: Vec<LocalIdentity>,
    /// Inboxes announced by the node in its last snapshot.
    inboxes: BTreeSet<String>,
}

/// Which inboxes live behind this relay and which identity owns them.
#[derive(Debug, Default)]
pub struct InboxRegistry {
    state: RwLock<RegistryState>,
}

impl InboxRegistry {
    pub fn new(identities: Vec<LocalIdentity>) -> Self {
        Self {
            state: RwLock::new(RegistryState {
                identities,
                inboxes: BTreeSet::new(),
            }),
        }
    }

    pub fn set_identities(&self, identities: Vec<LocalIdentity>) {
        if let Ok(mut state) = self.state.write() {
            state.identities = identities;
        }
    }

    pub fn set_inboxes<I: IntoIterator<Item = String>>(&self, inboxes: I) {
        if let Ok(mut state) = self.state.write() {
            state.inboxes = inboxes.into_iter().collect();
        }
    }

    pub fn inboxes(&self) -> Vec<String> {
        self.state
            .read()
            .map(|s| s.inboxes.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Inbox is either announced by the node or owned by an identity.
    pub fn has_inbox(&self, inbox: &str) -> bool {
        self.state
            .read()
            .map(|s| s.inboxes.contains(inbox) || s.identities.iter().any(|id| id.inbox == inbox))
            .unwrap_or(false)
    }

    pub fn is_local_legal_name(&self, legal_name: &str) -> bool {
        self.state
            .read()
            .map(|s| s.identities.iter().any(|id| id.legal_name == legal_name))
            .unwrap_or(false)
    }

    /// Choose the inbox for an inbound session.
    ///
    /// A server name from the TLS handshake is authoritative: it either
    /// selects its identity or the session is refused. Without one, an
    /// explicit address naming a local inbox wins, then the default
    /// identity, then the only identity.
    pub fn resolve(&self, sni_host: Option<&str>, address: Option<&str>) -> RelayResult<String> {
        let state = self
            .state
            .read()
            .map_err(|_| RelayError::Other("inbox registry poisoned".into()))?;

        if let Some(host) = sni_host {
            let host = host.to_ascii_lowercase();
            return state
                .identities
                .iter()
                .find(|id| id.sni_hosts.iter().any(|h| *h == host))
                .map(|id| id.inbox.clone())
                .ok_or_else(|| RelayError::AuthFailed(format!("no identity for server name {host}")));
        }

        if let Some(addr) = address {
            let known = state.inboxes.contains(addr) || state.identities.iter().any(|id| id.inbox == addr);
            if known {
                return Ok(addr.to_string());
            }
        }
        if let Some(id) = state.identities.iter().find(|id| id.default) {
            return Ok(id.inbox.clone());
        }
        if let [only] = state.identities.as_slice() {
            return Ok(only.inbox.clone());
        }
        Err(RelayError::Rejected(
            "no server name, no known address and no default identity".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(name: &str, inbox: &str, hosts: &[&str], default: bool) -> LocalIdentity {
        LocalIdentity {
            legal_name: name.to_string(),
            sni_hosts: hosts.iter().map(|h| h.to_string()).collect(),
            inbox: inbox.to_string(),
            default,
        }
    }

    fn two_banks(default_a: bool) -> InboxRegistry {
        InboxRegistry::new(vec![
            identity("O=Bank A", "p2p.inbound.bankA", &["banka.example"], default_a),
            identity("O=Bank B", "p2p.inbound.bankB", &["bankb.example"], false),
        ])
    }

    #[test]
    fn sni_selects_identity() {
        let reg = two_banks(false);
        assert_eq!(reg.resolve(Some("bankb.example"), None).unwrap(), "p2p.inbound.bankB");
        assert_eq!(reg.resolve(Some("BANKA.example"), None).unwrap(), "p2p.inbound.bankA");
    }

    #[test]
    fn unknown_sni_is_refused_even_with_address() {
        let reg = two_banks(true);
        let err = reg
            .resolve(Some("unknown.example"), Some("p2p.inbound.bankA"))
            .unwrap_err();
        assert!(matches!(err, RelayError::AuthFailed(_)));
    }

    #[test]
    fn without_sni_address_then_default_then_sole() {
        let reg = two_banks(true);
        reg.set_inboxes(vec!["p2p.inbound.carol".to_string()]);
        assert_eq!(reg.resolve(None, Some("p2p.inbound.carol")).unwrap(), "p2p.inbound.carol");
        assert_eq!(reg.resolve(None, Some("p2p.inbound.nobody")).unwrap(), "p2p.inbound.bankA");
        assert_eq!(reg.resolve(None, None).unwrap(), "p2p.inbound.bankA");

        let no_default = two_banks(false);
        assert!(no_default.resolve(None, None).is_err());

        let sole = InboxRegistry::new(vec![identity("O=Bank A", "p2p.inbound.bankA", &[], false)]);
        assert_eq!(sole.resolve(None, None).unwrap(), "p2p.inbound.bankA");
    }

    #[test]
    fn local_names_and_inboxes() {
        let reg = two_banks(false);
        assert!(reg.has_inbox("p2p.inbound.bankB"));
        assert!(!reg.has_inbox("p2p.inbound.carol"));
        assert!(reg.is_local_legal_name("O=Bank A"));
        assert!(!reg.is_local_legal_name("O=Carol"));
    }
}
