//! Mutual-TLS contexts for peer connections and the inner/outer tunnel.
//!
//! Peer-facing material is kept as PEM ([`IdentityMaterial`]) so the same
//! value can be loaded from disk or pushed across the tunnel to the outer
//! process. Contexts built from it are immutable and shared by every link
//! and session.

use relay_core::names::sni_host_for;
use relay_core::{fingerprint, IdentityMaterial, RelayError, RelayResult};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert, WebPkiClientVerifier};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, CommonState, RootCertStore, ServerConfig};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use crate::config::{IdentityConfig, TunnelConfig};

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn tls_err(context: &str, e: impl std::fmt::Display) -> RelayError {
    RelayError::Tls(format!("{context}: {e}"))
}

/// Read a PEM file into memory.
pub fn read_pem(path: &Path) -> RelayResult<Vec<u8>> {
    std::fs::read(path)
        .map_err(|e| RelayError::Config(format!("cannot read {}: {e}", path.display())))
}

pub fn parse_certs(pem: &[u8]) -> RelayResult<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| tls_err("invalid certificate PEM", e))?;
    if certs.is_empty() {
        return Err(RelayError::Tls("no certificate found in PEM".into()));
    }
    Ok(certs)
}

pub fn parse_key(pem: &[u8]) -> RelayResult<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|e| tls_err("invalid key PEM", e))?
        .ok_or_else(|| RelayError::Tls("no private key found in PEM".into()))
}

pub fn root_store(pem: &[u8]) -> RelayResult<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in parse_certs(pem)? {
        roots.add(cert).map_err(|e| tls_err("invalid trust root", e))?;
    }
    Ok(roots)
}

/// Load a configured identity's certificate and key into memory.
pub fn load_identity(id: &IdentityConfig) -> RelayResult<IdentityMaterial> {
    Ok(IdentityMaterial {
        legal_name: id.legal_name.clone(),
        sni_host: id.sni_host.clone(),
        inbox: id.inbox.clone(),
        default: id.default,
        cert_pem: read_pem(&id.cert_path)?,
        key_pem: read_pem(&id.key_path)?,
    })
}

/// Server names an identity answers to: its explicit host, if any, and the
/// name derived from its legal name.
pub fn sni_hosts(id: &IdentityMaterial) -> Vec<String> {
    let mut hosts = Vec::with_capacity(2);
    if let Some(host) = &id.sni_host {
        hosts.push(host.to_ascii_lowercase());
    }
    let derived = sni_host_for(&id.legal_name);
    if !hosts.contains(&derived) {
        hosts.push(derived);
    }
    hosts
}

fn certified_key(id: &IdentityMaterial) -> RelayResult<Arc<CertifiedKey>> {
    let certs = parse_certs(&id.cert_pem)?;
    let key = parse_key(&id.key_pem)?;
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|e| tls_err("unsupported private key", e))?;
    Ok(Arc::new(CertifiedKey::new(certs, signing_key)))
}

/// Picks the listener certificate from the ClientHello server name.
///
/// A known host selects its identity and an unknown host gets no
/// certificate, which aborts the handshake. Hellos without a server name
/// get the default identity, or the only one configured.
#[derive(Debug)]
pub struct SniCertResolver {
    by_host: HashMap<String, Arc<CertifiedKey>>,
    fallback: Option<Arc<CertifiedKey>>,
    enable_sni: bool,
}

impl SniCertResolver {
    pub fn new(identities: &[IdentityMaterial], enable_sni: bool) -> RelayResult<Self> {
        if identities.is_empty() {
            return Err(RelayError::Config("listener needs at least one identity".into()));
        }
        let mut by_host = HashMap::new();
        let mut fallback = None;
        for id in identities {
            let key = certified_key(id)?;
            for host in sni_hosts(id) {
                by_host.insert(host, key.clone());
            }
            if id.default {
                fallback = Some(key);
            }
        }
        if fallback.is_none() && identities.len() == 1 {
            fallback = by_host.values().next().cloned();
        }
        if !enable_sni && fallback.is_none() {
            return Err(RelayError::Config(
                "SNI is disabled but no default identity is configured".into(),
            ));
        }
        Ok(Self {
            by_host,
            fallback,
            enable_sni,
        })
    }
}

impl ResolvesServerCert for SniCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        if !self.enable_sni {
            return self.fallback.clone();
        }
        match client_hello.server_name() {
            Some(host) => {
                let found = self.by_host.get(&host.to_ascii_lowercase()).cloned();
                if found.is_none() {
                    debug!(sni = %host, "no identity for requested server name");
                }
                found
            }
            None => self.fallback.clone(),
        }
    }
}

/// Peer-facing TLS material: identities, trust roots and SNI mode.
#[derive(Debug, Clone)]
pub struct PeerTls {
    pub identities: Vec<IdentityMaterial>,
    pub trust_roots_pem: Vec<u8>,
    pub enable_sni: bool,
}

impl PeerTls {
    /// Inbound listener context: client certificates are mandatory.
    pub fn server_config(&self) -> RelayResult<Arc<ServerConfig>> {
        let roots = Arc::new(root_store(&self.trust_roots_pem)?);
        let verifier = WebPkiClientVerifier::builder_with_provider(roots, provider())
            .build()
            .map_err(|e| tls_err("build client verifier", e))?;
        let resolver = SniCertResolver::new(&self.identities, self.enable_sni)?;
        let config = ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .map_err(|e| tls_err("protocol versions", e))?
            .with_client_cert_verifier(verifier)
            .with_cert_resolver(Arc::new(resolver));
        Ok(Arc::new(config))
    }

    /// Outbound link context, presenting the default identity.
    pub fn client_config(&self) -> RelayResult<Arc<ClientConfig>> {
        let id = self
            .identities
            .iter()
            .find(|id| id.default)
            .or_else(|| self.identities.first())
            .ok_or_else(|| RelayError::Config("no identity for outbound links".into()))?;
        client_config(&id.cert_pem, &id.key_pem, &self.trust_roots_pem)
    }
}

pub fn client_config(cert_pem: &[u8], key_pem: &[u8], roots_pem: &[u8]) -> RelayResult<Arc<ClientConfig>> {
    let config = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| tls_err("protocol versions", e))?
        .with_root_certificates(root_store(roots_pem)?)
        .with_client_auth_cert(parse_certs(cert_pem)?, parse_key(key_pem)?)
        .map_err(|e| tls_err("client certificate", e))?;
    Ok(Arc::new(config))
}

/// Tunnel server context (outer side).
pub fn tunnel_server_config(tunnel: &TunnelConfig) -> RelayResult<Arc<ServerConfig>> {
    server_config(
        &read_pem(&tunnel.cert_path)?,
        &read_pem(&tunnel.key_path)?,
        &read_pem(&tunnel.trust_path)?,
    )
}

/// Single-certificate server context that requires client certificates.
pub fn server_config(cert_pem: &[u8], key_pem: &[u8], roots_pem: &[u8]) -> RelayResult<Arc<ServerConfig>> {
    let roots = Arc::new(root_store(roots_pem)?);
    let verifier = WebPkiClientVerifier::builder_with_provider(roots, provider())
        .build()
        .map_err(|e| tls_err("build client verifier", e))?;
    let config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| tls_err("protocol versions", e))?
        .with_client_cert_verifier(verifier)
        .with_single_cert(parse_certs(cert_pem)?, parse_key(key_pem)?)
        .map_err(|e| tls_err("server certificate", e))?;
    Ok(Arc::new(config))
}

/// Tunnel client context (inner side).
pub fn tunnel_client_config(tunnel: &TunnelConfig) -> RelayResult<Arc<ClientConfig>> {
    client_config(
        &read_pem(&tunnel.cert_path)?,
        &read_pem(&tunnel.key_path)?,
        &read_pem(&tunnel.trust_path)?,
    )
}

/// Fingerprint of the remote end's leaf certificate.
pub fn peer_fingerprint(conn: &CommonState) -> Option<String> {
    conn.peer_certificates()
        .and_then(|certs| certs.first())
        .map(|leaf| fingerprint(leaf.as_ref()))
}

#[cfg(test)]
pub(crate) mod test_pki {
    //! Throwaway CA and leaf certificates for TLS tests.

    use relay_core::names::sni_host_for;
    use relay_core::IdentityMaterial;

    pub struct TestCa {
        cert: rcgen::Certificate,
        key: rcgen::KeyPair,
    }

    impl TestCa {
        pub fn new() -> Self {
            let mut params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
            params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
            params
                .distinguished_name
                .push(rcgen::DnType::CommonName, "relay test root");
            let key = rcgen::KeyPair::generate().unwrap();
            let cert = params.self_signed(&key).unwrap();
            Self { cert, key }
        }

        pub fn pem(&self) -> Vec<u8> {
            self.cert.pem().into_bytes()
        }

        /// Issue a leaf for `names`, returning (cert PEM, key PEM).
        pub fn issue(&self, names: &[&str]) -> (Vec<u8>, Vec<u8>) {
            let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
            let params = rcgen::CertificateParams::new(names).unwrap();
            let key = rcgen::KeyPair::generate().unwrap();
            let cert = params.signed_by(&key, &self.cert, &self.key).unwrap();
            (cert.pem().into_bytes(), key.serialize_pem().into_bytes())
        }

        /// Peer identity whose certificate carries its derived server name
        /// plus any extra names.
        pub fn identity(&self, legal_name: &str, inbox: &str, extra: &[&str]) -> IdentityMaterial {
            let derived = sni_host_for(legal_name);
            let mut names = vec![derived.as_str(), "localhost"];
            names.extend_from_slice(extra);
            let (cert_pem, key_pem) = self.issue(&names);
            IdentityMaterial {
                legal_name: legal_name.to_string(),
                sni_host: extra.first().map(|h| h.to_string()),
                inbox: inbox.to_string(),
                default: false,
                cert_pem,
                key_pem,
            }
        }
    }
}
