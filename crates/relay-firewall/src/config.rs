//! Firewall configuration: TOML file + CLI overrides.

use relay_core::{HostPort, RelayError, RelayResult};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::backoff::BackoffPolicy;

/// Deployment role of this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirewallMode {
    /// One process bridges outbound queues and terminates inbound peers.
    SenderReceiver,
    BridgeInner,
    BridgeOuter,
    FloatInner,
    FloatOuter,
}

impl FirewallMode {
    /// Trusted half of a split deployment.
    pub fn is_inner(self) -> bool {
        matches!(self, FirewallMode::BridgeInner | FirewallMode::FloatInner)
    }

    /// DMZ half of a split deployment; holds no broker or peer credentials.
    pub fn is_outer(self) -> bool {
        matches!(self, FirewallMode::BridgeOuter | FirewallMode::FloatOuter)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FirewallMode::SenderReceiver => "sender_receiver",
            FirewallMode::BridgeInner => "bridge_inner",
            FirewallMode::BridgeOuter => "bridge_outer",
            FirewallMode::FloatInner => "float_inner",
            FirewallMode::FloatOuter => "float_outer",
        }
    }
}

impl fmt::Display for FirewallMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FirewallMode {
    type Err = RelayError;

    fn from_str(s: &str) -> RelayResult<Self> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "senderreceiver" => Ok(FirewallMode::SenderReceiver),
            "bridgeinner" => Ok(FirewallMode::BridgeInner),
            "bridgeouter" => Ok(FirewallMode::BridgeOuter),
            "floatinner" => Ok(FirewallMode::FloatInner),
            "floatouter" => Ok(FirewallMode::FloatOuter),
            _ => Err(RelayError::Config(format!("unknown firewall mode '{s}'"))),
        }
    }
}

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub firewall: FirewallSection,
    #[serde(default)]
    pub broker: Option<BrokerSection>,
    #[serde(default)]
    pub inbound: InboundSection,
    #[serde(default)]
    pub outbound: OutboundSection,
    #[serde(default)]
    pub backoff: BackoffSection,
    #[serde(default)]
    pub activation: ActivationSection,
    #[serde(default)]
    pub tunnel: Option<TunnelSection>,
}

/// `[firewall]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct FirewallSection {
    #[serde(default = "default_mode")]
    pub mode: FirewallMode,
    /// Name this relay reports in snapshot requests.
    #[serde(default = "default_identity")]
    pub identity: String,
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
}

impl Default for FirewallSection {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            identity: default_identity(),
            drain_timeout_secs: default_drain_timeout(),
        }
    }
}

/// `[broker]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerSection {
    pub address: String,
    #[serde(default)]
    pub alternates: Vec<String>,
}

/// `[inbound]` section: public listener and the peer-facing identities.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InboundSection {
    #[serde(default)]
    pub listen: Vec<String>,
    #[serde(default)]
    pub enable_sni: bool,
    /// PEM bundle of peer trust roots, used in both directions.
    #[serde(default)]
    pub trust: Option<String>,
    #[serde(default)]
    pub identities: Vec<IdentitySection>,
}

/// One `[[inbound.identities]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct IdentitySection {
    pub legal_name: String,
    #[serde(default)]
    pub sni_host: Option<String>,
    pub inbox: String,
    pub cert: String,
    pub key: String,
    #[serde(default)]
    pub default: bool,
}

/// `[outbound]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct OutboundSection {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_secs: u64,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// Addresses peers use to reach this relay's own listener.
    #[serde(default)]
    pub public_addresses: Vec<String>,
}

impl Default for OutboundSection {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            ack_timeout_secs: default_ack_timeout(),
            max_message_size: default_max_message_size(),
            public_addresses: Vec::new(),
        }
    }
}

/// `[backoff]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct BackoffSection {
    #[serde(default = "default_backoff_initial")]
    pub initial_ms: u64,
    #[serde(default = "default_backoff_max")]
    pub max_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,
}

impl Default for BackoffSection {
    fn default() -> Self {
        Self {
            initial_ms: default_backoff_initial(),
            max_ms: default_backoff_max(),
            multiplier: default_backoff_multiplier(),
        }
    }
}

/// `[activation]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ActivationSection {
    #[serde(default = "default_lease_name")]
    pub lease_name: String,
    #[serde(default)]
    pub holder: Option<String>,
    #[serde(default = "default_lease_ttl")]
    pub ttl_secs: u64,
    #[serde(default = "default_renew_interval")]
    pub renew_interval_secs: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

impl Default for ActivationSection {
    fn default() -> Self {
        Self {
            lease_name: default_lease_name(),
            holder: None,
            ttl_secs: default_lease_ttl(),
            renew_interval_secs: default_renew_interval(),
            poll_interval_secs: default_poll_interval(),
        }
    }
}

/// `[tunnel]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelSection {
    /// Inner: address to dial. Outer: address to bind.
    pub address: String,
    pub cert: String,
    pub key: String,
    pub trust: String,
    #[serde(default = "default_tunnel_server_name")]
    pub server_name: String,
}

fn default_mode() -> FirewallMode {
    FirewallMode::SenderReceiver
}
fn default_identity() -> String {
    "relay-firewall".to_string()
}
fn default_drain_timeout() -> u64 {
    10
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_ack_timeout() -> u64 {
    30
}
fn default_max_message_size() -> usize {
    10 * 1024 * 1024
}
fn default_backoff_initial() -> u64 {
    1000
}
fn default_backoff_max() -> u64 {
    60_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_lease_name() -> String {
    "relay-firewall".to_string()
}
fn default_lease_ttl() -> u64 {
    60
}
fn default_renew_interval() -> u64 {
    10
}
fn default_poll_interval() -> u64 {
    5
}
fn default_tunnel_server_name() -> String {
    "float.relay.internal".to_string()
}

// ── Resolved configuration ────────────────────────────────────────────

/// A peer-facing identity with its PEM files located.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityConfig {
    pub legal_name: String,
    pub sni_host: Option<String>,
    pub inbox: String,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub default: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    pub address: String,
    pub alternates: Vec<String>,
}

/// Public listener and peer identities.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InboundConfig {
    pub listen: Vec<String>,
    pub enable_sni: bool,
    pub trust_path: Option<PathBuf>,
    pub identities: Vec<IdentityConfig>,
}

/// Per-link timing shared by every outbound link.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkSettings {
    pub connect_timeout: Duration,
    pub ack_timeout: Duration,
    pub max_message_size: usize,
    pub backoff: BackoffPolicy,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(default_connect_timeout()),
            ack_timeout: Duration::from_secs(default_ack_timeout()),
            max_message_size: default_max_message_size(),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActivationSettings {
    pub lease_name: String,
    pub holder: String,
    pub ttl: Duration,
    pub renew_interval: Duration,
    pub poll_interval: Duration,
    pub backoff: BackoffPolicy,
}

impl ActivationSettings {
    pub fn new(lease_name: impl Into<String>, holder: impl Into<String>) -> Self {
        Self {
            lease_name: lease_name.into(),
            holder: holder.into(),
            ttl: Duration::from_secs(default_lease_ttl()),
            renew_interval: Duration::from_secs(default_renew_interval()),
            poll_interval: Duration::from_secs(default_poll_interval()),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    pub address: String,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub trust_path: PathBuf,
    pub server_name: String,
}

/// Resolved firewall configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct FirewallConfig {
    pub mode: FirewallMode,
    pub identity: String,
    pub drain_timeout: Duration,
    pub broker: Option<BrokerConfig>,
    pub inbound: InboundConfig,
    pub link: LinkSettings,
    pub public_addresses: Vec<HostPort>,
    pub activation: ActivationSettings,
    pub tunnel: Option<TunnelConfig>,
}

impl FirewallConfig {
    /// Load config from a TOML file, then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_mode: Option<FirewallMode>,
        cli_listen: &[String],
    ) -> RelayResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    parse_config_file(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        let mut file_config = file_config;
        if let Some(mode) = cli_mode {
            file_config.firewall.mode = mode;
        }
        if !cli_listen.is_empty() {
            file_config.inbound.listen = cli_listen.to_vec();
        }
        Self::resolve(file_config)
    }

    /// Parse and validate a config document.
    pub fn from_toml_str(content: &str) -> RelayResult<Self> {
        Self::resolve(parse_config_file(content)?)
    }

    fn resolve(file: ConfigFile) -> RelayResult<Self> {
        let backoff = BackoffPolicy {
            initial: Duration::from_millis(file.backoff.initial_ms),
            max: Duration::from_millis(file.backoff.max_ms),
            multiplier: file.backoff.multiplier,
        };
        backoff.validate()?;

        let public_addresses = file
            .outbound
            .public_addresses
            .iter()
            .map(|a| a.parse::<HostPort>())
            .collect::<RelayResult<Vec<_>>>()?;

        let holder = file.activation.holder.clone().unwrap_or_else(|| {
            format!("{}-{}-{:08x}", file.firewall.identity, std::process::id(), rand::random::<u32>())
        });

        let config = Self {
            mode: file.firewall.mode,
            identity: file.firewall.identity,
            drain_timeout: Duration::from_secs(file.firewall.drain_timeout_secs),
            broker: file.broker.map(|b| BrokerConfig {
                address: b.address,
                alternates: b.alternates,
            }),
            inbound: InboundConfig {
                listen: file.inbound.listen,
                enable_sni: file.inbound.enable_sni,
                trust_path: file.inbound.trust.as_deref().map(expand_tilde_str),
                identities: file
                    .inbound
                    .identities
                    .into_iter()
                    .map(|id| IdentityConfig {
                        legal_name: id.legal_name,
                        sni_host: id.sni_host,
                        inbox: id.inbox,
                        cert_path: expand_tilde_str(&id.cert),
                        key_path: expand_tilde_str(&id.key),
                        default: id.default,
                    })
                    .collect(),
            },
            link: LinkSettings {
                connect_timeout: Duration::from_secs(file.outbound.connect_timeout_secs),
                ack_timeout: Duration::from_secs(file.outbound.ack_timeout_secs),
                max_message_size: file.outbound.max_message_size,
                backoff: backoff.clone(),
            },
            public_addresses,
            activation: ActivationSettings {
                lease_name: file.activation.lease_name,
                holder,
                ttl: Duration::from_secs(file.activation.ttl_secs),
                renew_interval: Duration::from_secs(file.activation.renew_interval_secs),
                poll_interval: Duration::from_secs(file.activation.poll_interval_secs),
                backoff,
            },
            tunnel: file.tunnel.map(|t| TunnelConfig {
                address: t.address,
                cert_path: expand_tilde_str(&t.cert),
                key_path: expand_tilde_str(&t.key),
                trust_path: expand_tilde_str(&t.trust),
                server_name: t.server_name,
            }),
        };
        config.validate()?;
        Ok(config)
    }

    /// Check that the mode's required sections are present and that outer
    /// modes carry no broker or peer credentials.
    pub fn validate(&self) -> RelayResult<()> {
        let mode = self.mode;
        if self.activation.renew_interval >= self.activation.ttl {
            return Err(RelayError::Config(
                "activation renew interval must be shorter than the lease ttl".into(),
            ));
        }
        if self.link.max_message_size == 0 {
            return Err(RelayError::Config("max_message_size must be positive".into()));
        }
        // A failed renewal leaves `ttl - renew_interval` of lease. Teardown
        // waits out an unacked send and then the inbound drain in that time.
        if !mode.is_outer() {
            let left = self.activation.ttl - self.activation.renew_interval;
            let teardown = self.link.ack_timeout + self.drain_timeout;
            if left <= teardown {
                return Err(RelayError::Config(format!(
                    "lease ttl minus renew interval ({}s) must exceed ack timeout plus drain timeout ({}s)",
                    left.as_secs(),
                    teardown.as_secs()
                )));
            }
        }

        if mode.is_outer() {
            if self.broker.is_some() {
                return Err(RelayError::Config(format!("{mode} must not configure a broker")));
            }
            if !self.inbound.identities.is_empty() || self.inbound.trust_path.is_some() {
                return Err(RelayError::Config(format!(
                    "{mode} must not hold peer identities; they are pushed over the tunnel"
                )));
            }
            if self.inbound.listen.is_empty() {
                return Err(RelayError::Config(format!("{mode} needs inbound listen addresses")));
            }
        } else {
            self.validate_identities()?;
        }

        if (mode.is_inner() || mode.is_outer()) && self.tunnel.is_none() {
            return Err(RelayError::Config(format!("{mode} requires a [tunnel] section")));
        }
        if mode == FirewallMode::SenderReceiver && self.tunnel.is_some() {
            return Err(RelayError::Config("sender_receiver does not use a tunnel".into()));
        }
        Ok(())
    }

    fn validate_identities(&self) -> RelayResult<()> {
        let ids = &self.inbound.identities;
        if ids.is_empty() {
            return Err(RelayError::Config(format!(
                "{} requires at least one inbound identity",
                self.mode
            )));
        }
        if self.inbound.trust_path.is_none() {
            return Err(RelayError::Config("inbound trust roots are required".into()));
        }
        if ids.iter().filter(|id| id.default).count() > 1 {
            return Err(RelayError::Config("only one identity may be the default".into()));
        }
        let mut inboxes = std::collections::HashSet::new();
        for id in ids {
            if !relay_core::names::is_valid_queue_name(&id.inbox) {
                return Err(RelayError::Config(format!("invalid inbox '{}'", id.inbox)));
            }
            if !inboxes.insert(id.inbox.as_str()) {
                return Err(RelayError::Config(format!("inbox '{}' configured twice", id.inbox)));
            }
        }
        Ok(())
    }

    /// Identity used as client certificate on outbound connections.
    pub fn client_identity(&self) -> Option<&IdentityConfig> {
        let ids = &self.inbound.identities;
        ids.iter().find(|id| id.default).or_else(|| ids.first())
    }
}

fn parse_config_file(content: &str) -> RelayResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| RelayError::Config(format!("config parse error: {e}")))
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
