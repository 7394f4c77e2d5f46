//! A firewall instance: the components for one deployment mode, wired
//! together behind a single activation coordinator.
//!
//! | mode                | broker | lease | listener     | links        |
//! |---------------------|--------|-------|--------------|--------------|
//! | `sender_receiver`   | yes    | yes   | local        | direct TLS   |
//! | `*_inner`           | yes    | yes   | on the outer | via tunnel   |
//! | `*_outer`           | no     | no    | local        | dialled here |

use relay_core::{RelayError, RelayResult};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::info;

use crate::activation::{ActivationCoordinator, ActiveState, ActiveTransition, LeaseStore};
use crate::broker::Broker;
use crate::config::{FirewallConfig, FirewallMode};
use crate::connector::{LinkConnector, LoopbackConnector, TlsConnector};
use crate::control::ControlChannel;
use crate::inbox::{InboxRegistry, LocalIdentity};
use crate::link::{LinkEvent, LinkStatus};
use crate::listener::{BrokerSink, InboundListener, ListenerSettings};
use crate::tls::{load_identity, read_pem, tunnel_client_config, tunnel_server_config, PeerTls};
use crate::tunnel::{TunnelInner, TunnelServer};

pub struct Firewall {
    mode: FirewallMode,
    coordinator: Arc<ActivationCoordinator>,
    control: Option<Arc<ControlChannel>>,
    listener: Option<Arc<InboundListener>>,
    inner: Option<Arc<TunnelInner>>,
    outer: Option<Arc<TunnelServer>>,
    events: broadcast::Sender<LinkEvent>,
}

impl Firewall {
    /// Build the components for `config.mode`.
    ///
    /// Modes that hold the broker need `broker`. Without a `lease_store`
    /// the instance activates unconditionally.
    pub async fn new(
        config: FirewallConfig,
        broker: Option<Arc<dyn Broker>>,
        lease_store: Option<Arc<dyn LeaseStore>>,
    ) -> RelayResult<Self> {
        config.validate()?;
        let firewall = if config.mode.is_outer() {
            Self::wire_outer(&config)?
        } else if config.mode.is_inner() {
            Self::wire_inner(&config, broker, lease_store)?
        } else {
            Self::wire_sender_receiver(&config, broker, lease_store).await?
        };
        info!(mode = %config.mode, identity = %config.identity, "firewall configured");
        Ok(firewall)
    }

    async fn wire_sender_receiver(
        config: &FirewallConfig,
        broker: Option<Arc<dyn Broker>>,
        lease_store: Option<Arc<dyn LeaseStore>>,
    ) -> RelayResult<Self> {
        let broker = require_broker(config.mode, broker)?;
        let material = peer_material(config)?;
        let registry = Arc::new(InboxRegistry::new(
            material.identities.iter().map(LocalIdentity::from).collect(),
        ));

        let direct: Arc<dyn LinkConnector> = Arc::new(TlsConnector::new(material.client_config()?));
        let connector = Arc::new(LoopbackConnector::new(
            direct,
            broker.clone(),
            registry.clone(),
            config.public_addresses.clone(),
        ));
        let control = Arc::new(ControlChannel::new(
            config.identity.clone(),
            broker.clone(),
            connector,
            config.link.clone(),
            registry.clone(),
        ));
        let listener = Arc::new(InboundListener::new(
            config.inbound.listen.clone(),
            registry,
            Arc::new(BrokerSink::new(broker)),
            listener_settings(config),
        ));
        listener.set_tls(material.server_config()?).await;

        let coordinator = coordinator(config, lease_store);
        control.report_faults_to(coordinator.fault_reporter());
        coordinator.add_dependent(listener.clone());
        coordinator.add_dependent(control.clone());

        Ok(Self {
            mode: config.mode,
            coordinator,
            events: control.event_sender(),
            control: Some(control),
            listener: Some(listener),
            inner: None,
            outer: None,
        })
    }

    fn wire_inner(
        config: &FirewallConfig,
        broker: Option<Arc<dyn Broker>>,
        lease_store: Option<Arc<dyn LeaseStore>>,
    ) -> RelayResult<Self> {
        let broker = require_broker(config.mode, broker)?;
        let tunnel = require_tunnel(config)?;
        let material = peer_material(config)?;
        let registry = Arc::new(InboxRegistry::new(
            material.identities.iter().map(LocalIdentity::from).collect(),
        ));

        let inner = Arc::new(TunnelInner::new(
            tunnel,
            tunnel_client_config(tunnel)?,
            material,
            broker.clone(),
            config.link.clone(),
            config.drain_timeout,
        )?);
        let connector = Arc::new(LoopbackConnector::new(
            inner.connector(),
            broker.clone(),
            registry.clone(),
            config.public_addresses.clone(),
        ));
        let control = Arc::new(ControlChannel::new(
            config.identity.clone(),
            broker,
            connector,
            config.link.clone(),
            registry,
        ));

        let coordinator = coordinator(config, lease_store);
        inner.report_faults_to(coordinator.fault_reporter());
        control.report_faults_to(coordinator.fault_reporter());
        coordinator.add_dependent(inner.clone());
        coordinator.add_dependent(control.clone());

        Ok(Self {
            mode: config.mode,
            coordinator,
            events: control.event_sender(),
            control: Some(control),
            listener: None,
            inner: Some(inner),
            outer: None,
        })
    }

    fn wire_outer(config: &FirewallConfig) -> RelayResult<Self> {
        let tunnel = require_tunnel(config)?;
        let server = Arc::new(TunnelServer::new(
            tunnel.address.clone(),
            tunnel_server_config(tunnel)?,
            config.inbound.listen.clone(),
            listener_settings(config),
            config.link.clone(),
            config.activation.clone(),
        ));
        let (events, _) = broadcast::channel(16);
        Ok(Self {
            mode: config.mode,
            coordinator: server.coordinator(),
            control: None,
            listener: Some(server.listener()),
            inner: None,
            outer: Some(server),
            events,
        })
    }

    /// Start contending for activation (or, for the outer, start serving
    /// the tunnel and follow the inner peer).
    pub async fn start(&self) -> RelayResult<()> {
        if let Some(outer) = &self.outer {
            outer.start().await?;
        }
        if let (Some(inner), Some(control)) = (&self.inner, &self.control) {
            inner.start(control.desired()).await;
        }
        if !self.mode.is_outer() {
            self.coordinator.become_state(ActiveState::Active);
        }
        info!(mode = %self.mode, "firewall started");
        Ok(())
    }

    /// Step down, close links, stop listeners and the tunnel.
    pub async fn stop(&self) {
        self.coordinator.stop().await;
        if let Some(inner) = &self.inner {
            inner.stop().await;
        }
        if let Some(outer) = &self.outer {
            outer.stop().await;
        }
        if let Some(control) = &self.control {
            control.shutdown().await;
        }
        info!(mode = %self.mode, "firewall stopped");
    }

    pub fn mode(&self) -> FirewallMode {
        self.mode
    }

    pub fn active_state(&self) -> ActiveState {
        self.coordinator.current_state()
    }

    pub fn coordinator(&self) -> Arc<ActivationCoordinator> {
        self.coordinator.clone()
    }

    /// Activation transitions, starting with the current state.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ActiveTransition> {
        self.coordinator.subscribe()
    }

    pub fn link_events(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    pub async fn link_states(&self) -> Vec<LinkStatus> {
        match &self.control {
            Some(control) => control.link_states().await,
            None => Vec::new(),
        }
    }

    /// Bound public listener addresses; empty while passive.
    pub async fn listener_addrs(&self) -> Vec<SocketAddr> {
        match &self.listener {
            Some(listener) => listener.local_addrs().await,
            None => Vec::new(),
        }
    }

    pub async fn tunnel_addr(&self) -> Option<SocketAddr> {
        match &self.outer {
            Some(outer) => outer.local_addr().await,
            None => None,
        }
    }

    /// True once the first bridge snapshot since activation is applied.
    pub fn ready(&self) -> Option<watch::Receiver<bool>> {
        self.control.as_ref().map(|c| c.ready())
    }

    pub fn tunnel_server(&self) -> Option<&Arc<TunnelServer>> {
        self.outer.as_ref()
    }

    pub fn tunnel_client(&self) -> Option<&Arc<TunnelInner>> {
        self.inner.as_ref()
    }
}

fn require_broker(mode: FirewallMode, broker: Option<Arc<dyn Broker>>) -> RelayResult<Arc<dyn Broker>> {
    broker.ok_or_else(|| RelayError::Config(format!("{mode} needs a broker connection")))
}

fn require_tunnel(config: &FirewallConfig) -> RelayResult<&crate::config::TunnelConfig> {
    config
        .tunnel
        .as_ref()
        .ok_or_else(|| RelayError::Config(format!("{} requires a [tunnel] section", config.mode)))
}

fn peer_material(config: &FirewallConfig) -> RelayResult<PeerTls> {
    let identities = config
        .inbound
        .identities
        .iter()
        .map(load_identity)
        .collect::<RelayResult<Vec<_>>>()?;
    let trust_path = config
        .inbound
        .trust_path
        .as_ref()
        .ok_or_else(|| RelayError::Config("inbound trust roots are required".into()))?;
    Ok(PeerTls {
        identities,
        trust_roots_pem: read_pem(trust_path)?,
        enable_sni: config.inbound.enable_sni,
    })
}

fn listener_settings(config: &FirewallConfig) -> ListenerSettings {
    ListenerSettings {
        max_message_size: config.link.max_message_size,
        drain_timeout: config.drain_timeout,
        ..ListenerSettings::default()
    }
}

fn coordinator(config: &FirewallConfig, lease_store: Option<Arc<dyn LeaseStore>>) -> Arc<ActivationCoordinator> {
    let settings = config.activation.clone();
    Arc::new(match lease_store {
        Some(store) => ActivationCoordinator::new(settings, store),
        None => ActivationCoordinator::local(settings),
    })
}
