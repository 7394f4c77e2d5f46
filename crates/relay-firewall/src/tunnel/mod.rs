//! Tunnel between the inner and outer halves of a split deployment.
//!
//! One mutually authenticated TLS stream carries a control channel (state,
//! activation, link lifecycle) and a data channel (envelopes and their
//! acknowledgements).

pub mod inner;
pub mod mux;
pub mod outer;

pub use inner::{TunnelConnector, TunnelInner};
pub use mux::{TunnelMux, TunnelReceivers, TunnelSender};
pub use outer::{TunnelServer, TunnelStats};

/// Room for framing and properties on top of the largest payload.
const FRAME_OVERHEAD: usize = 64 * 1024;

fn frame_limit(max_message_size: usize) -> usize {
    max_message_size.saturating_add(FRAME_OVERHEAD)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::{ActivationAware, ActiveState};
    use crate::broker::InMemoryBroker;
    use crate::config::{ActivationSettings, TunnelConfig};
    use crate::control::DesiredSnapshot;
    use crate::link::tests::test_settings;
    use crate::listener::ListenerSettings;
    use crate::tls::test_pki::TestCa;
    use crate::tls::{self, PeerTls};
    use relay_core::{BridgeEntry, HostPort};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::watch;

    const SERVER_NAME: &str = "float.relay.internal";

    struct Pair {
        outer: TunnelServer,
        inner: TunnelInner,
        desired_tx: watch::Sender<DesiredSnapshot>,
    }

    fn snapshot(queues: &[&str]) -> DesiredSnapshot {
        DesiredSnapshot {
            inboxes: vec!["p2p.inbound.bank-a".into()],
            entries: queues
                .iter()
                .map(|q| {
                    let entry = BridgeEntry::new(*q, vec![HostPort::new("127.0.0.1", 1)], ["O=Bank B".to_string()]);
                    (q.to_string(), entry)
                })
                .collect(),
        }
    }

    async fn pair(initial: DesiredSnapshot) -> Pair {
        let ca = TestCa::new();
        let (server_cert, server_key) = ca.issue(&[SERVER_NAME]);
        let (client_cert, client_key) = ca.issue(&["inner.relay.internal"]);
        let server_tls = tls::server_config(&server_cert, &server_key, &ca.pem()).unwrap();
        let client_tls = tls::client_config(&client_cert, &client_key, &ca.pem()).unwrap();

        let listener_settings = ListenerSettings {
            drain_timeout: Duration::from_secs(1),
            ..ListenerSettings::default()
        };
        let outer = TunnelServer::new(
            "127.0.0.1:0".into(),
            server_tls,
            vec!["127.0.0.1:0".into()],
            listener_settings,
            test_settings(),
            ActivationSettings::new("outer", "outer-test"),
        );
        let addr = outer.start().await.unwrap();

        let mut identity = ca.identity("O=Bank A, L=London, C=GB", "p2p.inbound.bank-a", &[]);
        identity.default = true;
        let material = PeerTls {
            identities: vec![identity],
            trust_roots_pem: ca.pem(),
            enable_sni: true,
        };
        let tunnel = TunnelConfig {
            address: addr.to_string(),
            cert_path: "unused".into(),
            key_path: "unused".into(),
            trust_path: "unused".into(),
            server_name: SERVER_NAME.into(),
        };
        let inner = TunnelInner::new(
            &tunnel,
            client_tls,
            material,
            Arc::new(InMemoryBroker::new()),
            test_settings(),
            Duration::from_secs(1),
        )
        .unwrap();

        let (desired_tx, desired_rx) = watch::channel(initial);
        inner.start(desired_rx).await;
        Pair {
            outer,
            inner,
            desired_tx,
        }
    }

    async fn eventually(what: &str, check: impl Fn() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !check() {
            assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn reconnect_resends_the_full_snapshot() {
        let p = pair(snapshot(&["internal.peers.b1", "internal.peers.b2"])).await;

        eventually("first snapshot", || p.outer.stats().snapshots == 1).await;
        assert_eq!(p.outer.routing_entries().len(), 2);
        assert_eq!(p.outer.routing_inboxes(), vec!["p2p.inbound.bank-a".to_string()]);
        assert!(p.outer.registry().has_inbox("p2p.inbound.bank-a"));

        p.outer.kick();
        eventually("second snapshot", || p.outer.stats().snapshots == 2).await;

        let stats = p.outer.stats();
        assert_eq!(stats.sessions, 2);
        assert_eq!(stats.diffs, 0);
        let queues: Vec<_> = p
            .outer
            .routing_entries()
            .into_iter()
            .map(|e| e.queue_name)
            .collect();
        assert_eq!(queues, vec!["internal.peers.b1", "internal.peers.b2"]);

        p.inner.stop().await;
        p.outer.stop().await;
    }

    #[tokio::test]
    async fn later_changes_travel_as_diffs() {
        let p = pair(snapshot(&["internal.peers.b1"])).await;
        eventually("first snapshot", || p.outer.stats().snapshots == 1).await;

        p.desired_tx
            .send(snapshot(&["internal.peers.b2", "internal.peers.b3"]))
            .unwrap();
        eventually("diffs applied", || p.outer.stats().diffs == 3).await;

        let queues: Vec<_> = p
            .outer
            .routing_entries()
            .into_iter()
            .map(|e| e.queue_name)
            .collect();
        assert_eq!(queues, vec!["internal.peers.b2", "internal.peers.b3"]);
        assert_eq!(p.outer.stats().snapshots, 1);

        p.inner.stop().await;
        p.outer.stop().await;
    }

    #[tokio::test]
    async fn outer_follows_inner_activation() {
        let p = pair(snapshot(&[])).await;
        p.inner.wait_connected().await;

        p.inner.activate().await.unwrap();
        tokio::time::timeout(
            Duration::from_secs(10),
            p.outer.coordinator().wait_for(ActiveState::Active),
        )
        .await
        .unwrap();
        assert!(p.outer.listener().is_running().await);
        assert_eq!(p.outer.listener().local_addrs().await.len(), 1);

        p.inner.deactivate().await;
        assert_eq!(p.outer.coordinator().current_state(), ActiveState::Passive);
        assert!(!p.outer.listener().is_running().await);

        p.inner.stop().await;
        p.outer.stop().await;
    }

    #[tokio::test]
    async fn losing_the_tunnel_makes_the_outer_passive() {
        let p = pair(snapshot(&["internal.peers.b1"])).await;
        p.inner.wait_connected().await;
        p.inner.activate().await.unwrap();
        tokio::time::timeout(
            Duration::from_secs(10),
            p.outer.coordinator().wait_for(ActiveState::Active),
        )
        .await
        .unwrap();

        p.inner.stop().await;
        tokio::time::timeout(
            Duration::from_secs(10),
            p.outer.coordinator().wait_for(ActiveState::Passive),
        )
        .await
        .unwrap();
        eventually("routing cleared", || p.outer.routing_entries().is_empty()).await;
        assert!(!p.outer.listener().is_running().await);
        assert!(p.outer.registry().inboxes().is_empty());

        p.outer.stop().await;
    }
}
