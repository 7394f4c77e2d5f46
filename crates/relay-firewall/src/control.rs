//! Control channel: turns the node's desired bridge state into links.
//!
//! A single worker owns the `queue -> Link` map. While active it consumes
//! the bridge control address; a snapshot is reconciled as a set
//! difference against the running links, and `Add`/`Remove` apply the same
//! rule to one entry. Other components talk to the worker through
//! commands only.

use async_trait::async_trait;
use relay_core::names::{BRIDGE_CONTROL, BRIDGE_NOTIFY};
use relay_core::{cbor_decode, cbor_encode, BridgeControl, BridgeEntry, Envelope, RelayError, RelayResult};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::activation::{ActivationAware, FaultReporter};
use crate::backoff::Backoff;
use crate::broker::Broker;
use crate::config::LinkSettings;
use crate::connector::LinkConnector;
use crate::inbox::InboxRegistry;
use crate::link::{Link, LinkAbort, LinkEvent, LinkStatus};
use crate::lock;

/// How long the control address may stay unreadable before the node
/// steps down.
const CONTROL_FAULT_AFTER: Duration = Duration::from_secs(30);

/// The node's desired state as last reconciled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredSnapshot {
    pub inboxes: Vec<String>,
    /// Valid entries keyed by queue name.
    pub entries: BTreeMap<String, BridgeEntry>,
}

enum Command {
    Activate(oneshot::Sender<RelayResult<()>>),
    Deactivate(oneshot::Sender<()>),
    Entries(oneshot::Sender<Vec<BridgeEntry>>),
    LinkStates(oneshot::Sender<Vec<LinkStatus>>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to the control channel worker.
pub struct ControlChannel {
    cmd_tx: mpsc::Sender<Command>,
    ready_rx: watch::Receiver<bool>,
    desired_rx: watch::Receiver<DesiredSnapshot>,
    events: broadcast::Sender<LinkEvent>,
    draining: Arc<StdMutex<Vec<LinkAbort>>>,
    faults: Arc<OnceLock<FaultReporter>>,
}

impl ControlChannel {
    pub fn new(
        identity: String,
        broker: Arc<dyn Broker>,
        connector: Arc<dyn LinkConnector>,
        settings: LinkSettings,
        registry: Arc<InboxRegistry>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let settings_backoff = settings.backoff.clone();
        let (ready_tx, ready_rx) = watch::channel(false);
        let (desired_tx, desired_rx) = watch::channel(DesiredSnapshot::default());
        let (events, _) = broadcast::channel(1024);
        let draining = Arc::new(StdMutex::new(Vec::new()));
        let faults = Arc::new(OnceLock::new());

        let worker = ControlWorker {
            identity,
            broker,
            connector,
            settings,
            registry,
            events: events.clone(),
            links: HashMap::new(),
            retired: HashMap::new(),
            draining: draining.clone(),
            faults: faults.clone(),
            consume_backoff: Backoff::new(settings_backoff),
            failing_since: None,
            retry_at: None,
            desired: BTreeMap::new(),
            ready_tx,
            desired_tx,
            active: false,
        };
        tokio::spawn(worker.run(cmd_rx));

        Self {
            cmd_tx,
            ready_rx,
            desired_rx,
            events,
            draining,
            faults,
        }
    }

    /// Report a control address that stays unreadable to `reporter`.
    pub fn report_faults_to(&self, reporter: FaultReporter) {
        if self.faults.set(reporter).is_err() {
            debug!("control channel fault reporter already set");
        }
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> RelayResult<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| RelayError::Other("control channel stopped".into()))?;
        rx.await
            .map_err(|_| RelayError::Other("control channel stopped".into()))
    }

    /// Valid entries currently desired.
    pub async fn entries(&self) -> Vec<BridgeEntry> {
        self.request(Command::Entries).await.unwrap_or_default()
    }

    /// Status of every running link, ordered by queue.
    pub async fn link_states(&self) -> Vec<LinkStatus> {
        self.request(Command::LinkStates).await.unwrap_or_default()
    }

    pub fn link_events(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    /// Sender side of the link event stream, shared with tunnel links.
    pub fn event_sender(&self) -> broadcast::Sender<LinkEvent> {
        self.events.clone()
    }

    /// True once the first snapshot since activation has been reconciled.
    pub fn ready(&self) -> watch::Receiver<bool> {
        self.ready_rx.clone()
    }

    pub fn desired(&self) -> watch::Receiver<DesiredSnapshot> {
        self.desired_rx.clone()
    }

    /// Close every link and stop the worker.
    pub async fn shutdown(&self) {
        let _ = self.request(Command::Shutdown).await;
    }
}

#[async_trait]
impl ActivationAware for ControlChannel {
    fn name(&self) -> &str {
        "control-channel"
    }

    async fn activate(&self) -> RelayResult<()> {
        self.request(Command::Activate).await?
    }

    async fn deactivate(&self) {
        let _ = self.request(Command::Deactivate).await;
    }

    async fn abort(&self) {
        let mut pending = std::mem::take(&mut *lock(&self.draining));
        if pending.is_empty() {
            return;
        }
        warn!(links = pending.len(), "aborting links still draining");
        for link in &pending {
            link.abort();
        }
        for link in &mut pending {
            link.closed().await;
        }
    }
}

struct ControlWorker {
    identity: String,
    broker: Arc<dyn Broker>,
    connector: Arc<dyn LinkConnector>,
    settings: LinkSettings,
    registry: Arc<InboxRegistry>,
    events: broadcast::Sender<LinkEvent>,
    links: HashMap<String, Link>,
    /// Workers of removed links that may still be draining, by queue.
    retired: HashMap<String, JoinHandle<()>>,
    /// Abort handles of every link told to drain, shared with the handle.
    draining: Arc<StdMutex<Vec<LinkAbort>>>,
    faults: Arc<OnceLock<FaultReporter>>,
    consume_backoff: Backoff,
    failing_since: Option<Instant>,
    retry_at: Option<Instant>,
    desired: BTreeMap<String, BridgeEntry>,
    ready_tx: watch::Sender<bool>,
    desired_tx: watch::Sender<DesiredSnapshot>,
    active: bool,
}

impl ControlWorker {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        loop {
            let consuming = self.active && self.retry_at.is_none();
            let retry_at = self.retry_at;
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Activate(reply)) => {
                        let result = self.activate().await;
                        let _ = reply.send(result);
                    }
                    Some(Command::Deactivate(reply)) => {
                        let drains = self.deactivate();
                        // Drains finish off the worker so status queries
                        // stay answerable meanwhile.
                        tokio::spawn(async move {
                            for handle in drains {
                                let _ = handle.await;
                            }
                            let _ = reply.send(());
                        });
                    }
                    Some(Command::Entries(reply)) => {
                        let _ = reply.send(self.desired.values().cloned().collect());
                    }
                    Some(Command::LinkStates(reply)) => {
                        let mut states: Vec<LinkStatus> = self.links.values().map(Link::status).collect();
                        states.sort_by(|a, b| a.queue.cmp(&b.queue));
                        let _ = reply.send(states);
                    }
                    Some(Command::Shutdown(reply)) => {
                        for handle in self.deactivate() {
                            let _ = handle.await;
                        }
                        let _ = reply.send(());
                        break;
                    }
                    None => {
                        for handle in self.deactivate() {
                            let _ = handle.await;
                        }
                        break;
                    }
                },
                delivery = self.broker.consume(BRIDGE_CONTROL), if consuming => match delivery {
                    Ok(delivery) => {
                        self.consume_recovered();
                        self.handle_control(&delivery.envelope).await;
                        if let Err(e) = self.broker.ack(BRIDGE_CONTROL, delivery.id).await {
                            warn!(error = %e, "ack of control message failed");
                        }
                    }
                    Err(e) => self.consume_failed(e),
                },
                _ = sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    self.retry_at = None;
                }
            }
        }
        debug!("control channel stopped");
    }

    fn consume_failed(&mut self, e: RelayError) {
        let now = Instant::now();
        let since = *self.failing_since.get_or_insert(now);
        let delay = self.consume_backoff.next_delay();
        warn!(error = %e, retry_in = ?delay, "control queue consume failed");
        self.retry_at = Some(now + delay);
        if now.duration_since(since) >= CONTROL_FAULT_AFTER {
            if let Some(faults) = self.faults.get() {
                error!(failing_for = ?now.duration_since(since), "control address unreadable, stepping down");
                faults.report(format!("control address unreadable: {e}"));
                // Reported once per outage; the next activation starts afresh.
                self.failing_since = None;
                self.consume_backoff.reset();
            }
        }
    }

    fn consume_recovered(&mut self) {
        if self.failing_since.take().is_some() {
            info!("control queue readable again");
        }
        self.consume_backoff.reset();
    }

    fn reset_consume(&mut self) {
        self.failing_since = None;
        self.retry_at = None;
        self.consume_backoff.reset();
    }

    /// Hand a link to the drain list and return its worker.
    fn retire(&self, link: Link) -> JoinHandle<()> {
        let mut draining = lock(&self.draining);
        draining.retain(|l| !l.is_closed());
        draining.push(link.abort_handle());
        link.into_handle()
    }

    async fn activate(&mut self) -> RelayResult<()> {
        if self.active {
            return Ok(());
        }
        self.reset_consume();
        self.broker.create_queue(BRIDGE_CONTROL).await?;
        self.broker.create_queue(BRIDGE_NOTIFY).await?;
        let request = BridgeControl::SnapshotRequest {
            bridge_identity: self.identity.clone(),
        };
        self.broker
            .publish(BRIDGE_NOTIFY, Envelope::new(cbor_encode(&request)?))
            .await?;
        self.active = true;
        info!(identity = %self.identity, "control channel active, snapshot requested");
        Ok(())
    }

    /// Stop consuming and begin draining every link. Returns the workers
    /// to wait for.
    fn deactivate(&mut self) -> Vec<JoinHandle<()>> {
        if self.active {
            info!(links = self.links.len(), "control channel deactivating");
        }
        self.active = false;
        self.reset_consume();
        self.ready_tx.send_replace(false);
        let links: Vec<Link> = self.links.drain().map(|(_, link)| link).collect();
        let mut drains: Vec<JoinHandle<()>> = links.into_iter().map(|link| self.retire(link)).collect();
        drains.extend(self.retired.drain().map(|(_, handle)| handle));
        drains
    }

    async fn handle_control(&mut self, envelope: &Envelope) {
        let msg: BridgeControl = match cbor_decode(&envelope.payload) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "undecodable control message dropped");
                return;
            }
        };
        match msg {
            BridgeControl::Snapshot {
                node_identity,
                inboxes,
                entries,
            } => {
                info!(node = %node_identity, entries = entries.len(), inboxes = inboxes.len(), "snapshot received");
                self.apply_snapshot(inboxes, entries).await;
            }
            BridgeControl::Add { node_identity, entry } => {
                debug!(node = %node_identity, queue = %entry.queue_name, "add received");
                self.apply_add(entry).await;
            }
            BridgeControl::Remove {
                node_identity,
                queue_name,
            } => {
                debug!(node = %node_identity, queue = %queue_name, "remove received");
                self.apply_remove(&queue_name);
            }
            BridgeControl::SnapshotRequest { bridge_identity } => {
                debug!(bridge = %bridge_identity, "ignoring snapshot request on control address");
            }
        }
    }

    async fn apply_snapshot(&mut self, inboxes: Vec<String>, entries: Vec<BridgeEntry>) {
        let mut wanted = BTreeMap::new();
        for entry in entries {
            match entry.validate() {
                Ok(()) => {
                    if wanted.insert(entry.queue_name.clone(), entry).is_some() {
                        warn!("duplicate queue in snapshot, keeping the last entry");
                    }
                }
                Err(e) => warn!(queue = %entry.queue_name, error = %e, "rejecting bridge entry"),
            }
        }

        let stale: Vec<String> = self
            .desired
            .keys()
            .filter(|q| !wanted.contains_key(*q))
            .cloned()
            .collect();
        for queue in stale {
            self.apply_remove(&queue);
        }
        for entry in wanted.into_values() {
            self.apply_add(entry).await;
        }

        self.registry.set_inboxes(inboxes);
        self.publish_desired();
        if !*self.ready_tx.borrow() {
            info!(links = self.links.len(), "initial snapshot reconciled");
            self.ready_tx.send_replace(true);
        }
    }

    async fn apply_add(&mut self, entry: BridgeEntry) {
        if let Err(e) = entry.validate() {
            warn!(queue = %entry.queue_name, error = %e, "rejecting bridge entry");
            return;
        }
        let queue = entry.queue_name.clone();
        if self.desired.get(&queue) == Some(&entry) && self.links.contains_key(&queue) {
            return;
        }
        if let Err(e) = self.broker.create_queue(&queue).await {
            warn!(queue = %queue, error = %e, "cannot create link queue");
        }

        // A new link for a queue starts only after the previous one for the
        // same queue, running or retired, has closed.
        let predecessor = match self.links.remove(&queue) {
            Some(old) => {
                info!(queue = %queue, "bridge entry changed, replacing link");
                Some(self.retire(old))
            }
            None => {
                info!(queue = %queue, targets = entry.targets.len(), "bridge entry added");
                self.retired.remove(&queue).filter(|h| !h.is_finished())
            }
        };
        self.desired.insert(queue.clone(), entry.clone());
        let link = Link::spawn(
            entry,
            self.broker.clone(),
            self.connector.clone(),
            self.settings.clone(),
            self.events.clone(),
            predecessor,
        );
        self.links.insert(queue, link);
        self.publish_desired();
    }

    fn apply_remove(&mut self, queue: &str) {
        self.desired.remove(queue);
        if let Some(link) = self.links.remove(queue) {
            info!(queue = %queue, "bridge entry removed, draining link");
            self.retired.retain(|_, h| !h.is_finished());
            let handle = self.retire(link);
            self.retired.insert(queue.to_string(), handle);
        }
        self.publish_desired();
    }

    fn publish_desired(&self) {
        let snapshot = DesiredSnapshot {
            inboxes: self.registry.inboxes(),
            entries: self.desired.clone(),
        };
        self.desired_tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::{ActivationCoordinator, ActiveState, InMemoryLeaseStore};
    use crate::broker::InMemoryBroker;
    use crate::config::ActivationSettings;
    use crate::link::tests::{test_settings, MockConnector};
    use crate::broker::Delivery;
    use crate::link::LinkState;
    use relay_core::HostPort;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicBool, Ordering};

    const NODE: &str = "O=Bank A, L=London, C=GB";

    fn entry(queue: &str, host: &str) -> BridgeEntry {
        BridgeEntry::new(queue, vec![HostPort::new(host, 10005)], ["O=Peer".to_string()])
    }

    async fn send(broker: &InMemoryBroker, msg: &BridgeControl) {
        broker
            .publish(BRIDGE_CONTROL, Envelope::new(cbor_encode(msg).unwrap()))
            .await
            .unwrap();
    }

    fn snapshot(entries: Vec<BridgeEntry>) -> BridgeControl {
        BridgeControl::Snapshot {
            node_identity: NODE.into(),
            inboxes: vec!["p2p.inbound.bankA".into()],
            entries,
        }
    }

    /// Fails every consume on the control address while `broken` is set.
    struct Unreadable {
        inner: Arc<InMemoryBroker>,
        broken: AtomicBool,
    }

    #[async_trait]
    impl Broker for Unreadable {
        async fn create_queue(&self, queue: &str) -> RelayResult<()> {
            self.inner.create_queue(queue).await
        }

        async fn queue_exists(&self, queue: &str) -> RelayResult<bool> {
            self.inner.queue_exists(queue).await
        }

        async fn list_queues(&self, prefix: &str) -> RelayResult<Vec<String>> {
            self.inner.list_queues(prefix).await
        }

        async fn publish(&self, queue: &str, envelope: Envelope) -> RelayResult<()> {
            self.inner.publish(queue, envelope).await
        }

        async fn consume(&self, queue: &str) -> RelayResult<Delivery> {
            if queue == BRIDGE_CONTROL && self.broken.load(Ordering::SeqCst) {
                return Err(RelayError::Broker("control address unavailable".into()));
            }
            self.inner.consume(queue).await
        }

        async fn ack(&self, queue: &str, delivery_id: u64) -> RelayResult<()> {
            self.inner.ack(queue, delivery_id).await
        }

        async fn release(&self, queue: &str, delivery_id: u64) -> RelayResult<()> {
            self.inner.release(queue, delivery_id).await
        }
    }

    fn lease_settings(holder: &str) -> ActivationSettings {
        let mut settings = ActivationSettings::new("relay", holder);
        settings.ttl = Duration::from_secs(9);
        settings.renew_interval = Duration::from_secs(3);
        settings
    }

    fn channel_with(broker: Arc<dyn Broker>, connector: Arc<MockConnector>, settings: LinkSettings) -> ControlChannel {
        ControlChannel::new(
            NODE.into(),
            broker,
            connector,
            settings,
            Arc::new(InboxRegistry::default()),
        )
    }

    async fn active_channel() -> (Arc<InMemoryBroker>, ControlChannel) {
        let broker = Arc::new(InMemoryBroker::new());
        let connector = Arc::new(MockConnector::new(broker.clone()));
        let channel = channel_with(broker.clone(), connector, test_settings());
        channel.activate().await.unwrap();
        (broker, channel)
    }

    async fn link_queues(channel: &ControlChannel) -> BTreeSet<String> {
        channel.link_states().await.into_iter().map(|s| s.queue).collect()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn activation_requests_a_snapshot() {
        let (broker, channel) = active_channel().await;
        let requests = broker.snapshot(BRIDGE_NOTIFY).await;
        assert_eq!(requests.len(), 1);
        let msg: BridgeControl = cbor_decode(&requests[0].payload).unwrap();
        assert_eq!(
            msg,
            BridgeControl::SnapshotRequest {
                bridge_identity: NODE.into()
            }
        );
        assert!(!*channel.ready().borrow());

        send(&broker, &snapshot(vec![entry("internal.peers.b", "b")])).await;
        let mut ready = channel.ready();
        ready.wait_for(|r| *r).await.unwrap();
        channel.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn snapshots_converge_regardless_of_diffs() {
        let (broker, channel) = active_channel().await;
        send(&broker, &snapshot(vec![entry("q.a", "a"), entry("q.b", "b"), entry("q.c", "c")])).await;
        send(&broker, &BridgeControl::Add { node_identity: NODE.into(), entry: entry("q.d", "d") }).await;
        send(&broker, &BridgeControl::Remove { node_identity: NODE.into(), queue_name: "q.a".into() }).await;
        send(&broker, &BridgeControl::Add { node_identity: NODE.into(), entry: entry("q.e", "e") }).await;
        settle().await;
        assert_eq!(
            link_queues(&channel).await,
            ["q.b", "q.c", "q.d", "q.e"].iter().map(|s| s.to_string()).collect()
        );

        send(&broker, &snapshot(vec![entry("q.b", "b"), entry("q.f", "f")])).await;
        settle().await;
        let expected: BTreeSet<String> = ["q.b", "q.f"].iter().map(|s| s.to_string()).collect();
        assert_eq!(link_queues(&channel).await, expected);
        let desired: BTreeSet<String> = channel.entries().await.into_iter().map(|e| e.queue_name).collect();
        assert_eq!(desired, expected);
        channel.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unchanged_entry_keeps_its_link() {
        let (broker, channel) = active_channel().await;
        let mut events = channel.link_events();
        send(&broker, &snapshot(vec![entry("q.a", "a")])).await;
        settle().await;
        send(&broker, &snapshot(vec![entry("q.a", "a")])).await;
        settle().await;

        let started = std::iter::from_fn(|| events.try_recv().ok())
            .filter(|e| e.state == LinkState::Starting)
            .count();
        assert_eq!(started, 1);
        channel.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn changed_entry_supersedes_link() {
        let (broker, channel) = active_channel().await;
        send(&broker, &snapshot(vec![entry("q.a", "old-host")])).await;
        settle().await;
        send(&broker, &BridgeControl::Add { node_identity: NODE.into(), entry: entry("q.a", "new-host") }).await;
        settle().await;

        let states = channel.link_states().await;
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].target, Some(HostPort::new("new-host", 10005)));
        assert_eq!(states[0].state, LinkState::Connected);
        channel.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_entries_are_rejected_individually() {
        let (broker, channel) = active_channel().await;
        let bad = BridgeEntry::new("q.bad", vec![], ["O=Peer".to_string()]);
        send(&broker, &snapshot(vec![entry("q.good", "g"), bad])).await;
        broker
            .publish(BRIDGE_CONTROL, Envelope::new(b"not cbor".to_vec()))
            .await
            .unwrap();
        settle().await;

        assert_eq!(
            link_queues(&channel).await,
            ["q.good".to_string()].into_iter().collect()
        );
        assert_eq!(broker.depth(BRIDGE_CONTROL).await, 0);
        assert_eq!(broker.unacked(BRIDGE_CONTROL).await, 0);
        channel.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn lease_loss_closes_links_before_passive() {
        let (broker, channel) = active_channel().await;
        let channel = Arc::new(channel);
        channel.deactivate().await;

        let store = Arc::new(InMemoryLeaseStore::new());
        let coord = ActivationCoordinator::new(lease_settings("a"), store.clone());
        coord.add_dependent(channel.clone());
        let mut link_events = channel.link_events();
        let mut states = coord.subscribe();
        assert_eq!(states.recv().await.unwrap().state, ActiveState::Passive);

        coord.become_state(ActiveState::Active);
        assert_eq!(states.recv().await.unwrap().state, ActiveState::Active);
        send(&broker, &snapshot(vec![entry("q.a", "a"), entry("q.b", "b")])).await;
        settle().await;
        let connected: Vec<LinkState> = channel.link_states().await.into_iter().map(|s| s.state).collect();
        assert_eq!(connected, vec![LinkState::Connected, LinkState::Connected]);

        store.set_unavailable(true);
        assert_eq!(states.recv().await.unwrap().state, ActiveState::Passive);

        // Everything the links emitted was sent before passive was published.
        let closed: BTreeSet<String> = std::iter::from_fn(|| link_events.try_recv().ok())
            .filter(|e| e.state == LinkState::Closed)
            .map(|e| e.queue)
            .collect();
        assert_eq!(closed, ["q.a", "q.b"].iter().map(|s| s.to_string()).collect());
        assert!(channel.link_states().await.is_empty());
        coord.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn readded_queue_waits_for_the_retired_link() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.create_queue("q.a").await.unwrap();
        for m in ["m1", "m2"] {
            broker.publish("q.a", Envelope::new(m.as_bytes().to_vec())).await.unwrap();
        }
        let connector = Arc::new(MockConnector::new(broker.clone()));
        connector.hang_first.store(true, Ordering::SeqCst);
        let channel = channel_with(broker.clone(), connector.clone(), test_settings());
        channel.activate().await.unwrap();

        send(&broker, &snapshot(vec![entry("q.a", "a")])).await;
        settle().await;
        assert_eq!(broker.unacked("q.a").await, 1);

        // The first link is stuck on m1 until its ack timeout.
        send(&broker, &BridgeControl::Remove { node_identity: NODE.into(), queue_name: "q.a".into() }).await;
        send(&broker, &BridgeControl::Add { node_identity: NODE.into(), entry: entry("q.a", "a") }).await;
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(connector.delivered(), vec![b"m1".to_vec(), b"m2".to_vec()]);
        assert_eq!(connector.max_unacked_seen.load(Ordering::SeqCst), 1);
        assert_eq!(broker.depth("q.a").await, 0);
        assert_eq!(broker.unacked("q.a").await, 0);
        channel.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn abort_releases_messages_of_draining_links() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.create_queue("q.a").await.unwrap();
        broker.publish("q.a", Envelope::new(b"m1".to_vec())).await.unwrap();
        let connector = Arc::new(MockConnector::new(broker.clone()));
        connector.hang_first.store(true, Ordering::SeqCst);
        let mut settings = test_settings();
        settings.ack_timeout = Duration::from_secs(600);
        let channel = channel_with(broker.clone(), connector.clone(), settings);
        channel.activate().await.unwrap();

        send(&broker, &snapshot(vec![entry("q.a", "a")])).await;
        settle().await;
        assert_eq!(broker.unacked("q.a").await, 1);

        let drained = tokio::time::timeout(Duration::from_secs(5), channel.deactivate()).await;
        assert!(drained.is_err());
        channel.abort().await;

        assert!(connector.delivered().is_empty());
        assert_eq!(broker.unacked("q.a").await, 0);
        assert_eq!(broker.depth("q.a").await, 1);
        assert!(channel.link_states().await.is_empty());
        channel.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unreadable_control_address_steps_down() {
        let inner = Arc::new(InMemoryBroker::new());
        let broker = Arc::new(Unreadable {
            inner: inner.clone(),
            broken: AtomicBool::new(true),
        });
        let connector = Arc::new(MockConnector::new(inner.clone()));
        let channel = Arc::new(channel_with(broker, connector, test_settings()));
        let coord = ActivationCoordinator::new(lease_settings("a"), Arc::new(InMemoryLeaseStore::new()));
        channel.report_faults_to(coord.fault_reporter());
        coord.add_dependent(channel.clone());
        let mut states = coord.subscribe();
        assert_eq!(states.recv().await.unwrap().state, ActiveState::Passive);

        coord.become_state(ActiveState::Active);
        assert_eq!(states.recv().await.unwrap().state, ActiveState::Active);
        let since = Instant::now();
        assert_eq!(states.recv().await.unwrap().state, ActiveState::Passive);
        assert!(since.elapsed() >= CONTROL_FAULT_AFTER);
        assert!(since.elapsed() < CONTROL_FAULT_AFTER * 2);
        coord.stop().await;
    }
}
