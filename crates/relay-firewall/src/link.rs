//! Outbound link: one worker moving one broker queue to one remote peer.
//!
//! ```text
//! Starting -> Connecting -> Connected -> Draining -> Closed
//!                 ^   |          |
//!                 |   v          |
//!               Retrying <-------+
//! ```
//!
//! Targets are tried in order; once the list is exhausted the link waits
//! out a backoff interval in `Retrying` and starts over. While connected it
//! consumes a single message, sends it, and settles it with the broker
//! before consuming the next one.

use relay_core::{BridgeEntry, HostPort};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::broker::Broker;
use crate::config::LinkSettings;
use crate::connector::{LinkConnector, PeerConnection, SendOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    Starting,
    Connecting,
    Connected,
    Retrying,
    Draining,
    Closed,
}

/// Point-in-time view of a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkStatus {
    pub queue: String,
    pub state: LinkState,
    /// Target of the current or last connection.
    pub target: Option<HostPort>,
    /// Retry intervals entered since the link started.
    pub retries: u32,
    /// When the current retry interval ends.
    pub next_retry_at: Option<Instant>,
    /// Messages sent and not yet answered (0 or 1).
    pub in_flight: usize,
}

/// Broadcast on every link state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEvent {
    pub queue: String,
    pub state: LinkState,
    pub target: Option<HostPort>,
}

/// Handle to a running link worker.
pub struct Link {
    entry: BridgeEntry,
    status_rx: watch::Receiver<LinkStatus>,
    shutdown_tx: watch::Sender<bool>,
    abort_tx: Arc<watch::Sender<bool>>,
    handle: JoinHandle<()>,
}

/// Stops a draining link without waiting for its peer. The in-flight
/// message, if any, goes back to the queue unacknowledged.
pub struct LinkAbort {
    queue: String,
    abort_tx: Arc<watch::Sender<bool>>,
    status_rx: watch::Receiver<LinkStatus>,
}

impl LinkAbort {
    pub fn abort(&self) {
        let _ = self.abort_tx.send(true);
    }

    pub fn is_closed(&self) -> bool {
        self.status_rx.borrow().state == LinkState::Closed
    }

    /// Wait until the worker has reported `Closed` or exited.
    pub async fn closed(&mut self) {
        if self.status_rx.wait_for(|s| s.state == LinkState::Closed).await.is_err() {
            debug!(queue = %self.queue, "link worker already gone");
        }
    }
}

impl Link {
    /// Start a link for `entry`. When `predecessor` is given, the new
    /// worker waits for it to finish so two links never serve one queue.
    pub fn spawn(
        entry: BridgeEntry,
        broker: Arc<dyn Broker>,
        connector: Arc<dyn LinkConnector>,
        settings: LinkSettings,
        events: broadcast::Sender<LinkEvent>,
        predecessor: Option<JoinHandle<()>>,
    ) -> Self {
        let status = LinkStatus {
            queue: entry.queue_name.clone(),
            state: LinkState::Starting,
            target: None,
            retries: 0,
            next_retry_at: None,
            in_flight: 0,
        };
        let (status_tx, status_rx) = watch::channel(status);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (abort_tx, abort_rx) = watch::channel(false);

        let worker = LinkWorker {
            backoff: Backoff::new(settings.backoff.clone()),
            entry: entry.clone(),
            broker,
            connector,
            settings,
            events,
            status_tx,
            shutdown_rx,
            abort_rx,
        };
        let handle = tokio::spawn(worker.run(predecessor));

        Self {
            entry,
            status_rx,
            shutdown_tx,
            abort_tx: Arc::new(abort_tx),
            handle,
        }
    }

    pub fn entry(&self) -> &BridgeEntry {
        &self.entry
    }

    pub fn status(&self) -> LinkStatus {
        self.status_rx.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<LinkStatus> {
        self.status_rx.clone()
    }

    /// Ask the worker to drain: any in-flight send is finished or timed
    /// out, then the connection is closed.
    pub fn begin_drain(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn abort_handle(&self) -> LinkAbort {
        LinkAbort {
            queue: self.entry.queue_name.clone(),
            abort_tx: self.abort_tx.clone(),
            status_rx: self.status_rx.clone(),
        }
    }

    /// Drain and hand back the worker task.
    pub fn into_handle(self) -> JoinHandle<()> {
        self.begin_drain();
        self.handle
    }

    /// Drain and wait until the link is `Closed`.
    pub async fn close(self) {
        let queue = self.entry.queue_name.clone();
        if let Err(e) = self.into_handle().await {
            warn!(queue = %queue, error = %e, "link worker ended abnormally");
        }
    }
}

enum PumpExit {
    Shutdown(Box<dyn PeerConnection>),
    Aborted,
    Failed,
}

struct LinkWorker {
    entry: BridgeEntry,
    broker: Arc<dyn Broker>,
    connector: Arc<dyn LinkConnector>,
    settings: LinkSettings,
    events: broadcast::Sender<LinkEvent>,
    status_tx: watch::Sender<LinkStatus>,
    shutdown_rx: watch::Receiver<bool>,
    abort_rx: watch::Receiver<bool>,
    backoff: Backoff,
}

impl LinkWorker {
    async fn run(mut self, predecessor: Option<JoinHandle<()>>) {
        if let Some(prev) = predecessor {
            let mut abort = self.abort_rx.clone();
            tokio::select! {
                _ = prev => {}
                _ = crate::stopped(&mut abort) => {}
            }
        }
        self.emit();
        info!(queue = %self.entry.queue_name, targets = self.entry.targets.len(), "link started");

        loop {
            if self.shutting_down() {
                break;
            }
            if !self.connector.is_ready() {
                self.pause().await;
                continue;
            }

            self.set_state(LinkState::Connecting, None);
            let Some((conn, target)) = self.connect_any().await else {
                if self.shutting_down() {
                    break;
                }
                if !self.connector.is_ready() {
                    continue;
                }
                if !self.wait_retry().await {
                    break;
                }
                continue;
            };

            self.backoff.reset();
            self.set_state(LinkState::Connected, Some(target.clone()));
            info!(queue = %self.entry.queue_name, target = %target, "link connected");

            match self.pump(conn).await {
                PumpExit::Shutdown(mut conn) => {
                    self.set_state(LinkState::Draining, None);
                    let mut abort = self.abort_rx.clone();
                    tokio::select! {
                        _ = conn.close() => {}
                        _ = crate::stopped(&mut abort) => {}
                    }
                    self.set_state(LinkState::Closed, None);
                    info!(queue = %self.entry.queue_name, "link closed");
                    return;
                }
                PumpExit::Aborted => break,
                PumpExit::Failed => {
                    if self.shutting_down() {
                        break;
                    }
                    if self.connector.is_ready() && !self.wait_retry().await {
                        break;
                    }
                }
            }
        }

        self.set_state(LinkState::Draining, None);
        self.set_state(LinkState::Closed, None);
        info!(queue = %self.entry.queue_name, "link closed");
    }

    fn shutting_down(&self) -> bool {
        *self.shutdown_rx.borrow() || *self.abort_rx.borrow()
    }

    /// Try each target once, in order.
    async fn connect_any(&mut self) -> Option<(Box<dyn PeerConnection>, HostPort)> {
        let mut shutdown = self.shutdown_rx.clone();
        for target in self.entry.targets.clone() {
            if self.shutting_down() || !self.connector.is_ready() {
                return None;
            }
            self.status_tx.send_modify(|s| s.target = Some(target.clone()));
            let attempt = timeout(
                self.settings.connect_timeout,
                self.connector.connect(&target, &self.entry),
            );
            let result = tokio::select! {
                r = attempt => r,
                _ = crate::stopped(&mut shutdown) => return None,
            };
            match result {
                Ok(Ok(conn)) => return Some((conn, target)),
                Ok(Err(e)) => warn!(
                    queue = %self.entry.queue_name,
                    target = %target,
                    error = %e,
                    transient = e.is_transient(),
                    "connect failed"
                ),
                Err(_) => warn!(
                    queue = %self.entry.queue_name,
                    target = %target,
                    timeout_ms = self.settings.connect_timeout.as_millis() as u64,
                    "connect timed out"
                ),
            }
        }
        None
    }

    /// Sit out one backoff interval. Returns false if shutdown arrived.
    async fn wait_retry(&mut self) -> bool {
        let delay = self.backoff.next_delay();
        let until = Instant::now() + delay;
        self.status_tx.send_modify(|s| {
            s.retries += 1;
            s.next_retry_at = Some(until);
        });
        self.set_state(LinkState::Retrying, None);
        debug!(
            queue = %self.entry.queue_name,
            delay_ms = delay.as_millis() as u64,
            "link retry scheduled"
        );

        let mut shutdown = self.shutdown_rx.clone();
        tokio::select! {
            _ = sleep(delay) => true,
            _ = crate::stopped(&mut shutdown) => false,
        }
    }

    /// The connector cannot reach anything right now (tunnel down): wait for
    /// it instead of burning retries.
    async fn pause(&mut self) {
        self.set_state(LinkState::Retrying, None);
        debug!(queue = %self.entry.queue_name, "link paused until connector is ready");
        let mut shutdown = self.shutdown_rx.clone();
        tokio::select! {
            _ = self.connector.wait_ready() => {}
            _ = crate::stopped(&mut shutdown) => {}
        }
    }

    async fn pump(&mut self, mut conn: Box<dyn PeerConnection>) -> PumpExit {
        let queue = self.entry.queue_name.clone();
        let mut shutdown = self.shutdown_rx.clone();
        let mut abort = self.abort_rx.clone();
        loop {
            let delivery = tokio::select! {
                biased;
                _ = crate::stopped(&mut abort) => return PumpExit::Aborted,
                _ = crate::stopped(&mut shutdown) => return PumpExit::Shutdown(conn),
                d = self.broker.consume(&queue) => d,
            };
            let delivery = match delivery {
                Ok(d) => d,
                Err(e) => {
                    warn!(queue = %queue, error = %e, "consume failed");
                    conn.close().await;
                    return PumpExit::Failed;
                }
            };

            let size = delivery.envelope.payload.len();
            if size > self.settings.max_message_size {
                warn!(
                    queue = %queue,
                    size,
                    max = self.settings.max_message_size,
                    "message exceeds maximum size, dropping"
                );
                if let Err(e) = self.broker.ack(&queue, delivery.id).await {
                    warn!(queue = %queue, error = %e, "ack of oversized message failed");
                }
                continue;
            }

            self.status_tx.send_modify(|s| s.in_flight = 1);
            let answer = tokio::select! {
                answer = timeout(self.settings.ack_timeout, conn.send(&delivery.envelope)) => answer,
                _ = crate::stopped(&mut abort) => {
                    self.status_tx.send_modify(|s| s.in_flight = 0);
                    warn!(queue = %queue, delivery = delivery.id, "link aborted with a message in flight, releasing it");
                    if let Err(e) = self.broker.release(&queue, delivery.id).await {
                        warn!(queue = %queue, error = %e, "release failed");
                    }
                    return PumpExit::Aborted;
                }
            };
            self.status_tx.send_modify(|s| s.in_flight = 0);

            let failure = match answer {
                Ok(Ok(SendOutcome::Accepted)) => {
                    debug!(queue = %queue, delivery = delivery.id, redelivered = delivery.redelivered, "message delivered");
                    match self.broker.ack(&queue, delivery.id).await {
                        Ok(()) => continue,
                        Err(e) => format!("broker ack failed: {e}"),
                    }
                }
                Ok(Ok(SendOutcome::Rejected(reason))) => {
                    warn!(queue = %queue, delivery = delivery.id, reason = %reason, "message rejected by peer, dropping");
                    match self.broker.ack(&queue, delivery.id).await {
                        Ok(()) => continue,
                        Err(e) => format!("broker ack failed: {e}"),
                    }
                }
                Ok(Err(e)) => {
                    if let Err(e) = self.broker.release(&queue, delivery.id).await {
                        warn!(queue = %queue, error = %e, "release failed");
                    }
                    format!("send failed: {e}")
                }
                Err(_) => {
                    if let Err(e) = self.broker.release(&queue, delivery.id).await {
                        warn!(queue = %queue, error = %e, "release failed");
                    }
                    format!("no answer within {}ms", self.settings.ack_timeout.as_millis())
                }
            };

            warn!(queue = %queue, reason = %failure, "link connection lost");
            conn.close().await;
            return PumpExit::Failed;
        }
    }

    fn set_state(&self, state: LinkState, target: Option<HostPort>) {
        self.status_tx.send_modify(|s| {
            s.state = state;
            if target.is_some() {
                s.target = target;
            }
            if state != LinkState::Retrying {
                s.next_retry_at = None;
            }
        });
        self.emit();
    }

    fn emit(&self) {
        let status = self.status_tx.borrow();
        let _ = self.events.send(LinkEvent {
            queue: status.queue.clone(),
            state: status.state,
            target: status.target.clone(),
        });
    }
}
