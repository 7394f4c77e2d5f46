//! Active/passive arbitration for redundant relay instances.
//!
//! One [`ActivationCoordinator`] per process owns the [`ActiveState`]. A
//! single worker task serializes every transition: dependents are started
//! before `Active` is published and stopped before `Passive` is published,
//! so no subscriber ever sees `Passive` while a link or listener of this
//! instance is still running.

pub mod lease;

pub use lease::{InMemoryLeaseStore, Lease, LeaseStore};

use async_trait::async_trait;
use relay_core::RelayResult;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::config::ActivationSettings;

/// Time kept back before lease expiry for aborting dependents, publishing
/// `Passive` and releasing the lease.
const STEP_DOWN_MARGIN: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActiveState {
    Active,
    Passive,
}

/// One published state change. `seq` increases by one per transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveTransition {
    pub seq: u64,
    pub state: ActiveState,
}

/// A component that may only run while this instance is active.
#[async_trait]
pub trait ActivationAware: Send + Sync {
    fn name(&self) -> &str;

    /// Start serving. An error aborts the activation attempt.
    async fn activate(&self) -> RelayResult<()>;

    /// Stop serving; returns once all work has stopped.
    async fn deactivate(&self);

    /// Stop at once, abandoning work still in flight. Called when
    /// `deactivate` would outlive the lease.
    async fn abort(&self) {
        self.deactivate().await
    }
}

/// Lets a component force its coordinator to step down.
#[derive(Clone)]
pub struct FaultReporter {
    cmd_tx: mpsc::WeakUnboundedSender<Command>,
}

impl FaultReporter {
    pub fn report(&self, reason: impl Into<String>) {
        if let Some(tx) = self.cmd_tx.upgrade() {
            let _ = tx.send(Command::Fault(reason.into()));
        }
    }
}

enum Command {
    Become(ActiveState),
    Fault(String),
    AddDependent(Arc<dyn ActivationAware>),
    Subscribe(mpsc::UnboundedSender<ActiveTransition>),
    Stop(oneshot::Sender<()>),
}

/// Handle to the coordinator worker.
pub struct ActivationCoordinator {
    cmd_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ActiveTransition>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ActivationCoordinator {
    /// Coordinator arbitrating through a shared lease store.
    pub fn new(settings: ActivationSettings, store: Arc<dyn LeaseStore>) -> Self {
        Self::spawn(settings, Some(store))
    }

    /// Coordinator that activates on request with no arbitration. Used by
    /// the outer process, which follows its inner peer.
    pub fn local(settings: ActivationSettings) -> Self {
        Self::spawn(settings, None)
    }

    fn spawn(settings: ActivationSettings, store: Option<Arc<dyn LeaseStore>>) -> Self {
        let initial = ActiveTransition {
            seq: 0,
            state: ActiveState::Passive,
        };
        let (state_tx, state_rx) = watch::channel(initial);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let worker = Worker {
            backoff: Backoff::new(settings.backoff.clone()),
            settings,
            store,
            dependents: Vec::new(),
            subscribers: Vec::new(),
            state_tx,
            current: initial,
            desired: ActiveState::Passive,
            lease: None,
            next_attempt: Instant::now(),
            next_renew: Instant::now(),
        };
        let handle = tokio::spawn(worker.run(cmd_rx));
        Self {
            cmd_tx,
            state_rx,
            worker: Mutex::new(Some(handle)),
        }
    }

    /// Ask to become active or passive. Returns immediately; observe the
    /// outcome through [`subscribe`](Self::subscribe).
    pub fn become_state(&self, desired: ActiveState) {
        let _ = self.cmd_tx.send(Command::Become(desired));
    }

    /// Force an immediate step-down; the instance contends again after
    /// backoff.
    pub fn report_fault(&self, reason: impl Into<String>) {
        let _ = self.cmd_tx.send(Command::Fault(reason.into()));
    }

    /// Handle for components that detect they can no longer serve.
    pub fn fault_reporter(&self) -> FaultReporter {
        FaultReporter {
            cmd_tx: self.cmd_tx.downgrade(),
        }
    }

    /// Register a component started on activation and stopped on
    /// deactivation. Dependents start in registration order and stop in
    /// reverse order.
    pub fn add_dependent(&self, dependent: Arc<dyn ActivationAware>) {
        let _ = self.cmd_tx.send(Command::AddDependent(dependent));
    }

    pub fn current_state(&self) -> ActiveState {
        self.state_rx.borrow().state
    }

    pub fn is_active(&self) -> bool {
        self.current_state() == ActiveState::Active
    }

    /// Stream of transitions, starting with the state current when the
    /// subscription is processed. Every later transition is delivered in
    /// order.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ActiveTransition> {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = self.cmd_tx.send(Command::Subscribe(tx));
        rx
    }

    /// Wait until the published state equals `state`.
    pub async fn wait_for(&self, state: ActiveState) {
        let mut rx = self.state_rx.clone();
        let _ = rx.wait_for(|t| t.state == state).await;
    }

    /// Step down, release the lease and stop the worker.
    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Stop(tx)).is_ok() {
            let _ = rx.await;
        }
        if let Some(handle) = self.worker.lock().await.take() {
            let _ = handle.await;
        }
    }
}

struct Worker {
    settings: ActivationSettings,
    store: Option<Arc<dyn LeaseStore>>,
    dependents: Vec<Arc<dyn ActivationAware>>,
    subscribers: Vec<mpsc::UnboundedSender<ActiveTransition>>,
    state_tx: watch::Sender<ActiveTransition>,
    current: ActiveTransition,
    desired: ActiveState,
    lease: Option<Lease>,
    backoff: Backoff,
    next_attempt: Instant,
    next_renew: Instant,
}

impl Worker {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
        loop {
            let running = self.current.state == ActiveState::Active;
            let wants_active = self.desired == ActiveState::Active;
            let deadline = if running { self.next_renew } else { self.next_attempt };

            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Become(ActiveState::Active)) => {
                        if self.desired != ActiveState::Active {
                            info!(lease = %self.settings.lease_name, "activation requested");
                            self.desired = ActiveState::Active;
                            self.backoff.reset();
                            self.next_attempt = Instant::now();
                        }
                    }
                    Some(Command::Become(ActiveState::Passive)) => {
                        self.desired = ActiveState::Passive;
                        self.step_down("deactivation requested").await;
                    }
                    Some(Command::Fault(reason)) => {
                        if self.current.state == ActiveState::Active {
                            self.step_down(&reason).await;
                            self.schedule_retry();
                        }
                    }
                    Some(Command::AddDependent(dep)) => self.add_dependent(dep).await,
                    Some(Command::Subscribe(tx)) => {
                        if tx.send(self.current).is_ok() {
                            self.subscribers.push(tx);
                        }
                    }
                    Some(Command::Stop(reply)) => {
                        self.desired = ActiveState::Passive;
                        self.step_down("coordinator stopping").await;
                        let _ = reply.send(());
                        break;
                    }
                    None => {
                        self.step_down("coordinator dropped").await;
                        break;
                    }
                },
                _ = sleep_until(deadline), if wants_active => {
                    if running {
                        self.renew().await;
                    } else {
                        self.try_activate().await;
                    }
                }
            }
        }
        debug!(lease = %self.settings.lease_name, "activation worker stopped");
    }

    /// Bound on a single lease store call while holding the lease. Leaves
    /// half of the renewal slack for stopping dependents before expiry.
    fn store_timeout(&self) -> Duration {
        let slack = self.settings.ttl.saturating_sub(self.settings.renew_interval) / 2;
        slack.max(Duration::from_millis(1))
    }

    fn schedule_retry(&mut self) {
        let delay = self.backoff.next_delay_with_jitter();
        debug!(delay_ms = delay.as_millis() as u64, "activation retry scheduled");
        self.next_attempt = Instant::now() + delay;
    }

    async fn try_activate(&mut self) {
        let lease = match &self.store {
            None => None,
            Some(store) => {
                let attempt = timeout(
                    self.settings.ttl,
                    store.try_acquire(&self.settings.lease_name, &self.settings.holder, self.settings.ttl),
                )
                .await;
                match attempt {
                    Ok(Ok(Some(lease))) => Some(lease),
                    Ok(Ok(None)) => {
                        debug!(lease = %self.settings.lease_name, "lease held elsewhere, staying passive");
                        self.next_attempt = Instant::now() + self.settings.poll_interval;
                        return;
                    }
                    Ok(Err(e)) => {
                        warn!(lease = %self.settings.lease_name, error = %e, "lease acquisition failed");
                        self.schedule_retry();
                        return;
                    }
                    Err(_) => {
                        warn!(lease = %self.settings.lease_name, "lease acquisition timed out");
                        self.schedule_retry();
                        return;
                    }
                }
            }
        };

        for (started, dep) in self.dependents.iter().enumerate() {
            if let Err(e) = dep.activate().await {
                warn!(component = dep.name(), error = %e, "activation failed, rolling back");
                for dep in self.dependents[..=started].iter().rev() {
                    dep.deactivate().await;
                }
                if let (Some(store), Some(lease)) = (&self.store, &lease) {
                    let _ = timeout(self.store_timeout(), store.release(lease)).await;
                }
                self.schedule_retry();
                return;
            }
        }

        if let Some(lease) = &lease {
            info!(lease = %lease.name, holder = %lease.holder, token = lease.token, "lease acquired");
        }
        self.lease = lease;
        self.backoff.reset();
        self.next_renew = Instant::now() + self.settings.renew_interval;
        self.publish(ActiveState::Active);
    }

    async fn renew(&mut self) {
        let (Some(store), Some(lease)) = (self.store.clone(), self.lease.clone()) else {
            // Local coordinators hold no lease.
            self.next_renew = Instant::now() + self.settings.renew_interval;
            return;
        };
        if Instant::now() >= lease.expires_at {
            self.step_down("lease expired before renewal").await;
            self.schedule_retry();
            return;
        }
        match timeout(self.store_timeout(), store.renew(&lease, self.settings.ttl)).await {
            Ok(Ok(Some(renewed))) => {
                debug!(lease = %renewed.name, "lease renewed");
                self.lease = Some(renewed);
                self.next_renew = Instant::now() + self.settings.renew_interval;
            }
            Ok(Ok(None)) => {
                self.step_down("lease lost").await;
                self.schedule_retry();
            }
            Ok(Err(e)) => {
                self.step_down(&format!("lease renewal failed: {e}")).await;
                self.schedule_retry();
            }
            Err(_) => {
                self.step_down("lease renewal timed out").await;
                self.schedule_retry();
            }
        }
    }

    /// Stop dependents, publish `Passive`, then release the lease.
    ///
    /// While a lease is held, teardown must finish before it expires:
    /// a dependent still stopping two margins before expiry is aborted,
    /// and the abort gets one margin.
    async fn step_down(&mut self, reason: &str) {
        if self.current.state != ActiveState::Active {
            return;
        }
        warn!(lease = %self.settings.lease_name, reason = %reason, "stepping down to passive");
        let abort_by = self.lease.as_ref().map(|lease| {
            lease
                .expires_at
                .checked_sub(STEP_DOWN_MARGIN)
                .unwrap_or_else(Instant::now)
        });
        for dep in self.dependents.iter().rev() {
            let Some(abort_by) = abort_by else {
                dep.deactivate().await;
                continue;
            };
            let deadline = abort_by.checked_sub(STEP_DOWN_MARGIN).unwrap_or(abort_by);
            if timeout_at(deadline, dep.deactivate()).await.is_err() {
                warn!(component = dep.name(), "teardown would outlive the lease, aborting");
                if timeout_at(abort_by, dep.abort()).await.is_err() {
                    warn!(component = dep.name(), "abort did not finish before lease expiry");
                }
            }
        }
        self.publish(ActiveState::Passive);
        if let (Some(store), Some(lease)) = (&self.store, self.lease.take()) {
            match timeout(self.store_timeout(), store.release(&lease)).await {
                Ok(Ok(())) => debug!(lease = %lease.name, "lease released"),
                Ok(Err(e)) => debug!(lease = %lease.name, error = %e, "lease release failed"),
                Err(_) => debug!(lease = %lease.name, "lease release timed out"),
            }
        }
    }

    async fn add_dependent(&mut self, dep: Arc<dyn ActivationAware>) {
        if self.current.state == ActiveState::Active {
            if let Err(e) = dep.activate().await {
                warn!(component = dep.name(), error = %e, "late dependent failed to start");
                self.dependents.push(dep);
                self.step_down("dependent failed to start").await;
                self.schedule_retry();
                return;
            }
        }
        self.dependents.push(dep);
    }

    fn publish(&mut self, state: ActiveState) {
        self.current = ActiveTransition {
            seq: self.current.seq + 1,
            state,
        };
        info!(state = ?state, seq = self.current.seq, "active state changed");
        let transition = self.current;
        self.state_tx.send_replace(transition);
        self.subscribers.retain(|tx| tx.send(transition).is_ok());
    }
}
