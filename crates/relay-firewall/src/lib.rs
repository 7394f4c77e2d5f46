//! P2P firewall relay.
//!
//! Bridges broker queues to mutually authenticated TLS peers. A single
//! process can do both directions, or the work can be split between an
//! inner process next to the broker and an outer process in the DMZ.

pub mod activation;
pub mod backoff;
pub mod broker;
pub mod config;
pub mod connector;
pub mod control;
pub mod firewall;
pub mod inbox;
pub mod link;
pub mod listener;
pub mod tls;
pub mod tunnel;

pub use activation::{ActivationAware, ActivationCoordinator, ActiveState, ActiveTransition};
pub use config::{FirewallConfig, FirewallMode};
pub use firewall::Firewall;

/// Resolves once a stop flag is raised or its sender is gone.
pub(crate) async fn stopped(rx: &mut tokio::sync::watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Lock a bookkeeping map. A panic elsewhere never leaves these maps
/// half-updated, so poisoning is ignored.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
