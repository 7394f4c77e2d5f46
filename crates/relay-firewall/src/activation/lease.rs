//! Lease store seam used for active/passive arbitration.

use async_trait::async_trait;
use relay_core::{RelayError, RelayResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// A granted, time-limited claim on a named lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub name: String,
    pub holder: String,
    /// Changes on every grant; renewals must present the current token.
    pub token: u64,
    pub expires_at: Instant,
}

#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Grant the lease unless another holder has an unexpired one.
    async fn try_acquire(&self, name: &str, holder: &str, ttl: Duration) -> RelayResult<Option<Lease>>;

    /// Extend a lease. `None` means the lease is no longer ours.
    async fn renew(&self, lease: &Lease, ttl: Duration) -> RelayResult<Option<Lease>>;

    async fn release(&self, lease: &Lease) -> RelayResult<()>;
}

/// Lease table shared by coordinators in one process.
#[derive(Debug, Default)]
pub struct InMemoryLeaseStore {
    leases: Mutex<HashMap<String, Lease>>,
    next_token: AtomicU64,
    unavailable: AtomicBool,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail, as if the store were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Current unexpired holder of `name`.
    pub async fn holder(&self, name: &str) -> Option<String> {
        let leases = self.leases.lock().await;
        leases
            .get(name)
            .filter(|l| l.expires_at > Instant::now())
            .map(|l| l.holder.clone())
    }

    fn check_available(&self) -> RelayResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(RelayError::Lease("lease store unavailable".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn try_acquire(&self, name: &str, holder: &str, ttl: Duration) -> RelayResult<Option<Lease>> {
        self.check_available()?;
        let now = Instant::now();
        let mut leases = self.leases.lock().await;
        if let Some(current) = leases.get(name) {
            if current.expires_at > now && current.holder != holder {
                return Ok(None);
            }
        }
        let lease = Lease {
            name: name.to_string(),
            holder: holder.to_string(),
            token: self.next_token.fetch_add(1, Ordering::SeqCst) + 1,
            expires_at: now + ttl,
        };
        leases.insert(name.to_string(), lease.clone());
        Ok(Some(lease))
    }

    async fn renew(&self, lease: &Lease, ttl: Duration) -> RelayResult<Option<Lease>> {
        self.check_available()?;
        let now = Instant::now();
        let mut leases = self.leases.lock().await;
        match leases.get_mut(&lease.name) {
            Some(current) if current.token == lease.token && current.expires_at > now => {
                current.expires_at = now + ttl;
                Ok(Some(current.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn release(&self, lease: &Lease) -> RelayResult<()> {
        self.check_available()?;
        let mut leases = self.leases.lock().await;
        if leases.get(&lease.name).map(|l| l.token) == Some(lease.token) {
            leases.remove(&lease.name);
        }
        Ok(())
    }
}
