//! Store-backed mutual exclusion with expiry.
//!
//! ```text
//! Unheld --acquire--> Held --release--> Unheld
//!                     Held --expiry---> Unheld (cleaned up by the next acquire)
//! ```
//!
//! Acquisition never blocks: a live lease under the key means
//! [`LeaseOutcome::Conflict`]. There is no renewal; pick a ttl that outlives
//! the guarded work.

use chrono::{Duration, Utc};
use std::sync::Arc;

use super::store::MemoryStore;
use super::types::Lease;
use crate::error::{MemoryError, Result};

/// Result of an acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseOutcome {
    Acquired(Lease),
    /// Someone else holds a live lease under this key.
    Conflict,
}

impl LeaseOutcome {
    pub fn is_acquired(&self) -> bool {
        matches!(self, Self::Acquired(_))
    }
}

/// Lease key guarding consolidation for one owner.
pub fn consolidation_key(owner_id: &str) -> String {
    format!("consolidation:{owner_id}")
}

#[derive(Clone)]
pub struct LeaseLock {
    store: Arc<dyn MemoryStore>,
}

impl LeaseLock {
    pub fn new(store: Arc<dyn MemoryStore>) -> Self {
        Self { store }
    }

    /// Clear an expired lease under `key`, then try to create a fresh one.
    pub async fn acquire(&self, key: &str, ttl: Duration) -> Result<LeaseOutcome> {
        if ttl <= Duration::zero() {
            return Err(MemoryError::validation(format!(
                "lease ttl must be positive, got {}ms",
                ttl.num_milliseconds()
            )));
        }

        let now = Utc::now();
        self.store.delete_expired_lease(key, now).await?;

        let expires_at = now + ttl;
        if self.store.create_lease(key, expires_at).await? {
            tracing::debug!(key, %expires_at, "lease acquired");
            Ok(LeaseOutcome::Acquired(Lease {
                key: key.to_string(),
                expires_at,
            }))
        } else {
            tracing::debug!(key, "lease held elsewhere");
            Ok(LeaseOutcome::Conflict)
        }
    }

    /// Drop the lease under `key`. Releasing an unheld key is a no-op.
    pub async fn release(&self, key: &str) -> Result<()> {
        self.store.delete_lease(key).await?;
        tracing::debug!(key, "lease released");
        Ok(())
    }
}
