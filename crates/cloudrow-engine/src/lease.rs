//! Per-account run leases
//!
//! At most one reconciliation run may write to an account at a time. A
//! lease is an RAII guard; dropping it frees the account and wakes anyone
//! queued for it.

use crate::error::{EngineError, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// What to do when the account is already leased
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LeasePolicy {
    /// Fail immediately with [`EngineError::LeaseHeld`]
    #[default]
    Reject,
    /// Queue for up to the given duration
    Wait(Duration),
}

#[derive(Default)]
struct Inner {
    held: Mutex<HashMap<String, DateTime<Utc>>>,
    released: Notify,
}

/// Tracks which accounts currently have a run in progress
#[derive(Clone, Default)]
pub struct LeaseManager {
    inner: Arc<Inner>,
}

impl LeaseManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, account: &str) -> bool {
        self.held().contains_key(account)
    }

    /// When the current lease on `account` was taken, if any
    pub fn held_since(&self, account: &str) -> Option<DateTime<Utc>> {
        self.held().get(account).copied()
    }

    fn held(&self) -> std::sync::MutexGuard<'_, HashMap<String, DateTime<Utc>>> {
        self.inner.held.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn try_insert(&self, account: &str) -> Option<AccountLease> {
        let mut held = self.held();
        if held.contains_key(account) {
            return None;
        }
        held.insert(account.to_string(), Utc::now());
        tracing::debug!("Acquired lease for account {}", account);
        Some(AccountLease {
            account: account.to_string(),
            manager: self.clone(),
        })
    }

    pub async fn acquire(&self, account: &str, policy: LeasePolicy) -> Result<AccountLease> {
        let timeout = match policy {
            LeasePolicy::Reject => {
                return self
                    .try_insert(account)
                    .ok_or_else(|| EngineError::LeaseHeld(account.to_string()));
            }
            LeasePolicy::Wait(timeout) => timeout,
        };

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register interest before checking so a release in between is not missed
            let released = self.inner.released.notified();
            if let Some(lease) = self.try_insert(account) {
                return Ok(lease);
            }
            tracing::info!("Account {} is leased, waiting", account);
            if tokio::time::timeout_at(deadline, released).await.is_err() {
                return Err(EngineError::LeaseHeld(account.to_string()));
            }
        }
    }
}

impl std::fmt::Debug for LeaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseManager")
            .field("held", &*self.held())
            .finish()
    }
}

/// RAII guard for an account lease
#[derive(Debug)]
pub struct AccountLease {
    account: String,
    manager: LeaseManager,
}

impl AccountLease {
    pub fn account(&self) -> &str {
        &self.account
    }
}

impl Drop for AccountLease {
    fn drop(&mut self) {
        self.manager.held().remove(&self.account);
        self.manager.inner.released.notify_waiters();
        tracing::debug!("Released lease for account {}", self.account);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reject_while_held() {
        let leases = LeaseManager::new();
        let lease = leases.acquire("acme", LeasePolicy::Reject).await.unwrap();
        assert!(leases.is_held("acme"));

        let err = leases.acquire("acme", LeasePolicy::Reject).await.unwrap_err();
        assert!(matches!(err, EngineError::LeaseHeld(_)));

        // Other accounts are independent
        leases.acquire("globex", LeasePolicy::Reject).await.unwrap();

        drop(lease);
        assert!(!leases.is_held("acme"));
        leases.acquire("acme", LeasePolicy::Reject).await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_release() {
        let leases = LeaseManager::new();
        let lease = leases.acquire("acme", LeasePolicy::Reject).await.unwrap();

        let waiter = {
            let leases = leases.clone();
            tokio::spawn(async move {
                leases
                    .acquire("acme", LeasePolicy::Wait(Duration::from_secs(5)))
                    .await
                    .map(|l| l.account().to_string())
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(lease);

        assert_eq!(waiter.await.unwrap().unwrap(), "acme");
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let leases = LeaseManager::new();
        let _lease = leases.acquire("acme", LeasePolicy::Reject).await.unwrap();

        let err = leases
            .acquire("acme", LeasePolicy::Wait(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::LeaseHeld(_)));
    }
}
