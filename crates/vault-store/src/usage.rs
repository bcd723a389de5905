use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use vault_types::OwnerScope;

use crate::error::{StoreError, StoreResult};

/// Answers "how many bytes does this owner use".
///
/// Usage is a property of logical files, which the metadata layer owns, so
/// the store only delegates the question.
#[async_trait]
pub trait UsageSource: Send + Sync {
    async fn current_usage(&self, scope: &OwnerScope) -> StoreResult<u64>;
}

/// Usage source for deployments without a metadata layer. Always zero.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoUsage;

#[async_trait]
impl UsageSource for NoUsage {
    async fn current_usage(&self, _scope: &OwnerScope) -> StoreResult<u64> {
        Ok(0)
    }
}

/// Per-owner byte totals kept in memory. Intended for tests and embedding.
#[derive(Debug, Default)]
pub struct InMemoryUsage {
    totals: RwLock<HashMap<OwnerScope, u64>>,
}

impl InMemoryUsage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `bytes` to the owner's total.
    pub fn charge(&self, scope: &OwnerScope, bytes: u64) -> StoreResult<()> {
        let mut totals = self.totals.write().map_err(|_| poisoned())?;
        let total = totals.entry(scope.clone()).or_default();
        *total = total.saturating_add(bytes);
        Ok(())
    }

    /// Subtract `bytes` from the owner's total, stopping at zero.
    pub fn refund(&self, scope: &OwnerScope, bytes: u64) -> StoreResult<()> {
        let mut totals = self.totals.write().map_err(|_| poisoned())?;
        if let Some(total) = totals.get_mut(scope) {
            *total = total.saturating_sub(bytes);
        }
        Ok(())
    }
}

fn poisoned() -> StoreError {
    StoreError::Usage("usage table lock poisoned".into())
}

#[async_trait]
impl UsageSource for InMemoryUsage {
    async fn current_usage(&self, scope: &OwnerScope) -> StoreResult<u64> {
        let totals = self.totals.read().map_err(|_| poisoned())?;
        Ok(totals.get(scope).copied().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_owner_uses_nothing() {
        let usage = InMemoryUsage::new();
        assert_eq!(usage.current_usage(&OwnerScope::new("alice")).await.unwrap(), 0);
        assert_eq!(NoUsage.current_usage(&OwnerScope::new("alice")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn charge_and_refund() {
        let usage = InMemoryUsage::new();
        let alice = OwnerScope::new("alice");
        let bob = OwnerScope::new("bob");
        usage.charge(&alice, 100).unwrap();
        usage.charge(&alice, 50).unwrap();
        usage.charge(&bob, 7).unwrap();
        usage.refund(&alice, 30).unwrap();

        assert_eq!(usage.current_usage(&alice).await.unwrap(), 120);
        assert_eq!(usage.current_usage(&bob).await.unwrap(), 7);

        usage.refund(&bob, 1_000).unwrap();
        assert_eq!(usage.current_usage(&bob).await.unwrap(), 0);
    }
}
