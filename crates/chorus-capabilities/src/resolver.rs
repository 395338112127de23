//! TTL-cached owner resolution.
//!
//! Registry reads cross the process boundary and the answer changes
//! rarely (ownership transfers are on-chain transactions), so results —
//! including negative ones — are cached for a bounded TTL. A *failed*
//! read is not cached: the next caller retries the registry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, warn};

use chorus_core::Did;

use crate::registry::OwnerRegistry;

/// Default time-to-live for cached owner lookups.
pub const DEFAULT_OWNER_TTL: Duration = Duration::from_secs(24 * 60 * 60);

struct CacheEntry {
    /// `None` is a cached negative result.
    owner: Option<Did>,
    expires_at: Instant,
}

/// Caching wrapper around an [`OwnerRegistry`].
pub struct OwnerResolver {
    registry: Arc<dyn OwnerRegistry>,
    cache: DashMap<(String, String), CacheEntry>,
    ttl: Duration,
}

impl OwnerResolver {
    /// Wrap `registry` with the default 24 h TTL.
    #[must_use]
    pub fn new(registry: Arc<dyn OwnerRegistry>) -> Self {
        Self::with_ttl(registry, DEFAULT_OWNER_TTL)
    }

    /// Wrap `registry` with a custom TTL.
    #[must_use]
    pub fn with_ttl(registry: Arc<dyn OwnerRegistry>, ttl: Duration) -> Self {
        Self {
            registry,
            cache: DashMap::new(),
            ttl,
        }
    }

    /// Resolve the owner DID for `(contract_address, collaborator_address)`.
    ///
    /// Returns `None` both for "no owner recorded" and for "registry
    /// unavailable" — callers must treat `None` as *unknown owner* and
    /// fail closed.
    pub async fn resolve(
        &self,
        contract_address: &str,
        collaborator_address: &str,
    ) -> Option<Did> {
        let key = (
            contract_address.to_lowercase(),
            collaborator_address.to_lowercase(),
        );

        if let Some(entry) = self.cache.get(&key) {
            if entry.expires_at > Instant::now() {
                return entry.owner.clone();
            }
        }
        // Expired or absent: drop any stale entry before the read.
        self.cache.remove(&key);

        match self.registry.owner_of(&key.0, &key.1).await {
            Ok(owner) => {
                debug!(
                    contract = %key.0,
                    found = owner.is_some(),
                    "owner registry lookup"
                );
                self.cache.insert(
                    key,
                    CacheEntry {
                        owner: owner.clone(),
                        expires_at: Instant::now().checked_add(self.ttl).unwrap_or_else(Instant::now),
                    },
                );
                owner
            }
            Err(e) => {
                warn!(error = %e, contract = %key.0, "owner registry read failed");
                None
            }
        }
    }

    /// Number of live cache entries (expired entries may linger until
    /// their key is next read).
    #[must_use]
    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }
}

impl std::fmt::Debug for OwnerResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnerResolver")
            .field("ttl", &self.ttl)
            .field("entries", &self.cache.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::error::{RegistryError, RegistryResult};
    use crate::registry::StaticRegistry;

    struct CountingRegistry {
        inner: StaticRegistry,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl OwnerRegistry for CountingRegistry {
        async fn owner_of(
            &self,
            contract_address: &str,
            collaborator_address: &str,
        ) -> RegistryResult<Option<Did>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner
                .owner_of(contract_address, collaborator_address)
                .await
        }
    }

    struct FailingRegistry;

    #[async_trait]
    impl OwnerRegistry for FailingRegistry {
        async fn owner_of(&self, _: &str, _: &str) -> RegistryResult<Option<Did>> {
            Err(RegistryError::Unreachable("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn test_hit_skips_registry() {
        let registry = Arc::new(CountingRegistry {
            inner: StaticRegistry::new().with_owner("0xaa", "0xbb", Did::new("did:key:O")),
            calls: AtomicUsize::new(0),
        });
        let resolver = OwnerResolver::new(Arc::clone(&registry) as Arc<dyn OwnerRegistry>);

        assert_eq!(
            resolver.resolve("0xAA", "0xBB").await,
            Some(Did::new("did:key:O"))
        );
        assert_eq!(
            resolver.resolve("0xaa", "0xbb").await,
            Some(Did::new("did:key:O"))
        );
        assert_eq!(registry.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_negative_result_cached() {
        let registry = Arc::new(CountingRegistry {
            inner: StaticRegistry::new(),
            calls: AtomicUsize::new(0),
        });
        let resolver = OwnerResolver::new(Arc::clone(&registry) as Arc<dyn OwnerRegistry>);

        assert!(resolver.resolve("0xaa", "0xbb").await.is_none());
        assert!(resolver.resolve("0xaa", "0xbb").await.is_none());
        assert_eq!(registry.calls.load(Ordering::SeqCst), 1);
        assert_eq!(resolver.cached_len(), 1);
    }

    #[tokio::test]
    async fn test_failure_not_cached() {
        let resolver = OwnerResolver::new(Arc::new(FailingRegistry));
        assert!(resolver.resolve("0xaa", "0xbb").await.is_none());
        assert_eq!(resolver.cached_len(), 0);
    }

    #[tokio::test]
    async fn test_expired_entry_refetched() {
        let registry = Arc::new(CountingRegistry {
            inner: StaticRegistry::new().with_owner("0xaa", "0xbb", Did::new("did:key:O")),
            calls: AtomicUsize::new(0),
        });
        let resolver = OwnerResolver::with_ttl(
            Arc::clone(&registry) as Arc<dyn OwnerRegistry>,
            Duration::from_millis(0),
        );

        let _ = resolver.resolve("0xaa", "0xbb").await;
        let _ = resolver.resolve("0xaa", "0xbb").await;
        assert_eq!(registry.calls.load(Ordering::SeqCst), 2);
    }
}
