use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use crate::cache::{LookupOrigin, ResolutionCache};
use crate::errors::{AppError, AppResult};
use crate::models::ParsedAddress;
use crate::normalizer::normalize_address;
use crate::pipeline::ResolutionPipeline;

#[derive(Debug, Default)]
struct ResolverCounters {
    lookups: AtomicU64,
    cache_hits: AtomicU64,
    coalesced: AtomicU64,
    resolved: AtomicU64,
    unresolved: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolverStats {
    pub lookups: u64,
    pub cache_hits: u64,
    pub coalesced: u64,
    pub geocoder_calls: u64,
    pub resolved: u64,
    pub unresolved: u64,
}

/// Front door for address resolution: normalizer, cache, then pipeline.
///
/// One resolver is built per process and shared by reference across every
/// concurrent caller. Clones share the same cache and counters.
#[derive(Clone)]
pub struct AddressResolver {
    pipeline: Arc<ResolutionPipeline>,
    cache: ResolutionCache,
    counters: Arc<ResolverCounters>,
}

impl AddressResolver {
    pub fn new(pipeline: Arc<ResolutionPipeline>, cache: ResolutionCache) -> Self {
        Self {
            pipeline,
            cache,
            counters: Arc::new(ResolverCounters::default()),
        }
    }

    pub fn pipeline(&self) -> &Arc<ResolutionPipeline> {
        &self.pipeline
    }

    pub fn cache(&self) -> &ResolutionCache {
        &self.cache
    }

    pub async fn resolve(&self, rm: &str, address: &str) -> AppResult<ParsedAddress> {
        let rm = rm.trim();
        if rm.is_empty() {
            return Err(AppError::validation("rm name is required"));
        }
        self.counters.lookups.fetch_add(1, Ordering::Relaxed);

        let normalized = normalize_address(address);
        if normalized.is_empty() {
            self.counters.unresolved.fetch_add(1, Ordering::Relaxed);
            return Ok(ParsedAddress::unresolved());
        }

        let pipeline = Arc::clone(&self.pipeline);
        let (parsed, origin) = self
            .cache
            .get_or_resolve(rm, address, move || async move {
                pipeline.resolve(&normalized).await
            })
            .await;

        match origin {
            LookupOrigin::Cached => {
                self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            }
            LookupOrigin::Coalesced => {
                self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
            }
            LookupOrigin::Resolved => {}
        }
        if parsed.is_resolved() {
            self.counters.resolved.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.unresolved.fetch_add(1, Ordering::Relaxed);
        }
        debug!(
            rm,
            source = parsed.source.as_str(),
            confidence = parsed.confidence,
            origin = ?origin,
            "address lookup finished"
        );
        Ok(parsed)
    }

    /// Like [`resolve`](Self::resolve), but stops waiting after `timeout`.
    ///
    /// `None` means the caller gave up. The resolution keeps running and lands
    /// in the cache for the next lookup.
    pub async fn resolve_within(
        &self,
        rm: &str,
        address: &str,
        timeout: Duration,
    ) -> AppResult<Option<ParsedAddress>> {
        match tokio::time::timeout(timeout, self.resolve(rm, address)).await {
            Ok(result) => result.map(Some),
            Err(_) => {
                info!(
                    rm,
                    timeout_ms = timeout.as_millis() as u64,
                    "caller stopped waiting for resolution"
                );
                Ok(None)
            }
        }
    }

    /// Prior resolutions for the pair, newest first.
    pub fn history(&self, rm: &str, address: &str) -> AppResult<Vec<String>> {
        if rm.trim().is_empty() {
            return Err(AppError::validation("rm name is required"));
        }
        if address.trim().is_empty() {
            return Err(AppError::validation("address is required"));
        }
        Ok(self.cache.get_history(rm, address))
    }

    pub fn stats(&self) -> ResolverStats {
        ResolverStats {
            lookups: self.counters.lookups.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            coalesced: self.counters.coalesced.load(Ordering::Relaxed),
            geocoder_calls: self
                .pipeline
                .geocoder()
                .map(|geocoder| geocoder.calls())
                .unwrap_or_default(),
            resolved: self.counters.resolved.load(Ordering::Relaxed),
            unresolved: self.counters.unresolved.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gazetteer::Gazetteer;
    use crate::geocoder::tests::{fast_adapter, ScriptedGeocoder};
    use crate::models::ResolutionSource;

    fn offline_resolver() -> AddressResolver {
        let gazetteer = Gazetteer::default()
            .with_city("Казань", "Татарстан")
            .with_city("Москва", "Москва");
        let pipeline = ResolutionPipeline::new(gazetteer, None, 0.86);
        AddressResolver::new(
            Arc::new(pipeline),
            ResolutionCache::new(Duration::from_secs(60)),
        )
    }

    #[tokio::test]
    async fn rejects_missing_rm() {
        let resolver = offline_resolver();
        let err = resolver.resolve("  ", "г. Казань").await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert!(resolver.history("", "г. Казань").is_err());
    }

    #[tokio::test]
    async fn blank_address_is_unresolved_and_not_cached() {
        let resolver = offline_resolver();
        let parsed = resolver.resolve("Иванов", " \t ").await.unwrap();
        assert_eq!(parsed, ParsedAddress::unresolved());
        assert!(resolver.cache().is_empty());
    }

    #[tokio::test]
    async fn repeated_lookup_is_idempotent() {
        let resolver = offline_resolver();
        let first = resolver
            .resolve("Иванов", "г. Казань, ул. Баумана, д. 1")
            .await
            .unwrap();
        let second = resolver
            .resolve("иванов", "Г. Казань; ул. Баумана; д. 1")
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(first.source, ResolutionSource::Explicit);
        assert_eq!(
            resolver
                .history("Иванов", "г. Казань, ул. Баумана, д. 1")
                .unwrap()
                .len(),
            1
        );
        let stats = resolver.stats();
        assert_eq!(stats.lookups, 2);
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.resolved, 2);
    }

    #[tokio::test]
    async fn impatient_caller_still_warms_cache() {
        let provider = Arc::new(
            ScriptedGeocoder::new(Vec::new()).with_delay(Duration::from_millis(40)),
        );
        let adapter = Arc::new(fast_adapter(provider.clone()));
        let pipeline = ResolutionPipeline::new(Gazetteer::default(), Some(adapter), 0.86);
        let resolver = AddressResolver::new(
            Arc::new(pipeline),
            ResolutionCache::new(Duration::from_secs(60)),
        );

        let delivered = resolver
            .resolve_within("Иванов", "кхъгрзщ впрлмн", Duration::from_millis(5))
            .await
            .unwrap();
        assert!(delivered.is_none());

        tokio::time::sleep(Duration::from_millis(400)).await;
        let hit = resolver.cache().get("Иванов", "кхъгрзщ впрлмн").unwrap();
        assert!(!hit.parsed.is_resolved());
        assert!(provider.calls() >= 1);
    }
}
