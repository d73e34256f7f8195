use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, warn};

use crate::db::{HistoryStore, StoredRecord};
use crate::errors::{AppError, AppResult};
use crate::models::ParsedAddress;
use crate::normalizer::normalize_address;

const HISTORY_SEPARATOR: &str = "||";

/// Regional manager plus normalized address. Equivalent raw variants share a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CacheKey {
    pub rm: String,
    pub address: String,
}

impl CacheKey {
    pub fn new(rm: &str, address: &str) -> Self {
        Self {
            rm: rm.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase(),
            address: normalize_address(address).text,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: ParsedAddress,
    /// Append-only, oldest first.
    pub history: Vec<String>,
    pub resolved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheHit {
    pub parsed: ParsedAddress,
    /// Newest first.
    pub history: Vec<String>,
    pub fresh: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupOrigin {
    /// A fresh cached value was returned without resolving.
    Cached,
    /// Joined a resolution another caller had already started.
    Coalesced,
    /// This caller started the resolution.
    Resolved,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HydrateReport {
    pub loaded: usize,
    pub reset: usize,
}

type SharedResolution = Shared<BoxFuture<'static, ParsedAddress>>;

struct CacheInner {
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
    inflight: Mutex<HashMap<CacheKey, SharedResolution>>,
    freshness: chrono::Duration,
    store: Option<Arc<dyn HistoryStore>>,
}

/// Memoizes resolutions per `(rm, address)` and keeps the history of every key.
///
/// Entries are never evicted. A value older than the freshness window is revalidated
/// on the next lookup; the entry and its history survive the refresh. At most one
/// resolution per key runs at a time, and it keeps running to completion even if
/// every caller waiting on it goes away.
#[derive(Clone)]
pub struct ResolutionCache {
    inner: Arc<CacheInner>,
}

impl ResolutionCache {
    pub fn new(freshness: Duration) -> Self {
        Self::build(freshness, None)
    }

    pub fn with_store(freshness: Duration, store: Arc<dyn HistoryStore>) -> Self {
        Self::build(freshness, Some(store))
    }

    fn build(freshness: Duration, store: Option<Arc<dyn HistoryStore>>) -> Self {
        let freshness =
            chrono::Duration::from_std(freshness).unwrap_or_else(|_| chrono::Duration::days(36_500));
        Self {
            inner: Arc::new(CacheInner {
                entries: RwLock::new(HashMap::new()),
                inflight: Mutex::new(HashMap::new()),
                freshness,
                store,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, rm: &str, address: &str) -> Option<CacheHit> {
        let key = CacheKey::new(rm, address);
        let entries = self.inner.entries.read();
        let entry = entries.get(&key)?;
        Some(CacheHit {
            parsed: entry.value.clone(),
            history: flatten_history(&entry.history),
            fresh: self.inner.is_fresh(entry),
        })
    }

    /// Stores `parsed` as the current value and appends it to the key's history.
    pub fn put(&self, rm: &str, address: &str, parsed: ParsedAddress) {
        let key = CacheKey::new(rm, address);
        self.inner.store_value(&key, address, parsed);
    }

    /// Prior resolutions for the key, newest first, each distinct value once.
    pub fn get_history(&self, rm: &str, address: &str) -> Vec<String> {
        let key = CacheKey::new(rm, address);
        self.inner
            .entries
            .read()
            .get(&key)
            .map(|entry| flatten_history(&entry.history))
            .unwrap_or_default()
    }

    /// Returns the fresh cached value or resolves it, coalescing concurrent callers.
    ///
    /// `resolve` is only invoked by the caller that starts a resolution.
    pub async fn get_or_resolve<F, Fut>(
        &self,
        rm: &str,
        address: &str,
        resolve: F,
    ) -> (ParsedAddress, LookupOrigin)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ParsedAddress> + Send + 'static,
    {
        let key = CacheKey::new(rm, address);
        let (shared, origin) = {
            let mut inflight = self.inner.inflight.lock();
            if let Some(value) = self.inner.fresh_value(&key) {
                return (value, LookupOrigin::Cached);
            }
            match inflight.get(&key) {
                Some(existing) => (existing.clone(), LookupOrigin::Coalesced),
                None => {
                    let shared = self.spawn_resolution(key.clone(), address, resolve());
                    inflight.insert(key.clone(), shared.clone());
                    (shared, LookupOrigin::Resolved)
                }
            }
        };
        debug!(
            target: "resolution_cache",
            rm = %key.rm,
            address = %key.address,
            origin = ?origin,
            "awaiting resolution"
        );
        (shared.await, origin)
    }

    fn spawn_resolution<Fut>(&self, key: CacheKey, raw: &str, resolution: Fut) -> SharedResolution
    where
        Fut: Future<Output = ParsedAddress> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let task_key = key.clone();
        let raw = raw.trim().to_string();
        let handle = tokio::spawn(async move {
            let parsed = resolution.await;
            inner.complete(&task_key, &raw, parsed.clone());
            parsed
        });

        let inner = Arc::clone(&self.inner);
        async move {
            match handle.await {
                Ok(parsed) => parsed,
                Err(err) => {
                    warn!(
                        target: "resolution_cache",
                        rm = %key.rm,
                        address = %key.address,
                        error = %err,
                        "resolution task failed"
                    );
                    inner.inflight.lock().remove(&key);
                    ParsedAddress::unresolved()
                }
            }
        }
        .boxed()
        .shared()
    }

    /// Loads persisted entries. Malformed rows are reset instead of failing the load.
    pub fn hydrate(&self) -> AppResult<HydrateReport> {
        let Some(store) = self.inner.store.clone() else {
            return Ok(HydrateReport::default());
        };
        let mut report = HydrateReport::default();
        for record in store.load_all()? {
            match decode_record(&record) {
                Ok((key, entry)) => {
                    self.inner.entries.write().insert(key, entry);
                    report.loaded += 1;
                }
                Err(err) => {
                    warn!(
                        target: "resolution_cache",
                        rm = %record.rm,
                        address = %record.address,
                        error = %err,
                        "resetting malformed cache row"
                    );
                    report.reset += 1;
                    let reset = StoredRecord {
                        parsed_json: serde_json::to_string(&ParsedAddress::unresolved())?,
                        history: String::new(),
                        resolved_at: DateTime::<Utc>::default().to_rfc3339(),
                        ..record
                    };
                    store.save(&reset)?;
                }
            }
        }
        Ok(report)
    }

    #[cfg(test)]
    pub(crate) fn backdate(&self, rm: &str, address: &str, by: chrono::Duration) {
        let key = CacheKey::new(rm, address);
        if let Some(entry) = self.inner.entries.write().get_mut(&key) {
            entry.resolved_at -= by;
        }
    }
}

impl CacheInner {
    fn is_fresh(&self, entry: &CacheEntry) -> bool {
        Utc::now() - entry.resolved_at < self.freshness
    }

    fn fresh_value(&self, key: &CacheKey) -> Option<ParsedAddress> {
        self.entries
            .read()
            .get(key)
            .filter(|entry| self.is_fresh(entry))
            .map(|entry| entry.value.clone())
    }

    fn complete(&self, key: &CacheKey, raw: &str, parsed: ParsedAddress) {
        let mut inflight = self.inflight.lock();
        self.store_value(key, raw, parsed);
        inflight.remove(key);
    }

    fn store_value(&self, key: &CacheKey, raw: &str, parsed: ParsedAddress) {
        let line = history_line(raw, &parsed);
        let mut entries = self.entries.write();
        let entry = entries.entry(key.clone()).or_insert_with(|| CacheEntry {
            value: parsed.clone(),
            history: Vec::new(),
            resolved_at: Utc::now(),
        });
        entry.value = parsed;
        entry.resolved_at = Utc::now();
        if !line.is_empty() && entry.history.last() != Some(&line) {
            entry.history.push(line);
        }

        if let Some(store) = &self.store {
            if let Err(err) = encode_record(key, entry).and_then(|record| store.save(&record)) {
                warn!(
                    target: "resolution_cache",
                    rm = %key.rm,
                    address = %key.address,
                    error = %err,
                    "failed to persist cache entry"
                );
            }
        }
    }
}

/// One history entry. Whitespace runs and the composite separator collapse to a
/// single space so a stored value always splits back into the same entries.
fn history_line(raw: &str, parsed: &ParsedAddress) -> String {
    let line = if parsed.is_resolved() {
        parsed.summary_line()
    } else {
        raw.to_string()
    };
    line.replace(HISTORY_SEPARATOR, " ")
        .split(|c: char| c.is_whitespace() || c.is_control())
        .filter(|word| !word.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Splits composite history values on line breaks and `||`, newest first, deduplicated.
pub fn flatten_history(entries: &[String]) -> Vec<String> {
    let mut flattened: Vec<String> = Vec::new();
    for entry in entries.iter().rev() {
        for part in split_composite(entry).into_iter().rev() {
            if !flattened.contains(&part) {
                flattened.push(part);
            }
        }
    }
    flattened
}

fn split_composite(raw: &str) -> Vec<String> {
    raw.split(['\n', '\r'])
        .flat_map(|line| line.split(HISTORY_SEPARATOR))
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

fn encode_record(key: &CacheKey, entry: &CacheEntry) -> AppResult<StoredRecord> {
    Ok(StoredRecord {
        rm: key.rm.clone(),
        address: key.address.clone(),
        parsed_json: serde_json::to_string(&entry.value)?,
        history: entry.history.join(HISTORY_SEPARATOR),
        resolved_at: entry.resolved_at.to_rfc3339(),
    })
}

fn decode_record(record: &StoredRecord) -> AppResult<(CacheKey, CacheEntry)> {
    let value: ParsedAddress = serde_json::from_str(&record.parsed_json).map_err(|err| {
        AppError::CacheCorruption(format!("parsed value is not valid JSON: {err}"))
    })?;
    if record.history.chars().any(|c| c.is_control() && c != '\n' && c != '\r') {
        return Err(AppError::CacheCorruption(
            "history contains control characters".into(),
        ));
    }
    let resolved_at = DateTime::parse_from_rfc3339(&record.resolved_at)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|err| AppError::CacheCorruption(format!("invalid timestamp: {err}")))?;
    let key = CacheKey {
        rm: record.rm.clone(),
        address: record.address.clone(),
    };
    let history = split_composite(&record.history);
    Ok((
        key,
        CacheEntry {
            value,
            history,
            resolved_at,
        },
    ))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::db::SqliteHistoryStore;
    use crate::models::{ResolutionSource, ResolutionStatus};

    fn resolved(city: &str) -> ParsedAddress {
        ParsedAddress {
            country: "Россия".into(),
            region: city.into(),
            city: Some(city.into()),
            confidence: 0.8,
            source: ResolutionSource::Explicit,
            status: ResolutionStatus::Resolved,
            ..ParsedAddress::unresolved()
        }
    }

    #[test]
    fn composite_history_is_newest_first() {
        let history = flatten_history(&["Москва||СПб\nКазань".to_string()]);
        assert_eq!(history, vec!["Казань", "СПб", "Москва"]);

        let repeated = flatten_history(&[
            "Москва".to_string(),
            " ".to_string(),
            "Казань||Москва".to_string(),
        ]);
        assert_eq!(repeated, vec!["Москва", "Казань"]);
    }

    #[test]
    fn equivalent_variants_share_an_entry() {
        let cache = ResolutionCache::new(Duration::from_secs(60));
        cache.put("Иванов", "г. Казань; ул. Баумана", resolved("Казань"));

        let hit = cache.get(" иванов ", "Г. КАЗАНЬ, ул. Баумана").unwrap();
        assert!(hit.fresh);
        assert_eq!(hit.parsed.city.as_deref(), Some("Казань"));
        assert!(cache.get("Петров", "г. Казань, ул. Баумана").is_none());
    }

    #[test]
    fn history_only_grows() {
        let cache = ResolutionCache::new(Duration::from_secs(60));
        cache.put("rm", "Казань", resolved("Казань"));
        cache.put("rm", "Казань", resolved("Казань"));
        cache.put("rm", "Казань", resolved("Москва"));
        cache.put("rm", "Казань", ParsedAddress::unresolved());

        assert_eq!(cache.len(), 1);
        let history = cache.get_history("rm", "Казань");
        assert_eq!(history.len(), 3);
        assert_eq!(history[0], "Казань");
        assert!(history[1].contains("Москва"));
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_resolution() {
        let cache = ResolutionCache::new(Duration::from_secs(60));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_resolve("rm", "г. Казань", move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        resolved("Казань")
                    })
                    .await
            }));
        }

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results
            .iter()
            .all(|(parsed, _)| parsed.city.as_deref() == Some("Казань")));
        assert_eq!(
            results
                .iter()
                .filter(|(_, origin)| *origin == LookupOrigin::Resolved)
                .count(),
            1
        );

        let (_, origin) = cache
            .get_or_resolve("rm", "г. Казань", || async { resolved("Москва") })
            .await;
        assert_eq!(origin, LookupOrigin::Cached);
    }

    #[tokio::test]
    async fn abandoned_resolution_still_lands_in_cache() {
        let cache = ResolutionCache::new(Duration::from_secs(60));
        let waiting = cache.get_or_resolve("rm", "Казань", || async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            resolved("Казань")
        });
        let timed_out = tokio::time::timeout(Duration::from_millis(5), waiting).await;
        assert!(timed_out.is_err());

        tokio::time::sleep(Duration::from_millis(80)).await;
        let hit = cache.get("rm", "Казань").unwrap();
        assert_eq!(hit.parsed.city.as_deref(), Some("Казань"));
    }

    #[tokio::test]
    async fn stale_entries_are_revalidated_not_dropped() {
        let cache = ResolutionCache::new(Duration::from_secs(60));
        cache.put("rm", "Казань", resolved("Казань"));
        cache.backdate("rm", "Казань", chrono::Duration::seconds(120));
        assert!(!cache.get("rm", "Казань").unwrap().fresh);

        let (parsed, origin) = cache
            .get_or_resolve("rm", "Казань", || async { resolved("Москва") })
            .await;
        assert_eq!(origin, LookupOrigin::Resolved);
        assert_eq!(parsed.city.as_deref(), Some("Москва"));
        assert_eq!(cache.get_history("rm", "Казань").len(), 2);
    }

    #[test]
    fn writes_through_and_hydrates() {
        let store: Arc<dyn HistoryStore> = Arc::new(SqliteHistoryStore::in_memory().unwrap());
        let cache = ResolutionCache::with_store(Duration::from_secs(60), Arc::clone(&store));
        cache.put("rm", "Казань", resolved("Казань"));
        cache.put("rm", "Казань", resolved("Москва"));

        let restored = ResolutionCache::with_store(Duration::from_secs(60), store);
        let report = restored.hydrate().unwrap();
        assert_eq!(report, HydrateReport { loaded: 1, reset: 0 });
        let history = restored.get_history("rm", "Казань");
        assert_eq!(history.len(), 2);
        assert!(history[0].contains("Москва"));
    }

    #[test]
    fn raw_history_survives_a_reload() {
        let store: Arc<dyn HistoryStore> = Arc::new(SqliteHistoryStore::in_memory().unwrap());
        let cache = ResolutionCache::with_store(Duration::from_secs(60), Arc::clone(&store));
        cache.put("rm", "кхъгрзщ\tвпрлмн", ParsedAddress::unresolved());
        cache.put("rm", "КХЪГРЗЩ||впрлмн", ParsedAddress::unresolved());
        let expected = vec!["КХЪГРЗЩ впрлмн", "кхъгрзщ впрлмн"];
        assert_eq!(cache.get_history("rm", "кхъгрзщ; впрлмн"), expected);

        let restored = ResolutionCache::with_store(Duration::from_secs(60), store);
        let report = restored.hydrate().unwrap();
        assert_eq!(report, HydrateReport { loaded: 1, reset: 0 });
        assert_eq!(restored.get_history("rm", "кхъгрзщ; впрлмн"), expected);
    }

    #[test]
    fn repeats_after_a_reload_are_not_appended() {
        let sqlite = Arc::new(SqliteHistoryStore::in_memory().unwrap());
        let store: Arc<dyn HistoryStore> = sqlite.clone();
        let cache = ResolutionCache::with_store(Duration::from_secs(60), Arc::clone(&store));
        cache.put("rm", "Казань", resolved("Москва"));
        cache.put("rm", "Казань", resolved("Казань"));

        let restored = ResolutionCache::with_store(Duration::from_secs(60), store);
        restored.hydrate().unwrap();
        restored.put("rm", "Казань", resolved("Казань"));

        let row = sqlite.load("rm", "казань").unwrap().unwrap();
        assert_eq!(row.history.matches(HISTORY_SEPARATOR).count(), 1);
        assert_eq!(restored.get_history("rm", "Казань").len(), 2);
    }

    #[test]
    fn malformed_rows_are_reset() {
        let sqlite = Arc::new(SqliteHistoryStore::in_memory().unwrap());
        sqlite
            .save(&StoredRecord {
                rm: "rm".into(),
                address: "казань".into(),
                parsed_json: "{not json".into(),
                history: "Казань".into(),
                resolved_at: Utc::now().to_rfc3339(),
            })
            .unwrap();
        let store: Arc<dyn HistoryStore> = sqlite.clone();
        let cache = ResolutionCache::with_store(Duration::from_secs(60), store);

        let report = cache.hydrate().unwrap();
        assert_eq!(report, HydrateReport { loaded: 0, reset: 1 });
        assert!(cache.is_empty());
        let row = sqlite.load("rm", "казань").unwrap().unwrap();
        assert!(row.history.is_empty());
    }
}
