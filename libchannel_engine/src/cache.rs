use fxhash::FxHashMap;
use serde::Serialize;
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::channel::{Dataset, SourceKind};
use super::config::EngineConfig;
use super::error::CacheError;
use super::progressive::ProgressiveReader;

/// Cache entries are per source kind and experiment
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub source: SourceKind,
    pub experiment_id: String,
}

impl CacheKey {
    pub fn new(source: SourceKind, experiment_id: &str) -> Self {
        Self {
            source,
            experiment_id: experiment_id.to_string(),
        }
    }
}

impl Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.experiment_id, self.source)
    }
}

/// The result of decoding one file. Progressive sources also hand over their reader.
#[derive(Debug)]
pub struct Decoded {
    pub dataset: Dataset,
    pub reader: Option<Box<dyn ProgressiveReader>>,
}

impl From<Dataset> for Decoded {
    fn from(dataset: Dataset) -> Self {
        Self {
            dataset,
            reader: None,
        }
    }
}

#[derive(Debug)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub dataset: Arc<Dataset>,
    pub reader: Option<Box<dyn ProgressiveReader>>,
    pub inserted_at: Instant,
    sequence: u64,
}

impl CacheEntry {
    pub fn age(&self) -> Duration {
        self.inserted_at.elapsed()
    }

    pub fn size_bytes(&self) -> usize {
        self.dataset.size_bytes()
    }

    /// Close anything the entry holds open
    fn release(&self) {
        if let Some(reader) = &self.reader {
            reader.close();
        }
    }
}

type Outcome = Option<Result<Arc<CacheEntry>, CacheError>>;

enum Slot {
    Pending {
        ticket: u64,
        receiver: watch::Receiver<Outcome>,
    },
    Ready(Arc<CacheEntry>),
}

#[derive(Default)]
struct CacheState {
    slots: FxHashMap<CacheKey, Slot>,
    next_ticket: u64,
}

impl CacheState {
    fn ticket(&mut self) -> u64 {
        self.next_ticket += 1;
        self.next_ticket
    }

    fn remove_ready(&mut self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        match self.slots.get(key) {
            Some(Slot::Ready(_)) => match self.slots.remove(key) {
                Some(Slot::Ready(entry)) => Some(entry),
                _ => None,
            },
            _ => None,
        }
    }
}

struct CacheInner {
    state: Mutex<CacheState>,
    ttl: Duration,
    capacity: usize,
}

/// Introspection data for one ready entry
#[derive(Debug, Clone, Serialize)]
pub struct CacheItemStats {
    pub source: SourceKind,
    pub experiment_id: String,
    pub age_secs: f64,
    pub size_bytes: usize,
    pub channels: usize,
    pub progressive: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub pending: usize,
    pub ttl_secs: u64,
    pub capacity: usize,
    pub items: Vec<CacheItemStats>,
}

/// Removes a pending placeholder if the decode task unwinds before finishing
struct PendingGuard {
    manager: CacheManager,
    key: CacheKey,
    ticket: u64,
    armed: bool,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.armed {
            log::warn!("Decode of {} ended without a result", self.key);
            self.manager.remove_pending(&self.key, self.ticket);
        }
    }
}

/// Time-limited, capacity-bounded cache of decoded datasets with at most one decode in
/// flight per key. Clones share the same cache.
#[derive(Clone)]
pub struct CacheManager {
    inner: Arc<CacheInner>,
}

impl CacheManager {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                state: Mutex::new(CacheState::default()),
                ttl,
                capacity: capacity.max(1),
            }),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.cache_ttl(), config.cache_capacity)
    }

    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        // The state is only mutated in small critical sections that cannot leave it half
        // written, so a poisoned lock is still usable.
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_expired(&self, entry: &CacheEntry) -> bool {
        entry.age() > self.inner.ttl
    }

    /// Look up a ready, unexpired entry. A stale entry is released and dropped.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        let stale = {
            let mut state = self.lock();
            match state.slots.get(key) {
                Some(Slot::Ready(entry)) if !self.is_expired(entry) => {
                    return Some(entry.clone());
                }
                Some(Slot::Ready(_)) => state.remove_ready(key),
                _ => None,
            }
        };
        if let Some(entry) = stale {
            log::debug!("Cache entry {} expired", entry.key);
            entry.release();
        }
        None
    }

    /// Return the cached entry for `key`, running `decode` on a miss.
    ///
    /// Concurrent callers for the same key share one decode. The decode runs on its own
    /// task, so a caller that gives up waiting does not cancel it.
    pub async fn get_or_decode<F, Fut, E>(
        &self,
        key: CacheKey,
        decode: F,
    ) -> Result<Arc<CacheEntry>, CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Decoded, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let (mut receiver, stale) = {
            let mut state = self.lock();
            match state.slots.get(&key) {
                Some(Slot::Ready(entry)) if !self.is_expired(entry) => {
                    return Ok(entry.clone());
                }
                Some(Slot::Pending { receiver, .. }) => (receiver.clone(), None),
                _ => {
                    let stale = state.remove_ready(&key);
                    let ticket = state.ticket();
                    let (sender, receiver) = watch::channel(None);
                    state.slots.insert(
                        key.clone(),
                        Slot::Pending {
                            ticket,
                            receiver: receiver.clone(),
                        },
                    );
                    self.spawn_decode(key.clone(), ticket, sender, decode);
                    (receiver, stale)
                }
            }
        };
        if let Some(entry) = stale {
            entry.release();
        }

        let outcome = match receiver.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| {
            Err(CacheError::DecodeInFlightFailed(format!(
                "decode of {key} was aborted"
            )))
        })
    }

    fn spawn_decode<F, Fut, E>(
        &self,
        key: CacheKey,
        ticket: u64,
        sender: watch::Sender<Outcome>,
        decode: F,
    ) where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Decoded, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut guard = PendingGuard {
                manager: manager.clone(),
                key: key.clone(),
                ticket,
                armed: true,
            };
            log::debug!("Decoding {key}");
            let outcome = match decode().await {
                Ok(decoded) => Ok(manager.install(key, ticket, decoded)),
                Err(e) => {
                    log::warn!("Decode of {key} failed: {e}");
                    manager.remove_pending(&key, ticket);
                    Err(CacheError::DecodeInFlightFailed(e.to_string()))
                }
            };
            guard.armed = false;
            // No receivers left is fine, the entry is cached either way
            let _ = sender.send(Some(outcome));
        });
    }

    /// Turn our pending placeholder into a ready entry, then enforce capacity
    fn install(&self, key: CacheKey, ticket: u64, decoded: Decoded) -> Arc<CacheEntry> {
        let mut evicted = Vec::new();
        let entry = {
            let mut state = self.lock();
            let entry = Arc::new(CacheEntry {
                key: key.clone(),
                dataset: Arc::new(decoded.dataset),
                reader: decoded.reader,
                inserted_at: Instant::now(),
                sequence: state.ticket(),
            });
            let still_ours =
                matches!(state.slots.get(&key), Some(Slot::Pending { ticket: t, .. }) if *t == ticket);
            if still_ours {
                state.slots.insert(key.clone(), Slot::Ready(entry.clone()));
                self.evict_over_capacity(&mut state, key.source, &mut evicted);
            } else {
                log::debug!("{key} was invalidated while decoding; result not cached");
            }
            entry
        };
        for stale in evicted {
            log::debug!("Evicted {} to stay within capacity", stale.key);
            stale.release();
        }
        entry
    }

    fn evict_over_capacity(
        &self,
        state: &mut CacheState,
        source: SourceKind,
        evicted: &mut Vec<Arc<CacheEntry>>,
    ) {
        loop {
            let mut ready: Vec<(&CacheKey, u64)> = state
                .slots
                .iter()
                .filter_map(|(key, slot)| match slot {
                    Slot::Ready(entry) if key.source == source => Some((key, entry.sequence)),
                    _ => None,
                })
                .collect();
            if ready.len() <= self.inner.capacity {
                return;
            }
            ready.sort_by_key(|(_, sequence)| *sequence);
            let oldest = ready[0].0.clone();
            if let Some(entry) = state.remove_ready(&oldest) {
                evicted.push(entry);
            }
        }
    }

    fn remove_pending(&self, key: &CacheKey, ticket: u64) {
        let mut state = self.lock();
        if matches!(state.slots.get(key), Some(Slot::Pending { ticket: t, .. }) if *t == ticket) {
            state.slots.remove(key);
        }
    }

    /// Drop one entry. A decode in flight for the key still completes for its waiters but
    /// its result is not cached.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        let removed = self.lock().slots.remove(key);
        match removed {
            Some(Slot::Ready(entry)) => {
                entry.release();
                log::info!("Invalidated {key}");
                true
            }
            Some(Slot::Pending { .. }) => true,
            None => false,
        }
    }

    /// Drop every entry of one source kind, returning how many were removed
    pub fn invalidate_all(&self, source: SourceKind) -> usize {
        let removed = self.drain(|key| key.source == source);
        log::info!("Invalidated {removed} {source} entries");
        removed
    }

    pub fn clear(&self) {
        let removed = self.drain(|_| true);
        log::info!("Cleared {removed} cache entries");
    }

    fn drain(&self, matches: impl Fn(&CacheKey) -> bool) -> usize {
        let removed: Vec<Slot> = {
            let mut state = self.lock();
            let keys: Vec<CacheKey> = state.slots.keys().filter(|key| matches(key)).cloned().collect();
            keys.iter().filter_map(|key| state.slots.remove(key)).collect()
        };
        for slot in removed.iter() {
            if let Slot::Ready(entry) = slot {
                entry.release();
            }
        }
        removed.len()
    }

    /// Drop every expired entry, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let expired: Vec<Arc<CacheEntry>> = {
            let mut state = self.lock();
            let keys: Vec<CacheKey> = state
                .slots
                .iter()
                .filter_map(|(key, slot)| match slot {
                    Slot::Ready(entry) if self.is_expired(entry) => Some(key.clone()),
                    _ => None,
                })
                .collect();
            keys.iter().filter_map(|key| state.remove_ready(key)).collect()
        };
        for entry in expired.iter() {
            entry.release();
        }
        if !expired.is_empty() {
            log::debug!("Purged {} expired cache entries", expired.len());
        }
        expired.len()
    }

    /// Purge expired entries every `period` until the handle is aborted
    pub fn spawn_sweeper(&self, period: Duration) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                manager.purge_expired();
            }
        })
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.lock();
        let mut items: Vec<CacheItemStats> = state
            .slots
            .values()
            .filter_map(|slot| match slot {
                Slot::Ready(entry) => Some(CacheItemStats {
                    source: entry.key.source,
                    experiment_id: entry.key.experiment_id.clone(),
                    age_secs: entry.age().as_secs_f64(),
                    size_bytes: entry.size_bytes(),
                    channels: entry.dataset.channels.len(),
                    progressive: entry.reader.is_some(),
                }),
                Slot::Pending { .. } => None,
            })
            .collect();
        items.sort_by(|a, b| {
            (a.source, &a.experiment_id).cmp(&(b.source, &b.experiment_id))
        });
        CacheStats {
            entries: items.len(),
            pending: state.slots.len() - items.len(),
            ttl_secs: self.inner.ttl.as_secs(),
            capacity: self.inner.capacity,
            items,
        }
    }
}
