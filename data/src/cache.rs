//! Two-tier candle cache. The hot tier holds column stores in memory under a
//! byte budget; the durable tier keeps a handful of JSON records on disk so a
//! restart warms up with a delta fetch instead of a full history pull.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use feed::{Candle, ChannelKey};
use rustc_hash::FxHashMap;

use crate::durable::DurableCandleCache;
use crate::series::{ColumnarCandleStore, MergeOutcome};

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Hot tier ceiling over the summed column allocations.
    pub hot_budget_bytes: usize,
    /// Share of hot entries dropped per eviction pass.
    pub evict_fraction: f64,
    /// How many (symbol, granularity) records the disk tier keeps.
    pub durable_max_records: usize,
    /// Entries younger than this serve without a refetch.
    pub freshness_window: Duration,
    pub durable_dir: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            hot_budget_bytes: 64 * 1024 * 1024,
            evict_fraction: 0.25,
            durable_max_records: 5,
            freshness_window: Duration::from_secs(5 * 60),
            durable_dir: crate::data_path(Some("cache")),
        }
    }
}

/// Point-in-time counters, taken with [`TieredCache::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hot_hits: u64,
    pub durable_hits: u64,
    pub misses: u64,
    pub evicted_entries: u64,
    pub hot_entries: usize,
    pub hot_bytes: usize,
}

impl CacheStats {
    /// Fraction of lookups served from either tier, 0.0 when nothing was
    /// looked up yet.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hot_hits + self.durable_hits;
        let total = hits + self.misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

struct CacheEntry {
    store: ColumnarCandleStore,
    last_write_ms: i64,
    last_access_ms: i64,
    hit_count: u64,
}

pub struct TieredCache {
    hot: FxHashMap<ChannelKey, CacheEntry>,
    durable: DurableCandleCache,
    config: CacheConfig,
    hot_hits: u64,
    durable_hits: u64,
    misses: u64,
    evicted: u64,
}

impl TieredCache {
    pub fn new(config: CacheConfig) -> Self {
        let durable =
            DurableCandleCache::new(config.durable_dir.clone(), config.durable_max_records);
        Self {
            hot: FxHashMap::default(),
            durable,
            config,
            hot_hits: 0,
            durable_hits: 0,
            misses: 0,
            evicted: 0,
        }
    }

    pub fn freshness_window(&self) -> Duration {
        self.config.freshness_window
    }

    /// Hot lookup first; a disk record is promoted into the hot tier on the
    /// way out. `None` means both tiers missed.
    pub fn get(&mut self, key: ChannelKey) -> Option<Vec<Candle>> {
        self.get_at(key, now_ms())
    }

    /// Replaces the cached series for `key` with `candles` and writes the
    /// record through to disk.
    pub fn set(&mut self, key: ChannelKey, candles: &[Candle]) {
        self.set_at(key, candles, now_ms());
    }

    /// Merges freshly fetched candles into the cached series for `key`:
    /// overwrite on timestamp collision, append past the tail, and rebuild
    /// sorted when the batch lands between existing rows. Applying the same
    /// batch twice leaves the series as if applied once.
    pub fn append_delta(&mut self, key: ChannelKey, incoming: &[Candle]) -> MergeOutcome {
        self.append_delta_at(key, incoming, now_ms())
    }

    pub fn is_fresh(&self, key: ChannelKey, max_age: Duration) -> bool {
        self.is_fresh_at(key, max_age, now_ms())
    }

    /// Last stored candle timestamp for `key`, the start of the next delta
    /// fetch range. Answered from the manifest when the entry is not hot.
    pub fn last_candle_time(&self, key: ChannelKey) -> Option<i64> {
        if let Some(entry) = self.hot.get(&key) {
            return entry.store.last_time();
        }
        self.durable.meta(key).map(|meta| meta.last_candle_time)
    }

    /// Drops `key` from both tiers.
    pub fn invalidate(&mut self, key: ChannelKey) {
        self.hot.remove(&key);
        self.durable.remove(key);
    }

    /// One eviction pass over the hot tier, dropping the configured share of
    /// entries with the worst idle-time-per-hit score.
    pub fn evict_oldest(&mut self) {
        self.evict_pass_at(now_ms());
    }

    pub fn contains_hot(&self, key: ChannelKey) -> bool {
        self.hot.contains_key(&key)
    }

    pub fn hot_bytes(&self) -> usize {
        self.hot.values().map(|e| e.store.memory_bytes()).sum()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hot_hits: self.hot_hits,
            durable_hits: self.durable_hits,
            misses: self.misses,
            evicted_entries: self.evicted,
            hot_entries: self.hot.len(),
            hot_bytes: self.hot_bytes(),
        }
    }

    fn get_at(&mut self, key: ChannelKey, now: i64) -> Option<Vec<Candle>> {
        if let Some(entry) = self.hot.get_mut(&key) {
            entry.hit_count += 1;
            entry.last_access_ms = now;
            self.hot_hits += 1;
            return Some(entry.store.snapshot());
        }

        if let Some(record) = self.durable.load(key) {
            let mut store = ColumnarCandleStore::new();
            store.push_batch(&record.candles);
            let snapshot = store.snapshot();

            self.hot.insert(
                key,
                CacheEntry {
                    store,
                    // freshness keeps following the on-disk write time
                    last_write_ms: record.written_ms,
                    last_access_ms: now,
                    hit_count: 1,
                },
            );
            self.durable_hits += 1;
            self.enforce_budget_at(now);
            return Some(snapshot);
        }

        self.misses += 1;
        None
    }

    fn set_at(&mut self, key: ChannelKey, candles: &[Candle], now: i64) {
        let mut store = ColumnarCandleStore::new();
        store.push_batch(candles);
        let snapshot = store.snapshot();

        self.hot.insert(
            key,
            CacheEntry {
                store,
                last_write_ms: now,
                last_access_ms: now,
                hit_count: 0,
            },
        );
        self.durable.store(key, &snapshot, now);
        self.enforce_budget_at(now);
    }

    fn append_delta_at(
        &mut self,
        key: ChannelKey,
        incoming: &[Candle],
        now: i64,
    ) -> MergeOutcome {
        let mut sorted: Vec<Candle> = incoming.to_vec();
        sorted.sort_by_key(|c| c.time);

        if !self.hot.contains_key(&key) {
            let candles = self.durable.load(key).map(|r| r.candles).unwrap_or_default();
            let mut store = ColumnarCandleStore::new();
            store.push_batch(&candles);
            self.hot.insert(
                key,
                CacheEntry {
                    store,
                    last_write_ms: now,
                    last_access_ms: now,
                    hit_count: 0,
                },
            );
        }

        let Some(entry) = self.hot.get_mut(&key) else {
            return MergeOutcome::default();
        };

        let needs_rebuild = sorted.iter().any(|c| {
            entry.store.last_time().is_some_and(|last| c.time < last)
                && entry.store.find_by_time(c.time).is_none()
        });

        let outcome = if needs_rebuild {
            rebuild_sorted(&mut entry.store, &sorted)
        } else {
            entry.store.merge_from(&sorted)
        };

        entry.last_write_ms = now;
        entry.last_access_ms = now;
        let snapshot = entry.store.snapshot();
        self.durable.store(key, &snapshot, now);
        self.enforce_budget_at(now);
        outcome
    }

    fn is_fresh_at(&self, key: ChannelKey, max_age: Duration, now: i64) -> bool {
        let written_ms = if let Some(entry) = self.hot.get(&key) {
            Some(entry.last_write_ms)
        } else {
            self.durable.meta(key).map(|meta| meta.written_ms)
        };

        match written_ms {
            Some(written) => now.saturating_sub(written) < max_age.as_millis() as i64,
            None => false,
        }
    }

    fn enforce_budget_at(&mut self, now: i64) {
        while self.hot_bytes() > self.config.hot_budget_bytes && !self.hot.is_empty() {
            self.evict_pass_at(now);
        }
    }

    fn evict_pass_at(&mut self, now: i64) {
        if self.hot.is_empty() {
            return;
        }

        let count = ((self.hot.len() as f64 * self.config.evict_fraction).ceil() as usize).max(1);

        // recently used and frequently hit entries survive the pass
        let mut scored: Vec<(ChannelKey, f64)> = self
            .hot
            .iter()
            .map(|(key, entry)| {
                let idle = now.saturating_sub(entry.last_access_ms).max(0) as f64;
                (*key, idle / (1.0 + entry.hit_count as f64))
            })
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));

        for (key, _) in scored.into_iter().take(count) {
            log::debug!("Evicting hot cache entry for {key}");
            self.hot.remove(&key);
            self.evicted += 1;
        }
    }
}

/// Rebuild path for deltas that land between existing rows: fold both sides
/// into time order with the incoming value winning each collision.
fn rebuild_sorted(store: &mut ColumnarCandleStore, sorted: &[Candle]) -> MergeOutcome {
    let mut merged: BTreeMap<i64, Candle> = store
        .snapshot()
        .into_iter()
        .map(|c| (c.time, c))
        .collect();

    let mut outcome = MergeOutcome::default();
    for candle in sorted {
        if candle.integrity_error().is_some() {
            outcome.dropped += 1;
            continue;
        }
        if merged.insert(candle.time, *candle).is_some() {
            outcome.overwritten += 1;
        } else {
            outcome.appended += 1;
        }
    }

    store.clear();
    let rows: Vec<Candle> = merged.into_values().collect();
    store.push_batch(&rows);
    outcome
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
