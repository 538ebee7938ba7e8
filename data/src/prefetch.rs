//! Predictive cache warming. Watches which (symbol, granularity) pairs the
//! user actually opens, and keeps a small priority queue of the targets they
//! are statistically likely to open next. The engine drains the queue during
//! idle periods; this module only decides *what* is worth fetching.

use std::path::{Path, PathBuf};

use enum_map::EnumMap;
use feed::{ChannelKey, Granularity, Symbol};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// How many queue slots each source tier may fill.
const TRANSITION_SLOTS: usize = 2;
const GRANULARITY_SLOTS: usize = 3;
const SYMBOL_SLOTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefetchReason {
    /// A granularity users commonly flip to from the current one.
    GranularityTransition,
    /// One of this user's most-opened granularities.
    FrequentGranularity,
    /// Another symbol this user watches, at the current granularity.
    FrequentSymbol,
    /// Explicitly requested, bypasses the learned ranking.
    Requested,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefetchTask {
    pub key: ChannelKey,
    /// 1..=10, drained highest first.
    pub priority: u8,
    pub reason: PrefetchReason,
}

/// Learned usage counters, persisted across sessions.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct UsageStats {
    #[serde(default)]
    granularity_uses: EnumMap<Granularity, u64>,
    #[serde(default)]
    symbol_uses: FxHashMap<Symbol, u64>,
    #[serde(default)]
    last_used_ms: FxHashMap<ChannelKey, i64>,
}

impl UsageStats {
    pub fn record(&mut self, key: ChannelKey, now_ms: i64) {
        self.granularity_uses[key.granularity] += 1;
        *self.symbol_uses.entry(key.symbol).or_insert(0) += 1;
        self.last_used_ms.insert(key, now_ms);
    }

    pub fn granularity_count(&self, granularity: Granularity) -> u64 {
        self.granularity_uses[granularity]
    }

    pub fn symbol_count(&self, symbol: Symbol) -> u64 {
        self.symbol_uses.get(&symbol).copied().unwrap_or(0)
    }

    pub fn last_used_ms(&self, key: ChannelKey) -> Option<i64> {
        self.last_used_ms.get(&key).copied()
    }

    /// Granularities by descending use, skipping `exclude` and never-used ones.
    fn ranked_granularities(&self, exclude: Granularity) -> Vec<Granularity> {
        let mut ranked: Vec<(Granularity, u64)> = Granularity::ALL
            .iter()
            .copied()
            .filter(|&g| g != exclude && self.granularity_uses[g] > 0)
            .map(|g| (g, self.granularity_uses[g]))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.into_iter().map(|(g, _)| g).collect()
    }

    /// Symbols by descending use, skipping `exclude` and never-used ones.
    fn ranked_symbols(&self, exclude: Symbol) -> Vec<Symbol> {
        let mut ranked: Vec<(Symbol, u64)> = self
            .symbol_uses
            .iter()
            .filter(|&(&symbol, &count)| symbol != exclude && count > 0)
            .map(|(&symbol, &count)| (symbol, count))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.as_str().cmp(b.0.as_str())));
        ranked.into_iter().map(|(symbol, _)| symbol).collect()
    }
}

/// Where users typically go next from each granularity. Neighbouring zoom
/// levels, finer first for the intraday steps.
fn common_transitions(granularity: Granularity) -> &'static [Granularity] {
    use Granularity::*;
    match granularity {
        M1 => &[M5, M15],
        M5 => &[M15, M1],
        M15 => &[H1, M5],
        H1 => &[H6, M15],
        H6 => &[D1, H1],
        D1 => &[H6, H1],
    }
}

pub struct PrefetchScheduler {
    stats: UsageStats,
    queue: Vec<PrefetchTask>,
    stats_path: PathBuf,
}

impl PrefetchScheduler {
    /// Loads persisted usage stats from `stats_path`; a missing or broken
    /// file just starts the learning over.
    pub fn new(stats_path: PathBuf) -> Self {
        let stats = load_stats(&stats_path);
        Self {
            stats,
            queue: Vec::new(),
            stats_path,
        }
    }

    /// Records that the user opened `key` and rebuilds the task queue around
    /// it. Call on every granularity/symbol switch.
    pub fn track_usage(&mut self, key: ChannelKey) {
        self.track_usage_at(key, chrono::Utc::now().timestamp_millis());
    }

    fn track_usage_at(&mut self, key: ChannelKey, now_ms: i64) {
        self.stats.record(key, now_ms);
        self.rebuild_queue(key);
    }

    /// Front-of-queue insert for an explicit request.
    pub fn request(&mut self, key: ChannelKey) {
        self.queue.retain(|task| task.key != key);
        self.queue.insert(
            0,
            PrefetchTask {
                key,
                priority: 10,
                reason: PrefetchReason::Requested,
            },
        );
    }

    /// Highest-priority pending task, removed from the queue.
    pub fn pop_task(&mut self) -> Option<PrefetchTask> {
        if self.queue.is_empty() {
            None
        } else {
            Some(self.queue.remove(0))
        }
    }

    pub fn queue(&self) -> &[PrefetchTask] {
        &self.queue
    }

    pub fn stats(&self) -> &UsageStats {
        &self.stats
    }

    /// Writes the learned stats to disk. Persistence is an optimization;
    /// failures are logged and swallowed.
    pub fn persist(&self) {
        let json = match serde_json::to_string(&self.stats) {
            Ok(json) => json,
            Err(e) => {
                log::warn!("Could not serialize usage stats: {e}");
                return;
            }
        };
        if let Err(e) = crate::write_json_to_file(&json, &self.stats_path) {
            log::warn!("Could not persist usage stats: {e}");
        }
    }

    fn rebuild_queue(&mut self, current: ChannelKey) {
        let mut queue: Vec<PrefetchTask> = Vec::new();

        let mut enqueue = |key: ChannelKey, priority: u8, reason: PrefetchReason| {
            if key != current && !queue.iter().any(|task| task.key == key) {
                queue.push(PrefetchTask {
                    key,
                    priority,
                    reason,
                });
            }
        };

        let mut priority = 10u8;
        for &granularity in common_transitions(current.granularity)
            .iter()
            .take(TRANSITION_SLOTS)
        {
            enqueue(
                ChannelKey::new(current.symbol, granularity),
                priority,
                PrefetchReason::GranularityTransition,
            );
            priority = priority.saturating_sub(1).max(1);
        }

        let mut priority = 7u8;
        for granularity in self
            .stats
            .ranked_granularities(current.granularity)
            .into_iter()
            .take(GRANULARITY_SLOTS)
        {
            enqueue(
                ChannelKey::new(current.symbol, granularity),
                priority,
                PrefetchReason::FrequentGranularity,
            );
            priority = priority.saturating_sub(1).max(1);
        }

        let mut priority = 4u8;
        for symbol in self
            .stats
            .ranked_symbols(current.symbol)
            .into_iter()
            .take(SYMBOL_SLOTS)
        {
            enqueue(
                ChannelKey::new(symbol, current.granularity),
                priority,
                PrefetchReason::FrequentSymbol,
            );
            priority = priority.saturating_sub(1).max(1);
        }

        queue.sort_by(|a, b| b.priority.cmp(&a.priority));
        self.queue = queue;
    }
}

fn load_stats(path: &Path) -> UsageStats {
    match crate::read_from_file::<UsageStats>(path) {
        Ok(stats) => stats,
        Err(crate::DataError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            UsageStats::default()
        }
        Err(e) => {
            log::warn!("Starting usage stats from scratch: {e}");
            UsageStats::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(symbol: &str, granularity: Granularity) -> ChannelKey {
        ChannelKey::new(Symbol::new(symbol), granularity)
    }

    fn scheduler() -> PrefetchScheduler {
        let dir = std::env::temp_dir().join("candlestream-prefetch-missing");
        PrefetchScheduler::new(dir.join("no-such-stats.json"))
    }

    #[test]
    fn transitions_lead_the_queue() {
        let mut scheduler = scheduler();
        scheduler.track_usage_at(key("BTC-USD", Granularity::M1), 1_000);

        let queue = scheduler.queue();
        assert_eq!(queue[0].key, key("BTC-USD", Granularity::M5));
        assert_eq!(queue[0].priority, 10);
        assert_eq!(queue[0].reason, PrefetchReason::GranularityTransition);
        assert_eq!(queue[1].key, key("BTC-USD", Granularity::M15));
        assert_eq!(queue[1].priority, 9);
    }

    #[test]
    fn learned_granularities_fill_the_middle() {
        let mut scheduler = scheduler();
        for _ in 0..5 {
            scheduler.track_usage_at(key("BTC-USD", Granularity::H6), 1_000);
        }
        scheduler.track_usage_at(key("BTC-USD", Granularity::M1), 2_000);

        let h6 = scheduler
            .queue()
            .iter()
            .find(|task| task.key.granularity == Granularity::H6)
            .expect("well-used granularity is queued");
        assert_eq!(h6.reason, PrefetchReason::FrequentGranularity);
        assert!(h6.priority < 9, "below the static transitions");
        assert!(h6.priority >= 5);
    }

    #[test]
    fn other_symbols_rank_lowest() {
        let mut scheduler = scheduler();
        for _ in 0..3 {
            scheduler.track_usage_at(key("ETH-USD", Granularity::M1), 1_000);
        }
        scheduler.track_usage_at(key("BTC-USD", Granularity::M1), 2_000);

        let eth = scheduler
            .queue()
            .iter()
            .find(|task| task.key.symbol == Symbol::new("ETH-USD"))
            .expect("frequent symbol is queued");
        assert_eq!(eth.key.granularity, Granularity::M1);
        assert_eq!(eth.reason, PrefetchReason::FrequentSymbol);
        assert!(eth.priority <= 4);

        // and it drains after every transition task
        let mut drained = Vec::new();
        let mut s = scheduler;
        while let Some(task) = s.pop_task() {
            drained.push(task);
        }
        let eth_pos = drained
            .iter()
            .position(|t| t.key.symbol == Symbol::new("ETH-USD"))
            .unwrap();
        let last_transition = drained
            .iter()
            .rposition(|t| t.reason == PrefetchReason::GranularityTransition)
            .unwrap();
        assert!(eth_pos > last_transition);
    }

    #[test]
    fn current_target_is_never_queued() {
        let mut scheduler = scheduler();
        for _ in 0..5 {
            scheduler.track_usage_at(key("BTC-USD", Granularity::M1), 1_000);
        }

        assert!(
            scheduler
                .queue()
                .iter()
                .all(|task| task.key != key("BTC-USD", Granularity::M1))
        );
    }

    #[test]
    fn overlapping_sources_keep_the_higher_slot() {
        let mut scheduler = scheduler();
        // make H1 both a static transition from M15 and the most-used granularity
        for _ in 0..10 {
            scheduler.track_usage_at(key("BTC-USD", Granularity::H1), 1_000);
        }
        scheduler.track_usage_at(key("BTC-USD", Granularity::M15), 2_000);

        let h1_tasks: Vec<&PrefetchTask> = scheduler
            .queue()
            .iter()
            .filter(|task| task.key.granularity == Granularity::H1)
            .collect();
        assert_eq!(h1_tasks.len(), 1, "queued once, not once per source");
        assert_eq!(h1_tasks[0].priority, 10);
        assert_eq!(h1_tasks[0].reason, PrefetchReason::GranularityTransition);
    }

    #[test]
    fn explicit_request_jumps_the_queue() {
        let mut scheduler = scheduler();
        scheduler.track_usage_at(key("BTC-USD", Granularity::M1), 1_000);
        scheduler.request(key("DOGE-USD", Granularity::D1));

        let head = scheduler.pop_task().unwrap();
        assert_eq!(head.key, key("DOGE-USD", Granularity::D1));
        assert_eq!(head.reason, PrefetchReason::Requested);
    }

    #[test]
    fn stats_survive_a_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usage-stats.json");

        {
            let mut scheduler = PrefetchScheduler::new(path.clone());
            for _ in 0..4 {
                scheduler.track_usage_at(key("ETH-USD", Granularity::H1), 1_000);
            }
            scheduler.track_usage_at(key("BTC-USD", Granularity::M1), 2_000);
            scheduler.persist();
        }

        let restored = PrefetchScheduler::new(path);
        assert_eq!(restored.stats().granularity_count(Granularity::H1), 4);
        assert_eq!(restored.stats().symbol_count(Symbol::new("ETH-USD")), 4);
        assert_eq!(
            restored.stats().last_used_ms(key("BTC-USD", Granularity::M1)),
            Some(2_000)
        );
    }

    #[test]
    fn corrupt_stats_file_starts_clean() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usage-stats.json");
        std::fs::write(&path, "{ broken").unwrap();

        let scheduler = PrefetchScheduler::new(path);
        assert_eq!(scheduler.stats().granularity_count(Granularity::M1), 0);
        assert!(dir.path().join("usage-stats_old.json").exists());
    }
}
