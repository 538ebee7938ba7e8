use feed::Candle;

/// Default number of rows allocated up front. Covers a full day of minute
/// candles at two growth steps, which is the common first view.
pub const INITIAL_CAPACITY: usize = 512;

/// Partial in-place edit of one stored candle. Unset fields keep their value.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CandlePatch {
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub volume: Option<f64>,
}

impl CandlePatch {
    pub fn close(value: f64) -> Self {
        Self {
            close: Some(value),
            ..Self::default()
        }
    }

    pub fn from_candle(candle: &Candle) -> Self {
        Self {
            open: Some(candle.open),
            high: Some(candle.high),
            low: Some(candle.low),
            close: Some(candle.close),
            volume: Some(candle.volume),
        }
    }

    pub fn touches_price(&self) -> bool {
        self.open.is_some() || self.high.is_some() || self.low.is_some() || self.close.is_some()
    }

    pub fn touches_volume(&self) -> bool {
        self.volume.is_some()
    }
}

/// What [`ColumnarCandleStore::merge_from`] did with a delta batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub appended: usize,
    pub overwritten: usize,
    pub dropped: usize,
}

impl MergeOutcome {
    pub fn changed(&self) -> bool {
        self.appended > 0 || self.overwritten > 0
    }
}

/// Column-oriented candle storage. One flat allocation per field keeps the
/// per-frame render reads (all closes, all times) cache-friendly, and the
/// live-edge update writes six scalars without touching any row machinery.
///
/// Timestamps are strictly increasing, so lookups are a binary search and
/// appends only ever touch the tail. Capacity grows by half steps and is
/// kept across [`clear`](Self::clear), so flipping between timeframes on the
/// same view reuses the allocation instead of churning it.
pub struct ColumnarCandleStore {
    time: Box<[i64]>,
    open: Box<[f64]>,
    high: Box<[f64]>,
    low: Box<[f64]>,
    close: Box<[f64]>,
    volume: Box<[f64]>,
    len: usize,
    reallocations: usize,
}

impl Default for ColumnarCandleStore {
    fn default() -> Self {
        Self::with_capacity(INITIAL_CAPACITY)
    }
}

impl ColumnarCandleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            time: vec![0; capacity].into_boxed_slice(),
            open: vec![0.0; capacity].into_boxed_slice(),
            high: vec![0.0; capacity].into_boxed_slice(),
            low: vec![0.0; capacity].into_boxed_slice(),
            close: vec![0.0; capacity].into_boxed_slice(),
            volume: vec![0.0; capacity].into_boxed_slice(),
            len: 0,
            reallocations: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.time.len()
    }

    /// How many times the columns were reallocated since construction.
    /// Grows with the logarithm of the row count, not linearly.
    pub fn reallocations(&self) -> usize {
        self.reallocations
    }

    /// Bytes held by the column allocations at current capacity.
    pub fn memory_bytes(&self) -> usize {
        let row = size_of::<i64>() + 5 * size_of::<f64>();
        self.capacity() * row
    }

    /// Sorted timestamps of the live rows.
    pub fn times(&self) -> &[i64] {
        &self.time[..self.len]
    }

    pub fn first_time(&self) -> Option<i64> {
        self.times().first().copied()
    }

    pub fn last_time(&self) -> Option<i64> {
        self.times().last().copied()
    }

    pub fn candle_at(&self, index: usize) -> Option<Candle> {
        if index >= self.len {
            return None;
        }
        Some(Candle {
            time: self.time[index],
            open: self.open[index],
            high: self.high[index],
            low: self.low[index],
            close: self.close[index],
            volume: self.volume[index],
        })
    }

    pub fn first(&self) -> Option<Candle> {
        self.candle_at(0)
    }

    pub fn last(&self) -> Option<Candle> {
        self.candle_at(self.len.checked_sub(1)?)
    }

    /// Binary search over the time column. `None` when no row has exactly
    /// this timestamp.
    pub fn find_by_time(&self, time: i64) -> Option<usize> {
        let times = self.times();
        let idx = times.partition_point(|&t| t < time);
        (idx < times.len() && times[idx] == time).then_some(idx)
    }

    /// Index of the first row at or after `time`.
    pub fn position_at_or_after(&self, time: i64) -> usize {
        self.times().partition_point(|&t| t < time)
    }

    /// Appends one candle at the tail. Rows that would break the strictly
    /// increasing time order, or carry broken fields, are logged and dropped
    /// rather than stored.
    pub fn push(&mut self, candle: Candle) -> bool {
        if let Some(reason) = candle.integrity_error() {
            log::warn!("Dropping candle t={}: {}", candle.time, reason);
            return false;
        }
        if let Some(last) = self.last_time()
            && candle.time <= last
        {
            log::warn!(
                "Dropping out-of-order candle: t={} after t={}",
                candle.time,
                last
            );
            return false;
        }

        self.reserve(1);
        let i = self.len;
        self.time[i] = candle.time;
        self.write_fields(i, &candle);
        self.len = i + 1;
        true
    }

    /// Appends many candles, returning how many were accepted.
    pub fn push_batch(&mut self, candles: &[Candle]) -> usize {
        self.reserve(candles.len());
        candles.iter().filter(|c| self.push(**c)).count()
    }

    /// Rewrites fields of an existing row in place. The timestamp is fixed at
    /// append time and cannot be patched. Returns false for an out-of-range
    /// index.
    pub fn update(&mut self, index: usize, patch: &CandlePatch) -> bool {
        if index >= self.len {
            log::warn!("Update to index {index} outside live rows ({})", self.len);
            return false;
        }
        if let Some(v) = patch.open {
            self.open[index] = v;
        }
        if let Some(v) = patch.high {
            self.high[index] = v;
        }
        if let Some(v) = patch.low {
            self.low[index] = v;
        }
        if let Some(v) = patch.close {
            self.close[index] = v;
        }
        if let Some(v) = patch.volume {
            self.volume[index] = v;
        }
        true
    }

    /// Folds a sorted-by-time batch in: rows with a matching timestamp are
    /// overwritten with the incoming values, rows past the tail are appended.
    /// Times that would land between existing rows are dropped with a warning
    /// since the columns never shift. Running the same batch twice leaves the
    /// store unchanged the second time.
    pub fn merge_from(&mut self, candles: &[Candle]) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();

        for candle in candles {
            if let Some(index) = self.find_by_time(candle.time) {
                if candle.integrity_error().is_none() {
                    self.write_fields(index, candle);
                    outcome.overwritten += 1;
                } else {
                    outcome.dropped += 1;
                }
            } else if self.last_time().is_none_or(|last| candle.time > last) {
                if self.push(*candle) {
                    outcome.appended += 1;
                } else {
                    outcome.dropped += 1;
                }
            } else {
                log::warn!(
                    "Dropping merge candle t={}: no slot between existing rows",
                    candle.time
                );
                outcome.dropped += 1;
            }
        }

        outcome
    }

    /// Forgets all rows but keeps the allocation.
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Row-major copy of the live rows.
    pub fn snapshot(&self) -> Vec<Candle> {
        (0..self.len)
            .map(|i| Candle {
                time: self.time[i],
                open: self.open[i],
                high: self.high[i],
                low: self.low[i],
                close: self.close[i],
                volume: self.volume[i],
            })
            .collect()
    }

    /// Copy of the rows with `start_time <= time <= end_time`.
    pub fn range(&self, start_time: i64, end_time: i64) -> Vec<Candle> {
        let times = self.times();
        let from = times.partition_point(|&t| t < start_time);
        let to = times.partition_point(|&t| t <= end_time);
        (from..to).filter_map(|i| self.candle_at(i)).collect()
    }

    /// Copy of the last `count` rows, fewer when the store is shorter.
    pub fn tail(&self, count: usize) -> Vec<Candle> {
        let start = self.len.saturating_sub(count);
        (start..self.len)
            .filter_map(|i| self.candle_at(i))
            .collect()
    }

    /// Timestamps missing from a contiguous run, if any. The stream can skip
    /// buckets when the upstream feed hiccups; the caller decides whether to
    /// backfill.
    pub fn missing_times(&self, step_secs: u64) -> Option<Vec<i64>> {
        let times = self.times();
        let (first, last) = (*times.first()?, *times.last()?);
        let step = step_secs as i64;
        if step <= 0 {
            return None;
        }

        let expected = ((last - first) / step + 1) as usize;
        if expected == times.len() {
            return None;
        }

        let mut missing = Vec::with_capacity(expected - times.len());
        let mut cursor = first;
        let mut i = 0;
        while cursor <= last {
            if i < times.len() && times[i] == cursor {
                i += 1;
            } else {
                missing.push(cursor);
            }
            cursor += step;
        }

        if missing.is_empty() {
            None
        } else {
            log::warn!("Series has {} missing candles", missing.len());
            Some(missing)
        }
    }

    fn write_fields(&mut self, index: usize, candle: &Candle) {
        self.open[index] = candle.open;
        self.high[index] = candle.high;
        self.low[index] = candle.low;
        self.close[index] = candle.close;
        self.volume[index] = candle.volume;
    }

    fn reserve(&mut self, additional: usize) {
        let needed = self.len + additional;
        if needed <= self.capacity() {
            return;
        }

        let mut new_cap = self.capacity().max(1);
        while new_cap < needed {
            // half-step growth: ceil(cap * 1.5)
            new_cap = (new_cap * 3).div_ceil(2);
        }

        self.time = grow_column(&self.time, self.len, new_cap, 0);
        self.open = grow_column(&self.open, self.len, new_cap, 0.0);
        self.high = grow_column(&self.high, self.len, new_cap, 0.0);
        self.low = grow_column(&self.low, self.len, new_cap, 0.0);
        self.close = grow_column(&self.close, self.len, new_cap, 0.0);
        self.volume = grow_column(&self.volume, self.len, new_cap, 0.0);
        self.reallocations += 1;
    }
}

fn grow_column<T: Copy>(column: &[T], len: usize, new_cap: usize, fill: T) -> Box<[T]> {
    let mut next = vec![fill; new_cap].into_boxed_slice();
    next[..len].copy_from_slice(&column[..len]);
    next
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(time: i64, close: f64) -> Candle {
        Candle {
            time,
            open: close - 1.0,
            high: close + 1.0,
            low: close - 2.0,
            close,
            volume: 10.0,
        }
    }

    #[test]
    fn lookup_after_batch_append() {
        let mut store = ColumnarCandleStore::new();
        store.push_batch(&[candle(1, 100.0), candle(2, 101.0)]);

        assert_eq!(store.find_by_time(2), Some(1));
        assert!(store.update(1, &CandlePatch::close(105.0)));

        let last = store.last().unwrap();
        assert_eq!(last.time, 2);
        assert_eq!(last.close, 105.0);
        // untouched fields keep their values
        assert_eq!(last.open, 100.0);
    }

    #[test]
    fn out_of_order_appends_are_dropped() {
        let mut store = ColumnarCandleStore::new();
        assert!(store.push(candle(60, 1.0)));
        assert!(!store.push(candle(60, 2.0)));
        assert!(!store.push(candle(30, 3.0)));
        assert!(store.push(candle(120, 4.0)));

        assert_eq!(store.len(), 2);
        assert_eq!(store.times(), &[60, 120]);
        // the rejected duplicate never overwrote the stored row
        assert_eq!(store.candle_at(0).unwrap().close, 1.0);
    }

    #[test]
    fn broken_fields_never_enter_the_columns() {
        let mut store = ColumnarCandleStore::new();
        let mut bad = candle(60, 1.0);
        bad.volume = -5.0;
        let mut inverted = candle(120, 1.0);
        inverted.high = inverted.low - 1.0;

        let accepted = store.push_batch(&[candle(30, 1.0), bad, inverted, candle(180, 2.0)]);
        assert_eq!(accepted, 2);
        assert_eq!(store.times(), &[30, 180]);
    }

    #[test]
    fn growth_keeps_reallocations_logarithmic() {
        let mut store = ColumnarCandleStore::with_capacity(8);
        for i in 0..10_000 {
            assert!(store.push(candle(i * 60, 1.0)));
        }

        assert_eq!(store.len(), 10_000);
        // 8 * 1.5^k >= 10_000 at k = 18; far fewer grows than rows
        assert!(store.reallocations() <= 20, "{}", store.reallocations());
        assert!(store.capacity() >= 10_000);
    }

    #[test]
    fn capacity_survives_clear() {
        let mut store = ColumnarCandleStore::with_capacity(4);
        for i in 0..100 {
            store.push(candle(i * 60, 1.0));
        }
        let (cap, reallocs) = (store.capacity(), store.reallocations());

        store.clear();
        assert!(store.is_empty());
        assert_eq!(store.capacity(), cap);

        for i in 0..100 {
            store.push(candle(i * 60, 1.0));
        }
        assert_eq!(store.reallocations(), reallocs, "refill fits the old allocation");
    }

    #[test]
    fn last_row_update_never_grows() {
        let mut store = ColumnarCandleStore::with_capacity(4);
        store.push_batch(&[candle(60, 1.0), candle(120, 2.0)]);
        let reallocs = store.reallocations();

        for _ in 0..1_000 {
            let i = store.len() - 1;
            store.update(i, &CandlePatch::close(3.0));
        }
        assert_eq!(store.reallocations(), reallocs);
        assert_eq!(store.last().unwrap().close, 3.0);
    }

    #[test]
    fn merge_overwrites_overlap_and_appends_tail() {
        let mut store = ColumnarCandleStore::new();
        store.push_batch(&[candle(60, 1.0), candle(120, 2.0), candle(180, 3.0)]);

        let delta = [candle(120, 2.5), candle(180, 3.5), candle(240, 4.0)];
        let outcome = store.merge_from(&delta);
        assert_eq!(outcome.overwritten, 2);
        assert_eq!(outcome.appended, 1);

        assert_eq!(store.times(), &[60, 120, 180, 240]);
        assert_eq!(store.candle_at(1).unwrap().close, 2.5);

        // a second pass with the same delta is a no-op in effect
        let again = store.merge_from(&delta);
        assert_eq!(again.appended, 0);
        assert_eq!(again.overwritten, 3);
        assert_eq!(store.snapshot().len(), 4);
        assert_eq!(store.candle_at(1).unwrap().close, 2.5);
    }

    #[test]
    fn time_range_is_inclusive_on_both_ends() {
        let mut store = ColumnarCandleStore::new();
        store.push_batch(&[candle(60, 1.0), candle(120, 2.0), candle(180, 3.0), candle(240, 4.0)]);

        let rows = store.range(120, 180);
        let times: Vec<i64> = rows.iter().map(|c| c.time).collect();
        assert_eq!(times, vec![120, 180]);

        assert!(store.range(250, 400).is_empty());
        assert_eq!(store.range(0, 1_000).len(), 4);
    }

    #[test]
    fn detects_missing_buckets() {
        let mut store = ColumnarCandleStore::new();
        store.push_batch(&[candle(60, 1.0), candle(120, 2.0), candle(240, 4.0)]);

        let missing = store.missing_times(60).unwrap();
        assert_eq!(missing, vec![180]);

        let mut full = ColumnarCandleStore::new();
        full.push_batch(&[candle(60, 1.0), candle(120, 2.0)]);
        assert!(full.missing_times(60).is_none());
    }
}
