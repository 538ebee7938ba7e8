//! Timeframe reload sequencing. Exactly one reload wins at a time: the
//! facade stamps every request with a generation number, and a sequence
//! that observes a newer generation after any await abandons its remaining
//! work and rolls the previous series back.

use super::*;

use std::fmt;

/// A (symbol, granularity, period) combination the view wants to show.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReloadTarget {
    pub symbol: Symbol,
    pub granularity: Granularity,
    pub period: Period,
}

impl ReloadTarget {
    pub fn key(&self) -> ChannelKey {
        ChannelKey::new(self.symbol, self.granularity)
    }

    pub(super) fn view(&self) -> ActiveView {
        ActiveView {
            symbol: self.symbol,
            granularity: self.granularity,
            period: self.period,
        }
    }
}

impl fmt::Display for ReloadTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} over {}", self.symbol, self.granularity, self.period)
    }
}

enum ReloadOutcome {
    Applied { rows: usize, from_cache: bool },
    Superseded,
}

impl Engine {
    pub(super) fn is_stale(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) != generation
    }

    pub(super) async fn maybe_reload(&mut self, target: ReloadTarget, generation: u64) {
        if self.is_stale(generation) {
            // a newer request is queued right behind this one
            log::debug!("Skipping superseded reload to {target}");
            return;
        }
        if target.view() == self.active && !self.store.is_empty() {
            log::debug!("Already showing {target}");
            return;
        }

        self.notify(EngineEvent::ReloadStarted { target });
        match self.run_reload(target, generation).await {
            Ok(ReloadOutcome::Applied { rows, from_cache }) => {
                log::info!("Reloaded {target}: {rows} rows (cache hit: {from_cache})");
                self.notify(EngineEvent::ReloadCompleted {
                    target,
                    rows,
                    from_cache,
                });
            }
            Ok(ReloadOutcome::Superseded) => {
                log::debug!("Reload to {target} superseded mid-flight");
            }
            Err(e) => {
                log::warn!("Reload to {target} failed: {e}");
                self.notify(EngineEvent::ReloadFailed {
                    target,
                    message: e.user_facing_message(),
                });
            }
        }
    }

    async fn run_reload(
        &mut self,
        target: ReloadTarget,
        generation: u64,
    ) -> Result<ReloadOutcome, FeedError> {
        // Give notice listeners a turn to render the loading state before
        // the heavy part starts.
        tokio::task::yield_now().await;
        if self.is_stale(generation) {
            return Ok(ReloadOutcome::Superseded);
        }

        let previous_view = self.active;
        let previous_key = previous_view.key();
        let new_key = target.key();

        // Live updates stop before the store is touched. A subscriber that
        // still wants the outgoing channel keeps it open; its batches no
        // longer reach the active store either way.
        self.resubscribe = None;
        if !self.subscribers.contains_key(&previous_key) {
            self.stream.unsubscribe(previous_key).await;
        }

        // Park the outgoing series in the cache: a quick flip back becomes
        // a hot hit, and a failed reload needs something to restore.
        let previous_rows = self.store.snapshot();
        if !previous_rows.is_empty() {
            self.cache.set(previous_key, &previous_rows);
        }

        self.store.clear();
        self.tracker.reset(previous_key);
        self.fetches.clear();

        // Publish the new target before any fetch so concurrent readers
        // already see where the view is headed.
        self.active = target.view();
        self.active_tx.send_replace(self.active);

        match self.populate(target, generation).await {
            Ok(ReloadOutcome::Applied { rows, from_cache }) => {
                self.warn_on_gaps(target);
                self.scheduler.track_usage(new_key);
                self.scheduler.persist();
                if !target.period.is_long_horizon() {
                    self.emit_reposition(target);
                }
                self.resubscribe = Some(Resubscribe {
                    at: Instant::now() + self.config.resubscribe_delay(),
                    key: new_key,
                });
                Ok(ReloadOutcome::Applied { rows, from_cache })
            }
            Ok(ReloadOutcome::Superseded) => {
                // the superseding target may be the restored view itself; its
                // reload then no-ops on the already-filled store, leaving the
                // restore's resubscribe timer as the only path back to live
                // updates
                self.restore_previous(previous_view, &previous_rows);
                Ok(ReloadOutcome::Superseded)
            }
            Err(e) => {
                self.restore_previous(previous_view, &previous_rows);
                Err(e)
            }
        }
    }

    /// Fill the empty store for `target`: cache hit serves directly, a stale
    /// hit gets its tail synced, a miss costs a full historical fetch.
    async fn populate(
        &mut self,
        target: ReloadTarget,
        generation: u64,
    ) -> Result<ReloadOutcome, FeedError> {
        let key = target.key();

        if let Some(cached) = self.cache.get(key).filter(|rows| !rows.is_empty()) {
            let fresh = self.cache.is_fresh(key, self.cache.freshness_window());
            self.store.push_batch(&cached);

            if !fresh {
                // Serve the stale copy right away, then sync the tail. The
                // last cached bucket is refetched since it may have been
                // half-built when it was stored.
                let start = cached.last().map_or(0, |c| c.time);
                let end = key.granularity.bucket_start(now_secs());
                match self.fetch_checked(key, start, end, generation).await {
                    Ok(Some(delta)) => {
                        self.cache.append_delta(key, &delta);
                        self.store.merge_from(&delta);
                    }
                    Ok(None) => return Ok(ReloadOutcome::Superseded),
                    Err(e) => {
                        // stale-but-served: the cached rows stay up and the
                        // next reload tries the sync again
                        log::warn!("Delta sync for {key} failed, serving cached rows: {e}");
                    }
                }
            }

            if target.period.is_long_horizon() {
                self.emit_reposition(target);
            }
            return Ok(ReloadOutcome::Applied {
                rows: self.store.len(),
                from_cache: true,
            });
        }

        let end = key.granularity.bucket_start(now_secs());
        let start = end - target.period.span_secs() as i64;
        let candles = match self.fetch_checked(key, start, end, generation).await? {
            Some(candles) => candles,
            None => return Ok(ReloadOutcome::Superseded),
        };

        self.cache.set(key, &candles);
        let rows = self.store.push_batch(&candles);
        if target.period.is_long_horizon() {
            self.emit_reposition(target);
        }
        Ok(ReloadOutcome::Applied {
            rows,
            from_cache: false,
        })
    }

    /// `Ok(None)` means a newer reload took over while the fetch was in the
    /// air; nothing from it may be committed, not even to the cache.
    async fn fetch_checked(
        &mut self,
        key: ChannelKey,
        start: i64,
        end: i64,
        generation: u64,
    ) -> Result<Option<Vec<Candle>>, FeedError> {
        let candles = self.fetch_range(FetchRange { key, start, end }).await?;
        if self.is_stale(generation) {
            return Ok(None);
        }
        Ok(Some(candles))
    }

    /// Diagnostic only. Fetched history should be contiguous at the active
    /// granularity; a hole points at the backend, not at anything this side
    /// can repair.
    fn warn_on_gaps(&self, target: ReloadTarget) {
        if let Some(missing) = self.store.missing_times(target.granularity.as_secs()) {
            log::warn!(
                "Series for {target} has {} missing buckets: {missing:?}",
                missing.len()
            );
        }
    }

    fn restore_previous(&mut self, view: ActiveView, rows: &[Candle]) {
        self.store.clear();
        self.store.push_batch(rows);
        if self.active != view {
            self.active = view;
            self.active_tx.send_replace(view);
        }
        // go back to live updates on the restored series; a successor that
        // reloads a different target disarms this before touching the stream
        self.resubscribe = Some(Resubscribe {
            at: Instant::now() + self.config.resubscribe_delay(),
            key: view.key(),
        });
    }

    /// Tell listeners where the view should sit now. Short horizons snap to
    /// the most recent candles; long horizons show the whole fetched span.
    fn emit_reposition(&mut self, target: ReloadTarget) {
        let (Some(first), Some(last)) = (self.store.first_time(), self.store.last_time()) else {
            return;
        };

        let start_time = if target.period.is_long_horizon() {
            first
        } else {
            let from = self
                .store
                .len()
                .saturating_sub(self.config.reposition_candles);
            self.store.times()[from]
        };

        self.notify(EngineEvent::Repositioned {
            start_time,
            end_time: last,
        });
        // seed the dedup so an identical range notice right after is quiet
        self.tracker
            .observe_visible_range(target.key(), start_time, last);
    }
}
