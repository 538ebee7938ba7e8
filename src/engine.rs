//! Background task that owns every mutable piece of the data plane: the
//! active column store, the tiered cache, the prefetch scheduler, and the
//! stream client. The [`Client`](crate::Client) facade talks to it over a
//! bounded command channel, so nothing here is ever shared across tasks.

mod coordinator;

pub use coordinator::ReloadTarget;

use crate::Config;

use data::{
    CacheStats, ChangeSet, ChangeTracker, ColumnarCandleStore, PrefetchScheduler, TieredCache,
};
use feed::history::{CandleSource, FetchRange, RequestTracker};
use feed::stream::{StreamClient, StreamEvent, Transport};
use feed::{
    Candle, CandleUpdate, ChannelKey, ConnectionHealth, FeedError, Granularity, Period, Symbol,
};

use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Duration, Instant, sleep_until};

/// What the engine is currently displaying. Published through a watch
/// channel so readers never need a round trip to the engine task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveView {
    pub symbol: Symbol,
    pub granularity: Granularity,
    pub period: Period,
}

impl ActiveView {
    pub fn key(&self) -> ChannelKey {
        ChannelKey::new(self.symbol, self.granularity)
    }
}

/// A streamed candle handed to a live subscriber, tagged with which of its
/// fields actually moved since the previous delivery on that channel.
#[derive(Debug, Clone, Copy)]
pub struct LiveUpdate {
    pub update: CandleUpdate,
    pub changes: ChangeSet,
}

/// Out-of-band notices. Delivery is best effort: a consumer that stops
/// draining loses notices, never the data itself.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    ReloadStarted {
        target: ReloadTarget,
    },
    ReloadCompleted {
        target: ReloadTarget,
        rows: usize,
        from_cache: bool,
    },
    ReloadFailed {
        target: ReloadTarget,
        message: String,
    },
    /// The view should move to this time window after a reload.
    Repositioned {
        start_time: i64,
        end_time: i64,
    },
    /// The active series changed through a live update.
    SeriesChanged {
        key: ChannelKey,
        changes: ChangeSet,
    },
    VisibleRangeChanged {
        start: i64,
        end: i64,
    },
    PrefetchStored {
        key: ChannelKey,
        rows: usize,
    },
    StreamConnected,
    StreamDisconnected {
        reason: String,
    },
}

pub(crate) enum Command {
    Reload {
        granularity: Granularity,
        period: Period,
        generation: u64,
    },
    SetSymbol {
        symbol: Symbol,
        generation: u64,
    },
    SubscribeLive {
        key: ChannelKey,
        id: u64,
        sender: mpsc::Sender<LiveUpdate>,
    },
    UnsubscribeLive {
        key: ChannelKey,
        id: u64,
    },
    PrefetchNow {
        key: ChannelKey,
    },
    Activity,
    VisibleRange {
        start: i64,
        end: i64,
    },
    Series {
        key: ChannelKey,
        respond: oneshot::Sender<Option<Vec<Candle>>>,
    },
    SeriesRange {
        start: i64,
        end: i64,
        respond: oneshot::Sender<Vec<Candle>>,
    },
    CacheStats {
        respond: oneshot::Sender<CacheStats>,
    },
    Shutdown {
        respond: oneshot::Sender<()>,
    },
}

pub(crate) struct EngineHandle {
    pub commands: mpsc::Sender<Command>,
    pub events: mpsc::Receiver<EngineEvent>,
    pub active: watch::Receiver<ActiveView>,
    pub health: watch::Receiver<ConnectionHealth>,
    pub generation: Arc<AtomicU64>,
    pub task: tokio::task::JoinHandle<()>,
}

pub(crate) fn spawn(
    config: Config,
    transport: Box<dyn Transport>,
    source: Box<dyn CandleSource>,
) -> EngineHandle {
    let (stream, stream_events) = StreamClient::new(transport, config.stream_config());
    let health = stream.health();
    let (commands_tx, commands_rx) = mpsc::channel(64);
    let (events_tx, events_rx) = mpsc::channel(256);

    let view = ActiveView {
        symbol: config.symbol,
        granularity: config.granularity,
        period: config.period,
    };
    let (active_tx, active_rx) = watch::channel(view);
    let generation = Arc::new(AtomicU64::new(0));

    let engine = Engine {
        store: ColumnarCandleStore::new(),
        cache: TieredCache::new(config.cache_config()),
        scheduler: PrefetchScheduler::new(config.stats_path()),
        tracker: ChangeTracker::new(),
        fetches: RequestTracker::new(config.retry_cooldown()),
        source,
        stream,
        stream_events,
        commands: commands_rx,
        events: events_tx,
        subscribers: FxHashMap::default(),
        active: view,
        active_tx,
        generation: Arc::clone(&generation),
        idle_at: Instant::now() + config.idle_prefetch_delay(),
        drain: DrainState::Idle,
        resubscribe: None,
        config,
    };
    let task = tokio::spawn(engine.run());

    EngineHandle {
        commands: commands_tx,
        events: events_rx,
        active: active_rx,
        health,
        generation,
        task,
    }
}

struct LiveSubscriber {
    id: u64,
    sender: mpsc::Sender<LiveUpdate>,
}

enum DrainState {
    Idle,
    Pacing(Instant),
}

struct Resubscribe {
    at: Instant,
    key: ChannelKey,
}

pub(crate) struct Engine {
    config: Config,
    store: ColumnarCandleStore,
    cache: TieredCache,
    scheduler: PrefetchScheduler,
    tracker: ChangeTracker,
    fetches: RequestTracker,
    source: Box<dyn CandleSource>,
    stream: StreamClient,
    stream_events: mpsc::Receiver<StreamEvent>,
    commands: mpsc::Receiver<Command>,
    events: mpsc::Sender<EngineEvent>,
    subscribers: FxHashMap<ChannelKey, LiveSubscriber>,
    active: ActiveView,
    active_tx: watch::Sender<ActiveView>,
    generation: Arc<AtomicU64>,
    idle_at: Instant,
    drain: DrainState,
    resubscribe: Option<Resubscribe>,
}

impl Engine {
    async fn run(mut self) {
        log::info!("Data engine started on {}", self.active.key());

        loop {
            let idle_at = self.idle_at;
            let pace_at = match self.drain {
                DrainState::Pacing(at) => at,
                DrainState::Idle => far_future(),
            };
            let resubscribe_at = self
                .resubscribe
                .as_ref()
                .map_or_else(far_future, |r| r.at);

            enum Step {
                Command(Option<Command>),
                Stream(Option<StreamEvent>),
                IdleGate,
                Pace,
                Resubscribe,
            }

            let step = tokio::select! {
                command = self.commands.recv() => Step::Command(command),
                event = self.stream_events.recv() => Step::Stream(event),
                _ = sleep_until(resubscribe_at), if self.resubscribe.is_some() => Step::Resubscribe,
                _ = sleep_until(pace_at), if matches!(self.drain, DrainState::Pacing(_)) => Step::Pace,
                _ = sleep_until(idle_at), if matches!(self.drain, DrainState::Idle)
                    && !self.scheduler.queue().is_empty() => Step::IdleGate,
            };

            match step {
                Step::Command(None) => {
                    // facade dropped without an explicit close
                    self.shutdown().await;
                    return;
                }
                Step::Command(Some(command)) => {
                    if !self.handle_command(command).await {
                        return;
                    }
                }
                Step::Stream(Some(event)) => self.handle_stream_event(event).await,
                Step::Stream(None) => {
                    log::warn!("Stream event channel closed, stopping engine");
                    self.shutdown().await;
                    return;
                }
                Step::IdleGate | Step::Pace => self.prefetch_step().await,
                Step::Resubscribe => self.fire_resubscribe().await,
            }
        }
    }

    /// Returns `false` when the engine should stop.
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Reload {
                granularity,
                period,
                generation,
            } => {
                self.touch_activity();
                let target = ReloadTarget {
                    symbol: self.active.symbol,
                    granularity,
                    period,
                };
                self.maybe_reload(target, generation).await;
            }
            Command::SetSymbol { symbol, generation } => {
                self.touch_activity();
                let target = ReloadTarget {
                    symbol,
                    granularity: self.active.granularity,
                    period: self.active.period,
                };
                self.maybe_reload(target, generation).await;
            }
            Command::SubscribeLive { key, id, sender } => {
                // same channel again replaces the previous subscriber
                self.subscribers.insert(key, LiveSubscriber { id, sender });
                self.stream.subscribe(key).await;
            }
            Command::UnsubscribeLive { key, id } => {
                let owned = self
                    .subscribers
                    .get(&key)
                    .is_some_and(|subscriber| subscriber.id == id);
                if owned {
                    self.subscribers.remove(&key);
                    if key != self.active.key() {
                        self.stream.unsubscribe(key).await;
                    }
                }
            }
            Command::PrefetchNow { key } => {
                self.scheduler.request(key);
                self.prefetch_step().await;
            }
            Command::Activity => self.touch_activity(),
            Command::VisibleRange { start, end } => {
                self.touch_activity();
                let key = self.active.key();
                let changes = self.tracker.observe_visible_range(key, start, end);
                if changes.visible_range {
                    self.notify(EngineEvent::VisibleRangeChanged { start, end });
                }
            }
            Command::Series { key, respond } => {
                let rows = if key == self.active.key() {
                    Some(self.store.snapshot())
                } else {
                    self.cache.get(key)
                };
                let _ = respond.send(rows);
            }
            Command::SeriesRange {
                start,
                end,
                respond,
            } => {
                let _ = respond.send(self.store.range(start, end));
            }
            Command::CacheStats { respond } => {
                let _ = respond.send(self.cache.stats());
            }
            Command::Shutdown { respond } => {
                self.shutdown().await;
                let _ = respond.send(());
                return false;
            }
        }
        true
    }

    async fn handle_stream_event(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Connected => self.notify(EngineEvent::StreamConnected),
            StreamEvent::Disconnected { reason } => {
                self.notify(EngineEvent::StreamDisconnected { reason });
            }
            StreamEvent::Batch { key, updates } => {
                let is_active = key == self.active.key();
                let mut subscriber_gone = false;

                for update in updates {
                    let changes = self.tracker.observe_candle(key, &update.candle);
                    if !changes.any() {
                        continue;
                    }

                    if is_active {
                        let outcome = self.store.merge_from(std::slice::from_ref(&update.candle));
                        if outcome.changed() {
                            self.notify(EngineEvent::SeriesChanged { key, changes });
                        }
                    }

                    if let Some(subscriber) = self.subscribers.get(&key) {
                        match subscriber.sender.try_send(LiveUpdate { update, changes }) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                log::warn!("Live subscriber on {key} is lagging, dropped an update");
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => subscriber_gone = true,
                        }
                    }
                }

                if subscriber_gone {
                    self.drop_subscriber(key).await;
                }
            }
        }
    }

    async fn drop_subscriber(&mut self, key: ChannelKey) {
        self.subscribers.remove(&key);
        if key != self.active.key() {
            self.stream.unsubscribe(key).await;
        }
    }

    async fn fire_resubscribe(&mut self) {
        // any reload since arming either cleared this or re-armed it for
        // its own key, so a mismatch means the view moved on
        if let Some(resubscribe) = self.resubscribe.take()
            && resubscribe.key == self.active.key()
        {
            self.stream.subscribe(resubscribe.key).await;
        }
    }

    /// Pop and execute one prefetch task, then schedule the next pass if the
    /// queue still has work.
    async fn prefetch_step(&mut self) {
        self.drain = DrainState::Idle;

        let task = loop {
            let Some(task) = self.scheduler.pop_task() else {
                return;
            };
            // a fresh target costs no backend call, skip it without pacing
            if self.cache.is_fresh(task.key, self.cache.freshness_window()) {
                log::debug!("Prefetch target {} is already fresh", task.key);
                continue;
            }
            break task;
        };

        match self.prefetch(task.key).await {
            Ok(Some(rows)) => {
                log::debug!("Prefetched {rows} rows for {} ({:?})", task.key, task.reason);
                self.notify(EngineEvent::PrefetchStored { key: task.key, rows });
            }
            Ok(None) => {}
            Err(e) => log::warn!("Prefetch for {} failed: {e}", task.key),
        }

        if !self.scheduler.queue().is_empty() {
            self.drain = DrainState::Pacing(Instant::now() + self.config.prefetch_spacing());
        }
    }

    /// `Ok(None)` means the request ledger already covers this range.
    async fn prefetch(&mut self, key: ChannelKey) -> Result<Option<usize>, FeedError> {
        let period = Period::natural_for(key.granularity);
        let end = key.granularity.bucket_start(now_secs());
        let start = end - period.span_secs() as i64;
        let range = FetchRange { key, start, end };

        let id = match self.fetches.add_request(range) {
            Ok(Some(id)) => id,
            Ok(None) => return Ok(None),
            Err(e) => {
                log::debug!("Prefetch for {key} skipped: {e}");
                return Ok(None);
            }
        };

        match self.fetch_range(range).await {
            Ok(candles) => {
                self.fetches.mark_completed(id);
                let rows = candles.len();
                self.cache.set(key, &candles);
                Ok(Some(rows))
            }
            Err(e) => {
                self.fetches.mark_failed(id, e.to_string());
                Err(e)
            }
        }
    }

    async fn fetch_range(&self, range: FetchRange) -> Result<Vec<Candle>, FeedError> {
        let fetch = self.source.fetch_range(range.key, range.start, range.end);
        match tokio::time::timeout(self.config.fetch_timeout(), fetch).await {
            Ok(result) => result,
            Err(_) => Err(FeedError::Timeout(format!(
                "historical fetch for {}",
                range.key
            ))),
        }
    }

    fn touch_activity(&mut self) {
        self.idle_at = Instant::now() + self.config.idle_prefetch_delay();
        if matches!(self.drain, DrainState::Pacing(_)) {
            // the user is back, hold the rest of the queue for the next
            // quiet window
            self.drain = DrainState::Idle;
        }
    }

    fn notify(&self, event: EngineEvent) {
        if let Err(e) = self.events.try_send(event) {
            log::debug!("Notice dropped: {e}");
        }
    }

    async fn shutdown(&mut self) {
        let key = self.active.key();
        if !self.store.is_empty() {
            self.cache.set(key, &self.store.snapshot());
        }
        self.scheduler.persist();
        self.stream.disconnect().await;
        log::info!("Data engine stopped");
    }
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86_400)
}
