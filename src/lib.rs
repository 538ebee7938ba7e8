//! Client-side market data plane for OHLCV candles.
//!
//! One background engine task owns the active column store, a two-tier
//! cache, a predictive prefetcher, and a multiplexed websocket client. The
//! [`Client`] facade in this crate is the only way in: commands go over a
//! bounded channel, answers come back over oneshots, and out-of-band
//! notices arrive on the receiver returned by [`Client::new`]. Nothing is
//! locked and nothing is shared, so a slow consumer can never stall the
//! data path.
//!
//! Timeframe switches are generation-stamped: when switches race, the
//! latest one wins and earlier in-flight work is discarded without side
//! effects. A failed switch rolls back to the previous series.

mod config;
mod engine;

pub use config::{CacheTuning, Config, StreamTuning};
pub use engine::{ActiveView, EngineEvent, LiveUpdate, ReloadTarget};

pub use data::{CacheStats, ChangeSet, Channel};
pub use feed::history::CandleSource;
pub use feed::stream::{Connection, Incoming, Transport};
pub use feed::{
    Candle, CandleUpdate, ChannelKey, ConnectionHealth, FeedError, Granularity, Period, Symbol,
    UpdateKind,
};

use engine::Command;
use feed::HttpSource;
use feed::stream::WsTransport;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, oneshot, watch};

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    /// The combination was rejected before any work started.
    #[error("{granularity} is not available over {period}")]
    UnsupportedTimeframe {
        granularity: Granularity,
        period: Period,
    },
    /// The engine task is gone, normally after [`Client::close`].
    #[error("Client is closed")]
    Closed,
}

/// Handle to the engine task. Dropping it shuts the engine down in the
/// background; [`Client::close`] does the same but waits for state to be
/// persisted.
pub struct Client {
    commands: mpsc::Sender<Command>,
    active: watch::Receiver<ActiveView>,
    health: watch::Receiver<ConnectionHealth>,
    generation: Arc<AtomicU64>,
    subscriber_ids: AtomicU64,
    task: tokio::task::JoinHandle<()>,
}

impl Client {
    /// Start the engine against the configured production endpoints.
    pub fn new(config: Config) -> (Client, mpsc::Receiver<EngineEvent>) {
        let transport = Box::new(WsTransport::new(
            config.stream_domain.clone(),
            config.stream_url.clone(),
        ));
        let source = Box::new(HttpSource::new(
            config.http_base_url.clone(),
            config.fetch_timeout(),
        ));
        Self::with_backends(config, transport, source)
    }

    /// Same as [`Client::new`] with injected transport and history source.
    /// This is how the integration tests run the full engine offline.
    pub fn with_backends(
        config: Config,
        transport: Box<dyn Transport>,
        source: Box<dyn CandleSource>,
    ) -> (Client, mpsc::Receiver<EngineEvent>) {
        let handle = engine::spawn(config, transport, source);
        let client = Client {
            commands: handle.commands,
            active: handle.active,
            health: handle.health,
            generation: handle.generation,
            subscriber_ids: AtomicU64::new(1),
            task: handle.task,
        };
        (client, handle.events)
    }

    /// The (symbol, granularity, period) the engine is showing or loading.
    pub fn active_view(&self) -> ActiveView {
        *self.active.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.health.borrow().is_connected()
    }

    /// Watch stream connection state changes without polling.
    pub fn health(&self) -> watch::Receiver<ConnectionHealth> {
        self.health.clone()
    }

    /// Switch the active series to a new granularity and period. Returns as
    /// soon as the switch is queued; progress arrives as
    /// [`EngineEvent::ReloadStarted`] and friends. When calls race, the
    /// latest one wins.
    pub async fn set_active_timeframe(
        &self,
        granularity: Granularity,
        period: Period,
    ) -> Result<(), ClientError> {
        if !period.supports(granularity) {
            return Err(ClientError::UnsupportedTimeframe {
                granularity,
                period,
            });
        }
        let generation = self.next_generation();
        self.send(Command::Reload {
            granularity,
            period,
            generation,
        })
        .await
    }

    /// Switch the active symbol, keeping granularity and period.
    pub async fn set_active_symbol(&self, symbol: Symbol) -> Result<(), ClientError> {
        let generation = self.next_generation();
        self.send(Command::SetSymbol { symbol, generation }).await
    }

    /// Snapshot of a series: the live store for the active channel, the
    /// cache for anything else. `None` when the channel is not cached.
    pub async fn series(&self, key: ChannelKey) -> Result<Option<Vec<Candle>>, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Series { key, respond: tx }).await?;
        rx.await.map_err(|_| ClientError::Closed)
    }

    /// Rows of the active series inside `[start, end]`, inclusive.
    pub async fn series_range(&self, start: i64, end: i64) -> Result<Vec<Candle>, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::SeriesRange {
            start,
            end,
            respond: tx,
        })
        .await?;
        rx.await.map_err(|_| ClientError::Closed)
    }

    /// Live candle updates for one channel. Subscribing to the same channel
    /// again replaces the previous subscriber. Dropping the returned
    /// subscription unsubscribes.
    pub async fn subscribe_live(
        &self,
        key: ChannelKey,
    ) -> Result<(LiveSubscription, mpsc::Receiver<LiveUpdate>), ClientError> {
        let id = self.subscriber_ids.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(64);
        self.send(Command::SubscribeLive {
            key,
            id,
            sender: tx,
        })
        .await?;
        let subscription = LiveSubscription {
            key,
            id,
            commands: self.commands.clone(),
        };
        Ok((subscription, rx))
    }

    /// Queue a channel for background loading ahead of the usual idle gate.
    pub async fn prefetch_now(&self, key: ChannelKey) -> Result<(), ClientError> {
        self.send(Command::PrefetchNow { key }).await
    }

    /// Tell the engine the user is interacting, which defers prefetching.
    pub async fn note_user_activity(&self) -> Result<(), ClientError> {
        self.send(Command::Activity).await
    }

    /// Report the visible time window; listeners get a deduplicated
    /// [`EngineEvent::VisibleRangeChanged`].
    pub async fn note_visible_range(&self, start: i64, end: i64) -> Result<(), ClientError> {
        self.send(Command::VisibleRange { start, end }).await
    }

    pub async fn cache_stats(&self) -> Result<CacheStats, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::CacheStats { respond: tx }).await?;
        rx.await.map_err(|_| ClientError::Closed)
    }

    /// Stop the engine, persisting usage statistics and the active series
    /// to the durable cache first.
    pub async fn close(self) -> Result<(), ClientError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Shutdown { respond: tx })
            .await
            .map_err(|_| ClientError::Closed)?;
        rx.await.map_err(|_| ClientError::Closed)?;
        let _ = self.task.await;
        Ok(())
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn send(&self, command: Command) -> Result<(), ClientError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ClientError::Closed)
    }
}

/// Keeps a live subscription registered. Dropping it unsubscribes the
/// channel, unless a newer subscription already took it over.
pub struct LiveSubscription {
    key: ChannelKey,
    id: u64,
    commands: mpsc::Sender<Command>,
}

impl LiveSubscription {
    pub fn key(&self) -> ChannelKey {
        self.key
    }
}

impl Drop for LiveSubscription {
    fn drop(&mut self) {
        let _ = self.commands.try_send(Command::UnsubscribeLive {
            key: self.key,
            id: self.id,
        });
    }
}
