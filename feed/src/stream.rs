//! Multiplexed streaming client. One physical websocket carries every
//! (symbol, granularity) channel; subscriptions survive reconnects, inbound
//! candles are delivered in bounded batches instead of per-message callbacks.

use crate::{
    CandleUpdate, ChannelKey, FeedError, connect,
    health::ConnectionHealth,
    resilience,
    wire::{ControlFrame, InboundFrame, parse_frame},
};

use async_trait::async_trait;
use fastwebsockets::{Frame, OpCode, Payload};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Flush an inbound batch at this many buffered updates.
    pub batch_max_count: usize,
    /// ... or after this long with something buffered, whichever first.
    pub batch_max_wait: Duration,
    /// How long a connection with zero subscribers lingers before closing.
    pub unsubscribe_grace: Duration,
    pub backoff_base: Duration,
    pub backoff_cap_multiplier: u32,
    /// No inbound traffic for this long means the connection is dead.
    pub read_timeout: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            batch_max_count: 50,
            batch_max_wait: Duration::from_millis(100),
            unsubscribe_grace: Duration::from_millis(100),
            backoff_base: Duration::from_secs(1),
            backoff_cap_multiplier: 10,
            read_timeout: Duration::from_secs(45),
        }
    }
}

/// What the connection task reports to its consumer.
#[derive(Debug)]
pub enum StreamEvent {
    Connected,
    Disconnected { reason: String },
    Batch { key: ChannelKey, updates: Vec<CandleUpdate> },
}

/// One inbound transport frame after websocket framing is stripped.
#[derive(Debug)]
pub enum Incoming {
    Text(Vec<u8>),
    Ping(Vec<u8>),
    Pong,
    Closed,
}

/// Connection factory. Production uses [`WsTransport`]; tests inject a fake
/// so reconnect and batching behavior run without sockets.
#[async_trait]
pub trait Transport: Send {
    async fn connect(&mut self) -> Result<Box<dyn Connection>, FeedError>;
}

#[async_trait]
pub trait Connection: Send {
    async fn send_text(&mut self, text: String) -> Result<(), FeedError>;
    async fn send_pong(&mut self, payload: Vec<u8>) -> Result<(), FeedError>;
    async fn recv(&mut self) -> Result<Incoming, FeedError>;
    async fn close(&mut self);
}

pub struct WsTransport {
    domain: String,
    url: String,
}

impl WsTransport {
    pub fn new(domain: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&mut self) -> Result<Box<dyn Connection>, FeedError> {
        let ws = connect::connect_ws(&self.domain, &self.url).await?;
        Ok(Box::new(WsConnection { ws }))
    }
}

struct WsConnection {
    ws: connect::WsStream,
}

#[async_trait]
impl Connection for WsConnection {
    async fn send_text(&mut self, text: String) -> Result<(), FeedError> {
        self.ws
            .write_frame(Frame::text(Payload::Borrowed(text.as_bytes())))
            .await
            .map_err(|e| FeedError::Websocket(e.to_string()))
    }

    async fn send_pong(&mut self, payload: Vec<u8>) -> Result<(), FeedError> {
        self.ws
            .write_frame(Frame::pong(Payload::Owned(payload)))
            .await
            .map_err(|e| FeedError::Websocket(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Incoming, FeedError> {
        let frame = self
            .ws
            .read_frame()
            .await
            .map_err(|e| FeedError::Websocket(e.to_string()))?;

        match frame.opcode {
            OpCode::Text | OpCode::Binary => Ok(Incoming::Text(frame.payload.to_vec())),
            OpCode::Close => Ok(Incoming::Closed),
            OpCode::Ping => Ok(Incoming::Ping(frame.payload.to_vec())),
            _ => Ok(Incoming::Pong),
        }
    }

    async fn close(&mut self) {
        let _ = self.ws.write_frame(Frame::close(1000, b"")).await;
    }
}

enum Command {
    Connect,
    Subscribe(ChannelKey),
    Unsubscribe(ChannelKey),
    Disconnect,
}

/// Handle to the connection task. Dropping it tears the task down; use
/// [`StreamClient::disconnect`] first for a clean close frame.
pub struct StreamClient {
    commands: mpsc::Sender<Command>,
    health: watch::Receiver<ConnectionHealth>,
    task: tokio::task::JoinHandle<()>,
}

impl StreamClient {
    /// Spawns the connection task. The returned receiver is the only copy of
    /// the event stream; the caller owns it.
    pub fn new(
        transport: Box<dyn Transport>,
        config: StreamConfig,
    ) -> (Self, mpsc::Receiver<StreamEvent>) {
        let (command_tx, command_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(100);
        let (health_tx, health_rx) = watch::channel(ConnectionHealth::Disconnected);

        let task = tokio::spawn(run_client(transport, config, command_rx, event_tx, health_tx));

        (
            Self {
                commands: command_tx,
                health: health_rx,
                task,
            },
            event_rx,
        )
    }

    pub async fn connect(&self) {
        let _ = self.commands.send(Command::Connect).await;
    }

    pub async fn subscribe(&self, key: ChannelKey) {
        let _ = self.commands.send(Command::Subscribe(key)).await;
    }

    pub async fn unsubscribe(&self, key: ChannelKey) {
        let _ = self.commands.send(Command::Unsubscribe(key)).await;
    }

    pub async fn disconnect(&self) {
        let _ = self.commands.send(Command::Disconnect).await;
    }

    pub fn is_connected(&self) -> bool {
        self.health.borrow().is_connected()
    }

    pub fn health(&self) -> watch::Receiver<ConnectionHealth> {
        self.health.clone()
    }
}

impl Drop for StreamClient {
    fn drop(&mut self) {
        self.task.abort();
    }
}

enum Session {
    Idle,
    Open(Box<dyn Connection>),
}

async fn run_client(
    mut transport: Box<dyn Transport>,
    config: StreamConfig,
    mut commands: mpsc::Receiver<Command>,
    events: mpsc::Sender<StreamEvent>,
    health: watch::Sender<ConnectionHealth>,
) {
    let mut session = Session::Idle;
    let mut registry: FxHashSet<ChannelKey> = FxHashSet::default();
    let mut backoff = resilience::reconnect_backoff(config.backoff_base, config.backoff_cap_multiplier);

    // true after a subscribe or explicit connect, false after a caller
    // disconnect or a grace-period close
    let mut want_connection = false;
    // forces one attempt even with an empty registry
    let mut connect_now = false;
    // wait out a backoff delay before the next attempt
    let mut delay_next = false;

    let mut buffer: Vec<CandleUpdate> = Vec::new();
    let mut batch_deadline: Option<Instant> = None;
    let mut grace_deadline: Option<Instant> = None;

    loop {
        match &mut session {
            Session::Idle => {
                if !(connect_now || (want_connection && !registry.is_empty())) {
                    health.send_replace(ConnectionHealth::Disconnected);
                    match commands.recv().await {
                        Some(cmd) => {
                            apply_idle_command(
                                cmd,
                                &mut registry,
                                &mut want_connection,
                                &mut connect_now,
                                &mut delay_next,
                            );
                            continue;
                        }
                        None => return,
                    }
                }

                if delay_next {
                    let delay = backoff.next().unwrap_or(config.backoff_base);
                    if !wait_out_backoff(
                        delay,
                        &mut commands,
                        &mut registry,
                        &mut want_connection,
                        &mut connect_now,
                        &mut delay_next,
                    )
                    .await
                    {
                        return;
                    }
                    // conditions may have changed while waiting
                    if !(connect_now || (want_connection && !registry.is_empty())) {
                        continue;
                    }
                }

                connect_now = false;
                health.send_replace(ConnectionHealth::Reconnecting);

                match transport.connect().await {
                    Ok(mut conn) => {
                        // reestablish every registered channel exactly once
                        // before consuming any traffic
                        let mut resubscribe_failed = false;
                        for key in &registry {
                            let frame = ControlFrame::Subscribe(*key).to_text();
                            if let Err(e) = conn.send_text(frame).await {
                                let _ = events
                                    .send(StreamEvent::Disconnected {
                                        reason: format!("resubscribe failed: {e}"),
                                    })
                                    .await;
                                resubscribe_failed = true;
                                break;
                            }
                        }
                        if resubscribe_failed {
                            delay_next = true;
                            continue;
                        }

                        backoff = resilience::reconnect_backoff(
                            config.backoff_base,
                            config.backoff_cap_multiplier,
                        );
                        delay_next = false;
                        grace_deadline = None;
                        health.send_replace(ConnectionHealth::Connected);
                        let _ = events.send(StreamEvent::Connected).await;
                        session = Session::Open(conn);
                    }
                    Err(e) => {
                        let _ = events
                            .send(StreamEvent::Disconnected {
                                reason: e.to_string(),
                            })
                            .await;
                        delay_next = true;
                    }
                }
            }
            Session::Open(conn) => {
                let batch_at = batch_deadline.unwrap_or_else(far_future);
                let grace_at = grace_deadline.unwrap_or_else(far_future);

                enum Step {
                    Command(Option<Command>),
                    Read(Result<Result<Incoming, FeedError>, tokio::time::error::Elapsed>),
                    FlushTimer,
                    GraceTimer,
                }

                let step = tokio::select! {
                    maybe = commands.recv() => Step::Command(maybe),
                    result = tokio::time::timeout(config.read_timeout, conn.recv()) => Step::Read(result),
                    _ = tokio::time::sleep_until(batch_at), if batch_deadline.is_some() => Step::FlushTimer,
                    _ = tokio::time::sleep_until(grace_at), if grace_deadline.is_some() => Step::GraceTimer,
                };

                match step {
                    Step::Command(None) => {
                        conn.close().await;
                        return;
                    }
                    Step::Command(Some(Command::Connect)) => {}
                    Step::Command(Some(Command::Subscribe(key))) => {
                        want_connection = true;
                        grace_deadline = None;
                        if registry.insert(key) {
                            let frame = ControlFrame::Subscribe(key).to_text();
                            if let Err(e) = conn.send_text(frame).await {
                                flush_batches(&mut buffer, &registry, &events).await;
                                batch_deadline = None;
                                let _ = events
                                    .send(StreamEvent::Disconnected {
                                        reason: e.to_string(),
                                    })
                                    .await;
                                health.send_replace(ConnectionHealth::Reconnecting);
                                delay_next = true;
                                session = Session::Idle;
                            }
                        }
                    }
                    Step::Command(Some(Command::Unsubscribe(key))) => {
                        if registry.remove(&key) {
                            let frame = ControlFrame::Unsubscribe(key).to_text();
                            // a failed unsubscribe frame is not worth a
                            // reconnect cycle; the server drops us on close
                            if let Err(e) = conn.send_text(frame).await {
                                log::warn!("Unsubscribe frame for {key} failed: {e}");
                            }
                            if registry.is_empty() {
                                grace_deadline = Some(Instant::now() + config.unsubscribe_grace);
                            }
                        }
                    }
                    Step::Command(Some(Command::Disconnect)) => {
                        flush_batches(&mut buffer, &registry, &events).await;
                        batch_deadline = None;
                        grace_deadline = None;
                        want_connection = false;
                        conn.close().await;
                        health.send_replace(ConnectionHealth::Disconnected);
                        session = Session::Idle;
                    }
                    Step::Read(Ok(Ok(Incoming::Text(payload)))) => {
                        match parse_frame(&payload) {
                            Ok(InboundFrame::Candle(frame)) => {
                                let update = frame.into_update();
                                if let Some(reason) = update.candle.integrity_error() {
                                    log::warn!(
                                        "Dropping streamed candle t={} for {}: {}",
                                        update.candle.time,
                                        update.key,
                                        reason
                                    );
                                } else if registry.contains(&update.key) {
                                    if buffer.is_empty() {
                                        batch_deadline =
                                            Some(Instant::now() + config.batch_max_wait);
                                    }
                                    buffer.push(update);
                                    if buffer.len() >= config.batch_max_count {
                                        flush_batches(&mut buffer, &registry, &events).await;
                                        batch_deadline = None;
                                    }
                                }
                                // no subscriber for the key: dropped silently
                            }
                            Ok(InboundFrame::Error(message)) => {
                                log::warn!("Server error frame: {message}");
                            }
                            Ok(InboundFrame::Other) => {}
                            Err(e) => {
                                log::warn!("Unreadable stream frame: {e}");
                            }
                        }
                    }
                    Step::Read(Ok(Ok(Incoming::Ping(payload)))) => {
                        let _ = conn.send_pong(payload).await;
                    }
                    Step::Read(Ok(Ok(Incoming::Pong))) => {}
                    Step::Read(Ok(Ok(Incoming::Closed))) => {
                        flush_batches(&mut buffer, &registry, &events).await;
                        batch_deadline = None;
                        let _ = events
                            .send(StreamEvent::Disconnected {
                                reason: "WebSocket closed".to_string(),
                            })
                            .await;
                        health.send_replace(reconnect_health(&registry, want_connection));
                        delay_next = true;
                        session = Session::Idle;
                    }
                    Step::Read(Ok(Err(e))) => {
                        flush_batches(&mut buffer, &registry, &events).await;
                        batch_deadline = None;
                        let _ = events
                            .send(StreamEvent::Disconnected {
                                reason: format!("WebSocket error: {e}"),
                            })
                            .await;
                        health.send_replace(reconnect_health(&registry, want_connection));
                        delay_next = true;
                        session = Session::Idle;
                    }
                    Step::Read(Err(_elapsed)) => {
                        flush_batches(&mut buffer, &registry, &events).await;
                        batch_deadline = None;
                        let _ = events
                            .send(StreamEvent::Disconnected {
                                reason: format!(
                                    "no data within {}s",
                                    config.read_timeout.as_secs()
                                ),
                            })
                            .await;
                        health.send_replace(reconnect_health(&registry, want_connection));
                        delay_next = true;
                        session = Session::Idle;
                    }
                    Step::FlushTimer => {
                        flush_batches(&mut buffer, &registry, &events).await;
                        batch_deadline = None;
                    }
                    Step::GraceTimer => {
                        grace_deadline = None;
                        if registry.is_empty() {
                            want_connection = false;
                            conn.close().await;
                            health.send_replace(ConnectionHealth::Disconnected);
                            session = Session::Idle;
                        }
                    }
                }
            }
        }
    }
}

fn apply_idle_command(
    cmd: Command,
    registry: &mut FxHashSet<ChannelKey>,
    want_connection: &mut bool,
    connect_now: &mut bool,
    delay_next: &mut bool,
) {
    match cmd {
        Command::Connect => {
            *want_connection = true;
            *connect_now = true;
            *delay_next = false;
        }
        Command::Subscribe(key) => {
            registry.insert(key);
            *want_connection = true;
            *delay_next = false;
        }
        Command::Unsubscribe(key) => {
            registry.remove(&key);
        }
        Command::Disconnect => {
            *want_connection = false;
            *connect_now = false;
        }
    }
}

/// Sleep out a backoff delay while staying responsive to commands. Returns
/// false when the command channel is gone and the task should exit.
async fn wait_out_backoff(
    delay: Duration,
    commands: &mut mpsc::Receiver<Command>,
    registry: &mut FxHashSet<ChannelKey>,
    want_connection: &mut bool,
    connect_now: &mut bool,
    delay_next: &mut bool,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            maybe = commands.recv() => match maybe {
                Some(cmd) => {
                    apply_idle_command(cmd, registry, want_connection, connect_now, delay_next);
                    if !(*connect_now || (*want_connection && !registry.is_empty())) {
                        // reconnect no longer wanted, stop waiting
                        return true;
                    }
                }
                None => return false,
            },
        }
    }
}

fn reconnect_health(registry: &FxHashSet<ChannelKey>, want_connection: bool) -> ConnectionHealth {
    if want_connection && !registry.is_empty() {
        ConnectionHealth::Reconnecting
    } else {
        ConnectionHealth::Disconnected
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86_400)
}

/// Drain the buffer into one event per channel key. Updates whose key lost
/// its subscriber while buffered are dropped here.
async fn flush_batches(
    buffer: &mut Vec<CandleUpdate>,
    registry: &FxHashSet<ChannelKey>,
    events: &mpsc::Sender<StreamEvent>,
) {
    if buffer.is_empty() {
        return;
    }

    let mut grouped: FxHashMap<ChannelKey, Vec<CandleUpdate>> = FxHashMap::default();
    for update in buffer.drain(..) {
        if registry.contains(&update.key) {
            grouped.entry(update.key).or_default().push(update);
        }
    }

    for (key, updates) in grouped {
        let _ = events.send(StreamEvent::Batch { key, updates }).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Granularity, Symbol};

    use std::sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    };
    use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

    #[derive(Clone, Default)]
    struct FakeHub {
        inner: Arc<Mutex<Vec<FakeConnHandle>>>,
        connects: Arc<AtomicUsize>,
    }

    struct FakeConnHandle {
        sent: Arc<Mutex<Vec<String>>>,
        inbound: Option<UnboundedSender<Incoming>>,
    }

    impl FakeHub {
        fn connect_count(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }

        fn sent_frames(&self, conn: usize) -> Vec<String> {
            self.inner.lock().unwrap()[conn].sent.lock().unwrap().clone()
        }

        fn push_text(&self, conn: usize, text: &str) {
            let guard = self.inner.lock().unwrap();
            let tx = guard[conn].inbound.as_ref().unwrap();
            tx.send(Incoming::Text(text.as_bytes().to_vec())).unwrap();
        }

        /// Simulates the server dropping the connection.
        fn kill(&self, conn: usize) {
            self.inner.lock().unwrap()[conn].inbound = None;
        }
    }

    struct FakeTransport {
        hub: FakeHub,
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn connect(&mut self) -> Result<Box<dyn Connection>, FeedError> {
            let (tx, rx) = unbounded_channel();
            let sent = Arc::new(Mutex::new(Vec::new()));
            self.hub.inner.lock().unwrap().push(FakeConnHandle {
                sent: sent.clone(),
                inbound: Some(tx),
            });
            self.hub.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeConnection { sent, rx }))
        }
    }

    struct FakeConnection {
        sent: Arc<Mutex<Vec<String>>>,
        rx: UnboundedReceiver<Incoming>,
    }

    #[async_trait]
    impl Connection for FakeConnection {
        async fn send_text(&mut self, text: String) -> Result<(), FeedError> {
            self.sent.lock().unwrap().push(text);
            Ok(())
        }

        async fn send_pong(&mut self, _payload: Vec<u8>) -> Result<(), FeedError> {
            Ok(())
        }

        async fn recv(&mut self) -> Result<Incoming, FeedError> {
            match self.rx.recv().await {
                Some(incoming) => Ok(incoming),
                None => Ok(Incoming::Closed),
            }
        }

        async fn close(&mut self) {}
    }

    fn test_client(hub: &FakeHub) -> (StreamClient, mpsc::Receiver<StreamEvent>) {
        StreamClient::new(
            Box::new(FakeTransport { hub: hub.clone() }),
            StreamConfig::default(),
        )
    }

    fn key(symbol: &str, granularity: Granularity) -> ChannelKey {
        ChannelKey::new(Symbol::new(symbol), granularity)
    }

    fn candle_text(symbol: &str, secs: u64, time: i64) -> String {
        format!(
            r#"{{"type":"candle","symbol":"{symbol}","granularity":{secs},
              "time":{time},"open":1.0,"high":2.0,"low":0.5,"close":1.5,"volume":3.0}}"#
        )
    }

    fn frame_kinds(frames: &[String]) -> Vec<(String, String)> {
        frames
            .iter()
            .map(|f| {
                let v: serde_json::Value = serde_json::from_str(f).unwrap();
                (
                    v["type"].as_str().unwrap().to_string(),
                    v["symbol"].as_str().unwrap_or_default().to_string(),
                )
            })
            .collect()
    }

    async fn expect_connected(events: &mut mpsc::Receiver<StreamEvent>) {
        loop {
            match events.recv().await.expect("event stream ended") {
                StreamEvent::Connected => return,
                StreamEvent::Disconnected { .. } | StreamEvent::Batch { .. } => {}
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn resubscribes_every_channel_exactly_once_after_reconnect() {
        let hub = FakeHub::default();
        let (client, mut events) = test_client(&hub);

        let keys = [
            key("BTC-USD", Granularity::M1),
            key("ETH-USD", Granularity::M5),
            key("SOL-USD", Granularity::H1),
        ];
        for k in keys {
            client.subscribe(k).await;
        }
        expect_connected(&mut events).await;

        let first = frame_kinds(&hub.sent_frames(0));
        assert_eq!(first.iter().filter(|(t, _)| t == "subscribe").count(), 3);

        // server drops the connection underneath us
        hub.kill(0);
        expect_connected(&mut events).await;

        assert_eq!(hub.connect_count(), 2);
        let resent = frame_kinds(&hub.sent_frames(1));
        let subs: Vec<&String> = resent
            .iter()
            .filter(|(t, _)| t == "subscribe")
            .map(|(_, s)| s)
            .collect();
        assert_eq!(subs.len(), 3, "exactly one subscribe frame per channel");

        let mut symbols: Vec<&str> = subs.iter().map(|s| s.as_str()).collect();
        symbols.sort_unstable();
        assert_eq!(symbols, vec!["BTC-USD", "ETH-USD", "SOL-USD"]);
    }

    #[tokio::test(start_paused = true)]
    async fn batches_flush_on_count_bound() {
        let hub = FakeHub::default();
        let (client, mut events) = test_client(&hub);

        let k = key("BTC-USD", Granularity::M1);
        client.subscribe(k).await;
        expect_connected(&mut events).await;

        for i in 0..200 {
            hub.push_text(0, &candle_text("BTC-USD", 60, 60 * (i + 1)));
        }

        let mut sizes = Vec::new();
        for _ in 0..4 {
            match events.recv().await.expect("expected a batch") {
                StreamEvent::Batch { key: got, updates } => {
                    assert_eq!(got, k);
                    sizes.push(updates.len());
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert_eq!(sizes, vec![50, 50, 50, 50]);
    }

    #[tokio::test(start_paused = true)]
    async fn partial_batch_flushes_on_timer() {
        let hub = FakeHub::default();
        let (client, mut events) = test_client(&hub);

        let k = key("ETH-USD", Granularity::M5);
        client.subscribe(k).await;
        expect_connected(&mut events).await;

        for i in 0..7 {
            hub.push_text(0, &candle_text("ETH-USD", 300, 300 * (i + 1)));
        }

        match events.recv().await.expect("expected timed flush") {
            StreamEvent::Batch { key: got, updates } => {
                assert_eq!(got, k);
                assert_eq!(updates.len(), 7);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unmatched_candles_are_dropped_silently() {
        let hub = FakeHub::default();
        let (client, mut events) = test_client(&hub);

        let k = key("BTC-USD", Granularity::M1);
        client.subscribe(k).await;
        expect_connected(&mut events).await;

        // not subscribed: different granularity and different symbol
        hub.push_text(0, &candle_text("BTC-USD", 300, 300));
        hub.push_text(0, &candle_text("DOGE-USD", 60, 60));
        hub.push_text(0, &candle_text("BTC-USD", 60, 60));

        match events.recv().await.expect("expected a batch") {
            StreamEvent::Batch { updates, .. } => {
                assert_eq!(updates.len(), 1);
                assert_eq!(updates[0].key, k);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_candles_never_reach_subscribers() {
        let hub = FakeHub::default();
        let (client, mut events) = test_client(&hub);

        let k = key("BTC-USD", Granularity::M1);
        client.subscribe(k).await;
        expect_connected(&mut events).await;

        hub.push_text(
            0,
            r#"{"type":"candle","symbol":"BTC-USD","granularity":60,
               "time":60,"open":1.0,"high":2.0,"low":0.5,"close":null,"volume":3.0}"#,
        );
        hub.push_text(
            0,
            r#"{"type":"candle","symbol":"BTC-USD","granularity":60,
               "time":120,"open":1.0,"high":0.5,"low":2.0,"close":1.5,"volume":3.0}"#,
        );
        hub.push_text(0, &candle_text("BTC-USD", 60, 180));

        match events.recv().await.expect("expected a batch") {
            StreamEvent::Batch { updates, .. } => {
                assert_eq!(updates.len(), 1);
                assert_eq!(updates[0].candle.time, 180);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_resubscribe_within_grace_keeps_the_connection() {
        let hub = FakeHub::default();
        let (client, mut events) = test_client(&hub);

        let k = key("BTC-USD", Granularity::M1);
        client.subscribe(k).await;
        expect_connected(&mut events).await;

        client.unsubscribe(k).await;
        // user flips right back before the grace period ends
        client.subscribe(k).await;

        // stream still works on the same physical connection
        hub.push_text(0, &candle_text("BTC-USD", 60, 60));
        match events.recv().await.expect("expected a batch") {
            StreamEvent::Batch { updates, .. } => assert_eq!(updates.len(), 1),
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(hub.connect_count(), 1, "no reconnect churn");
    }

    #[tokio::test(start_paused = true)]
    async fn last_unsubscribe_closes_after_grace() {
        let hub = FakeHub::default();
        let (client, mut events) = test_client(&hub);

        let k = key("BTC-USD", Granularity::M1);
        client.subscribe(k).await;
        expect_connected(&mut events).await;
        assert!(client.is_connected());

        client.unsubscribe(k).await;

        // wait out the grace period (paused clock auto-advances)
        let mut health = client.health();
        while health.borrow().is_connected() {
            health.changed().await.unwrap();
        }
        assert_eq!(*health.borrow(), ConnectionHealth::Disconnected);
        assert_eq!(hub.connect_count(), 1, "close, not reconnect");
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_while_disconnected_connects_on_demand() {
        let hub = FakeHub::default();
        let (client, mut events) = test_client(&hub);

        assert!(!client.is_connected());
        client.subscribe(key("BTC-USD", Granularity::M1)).await;
        expect_connected(&mut events).await;
        assert!(client.is_connected());
        assert_eq!(hub.connect_count(), 1);
    }
}
