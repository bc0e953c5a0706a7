//! Subscription broadcaster.
//!
//! Tracks per-client channel subscriptions and fans computed results out
//! on a fine-grained tick: each channel fires on its own cadence, and a
//! fired message goes only to that channel's subscribers. Clients hang
//! off bounded outbound queues; a send failure (dead or hopelessly slow
//! client) disconnects that client and nobody else.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pulse_engine::PulseContext;
use pulse_engine::event::STREAM_OPERATIONS;
use pulse_store::StreamStore;

use crate::protocol::{Channel, ServerMessage};

/// How long `stop` waits for the tick loop before aborting it.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Broadcast cadence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcasterConfig {
    /// Base tick; each channel's own interval is checked on every tick.
    pub tick_ms: u64,
    pub features_interval_ms: u64,
    pub patterns_interval_ms: u64,
    pub stats_interval_ms: u64,
    /// Patterns updates carry detections from this trailing window.
    pub patterns_lookback_secs: u64,
    /// Per-client outbound queue depth.
    pub client_queue: usize,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            tick_ms: 500,
            features_interval_ms: 2000,
            patterns_interval_ms: 5000,
            stats_interval_ms: 10000,
            patterns_lookback_secs: 300,
            client_queue: 64,
        }
    }
}

/// Point-in-time broadcaster statistics.
#[derive(Debug, Clone, Serialize)]
pub struct BroadcasterStats {
    pub clients: usize,
    pub messages_sent: u64,
    pub send_failures: u64,
    /// Millisecond timestamps of the last fire per channel; absent until
    /// a channel has fired once.
    pub last_broadcast: HashMap<String, i64>,
}

struct ClientHandle {
    tx: mpsc::Sender<ServerMessage>,
    channels: HashSet<Channel>,
}

struct BroadcasterInner {
    context: Arc<PulseContext>,
    config: BroadcasterConfig,
    clients: RwLock<HashMap<String, ClientHandle>>,
    messages_sent: AtomicU64,
    send_failures: AtomicU64,
    last_features_ms: AtomicI64,
    last_patterns_ms: AtomicI64,
    last_stats_ms: AtomicI64,
    runtime: tokio::sync::Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl BroadcasterInner {
    /// Send to every subscriber of `channel`; failed clients are removed
    /// after delivery so one bad connection never blocks the rest.
    fn deliver(&self, channel: Channel, message: &ServerMessage) {
        let mut failed = Vec::new();
        {
            let clients = self.clients.read();
            for (id, handle) in clients.iter() {
                if !handle.channels.contains(&channel) {
                    continue;
                }
                match handle.tx.try_send(message.clone()) {
                    Ok(()) => {
                        self.messages_sent.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(_) => {
                        self.send_failures.fetch_add(1, Ordering::Relaxed);
                        failed.push(id.clone());
                    }
                }
            }
        }
        for id in failed {
            warn!(client = %id, %channel, "send failed; disconnecting client");
            self.clients.write().remove(&id);
        }
    }

    fn take_due(&self, last: &AtomicI64, interval_ms: u64, now_ms: i64) -> bool {
        if now_ms - last.load(Ordering::Relaxed) < interval_ms as i64 {
            return false;
        }
        last.store(now_ms, Ordering::Relaxed);
        true
    }

    async fn broadcast_due(&self) {
        let now_ms = Utc::now().timestamp_millis();

        if self.take_due(&self.last_features_ms, self.config.features_interval_ms, now_ms) {
            let latest = self.context.features().get_latest();
            let data = serde_json::to_value(latest).unwrap_or(Value::Null);
            self.deliver(Channel::Features, &ServerMessage::features_update(data));
        }

        if self.take_due(&self.last_patterns_ms, self.config.patterns_interval_ms, now_ms) {
            let recent = self
                .context
                .patterns()
                .recent_patterns(Duration::from_secs(self.config.patterns_lookback_secs));
            let data = json!({
                "count": recent.len(),
                "patterns": serde_json::to_value(recent).unwrap_or(Value::Null),
            });
            self.deliver(Channel::Patterns, &ServerMessage::patterns_update(data));
        }

        if self.take_due(&self.last_stats_ms, self.config.stats_interval_ms, now_ms) {
            let data = self.stats_payload().await;
            self.deliver(Channel::Stats, &ServerMessage::system_stats_update(data));
        }
    }

    /// Combined system statistics: workers, producer, store probe, and
    /// the broadcaster itself.
    async fn stats_payload(&self) -> Value {
        json!({
            "workers": self.context.manager().status(),
            "producer": self.context.producer().stats(),
            "store": self.store_probe().await,
            "broadcaster": self.stats(),
        })
    }

    /// Probe the store with a cheap length call, reporting health and
    /// observed latency. Degradation shows up here as staleness and
    /// `healthy: false`, never as a hard error to clients.
    async fn store_probe(&self) -> Value {
        let started = Instant::now();
        let result = self.context.store().length(STREAM_OPERATIONS).await;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        match result {
            Ok(len) => json!({
                "healthy": true,
                "latency_ms": latency_ms,
                "operations_stream_len": len,
                "last_check": Utc::now().timestamp_millis(),
            }),
            Err(e) => json!({
                "healthy": false,
                "latency_ms": latency_ms,
                "error": e.to_string(),
                "last_check": Utc::now().timestamp_millis(),
            }),
        }
    }

    fn stats(&self) -> BroadcasterStats {
        let mut last_broadcast = HashMap::new();
        for (channel, last) in [
            (Channel::Features, &self.last_features_ms),
            (Channel::Patterns, &self.last_patterns_ms),
            (Channel::Stats, &self.last_stats_ms),
        ] {
            let ms = last.load(Ordering::Relaxed);
            if ms > 0 {
                last_broadcast.insert(channel.to_string(), ms);
            }
        }
        BroadcasterStats {
            clients: self.clients.read().len(),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            last_broadcast,
        }
    }

    async fn run(self: Arc<Self>, token: CancellationToken) {
        info!(tick_ms = self.config.tick_ms, "broadcaster tick loop started");
        let mut tick = tokio::time::interval(Duration::from_millis(self.config.tick_ms));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tick.tick() => self.broadcast_due().await,
            }
        }
        info!("broadcaster tick loop stopped");
    }
}

/// Subscription broadcaster handle. Cheap to clone; all clones share the
/// same subscription table and tick loop.
#[derive(Clone)]
pub struct Broadcaster {
    inner: Arc<BroadcasterInner>,
}

impl Broadcaster {
    pub fn new(context: Arc<PulseContext>, config: BroadcasterConfig) -> Self {
        Self {
            inner: Arc::new(BroadcasterInner {
                context,
                config,
                clients: RwLock::new(HashMap::new()),
                messages_sent: AtomicU64::new(0),
                send_failures: AtomicU64::new(0),
                last_features_ms: AtomicI64::new(0),
                last_patterns_ms: AtomicI64::new(0),
                last_stats_ms: AtomicI64::new(0),
                runtime: tokio::sync::Mutex::new(None),
            }),
        }
    }

    /// Register a connection. The returned receiver is the client's
    /// outbound message stream; the welcome message enumerating the
    /// available channels is already queued on it.
    pub fn connect(&self, client_id: &str) -> mpsc::Receiver<ServerMessage> {
        let (tx, rx) = mpsc::channel(self.inner.config.client_queue);
        let _ = tx.try_send(ServerMessage::welcome(client_id));
        self.inner.clients.write().insert(
            client_id.to_string(),
            ClientHandle {
                tx,
                channels: HashSet::new(),
            },
        );
        info!(client = %client_id, "client connected");
        rx
    }

    /// Replace the client's channel set. Unknown clients are ignored.
    pub fn subscribe(&self, client_id: &str, channels: impl IntoIterator<Item = Channel>) {
        let mut clients = self.inner.clients.write();
        if let Some(handle) = clients.get_mut(client_id) {
            handle.channels = channels.into_iter().collect();
            debug!(client = %client_id, channels = ?handle.channels, "subscription updated");
        }
    }

    /// Remove the connection and its subscription.
    pub fn disconnect(&self, client_id: &str) {
        if self.inner.clients.write().remove(client_id).is_some() {
            info!(client = %client_id, "client disconnected");
        }
    }

    /// Queue a direct message (e.g. a pong) to one client; a failed send
    /// disconnects that client.
    pub fn send_to(&self, client_id: &str, message: ServerMessage) {
        let ok = {
            let clients = self.inner.clients.read();
            match clients.get(client_id) {
                Some(handle) => handle.tx.try_send(message).is_ok(),
                None => return,
            }
        };
        if !ok {
            self.inner.send_failures.fetch_add(1, Ordering::Relaxed);
            self.disconnect(client_id);
        }
    }

    /// Spawn the tick loop. Starting twice is a no-op.
    pub async fn start(&self) {
        let mut runtime = self.inner.runtime.lock().await;
        if runtime.is_some() {
            return;
        }
        let token = CancellationToken::new();
        let handle = tokio::spawn(self.inner.clone().run(token.clone()));
        *runtime = Some((token, handle));
    }

    /// Cancel the tick loop and await it under a bound.
    pub async fn stop(&self) {
        if let Some((token, mut handle)) = self.inner.runtime.lock().await.take() {
            token.cancel();
            if tokio::time::timeout(STOP_TIMEOUT, &mut handle).await.is_err() {
                warn!("broadcaster tick loop did not stop in time; aborting");
                handle.abort();
            }
        }
    }

    pub fn stats(&self) -> BroadcasterStats {
        self.inner.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_engine::PulseConfig;
    use pulse_store::MemoryStore;
    use tokio::time::timeout;

    fn fast_broadcaster(config: BroadcasterConfig) -> Broadcaster {
        let context = Arc::new(PulseContext::new(
            Arc::new(MemoryStore::new()),
            PulseConfig::default(),
        ));
        Broadcaster::new(context, config)
    }

    async fn drain_one(rx: &mut mpsc::Receiver<ServerMessage>) -> ServerMessage {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn connect_queues_a_welcome_enumerating_channels() {
        let broadcaster = fast_broadcaster(BroadcasterConfig::default());
        let mut rx = broadcaster.connect("c-1");

        match drain_one(&mut rx).await {
            ServerMessage::Welcome { data, .. } => {
                assert_eq!(data.client_id, "c-1");
                assert_eq!(data.channels, Channel::ALL.to_vec());
            }
            other => panic!("expected welcome, got {other:?}"),
        }
        assert_eq!(broadcaster.stats().clients, 1);
    }

    #[tokio::test]
    async fn updates_reach_only_subscribed_channels() {
        // Patterns fire fast, features are pushed far out: a client
        // subscribed only to features must see nothing.
        let config = BroadcasterConfig {
            tick_ms: 10,
            features_interval_ms: 3_600_000,
            patterns_interval_ms: 20,
            stats_interval_ms: 3_600_000,
            ..BroadcasterConfig::default()
        };
        let broadcaster = fast_broadcaster(config);

        let mut features_rx = broadcaster.connect("features-client");
        let mut patterns_rx = broadcaster.connect("patterns-client");
        drain_one(&mut features_rx).await; // welcome
        drain_one(&mut patterns_rx).await; // welcome
        broadcaster.subscribe("features-client", [Channel::Features]);
        broadcaster.subscribe("patterns-client", [Channel::Patterns]);

        broadcaster.start().await;
        let msg = drain_one(&mut patterns_rx).await;
        assert!(matches!(msg, ServerMessage::PatternsUpdate { .. }));

        // The features-only client got nothing in the same span.
        assert!(
            timeout(Duration::from_millis(100), features_rx.recv())
                .await
                .is_err()
        );
        broadcaster.stop().await;
    }

    #[tokio::test]
    async fn one_dead_client_never_blocks_the_others() {
        let config = BroadcasterConfig {
            tick_ms: 10,
            features_interval_ms: 20,
            patterns_interval_ms: 3_600_000,
            stats_interval_ms: 3_600_000,
            client_queue: 1,
            ..BroadcasterConfig::default()
        };
        let broadcaster = fast_broadcaster(config);

        // Dead client: receiver dropped immediately, with an unread
        // welcome still occupying its queue.
        let dead_rx = broadcaster.connect("dead");
        drop(dead_rx);
        let mut live_rx = broadcaster.connect("live");
        drain_one(&mut live_rx).await; // welcome
        broadcaster.subscribe("dead", [Channel::Features]);
        broadcaster.subscribe("live", [Channel::Features]);

        broadcaster.start().await;
        let msg = drain_one(&mut live_rx).await;
        assert!(matches!(msg, ServerMessage::FeaturesUpdate { .. }));
        broadcaster.stop().await;

        // The dead client was dropped from the table; the live one stays.
        let stats = broadcaster.stats();
        assert_eq!(stats.clients, 1);
        assert!(stats.send_failures >= 1);
    }

    #[tokio::test]
    async fn stats_payload_reports_every_component() {
        let broadcaster = fast_broadcaster(BroadcasterConfig::default());
        let payload = broadcaster.inner.stats_payload().await;

        assert!(payload["workers"]["workers"]["features"].is_object());
        assert_eq!(payload["producer"]["produced"], 0);
        assert_eq!(payload["store"]["healthy"], true);
        assert!(payload["broadcaster"]["clients"].is_u64());
    }

    #[tokio::test]
    async fn disconnect_removes_the_subscription() {
        let broadcaster = fast_broadcaster(BroadcasterConfig::default());
        let _rx = broadcaster.connect("c-1");
        broadcaster.subscribe("c-1", [Channel::Features]);
        broadcaster.disconnect("c-1");
        assert_eq!(broadcaster.stats().clients, 0);

        // Subscribing a gone client is a no-op, not a resurrection.
        broadcaster.subscribe("c-1", [Channel::Features]);
        assert_eq!(broadcaster.stats().clients, 0);
    }
}
