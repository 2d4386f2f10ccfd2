use serde_json::Value;
use tokio::sync::broadcast;

/// Topic for periodic gateway load reports.
pub const DEVICE_EVENT_QUEUE: &str = "device_event_queue";
/// Topic for venue-wide device broadcasts.
pub const VENUE_BROADCAST: &str = "venue_broadcast";

/// A single bus record: topic, partition key, JSON payload.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub topic: String,
    pub key: String,
    pub payload: Value,
}

/// Fan-out event bus decoupling the core from its downstream consumers.
///
/// The external broker bridge (or a test) subscribes and drains; with no
/// subscribers, posts are dropped silently.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BusMessage>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx }
    }

    /// Post a record to a topic. No subscribers is fine.
    pub fn post(&self, topic: &str, key: &str, payload: Value) {
        let _ = self.tx.send(BusMessage {
            topic: topic.to_string(),
            key: key.to_string(),
            payload,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.tx.subscribe()
    }
}

/// Connection-count summary pushed to the notification channel after every
/// garbage-collection tick.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionCounts {
    pub number_of_devices: u64,
    pub number_of_connecting_devices: u64,
    pub average_connected_time: u64,
    pub tx: u64,
    pub rx: u64,
}

/// Notification channel for live connection counts (consumed by the admin
/// UI's own WebSocket layer, outside the core).
#[derive(Clone)]
pub struct ConnectionNotifier {
    tx: broadcast::Sender<ConnectionCounts>,
}

impl Default for ConnectionNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionNotifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }

    pub fn number_of_connections(&self, counts: ConnectionCounts) {
        let _ = self.tx.send(counts);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionCounts> {
        self.tx.subscribe()
    }
}
