//! Sharded index of live device sessions.
//!
//! Serial lookups go through 256 shards keyed by a MAC hash of the serial, so
//! contention stays local to a shard. A separate session table maps
//! connection ids to records for GC and supersession. Lock order is strict:
//! shard lock, then session lock, never the reverse.

use crate::connection::{Connection, ConnectionInfo, RadiusKind, SendError};
use crate::events::{ConnectionCounts, ConnectionNotifier, EventBus, DEVICE_EVENT_QUEUE};
use crate::serial;
use crate::telemetry::TelemetryState;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

const SHARD_COUNT: usize = 256;
/// Seconds between full shard sweeps (GC ticks in between only clear garbage
/// and refresh counters).
const SWEEP_INTERVAL: u64 = 20;
/// Seconds between "Active AP connections" summary log lines.
const SUMMARY_LOG_INTERVAL: u64 = 120;

fn now() -> u64 {
    chrono::Utc::now().timestamp() as u64
}

type Shard = Mutex<HashMap<u64, (u64, Arc<Connection>)>>;

struct SessionTable {
    sessions: HashMap<u64, Arc<Connection>>,
    /// Records awaiting final destruction; cleared at the start of the next
    /// GC tick so any in-flight I/O handler has a full tick to let go.
    garbage: Vec<Arc<Connection>>,
}

pub struct DeviceRegistry {
    shards: Vec<Shard>,
    sessions: Mutex<SessionTable>,
    next_id: AtomicU64,
    session_timeout: u64,
    gc_interval: u64,
    num_connected: AtomicU64,
    num_connecting: AtomicU64,
    average_connected_time: AtomicU64,
    tx_total: AtomicU64,
    rx_total: AtomicU64,
    last_sweep: AtomicU64,
    last_summary_log: AtomicU64,
    events: Arc<EventBus>,
    notifier: Arc<ConnectionNotifier>,
}

impl DeviceRegistry {
    pub fn new(
        session_timeout: u64,
        gc_interval: u64,
        events: Arc<EventBus>,
        notifier: Arc<ConnectionNotifier>,
    ) -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
            sessions: Mutex::new(SessionTable {
                sessions: HashMap::new(),
                garbage: Vec::new(),
            }),
            next_id: AtomicU64::new(0),
            session_timeout,
            gc_interval,
            num_connected: AtomicU64::new(0),
            num_connecting: AtomicU64::new(0),
            average_connected_time: AtomicU64::new(0),
            tx_total: AtomicU64::new(0),
            rx_total: AtomicU64::new(0),
            last_sweep: AtomicU64::new(now()),
            last_summary_log: AtomicU64::new(now()),
            events,
            notifier,
        }
    }

    /// Connection ids are monotonic and never reused for the lifetime of the
    /// gateway process.
    pub fn next_connection_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn shard(&self, serial: u64) -> &Shard {
        &self.shards[serial::shard(serial) as usize]
    }

    // ─── Session lifecycle ───────────────────────────────────────────────────

    /// Track a freshly accepted connection. The serial is unknown until its
    /// `connect` message arrives, so only the session table learns about it.
    pub fn add_connection(&self, conn: Arc<Connection>) {
        let mut table = self.sessions.lock().expect("session table poisoned");
        table.sessions.insert(conn.id, conn);
    }

    /// Claim a serial for a connection once its `connect` is accepted.
    ///
    /// Supersession rule: no existing claim inserts; an older claim is
    /// displaced (and its connection scheduled for teardown); an equal claim
    /// is a no-op; a newer claim wins and this call does nothing.
    pub fn set_session_details(&self, connection_id: u64, serial: u64) -> bool {
        let mut shard = self.shard(serial).lock().expect("shard poisoned");
        let conn = {
            let table = self.sessions.lock().expect("session table poisoned");
            table.sessions.get(&connection_id).cloned()
        };
        let Some(conn) = conn else {
            return false;
        };

        let displaced = match shard.get(&serial) {
            None => {
                shard.insert(serial, (connection_id, conn));
                None
            }
            Some((existing, _)) if *existing == connection_id => return true,
            Some((existing, _)) if *existing < connection_id => shard
                .insert(serial, (connection_id, conn))
                .map(|(_, old)| old),
            Some(_) => return false,
        };
        drop(shard);

        if let Some(old) = displaced {
            info!(
                serial = %serial::to_string(serial),
                old_conn = old.id,
                new_conn = connection_id,
                "session superseded by newer connection"
            );
            old.shut_down();
        }
        true
    }

    /// Release a connection on teardown. The record moves to the garbage
    /// list; the per-serial entry is removed only if it still points here.
    pub fn end_session(&self, connection_id: u64, serial: u64) -> bool {
        let mut shard = self.shard(serial).lock().expect("shard poisoned");
        let mut table = self.sessions.lock().expect("session table poisoned");
        let Some(conn) = table.sessions.remove(&connection_id) else {
            return false;
        };
        table.garbage.push(conn);

        match shard.get(&serial) {
            Some((owner, _)) if *owner == connection_id => {
                shard.remove(&serial);
                true
            }
            _ => false,
        }
    }

    // ─── Queries ─────────────────────────────────────────────────────────────

    /// Current claimant of a serial, if any.
    pub fn find(&self, serial: u64) -> Option<Arc<Connection>> {
        self.shard(serial)
            .lock()
            .expect("shard poisoned")
            .get(&serial)
            .map(|(_, conn)| conn.clone())
    }

    pub fn connected(&self, serial: u64) -> bool {
        self.find(serial).is_some_and(|c| c.is_connected())
    }

    pub fn get_state(&self, serial: u64) -> Option<ConnectionInfo> {
        self.find(serial).map(|c| c.info())
    }

    pub fn get_statistics(&self, serial: u64) -> Option<String> {
        self.find(serial).map(|c| c.with_state(|s| s.last_stats.clone()))
    }

    pub fn get_healthcheck(&self, serial: u64) -> Option<String> {
        self.find(serial)
            .map(|c| c.with_state(|s| s.last_healthcheck.clone()))
    }

    /// Push a raw frame to a device. "Not connected" comes back as an error.
    pub async fn send_frame(&self, serial: u64, payload: String) -> Result<usize, SendError> {
        match self.find(serial) {
            Some(conn) => conn.send_raw(payload).await,
            None => Err(SendError::NotReady),
        }
    }

    pub async fn send_radius(&self, serial: u64, kind: RadiusKind, data: &[u8]) -> bool {
        match self.find(serial) {
            Some(conn) => conn.send_radius(kind, data).await,
            None => false,
        }
    }

    // ─── Telemetry control ───────────────────────────────────────────────────

    pub fn set_websocket_telemetry(
        &self,
        serial: u64,
        interval: u64,
        lifetime: u64,
        types: Vec<String>,
    ) -> bool {
        self.find(serial).is_some_and(|c| {
            c.with_state(|s| s.telemetry.websocket.start(interval, lifetime, types, now()));
            true
        })
    }

    pub fn set_kafka_telemetry(
        &self,
        serial: u64,
        interval: u64,
        lifetime: u64,
        types: Vec<String>,
    ) -> bool {
        self.find(serial).is_some_and(|c| {
            c.with_state(|s| s.telemetry.kafka.start(interval, lifetime, types, now()));
            true
        })
    }

    pub fn stop_websocket_telemetry(&self, serial: u64) -> bool {
        self.find(serial).is_some_and(|c| {
            c.with_state(|s| s.telemetry.websocket.stop());
            true
        })
    }

    pub fn stop_kafka_telemetry(&self, serial: u64) -> bool {
        self.find(serial).is_some_and(|c| {
            c.with_state(|s| s.telemetry.kafka.stop());
            true
        })
    }

    pub fn get_telemetry_parameters(&self, serial: u64) -> Option<TelemetryState> {
        self.find(serial).map(|c| c.with_state(|s| s.telemetry.clone()))
    }

    // ─── Garbage collection ──────────────────────────────────────────────────

    /// Start the periodic collector. Aborted on shutdown.
    pub fn spawn_gc(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(registry.gc_interval));
            interval.tick().await;
            loop {
                interval.tick().await;
                registry.gc_tick(now());
            }
        })
    }

    /// One collector tick. Every tick clears the previous tick's garbage;
    /// every [`SWEEP_INTERVAL`] it additionally sweeps all shards for stale
    /// and idle sessions, then publishes a `load-update` event.
    fn gc_tick(&self, now: u64) {
        // Destroy records parked last tick: every observer has had a full
        // tick to drop its handle.
        {
            let mut table = self.sessions.lock().expect("session table poisoned");
            table.garbage.clear();
        }

        let last_sweep = self.last_sweep.load(Ordering::SeqCst);
        if now.saturating_sub(last_sweep) >= SWEEP_INTERVAL {
            self.last_sweep.store(now, Ordering::SeqCst);
            self.sweep(now);
        } else {
            let table = self.sessions.lock().expect("session table poisoned");
            self.num_connected
                .store(table.sessions.len() as u64, Ordering::SeqCst);
            self.average_connected_time
                .fetch_add(self.gc_interval, Ordering::SeqCst);
        }

        self.refresh_data_totals();

        let last_log = self.last_summary_log.load(Ordering::SeqCst);
        if now.saturating_sub(last_log) > SUMMARY_LOG_INTERVAL {
            self.last_summary_log.store(now, Ordering::SeqCst);
            info!(
                connected = self.num_connected.load(Ordering::SeqCst),
                connecting = self.num_connecting.load(Ordering::SeqCst),
                average_connected_secs = self.average_connected_time.load(Ordering::SeqCst),
                "active AP connections"
            );
        }

        let counts = self.counts();
        self.events.post(
            DEVICE_EVENT_QUEUE,
            "system",
            serde_json::json!({
                "type": "load-update",
                "timestamp": now,
                "payload": counts.clone(),
            }),
        );
        self.notifier.number_of_connections(counts);
    }

    /// Full shard sweep: drop entries whose connection is already closing,
    /// reap sessions idle past the timeout, and recount.
    fn sweep(&self, now: u64) {
        info!("garbage collecting...");
        let mut victims: Vec<Arc<Connection>> = Vec::new();
        let mut connected: u64 = 0;
        let mut connecting: u64 = 0;
        let mut total_connected_time: u64 = 0;

        for shard in &self.shards {
            let mut shard = shard.lock().expect("shard poisoned");
            shard.retain(|_, (_, conn)| {
                if conn.is_closing() {
                    return false;
                }
                let (last_contact, started, is_connected) =
                    conn.with_state(|s| (s.last_contact, s.started, s.connected));
                if now.saturating_sub(last_contact) > self.session_timeout {
                    victims.push(conn.clone());
                    false
                } else if is_connected {
                    connected += 1;
                    total_connected_time += now.saturating_sub(started);
                    true
                } else {
                    connecting += 1;
                    true
                }
            });
        }

        info!(count = victims.len(), "removing idle sessions");
        for conn in victims {
            info!(
                serial = %serial::to_string(conn.serial_number()),
                conn = conn.id,
                "session seems idle — controller disconnecting device"
            );
            conn.shut_down();
            let mut table = self.sessions.lock().expect("session table poisoned");
            if table.sessions.remove(&conn.id).is_some() {
                table.garbage.push(conn);
            }
        }

        self.num_connected.store(connected, Ordering::SeqCst);
        self.num_connecting.store(connecting, Ordering::SeqCst);
        self.average_connected_time.store(
            if connected > 0 { total_connected_time / connected } else { 0 },
            Ordering::SeqCst,
        );
        info!("garbage collecting done");
    }

    fn refresh_data_totals(&self) {
        let (tx, rx) = {
            let table = self.sessions.lock().expect("session table poisoned");
            table.sessions.values().fold((0u64, 0u64), |(tx, rx), conn| {
                let (t, r) = conn.with_state(|s| (s.tx_bytes, s.rx_bytes));
                (tx + t, rx + r)
            })
        };
        self.tx_total.store(tx, Ordering::SeqCst);
        self.rx_total.store(rx, Ordering::SeqCst);
    }

    pub fn counts(&self) -> ConnectionCounts {
        ConnectionCounts {
            number_of_devices: self.num_connected.load(Ordering::SeqCst),
            number_of_connecting_devices: self.num_connecting.load(Ordering::SeqCst),
            average_connected_time: self.average_connected_time.load(Ordering::SeqCst),
            tx: self.tx_total.load(Ordering::SeqCst),
            rx: self.rx_total.load(Ordering::SeqCst),
        }
    }

    /// Close every live session (gateway shutdown).
    pub fn shut_down_all(&self) {
        let table = self.sessions.lock().expect("session table poisoned");
        for conn in table.sessions.values() {
            debug!(conn = conn.id, "closing session for shutdown");
            conn.shut_down();
        }
    }
}
