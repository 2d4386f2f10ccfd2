pub mod handlers;
pub mod proto;

use crate::storage::CommandRow;
use crate::telemetry::TelemetryState;
use crate::tls::CertInfo;
use crate::GatewayContext;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio_rustls::server::TlsStream;
use tokio_tungstenite::{
    accept_async_with_config,
    tungstenite::{protocol::WebSocketConfig, Message},
    WebSocketStream,
};
use tracing::{debug, info, warn};

type WsSink = SplitSink<WebSocketStream<TlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<TlsStream<TcpStream>>>;

/// Protocol violations tolerated per window before the connection is torn down.
const MAX_PROTOCOL_ERRORS: u32 = 10;
const PROTOCOL_ERROR_WINDOW: std::time::Duration = std::time::Duration::from_secs(60);

fn now() -> u64 {
    chrono::Utc::now().timestamp() as u64
}

// ─── Certificate trust ladder ────────────────────────────────────────────────

/// How far up the trust ladder this device's certificate got.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CertState {
    #[default]
    NoCert,
    /// A certificate was presented but it is not issued by the configured issuer.
    PresentInvalid,
    /// Issued by the configured issuer; serial not yet checked.
    ValidCa,
    /// CN matches the serial claimed at `connect` (within the mismatch depth).
    VerifiedSerialMatch,
    /// CN does not match the claimed serial; admitted per configuration.
    VerifiedSerialMismatch,
}

// ─── Errors at the frame boundary ────────────────────────────────────────────

/// Classified failure while servicing one frame. Only `Transport` and
/// repeated `Protocol` errors tear the connection down; storage failures are
/// logged where they happen and the connection survives.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("policy: {0}")]
    Policy(String),
}

/// Tumbling window counting protocol violations (resets each window).
struct ProtocolErrorWindow {
    count: u32,
    window_start: Instant,
}

impl ProtocolErrorWindow {
    fn new() -> Self {
        Self {
            count: 0,
            window_start: Instant::now(),
        }
    }

    /// Returns `true` when the violation budget for this window is exhausted.
    fn record(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.window_start) >= PROTOCOL_ERROR_WINDOW {
            self.count = 0;
            self.window_start = now;
        }
        self.count += 1;
        self.count >= MAX_PROTOCOL_ERRORS
    }
}

// ─── Session state ───────────────────────────────────────────────────────────

/// Mutable state of one device session; the authoritative connection record.
#[derive(Debug)]
pub struct SessionState {
    pub serial_number: u64,
    pub peer_address: String,
    pub common_name: String,
    pub cert_state: CertState,
    /// Config UUID the device reports running.
    pub active_uuid: u64,
    /// Config UUID the gateway asked it to adopt (0 = none in flight).
    pub pending_uuid: u64,
    pub started: u64,
    pub last_contact: u64,
    /// True once `connect` has been accepted.
    pub connected: bool,
    pub firmware: String,
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub msg_count: u64,
    /// Device-declared policy flags from `connect`.
    pub restrictions: Value,
    pub last_stats: String,
    pub last_healthcheck: String,
    pub telemetry: TelemetryState,
}

/// Read-only snapshot of a session for registry queries.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub connection_id: u64,
    pub serial_number: String,
    pub peer_address: String,
    pub common_name: String,
    pub cert_state: CertState,
    pub active_uuid: u64,
    pub pending_uuid: u64,
    pub started: u64,
    pub last_contact: u64,
    pub connected: bool,
    pub firmware: String,
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub msg_count: u64,
    pub restrictions: Value,
}

// ─── RPC correlation table ───────────────────────────────────────────────────

/// Waiter attached to one outstanding RPC id.
#[derive(Debug, Clone)]
pub struct RpcRecord {
    pub command_uuid: String,
    /// False for fire-and-forget `request` commands: the reply is stored raw,
    /// without status parsing.
    pub full: bool,
}

struct RpcTable {
    next_id: u64,
    outstanding: HashMap<u64, RpcRecord>,
}

// ─── Connection ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub enum RadiusKind {
    Authentication,
    Accounting,
    ChangeOfAuthorization,
}

impl RadiusKind {
    fn as_str(self) -> &'static str {
        match self {
            RadiusKind::Authentication => "auth",
            RadiusKind::Accounting => "acct",
            RadiusKind::ChangeOfAuthorization => "coa",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("device is not ready")]
    NotReady,
    #[error("command params are not valid JSON: {0}")]
    Params(#[from] serde_json::Error),
    #[error("websocket send failed: {0}")]
    Transport(String),
}

/// One device's live connection.
///
/// The spawned reactor task owns the read half and drives all inbound
/// processing; the write half sits behind the send mutex so REST-side
/// callers and the reactor interleave at frame granularity, never torn.
pub struct Connection {
    pub id: u64,
    state: Mutex<SessionState>,
    sink: tokio::sync::Mutex<Option<WsSink>>,
    rpc: Mutex<RpcTable>,
    closing: AtomicBool,
    close: Notify,
}

impl Connection {
    pub fn new(id: u64, peer_address: String, cert: CertInfo) -> Self {
        let ts = now();
        Self {
            id,
            state: Mutex::new(SessionState {
                serial_number: 0,
                peer_address,
                common_name: cert.common_name,
                cert_state: cert.state,
                active_uuid: 0,
                pending_uuid: 0,
                started: ts,
                last_contact: ts,
                connected: false,
                firmware: String::new(),
                tx_bytes: 0,
                rx_bytes: 0,
                msg_count: 0,
                restrictions: Value::Null,
                last_stats: String::new(),
                last_healthcheck: String::new(),
                telemetry: TelemetryState::default(),
            }),
            sink: tokio::sync::Mutex::new(None),
            rpc: Mutex::new(RpcTable {
                next_id: 1,
                outstanding: HashMap::new(),
            }),
            closing: AtomicBool::new(false),
            close: Notify::new(),
        }
    }

    async fn attach_sink(&self, sink: WsSink) {
        *self.sink.lock().await = Some(sink);
    }

    /// Run a closure against the session state under its lock.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        let mut guard = self.state.lock().expect("session state poisoned");
        f(&mut guard)
    }

    pub fn info(&self) -> ConnectionInfo {
        self.with_state(|s| ConnectionInfo {
            connection_id: self.id,
            serial_number: crate::serial::to_string(s.serial_number),
            peer_address: s.peer_address.clone(),
            common_name: s.common_name.clone(),
            cert_state: s.cert_state,
            active_uuid: s.active_uuid,
            pending_uuid: s.pending_uuid,
            started: s.started,
            last_contact: s.last_contact,
            connected: s.connected,
            firmware: s.firmware.clone(),
            tx_bytes: s.tx_bytes,
            rx_bytes: s.rx_bytes,
            msg_count: s.msg_count,
            restrictions: s.restrictions.clone(),
        })
    }

    pub fn serial_number(&self) -> u64 {
        self.with_state(|s| s.serial_number)
    }

    pub fn is_connected(&self) -> bool {
        self.with_state(|s| s.connected)
    }

    fn touch(&self) {
        self.with_state(|s| s.last_contact = now());
    }

    // ─── Outbound ────────────────────────────────────────────────────────────

    /// Send a raw text frame (telemetry forwarding uses this).
    pub async fn send_raw(&self, payload: String) -> Result<usize, SendError> {
        let bytes = payload.len();
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(SendError::NotReady)?;
        sink.send(Message::Text(payload))
            .await
            .map_err(|e| SendError::Transport(e.to_string()))?;
        self.with_state(|s| s.tx_bytes += bytes as u64);
        Ok(bytes)
    }

    /// Wrap a stored command into a JSON-RPC request, send it, and track the
    /// id so the device's reply finds its way back to the durable row.
    ///
    /// Commands flagged custom go out as `perform`; `request` commands are
    /// fire-and-forget at the RPC level (`Full = false`).
    pub async fn send_request(&self, cmd: &CommandRow) -> Result<u64, SendError> {
        let params: Value = serde_json::from_str(&cmd.params)?;
        let method = if cmd.custom != 0 { "perform" } else { cmd.command.as_str() };
        let full = cmd.command != "request";

        let id = self.register_rpc(cmd.uuid.clone(), full);
        let payload = proto::request(id, method, &params);
        if let Err(e) = self.send_raw(payload).await {
            // The device never saw this id; forget the waiter.
            self.take_rpc(id);
            return Err(e);
        }
        Ok(id)
    }

    /// Tunnel a RADIUS payload to the device. Returns false when the device
    /// has not completed `connect` yet or the socket is gone.
    pub async fn send_radius(&self, kind: RadiusKind, data: &[u8]) -> bool {
        if !self.is_connected() {
            return false;
        }
        use base64::Engine;
        let params = serde_json::json!({
            "radius": kind.as_str(),
            "data": base64::engine::general_purpose::STANDARD.encode(data),
        });
        self.send_raw(proto::notification("radius", &params))
            .await
            .is_ok()
    }

    /// Allocate the next RPC id and attach a waiter to it. Ids are strictly
    /// increasing and never reused within this connection's lifetime.
    pub fn register_rpc(&self, command_uuid: String, full: bool) -> u64 {
        let mut table = self.rpc.lock().expect("rpc table poisoned");
        let id = table.next_id;
        table.next_id += 1;
        table.outstanding.insert(id, RpcRecord { command_uuid, full });
        id
    }

    /// Detach the waiter for a reply id, if one is still outstanding.
    pub fn take_rpc(&self, id: u64) -> Option<RpcRecord> {
        self.rpc
            .lock()
            .expect("rpc table poisoned")
            .outstanding
            .remove(&id)
    }

    // ─── Teardown ────────────────────────────────────────────────────────────

    /// Ask the reactor task to stop. Safe to call from any task, including
    /// under registry shard locks: it only flips a flag and wakes the task.
    pub fn shut_down(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.close.notify_waiters();
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    async fn closed(&self) {
        loop {
            // Register with the notifier before checking the flag, so a
            // shutdown landing in between cannot be missed.
            let mut notified = std::pin::pin!(self.close.notified());
            notified.as_mut().enable();
            if self.is_closing() {
                return;
            }
            notified.await;
        }
    }
}

// ─── Reactor task ────────────────────────────────────────────────────────────

/// Drive one accepted TLS socket: WebSocket upgrade, registration, frame
/// loop, teardown. Spawned by the listener pool; one task per device.
pub async fn run(
    ctx: Arc<GatewayContext>,
    stream: TlsStream<TcpStream>,
    peer: SocketAddr,
    cert: CertInfo,
) {
    let ws_config = WebSocketConfig {
        max_message_size: Some(ctx.config.max_payload),
        max_frame_size: Some(ctx.config.max_payload),
        ..Default::default()
    };
    let ws = match accept_async_with_config(stream, Some(ws_config)).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(peer = %peer, err = %e, "websocket upgrade failed");
            return;
        }
    };

    let (sink, stream) = ws.split();
    let id = ctx.registry.next_connection_id();
    let conn = Arc::new(Connection::new(id, peer.to_string(), cert));
    conn.attach_sink(sink).await;
    ctx.registry.add_connection(conn.clone());
    debug!(conn = id, peer = %peer, "connection established");

    read_loop(&ctx, &conn, stream).await;

    // Best-effort close frame, then release the record to the registry. The
    // garbage list keeps it alive for one more GC tick.
    {
        let mut guard = conn.sink.lock().await;
        if let Some(sink) = guard.as_mut() {
            let _ = sink.send(Message::Close(None)).await;
        }
        *guard = None;
    }
    let serial = conn.serial_number();
    ctx.registry.end_session(id, serial);
    info!(conn = id, serial = %crate::serial::to_string(serial), "connection terminated");
}

async fn read_loop(ctx: &Arc<GatewayContext>, conn: &Arc<Connection>, mut stream: WsStream) {
    let mut errors = ProtocolErrorWindow::new();
    loop {
        let msg = tokio::select! {
            biased;
            _ = conn.closed() => break,
            msg = stream.next() => msg,
        };

        let msg = match msg {
            Some(Ok(m)) => m,
            Some(Err(e)) => {
                warn!(conn = conn.id, err = %e, "websocket read failed");
                break;
            }
            None => {
                debug!(conn = conn.id, "peer closed the stream");
                break;
            }
        };

        match handle_message(ctx, conn, msg).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(FrameError::Protocol(reason)) => {
                warn!(conn = conn.id, %reason, "frame dropped");
                if errors.record() {
                    warn!(conn = conn.id, "too many protocol violations — disconnecting");
                    break;
                }
            }
            Err(FrameError::Transport(reason)) => {
                warn!(conn = conn.id, %reason, "transport failure — disconnecting");
                break;
            }
            Err(FrameError::Policy(reason)) => {
                info!(conn = conn.id, %reason, "policy violation — disconnecting");
                break;
            }
        }
    }
}

/// Service a single inbound frame. `Ok(false)` means an orderly close.
async fn handle_message(
    ctx: &Arc<GatewayContext>,
    conn: &Arc<Connection>,
    msg: Message,
) -> Result<bool, FrameError> {
    match msg {
        Message::Text(text) => {
            // A zero-length frame is the device's half-close.
            if text.is_empty() {
                info!(conn = conn.id, "half-close received");
                return Ok(false);
            }
            conn.with_state(|s| {
                s.rx_bytes += text.len() as u64;
                s.msg_count += 1;
            });
            handle_text(ctx, conn, &text).await?;
            Ok(true)
        }
        Message::Ping(data) => {
            let mut guard = conn.sink.lock().await;
            if let Some(sink) = guard.as_mut() {
                sink.send(Message::Pong(data))
                    .await
                    .map_err(|e| FrameError::Transport(e.to_string()))?;
            }
            Ok(true)
        }
        Message::Pong(_) => Ok(true),
        Message::Close(_) => {
            debug!(conn = conn.id, "close frame received");
            Ok(false)
        }
        other => {
            warn!(conn = conn.id, opcode = ?other, "unknown frame ignored");
            Ok(true)
        }
    }
}

async fn handle_text(
    ctx: &Arc<GatewayContext>,
    conn: &Arc<Connection>,
    text: &str,
) -> Result<(), FrameError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| FrameError::Protocol(format!("malformed JSON: {e}")))?;

    match proto::classify(value) {
        Some(proto::Frame::Request { method, params, .. }) => {
            conn.touch();
            handlers::handle_request(ctx, conn, &method, params).await
        }
        Some(proto::Frame::Response { id, payload }) => {
            conn.touch();
            match conn.take_rpc(id) {
                Some(rpc) => {
                    debug!(conn = conn.id, rpc = id, "completed outstanding RPC");
                    ctx.coordinator
                        .complete(&rpc.command_uuid, &payload, rpc.full)
                        .await;
                    Ok(())
                }
                None => {
                    // Benign: the REST waiter timed out and moved on.
                    warn!(conn = conn.id, rpc = id, "no outstanding RPC for reply");
                    Ok(())
                }
            }
        }
        None => {
            let prefix: String = text.chars().take(128).collect();
            Err(FrameError::Protocol(format!(
                "payload is not JSON-RPC 2.0: {prefix}"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_ids_are_monotonic_and_unique() {
        let conn = Connection::new(1, "127.0.0.1:1".into(), CertInfo::default());
        let a = conn.register_rpc("cmd-a".into(), true);
        let b = conn.register_rpc("cmd-b".into(), false);
        assert!(b > a);

        let rec = conn.take_rpc(a).unwrap();
        assert_eq!(rec.command_uuid, "cmd-a");
        assert!(rec.full);
        // A waiter wakes exactly once: the second take finds nothing.
        assert!(conn.take_rpc(a).is_none());
        assert!(!conn.take_rpc(b).unwrap().full);
    }

    #[test]
    fn protocol_error_window_tumbles() {
        let mut w = ProtocolErrorWindow::new();
        for _ in 0..MAX_PROTOCOL_ERRORS - 1 {
            assert!(!w.record());
        }
        assert!(w.record());
    }

    #[tokio::test]
    async fn send_without_sink_reports_not_ready() {
        let conn = Connection::new(1, "127.0.0.1:1".into(), CertInfo::default());
        assert!(matches!(
            conn.send_raw("{}".into()).await,
            Err(SendError::NotReady)
        ));
        // Radius tunneling additionally requires an identified device.
        assert!(!conn.send_radius(RadiusKind::Accounting, b"\x01\x02").await);
    }

    #[test]
    fn shutdown_is_sticky() {
        let conn = Connection::new(1, "127.0.0.1:1".into(), CertInfo::default());
        assert!(!conn.is_closing());
        conn.shut_down();
        assert!(conn.is_closing());
    }
}
