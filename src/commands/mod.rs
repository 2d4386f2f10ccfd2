//! Request/response correlation between REST-side callers and devices.
//!
//! `execute` persists the command, pushes it over the device's WebSocket,
//! and blocks the caller until the matching JSON-RPC reply arrives or the
//! timeout expires. A timed-out command is demoted to pending: the durable
//! row still completes if the device answers late, and redelivery picks it
//! up on reconnect.

use crate::registry::DeviceRegistry;
use crate::serial;
use crate::storage::{CommandRow, Storage};
use anyhow::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

pub struct CommandCoordinator {
    storage: Arc<Storage>,
    registry: Arc<DeviceRegistry>,
    /// REST-side waiters keyed by command UUID. RPC-id bookkeeping lives in
    /// each connection; replies funnel through [`CommandCoordinator::complete`].
    waiters: Mutex<HashMap<String, oneshot::Sender<Value>>>,
}

impl CommandCoordinator {
    pub fn new(storage: Arc<Storage>, registry: Arc<DeviceRegistry>) -> Self {
        Self {
            storage,
            registry,
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Issue a command against its target device and wait for the reply.
    ///
    /// Deferred commands (`run_at` in the future) and commands for devices
    /// that are not connected are persisted as pending and returned
    /// immediately; delivery is someone else's problem. Otherwise the
    /// command goes out now and the caller blocks up to `timeout`.
    pub async fn execute(&self, mut cmd: CommandRow, timeout: Duration) -> Result<CommandRow> {
        let serial = serial::to_int(&cmd.serial_number)
            .ok_or_else(|| anyhow::anyhow!("'{}' is not a serial number", cmd.serial_number))?;

        let conn = match self.registry.find(serial).filter(|c| c.is_connected()) {
            Some(conn) if cmd.run_at <= now() => conn,
            _ => {
                cmd.status = "pending".to_string();
                self.storage.add_command(&cmd).await?;
                debug!(uuid = %cmd.uuid, serial = %cmd.serial_number, "command queued as pending");
                return Ok(cmd);
            }
        };

        // Persist before sending so the reply path always has a row to
        // complete, even after this caller gives up.
        cmd.status = "executing".to_string();
        self.storage.add_command(&cmd).await?;

        let rx = self.register_waiter(&cmd.uuid);
        if let Err(e) = conn.send_request(&cmd).await {
            warn!(uuid = %cmd.uuid, serial = %cmd.serial_number, err = %e, "command send failed");
            self.drop_waiter(&cmd.uuid);
            self.storage.demote_command_to_pending(&cmd.uuid).await?;
            return self.fetch(&cmd.uuid).await;
        }
        self.storage.command_executed(&cmd.uuid).await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(_reply)) => {
                debug!(uuid = %cmd.uuid, "command completed");
                self.fetch(&cmd.uuid).await
            }
            _ => {
                // Expired (or the sender vanished). The reply may still race
                // in: demote only when it has not completed.
                self.drop_waiter(&cmd.uuid);
                self.storage.demote_command_to_pending(&cmd.uuid).await?;
                debug!(uuid = %cmd.uuid, "command timed out — demoted to pending");
                self.fetch(&cmd.uuid).await
            }
        }
    }

    /// Reply path, invoked by a connection when a JSON-RPC response matches
    /// one of its outstanding RPC ids. Persists the completion and wakes the
    /// REST waiter if one is still blocked.
    pub async fn complete(&self, command_uuid: &str, reply: &Value, full: bool) {
        if let Err(e) = self.storage.command_completed(command_uuid, reply, full).await {
            warn!(uuid = %command_uuid, err = %e, "completion persist failed");
        }
        if let Some(tx) = self.drop_waiter(command_uuid) {
            let _ = tx.send(reply.clone());
        }
    }

    fn register_waiter(&self, command_uuid: &str) -> oneshot::Receiver<Value> {
        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .expect("waiter table poisoned")
            .insert(command_uuid.to_string(), tx);
        rx
    }

    fn drop_waiter(&self, command_uuid: &str) -> Option<oneshot::Sender<Value>> {
        self.waiters
            .lock()
            .expect("waiter table poisoned")
            .remove(command_uuid)
    }

    async fn fetch(&self, uuid: &str) -> Result<CommandRow> {
        self.storage
            .get_command(uuid)
            .await?
            .ok_or_else(|| anyhow::anyhow!("command {uuid} vanished from the store"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::events::{ConnectionNotifier, EventBus};
    use crate::tls::CertInfo;
    use serde_json::json;

    const SERIAL: &str = "112233445566";

    async fn coordinator() -> (CommandCoordinator, Arc<DeviceRegistry>, Arc<Storage>) {
        let dir = tempfile::tempdir().unwrap().keep();
        let storage = Arc::new(Storage::new(&dir).await.unwrap());
        let registry = Arc::new(DeviceRegistry::new(
            600,
            10,
            Arc::new(EventBus::new()),
            Arc::new(ConnectionNotifier::new()),
        ));
        (
            CommandCoordinator::new(storage.clone(), registry.clone()),
            registry,
            storage,
        )
    }

    /// A registered, `connect`-ed session with no live socket: sends fail,
    /// which is exactly what the fallback paths need.
    fn sockless_device(registry: &DeviceRegistry) -> Arc<Connection> {
        let id = registry.next_connection_id();
        let conn = Arc::new(Connection::new(id, "127.0.0.1:9".into(), CertInfo::default()));
        conn.with_state(|s| {
            s.serial_number = crate::serial::to_int(SERIAL).unwrap();
            s.connected = true;
        });
        registry.add_connection(conn.clone());
        registry.set_session_details(id, crate::serial::to_int(SERIAL).unwrap());
        conn
    }

    #[tokio::test]
    async fn disconnected_device_queues_pending() {
        let (coord, _registry, storage) = coordinator().await;
        let cmd = CommandRow::new(SERIAL, "reboot", json!({"serial": SERIAL}), "admin");
        let uuid = cmd.uuid.clone();

        let returned = coord.execute(cmd, Duration::from_millis(100)).await.unwrap();
        assert_eq!(returned.status, "pending");
        let row = storage.get_command(&uuid).await.unwrap().unwrap();
        assert_eq!(row.status, "pending");
        assert_eq!(row.executed, 0);
    }

    #[tokio::test]
    async fn future_run_at_queues_pending_even_when_connected() {
        let (coord, registry, storage) = coordinator().await;
        let _conn = sockless_device(&registry);

        let mut cmd = CommandRow::new(SERIAL, "reboot", json!({"serial": SERIAL}), "admin");
        cmd.run_at = now() + 3600;
        let uuid = cmd.uuid.clone();

        let returned = coord.execute(cmd, Duration::from_millis(100)).await.unwrap();
        assert_eq!(returned.status, "pending");
        assert_eq!(
            storage.get_command(&uuid).await.unwrap().unwrap().status,
            "pending"
        );
    }

    #[tokio::test]
    async fn send_failure_falls_back_to_pending() {
        let (coord, registry, storage) = coordinator().await;
        let _conn = sockless_device(&registry);

        let cmd = CommandRow::new(SERIAL, "reboot", json!({"serial": SERIAL}), "admin");
        let uuid = cmd.uuid.clone();

        let returned = coord.execute(cmd, Duration::from_millis(100)).await.unwrap();
        assert_eq!(returned.status, "pending");
        // The waiter must not leak after the fallback.
        assert!(coord.waiters.lock().unwrap().is_empty());
        assert!(storage.get_command(&uuid).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn late_reply_completes_durable_row() {
        let (coord, _registry, storage) = coordinator().await;
        let mut cmd = CommandRow::new(SERIAL, "reboot", json!({"serial": SERIAL}), "admin");
        cmd.status = "pending".to_string();
        storage.add_command(&cmd).await.unwrap();

        // The REST waiter is long gone; the reply still lands in the store.
        let reply = json!({"jsonrpc": "2.0", "id": 3,
                           "result": {"status": {"error": 0, "text": ""}, "rebooting": true}});
        coord.complete(&cmd.uuid, &reply, true).await;

        let row = storage.get_command(&cmd.uuid).await.unwrap().unwrap();
        assert_eq!(row.status, "completed");
        assert!(row.results.contains("rebooting"));
    }

    #[tokio::test]
    async fn reply_wakes_registered_waiter_exactly_once() {
        let (coord, _registry, storage) = coordinator().await;
        let cmd = CommandRow::new(SERIAL, "reboot", json!({"serial": SERIAL}), "admin");
        storage.add_command(&cmd).await.unwrap();

        let rx = coord.register_waiter(&cmd.uuid);
        let reply = json!({"result": {"status": {"error": 0}}});
        coord.complete(&cmd.uuid, &reply, true).await;
        assert_eq!(rx.await.unwrap(), reply);

        // A duplicate reply finds no waiter and is harmless.
        coord.complete(&cmd.uuid, &reply, true).await;
        assert!(coord.waiters.lock().unwrap().is_empty());
    }
}
