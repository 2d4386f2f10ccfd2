use anyhow::Result;
use serde_json::Value;
use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};
use std::{path::Path, str::FromStr};
use uuid::Uuid;

/// Default timeout for individual SQLite queries.
/// Prevents hung queries from stalling a connection's frame loop.
const QUERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Execute a future with the standard query timeout.
async fn with_timeout<T>(fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(QUERY_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!(
            "database query timed out after {}s",
            QUERY_TIMEOUT.as_secs()
        )),
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

// ─── Rows ────────────────────────────────────────────────────────────────────

/// Durable record of one RPC issued (or queued) against a device.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CommandRow {
    pub uuid: String,
    pub serial_number: String,
    pub command: String,
    /// JSON object sent as the request's `params`.
    pub params: String,
    /// Epoch seconds; 0 = deliver immediately.
    pub run_at: i64,
    pub submitted_by: String,
    /// 'pending' | 'executing' | 'completed' | 'failed'
    pub status: String,
    /// Non-zero: wrap the command in a `perform` request.
    pub custom: i64,
    pub error_code: i64,
    pub error_text: String,
    pub results: String,
    pub attached_file: Option<String>,
    pub executed: i64,
    pub completed: i64,
    pub created: i64,
}

impl CommandRow {
    /// Fresh command stub with a v4 UUID, ready to persist or send.
    pub fn new(serial_number: &str, command: &str, params: Value, submitted_by: &str) -> Self {
        Self {
            uuid: Uuid::new_v4().to_string(),
            serial_number: serial_number.to_string(),
            command: command.to_string(),
            params: params.to_string(),
            run_at: 0,
            submitted_by: submitted_by.to_string(),
            status: "pending".to_string(),
            custom: 0,
            error_code: 0,
            error_text: String::new(),
            results: String::new(),
            attached_file: None,
            executed: 0,
            completed: 0,
            created: now(),
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DeviceRow {
    pub serial_number: String,
    pub capabilities: String,
    pub firmware: String,
    pub configuration: String,
    pub config_uuid: i64,
    pub created: i64,
    pub modified: i64,
}

/// Severity values for device log entries (syslog numbering).
pub const LOG_EMERG: i64 = 0;

#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    pub async fn new(data_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;
        let db_path = data_dir.join("apgwd.db");
        let opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .create_if_missing(true);

        let pool = SqlitePool::connect_with(opts).await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        for sql in [include_str!("migrations/001_init.sql")] {
            for stmt in sql.split(';') {
                let stmt = stmt.trim();
                if !stmt.is_empty() {
                    sqlx::query(stmt).execute(pool).await?;
                }
            }
        }
        Ok(())
    }

    // ─── Commands ───────────────────────────────────────────────────────────

    pub async fn add_command(&self, cmd: &CommandRow) -> Result<()> {
        sqlx::query(
            "INSERT INTO commands (uuid, serial_number, command, params, run_at, submitted_by,
                                   status, custom, error_code, error_text, results,
                                   executed, completed, created)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&cmd.uuid)
        .bind(&cmd.serial_number)
        .bind(&cmd.command)
        .bind(&cmd.params)
        .bind(cmd.run_at)
        .bind(&cmd.submitted_by)
        .bind(&cmd.status)
        .bind(cmd.custom)
        .bind(cmd.error_code)
        .bind(&cmd.error_text)
        .bind(&cmd.results)
        .bind(cmd.executed)
        .bind(cmd.completed)
        .bind(cmd.created)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_command(&self, uuid: &str) -> Result<Option<CommandRow>> {
        Ok(sqlx::query_as("SELECT * FROM commands WHERE uuid = ?")
            .bind(uuid)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// All commands recorded against a device, newest first.
    pub async fn list_commands(&self, serial_number: &str) -> Result<Vec<CommandRow>> {
        with_timeout(async {
            Ok(sqlx::query_as(
                "SELECT * FROM commands WHERE serial_number = ? ORDER BY created DESC, uuid DESC",
            )
            .bind(serial_number)
            .fetch_all(&self.pool)
            .await?)
        })
        .await
    }

    pub async fn update_command_status(&self, uuid: &str, status: &str) -> Result<()> {
        sqlx::query("UPDATE commands SET status = ? WHERE uuid = ?")
            .bind(status)
            .bind(uuid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Mark a command as handed to the device.
    pub async fn command_executed(&self, uuid: &str) -> Result<()> {
        sqlx::query("UPDATE commands SET status = 'executing', executed = ? WHERE uuid = ?")
            .bind(now())
            .bind(uuid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record a device reply against its durable command row.
    ///
    /// With `full` set, the reply's `result.status` object is mined for
    /// `error`/`text`; otherwise the raw result text is stored untouched
    /// (fire-and-forget `request` commands carry no status envelope).
    pub async fn command_completed(&self, uuid: &str, reply: &Value, full: bool) -> Result<()> {
        let result = reply.get("result").cloned().unwrap_or(Value::Null);
        let (error_code, error_text) = if full {
            let status = result.get("status");
            (
                status
                    .and_then(|s| s.get("error"))
                    .and_then(Value::as_i64)
                    .unwrap_or(0),
                status
                    .and_then(|s| s.get("text"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            )
        } else {
            (0, String::new())
        };

        sqlx::query(
            "UPDATE commands SET status = 'completed', error_code = ?, error_text = ?,
                                 results = ?, completed = ? WHERE uuid = ?",
        )
        .bind(error_code)
        .bind(&error_text)
        .bind(result.to_string())
        .bind(now())
        .bind(uuid)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Timeout fallback: demote an in-flight command to pending unless the
    /// reply raced in and completed it first.
    pub async fn demote_command_to_pending(&self, uuid: &str) -> Result<()> {
        sqlx::query(
            "UPDATE commands SET status = 'pending' WHERE uuid = ? AND status != 'completed'",
        )
        .bind(uuid)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Attribute a device-pushed payload (state/healthcheck) to the command
    /// that requested it.
    pub async fn set_command_result(&self, uuid: &str, result: &str) -> Result<()> {
        sqlx::query(
            "UPDATE commands SET status = 'completed', results = ?, completed = ? WHERE uuid = ?",
        )
        .bind(result)
        .bind(now())
        .bind(uuid)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn attach_file_to_command(&self, uuid: &str, path: &str) -> Result<()> {
        sqlx::query("UPDATE commands SET attached_file = ? WHERE uuid = ?")
            .bind(path)
            .bind(uuid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ─── Devices ────────────────────────────────────────────────────────────

    /// Newest stored configuration for a device, if it is newer than what the
    /// device reports running. Returns `(config_json, uuid)`.
    pub async fn existing_configuration(
        &self,
        serial_number: &str,
        current_uuid: u64,
    ) -> Result<Option<(String, u64)>> {
        let row: Option<(String, i64)> = sqlx::query_as(
            "SELECT configuration, config_uuid FROM devices WHERE serial_number = ?",
        )
        .bind(serial_number)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.and_then(|(config, uuid)| {
            let uuid = uuid as u64;
            (uuid > current_uuid).then_some((config, uuid))
        }))
    }

    pub async fn device_exists(&self, serial_number: &str) -> Result<bool> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM devices WHERE serial_number = ?")
                .bind(serial_number)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    /// Auto-provisioning: seed a device row from its first `connect`.
    /// The default configuration is stamped with the current time as its UUID
    /// so a freshly provisioned device is immediately upgradeable.
    pub async fn create_default_device(
        &self,
        serial_number: &str,
        capabilities: &Value,
    ) -> Result<()> {
        let ts = now();
        let config = serde_json::json!({ "uuid": ts });
        sqlx::query(
            "INSERT OR IGNORE INTO devices
                 (serial_number, capabilities, configuration, config_uuid, created, modified)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(serial_number)
        .bind(capabilities.to_string())
        .bind(config.to_string())
        .bind(ts)
        .bind(ts)
        .bind(ts)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_capabilities(&self, serial_number: &str, capabilities: &Value) -> Result<()> {
        sqlx::query(
            "UPDATE devices SET capabilities = ?, modified = ? WHERE serial_number = ?",
        )
        .bind(capabilities.to_string())
        .bind(now())
        .bind(serial_number)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_firmware(&self, serial_number: &str, firmware: &str) -> Result<()> {
        sqlx::query("UPDATE devices SET firmware = ?, modified = ? WHERE serial_number = ?")
            .bind(firmware)
            .bind(now())
            .bind(serial_number)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Store a new target configuration for a device (the REST surface calls
    /// this when an operator pushes a config).
    pub async fn set_device_configuration(
        &self,
        serial_number: &str,
        configuration: &Value,
        uuid: u64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE devices SET configuration = ?, config_uuid = ?, modified = ?
             WHERE serial_number = ?",
        )
        .bind(configuration.to_string())
        .bind(uuid as i64)
        .bind(now())
        .bind(serial_number)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_device(&self, serial_number: &str) -> Result<Option<DeviceRow>> {
        Ok(sqlx::query_as("SELECT * FROM devices WHERE serial_number = ?")
            .bind(serial_number)
            .fetch_optional(&self.pool)
            .await?)
    }

    // ─── Telemetry payloads ─────────────────────────────────────────────────

    pub async fn add_statistics(&self, serial_number: &str, uuid: u64, data: &str) -> Result<()> {
        with_timeout(async {
            sqlx::query(
                "INSERT INTO statistics (serial_number, uuid, data, recorded) VALUES (?, ?, ?, ?)",
            )
            .bind(serial_number)
            .bind(uuid as i64)
            .bind(data)
            .bind(now())
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    /// Most recent statistics payload for a device.
    pub async fn latest_statistics(&self, serial_number: &str) -> Result<Option<(i64, String)>> {
        Ok(sqlx::query_as(
            "SELECT uuid, data FROM statistics WHERE serial_number = ?
             ORDER BY recorded DESC, id DESC LIMIT 1",
        )
        .bind(serial_number)
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn add_healthcheck(
        &self,
        serial_number: &str,
        uuid: u64,
        sanity: i64,
        data: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO healthchecks (serial_number, uuid, sanity, data, recorded)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(serial_number)
        .bind(uuid as i64)
        .bind(sanity)
        .bind(data)
        .bind(now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// `log_type` 0 = normal device log, 1 = crash log.
    pub async fn add_log(
        &self,
        serial_number: &str,
        log: &str,
        data: &str,
        severity: i64,
        log_type: i64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO device_logs (serial_number, log, data, severity, log_type, recorded)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(serial_number)
        .bind(log)
        .bind(data)
        .bind(severity)
        .bind(log_type)
        .bind(now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ─── Blacklist ──────────────────────────────────────────────────────────

    pub async fn is_blacklisted(&self, serial_number: &str) -> Result<bool> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM blacklist WHERE serial_number = ?")
                .bind(serial_number)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    pub async fn add_blacklisted_device(&self, serial_number: &str, reason: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO blacklist (serial_number, reason, created) VALUES (?, ?, ?)
             ON CONFLICT(serial_number) DO UPDATE SET reason = excluded.reason",
        )
        .bind(serial_number)
        .bind(reason)
        .bind(now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
