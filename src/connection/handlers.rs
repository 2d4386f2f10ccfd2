//! Device-originated JSON-RPC request handling.
//!
//! Every request's params must name the device serial (after optional
//! `compress_64` expansion); a blacklisted serial closes the connection.
//! Unknown methods are logged and ignored; missing required params drop the
//! frame and the connection stays open.

use super::{proto, CertState, Connection, FrameError};
use crate::serial;
use crate::storage::{CommandRow, LOG_EMERG};
use crate::GatewayContext;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Severity for gateway-generated informational device log entries.
const LOG_INFO: i64 = 6;

fn require<'a>(params: &'a Map<String, Value>, key: &str) -> Result<&'a Value, FrameError> {
    params
        .get(key)
        .ok_or_else(|| FrameError::Protocol(format!("missing required param '{key}'")))
}

fn require_u64(params: &Map<String, Value>, key: &str) -> Result<u64, FrameError> {
    require(params, key)?
        .as_u64()
        .ok_or_else(|| FrameError::Protocol(format!("param '{key}' must be an unsigned integer")))
}

fn require_str<'a>(params: &'a Map<String, Value>, key: &str) -> Result<&'a str, FrameError> {
    require(params, key)?
        .as_str()
        .ok_or_else(|| FrameError::Protocol(format!("param '{key}' must be a string")))
}

/// Render a param as text for persistence: strings stay bare, everything
/// else is stored as its JSON rendering.
fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub(crate) async fn handle_request(
    ctx: &Arc<GatewayContext>,
    conn: &Arc<Connection>,
    method: &str,
    params: Value,
) -> Result<(), FrameError> {
    let params = proto::expand_params(params)
        .map_err(|e| FrameError::Protocol(format!("compress_64 expansion failed: {e}")))?;
    let params = match params.as_object() {
        Some(obj) => obj,
        None => return Err(FrameError::Protocol("params must be an object".into())),
    };

    let serial_str = require_str(params, "serial")?.to_string();
    let serial = serial::to_int(&serial_str)
        .ok_or_else(|| FrameError::Protocol(format!("'{serial_str}' is not a serial number")))?;

    match ctx.storage.is_blacklisted(&serial_str).await {
        Ok(true) => {
            return Err(FrameError::Policy(format!(
                "device {serial_str} is blacklisted and not allowed on this controller"
            )));
        }
        Ok(false) => {}
        Err(e) => warn!(conn = conn.id, err = %e, "blacklist lookup failed"),
    }

    match method.to_ascii_lowercase().as_str() {
        "connect" => connect(ctx, conn, serial, &serial_str, params).await,
        "state" => state(ctx, conn, &serial_str, params).await,
        "healthcheck" => healthcheck(ctx, conn, &serial_str, params).await,
        "log" => device_log(ctx, conn, &serial_str, params).await,
        "crashlog" => crashlog(ctx, conn, &serial_str, params).await,
        "ping" => {
            let uuid = require_u64(params, "uuid")?;
            debug!(conn = conn.id, serial = %serial_str, uuid, "ping: current config");
            Ok(())
        }
        "cfgpending" => {
            let target = require_u64(params, "uuid")?;
            let active = require_u64(params, "active")?;
            debug!(conn = conn.id, serial = %serial_str, active, target, "cfgpending");
            conn.with_state(|s| {
                s.active_uuid = active;
                s.pending_uuid = target;
            });
            Ok(())
        }
        "venue_broadcast" => {
            let data = require(params, "data")?.clone();
            ctx.events
                .post(crate::events::VENUE_BROADCAST, &serial_str, data);
            Ok(())
        }
        other => {
            debug!(conn = conn.id, method = %other, "unknown device method ignored");
            Ok(())
        }
    }
}

async fn connect(
    ctx: &Arc<GatewayContext>,
    conn: &Arc<Connection>,
    serial: u64,
    serial_str: &str,
    params: &Map<String, Value>,
) -> Result<(), FrameError> {
    let uuid = require_u64(params, "uuid")?;
    let firmware = require_str(params, "firmware")?.to_string();
    let capabilities = require(params, "capabilities")?.clone();
    let restrictions = params.get("restrictions").cloned().unwrap_or(Value::Null);

    // Climb the trust ladder now that the device claims a serial. A CN that
    // differs in more than `mismatch_depth` trailing digits is a mismatch,
    // admitted only when the configuration says so.
    let common_name = conn.with_state(|s| s.common_name.clone());
    let cert_state = if common_name.is_empty() {
        None
    } else if serial::matches(&common_name, serial_str, ctx.config.mismatch_depth) {
        Some(CertState::VerifiedSerialMatch)
    } else if ctx.config.allow_mismatch {
        Some(CertState::VerifiedSerialMismatch)
    } else {
        return Err(FrameError::Policy(format!(
            "certificate CN '{common_name}' does not match serial {serial_str}"
        )));
    };

    conn.with_state(|s| {
        s.serial_number = serial;
        s.active_uuid = uuid;
        s.pending_uuid = 0;
        s.firmware = firmware.clone();
        s.restrictions = restrictions;
        s.connected = true;
        if let Some(cs) = cert_state {
            s.cert_state = cs;
        }
    });

    ctx.registry.set_session_details(conn.id, serial);

    match cert_state {
        Some(CertState::VerifiedSerialMatch) => {
            info!(conn = conn.id, serial = %serial_str, "connect: fully validated and authenticated device")
        }
        Some(_) => info!(conn = conn.id, serial = %serial_str, "connect: authenticated but not validated"),
        None => info!(conn = conn.id, serial = %serial_str, "connect: not authenticated or validated"),
    }

    if ctx.config.use_default_config {
        match ctx.storage.device_exists(serial_str).await {
            Ok(false) => {
                if let Err(e) = ctx
                    .storage
                    .create_default_device(serial_str, &capabilities)
                    .await
                {
                    warn!(serial = %serial_str, err = %e, "default device creation failed");
                }
            }
            Ok(true) => {}
            Err(e) => warn!(serial = %serial_str, err = %e, "device lookup failed"),
        }
    }

    if let Err(e) = ctx.storage.update_capabilities(serial_str, &capabilities).await {
        warn!(serial = %serial_str, err = %e, "capability update failed");
    }
    if !firmware.is_empty() {
        if let Err(e) = ctx.storage.set_firmware(serial_str, &firmware).await {
            warn!(serial = %serial_str, err = %e, "firmware update failed");
        }
    }

    look_for_upgrade(ctx, conn, serial_str).await;
    Ok(())
}

async fn state(
    ctx: &Arc<GatewayContext>,
    conn: &Arc<Connection>,
    serial_str: &str,
    params: &Map<String, Value>,
) -> Result<(), FrameError> {
    let uuid = require_u64(params, "uuid")?;
    let state_text = as_text(require(params, "state")?);
    let request_uuid = params.get("request_uuid").and_then(Value::as_str);

    match request_uuid {
        None => debug!(conn = conn.id, serial = %serial_str, uuid, "state: updating"),
        Some(cmd) => debug!(conn = conn.id, serial = %serial_str, uuid, cmd, "state: updating for command"),
    }

    conn.with_state(|s| {
        s.active_uuid = uuid;
        s.last_stats = state_text.clone();
    });

    if let Err(e) = ctx.storage.add_statistics(serial_str, uuid, &state_text).await {
        warn!(serial = %serial_str, err = %e, "statistics persist failed");
    }
    if let Some(cmd) = request_uuid {
        if let Err(e) = ctx.storage.set_command_result(cmd, &state_text).await {
            warn!(serial = %serial_str, err = %e, "command result attribution failed");
        }
    }

    look_for_upgrade(ctx, conn, serial_str).await;
    Ok(())
}

async fn healthcheck(
    ctx: &Arc<GatewayContext>,
    conn: &Arc<Connection>,
    serial_str: &str,
    params: &Map<String, Value>,
) -> Result<(), FrameError> {
    let uuid = require_u64(params, "uuid")?;
    let sanity = require_u64(params, "sanity")? as i64;
    let data = as_text(require(params, "data")?);
    let request_uuid = params.get("request_uuid").and_then(Value::as_str);

    conn.with_state(|s| {
        s.active_uuid = uuid;
        s.last_healthcheck = data.clone();
    });

    if let Err(e) = ctx
        .storage
        .add_healthcheck(serial_str, uuid, sanity, &data)
        .await
    {
        warn!(serial = %serial_str, err = %e, "healthcheck persist failed");
    }
    if let Some(cmd) = request_uuid {
        if let Err(e) = ctx.storage.set_command_result(cmd, &data).await {
            warn!(serial = %serial_str, err = %e, "command result attribution failed");
        }
    }

    look_for_upgrade(ctx, conn, serial_str).await;
    Ok(())
}

async fn device_log(
    ctx: &Arc<GatewayContext>,
    conn: &Arc<Connection>,
    serial_str: &str,
    params: &Map<String, Value>,
) -> Result<(), FrameError> {
    let log = require_str(params, "log")?;
    let severity = require_u64(params, "severity")? as i64;
    let data = params.get("data").map(as_text).unwrap_or_default();

    debug!(conn = conn.id, serial = %serial_str, "log: new entry");
    if let Err(e) = ctx
        .storage
        .add_log(serial_str, log, &data, severity, 0)
        .await
    {
        warn!(serial = %serial_str, err = %e, "device log persist failed");
    }
    Ok(())
}

async fn crashlog(
    ctx: &Arc<GatewayContext>,
    conn: &Arc<Connection>,
    serial_str: &str,
    params: &Map<String, Value>,
) -> Result<(), FrameError> {
    let _uuid = require_u64(params, "uuid")?;
    let lines = require(params, "loglines")?
        .as_array()
        .ok_or_else(|| FrameError::Protocol("param 'loglines' must be an array".into()))?;

    let mut text = String::new();
    for line in lines {
        text.push_str(&as_text(line));
        text.push_str("\r\n");
    }

    debug!(conn = conn.id, serial = %serial_str, "crashlog: new entry");
    if let Err(e) = ctx
        .storage
        .add_log(serial_str, &text, "", LOG_EMERG, 1)
        .await
    {
        warn!(serial = %serial_str, err = %e, "crash log persist failed");
    }
    Ok(())
}

/// Configuration-upgrade check, run after connect/state/healthcheck.
///
/// When the store holds a strictly newer configuration, synthesize a
/// `configure` request attributed to `*system`, persist it as a pending
/// command, and mark the target UUID pending so repeated device messages do
/// not re-send it.
async fn look_for_upgrade(ctx: &Arc<GatewayContext>, conn: &Arc<Connection>, serial_str: &str) {
    let (active_uuid, pending_uuid) = conn.with_state(|s| (s.active_uuid, s.pending_uuid));
    if pending_uuid != 0 {
        return;
    }

    let (config, new_uuid) = match ctx.storage.existing_configuration(serial_str, active_uuid).await
    {
        Ok(Some(found)) => found,
        Ok(None) => return,
        Err(e) => {
            warn!(serial = %serial_str, err = %e, "configuration lookup failed");
            return;
        }
    };

    let mut config: Value = serde_json::from_str(&config).unwrap_or_else(|_| json!({}));
    if let Some(obj) = config.as_object_mut() {
        obj.insert("uuid".to_string(), new_uuid.into());
    }
    let params = json!({
        "serial": serial_str,
        "uuid": new_uuid,
        "when": 0,
        "config": config,
    });

    let cmd = CommandRow::new(serial_str, "configure", params.clone(), "*system");
    if let Err(e) = ctx.storage.add_command(&cmd).await {
        warn!(serial = %serial_str, err = %e, "could not submit configure command");
        return;
    }
    let _ = ctx
        .storage
        .add_log(
            serial_str,
            &format!("Returning newer configuration {new_uuid}."),
            "",
            LOG_INFO,
            0,
        )
        .await;

    conn.with_state(|s| s.pending_uuid = new_uuid);
    let rpc_id = conn.register_rpc(cmd.uuid.clone(), true);
    match conn.send_raw(proto::request(rpc_id, "configure", &params)).await {
        Ok(_) => {
            debug!(serial = %serial_str, rpc = rpc_id, uuid = new_uuid, "submitted configure command")
        }
        Err(e) => {
            // The device never saw the request; allow the next message to retry.
            conn.take_rpc(rpc_id);
            conn.with_state(|s| s.pending_uuid = 0);
            warn!(serial = %serial_str, err = %e, "configure send failed");
        }
    }
}
