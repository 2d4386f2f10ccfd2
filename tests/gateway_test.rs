//! Integration tests for the device-facing gateway.
//!
//! Each test composes a real gateway in-process, binds a TLS listener on an
//! ephemeral port, and drives it with a WebSocket client presenting a
//! CA-issued device certificate — the same path a production access point
//! takes.

use apgwd::config::{GatewayConfig, ListenerConfig};
use apgwd::connection::CertState;
use apgwd::storage::CommandRow;
use apgwd::Gateway;
use futures_util::{SinkExt, StreamExt};
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{tungstenite::Message, WebSocketStream};

const SERIAL: &str = "112233445566";

type WsClient = WebSocketStream<tokio_rustls::client::TlsStream<TcpStream>>;

struct TestBed {
    gateway: Gateway,
    port: u16,
    ca_cert: rcgen::Certificate,
    ca_key: KeyPair,
    // Keep the scratch dir (certs + sqlite) alive for the test's duration.
    _dir: tempfile::TempDir,
}

async fn start_gateway(auto_provision: bool) -> TestBed {
    let dir = tempfile::tempdir().unwrap();

    let ca_key = KeyPair::generate().unwrap();
    let mut ca_params = CertificateParams::new(Vec::new()).unwrap();
    ca_params
        .distinguished_name
        .push(DnType::CommonName, "gateway-test-ca");
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let ca_cert = ca_params.self_signed(&ca_key).unwrap();

    let server_key = KeyPair::generate().unwrap();
    let server_params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
    let server_cert = server_params.signed_by(&server_key, &ca_cert, &ca_key).unwrap();

    let ca_path = dir.path().join("issuer.pem");
    let cert_path = dir.path().join("server-cert.pem");
    let key_path = dir.path().join("server-key.pem");
    std::fs::write(&ca_path, ca_cert.pem()).unwrap();
    std::fs::write(&cert_path, server_cert.pem()).unwrap();
    std::fs::write(&key_path, server_key.serialize_pem()).unwrap();

    let config = GatewayConfig {
        data_dir: dir.path().to_path_buf(),
        listeners: vec![ListenerConfig {
            address: "127.0.0.1".to_string(),
            port: 0,
            backlog: None,
            key: key_path,
            cert: cert_path,
            chain: None,
            ca: Some(ca_path.clone()),
            issuer: ca_path,
        }],
        use_default_config: auto_provision,
        ..GatewayConfig::default()
    };

    let gateway = Gateway::start(config).await.unwrap();
    let port = gateway.listener_addrs()[0].port();
    TestBed {
        gateway,
        port,
        ca_cert,
        ca_key,
        _dir: dir,
    }
}

/// Open a device-side WebSocket presenting a CA-issued client certificate
/// with the given CN.
async fn device_socket(bed: &TestBed, cn: &str) -> WsClient {
    let key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::new(Vec::new()).unwrap();
    params.distinguished_name.push(DnType::CommonName, cn);
    let cert = params.signed_by(&key, &bed.ca_cert, &bed.ca_key).unwrap();

    let mut roots = rustls::RootCertStore::empty();
    roots.add(bed.ca_cert.der().clone()).unwrap();
    let client_config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(
            vec![cert.der().clone()],
            rustls_pki_types::PrivateKeyDer::Pkcs8(key.serialize_der().into()),
        )
        .unwrap();

    let tcp = TcpStream::connect(("127.0.0.1", bed.port)).await.unwrap();
    let domain = rustls_pki_types::ServerName::try_from("localhost").unwrap();
    let tls = tokio_rustls::TlsConnector::from(Arc::new(client_config))
        .connect(domain, tcp)
        .await
        .unwrap();

    let url = format!("wss://localhost:{}/", bed.port);
    let (ws, _) = tokio_tungstenite::client_async(url, tls).await.unwrap();
    ws
}

async fn send_json(ws: &mut WsClient, value: Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

async fn recv_json(ws: &mut WsClient, ms: u64) -> Option<Value> {
    loop {
        let msg = tokio::time::timeout(Duration::from_millis(ms), ws.next())
            .await
            .ok()??
            .ok()?;
        match msg {
            Message::Text(text) => return serde_json::from_str(&text).ok(),
            Message::Ping(_) | Message::Pong(_) => continue,
            _ => return None,
        }
    }
}

fn connect_frame(serial: &str, uuid: u64) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": "connect",
        "params": {
            "serial": serial,
            "uuid": uuid,
            "firmware": "ap-fw 2.4",
            "capabilities": {"model": "test-ap"},
        }
    })
}

async fn wait_connected(bed: &TestBed, serial: u64) {
    for _ in 0..250 {
        if bed.gateway.ctx.registry.connected(serial) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("device {serial:x} never reached connected state");
}

/// The socket is closed (or at least half-closed) from the gateway side.
async fn wait_closed(ws: &mut WsClient) {
    let deadline = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                _ => continue,
            }
        }
    });
    deadline.await.expect("gateway never closed the socket");
}

#[tokio::test]
async fn happy_connect_registers_device() {
    let bed = start_gateway(false).await;
    let serial = apgwd::serial::to_int(SERIAL).unwrap();

    let mut ws = device_socket(&bed, SERIAL).await;
    send_json(&mut ws, connect_frame(SERIAL, 100)).await;
    wait_connected(&bed, serial).await;

    let state = bed.gateway.ctx.registry.get_state(serial).unwrap();
    assert!(state.connected);
    assert_eq!(state.serial_number, SERIAL);
    assert_eq!(state.active_uuid, 100);
    assert_eq!(state.pending_uuid, 0);
    assert_eq!(state.firmware, "ap-fw 2.4");
    assert_eq!(state.cert_state, CertState::VerifiedSerialMatch);

    // No newer configuration stored — no configure request may be emitted.
    assert!(recv_json(&mut ws, 300).await.is_none());
}

#[tokio::test]
async fn cn_mismatch_is_admitted_but_flagged() {
    let bed = start_gateway(false).await;
    let serial = apgwd::serial::to_int(SERIAL).unwrap();

    // CN differs from the claimed serial well beyond the mismatch depth.
    let mut ws = device_socket(&bed, "aabbccddeeff").await;
    send_json(&mut ws, connect_frame(SERIAL, 100)).await;
    wait_connected(&bed, serial).await;

    let state = bed.gateway.ctx.registry.get_state(serial).unwrap();
    assert_eq!(state.cert_state, CertState::VerifiedSerialMismatch);
}

#[tokio::test]
async fn newer_stored_config_triggers_configure() {
    let bed = start_gateway(true).await;
    let ctx = bed.gateway.ctx.clone();
    let serial = apgwd::serial::to_int(SERIAL).unwrap();

    ctx.storage
        .create_default_device(SERIAL, &json!({}))
        .await
        .unwrap();
    ctx.storage
        .set_device_configuration(SERIAL, &json!({"radios": [{"band": "5G"}]}), 200)
        .await
        .unwrap();

    let mut ws = device_socket(&bed, SERIAL).await;
    send_json(&mut ws, connect_frame(SERIAL, 100)).await;

    let configure = recv_json(&mut ws, 5_000).await.expect("no configure request");
    assert_eq!(configure["method"], "configure");
    assert_eq!(configure["params"]["serial"], SERIAL);
    assert_eq!(configure["params"]["uuid"], 200);
    assert_eq!(configure["params"]["when"], 0);
    assert_eq!(configure["params"]["config"]["uuid"], 200);
    assert_eq!(configure["params"]["config"]["radios"][0]["band"], "5G");
    let rpc_id = configure["id"].as_u64().expect("configure must carry an id");

    let state = ctx.registry.get_state(serial).unwrap();
    assert_eq!(state.pending_uuid, 200);

    // A pending command row attributed to *system exists.
    let commands = ctx.storage.list_commands(SERIAL).await.unwrap();
    let cmd = commands
        .iter()
        .find(|c| c.command == "configure")
        .expect("configure command row missing");
    assert_eq!(cmd.submitted_by, "*system");
    assert_eq!(cmd.status, "pending");

    // Device acknowledges; the durable row completes.
    send_json(
        &mut ws,
        json!({"jsonrpc": "2.0", "id": rpc_id,
               "result": {"status": {"error": 0, "text": ""}, "uuid": 200}}),
    )
    .await;
    for _ in 0..250 {
        let row = ctx.storage.get_command(&cmd.uuid).await.unwrap().unwrap();
        if row.status == "completed" {
            assert!(row.results.contains("uuid"));
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("configure command never completed");
}

#[tokio::test]
async fn second_connect_supersedes_first() {
    let bed = start_gateway(false).await;
    let serial = apgwd::serial::to_int(SERIAL).unwrap();

    let mut first = device_socket(&bed, SERIAL).await;
    send_json(&mut first, connect_frame(SERIAL, 100)).await;
    wait_connected(&bed, serial).await;
    let first_id = bed.gateway.ctx.registry.get_state(serial).unwrap().connection_id;

    let mut second = device_socket(&bed, SERIAL).await;
    send_json(&mut second, connect_frame(SERIAL, 101)).await;

    for _ in 0..250 {
        let state = bed.gateway.ctx.registry.get_state(serial);
        if state.as_ref().is_some_and(|s| s.connection_id > first_id) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let state = bed.gateway.ctx.registry.get_state(serial).unwrap();
    assert!(state.connection_id > first_id, "registry still points at the old session");
    assert_eq!(state.active_uuid, 101);

    // The displaced connection is torn down by the gateway.
    wait_closed(&mut first).await;
}

#[tokio::test]
async fn command_times_out_then_completes_on_late_reply() {
    let bed = start_gateway(false).await;
    let ctx = bed.gateway.ctx.clone();
    let serial = apgwd::serial::to_int(SERIAL).unwrap();

    let mut ws = device_socket(&bed, SERIAL).await;
    send_json(&mut ws, connect_frame(SERIAL, 100)).await;
    wait_connected(&bed, serial).await;

    let cmd = CommandRow::new(SERIAL, "reboot", json!({"serial": SERIAL, "when": 0}), "admin");
    let uuid = cmd.uuid.clone();
    let exec_ctx = ctx.clone();
    let exec =
        tokio::spawn(async move { exec_ctx.coordinator.execute(cmd, Duration::from_millis(1_500)).await });

    // The device receives the request but stays silent past the timeout.
    let request = recv_json(&mut ws, 5_000).await.expect("no reboot request");
    assert_eq!(request["method"], "reboot");
    let rpc_id = request["id"].as_u64().unwrap();

    let returned = exec.await.unwrap().unwrap();
    assert_eq!(returned.status, "pending", "timed-out command must demote to pending");

    // The late reply still lands on the durable row.
    send_json(
        &mut ws,
        json!({"jsonrpc": "2.0", "id": rpc_id,
               "result": {"status": {"error": 0, "text": ""}, "rebooting": true}}),
    )
    .await;
    for _ in 0..250 {
        let row = ctx.storage.get_command(&uuid).await.unwrap().unwrap();
        if row.status == "completed" {
            assert!(row.results.contains("rebooting"));
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("late reply never completed the command");
}

#[tokio::test]
async fn compressed_state_is_persisted_like_plain() {
    use base64::Engine;
    use std::io::Write;

    let bed = start_gateway(false).await;
    let ctx = bed.gateway.ctx.clone();
    let serial = apgwd::serial::to_int(SERIAL).unwrap();

    let mut ws = device_socket(&bed, SERIAL).await;
    send_json(&mut ws, connect_frame(SERIAL, 100)).await;
    wait_connected(&bed, serial).await;

    let inner = json!({
        "serial": SERIAL,
        "uuid": 100,
        "state": {"unit": {"load": [0.1, 0.2, 0.3]}},
    });
    let mut enc = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
    enc.write_all(inner.to_string().as_bytes()).unwrap();
    let compressed = base64::engine::general_purpose::STANDARD.encode(enc.finish().unwrap());

    send_json(
        &mut ws,
        json!({"jsonrpc": "2.0", "method": "state",
               "params": {"compress_64": compressed}}),
    )
    .await;

    for _ in 0..250 {
        if let Some((uuid, data)) = ctx.storage.latest_statistics(SERIAL).await.unwrap() {
            assert_eq!(uuid, 100);
            assert!(data.contains("load"));
            let live = ctx.registry.get_statistics(serial).unwrap();
            assert!(live.contains("load"));
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("statistics were never persisted");
}

#[tokio::test]
async fn blacklisted_device_is_rejected() {
    let bed = start_gateway(false).await;
    let ctx = bed.gateway.ctx.clone();
    let serial = apgwd::serial::to_int(SERIAL).unwrap();

    ctx.storage
        .add_blacklisted_device(SERIAL, "reported stolen")
        .await
        .unwrap();

    let mut ws = device_socket(&bed, SERIAL).await;
    send_json(&mut ws, connect_frame(SERIAL, 100)).await;

    wait_closed(&mut ws).await;
    assert!(!ctx.registry.connected(serial));
}

#[tokio::test]
async fn device_log_and_healthcheck_flow() {
    let bed = start_gateway(false).await;
    let ctx = bed.gateway.ctx.clone();
    let serial = apgwd::serial::to_int(SERIAL).unwrap();

    let mut ws = device_socket(&bed, SERIAL).await;
    send_json(&mut ws, connect_frame(SERIAL, 100)).await;
    wait_connected(&bed, serial).await;

    send_json(
        &mut ws,
        json!({"jsonrpc": "2.0", "method": "healthcheck",
               "params": {"serial": SERIAL, "uuid": 100, "sanity": 100,
                          "data": {"memory": "ok"}}}),
    )
    .await;
    send_json(
        &mut ws,
        json!({"jsonrpc": "2.0", "method": "log",
               "params": {"serial": SERIAL, "log": "radio restarted", "severity": 4}}),
    )
    .await;

    for _ in 0..250 {
        let health = ctx.registry.get_healthcheck(serial);
        if health.as_ref().is_some_and(|h| h.contains("memory")) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("healthcheck never reached the session record");
}
