//! JSON-RPC 2.0 framing for the device wire protocol.
//!
//! Text frames carry a single JSON value: either a device-originated request
//! (`method` + `params`, `id` optional — notifications omit it) or a reply to
//! a gateway-issued request (`result` + `id`). Devices may ship bulky
//! `params` as `compress_64`: base64-wrapped, zlib-deflated JSON.

use base64::Engine;
use serde_json::Value;
use std::io::Read;

/// Expansion cap for compressed payloads, as a multiple of the wire size.
/// The device supplies an uncompressed-size hint but it is untrusted.
const MAX_INFLATE_RATIO: usize = 10;

/// A classified inbound frame.
#[derive(Debug)]
pub enum Frame {
    /// Device-originated request or notification.
    Request {
        method: String,
        params: Value,
        id: Option<u64>,
    },
    /// Reply to a request this gateway issued.
    Response { id: u64, payload: Value },
}

/// Classify a parsed JSON value into one of the two frame shapes.
/// Anything else is not JSON-RPC 2.0 and is reported to the caller.
pub fn classify(value: Value) -> Option<Frame> {
    if value.get("jsonrpc").is_none() {
        return None;
    }
    if value.get("method").is_some() && value.get("params").is_some() {
        let id = value.get("id").and_then(Value::as_u64);
        let method = value.get("method")?.as_str()?.to_string();
        let params = value.get("params")?.clone();
        return Some(Frame::Request { method, params, id });
    }
    if value.get("result").is_some() {
        let id = value.get("id").and_then(Value::as_u64)?;
        return Some(Frame::Response { id, payload: value });
    }
    None
}

/// Serialize an outbound JSON-RPC request.
pub fn request(id: u64, method: &str, params: &Value) -> String {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params,
    })
    .to_string()
}

/// Serialize an outbound JSON-RPC notification (no reply expected).
pub fn notification(method: &str, params: &Value) -> String {
    serde_json::json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
    })
    .to_string()
}

#[derive(Debug, thiserror::Error)]
pub enum ExpandError {
    #[error("compress_64 is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("zlib inflate failed: {0}")]
    Inflate(#[from] std::io::Error),
    #[error("inflated payload exceeds {0} bytes")]
    TooLarge(usize),
    #[error("inflated payload is not a JSON object")]
    NotAnObject,
}

/// Expand `params.compress_64` in place when present.
///
/// The inflated text must parse as a JSON object, which then replaces the
/// whole `params` value. Expansion is capped at [`MAX_INFLATE_RATIO`]× the
/// wire size so a hostile device cannot balloon memory.
pub fn expand_params(params: Value) -> Result<Value, ExpandError> {
    let compressed = match params.get("compress_64").and_then(Value::as_str) {
        Some(c) => c,
        None => return Ok(params),
    };

    let raw = base64::engine::general_purpose::STANDARD.decode(compressed)?;
    let cap = raw.len().saturating_mul(MAX_INFLATE_RATIO);

    let mut inflated = Vec::new();
    let mut decoder = flate2::read::ZlibDecoder::new(raw.as_slice()).take(cap as u64 + 1);
    decoder.read_to_end(&mut inflated)?;
    if inflated.len() > cap {
        return Err(ExpandError::TooLarge(cap));
    }

    let value: Value = serde_json::from_slice(&inflated)
        .map_err(|_| ExpandError::NotAnObject)?;
    if !value.is_object() {
        return Err(ExpandError::NotAnObject);
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn compress(text: &str) -> String {
        let mut enc = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(text.as_bytes()).unwrap();
        base64::engine::general_purpose::STANDARD.encode(enc.finish().unwrap())
    }

    #[test]
    fn classifies_requests_and_responses() {
        let req = json!({"jsonrpc": "2.0", "method": "connect", "params": {"serial": "112233445566"}});
        assert!(matches!(
            classify(req),
            Some(Frame::Request { ref method, id: None, .. }) if method == "connect"
        ));

        let resp = json!({"jsonrpc": "2.0", "result": {"status": {"error": 0}}, "id": 7});
        assert!(matches!(classify(resp), Some(Frame::Response { id: 7, .. })));

        assert!(classify(json!({"method": "connect", "params": {}})).is_none());
        assert!(classify(json!({"jsonrpc": "2.0", "foo": 1})).is_none());
    }

    #[test]
    fn expands_compressed_params() {
        let inner = json!({"serial": "112233445566", "uuid": 100, "state": {"up": true}});
        let params = json!({"compress_64": compress(&inner.to_string())});
        let expanded = expand_params(params).unwrap();
        assert_eq!(expanded, inner);
    }

    #[test]
    fn plain_params_pass_through() {
        let params = json!({"serial": "112233445566"});
        assert_eq!(expand_params(params.clone()).unwrap(), params);
    }

    #[test]
    fn rejects_garbage_compression() {
        assert!(expand_params(json!({"compress_64": "!!not-base64!!"})).is_err());
        let not_deflate = base64::engine::general_purpose::STANDARD.encode(b"plain text");
        assert!(expand_params(json!({"compress_64": not_deflate})).is_err());
        assert!(expand_params(json!({"compress_64": compress("[1,2,3]")})).is_err());
    }
}
