//! JSON-RPC 2.0 envelope types and streaming event framing.

use chrono::{SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::{Value, json};

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

/// Inbound request. Unknown fields are ignored; `id` may be a string or a
/// number and is echoed back verbatim.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub id: Option<Value>,
}

pub fn result_frame(id: Option<&Value>, result: Value) -> String {
    json!({
        "jsonrpc": "2.0",
        "result": result,
        "id": id,
    })
    .to_string()
}

pub fn error_frame(id: Option<&Value>, code: i64, message: &str) -> String {
    json!({
        "jsonrpc": "2.0",
        "error": { "code": code, "message": message },
        "id": id,
    })
    .to_string()
}

/// Streaming event names.
pub mod events {
    pub const START: &str = "stream_start";
    pub const CHUNK: &str = "stream_chunk";
    pub const COMPLETE: &str = "stream_complete";
    pub const ERROR: &str = "stream_error";
    pub const CANCELLED: &str = "stream_cancelled";
}

/// Fields promoted from `data` to the result top level for client
/// convenience.
const TOP_LEVEL_FIELDS: &[&str] = &[
    "persona_id",
    "chunk",
    "full_response",
    "tokens_used",
    "processing_time",
];

/// A streaming response frame: `{result: {event_type, stream_id, timestamp,
/// <promoted fields>, data}}`.
pub fn stream_frame(
    id: Option<&Value>,
    event_type: &str,
    stream_id: &str,
    data: Option<Value>,
) -> String {
    let mut result = json!({
        "event_type": event_type,
        "stream_id": stream_id,
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
    });

    if let Some(data) = data {
        if let (Some(result_map), Some(data_map)) = (result.as_object_mut(), data.as_object()) {
            for field in TOP_LEVEL_FIELDS {
                if let Some(value) = data_map.get(*field) {
                    result_map.insert((*field).to_string(), value.clone());
                }
            }
            result_map.insert("data".to_string(), data.clone());
        }
    }

    json!({
        "jsonrpc": "2.0",
        "result": result,
        "id": id,
    })
    .to_string()
}

/// Streaming error frame: carries both the event envelope and a JSON-RPC
/// error object so clients never block.
pub fn stream_error_frame(
    id: Option<&Value>,
    stream_id: &str,
    message: &str,
    detail: Option<&str>,
) -> String {
    json!({
        "jsonrpc": "2.0",
        "result": {
            "event_type": events::ERROR,
            "stream_id": stream_id,
            "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
        },
        "error": {
            "code": INTERNAL_ERROR,
            "message": message,
            "data": detail,
        },
        "id": id,
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ignores_unknown_fields_and_accepts_numeric_id() {
        let raw = r#"{"jsonrpc":"2.0","method":"persona.list","id":7,"extra":true}"#;
        let request: RpcRequest = serde_json::from_str(raw).expect("parses");
        assert_eq!(request.method, "persona.list");
        assert_eq!(request.id, Some(json!(7)));
        assert!(request.params.is_none());
    }

    #[test]
    fn result_frame_echoes_id() {
        let frame = result_frame(Some(&json!("abc")), json!({"ok": true}));
        let parsed: Value = serde_json::from_str(&frame).expect("valid json");
        assert_eq!(parsed["id"], "abc");
        assert_eq!(parsed["result"]["ok"], true);
        assert_eq!(parsed["jsonrpc"], "2.0");
    }

    #[test]
    fn error_frame_carries_code_and_message() {
        let frame = error_frame(None, METHOD_NOT_FOUND, "Method not found: x.y");
        let parsed: Value = serde_json::from_str(&frame).expect("valid json");
        assert_eq!(parsed["error"]["code"], -32601);
        assert_eq!(parsed["error"]["message"], "Method not found: x.y");
        assert_eq!(parsed["id"], Value::Null);
    }

    #[test]
    fn stream_frame_promotes_common_fields() {
        let frame = stream_frame(
            Some(&json!("1")),
            events::CHUNK,
            "stream-1",
            Some(json!({"chunk": "hi", "chunk_number": 3, "total_length": 12})),
        );
        let parsed: Value = serde_json::from_str(&frame).expect("valid json");

        assert_eq!(parsed["result"]["event_type"], "stream_chunk");
        assert_eq!(parsed["result"]["chunk"], "hi");
        assert_eq!(parsed["result"]["data"]["chunk_number"], 3);
        assert!(parsed["result"]["timestamp"].as_str().is_some());
    }

    #[test]
    fn stream_error_frame_has_both_event_and_error() {
        let frame = stream_error_frame(Some(&json!(2)), "s1", "Chat streaming failed", Some("boom"));
        let parsed: Value = serde_json::from_str(&frame).expect("valid json");
        assert_eq!(parsed["result"]["event_type"], "stream_error");
        assert_eq!(parsed["error"]["code"], -32603);
        assert_eq!(parsed["error"]["data"], "boom");
    }
}
