//! Newline-delimited JSON framing of requests and responses.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::dispatch::Invocation;
use crate::error::RpcError;

pub const CMD_HELP: &str = "help";
pub const CMD_CLOSE_SESSION: &str = "closeSession";
pub const CMD_HANDSHAKE: &str = "handshake";

/// Method names handled by the session itself, never by a snippet.
pub const RESERVED_METHODS: [&str; 3] = [CMD_HELP, CMD_CLOSE_SESSION, CMD_HANDSHAKE];

pub const PROTOCOL_MAJOR_VERSION: u32 = 1;
pub const PROTOCOL_MINOR_VERSION: u32 = 0;

/// `{"id": <int>, "method": "<name>", "params": [...]}`; all three fields are required.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: i64,
    pub method: String,
    pub params: Vec<JsonValue>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: i64,
    pub result: JsonValue,
    pub callback: Option<String>,
    pub error: Option<String>,
}

impl RpcResponse {
    /// `result`, `callback` and `error` all null.
    pub fn empty(id: i64) -> Self {
        Self { id, result: JsonValue::Null, callback: None, error: None }
    }

    pub fn result(id: i64, result: JsonValue) -> Self {
        Self { result, ..Self::empty(id) }
    }

    pub fn callback(id: i64, result: JsonValue, callback: String) -> Self {
        Self { result, callback: Some(callback), ..Self::empty(id) }
    }

    pub fn error(id: i64, error: impl Into<String>) -> Self {
        Self { error: Some(error.into()), ..Self::empty(id) }
    }

    pub fn from_outcome(id: i64, outcome: Result<Invocation, RpcError>) -> Self {
        match outcome {
            Ok(Invocation { result, callback: Some(callback) }) => {
                Self::callback(id, result, callback)
            }
            Ok(Invocation { result, callback: None }) => Self::result(id, result),
            Err(err) => Self::error(id, err.to_string()),
        }
    }
}

pub fn parse_request(line: &str) -> Result<RpcRequest, serde_json::Error> {
    serde_json::from_str(line)
}

/// Serializes a response as one line, including the trailing newline.
pub fn encode_response(response: &RpcResponse) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(response)?;
    line.push('\n');
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn requests_require_every_field() {
        let request = parse_request(r#"{"id": 3, "method": "echo", "params": [1, "a"]}"#)
            .expect("valid request");
        assert_eq!(request.id, 3);
        assert_eq!(request.params, vec![json!(1), json!("a")]);

        assert!(parse_request(r#"{"id": 3, "method": "echo"}"#).is_err());
        assert!(parse_request(r#"{"method": "echo", "params": []}"#).is_err());
        assert!(parse_request(r#"{"id": 3, "params": []}"#).is_err());
        assert!(parse_request(r#"{"id": 3, "method": "echo", "params": {}}"#).is_err());
        assert!(parse_request("not json").is_err());
    }

    #[test]
    fn unknown_request_keys_are_ignored() {
        let request = parse_request(r#"{"id": 1, "method": "m", "params": [], "jsonrpc": "2.0"}"#)
            .expect("extra key");
        assert_eq!(request.method, "m");
    }

    #[test]
    fn responses_always_carry_all_fields() {
        let line = encode_response(&RpcResponse::empty(7)).expect("encode");
        assert!(line.ends_with('\n'));
        let wire: JsonValue = serde_json::from_str(line.trim_end()).expect("json");
        assert_eq!(wire, json!({ "id": 7, "result": null, "callback": null, "error": null }));
    }

    #[test]
    fn outcomes_map_onto_response_fields() {
        let sync = Invocation { result: json!(42), callback: None };
        assert_eq!(RpcResponse::from_outcome(1, Ok(sync)), RpcResponse::result(1, json!(42)));

        let async_call = Invocation { result: JsonValue::Null, callback: Some("1-2".into()) };
        let response = RpcResponse::from_outcome(2, Ok(async_call));
        assert_eq!(response.callback.as_deref(), Some("1-2"));

        let response =
            RpcResponse::from_outcome(3, Err(RpcError::UnknownMethod { method: "x".into() }));
        assert_eq!(response.error.as_deref(), Some("Unknown RPC: x"));
        assert_eq!(response.result, JsonValue::Null);
    }
}
