//! Wire format of RPC requests, error replies and event notifications.
//!
//! Every frame is one JSON document in a WebSocket text message.

use serde::{Deserialize, Serialize};

use liaison_core::types::Value;
use liaison_devices::Response;

use crate::error::{Result, ServerError};

/// Type tag of hardware event notifications
pub const HARDWARE_RESPONSE: &str = "hardware_response";

/// A remote method call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Registered object name
    pub object: String,
    /// Method to invoke
    pub method: String,
    /// Positional arguments, primitives only
    #[serde(default)]
    pub args: Vec<Value>,
    /// Address a specific instance instead of the active one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<usize>,
}

impl RpcRequest {
    /// Build a request
    pub fn new<O: Into<String>, M: Into<String>>(object: O, method: M, args: Vec<Value>) -> Self {
        Self {
            object: object.into(),
            method: method.into(),
            args,
            instance: None,
        }
    }

    /// Parse and validate a raw request
    pub fn decode(text: &str) -> Result<Self> {
        let request: RpcRequest = serde_json::from_str(text)
            .map_err(|e| ServerError::MalformedRequest(e.to_string()))?;
        if request.object.is_empty() {
            return Err(ServerError::MalformedRequest("object is empty".to_string()));
        }
        if request.method.is_empty() {
            return Err(ServerError::MalformedRequest("method is empty".to_string()));
        }
        if let Some((i, arg)) = request.args.iter().enumerate().find(|(_, a)| !a.is_primitive()) {
            return Err(ServerError::MalformedRequest(format!(
                "argument {} is {}, expected a primitive",
                i,
                arg.type_name()
            )));
        }
        Ok(request)
    }
}

/// Reply sent when a request fails
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Always `"error"`
    #[serde(rename = "type")]
    pub kind: String,
    /// Error kind, e.g. `UnknownObject`
    pub error: String,
    /// Human readable message
    pub msg: String,
}

impl From<&ServerError> for ErrorPayload {
    fn from(err: &ServerError) -> Self {
        Self {
            kind: "error".to_string(),
            error: err.kind().to_string(),
            msg: err.to_string(),
        }
    }
}

/// Push notification for one device response
#[derive(Debug, Clone, Serialize)]
pub struct EventNotification<'a> {
    /// Always [`HARDWARE_RESPONSE`]
    #[serde(rename = "type")]
    pub kind: &'static str,
    /// Response class, e.g. `PhotodiodeResponse`
    pub class: &'static str,
    /// Registered name of the device that produced the response
    pub device: &'a str,
    /// The response fields
    pub data: &'a Response,
}

impl<'a> EventNotification<'a> {
    /// Wrap a response from `device`
    pub fn new(device: &'a str, response: &'a Response) -> Self {
        Self {
            kind: HARDWARE_RESPONSE,
            class: response.class.name(),
            device,
            data: response,
        }
    }

    /// Serialize to the JSON text sent on the wire
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Serialize a successful call result
pub fn encode_result(value: &Value) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

/// Serialize an error reply
pub fn encode_error(err: &ServerError) -> String {
    let payload = ErrorPayload::from(err);
    serde_json::to_string(&payload).unwrap_or_else(|_| {
        r#"{"type":"error","error":"Serialization","msg":"failed to encode error"}"#.to_string()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use liaison_devices::ResponseClass;

    #[test]
    fn test_decode_request() {
        let request =
            RpcRequest::decode(r#"{"object":"EchoServer","method":"echo","args":["a",1,true]}"#)
                .unwrap();
        assert_eq!(request.object, "EchoServer");
        assert_eq!(request.method, "echo");
        assert_eq!(
            request.args,
            vec![Value::from("a"), Value::Integer(1), Value::Bool(true)]
        );
        assert_eq!(request.instance, None);

        let request = RpcRequest::decode(r#"{"object":"A","method":"m","instance":2}"#).unwrap();
        assert!(request.args.is_empty());
        assert_eq!(request.instance, Some(2));
    }

    #[test]
    fn test_decode_rejects_malformed() {
        for text in [
            "not json",
            r#"{"object":"A"}"#,
            r#"{"object":"","method":"m"}"#,
            r#"{"object":"A","method":"m","args":[[1]]}"#,
            r#"{"object":"A","method":"m","args":[{"x":1}]}"#,
            r#"{"object":"A","method":"m","args":"x"}"#,
        ] {
            assert!(
                matches!(RpcRequest::decode(text), Err(ServerError::MalformedRequest(_))),
                "{} should be rejected",
                text
            );
        }
    }

    #[test]
    fn test_error_payload() {
        let text = encode_error(&ServerError::UnknownMethod("A.m".to_string()));
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["error"], "UnknownMethod");
        assert_eq!(json["msg"], "Unknown method: A.m");
    }

    #[test]
    fn test_event_notification() {
        let response = Response {
            class: ResponseClass::Photodiode,
            t: 12.5,
            value: true,
            threshold: Some(127),
            channel: 'C',
            code: '1',
        };
        let text = EventNotification::new("tpad", &response).to_json().unwrap();
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["type"], "hardware_response");
        assert_eq!(json["class"], "PhotodiodeResponse");
        assert_eq!(json["device"], "tpad");
        assert_eq!(json["data"]["t"], 12.5);
        assert_eq!(json["data"]["value"], true);
        assert_eq!(json["data"]["threshold"], 127);
    }
}
