//! Fleet RPC envelope encode/decode.
//!
//! Decoding is two-stage on purpose: [`decode_value`] parses the raw line as
//! JSON, then [`Request::from_value`] / [`Response::from_value`] validate the
//! envelope fields. The connection layers treat the two failures differently
//! (a parse failure is always fatal; a response with bad fields is dropped as
//! noise), so the stages must stay distinguishable.

use rand_core::{OsRng, RngCore};
use serde::Serialize;
use serde_json::Value;

use crate::{DELIMITER, MAX_FRAME_SIZE};

/// Errors from wire encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("message too long: {0} bytes (maximum {MAX_FRAME_SIZE} including delimiter)")]
    TooLong(usize),

    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message is not a JSON object")]
    NotAnObject,

    #[error("missing or invalid field {0}")]
    InvalidField(&'static str),
}

/// One remote method invocation.
///
/// The id is generated by the caller and correlates the eventual
/// [`Response`]; it must be unique among calls pending on one connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Request {
    #[serde(rename = "__id")]
    pub id: String,
    #[serde(rename = "__method")]
    pub method: String,
    #[serde(rename = "__params")]
    pub params: Value,
}

impl Request {
    /// Create a request with a fresh random id.
    ///
    /// `params` must be a JSON array (positional) or object (keyed).
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            id: random_id(),
            method: method.into(),
            params,
        }
    }

    /// Validate a parsed JSON value as a request envelope.
    pub fn from_value(value: &Value) -> Result<Self, WireError> {
        let object = value.as_object().ok_or(WireError::NotAnObject)?;
        let id = object
            .get("__id")
            .and_then(Value::as_str)
            .ok_or(WireError::InvalidField("__id"))?;
        let method = object
            .get("__method")
            .and_then(Value::as_str)
            .ok_or(WireError::InvalidField("__method"))?;
        let params = object
            .get("__params")
            .ok_or(WireError::InvalidField("__params"))?;
        if !params.is_array() && !params.is_object() {
            return Err(WireError::InvalidField("__params"));
        }
        Ok(Self {
            id: id.to_string(),
            method: method.to_string(),
            params: params.clone(),
        })
    }
}

/// The reply to one [`Request`], matched by id.
///
/// Both payload keys are always present on the wire; exactly one of
/// `data`/`error` is meaningful, the other is null.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    #[serde(rename = "__id")]
    pub id: String,
    #[serde(rename = "__data")]
    pub data: Value,
    #[serde(rename = "__error")]
    pub error: Option<String>,
}

impl Response {
    /// A successful response carrying `data`.
    pub fn success(id: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            data,
            error: None,
        }
    }

    /// A failed response carrying an error description.
    pub fn failure(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            data: Value::Null,
            error: Some(error.into()),
        }
    }

    /// Validate a parsed JSON value as a response envelope.
    pub fn from_value(value: &Value) -> Result<Self, WireError> {
        let object = value.as_object().ok_or(WireError::NotAnObject)?;
        let id = object
            .get("__id")
            .and_then(Value::as_str)
            .ok_or(WireError::InvalidField("__id"))?;
        let data = object
            .get("__data")
            .ok_or(WireError::InvalidField("__data"))?;
        let error = match object.get("__error") {
            Some(Value::Null) => None,
            Some(Value::String(text)) => Some(text.clone()),
            _ => return Err(WireError::InvalidField("__error")),
        };
        Ok(Self {
            id: id.to_string(),
            data: data.clone(),
            error,
        })
    }
}

/// Generate a random 128-bit hex token for request correlation.
pub fn random_id() -> String {
    let mut token = [0u8; 16];
    OsRng.fill_bytes(&mut token);
    hex::encode(token)
}

/// Encode a message into one delimited frame, enforcing [`MAX_FRAME_SIZE`].
pub fn encode_frame<T: Serialize>(message: &T) -> Result<Vec<u8>, WireError> {
    let mut frame = serde_json::to_vec(message)?;
    frame.extend_from_slice(DELIMITER);
    if frame.len() > MAX_FRAME_SIZE {
        return Err(WireError::TooLong(frame.len()));
    }
    Ok(frame)
}

/// Parse one received line (delimiter already stripped) as JSON.
pub fn decode_value(line: &[u8]) -> Result<Value, WireError> {
    Ok(serde_json::from_slice(line)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn strip_delimiter(frame: &[u8]) -> &[u8] {
        frame
            .strip_suffix(DELIMITER.as_slice())
            .expect("frame not CRLF-terminated")
    }

    #[test]
    fn request_roundtrip() {
        let request = Request::new("print", json!({"source": "report.pdf"}));
        let frame = encode_frame(&request).expect("encode failed");
        let value = decode_value(strip_delimiter(&frame)).expect("decode failed");
        let decoded = Request::from_value(&value).expect("validate failed");
        assert_eq!(decoded, request);
    }

    #[test]
    fn request_ids_are_unique_128_bit_hex() {
        let a = Request::new("ping", json!([]));
        let b = Request::new("ping", json!([]));
        assert_eq!(a.id.len(), 32);
        assert!(a.id.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn response_success_serializes_with_null_error() {
        let response = Response::success("x", json!("hello"));
        let text = serde_json::to_string(&response).expect("serialize failed");
        assert_eq!(text, r#"{"__id":"x","__data":"hello","__error":null}"#);
    }

    #[test]
    fn response_failure_serializes_with_null_data() {
        let response = Response::failure("x", "Method not found");
        let text = serde_json::to_string(&response).expect("serialize failed");
        assert_eq!(
            text,
            r#"{"__id":"x","__data":null,"__error":"Method not found"}"#
        );
    }

    #[test]
    fn response_roundtrip_preserves_request_id() {
        let request = Request::new("ping", json!(["ping"]));
        let response = Response::success(request.id.clone(), json!("ping"));
        let frame = encode_frame(&response).expect("encode failed");
        let value = decode_value(strip_delimiter(&frame)).expect("decode failed");
        let decoded = Response::from_value(&value).expect("validate failed");
        assert_eq!(decoded.id, request.id);
        assert!(decoded.error.is_none());
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let request = Request::new("print", json!({"source": "a".repeat(MAX_FRAME_SIZE)}));
        assert!(matches!(
            encode_frame(&request),
            Err(WireError::TooLong(len)) if len > MAX_FRAME_SIZE
        ));
    }

    #[test]
    fn frame_at_limit_is_accepted() {
        // Envelope overhead around the filler string, measured empirically
        // by encoding once and padding to the exact boundary.
        let probe = encode_frame(&Request {
            id: "0".repeat(32),
            method: "print".to_string(),
            params: json!({"source": ""}),
        })
        .expect("probe encode failed");
        let filler = MAX_FRAME_SIZE - probe.len();
        let request = Request {
            id: "0".repeat(32),
            method: "print".to_string(),
            params: json!({"source": "a".repeat(filler)}),
        };
        let frame = encode_frame(&request).expect("boundary frame rejected");
        assert_eq!(frame.len(), MAX_FRAME_SIZE);
    }

    #[test]
    fn request_rejects_missing_fields() {
        let value = json!({"__id": "x", "__params": []});
        assert!(matches!(
            Request::from_value(&value),
            Err(WireError::InvalidField("__method"))
        ));

        let value = json!({"__method": "ping", "__params": []});
        assert!(matches!(
            Request::from_value(&value),
            Err(WireError::InvalidField("__id"))
        ));

        let value = json!({"__id": "x", "__method": "ping"});
        assert!(matches!(
            Request::from_value(&value),
            Err(WireError::InvalidField("__params"))
        ));
    }

    #[test]
    fn request_rejects_scalar_params() {
        let value = json!({"__id": "x", "__method": "ping", "__params": 3});
        assert!(matches!(
            Request::from_value(&value),
            Err(WireError::InvalidField("__params"))
        ));
    }

    #[test]
    fn request_rejects_non_object_message() {
        assert!(matches!(
            Request::from_value(&json!([1, 2, 3])),
            Err(WireError::NotAnObject)
        ));
    }

    #[test]
    fn response_rejects_missing_id() {
        let value = json!({"__data": null, "__error": null});
        assert!(matches!(
            Response::from_value(&value),
            Err(WireError::InvalidField("__id"))
        ));
    }

    #[test]
    fn response_rejects_non_string_error() {
        let value = json!({"__id": "x", "__data": null, "__error": 5});
        assert!(matches!(
            Response::from_value(&value),
            Err(WireError::InvalidField("__error"))
        ));
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        assert!(matches!(
            decode_value(b"{not json"),
            Err(WireError::Json(_))
        ));
    }
}
