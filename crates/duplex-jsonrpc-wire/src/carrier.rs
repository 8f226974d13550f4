//! Out-of-band context carrier.
//!
//! A carrier optionally wraps the user's parameter payload with a deadline,
//! opaque caller metadata, and an auth token, so that request context
//! survives the wire. The envelope is recognized by its `"jctx":"1"` key;
//! any other input passes through untouched as a naked payload, which keeps
//! the carrier interoperable with peers that do not speak it.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RpcError;

/// Version marker of the carrier envelope.
pub const CARRIER_VERSION: &str = "1";

/// The context fields a carrier transports, independent of the payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CarrierParts {
    /// Absolute deadline, rendered as RFC 3339 nanosecond UTC on the wire.
    pub deadline: Option<DateTime<Utc>>,
    /// Caller-supplied metadata, opaque to the carrier.
    pub meta: Option<Value>,
    /// Opaque auth token, base64 on the wire.
    pub auth: Option<Vec<u8>>,
}

impl CarrierParts {
    pub fn is_empty(&self) -> bool {
        self.deadline.is_none() && self.meta.is_none() && self.auth.is_none()
    }
}

#[derive(Serialize, Deserialize)]
struct WireCarrier {
    jctx: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    deadline: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    meta: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    auth: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<Value>,
}

/// Encodes context parts and a payload into a carrier envelope. Absent
/// fields are omitted; with nothing to carry the envelope is `{"jctx":"1"}`.
pub fn encode(parts: &CarrierParts, payload: Option<Value>) -> Result<Value, RpcError> {
    let wire = WireCarrier {
        jctx: CARRIER_VERSION.to_string(),
        deadline: parts
            .deadline
            .map(|dl| dl.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        meta: parts.meta.clone(),
        auth: parts.auth.as_deref().map(|tok| BASE64.encode(tok)),
        payload,
    };
    serde_json::to_value(&wire).map_err(RpcError::from)
}

/// Decodes a carrier envelope back into its parts and payload.
///
/// Input that is not an object bearing the `jctx` key is returned unchanged
/// as the payload with no parts. A `jctx` key with the wrong version is an
/// error, not a passthrough.
pub fn decode(input: Option<Value>) -> Result<(Option<CarrierParts>, Option<Value>), RpcError> {
    let obj = match &input {
        Some(Value::Object(obj)) if obj.contains_key("jctx") => obj,
        _ => return Ok((None, input)),
    };

    let wire: WireCarrier = serde_json::from_value(Value::Object(obj.clone()))
        .map_err(|e| RpcError::invalid_request(format!("invalid context carrier: {e}")))?;
    if wire.jctx != CARRIER_VERSION {
        return Err(RpcError::invalid_request(format!(
            "invalid context version {:?}",
            wire.jctx
        )));
    }

    let deadline = match wire.deadline {
        None => None,
        Some(text) => Some(
            DateTime::parse_from_rfc3339(&text)
                .map_err(|e| RpcError::invalid_request(format!("invalid deadline: {e}")))?
                .with_timezone(&Utc),
        ),
    };
    let auth = match wire.auth {
        None => None,
        Some(text) => Some(
            BASE64
                .decode(text.as_bytes())
                .map_err(|e| RpcError::invalid_request(format!("invalid auth token: {e}")))?,
        ),
    };

    Ok((
        Some(CarrierParts {
            deadline,
            meta: wire.meta,
            auth,
        }),
        wire.payload,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};
    use serde_json::json;

    fn bicentennial() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(1976, 7, 4, 1, 2, 3)
            .unwrap()
            .with_nanosecond(4)
            .unwrap()
    }

    fn encode_text(parts: &CarrierParts, payload: Option<Value>) -> String {
        serde_json::to_string(&encode(parts, payload).unwrap()).unwrap()
    }

    #[test]
    fn test_encode_zero_void() {
        assert_eq!(encode_text(&CarrierParts::default(), None), r#"{"jctx":"1"}"#);
    }

    #[test]
    fn test_encode_zero_payload() {
        assert_eq!(
            encode_text(&CarrierParts::default(), Some(json!([1, 2, 3]))),
            r#"{"jctx":"1","payload":[1,2,3]}"#
        );
    }

    #[test]
    fn test_encode_deadline_void() {
        let parts = CarrierParts {
            deadline: Some(bicentennial()),
            ..Default::default()
        };
        assert_eq!(
            encode_text(&parts, None),
            r#"{"jctx":"1","deadline":"1976-07-04T01:02:03.000000004Z"}"#
        );
    }

    #[test]
    fn test_encode_deadline_payload() {
        let parts = CarrierParts {
            deadline: Some(bicentennial()),
            ..Default::default()
        };
        assert_eq!(
            encode_text(&parts, Some(json!({"apple": "pear"}))),
            r#"{"jctx":"1","deadline":"1976-07-04T01:02:03.000000004Z","payload":{"apple":"pear"}}"#
        );
    }

    #[test]
    fn test_decode_void_envelope() {
        let (parts, payload) = decode(Some(json!({"jctx": "1"}))).unwrap();
        assert_eq!(parts, Some(CarrierParts::default()));
        assert!(payload.is_none());
    }

    #[test]
    fn test_decode_naked_payload_passes_through() {
        let (parts, payload) = decode(Some(json!(["a", "b", "c"]))).unwrap();
        assert!(parts.is_none());
        assert_eq!(payload, Some(json!(["a", "b", "c"])));

        let (parts, payload) = decode(None).unwrap();
        assert!(parts.is_none());
        assert!(payload.is_none());

        // An object without the envelope key is also a naked payload.
        let (parts, payload) = decode(Some(json!({"lhs": 1}))).unwrap();
        assert!(parts.is_none());
        assert_eq!(payload, Some(json!({"lhs": 1})));
    }

    #[test]
    fn test_decode_deadline_and_payload() {
        let input = json!({
            "jctx": "1",
            "deadline": "1976-07-04T01:02:03.000000004Z",
            "payload": {"lhs": 1, "rhs": 2},
        });
        let (parts, payload) = decode(Some(input)).unwrap();
        assert_eq!(parts.unwrap().deadline, Some(bicentennial()));
        assert_eq!(payload, Some(json!({"lhs": 1, "rhs": 2})));
    }

    #[test]
    fn test_decode_wrong_version_is_an_error() {
        assert!(decode(Some(json!({"jctx": "2"}))).is_err());
    }

    #[test]
    fn test_round_trip_preserves_all_fields() {
        let parts = CarrierParts {
            deadline: Some(bicentennial()),
            meta: Some(json!({"name": "Hieronymus Bosch", "marbles": 3})),
            auth: Some(b"my magic token".to_vec()),
        };
        let envelope = encode(&parts, Some(json!([1, 2, 3]))).unwrap();
        let (decoded, payload) = decode(Some(envelope)).unwrap();
        assert_eq!(decoded, Some(parts));
        assert_eq!(payload, Some(json!([1, 2, 3])));
    }
}
