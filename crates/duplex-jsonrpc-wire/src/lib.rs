//! # JSON-RPC 2.0 Wire Layer
//!
//! Pure data layer for a bidirectional JSON-RPC 2.0 peer: request and
//! response envelopes, batch framing, the protocol error taxonomy, and the
//! out-of-band context carrier. This crate performs no I/O and knows nothing
//! about transports or runtimes; the engine crate (`duplex-jsonrpc`) drives
//! it from both the client and the server side of a connection.
//!
//! ## Design
//!
//! Dynamic payloads (`params`, `result`, error `data`, carrier metadata) are
//! kept as `serde_json::Value` so that only structural errors surface at
//! parse time; the consumer decides when and into what to deserialize.
//! Parsing a batch never aborts on a bad member: each member carries its own
//! error so the dispatcher can answer every offending id individually.

pub mod carrier;
pub mod error;
pub mod request;
pub mod response;

pub use error::{ErrorCode, ErrorObject, RpcError};
pub use request::{encode_requests, parse_requests, ParsedRequest, Request, RequestBatch};
pub use response::{encode_responses, parse_replies, Reply, Response};

use serde_json::Value;

/// JSON-RPC protocol version marker required on every message.
pub const VERSION: &str = "2.0";

/// Splits a raw frame into its member objects, reporting whether the frame
/// was a batch (a JSON array). A non-array frame yields one member.
///
/// This is the first step shared by both directions of traffic: the caller
/// then routes each member to the request parser or the reply parser based
/// on its shape.
pub fn split_frame(frame: &[u8]) -> Result<(Vec<Value>, bool), RpcError> {
    let first = frame.iter().find(|b| !b.is_ascii_whitespace());
    if first == Some(&b'[') {
        let members: Vec<Value> = serde_json::from_slice(frame)
            .map_err(|_| RpcError::parse("invalid request batch"))?;
        Ok((members, true))
    } else {
        let member: Value = serde_json::from_slice(frame)
            .map_err(|_| RpcError::parse("invalid request message"))?;
        Ok((vec![member], false))
    }
}

/// Canonical string key for an id token, used to index pending-call maps.
/// Distinct JSON tokens produce distinct keys (`1` vs `"1"`).
pub fn id_key(id: &Value) -> String {
    id.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_split_single_object() {
        let (members, batch) = split_frame(br#"{"jsonrpc":"2.0","method":"x"}"#).unwrap();
        assert_eq!(members.len(), 1);
        assert!(!batch);
    }

    #[test]
    fn test_split_batch_with_leading_whitespace() {
        let (members, batch) = split_frame(b"  [{\"a\":1},{\"b\":2}]").unwrap();
        assert_eq!(members.len(), 2);
        assert!(batch);
    }

    #[test]
    fn test_split_empty_batch() {
        let (members, batch) = split_frame(b"[]").unwrap();
        assert!(members.is_empty());
        assert!(batch);
    }

    #[test]
    fn test_split_garbage_is_parse_error() {
        let err = split_frame(b"not json").unwrap_err();
        assert_eq!(err.code(), ErrorCode::ParseError);
    }

    #[test]
    fn test_id_keys_distinguish_token_types() {
        assert_eq!(id_key(&json!(1)), "1");
        assert_eq!(id_key(&json!("1")), "\"1\"");
        assert_ne!(id_key(&json!(1)), id_key(&json!("1")));
    }
}
