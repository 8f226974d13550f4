use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorObject, RpcError};
use crate::{id_key, VERSION};

/// A response message: the echoed id plus exactly one of result or error.
/// The pairing is enforced by construction.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    id: Value,
    result: Option<Value>,
    error: Option<ErrorObject>,
}

impl Response {
    /// A success response. The id is the request's id token, or JSON `null`
    /// when answering a message whose id could not be recovered.
    pub fn result(id: Value, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    /// An error response.
    pub fn error(id: Value, err: &RpcError) -> Self {
        Self {
            id,
            result: None,
            error: Some(ErrorObject::from(err)),
        }
    }

    pub fn id(&self) -> &Value {
        &self.id
    }

    pub fn id_key(&self) -> String {
        id_key(&self.id)
    }

    /// Rewrites the id. For use in proxies that re-key traffic.
    pub fn set_id(&mut self, id: Value) {
        self.id = id;
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn err(&self) -> Option<RpcError> {
        self.error.clone().map(RpcError::from)
    }

    pub fn raw_result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    /// Deserializes the result into a concrete type. A failed request yields
    /// its error instead, and an absent result decodes as JSON `null`.
    pub fn result_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, RpcError> {
        if let Some(err) = self.err() {
            return Err(err);
        }
        let value = self.result.clone().unwrap_or(Value::Null);
        serde_json::from_value(value)
            .map_err(|e| RpcError::internal(format!("decoding result: {e}")))
    }

    /// Splits the response into the usual `Result` shape.
    pub fn into_result(self) -> Result<Value, RpcError> {
        match self.error {
            Some(obj) => Err(RpcError::from(obj)),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

#[derive(Serialize)]
struct WireResponse<'a> {
    jsonrpc: &'a str,
    id: &'a Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a ErrorObject>,
}

impl<'a> From<&'a Response> for WireResponse<'a> {
    fn from(rsp: &'a Response) -> Self {
        WireResponse {
            jsonrpc: VERSION,
            id: &rsp.id,
            result: rsp.result.as_ref(),
            error: rsp.error.as_ref(),
        }
    }
}

/// Encodes responses as a frame. `batch` marks that the requests arrived as
/// a JSON array: the marker is preserved through the round trip, so a
/// one-element batch answers with a one-element array rather than a bare
/// object.
pub fn encode_responses(responses: &[Response], batch: bool) -> Result<Vec<u8>, RpcError> {
    let frame = if responses.len() == 1 && !batch {
        serde_json::to_vec(&WireResponse::from(&responses[0]))
    } else {
        let wire: Vec<WireResponse<'_>> = responses.iter().map(WireResponse::from).collect();
        serde_json::to_vec(&wire)
    };
    frame.map_err(RpcError::from)
}

/// One member of an inbound frame on the receiving side of calls.
///
/// Besides ordinary responses, the envelope admits the non-standard
/// server-initiated shape carrying `method` and `params`: with no id it is a
/// push notification, with an id it is a callback expecting a reply.
/// Parsing is permissive; validity is judged at the point of use so that
/// members of a batch fail independently.
#[derive(Debug, Clone, Deserialize)]
pub struct Reply {
    #[serde(default, rename = "jsonrpc")]
    pub version: Option<String>,
    #[serde(default, deserialize_with = "null_as_absent")]
    pub id: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<ErrorObject>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

fn null_as_absent<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Null => None,
        other => Some(other),
    })
}

impl Reply {
    pub fn from_value(member: Value) -> Result<Self, RpcError> {
        serde_json::from_value(member)
            .map_err(|_| RpcError::parse("response is not a JSON object"))
    }

    /// Reports whether this member is server-initiated traffic rather than
    /// a response to one of our calls.
    pub fn is_push(&self) -> bool {
        self.result.is_none() && self.error.is_none() && self.method.is_some()
    }

    /// Reports whether the version marker satisfies the protocol, or the
    /// caller's leniency.
    pub fn version_ok(&self, allow_v1: bool) -> bool {
        allow_v1 || self.version.as_deref() == Some(VERSION)
    }

    /// Converts a non-push member into a [`Response`], consuming it.
    pub fn into_response(self) -> Response {
        Response {
            id: self.id.unwrap_or(Value::Null),
            error: self.error,
            result: self.result,
        }
    }
}

/// Parses a frame of one or more reply members.
pub fn parse_replies(frame: &[u8]) -> Result<Vec<Reply>, RpcError> {
    let (members, _) = crate::split_frame(frame)?;
    members.into_iter().map(Reply::from_value).collect()
}
