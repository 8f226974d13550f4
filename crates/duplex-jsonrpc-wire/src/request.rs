use serde::Serialize;
use serde_json::Value;

use crate::error::RpcError;
use crate::{id_key, VERSION};

/// A single request or notification message.
///
/// Immutable once parsed: the dispatcher owns the request for the duration
/// of the handler invocation and handlers receive their own copy.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    id: Option<Value>,
    method: String,
    params: Option<Value>,
}

impl Request {
    /// Constructs a call carrying an id. The id must not be JSON `null`;
    /// use [`Request::notification`] for id-less messages.
    pub fn call(id: Value, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            id: Some(id),
            method: method.into(),
            params: normalize_params(params),
        }
    }

    /// Constructs a notification (no id, elicits no response).
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            id: None,
            method: method.into(),
            params: normalize_params(params),
        }
    }

    /// Reports whether the request is a notification and thus does not
    /// require a response.
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// The raw id token, if any.
    pub fn id(&self) -> Option<&Value> {
        self.id.as_ref()
    }

    /// Canonical string form of the id, used to key pending maps.
    pub fn id_key(&self) -> Option<String> {
        self.id.as_ref().map(id_key)
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn params(&self) -> Option<&Value> {
        self.params.as_ref()
    }

    pub fn has_params(&self) -> bool {
        self.params.is_some()
    }

    /// Deserializes the parameters into a concrete type. Empty parameters
    /// yield the type's representation of JSON `null` (an `Option` decodes
    /// as `None`).
    pub fn params_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, RpcError> {
        let value = self.params.clone().unwrap_or(Value::Null);
        serde_json::from_value(value)
            .map_err(|e| RpcError::invalid_params(format!("decoding parameters: {e}")))
    }

    /// Returns the same request with its parameters replaced, preserving id
    /// and method. Used after a context-decode hook unwraps a carrier.
    pub fn with_params(mut self, params: Option<Value>) -> Self {
        self.params = normalize_params(params);
        self
    }
}

/// Literal `null` params normalize to absent, matching the treatment of
/// `null` ids.
fn normalize_params(params: Option<Value>) -> Option<Value> {
    match params {
        Some(Value::Null) | None => None,
        other => other,
    }
}

/// One member of a parsed frame. A structurally intact member whose content
/// violates the protocol (extra keys, bad version, non-structured params)
/// still parses, carrying its error here so the dispatcher can answer the
/// offending id without aborting its batch siblings.
#[derive(Debug, Clone)]
pub struct ParsedRequest {
    pub request: Request,
    pub error: Option<RpcError>,
}

impl ParsedRequest {
    /// Parses a single member object. `allow_v1` tolerates a missing or
    /// non-`"2.0"` version marker.
    pub fn from_value(member: Value, allow_v1: bool) -> Self {
        let obj = match member {
            Value::Object(obj) => obj,
            _ => {
                return ParsedRequest {
                    request: Request::notification("", None),
                    error: Some(RpcError::parse("request is not a JSON object")),
                }
            }
        };

        let mut version: Option<String> = None;
        let mut id: Option<Value> = None;
        let mut method = String::new();
        let mut params: Option<Value> = None;
        let mut error: Option<RpcError> = None;
        let mut extra: Vec<String> = Vec::new();

        for (key, value) in obj {
            match key.as_str() {
                "jsonrpc" => match value {
                    Value::String(v) => version = Some(v),
                    _ => error = Some(RpcError::parse("invalid version key")),
                },
                "id" => {
                    // Literal null is a synonym for an unset id, for
                    // interoperation with JSON-RPC v1 notifications.
                    if value != Value::Null {
                        id = Some(value);
                    }
                }
                "method" => match value {
                    Value::String(v) => method = v,
                    _ => error = Some(RpcError::parse("invalid method name")),
                },
                "params" => match value {
                    Value::Null => {}
                    Value::Array(_) | Value::Object(_) => params = Some(value),
                    _ => {
                        error =
                            Some(RpcError::invalid_request("parameters must be array or object"))
                    }
                },
                _ => extra.push(key),
            }
        }

        if !extra.is_empty() {
            error = Some(RpcError::invalid_request("extra fields in request"));
        }
        if error.is_none() && !allow_v1 && version.as_deref() != Some(VERSION) {
            error = Some(RpcError::invalid_version());
        }

        ParsedRequest {
            request: Request { id, method, params },
            error,
        }
    }
}

/// A parsed inbound frame of requests. `batch` records whether the frame
/// arrived as a JSON array, which must be preserved in the response shape
/// even for a one-element batch.
#[derive(Debug, Clone)]
pub struct RequestBatch {
    pub items: Vec<ParsedRequest>,
    pub batch: bool,
}

/// Parses a frame holding a single request or a batch of requests.
///
/// Only structural failure of the frame itself is an error here; member
/// validity is reported per [`ParsedRequest`].
pub fn parse_requests(frame: &[u8], allow_v1: bool) -> Result<RequestBatch, RpcError> {
    let (members, batch) = crate::split_frame(frame)?;
    let items = members
        .into_iter()
        .map(|m| ParsedRequest::from_value(m, allow_v1))
        .collect();
    Ok(RequestBatch { items, batch })
}

#[derive(Serialize)]
struct WireRequest<'a> {
    jsonrpc: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<&'a Value>,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a Value>,
}

impl<'a> From<&'a Request> for WireRequest<'a> {
    fn from(req: &'a Request) -> Self {
        WireRequest {
            jsonrpc: VERSION,
            id: req.id.as_ref(),
            method: &req.method,
            params: req.params.as_ref(),
        }
    }
}

/// Encodes one or more requests as a frame. A single request is emitted as
/// a bare object; two or more are emitted as an array.
pub fn encode_requests(requests: &[Request]) -> Result<Vec<u8>, RpcError> {
    let frame = if requests.len() == 1 {
        serde_json::to_vec(&WireRequest::from(&requests[0]))
    } else {
        let wire: Vec<WireRequest<'_>> = requests.iter().map(WireRequest::from).collect();
        serde_json::to_vec(&wire)
    };
    frame.map_err(RpcError::from)
}
