use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// JSON-RPC error codes.
///
/// The named variants cover the codes reserved by the protocol plus the two
/// server-reserved codes this library emits for cooperative cancellation.
/// Everything else round-trips through `ServerError` (the -32000..-32768
/// reserved band) or `ApplicationError` (user-defined codes outside it).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
    /// Request cancelled before completion (server-reserved extension).
    Cancelled,
    /// Request deadline expired before completion (server-reserved extension).
    DeadlineExceeded,
    /// Other codes in the reserved server band.
    ServerError(i32),
    /// Codes outside the reserved range, owned by the application.
    ApplicationError(i32),
}

impl ErrorCode {
    pub fn code(self) -> i32 {
        match self {
            ErrorCode::ParseError => -32700,
            ErrorCode::InvalidRequest => -32600,
            ErrorCode::MethodNotFound => -32601,
            ErrorCode::InvalidParams => -32602,
            ErrorCode::InternalError => -32603,
            ErrorCode::Cancelled => -32001,
            ErrorCode::DeadlineExceeded => -32002,
            ErrorCode::ServerError(code) | ErrorCode::ApplicationError(code) => code,
        }
    }

    /// Classifies a raw wire code into the taxonomy.
    pub fn from_code(code: i32) -> Self {
        match code {
            -32700 => ErrorCode::ParseError,
            -32600 => ErrorCode::InvalidRequest,
            -32601 => ErrorCode::MethodNotFound,
            -32602 => ErrorCode::InvalidParams,
            -32603 => ErrorCode::InternalError,
            -32001 => ErrorCode::Cancelled,
            -32002 => ErrorCode::DeadlineExceeded,
            c if (-32768..=-32000).contains(&c) => ErrorCode::ServerError(c),
            c => ErrorCode::ApplicationError(c),
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            ErrorCode::ParseError => "parse error",
            ErrorCode::InvalidRequest => "invalid request",
            ErrorCode::MethodNotFound => "method not found",
            ErrorCode::InvalidParams => "invalid params",
            ErrorCode::InternalError => "internal error",
            ErrorCode::Cancelled => "request cancelled",
            ErrorCode::DeadlineExceeded => "deadline exceeded",
            ErrorCode::ServerError(_) => "server error",
            ErrorCode::ApplicationError(_) => "application error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// The wire shape of a JSON-RPC error: `{code, message, data?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i32,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// The library error type for everything that crosses the protocol boundary.
///
/// Handlers return `RpcError` to control the response code sent back to the
/// caller; the dispatcher owns the conversion to the wire [`ErrorObject`].
#[derive(Debug, Clone, PartialEq, Error)]
#[error("[{code}] {message}")]
pub struct RpcError {
    code: ErrorCode,
    message: String,
    data: Option<Value>,
}

impl RpcError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Attaches auxiliary data carried in the error's `data` field.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ParseError, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    /// The per-member error attached to a request whose `jsonrpc` version
    /// marker is missing or not `"2.0"`.
    pub fn invalid_version() -> Self {
        Self::new(ErrorCode::InvalidRequest, "incorrect version marker")
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            ErrorCode::MethodNotFound,
            format!("no such method {method:?}"),
        )
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidParams, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Cancelled, message)
    }

    pub fn deadline_exceeded() -> Self {
        Self::new(ErrorCode::DeadlineExceeded, "deadline exceeded")
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn data(&self) -> Option<&Value> {
        self.data.as_ref()
    }

    /// Deserializes the `data` field into a concrete type, if present.
    pub fn data_as<T: serde::de::DeserializeOwned>(&self) -> Result<Option<T>, RpcError> {
        match &self.data {
            None => Ok(None),
            Some(v) => serde_json::from_value(v.clone()).map(Some).map_err(|e| {
                RpcError::internal(format!("decoding error data: {e}"))
            }),
        }
    }
}

impl From<ErrorObject> for RpcError {
    fn from(obj: ErrorObject) -> Self {
        Self {
            code: ErrorCode::from_code(obj.code),
            message: obj.message,
            data: obj.data,
        }
    }
}

impl From<&RpcError> for ErrorObject {
    fn from(err: &RpcError) -> Self {
        let message = if err.message.is_empty() {
            err.code.message().to_string()
        } else {
            err.message.clone()
        };
        ErrorObject {
            code: err.code.code(),
            message,
            data: err.data.clone(),
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::internal(err.to_string())
    }
}
