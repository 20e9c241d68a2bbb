//! Response message types and handler outcomes.
//!
//! A request handler produces a [`HandlerResult`]; the transport turns it
//! into exactly one [`Response`] with [`Response::from_outcome`].

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::identifiers::RequestId;

// ============================================================================
// Error Codes
// ============================================================================

/// No handler is registered for the request name.
pub const UNKNOWN_REQUEST: &str = "UnknownRequest";

/// The handler panicked; details stay on the serving side.
pub const SERVER_ERROR: &str = "ServerError";

/// The request data did not match the handler's expected type.
pub const INVALID_TYPE: &str = "InvalidType";

/// Message sent with [`SERVER_ERROR`].
const SERVER_ERROR_MESSAGE: &str = "An unexpected error occurred while processing this request.";

/// Message sent with [`INVALID_TYPE`].
const INVALID_TYPE_MESSAGE: &str = "Invalid data type for request";

// ============================================================================
// ResponseStatus
// ============================================================================

/// Response status discriminator.
///
/// Any status other than `"error"` counts as success, so handlers can report
/// their own success sub-statuses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ResponseStatus {
    /// `"okay"`, the default success status.
    Okay,
    /// `"error"`.
    Error,
    /// Caller-defined success status.
    Custom(String),
}

impl ResponseStatus {
    /// Returns `true` unless this is [`ResponseStatus::Error`].
    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Error)
    }

    /// Returns the wire string.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Okay => "okay",
            Self::Error => "error",
            Self::Custom(status) => status,
        }
    }
}

impl From<String> for ResponseStatus {
    fn from(status: String) -> Self {
        match status.as_str() {
            "okay" => Self::Okay,
            "error" => Self::Error,
            _ => Self::Custom(status),
        }
    }
}

impl From<ResponseStatus> for String {
    fn from(status: ResponseStatus) -> Self {
        match status {
            ResponseStatus::Custom(status) => status,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Response
// ============================================================================

/// The answer to a [`Request`](super::Request).
///
/// # Format
///
/// Success:
/// ```json
/// { "reqId": "3", "status": "okay", "message": null, "data": { ... }, "errorCode": null }
/// ```
///
/// Error:
/// ```json
/// { "reqId": "3", "status": "error", "message": "Unknown request type foo", "data": null, "errorCode": "UnknownRequest" }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    /// Token of the originating request.
    #[serde(rename = "reqId")]
    pub req_id: RequestId,

    /// Success or error status.
    pub status: ResponseStatus,

    /// Optional human-readable message.
    pub message: Option<String>,

    /// Payload (null on error).
    pub data: Value,

    /// Machine-readable error code (error only).
    #[serde(rename = "errorCode")]
    pub error_code: Option<String>,
}

impl Response {
    /// Creates an `okay` response.
    #[inline]
    #[must_use]
    pub fn okay(req_id: RequestId, data: Value) -> Self {
        Self {
            req_id,
            status: ResponseStatus::Okay,
            message: None,
            data,
            error_code: None,
        }
    }

    /// Creates an error response.
    #[inline]
    #[must_use]
    pub fn error(req_id: RequestId, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            req_id,
            status: ResponseStatus::Error,
            message: Some(message.into()),
            data: Value::Null,
            error_code: Some(code.into()),
        }
    }

    /// Builds the response for a handler outcome.
    #[must_use]
    pub fn from_outcome(req_id: RequestId, outcome: HandlerResult) -> Self {
        match outcome {
            Ok(success) => {
                let status = match success.status.map(ResponseStatus::from) {
                    None | Some(ResponseStatus::Error) => ResponseStatus::Okay,
                    Some(status) => status,
                };
                Self {
                    req_id,
                    status,
                    message: success.message,
                    data: success.data,
                    error_code: None,
                }
            }
            Err(failure) => Self::error(req_id, failure.code, failure.message),
        }
    }

    /// Returns `true` if this is a success response.
    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Extracts the payload, or the remote error if the response was an error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Remote`] if the status is `error`. A missing error code
    /// is reported as `ServerError`.
    pub fn into_result(self) -> Result<Value> {
        match self.status {
            ResponseStatus::Error => Err(Error::remote(
                self.error_code.unwrap_or_else(|| SERVER_ERROR.to_string()),
                self.message,
            )),
            _ => Ok(self.data),
        }
    }
}

// ============================================================================
// Handler Outcomes
// ============================================================================

/// What a request handler returns.
pub type HandlerResult = std::result::Result<Success, Failure>;

/// A successful handler outcome.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Success {
    /// Response payload.
    pub data: Value,
    /// Optional message sent alongside the payload.
    pub message: Option<String>,
    /// Custom success status; `None` means `okay`.
    pub status: Option<String>,
}

impl Success {
    /// Creates a success carrying `data`.
    #[inline]
    #[must_use]
    pub fn new(data: Value) -> Self {
        Self {
            data,
            ..Default::default()
        }
    }

    /// Sets the message.
    #[inline]
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Sets a custom success status. `"error"` is reserved and falls back
    /// to `okay`.
    #[inline]
    #[must_use]
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }
}

impl From<Value> for Success {
    #[inline]
    fn from(data: Value) -> Self {
        Self::new(data)
    }
}

/// A declined request: error code plus message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    /// Short machine-readable code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl Failure {
    /// Creates a failure.
    #[inline]
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// No handler for `request_name`.
    #[must_use]
    pub fn unknown_request(request_name: &str) -> Self {
        Self::new(UNKNOWN_REQUEST, format!("Unknown request type {request_name}"))
    }

    /// Generic handler fault.
    #[must_use]
    pub fn server_error() -> Self {
        Self::new(SERVER_ERROR, SERVER_ERROR_MESSAGE)
    }

    /// Request data failed the handler's type guard.
    #[must_use]
    pub fn invalid_type() -> Self {
        Self::new(INVALID_TYPE, INVALID_TYPE_MESSAGE)
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

// ============================================================================
// Tests
// ============================================================================
