//! Message classification and (de)serialization.
//!
//! Inbound text is classified once into a [`Frame`]: either one of the two
//! liveness tokens, or a structured [`Message`]. Downstream code matches on
//! the variants and never probes fields again.
//!
//! # Discrimination Rules
//!
//! | Shape | `reqId` | `req` | `status` | `alertName` |
//! |-------|---------|-------|----------|-------------|
//! | Request | present | present | absent | absent |
//! | Response | present | absent | present | absent |
//! | Alert | absent | absent | absent | present |
//!
//! Anything else is rejected as [`Error::Protocol`].

// ============================================================================
// Imports
// ============================================================================

use serde::Deserialize;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::identifiers::RequestId;

use super::{Alert, Request, Response, ResponseStatus};

// ============================================================================
// Constants
// ============================================================================

/// Keepalive token.
pub const KEEPALIVE: &str = "ping";

/// Keepalive acknowledgment token.
pub const KEEPALIVE_ACK: &str = "pong";

// ============================================================================
// Message
// ============================================================================

/// A structured protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Call to a named handler.
    Request(Request),
    /// Answer to an earlier request.
    Response(Response),
    /// One-way notification.
    Alert(Alert),
}

impl Message {
    /// Parses a structured message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the text is not a JSON object or does
    /// not match exactly one message shape.
    pub fn decode(text: &str) -> Result<Self> {
        let raw: RawMessage = serde_json::from_str(text)
            .map_err(|e| Error::protocol(format!("invalid message: {e}")))?;
        raw.classify()
    }

    /// Serializes the message to its wire text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if the payload cannot be serialized.
    pub fn encode(&self) -> Result<String> {
        let text = match self {
            Self::Request(request) => serde_json::to_string(request)?,
            Self::Response(response) => serde_json::to_string(response)?,
            Self::Alert(alert) => serde_json::to_string(alert)?,
        };
        Ok(text)
    }

    /// Returns the message kind, for logging.
    #[inline]
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Request(_) => "request",
            Self::Response(_) => "response",
            Self::Alert(_) => "alert",
        }
    }
}

impl From<Request> for Message {
    #[inline]
    fn from(request: Request) -> Self {
        Self::Request(request)
    }
}

impl From<Response> for Message {
    #[inline]
    fn from(response: Response) -> Self {
        Self::Response(response)
    }
}

impl From<Alert> for Message {
    #[inline]
    fn from(alert: Alert) -> Self {
        Self::Alert(alert)
    }
}

// ============================================================================
// Frame
// ============================================================================

/// One inbound text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Peer keepalive; answered with [`KEEPALIVE_ACK`].
    Keepalive,
    /// Acknowledgment of our keepalive.
    KeepaliveAck,
    /// Structured message.
    Message(Message),
}

impl Frame {
    /// Classifies an inbound text frame.
    ///
    /// Liveness tokens are matched before any JSON parsing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] for malformed structured messages.
    pub fn parse(text: &str) -> Result<Self> {
        match text {
            KEEPALIVE => Ok(Self::Keepalive),
            KEEPALIVE_ACK => Ok(Self::KeepaliveAck),
            _ => Message::decode(text).map(Self::Message),
        }
    }
}

// ============================================================================
// RawMessage
// ============================================================================

/// Field bag every message shape decodes into before classification.
#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(rename = "reqId", default)]
    req_id: Option<RequestId>,

    #[serde(alias = "requestName", default)]
    req: Option<String>,

    #[serde(default)]
    status: Option<String>,

    #[serde(rename = "alertName", alias = "eventName", default)]
    alert_name: Option<String>,

    #[serde(default)]
    message: Option<String>,

    #[serde(default)]
    data: Value,

    #[serde(rename = "errorCode", default)]
    error_code: Option<String>,
}

impl RawMessage {
    fn classify(self) -> Result<Message> {
        match (self.req_id, self.req, self.status, self.alert_name) {
            (Some(req_id), Some(request_name), None, None) => Ok(Message::Request(Request {
                req_id,
                request_name,
                data: self.data,
            })),

            (Some(req_id), None, Some(status), None) => Ok(Message::Response(Response {
                req_id,
                status: ResponseStatus::from(status),
                message: self.message,
                data: self.data,
                error_code: self.error_code,
            })),

            (None, None, None, Some(alert_name)) => Ok(Message::Alert(Alert {
                alert_name,
                data: self.data,
            })),

            (req_id, req, status, alert_name) => Err(Error::protocol(format!(
                "unrecognized message shape (reqId: {}, req: {}, status: {}, alertName: {})",
                req_id.is_some(),
                req.is_some(),
                status.is_some(),
                alert_name.is_some()
            ))),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
