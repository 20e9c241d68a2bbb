//! Request and Alert message types.

// ============================================================================
// Imports
// ============================================================================

use serde::Serialize;
use serde_json::Value;

use crate::identifiers::RequestId;

// ============================================================================
// Request
// ============================================================================

/// A call to a named handler on the peer.
///
/// # Format
///
/// ```json
/// { "reqId": "12", "req": "getSchedule", "data": { ... } }
/// ```
///
/// `requestName` is accepted as an alias for `req` when decoding.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Request {
    /// Correlation token echoed by the response.
    #[serde(rename = "reqId")]
    pub req_id: RequestId,

    /// Name of the handler to invoke.
    #[serde(rename = "req")]
    pub request_name: String,

    /// Request payload.
    pub data: Value,
}

impl Request {
    /// Creates a new request.
    #[inline]
    #[must_use]
    pub fn new(req_id: RequestId, request_name: impl Into<String>, data: Value) -> Self {
        Self {
            req_id,
            request_name: request_name.into(),
            data,
        }
    }
}

// ============================================================================
// Alert
// ============================================================================

/// A one-way notification. Alerts carry no correlation token and are never
/// answered.
///
/// # Format
///
/// ```json
/// { "alertName": "scheduleChange", "data": { ... } }
/// ```
///
/// `eventName` is accepted as an alias for `alertName` when decoding.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    /// Alert name listeners subscribe to.
    #[serde(rename = "alertName")]
    pub alert_name: String,

    /// Alert payload.
    pub data: Value,
}

impl Alert {
    /// Creates a new alert.
    #[inline]
    #[must_use]
    pub fn new(alert_name: impl Into<String>, data: Value) -> Self {
        Self {
            alert_name: alert_name.into(),
            data,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn test_request_serialization() {
        let request = Request::new(RequestId::new(1), "getAlerts", json!({"x": 1}));
        let value = serde_json::to_value(&request).expect("serialize");

        assert_eq!(value, json!({"reqId": "1", "req": "getAlerts", "data": {"x": 1}}));
    }

    #[test]
    fn test_alert_serialization() {
        let alert = Alert::new("alerts", json!([]));
        let value = serde_json::to_value(&alert).expect("serialize");

        assert_eq!(value, json!({"alertName": "alerts", "data": []}));
    }
}
