//! Wire message types.
//!
//! This module defines the message format exchanged by the two peers of a
//! control socket. Every structured frame is a flat JSON object; liveness
//! uses two bare text tokens outside the structured path.
//!
//! # Protocol Overview
//!
//! | Message Type | Direction | Purpose |
//! |--------------|-----------|---------|
//! | [`Request`] | either peer | call a named handler on the other side |
//! | [`Response`] | either peer | settle the request with the same `reqId` |
//! | [`Alert`] | either peer | one-way notification, no reply |
//! | `ping` / `pong` | either peer | keepalive / keepalive acknowledgment |
//!
//! # Format
//!
//! ```text
//! Request:  { "reqId": "1", "req": "getAlerts", "data": ... }
//! Response: { "reqId": "1", "status": "okay", "message": null, "data": ..., "errorCode": null }
//! Alert:    { "alertName": "alerts", "data": ... }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `message` | [`Message`] tagged union and [`Frame`] classification |
//! | `request` | [`Request`] and [`Alert`] types |
//! | `response` | [`Response`], [`ResponseStatus`] and handler outcomes |

// ============================================================================
// Submodules
// ============================================================================

/// Message classification and (de)serialization.
pub mod message;

/// Request and Alert message types.
pub mod request;

/// Response message types and handler outcomes.
pub mod response;

// ============================================================================
// Re-exports
// ============================================================================

pub use message::{Frame, KEEPALIVE, KEEPALIVE_ACK, Message};
pub use request::{Alert, Request};
pub use response::{
    Failure, HandlerResult, INVALID_TYPE, Response, ResponseStatus, SERVER_ERROR, Success,
    UNKNOWN_REQUEST,
};
