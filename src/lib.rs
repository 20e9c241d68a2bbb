//! controlws - request/response and alert messaging over one WebSocket.
//!
//! Two peers share a single WebSocket and each may:
//!
//! - send **requests** to the other and await the matching response
//! - answer the other's requests through registered **request handlers**
//! - push one-way **alerts** to any number of listeners on the other side
//!
//! A keepalive exchange detects half-open sockets: a peer silent for longer
//! than one keepalive period plus a grace margin is force-closed.
//!
//! # Quick Start
//!
//! ```no_run
//! use controlws::{
//!     Connection, ConnectionConfig, ConnectionListener, ListenerConfig, Result, Success,
//! };
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let listener = ConnectionListener::bind(ListenerConfig::new()).await?;
//!
//!     let server = Connection::new(ConnectionConfig::new());
//!     server.add_sync_request_handler("echo", |data| Ok(Success::new(data)));
//!
//!     let client = Connection::new(ConnectionConfig::new());
//!     client.on_alert("status", |data| println!("status: {data}"));
//!     client.connect(&listener.ws_url())?;
//!     listener.accept_into(&server).await?;
//!
//!     let reply = client.send_request("echo", json!({ "x": 1 })).await?;
//!     assert_eq!(reply, json!({ "x": 1 }));
//!
//!     server.send_alert("status", json!("ready"))?;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Request, listener and connection IDs |
//! | [`protocol`] | Wire message types |
//! | [`registry`] | Named-event listener registry |
//! | [`transport`] | Connection, listener, handlers, liveness |

// ============================================================================
// Modules
// ============================================================================

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Type-safe identifiers.
pub mod identifiers;

/// Wire message types.
pub mod protocol;

/// Named-event listener registry.
pub mod registry;

/// WebSocket transport layer.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::{ConnectionId, ListenerId, RequestId};

// Protocol types
pub use protocol::{
    Alert, Failure, Frame, HandlerResult, INVALID_TYPE, Message, Request, Response,
    ResponseStatus, SERVER_ERROR, Success, UNKNOWN_REQUEST,
};

// Registry
pub use registry::EventRegistry;

// Transport types
pub use transport::{
    CloseCause, CloseInfo, Connection, ConnectionConfig, ConnectionListener, Lifecycle,
    ListenerConfig, LivenessMonitor, RequestHandler, ResponseFuture, TransportEvent,
};
