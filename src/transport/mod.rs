//! WebSocket transport layer.
//!
//! Both peers run the same [`Connection`]; the only asymmetry is who dials.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐                              ┌─────────────────┐
//! │  Connection     │         WebSocket            │  Connection     │
//! │  (dials)        │◄────────────────────────────►│  (accepted)     │
//! │                 │   requests, responses,       │                 │
//! │  connect(url)   │   alerts, ping / pong        │  Connection-    │
//! │                 │                              │  Listener       │
//! └─────────────────┘                              └─────────────────┘
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `config` | Connection and listener settings |
//! | `connection` | WebSocket connection and event loop |
//! | `handler` | Inbound request handlers |
//! | `liveness` | Keepalive sending and silence detection |
//! | `server` | Listener binding and acceptance |

// ============================================================================
// Submodules
// ============================================================================

/// Connection and listener settings.
pub mod config;

/// WebSocket connection and event loop.
pub mod connection;

/// Inbound request handlers.
pub mod handler;

/// Keepalive-based liveness detection.
pub mod liveness;

/// Listener binding and acceptance.
pub mod server;

// ============================================================================
// Re-exports
// ============================================================================

pub use config::{
    ConnectionConfig, DEFAULT_ENDPOINT_PATH, DEFAULT_GRACE_MARGIN, DEFAULT_KEEPALIVE_INTERVAL,
    ListenerConfig,
};
pub use connection::{
    CloseCause, CloseInfo, Connection, Lifecycle, ResponseFuture, TransportEvent,
};
pub use handler::RequestHandler;
pub use liveness::{LivenessAction, LivenessMonitor, LivenessState};
pub use server::ConnectionListener;
