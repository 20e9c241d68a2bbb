//! Serving side of the transport.
//!
//! A [`ConnectionListener`] binds a TCP port and upgrades incoming sockets
//! on its endpoint path into [`Connection`]s. Once upgraded there is no
//! client/server distinction: both ends run the same event loop.
//!
//! # Connection Flow
//!
//! 1. `ConnectionListener::bind` - bind to the configured address (port 0 for random)
//! 2. Peer dials [`ConnectionListener::ws_url`]
//! 3. `accept` / `accept_into` - upgrade the socket and start the event loop
//!
//! Upgrade requests for any other path are refused with `404 Not Found`.

// ============================================================================
// Imports
// ============================================================================

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

use super::Connection;
use super::config::ListenerConfig;

// ============================================================================
// Constants
// ============================================================================

/// Time allowed for the WebSocket upgrade once a socket is accepted.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// ConnectionListener
// ============================================================================

/// A bound endpoint that turns incoming sockets into connections.
///
/// # Example
///
/// ```ignore
/// use controlws::{ConnectionListener, ListenerConfig, Success};
///
/// let listener = ConnectionListener::bind(ListenerConfig::new()).await?;
/// println!("serving on {}", listener.ws_url());
///
/// let connection = listener.accept().await?;
/// connection.add_sync_request_handler("echo", |data| Ok(Success::new(data)));
/// ```
pub struct ConnectionListener {
    /// TCP listener for incoming connections.
    listener: TcpListener,
    /// Address the listener is bound to.
    local_addr: SocketAddr,
    /// Endpoint path and per-connection settings.
    config: ListenerConfig,
}

impl ConnectionListener {
    /// Binds the listener.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if the config fails validation
    /// - [`Error::Io`] if binding fails
    pub async fn bind(config: ListenerConfig) -> Result<Self> {
        config.validate()?;

        let listener = TcpListener::bind(SocketAddr::new(config.ip, config.port)).await?;
        let local_addr = listener.local_addr()?;

        debug!(%local_addr, path = %config.path, "WebSocket listener bound");

        Ok(Self {
            listener,
            local_addr,
            config,
        })
    }

    /// Returns the port the listener is bound to.
    #[inline]
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Returns the bound socket address.
    #[inline]
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns the URL peers should dial.
    ///
    /// Format: `ws://{addr}{path}`
    #[inline]
    #[must_use]
    pub fn ws_url(&self) -> String {
        format!("ws://{}{}", self.local_addr, self.config.path)
    }

    /// Accepts the next peer as a new connection using the listener's
    /// connection config.
    ///
    /// # Errors
    ///
    /// See [`accept_into`](Self::accept_into).
    pub async fn accept(&self) -> Result<Connection> {
        let connection = Connection::new(self.config.connection.clone());
        self.accept_into(&connection).await?;
        Ok(connection)
    }

    /// Accepts the next peer and attaches it to an unstarted connection.
    ///
    /// Lets the caller register handlers and listeners before the socket
    /// opens. On an upgrade failure the connection stays unstarted and may
    /// be passed in again.
    ///
    /// # Errors
    ///
    /// - [`Error::Io`] if accepting the TCP socket fails
    /// - [`Error::Connection`] if the upgrade fails, times out, or targets
    ///   another path, or if the connection was already started
    pub async fn accept_into(&self, connection: &Connection) -> Result<SocketAddr> {
        let (stream, peer_addr) = self.listener.accept().await?;
        debug!(%peer_addr, "TCP connection accepted");

        let expected_path = self.config.path.clone();
        let check_path = move |request: &Request, response: Response| {
            if request.uri().path() == expected_path {
                return Ok(response);
            }

            warn!(path = %request.uri().path(), "Upgrade refused: unknown path");
            let mut refusal = ErrorResponse::new(Some(format!(
                "no endpoint at {}",
                request.uri().path()
            )));
            *refusal.status_mut() = StatusCode::NOT_FOUND;
            Err(refusal)
        };

        let ws_stream = timeout(
            HANDSHAKE_TIMEOUT,
            tokio_tungstenite::accept_hdr_async(stream, check_path),
        )
        .await
        .map_err(|_| {
            Error::connection(format!(
                "WebSocket upgrade timed out after {}ms",
                HANDSHAKE_TIMEOUT.as_millis()
            ))
        })?
        .map_err(|e| Error::connection(format!("WebSocket upgrade failed: {e}")))?;

        connection.attach(ws_stream)?;
        info!(%peer_addr, connection_id = %connection.id(), "WebSocket connection established");

        Ok(peer_addr)
    }
}

// ============================================================================
// Tests
// ============================================================================
