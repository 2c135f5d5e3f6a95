//! Boundary between the session and the physical transport.
//!
//! A [`Connector`] opens one [`Adapter`] per connection attempt. Adapters are
//! single-use: once closed or failed the session discards them and asks the
//! connector for a new one.

use async_trait::async_trait;

use crate::error::TransportError;

/// Close code for a normal shutdown.
pub const CLOSE_NORMAL: u16 = 1000;

/// One live connection to the chat server, owned by a session.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Write one protocol line (no line terminator).
    ///
    /// Fails with [`TransportError::NotConnected`] before the handshake
    /// completed and [`TransportError::Disconnected`] once the socket dropped
    /// or the adapter was closed.
    async fn send(&self, line: &str) -> Result<(), TransportError>;

    /// Best-effort graceful shutdown. Idempotent.
    async fn close(&self, code: u16, reason: &str);

    /// Replace the credential held by the live connection.
    fn set_credential(&self, credential: &str);

    /// Whether the handshake completed and the socket is still up.
    fn is_live(&self) -> bool;
}

/// Builds adapters bound to a server address.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection, log in as `user` with `credential` and join
    /// `channel`.
    async fn open(
        &self,
        channel: &str,
        user: &str,
        credential: &str,
    ) -> Result<Box<dyn Adapter>, TransportError>;
}
