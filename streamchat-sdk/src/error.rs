//! Error types for the chat session layer.

/// Failures surfaced by a connection adapter.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The handshake has not completed yet.
    #[error("not connected (handshake incomplete)")]
    NotConnected,
    /// A previously live socket dropped.
    #[error("disconnected (socket dropped)")]
    Disconnected,
    /// The platform refused the login or the line.
    #[error("rejected by server: {0}")]
    Rejected(String),
    #[error("TLS error: {0}")]
    Tls(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Short label used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotConnected => "NotConnected",
            Self::Disconnected => "Disconnected",
            Self::Rejected(_) => "Rejected",
            Self::Tls(_) => "Tls",
            Self::Io(_) => "Io",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("message queue is closed")]
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// A backoff, grace or rate-limit wait was cut short by `close()`.
    #[error("wait interrupted by session close")]
    InterruptedWait,
    #[error("session is closed")]
    Closed,
}

impl From<QueueError> for SessionError {
    fn from(_: QueueError) -> Self {
        Self::Closed
    }
}
