//! Inbound events forwarded by the transport to whoever owns the session.
//!
//! The session itself never consumes these; the owning process routes
//! `Reconnect`/`Disconnected` back into [`Session::reconnect`] and feeds the
//! rest to its own subscribers.
//!
//! [`Session::reconnect`]: crate::session::Session::reconnect

/// Events that the transport emits to the consumer (bot, cache, etc.)
#[derive(Debug, Clone)]
pub enum Event {
    /// Login accepted (RPL_WELCOME). `nick` is our confirmed nick.
    Registered {
        nick: String,
    },

    /// Someone joined the channel (including us).
    Joined {
        channel: String,
        nick: String,
    },

    /// Someone left the channel.
    Parted {
        channel: String,
        nick: String,
    },

    /// Complete NAMES list for a channel: every 353 reply up to the closing
    /// 366.
    Names {
        channel: String,
        nicks: Vec<String>,
    },

    /// A chat line in a channel or a whisper.
    Message {
        from: String,
        target: String,
        text: String,
        /// IRCv3 message tags (empty if none).
        tags: std::collections::HashMap<String, String>,
    },

    /// Server or channel notice.
    Notice {
        target: String,
        text: String,
        /// `msg-id` tag, when the platform sends one.
        msg_id: Option<String>,
    },

    /// The server asked us to reconnect (it is about to restart).
    Reconnect,

    /// The live socket dropped. Not emitted for a deliberate close.
    Disconnected {
        reason: String,
    },
}

impl Event {
    /// True for events that mean the current connection is going away.
    pub fn wants_reconnect(&self) -> bool {
        matches!(self, Self::Reconnect | Self::Disconnected { .. })
    }
}
