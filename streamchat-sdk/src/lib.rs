//! streamchat-sdk: resilient chat session for a streaming platform's IRC
//! channel.
//!
//! A [`Session`] keeps one live connection per channel, drains an unbounded
//! outgoing queue one line at a time under the platform's rate limit, and
//! reconnects with exponential backoff when the socket drops. Lines queued
//! while a reconnect is running stay queued and go out, in order, once the
//! connection is back.
//!
//! ```no_run
//! use std::sync::Arc;
//! use streamchat_sdk::{IrcConnector, LiveConfig, Session, SessionConfig};
//!
//! # async fn demo() {
//! let (events_tx, _events) = tokio::sync::mpsc::channel(256);
//! let connector = IrcConnector::new(streamchat_sdk::transport::DEFAULT_SERVER, events_tx);
//! let config = LiveConfig::new(SessionConfig::default());
//! let session = Arc::new(Session::new("mychannel", "mybot", "oauth:token", Arc::new(connector), config));
//!
//! session.connect().await;
//! let consumer = tokio::spawn({
//!     let session = session.clone();
//!     async move { session.run().await }
//! });
//! session.say("hello chat").unwrap();
//!
//! session.close().await;
//! consumer.await.unwrap();
//! # }
//! ```

pub mod adapter;
pub mod backoff;
pub mod config;
pub mod error;
pub mod event;
pub mod irc;
pub mod queue;
pub mod session;
pub mod throttle;
pub mod transport;

pub use adapter::{Adapter, Connector};
pub use config::{LiveConfig, SessionConfig};
pub use error::{QueueError, SessionError, TransportError};
pub use event::Event;
pub use queue::{Message, MessageQueue};
pub use session::{ConnState, CredentialValidator, Session};
pub use transport::IrcConnector;
