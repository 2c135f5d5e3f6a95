//! streamchat-bot: runs one chat session for a channel.
//!
//! Lines read from stdin are queued for the channel; inbound events keep a
//! membership cache current and trigger reconnects when the server asks
//! for one or the socket drops.

pub mod config;
pub mod input;
pub mod users;
