//! Who is in the channel, as seen from the inbound event stream.
//!
//! Names are case-insensitive. The cache only reads events; it never talks
//! back to the session.

use std::collections::HashMap;

use parking_lot::RwLock;
use streamchat_sdk::Event;

/// A cached channel member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    /// Lowercased login name.
    pub name: String,
    /// `display-name` tag from the user's last message.
    pub display_name: Option<String>,
    pub is_moderator: bool,
}

impl User {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_lowercase(),
            display_name: None,
            is_moderator: false,
        }
    }
}

#[derive(Debug)]
pub struct UserCache {
    channel: String,
    users: RwLock<HashMap<String, User>>,
}

impl UserCache {
    pub fn new(channel: &str) -> Self {
        Self {
            channel: channel.trim_start_matches('#').to_lowercase(),
            users: RwLock::new(HashMap::new()),
        }
    }

    /// The cached user, or a fresh record that is not inserted.
    pub fn get(&self, name: &str) -> User {
        self.users
            .read()
            .get(&name.to_lowercase())
            .cloned()
            .unwrap_or_else(|| User::new(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.users.read().contains_key(&name.to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.users.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.read().is_empty()
    }

    fn is_ours(&self, channel: &str) -> bool {
        channel.trim_start_matches('#').eq_ignore_ascii_case(&self.channel)
    }

    fn add(&self, name: &str) {
        let key = name.to_lowercase();
        self.users
            .write()
            .entry(key)
            .or_insert_with(|| User::new(name));
    }

    /// Update the roster from one inbound event.
    pub fn apply(&self, event: &Event) {
        match event {
            Event::Names { channel, nicks } if self.is_ours(channel) => {
                let mut users = self.users.write();
                let roster = nicks
                    .iter()
                    .map(|n| {
                        let key = n.to_lowercase();
                        let user = users.remove(&key).unwrap_or_else(|| User::new(n));
                        (key, user)
                    })
                    .collect();
                *users = roster;
                tracing::debug!(channel = %self.channel, count = users.len(), "Roster replaced");
            }
            Event::Joined { channel, nick } if self.is_ours(channel) => self.add(nick),
            Event::Parted { channel, nick } if self.is_ours(channel) => {
                self.users.write().remove(&nick.to_lowercase());
            }
            Event::Message {
                from, target, tags, ..
            } if self.is_ours(target) => {
                let mut users = self.users.write();
                let user = users
                    .entry(from.to_lowercase())
                    .or_insert_with(|| User::new(from));
                if let Some(display) = tags.get("display-name").filter(|d| !d.is_empty()) {
                    user.display_name = Some(display.clone());
                }
                if let Some(m) = tags.get("mod") {
                    user.is_moderator = m == "1";
                }
            }
            _ => {}
        }
    }
}
