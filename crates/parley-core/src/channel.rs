//! Broadcast channel identifiers.
//!
//! Every broadcast group is either an identity's personal channel, which
//! all sockets of that identity join, or a chat room channel.

use std::fmt;

/// Maximum length of an identity or room id used as a channel key.
pub const MAX_CHANNEL_KEY_LENGTH: usize = 256;

/// A broadcast group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChannelId {
    /// All sockets bound to one identity.
    Personal(String),
    /// All sockets that joined one chat room.
    ChatRoom(String),
}

impl ChannelId {
    /// Personal channel of an identity.
    #[must_use]
    pub fn personal(row_id: impl Into<String>) -> Self {
        ChannelId::Personal(row_id.into())
    }

    /// Channel of a chat room.
    #[must_use]
    pub fn room(room_id: impl Into<String>) -> Self {
        ChannelId::ChatRoom(room_id.into())
    }

    /// The identity or room id this channel is keyed by.
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            ChannelId::Personal(key) | ChannelId::ChatRoom(key) => key,
        }
    }

    /// Check that the key can name a channel.
    ///
    /// # Errors
    ///
    /// Returns an error message if the key is empty, too long or contains
    /// control characters.
    pub fn validate(&self) -> Result<(), &'static str> {
        let key = self.key();
        if key.is_empty() {
            return Err("Channel key cannot be empty");
        }
        if key.len() > MAX_CHANNEL_KEY_LENGTH {
            return Err("Channel key too long");
        }
        if key.chars().any(char::is_control) {
            return Err("Channel key contains invalid characters");
        }
        Ok(())
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelId::Personal(row_id) => write!(f, "user:{}", row_id),
            ChannelId::ChatRoom(room_id) => write!(f, "room:{}", room_id),
        }
    }
}
