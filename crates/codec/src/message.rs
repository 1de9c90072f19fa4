use serde::{Deserialize, Serialize};

use crate::{Error, emoji::EmojiSet};

/// The filter token that resets a subscriber's filters.
pub const CLEAR_FILTER: &str = "clear";

/// The text of the error sent back for any message the relay does not accept.
pub const INVALID_MESSAGE_FORMAT: &str = "Invalid message format";

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum Request {
    Filter { emoji: String },
}

/// A message sent by a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// Start receiving posts that contain this emoji.
    AddFilter(String),
    /// Forget every filter, only emoji summaries are received afterwards.
    ClearFilters,
}

impl ClientMessage {
    /// Decode a subscriber frame.
    ///
    /// The only accepted shape is `{"type":"filter","emoji":"<token>"}` with
    /// a non-empty token. The token `"clear"` resets the filters.
    ///
    /// ```
    /// use emoji_relay_codec::message::ClientMessage;
    ///
    /// let message = ClientMessage::decode(r#"{"type":"filter","emoji":"🔥"}"#.as_bytes()).unwrap();
    /// assert_eq!(message, ClientMessage::AddFilter("🔥".to_string()));
    ///
    /// let message = ClientMessage::decode(br#"{"type":"filter","emoji":"clear"}"#).unwrap();
    /// assert_eq!(message, ClientMessage::ClearFilters);
    ///
    /// assert!(ClientMessage::decode(br#"{"type":"filter"}"#).is_err());
    /// ```
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let Request::Filter { emoji } = serde_json::from_slice(bytes)?;
        Ok(match emoji.as_str() {
            "" => return Err(Error::InvalidMessage),
            CLEAR_FILTER => Self::ClearFilters,
            _ => Self::AddFilter(emoji),
        })
    }
}

/// A message sent to subscribers.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage<'a> {
    /// Number of connected subscribers, sent to everyone whenever it changes.
    ClientCount { count: usize },
    /// The emoji of one post, sent to everyone.
    Emojis { emojis: &'a EmojiSet },
    /// A post matching the subscriber's filters.
    Post {
        text: &'a str,
        url: &'a str,
        /// Milliseconds since the unix epoch at which the post was relayed.
        timestamp: u64,
        emojis: &'a EmojiSet,
    },
    Error { message: &'a str },
}

impl ServerMessage<'_> {
    pub fn encode(&self) -> String {
        // Serializing these variants can not fail, they only hold strings,
        // integers and string sequences.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// The reply to a message that could not be decoded.
    pub fn invalid_format() -> Self {
        Self::Error {
            message: INVALID_MESSAGE_FORMAT,
        }
    }
}
