use std::{ops::Deref, sync::LazyLock};

use regex::Regex;
use serde::Serialize;

// Every match is a single code point, sequences such as ZWJ families or flags
// are reported as their individual pictographs.
static EMOJI: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[\p{Emoji_Presentation}\p{Extended_Pictographic}]")
        .expect("the emoji pattern is a valid regex")
});

/// The distinct emoji found in one post.
///
/// The set keeps the order in which each emoji first appeared in the text,
/// this is also the order in which they are sent to subscribers.
///
/// ```
/// use emoji_relay_codec::emoji::EmojiSet;
///
/// let emojis = EmojiSet::extract("hello 🎉 world 🎉 🔥");
///
/// assert_eq!(emojis.len(), 2);
/// assert_eq!(emojis[0], "🎉");
/// assert!(emojis.contains("🔥"));
/// ```
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct EmojiSet(Vec<String>);

impl EmojiSet {
    /// Extract the emoji of a post.
    ///
    /// The text is lower-cased before matching, so the result never depends
    /// on the case of the surrounding letters.
    pub fn extract(text: &str) -> Self {
        let text = text.to_lowercase();
        let mut emojis: Vec<String> = Vec::new();

        for item in EMOJI.find_iter(&text) {
            let emoji = item.as_str();
            if !emojis.iter().any(|it| it == emoji) {
                emojis.push(emoji.to_string());
            }
        }

        Self(emojis)
    }

    pub fn contains(&self, emoji: &str) -> bool {
        self.0.iter().any(|it| it == emoji)
    }

    /// Check whether any emoji of the set satisfies the predicate, this is
    /// how a subscriber's filters are intersected with the set.
    pub fn intersects<F>(&self, mut contains: F) -> bool
    where
        F: FnMut(&str) -> bool,
    {
        self.0.iter().any(|it| contains(it))
    }
}

impl Deref for EmojiSet {
    type Target = [String];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
