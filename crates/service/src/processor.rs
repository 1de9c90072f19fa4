use codec::{Error, emoji::EmojiSet, event::Post};

use crate::registry::Registry;

/// Why an upstream frame did not lead to a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Skip {
    /// The frame is not a newly created post.
    NotAPost,
    /// Nobody is connected.
    NoSubscribers,
    /// The post has no emoji.
    NoEmoji,
}

#[derive(Debug)]
pub enum Processed {
    Dispatch { emojis: EmojiSet, post: Post },
    Skipped(Skip),
}

/// Turn a raw upstream frame into something to dispatch.
///
/// The checks run from cheapest to most expensive, the emoji are only
/// extracted if somebody is connected to receive them.
pub fn process(bytes: &[u8], registry: &Registry) -> Result<Processed, Error> {
    let Some(post) = Post::decode(bytes)? else {
        return Ok(Processed::Skipped(Skip::NotAPost));
    };

    if registry.is_empty() {
        return Ok(Processed::Skipped(Skip::NoSubscribers));
    }

    let emojis = EmojiSet::extract(&post.text);
    if emojis.is_empty() {
        return Ok(Processed::Skipped(Skip::NoEmoji));
    }

    Ok(Processed::Dispatch { emojis, post })
}
