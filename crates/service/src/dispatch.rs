use std::time::{SystemTime, UNIX_EPOCH};

use codec::{emoji::EmojiSet, event::Post, message::ServerMessage};

use crate::registry::{Payload, Registry, SubscriberId};

/// The result of one dispatch pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Outcome {
    /// Number of subscribers that got the emoji summary.
    pub summaries: usize,
    /// Number of subscribers that got the full post.
    pub posts: usize,
    /// Subscribers a send failed for. They have to be removed from the
    /// registry by the caller.
    pub failed: Vec<SubscriberId>,
}

/// Send one post to every subscriber.
///
/// Every subscriber gets the emoji summary, subscribers whose filters
/// intersect the emoji of the post also get the post itself. Both payloads
/// are encoded at most once, whatever the number of subscribers.
///
/// A subscriber that fails a send gets nothing more in this pass.
pub fn dispatch(registry: &Registry, emojis: &EmojiSet, post: &Post) -> Outcome {
    let summary: Payload = ServerMessage::Emojis { emojis }.encode().into();
    let mut detail: Option<Payload> = None;
    let mut outcome = Outcome::default();

    let snapshot = registry.snapshot();
    for (id, subscriber) in snapshot.iter() {
        if !subscriber.send(&summary) {
            outcome.failed.push(*id);
            continue;
        }

        outcome.summaries += 1;
        if !subscriber.filters.matches(emojis) {
            continue;
        }

        let detail = detail.get_or_insert_with(|| encode_post(emojis, post));
        if subscriber.send(detail) {
            outcome.posts += 1;
        } else {
            outcome.failed.push(*id);
        }
    }

    outcome
}

fn encode_post(emojis: &EmojiSet, post: &Post) -> Payload {
    let url = post.url();
    ServerMessage::Post {
        timestamp: timestamp(),
        text: &post.text,
        url: &url,
        emojis,
    }
    .encode()
    .into()
}

fn timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|it| it.as_millis() as u64)
        .unwrap_or_default()
}
