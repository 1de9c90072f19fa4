use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use ahash::{AHashMap, AHashSet};
use codec::{
    emoji::EmojiSet,
    message::{ClientMessage, ServerMessage},
};
use parking_lot::{RwLock, RwLockReadGuard};
use tokio::sync::mpsc::Sender;
use tungstenite::Utf8Bytes;

/// An encoded message on its way to subscribers.
///
/// The same payload is shared by every subscriber it is sent to, it is
/// encoded once and handed to the websocket as is.
pub type Payload = Utf8Bytes;

/// The identifier of a subscriber.
///
/// Identifiers are handed out in increasing order and never reused within
/// the lifetime of a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The emoji a subscriber wants to receive full posts for.
///
/// An empty filter set means the subscriber only gets emoji summaries.
#[derive(Debug, Default, Clone)]
pub struct Filters(AHashSet<String>);

impl Filters {
    pub fn apply(&mut self, message: ClientMessage) {
        match message {
            ClientMessage::AddFilter(emoji) => {
                self.0.insert(emoji);
            }
            ClientMessage::ClearFilters => self.0.clear(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn contains(&self, emoji: &str) -> bool {
        self.0.contains(emoji)
    }

    /// Check whether a post with these emoji is wanted.
    pub fn matches(&self, emojis: &EmojiSet) -> bool {
        !self.0.is_empty() && emojis.intersects(|it| self.0.contains(it))
    }
}

/// A connected subscriber.
#[derive(Debug)]
pub struct Subscriber {
    sender: Sender<Payload>,
    pub filters: Filters,
}

impl Subscriber {
    /// Queue a payload for the subscriber.
    ///
    /// This never waits. A full queue or a connection that has gone away are
    /// both reported as a failed send.
    pub fn send(&self, payload: &Payload) -> bool {
        self.sender.try_send(payload.clone()).is_ok()
    }
}

/// The outcome of adding or removing a subscriber.
#[derive(Debug)]
pub struct Change {
    pub id: SubscriberId,
    /// Number of subscribers right after the change.
    pub count: usize,
    /// Subscribers the new count could not be delivered to.
    pub failed: Vec<SubscriberId>,
}

/// A consistent view of all subscribers.
///
/// The registry can not change while a snapshot is alive, so keep it for the
/// duration of one pass over the subscribers and no longer.
pub struct Snapshot<'a>(RwLockReadGuard<'a, AHashMap<SubscriberId, Subscriber>>);

impl Snapshot<'_> {
    pub fn iter(&self) -> impl Iterator<Item = (&SubscriberId, &Subscriber)> {
        self.0.iter()
    }
}

/// All connected subscribers and their filters.
///
/// Every change of the subscriber count is announced to all subscribers
/// while the registry is still locked, so the counts that subscribers see
/// are always in the order the changes happened.
pub struct Registry {
    subscribers: RwLock<AHashMap<SubscriberId, Subscriber>>,
    index: AtomicU64,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            subscribers: RwLock::new(AHashMap::with_capacity(1024)),
            index: AtomicU64::new(1),
        }
    }
}

impl Registry {
    /// Add a subscriber with no filters.
    ///
    /// `changed` runs with the new subscriber count before the registry is
    /// unlocked.
    ///
    /// ```
    /// use emoji_relay_service::registry::Registry;
    /// use tokio::sync::mpsc::channel;
    ///
    /// let registry = Registry::default();
    /// let (sender, mut receiver) = channel(10);
    ///
    /// let change = registry.insert(sender, |count| assert_eq!(count, 1));
    /// assert_eq!(change.count, 1);
    /// assert_eq!(registry.len(), 1);
    /// assert_eq!(&*receiver.try_recv().unwrap(), r#"{"type":"clientCount","count":1}"#);
    /// ```
    pub fn insert<F>(&self, sender: Sender<Payload>, changed: F) -> Change
    where
        F: FnOnce(usize),
    {
        let id = SubscriberId(self.index.fetch_add(1, Ordering::Relaxed));
        let mut subscribers = self.subscribers.write();
        subscribers.insert(
            id,
            Subscriber {
                filters: Filters::default(),
                sender,
            },
        );

        let count = subscribers.len();
        let failed = broadcast_count(&subscribers, count);
        changed(count);

        Change { id, count, failed }
    }

    /// Remove a subscriber.
    ///
    /// Nothing happens and `None` is returned if the subscriber is unknown,
    /// for example because it was already removed after a failed send.
    /// Otherwise `changed` runs with the new count before the registry is
    /// unlocked.
    pub fn remove<F>(&self, id: SubscriberId, changed: F) -> Option<Change>
    where
        F: FnOnce(usize),
    {
        let mut subscribers = self.subscribers.write();
        subscribers.remove(&id)?;

        let count = subscribers.len();
        let failed = broadcast_count(&subscribers, count);
        changed(count);

        Some(Change { id, count, failed })
    }

    /// Remove every subscriber without announcing anything.
    ///
    /// Dropping the subscribers closes their queues, which in turn ends their
    /// connections.
    pub fn clear<F>(&self, changed: F) -> usize
    where
        F: FnOnce(),
    {
        let mut subscribers = self.subscribers.write();
        let count = subscribers.len();
        subscribers.clear();
        changed();

        count
    }

    /// Apply a filter update.
    ///
    /// Returns `false` if the subscriber is unknown, the update is dropped in
    /// that case.
    pub fn update_filter(&self, id: SubscriberId, message: ClientMessage) -> bool {
        if let Some(subscriber) = self.subscribers.write().get_mut(&id) {
            subscriber.filters.apply(message);
            true
        } else {
            false
        }
    }

    /// Get a copy of a subscriber's filters.
    pub fn filters(&self, id: SubscriberId) -> Option<Filters> {
        self.subscribers.read().get(&id).map(|it| it.filters.clone())
    }

    /// Queue a payload for one subscriber.
    ///
    /// Returns `None` if the subscriber is unknown, otherwise whether the
    /// payload was queued.
    pub fn send_to(&self, id: SubscriberId, payload: &Payload) -> Option<bool> {
        self.subscribers.read().get(&id).map(|it| it.send(payload))
    }

    pub fn snapshot(&self) -> Snapshot<'_> {
        Snapshot(self.subscribers.read())
    }

    /// Run `handle` with the current subscriber count, the count can not
    /// change until `handle` returns.
    pub fn with_len<F, R>(&self, handle: F) -> R
    where
        F: FnOnce(usize) -> R,
    {
        let subscribers = self.subscribers.read();
        handle(subscribers.len())
    }

    pub fn len(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.read().is_empty()
    }

    pub fn contains(&self, id: SubscriberId) -> bool {
        self.subscribers.read().contains_key(&id)
    }
}

fn broadcast_count(
    subscribers: &AHashMap<SubscriberId, Subscriber>,
    count: usize,
) -> Vec<SubscriberId> {
    let payload: Payload = ServerMessage::ClientCount { count }.encode().into();
    subscribers
        .iter()
        .filter(|(_, it)| !it.send(&payload))
        .map(|(id, _)| *id)
        .collect()
}
