pub mod dispatch;
pub mod processor;
pub mod registry;
pub mod upstream;

use self::{
    dispatch::Outcome,
    processor::{Processed, Skip},
    registry::{Payload, Registry, SubscriberId},
    upstream::{Connection, Connector, Upstream, UpstreamState},
};

use std::{collections::VecDeque, sync::Arc, time::Duration};

use codec::{
    emoji::EmojiSet,
    message::{ClientMessage, ServerMessage},
};
use anyhow::anyhow;
use tokio::sync::{mpsc::Sender, oneshot};

pub trait ServiceHandler: Send + Sync {
    /// A subscriber has been registered, `count` is the number of subscribers
    /// including it.
    #[allow(unused_variables)]
    fn on_subscribe(&self, id: SubscriberId, count: usize) {}

    /// A subscriber has left, either because its connection closed or because
    /// a send to it failed.
    #[allow(unused_variables)]
    fn on_unsubscribe(&self, id: SubscriberId, count: usize) {}

    /// A send to a subscriber failed, it is about to be removed.
    #[allow(unused_variables)]
    fn on_send_failed(&self, id: SubscriberId) {}

    /// A message from a subscriber was not understood.
    #[allow(unused_variables)]
    fn on_invalid_message(&self, id: SubscriberId, error: &codec::Error) {}

    /// The upstream connection of `generation` is open.
    #[allow(unused_variables)]
    fn on_upstream_connected(&self, generation: u64) {}

    /// The upstream connection of `generation` could not be opened.
    #[allow(unused_variables)]
    fn on_upstream_failed(&self, generation: u64, error: &anyhow::Error) {}

    /// The upstream connection of `generation` is gone. `reconnect` is the
    /// delay after which it will be opened again, if anyone is still
    /// subscribed.
    #[allow(unused_variables)]
    fn on_upstream_closed(&self, generation: u64, reconnect: Option<Duration>) {}

    /// The upstream connection has been closed because nobody is subscribed.
    fn on_upstream_stopped(&self) {}

    /// An upstream frame has been received.
    fn on_frame(&self) {}

    /// An upstream frame could not be decoded.
    #[allow(unused_variables)]
    fn on_invalid_frame(&self, error: &codec::Error) {}

    /// An upstream frame did not lead to a dispatch.
    #[allow(unused_variables)]
    fn on_skip(&self, reason: Skip) {}

    /// A post has been sent to the subscribers.
    #[allow(unused_variables)]
    fn on_dispatch(&self, emojis: &EmojiSet, outcome: &Outcome) {}
}

pub struct ServiceOptions<C, T> {
    pub connector: C,
    pub handler: T,
    /// How long to wait before reopening a lost upstream connection.
    pub reconnect_delay: Duration,
}

/// The relay service.
///
/// It owns the subscriber registry and the upstream connection. Subscribers
/// are added and removed through it, and the upstream connection is opened
/// and closed following the number of subscribers.
pub struct Service<C, T> {
    registry: Arc<Registry>,
    upstream: Arc<Upstream>,
    connector: Arc<C>,
    reconnect_delay: Duration,
    handler: T,
}

impl<C, T: Clone> Clone for Service<C, T> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            upstream: self.upstream.clone(),
            connector: self.connector.clone(),
            reconnect_delay: self.reconnect_delay,
            handler: self.handler.clone(),
        }
    }
}

impl<C, T> Service<C, T>
where
    C: Connector,
    T: ServiceHandler + Clone + 'static,
{
    /// Create the relay service.
    ///
    /// Nothing is connected until the first subscriber registers.
    pub fn new(options: ServiceOptions<C, T>) -> Self {
        Self {
            registry: Arc::new(Registry::default()),
            upstream: Arc::new(Upstream::default()),
            connector: Arc::new(options.connector),
            reconnect_delay: options.reconnect_delay,
            handler: options.handler,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn upstream_state(&self) -> UpstreamState {
        self.upstream.state()
    }

    /// Register a subscriber.
    ///
    /// Everything for the subscriber is queued into `sender`, starting with
    /// the new subscriber count. The first subscriber opens the upstream
    /// connection.
    pub fn register(&self, sender: Sender<Payload>) -> SubscriberId {
        let change = self.registry.insert(sender, |count| {
            if count == 1 {
                self.start_upstream();
            }
        });

        self.handler.on_subscribe(change.id, change.count);
        self.remove_failed(change.failed);
        change.id
    }

    /// Remove a subscriber.
    ///
    /// The last subscriber to leave closes the upstream connection. Removing
    /// an unknown subscriber does nothing.
    pub fn unregister(&self, id: SubscriberId) {
        self.remove_failed(vec![id]);
    }

    /// Handle a message sent by a subscriber.
    ///
    /// A message that can not be decoded is answered with an error, the
    /// decode error is also returned to the caller.
    pub fn on_message(&self, id: SubscriberId, bytes: &[u8]) -> Result<(), codec::Error> {
        match ClientMessage::decode(bytes) {
            Ok(message) => {
                self.registry.update_filter(id, message);
                Ok(())
            }
            Err(e) => {
                self.handler.on_invalid_message(id, &e);

                let payload: Payload = ServerMessage::invalid_format().encode().into();
                if self.registry.send_to(id, &payload) == Some(false) {
                    self.handler.on_send_failed(id);
                    self.unregister(id);
                }

                Err(e)
            }
        }
    }

    /// Handle a frame received from upstream.
    pub fn on_upstream_message(&self, bytes: &[u8]) {
        self.handler.on_frame();

        let (emojis, post) = match processor::process(bytes, &self.registry) {
            Ok(Processed::Dispatch { emojis, post }) => (emojis, post),
            Ok(Processed::Skipped(reason)) => {
                self.handler.on_skip(reason);
                return;
            }
            Err(e) => {
                self.handler.on_invalid_frame(&e);
                return;
            }
        };

        let outcome = dispatch::dispatch(&self.registry, &emojis, &post);
        self.handler.on_dispatch(&emojis, &outcome);

        if !outcome.failed.is_empty() {
            for id in &outcome.failed {
                self.handler.on_send_failed(*id);
            }

            self.remove_failed(outcome.failed);
        }
    }

    /// Drop every subscriber and close the upstream connection.
    pub fn shutdown(&self) {
        self.registry.clear(|| {
            if self.upstream.stop() {
                self.handler.on_upstream_stopped();
            }
        });
    }

    // Removing a subscriber announces the new count to everyone else, which
    // can fail for other subscribers in turn, so removals are processed as a
    // queue until no failure is left.
    fn remove_failed(&self, ids: Vec<SubscriberId>) {
        let mut pending = VecDeque::from(ids);
        while let Some(id) = pending.pop_front() {
            let change = self.registry.remove(id, |count| {
                if count == 0 && self.upstream.stop() {
                    self.handler.on_upstream_stopped();
                }
            });

            if let Some(change) = change {
                self.handler.on_unsubscribe(change.id, change.count);
                for id in change.failed {
                    self.handler.on_send_failed(id);
                    pending.push_back(id);
                }
            }
        }
    }

    fn start_upstream(&self) {
        if let Some(generation) = self.upstream.begin() {
            self.connect(generation);
        }
    }

    // The connection runs in a task of its own, so that a connector that
    // panics is reported as a failed attempt and the upstream can not be left
    // in `Connecting`.
    fn connect(&self, generation: u64) {
        let this = self.clone();
        tokio::spawn(async move {
            let session = this.clone();
            let task = tokio::spawn(async move {
                match session.connector.connect().await {
                    Ok(connection) => session.run(generation, connection).await,
                    Err(e) => session.handler.on_upstream_failed(generation, &e),
                }
            });

            if let Err(e) = task.await {
                this.handler
                    .on_upstream_failed(generation, &anyhow!("upstream task failed: {}", e));
            }

            this.on_upstream_closed(generation);
        });
    }

    async fn run(&self, generation: u64, mut connection: C::Connection) {
        let (shutdown, mut stopped) = oneshot::channel();
        if !self.upstream.established(generation, shutdown) {
            connection.close().await;
            return;
        }

        self.handler.on_upstream_connected(generation);

        loop {
            tokio::select! {
                frame = connection.recv() => {
                    match frame {
                        Some(bytes) => self.on_upstream_message(&bytes),
                        None => break,
                    }
                }
                _ = &mut stopped => {
                    connection.close().await;
                    break;
                }
            }
        }
    }

    fn on_upstream_closed(&self, generation: u64) {
        self.registry.with_len(|count| {
            if !self.upstream.closed(generation) {
                return;
            }

            if count == 0 {
                self.handler.on_upstream_closed(generation, None);
                return;
            }

            self.handler
                .on_upstream_closed(generation, Some(self.reconnect_delay));

            let this = self.clone();
            let delay = self.reconnect_delay;
            self.upstream.schedule(
                generation,
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    this.reconnect(generation);
                }),
            );
        });
    }

    fn reconnect(&self, generation: u64) {
        self.registry.with_len(|count| {
            if count > 0 {
                if let Some(generation) = self.upstream.resume(generation) {
                    self.connect(generation);
                }
            }
        });
    }
}
