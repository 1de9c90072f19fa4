use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::{Result, anyhow};
use emoji_relay_service::{
    Service, ServiceHandler, ServiceOptions,
    processor::Skip,
    registry::{Payload, SubscriberId},
    upstream::{Connection, Connector, UpstreamState},
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::{
    sync::mpsc::{Receiver, UnboundedReceiver, UnboundedSender, channel, unbounded_channel},
    time::sleep,
};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Default)]
struct Upstream {
    attempts: AtomicUsize,
    closed: AtomicUsize,
    refuse: Mutex<bool>,
    crash: Mutex<bool>,
    feeds: Mutex<Vec<UnboundedSender<Vec<u8>>>>,
}

#[derive(Default, Clone)]
struct MockConnector(Arc<Upstream>);

impl MockConnector {
    fn attempts(&self) -> usize {
        self.0.attempts.load(Ordering::SeqCst)
    }

    fn closed(&self) -> usize {
        self.0.closed.load(Ordering::SeqCst)
    }

    fn refuse(&self, refuse: bool) {
        *self.0.refuse.lock() = refuse;
    }

    /// Make the next attempts panic instead of returning.
    fn crash(&self, crash: bool) {
        *self.0.crash.lock() = crash;
    }

    /// Simulate the remote end closing every open connection.
    fn hang_up(&self) {
        self.0.feeds.lock().clear();
    }

    fn push(&self, frame: Vec<u8>) {
        for feed in self.0.feeds.lock().iter() {
            let _ = feed.send(frame.clone());
        }
    }
}

struct MockConnection {
    frames: UnboundedReceiver<Vec<u8>>,
    upstream: Arc<Upstream>,
}

impl Connection for MockConnection {
    async fn recv(&mut self) -> Option<Vec<u8>> {
        self.frames.recv().await
    }

    async fn close(self) {
        self.upstream.closed.fetch_add(1, Ordering::SeqCst);
    }
}

impl Connector for MockConnector {
    type Connection = MockConnection;

    fn connect(&self) -> impl Future<Output = Result<Self::Connection>> + Send {
        self.0.attempts.fetch_add(1, Ordering::SeqCst);

        let result = if *self.0.refuse.lock() {
            Err(anyhow!("connection refused"))
        } else {
            let (sender, frames) = unbounded_channel();
            self.0.feeds.lock().push(sender);

            Ok(MockConnection {
                upstream: self.0.clone(),
                frames,
            })
        };

        let crash = *self.0.crash.lock();
        async move {
            if crash {
                panic!("connector crashed");
            }

            result
        }
    }
}

#[derive(Default, Clone)]
struct Handler {
    skips: Arc<Mutex<Vec<Skip>>>,
    stopped: Arc<AtomicUsize>,
}

impl ServiceHandler for Handler {
    fn on_skip(&self, reason: Skip) {
        self.skips.lock().push(reason);
    }

    fn on_upstream_stopped(&self) {
        self.stopped.fetch_add(1, Ordering::SeqCst);
    }
}

fn create_service(connector: &MockConnector, handler: &Handler) -> Service<MockConnector, Handler> {
    Service::new(ServiceOptions {
        connector: connector.clone(),
        handler: handler.clone(),
        reconnect_delay: RECONNECT_DELAY,
    })
}

fn subscribe(service: &Service<MockConnector, Handler>) -> (SubscriberId, Receiver<Payload>) {
    subscribe_with_capacity(service, 64)
}

fn subscribe_with_capacity(
    service: &Service<MockConnector, Handler>,
    capacity: usize,
) -> (SubscriberId, Receiver<Payload>) {
    let (sender, receiver) = channel(capacity);
    (service.register(sender), receiver)
}

fn drain(receiver: &mut Receiver<Payload>) -> Result<Vec<Value>> {
    let mut messages = Vec::new();
    while let Ok(payload) = receiver.try_recv() {
        messages.push(serde_json::from_str(&payload)?);
    }

    Ok(messages)
}

fn post(text: &str) -> Vec<u8> {
    json!({
        "did": "did:plc:author",
        "time_us": 1725911162329308u64,
        "kind": "commit",
        "commit": {
            "rev": "3l3qo2vutsw2b",
            "operation": "create",
            "collection": "app.bsky.feed.post",
            "rkey": "3l3qo2vuowo2b",
            "record": {
                "$type": "app.bsky.feed.post",
                "createdAt": "2024-09-09T19:46:02.102Z",
                "text": text,
            },
            "cid": "bafyreidc6sydkkbchcyg62v77wbhzvb2mvytlmsychqgwf2xojjtirmzj4",
        }
    })
    .to_string()
    .into_bytes()
}

fn filter(emoji: &str) -> Vec<u8> {
    json!({ "type": "filter", "emoji": emoji }).to_string().into_bytes()
}

fn count(value: usize) -> Value {
    json!({ "type": "clientCount", "count": value })
}

fn emojis(emojis: &[&str]) -> Value {
    json!({ "type": "emojis", "emojis": emojis })
}

// Let every spawned task run until it blocks.
async fn settle() {
    sleep(Duration::from_millis(1)).await;
}

#[tokio::test(start_paused = true)]
async fn test_client_count_follows_registrations() -> Result<()> {
    let connector = MockConnector::default();
    let service = create_service(&connector, &Handler::default());

    let (a, mut ra) = subscribe(&service);
    let (b, mut rb) = subscribe(&service);
    let (_c, mut rc) = subscribe(&service);
    assert_eq!(service.registry().len(), 3);

    service.unregister(b);
    assert_eq!(service.registry().len(), 2);

    // Removing twice changes nothing and announces nothing.
    service.unregister(b);
    assert_eq!(service.registry().len(), 2);

    service.unregister(a);
    assert_eq!(service.registry().len(), 1);

    assert_eq!(drain(&mut ra)?, vec![count(1), count(2), count(3), count(2)]);
    assert_eq!(drain(&mut rb)?, vec![count(2), count(3)]);
    assert_eq!(drain(&mut rc)?, vec![count(3), count(2), count(1)]);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_filter_updates() -> Result<()> {
    let connector = MockConnector::default();
    let service = create_service(&connector, &Handler::default());
    let (a, mut ra) = subscribe(&service);

    service.on_message(a, &filter("🔥"))?;
    service.on_message(a, &filter("🎉"))?;
    service.on_message(a, &filter("🔥"))?;

    let filters = service.registry().filters(a).ok_or_else(|| anyhow!("unknown subscriber"))?;
    assert_eq!(filters.len(), 2);
    assert!(filters.contains("🔥") && filters.contains("🎉"));

    for _ in 0..2 {
        service.on_message(a, &filter("clear"))?;
        let filters = service.registry().filters(a).ok_or_else(|| anyhow!("unknown subscriber"))?;
        assert!(filters.is_empty());
    }

    // Filter updates are never answered.
    assert_eq!(drain(&mut ra)?, vec![count(1)]);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_invalid_message_is_answered() -> Result<()> {
    let connector = MockConnector::default();
    let service = create_service(&connector, &Handler::default());
    let (a, mut ra) = subscribe(&service);
    drain(&mut ra)?;

    assert!(service.on_message(a, b"not json").is_err());
    assert!(service.on_message(a, br#"{"type":"filter"}"#).is_err());
    assert!(service.on_message(a, br#"{"type":"hello","emoji":"x"}"#).is_err());

    let error = json!({ "type": "error", "message": "Invalid message format" });
    assert_eq!(drain(&mut ra)?, vec![error.clone(), error.clone(), error]);
    assert!(service.registry().contains(a));

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_filter_update_for_unknown_subscriber() -> Result<()> {
    let connector = MockConnector::default();
    let service = create_service(&connector, &Handler::default());
    let (a, _ra) = subscribe(&service);
    service.unregister(a);

    service.on_message(a, &filter("🔥"))?;
    assert!(service.on_message(a, b"{}").is_err());
    assert!(service.registry().is_empty());

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_dispatch_by_filter() -> Result<()> {
    let connector = MockConnector::default();
    let service = create_service(&connector, &Handler::default());
    let (_a, mut ra) = subscribe(&service);
    let (b, mut rb) = subscribe(&service);

    service.on_message(b, &filter("🔥"))?;
    drain(&mut ra)?;
    drain(&mut rb)?;

    service.on_upstream_message(&post("fire 🔥🔥"));

    assert_eq!(drain(&mut ra)?, vec![emojis(&["🔥"])]);

    let messages = drain(&mut rb)?;
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0], emojis(&["🔥"]));
    assert_eq!(messages[1]["type"], "post");
    assert_eq!(messages[1]["text"], "fire 🔥🔥");
    assert_eq!(messages[1]["emojis"], json!(["🔥"]));
    assert_eq!(
        messages[1]["url"],
        "https://bsky.app/profile/did:plc:author/post/3l3qo2vuowo2b"
    );
    assert!(messages[1]["timestamp"].as_u64().is_some());

    // No intersection, only the summary.
    service.on_upstream_message(&post("party 🎉"));
    assert_eq!(drain(&mut ra)?, vec![emojis(&["🎉"])]);
    assert_eq!(drain(&mut rb)?, vec![emojis(&["🎉"])]);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_payloads_share_one_buffer() -> Result<()> {
    let connector = MockConnector::default();
    let service = create_service(&connector, &Handler::default());
    let (a, mut ra) = subscribe(&service);
    let (b, mut rb) = subscribe(&service);

    service.on_message(a, &filter("🎉"))?;
    service.on_message(b, &filter("🎉"))?;
    drain(&mut ra)?;
    drain(&mut rb)?;

    service.on_upstream_message(&post("party 🎉"));

    for _ in 0..2 {
        let (left, right) = (ra.try_recv()?, rb.try_recv()?);
        assert_eq!(left, right);
        assert_eq!(left.as_str().as_ptr(), right.as_str().as_ptr());
    }

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_post_keeps_original_text() -> Result<()> {
    let connector = MockConnector::default();
    let service = create_service(&connector, &Handler::default());
    let (a, mut ra) = subscribe(&service);

    service.on_message(a, &filter("🎉"))?;
    drain(&mut ra)?;

    service.on_upstream_message(&post("Hello 🎉 World 🎉"));

    let messages = drain(&mut ra)?;
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0], emojis(&["🎉"]));
    assert_eq!(messages[1]["text"], "Hello 🎉 World 🎉");
    assert_eq!(messages[1]["emojis"], json!(["🎉"]));

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_skipped_frames() -> Result<()> {
    let connector = MockConnector::default();
    let handler = Handler::default();
    let service = create_service(&connector, &handler);

    service.on_upstream_message(&post("nobody listens 🎉"));

    let (a, mut ra) = subscribe(&service);
    service.on_message(a, &filter("🎉"))?;
    drain(&mut ra)?;

    service.on_upstream_message(&post("no emoji here"));
    service.on_upstream_message(&post(""));
    service.on_upstream_message(
        br#"{"did":"did:plc:author","kind":"identity","identity":{"seq":1}}"#,
    );
    service.on_upstream_message(b"garbage");

    assert!(drain(&mut ra)?.is_empty());
    assert_eq!(
        *handler.skips.lock(),
        vec![Skip::NoSubscribers, Skip::NoEmoji, Skip::NoEmoji, Skip::NotAPost]
    );

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_failed_send_removes_subscriber() -> Result<()> {
    let connector = MockConnector::default();
    let service = create_service(&connector, &Handler::default());
    let (_a, mut ra) = subscribe(&service);
    let (b, rb) = subscribe(&service);
    let (_c, mut rc) = subscribe(&service);

    drop(rb);
    drain(&mut ra)?;
    drain(&mut rc)?;

    service.on_upstream_message(&post("🍕"));
    assert!(!service.registry().contains(b));
    assert_eq!(service.registry().len(), 2);
    assert_eq!(drain(&mut ra)?, vec![emojis(&["🍕"]), count(2)]);

    service.on_upstream_message(&post("🍺"));
    assert_eq!(drain(&mut ra)?, vec![emojis(&["🍺"])]);
    assert_eq!(drain(&mut rc)?, vec![emojis(&["🍕"]), count(2), emojis(&["🍺"])]);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_full_queue_removes_subscriber() -> Result<()> {
    let connector = MockConnector::default();
    let service = create_service(&connector, &Handler::default());

    // The queue of the slow subscriber fills up with the two counts.
    let (slow, mut rs) = subscribe_with_capacity(&service, 2);
    let (_a, mut ra) = subscribe(&service);

    service.on_upstream_message(&post("🐢"));
    assert!(!service.registry().contains(slow));
    assert_eq!(drain(&mut rs)?, vec![count(1), count(2)]);
    assert_eq!(drain(&mut ra)?, vec![count(2), emojis(&["🐢"]), count(1)]);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_upstream_follows_subscribers() -> Result<()> {
    let connector = MockConnector::default();
    let handler = Handler::default();
    let service = create_service(&connector, &handler);
    assert_eq!(service.upstream_state(), UpstreamState::Disconnected);

    let (a, _ra) = subscribe(&service);
    assert_eq!(service.upstream_state(), UpstreamState::Connecting);

    settle().await;
    assert_eq!(service.upstream_state(), UpstreamState::Connected);
    assert_eq!(connector.attempts(), 1);

    let (b, _rb) = subscribe(&service);
    settle().await;
    assert_eq!(connector.attempts(), 1);

    service.unregister(a);
    settle().await;
    assert_eq!(service.upstream_state(), UpstreamState::Connected);

    // The last one out closes the upstream right away.
    service.unregister(b);
    assert_eq!(service.upstream_state(), UpstreamState::Disconnected);
    assert_eq!(handler.stopped.load(Ordering::SeqCst), 1);

    settle().await;
    assert_eq!(connector.closed(), 1);
    assert_eq!(connector.attempts(), 1);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_upstream_frames_are_dispatched() -> Result<()> {
    let connector = MockConnector::default();
    let service = create_service(&connector, &Handler::default());
    let (a, mut ra) = subscribe(&service);
    service.on_message(a, &filter("🌊"))?;
    settle().await;
    drain(&mut ra)?;

    connector.push(post("surf 🌊 🏄"));
    settle().await;

    let messages = drain(&mut ra)?;
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0], emojis(&["🌊", "🏄"]));
    assert_eq!(messages[1]["text"], "surf 🌊 🏄");

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_upstream_reconnects_after_delay() -> Result<()> {
    let connector = MockConnector::default();
    let service = create_service(&connector, &Handler::default());
    let (_a, _ra) = subscribe(&service);
    settle().await;

    connector.hang_up();
    settle().await;
    assert_eq!(service.upstream_state(), UpstreamState::Disconnected);

    sleep(Duration::from_secs(4)).await;
    assert_eq!(connector.attempts(), 1);
    assert_eq!(service.upstream_state(), UpstreamState::Disconnected);

    sleep(Duration::from_secs(2)).await;
    assert_eq!(connector.attempts(), 2);
    assert_eq!(service.upstream_state(), UpstreamState::Connected);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_upstream_retries_while_refused() -> Result<()> {
    let connector = MockConnector::default();
    connector.refuse(true);

    let service = create_service(&connector, &Handler::default());
    let (_a, _ra) = subscribe(&service);
    settle().await;
    assert_eq!(connector.attempts(), 1);
    assert_eq!(service.upstream_state(), UpstreamState::Disconnected);

    sleep(RECONNECT_DELAY).await;
    assert_eq!(connector.attempts(), 2);

    sleep(RECONNECT_DELAY).await;
    assert_eq!(connector.attempts(), 3);
    assert_eq!(service.upstream_state(), UpstreamState::Disconnected);

    connector.refuse(false);
    sleep(RECONNECT_DELAY).await;
    assert_eq!(connector.attempts(), 4);
    assert_eq!(service.upstream_state(), UpstreamState::Connected);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_upstream_recovers_from_panicking_connector() -> Result<()> {
    let connector = MockConnector::default();
    connector.crash(true);

    let service = create_service(&connector, &Handler::default());
    let (_a, _ra) = subscribe(&service);
    settle().await;
    assert_eq!(connector.attempts(), 1);
    assert_eq!(service.upstream_state(), UpstreamState::Disconnected);

    sleep(RECONNECT_DELAY).await;
    assert_eq!(connector.attempts(), 2);
    assert_eq!(service.upstream_state(), UpstreamState::Disconnected);

    connector.crash(false);
    sleep(RECONNECT_DELAY).await;
    assert_eq!(connector.attempts(), 3);
    assert_eq!(service.upstream_state(), UpstreamState::Connected);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_no_reconnect_without_subscribers() -> Result<()> {
    let connector = MockConnector::default();
    let service = create_service(&connector, &Handler::default());
    let (a, _ra) = subscribe(&service);
    settle().await;

    connector.hang_up();
    settle().await;

    // Leaving while the reconnect is pending cancels it.
    service.unregister(a);
    sleep(RECONNECT_DELAY * 3).await;
    assert_eq!(connector.attempts(), 1);
    assert_eq!(service.upstream_state(), UpstreamState::Disconnected);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_stale_reconnect_is_ignored() -> Result<()> {
    let connector = MockConnector::default();
    let service = create_service(&connector, &Handler::default());
    let (a, _ra) = subscribe(&service);
    settle().await;

    connector.hang_up();
    settle().await;

    service.unregister(a);
    let (_b, _rb) = subscribe(&service);
    settle().await;
    assert_eq!(connector.attempts(), 2);
    assert_eq!(service.upstream_state(), UpstreamState::Connected);

    sleep(RECONNECT_DELAY * 3).await;
    assert_eq!(connector.attempts(), 2);
    assert_eq!(service.upstream_state(), UpstreamState::Connected);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_stale_close_is_ignored() -> Result<()> {
    let connector = MockConnector::default();
    let service = create_service(&connector, &Handler::default());
    let (a, _ra) = subscribe(&service);
    settle().await;

    // The old connection is still shutting down when the new one is opened.
    service.unregister(a);
    let (_b, _rb) = subscribe(&service);
    settle().await;

    assert_eq!(connector.attempts(), 2);
    assert_eq!(connector.closed(), 1);
    assert_eq!(service.upstream_state(), UpstreamState::Connected);

    sleep(RECONNECT_DELAY * 3).await;
    assert_eq!(connector.attempts(), 2);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_shutdown() -> Result<()> {
    let connector = MockConnector::default();
    let service = create_service(&connector, &Handler::default());
    let (_a, mut ra) = subscribe(&service);
    let (_b, mut rb) = subscribe(&service);
    settle().await;

    service.shutdown();
    settle().await;

    assert!(service.registry().is_empty());
    assert_eq!(service.upstream_state(), UpstreamState::Disconnected);
    assert_eq!(connector.closed(), 1);

    // The queues are closed once everything has been read.
    drain(&mut ra)?;
    drain(&mut rb)?;
    assert!(ra.recv().await.is_none());
    assert!(rb.recv().await.is_none());

    Ok(())
}
