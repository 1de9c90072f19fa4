use std::time::Duration;

use codec::emoji::EmojiSet;
use service::{
    ServiceHandler,
    dispatch::Outcome,
    processor::Skip,
    registry::SubscriberId,
};

use crate::statistics::{Statistics, Stats};

/// Logs what the relay service does and feeds the statistics.
#[derive(Clone)]
pub struct Observer {
    statistics: Statistics,
}

impl Observer {
    pub fn new(statistics: Statistics) -> Self {
        Self { statistics }
    }
}

impl ServiceHandler for Observer {
    fn on_subscribe(&self, id: SubscriberId, count: usize) {
        log::info!("subscriber connected: id={}, subscribers={}", id, count);
    }

    fn on_unsubscribe(&self, id: SubscriberId, count: usize) {
        log::info!("subscriber disconnected: id={}, subscribers={}", id, count);
    }

    fn on_send_failed(&self, id: SubscriberId) {
        log::warn!("send to subscriber failed, dropping it: id={}", id);

        self.statistics.add(Stats::Dropped(1));
    }

    fn on_invalid_message(&self, id: SubscriberId, error: &codec::Error) {
        log::debug!("invalid subscriber message: id={}, err={}", id, error);
    }

    fn on_upstream_connected(&self, generation: u64) {
        log::info!("upstream connected: generation={}", generation);

        self.statistics.add(Stats::Connects(1));
    }

    fn on_upstream_failed(&self, generation: u64, error: &anyhow::Error) {
        log::error!(
            "upstream connect failed: generation={}, err={:?}",
            generation,
            error
        );
    }

    fn on_upstream_closed(&self, generation: u64, reconnect: Option<Duration>) {
        match reconnect {
            Some(delay) => log::info!(
                "upstream closed, reconnecting in {:?}: generation={}",
                delay,
                generation
            ),
            None => log::info!("upstream closed: generation={}", generation),
        }
    }

    fn on_upstream_stopped(&self) {
        log::info!("no subscribers left, upstream stopped");
    }

    fn on_frame(&self) {
        self.statistics.add(Stats::Frames(1));
    }

    fn on_invalid_frame(&self, error: &codec::Error) {
        log::debug!("invalid upstream frame: err={}", error);

        self.statistics.add(Stats::InvalidFrames(1));
    }

    fn on_skip(&self, reason: Skip) {
        log::trace!("upstream frame skipped: reason={:?}", reason);
    }

    fn on_dispatch(&self, emojis: &EmojiSet, outcome: &Outcome) {
        log::debug!(
            "dispatch: emojis={:?}, summaries={}, posts={}, failed={}",
            &emojis[..],
            outcome.summaries,
            outcome.posts,
            outcome.failed.len()
        );

        self.statistics.add(Stats::Dispatched(1));
        self.statistics.add(Stats::Summaries(outcome.summaries as u64));
        self.statistics.add(Stats::Posts(outcome.posts as u64));
    }
}
