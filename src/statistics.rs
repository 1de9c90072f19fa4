use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

/// The type of information passed to the statistics.
#[derive(Debug, Clone, Copy)]
pub enum Stats {
    /// Frames received from upstream.
    Frames(u64),
    /// Frames that could not be decoded.
    InvalidFrames(u64),
    /// Posts sent through the dispatcher.
    Dispatched(u64),
    /// Emoji summaries sent to subscribers.
    Summaries(u64),
    /// Full posts sent to subscribers.
    Posts(u64),
    /// Subscribers dropped because a send to them failed.
    Dropped(u64),
    /// Upstream connections opened.
    Connects(u64),
}

#[derive(Default)]
struct Count(AtomicU64);

impl Count {
    fn add(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
struct Counts {
    frames: Count,
    invalid_frames: Count,
    dispatched: Count,
    summaries: Count,
    posts: Count,
    dropped: Count,
    connects: Count,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub frames: u64,
    pub invalid_frames: u64,
    pub dispatched: u64,
    pub summaries: u64,
    pub posts: u64,
    pub dropped: u64,
    pub connects: u64,
}

/// Process wide counters, shared by every clone.
#[derive(Default, Clone)]
pub struct Statistics(Arc<Counts>);

impl Statistics {
    pub fn add(&self, payload: Stats) {
        let counts = &self.0;
        match payload {
            Stats::Frames(v) => counts.frames.add(v),
            Stats::InvalidFrames(v) => counts.invalid_frames.add(v),
            Stats::Dispatched(v) => counts.dispatched.add(v),
            Stats::Summaries(v) => counts.summaries.add(v),
            Stats::Posts(v) => counts.posts.add(v),
            Stats::Dropped(v) => counts.dropped.add(v),
            Stats::Connects(v) => counts.connects.add(v),
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        let counts = &self.0;
        Snapshot {
            frames: counts.frames.get(),
            invalid_frames: counts.invalid_frames.get(),
            dispatched: counts.dispatched.get(),
            summaries: counts.summaries.get(),
            posts: counts.posts.get(),
            dropped: counts.dropped.get(),
            connects: counts.connects.get(),
        }
    }
}
