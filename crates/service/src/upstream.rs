use parking_lot::Mutex;
use tokio::{sync::oneshot, task::JoinHandle};

/// Opens connections to the upstream event source.
pub trait Connector: Send + Sync + 'static {
    type Connection: Connection;

    fn connect(&self) -> impl Future<Output = anyhow::Result<Self::Connection>> + Send;
}

/// An open connection to the upstream event source.
pub trait Connection: Send + 'static {
    /// Wait for the next frame.
    ///
    /// `None` means the connection is gone, whether the remote end closed it
    /// or it failed.
    fn recv(&mut self) -> impl Future<Output = Option<Vec<u8>>> + Send;

    fn close(self) -> impl Future<Output = ()> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamState {
    Disconnected,
    Connecting,
    Connected,
}

enum Phase {
    Disconnected {
        reconnect: Option<JoinHandle<()>>,
    },
    Connecting,
    Connected {
        // Dropping the sender tells the connection task to close the connection.
        _shutdown: oneshot::Sender<()>,
    },
}

struct State {
    phase: Phase,
    // Identifies the current connection attempt. It is bumped by every new
    // attempt and by every stop, so that anything belonging to an older
    // attempt can recognise itself as stale.
    generation: u64,
}

impl State {
    fn advance(&mut self) -> u64 {
        self.generation += 1;
        self.phase = Phase::Connecting;
        self.generation
    }
}

/// The state of the single upstream connection.
///
/// This only does the bookkeeping, the connection itself is owned by the
/// task that reads from it. Every transition is guarded by the generation of
/// the attempt that requests it.
pub struct Upstream {
    state: Mutex<State>,
}

impl Default for Upstream {
    fn default() -> Self {
        Self {
            state: Mutex::new(State {
                phase: Phase::Disconnected { reconnect: None },
                generation: 0,
            }),
        }
    }
}

impl Upstream {
    pub fn state(&self) -> UpstreamState {
        match self.state.lock().phase {
            Phase::Disconnected { .. } => UpstreamState::Disconnected,
            Phase::Connecting => UpstreamState::Connecting,
            Phase::Connected { .. } => UpstreamState::Connected,
        }
    }

    /// Start a new connection attempt.
    ///
    /// Returns the generation of the attempt, or `None` if a connection is
    /// already open or being opened.
    pub fn begin(&self) -> Option<u64> {
        let mut state = self.state.lock();
        if !matches!(state.phase, Phase::Disconnected { .. }) {
            return None;
        }

        Some(state.advance())
    }

    /// Resume after a reconnect delay.
    ///
    /// This only starts a new attempt if nothing happened to the upstream
    /// since the connection of `generation` was lost.
    pub fn resume(&self, generation: u64) -> Option<u64> {
        let mut state = self.state.lock();
        if state.generation != generation || !matches!(state.phase, Phase::Disconnected { .. }) {
            return None;
        }

        Some(state.advance())
    }

    /// The attempt of `generation` has opened its connection.
    ///
    /// Returns `false` if the attempt has been superseded, the connection must
    /// then be closed by the caller.
    pub fn established(&self, generation: u64, shutdown: oneshot::Sender<()>) -> bool {
        let mut state = self.state.lock();
        if state.generation != generation || !matches!(state.phase, Phase::Connecting) {
            return false;
        }

        state.phase = Phase::Connected {
            _shutdown: shutdown,
        };
        true
    }

    /// The connection of `generation` is gone, or could not be opened.
    ///
    /// Returns `false` if that connection is no longer the current one, in
    /// which case nothing changes.
    pub fn closed(&self, generation: u64) -> bool {
        let mut state = self.state.lock();
        if state.generation != generation || matches!(state.phase, Phase::Disconnected { .. }) {
            return false;
        }

        state.phase = Phase::Disconnected { reconnect: None };
        true
    }

    /// Keep the handle of a reconnect timer for the connection of
    /// `generation`, so that [`Upstream::stop`] can cancel it.
    pub fn schedule(&self, generation: u64, handle: JoinHandle<()>) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        match &mut state.phase {
            Phase::Disconnected { reconnect } if state.generation == generation => {
                if let Some(previous) = reconnect.replace(handle) {
                    previous.abort();
                }
            }
            _ => handle.abort(),
        }
    }

    /// Close the connection, or abandon the attempt, whatever the current
    /// phase is.
    ///
    /// A pending reconnect is cancelled. Returns `false` if there was nothing
    /// to stop.
    pub fn stop(&self) -> bool {
        let mut state = self.state.lock();
        state.generation += 1;

        match std::mem::replace(&mut state.phase, Phase::Disconnected { reconnect: None }) {
            Phase::Disconnected { reconnect } => {
                if let Some(handle) = reconnect {
                    handle.abort();
                    true
                } else {
                    false
                }
            }
            Phase::Connecting | Phase::Connected { .. } => true,
        }
    }
}
