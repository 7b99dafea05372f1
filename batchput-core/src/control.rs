use std::sync::Arc;
use tokio::sync::watch;

/// Cooperative run state shared by a session and its workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Paused,
    Cancelled,
}

/// Stop signal polled by workers between units of work. It never interrupts
/// a request that is already in flight.
#[derive(Clone)]
pub struct ControlSignal {
    tx: Arc<watch::Sender<RunState>>,
}

impl Default for ControlSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(RunState::Idle);
        Self { tx: Arc::new(tx) }
    }

    pub fn state(&self) -> RunState {
        *self.tx.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state() == RunState::Running
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == RunState::Cancelled
    }

    /// Returns false once cancelled.
    pub fn run(&self) -> bool {
        self.set_unless_cancelled(RunState::Running)
    }

    /// `pause(true)` asks workers to stop after their current unit;
    /// `pause(false)` lifts the flag without restarting stopped workers.
    pub fn pause(&self, flag: bool) -> bool {
        let next = if flag {
            RunState::Paused
        } else {
            RunState::Running
        };
        self.set_unless_cancelled(next)
    }

    /// Terminal. Returns false if the signal was already cancelled.
    pub fn cancel(&self) -> bool {
        self.tx.send_replace(RunState::Cancelled) != RunState::Cancelled
    }

    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.tx.subscribe()
    }

    fn set_unless_cancelled(&self, next: RunState) -> bool {
        let mut applied = false;
        self.tx.send_if_modified(|state| {
            if *state == RunState::Cancelled {
                return false;
            }
            applied = true;
            let changed = *state != next;
            *state = next;
            changed
        });
        applied
    }
}
