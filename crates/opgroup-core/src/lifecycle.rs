/*
[INPUT]:  start/finish/cancel calls from any thread
[OUTPUT]: Thread-safe NotStarted -> Running -> Finished transitions with first-error-wins
[POS]:    Core state machine shared by every concrete operation
[UPDATE]: When lifecycle transitions or error recording rules change
*/

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;

use crate::error::OperationError;
use crate::operation::LifecycleState;

#[derive(Debug, Default)]
struct Outcome {
    error: Option<OperationError>,
    sealed: bool,
}

/// Lifecycle state, terminal error slot and cancellation flag.
///
/// The state lives in a watch channel so observers see every transition.
/// The outcome is sealed by exactly one `claim_finish` call; that caller is
/// the only one allowed to run completion hooks and publish `Finished`.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    state: watch::Sender<LifecycleState>,
    outcome: Mutex<Outcome>,
    cancelled: AtomicBool,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        let (state, _) = watch::channel(LifecycleState::NotStarted);
        Self {
            state,
            outcome: Mutex::new(Outcome::default()),
            cancelled: AtomicBool::new(false),
        }
    }

    pub(crate) fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// NotStarted -> Running. Returns false if the operation already started.
    pub(crate) fn begin(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == LifecycleState::NotStarted {
                *state = LifecycleState::Running;
                true
            } else {
                false
            }
        })
    }

    /// Record an error without completing. Ignored once an error exists or
    /// the outcome is sealed.
    pub(crate) fn record_error(&self, error: Option<OperationError>) {
        let Some(error) = error else {
            return;
        };
        let mut outcome = self.outcome.lock();
        if !outcome.sealed && outcome.error.is_none() {
            outcome.error = Some(error);
        }
    }

    /// Seal the outcome. Exactly one caller ever receives `true`.
    pub(crate) fn claim_finish(&self, error: Option<OperationError>) -> bool {
        let mut outcome = self.outcome.lock();
        if outcome.sealed {
            return false;
        }
        if outcome.error.is_none() {
            outcome.error = error;
        }
        outcome.sealed = true;
        true
    }

    /// Running -> Finished. A no-op once finished.
    pub(crate) fn publish_finished(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == LifecycleState::Finished {
                false
            } else {
                *state = LifecycleState::Finished;
                true
            }
        })
    }

    /// Force `Finished`, keeping an already recorded error. Used when the
    /// normal finish path cannot run, e.g. `start` panicked.
    pub(crate) fn abort(&self, error: OperationError) -> bool {
        {
            let mut outcome = self.outcome.lock();
            if outcome.error.is_none() {
                outcome.error = Some(error);
            }
            outcome.sealed = true;
        }
        self.publish_finished()
    }

    pub(crate) fn error(&self) -> Option<OperationError> {
        self.outcome.lock().error.clone()
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
