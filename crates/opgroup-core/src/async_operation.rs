/*
[INPUT]:  AsyncWork hooks, start from the queue, finish from any thread
[OUTPUT]: Asynchronous operation with a thread-safe NotStarted -> Running -> Finished lifecycle
[POS]:    Central state machine - operations whose completion is signalled later
[UPDATE]: When hook ordering, cancellation translation or finish gating changes
*/

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::error::OperationError;
use crate::lifecycle::Lifecycle;
use crate::operation::{LifecycleState, Operation, OperationId, ResultOperation};

/// Behaviour plugged into an [`AsyncOperation`].
///
/// `on_start` must arrange for exactly one call to `finish` or
/// `finish_cancelled` on the handle, from any thread, at any later point.
pub trait AsyncWork: Send + Sync + 'static {
    fn on_start(&self, op: &OperationHandle) {
        op.finish(None);
    }

    /// Runs once, before the operation is observable as finished
    fn on_will_finish(&self) {}
}

struct Shared {
    id: OperationId,
    name: String,
    lifecycle: Lifecycle,
    work: Box<dyn AsyncWork>,
}

impl Shared {
    fn finish(&self, error: Option<OperationError>) -> bool {
        if self.lifecycle.state() == LifecycleState::NotStarted {
            warn!(operation = %self.name, id = %self.id, "finish called before start, ignoring");
            return false;
        }
        if !self.lifecycle.claim_finish(error) {
            debug!(operation = %self.name, id = %self.id, "duplicate finish ignored");
            return false;
        }

        self.work.on_will_finish();
        self.lifecycle.publish_finished();

        match self.lifecycle.error() {
            Some(err) => {
                debug!(operation = %self.name, id = %self.id, error = %err, "operation failed")
            }
            None => debug!(operation = %self.name, id = %self.id, "operation finished"),
        }
        true
    }
}

/// Cloneable completion handle for a running [`AsyncOperation`].
#[derive(Clone)]
pub struct OperationHandle {
    shared: Arc<Shared>,
}

impl OperationHandle {
    /// Complete the operation. Returns true only for the call that won.
    pub fn finish(&self, error: Option<OperationError>) -> bool {
        self.shared.finish(error)
    }

    pub fn finish_cancelled(&self) -> bool {
        self.shared.finish(Some(OperationError::Cancelled))
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.lifecycle.is_cancelled()
    }

    pub fn id(&self) -> OperationId {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> LifecycleState {
        self.shared.lifecycle.state()
    }
}

impl std::fmt::Debug for OperationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationHandle")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .finish()
    }
}

struct FnWork<F>(F);

impl<F> AsyncWork for FnWork<F>
where
    F: Fn(&OperationHandle) + Send + Sync + 'static,
{
    fn on_start(&self, op: &OperationHandle) {
        (self.0)(op)
    }
}

/// Operation started by its container and finished explicitly later.
pub struct AsyncOperation {
    shared: Arc<Shared>,
}

impl AsyncOperation {
    pub fn new<W: AsyncWork>(name: impl Into<String>, work: W) -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(Shared {
                id: OperationId::new(),
                name: name.into(),
                lifecycle: Lifecycle::new(),
                work: Box::new(work),
            }),
        })
    }

    /// Build an operation from an `on_start` closure
    pub fn from_fn<F>(name: impl Into<String>, on_start: F) -> Arc<Self>
    where
        F: Fn(&OperationHandle) + Send + Sync + 'static,
    {
        Self::new(name, FnWork(on_start))
    }

    pub fn handle(&self) -> OperationHandle {
        OperationHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn finish(&self, error: Option<OperationError>) -> bool {
        self.shared.finish(error)
    }

    pub fn finish_cancelled(&self) -> bool {
        self.shared.finish(Some(OperationError::Cancelled))
    }
}

impl Operation for AsyncOperation {
    fn id(&self) -> OperationId {
        self.shared.id
    }

    fn name(&self) -> &str {
        &self.shared.name
    }

    fn start(&self) {
        let shared = &self.shared;
        if !shared.lifecycle.begin() {
            error!(operation = %shared.name, id = %shared.id, "start called twice, ignoring");
            return;
        }

        if shared.lifecycle.is_cancelled() {
            debug!(operation = %shared.name, id = %shared.id, "cancelled before start");
            shared.finish(Some(OperationError::Cancelled));
            return;
        }

        debug!(operation = %shared.name, id = %shared.id, "operation started");
        shared.work.on_start(&self.handle());
    }

    fn cancel(&self) {
        self.shared.lifecycle.cancel();
    }

    fn is_cancelled(&self) -> bool {
        self.shared.lifecycle.is_cancelled()
    }

    /// Skips `on_will_finish`; the hook may be what panicked.
    fn abort(&self, error: OperationError) {
        let shared = &self.shared;
        if shared.lifecycle.abort(error) {
            warn!(operation = %shared.name, id = %shared.id, "operation aborted");
        }
    }

    fn state(&self) -> LifecycleState {
        self.shared.lifecycle.state()
    }

    fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.shared.lifecycle.subscribe()
    }

    fn as_result(&self) -> Option<&dyn ResultOperation> {
        Some(self)
    }
}

impl ResultOperation for AsyncOperation {
    fn error(&self) -> Option<OperationError> {
        self.shared.lifecycle.error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[derive(Default)]
    struct HookCounter {
        started: AtomicUsize,
        will_finish: AtomicUsize,
        finished_before_hook: AtomicBool,
        handle: Mutex<Option<OperationHandle>>,
    }

    struct CountingWork(Arc<HookCounter>);

    impl AsyncWork for CountingWork {
        fn on_start(&self, op: &OperationHandle) {
            self.0.started.fetch_add(1, Ordering::SeqCst);
            *self.0.handle.lock() = Some(op.clone());
        }

        fn on_will_finish(&self) {
            self.0.will_finish.fetch_add(1, Ordering::SeqCst);
            if let Some(handle) = self.0.handle.lock().take() {
                if handle.state() == LifecycleState::Finished {
                    self.0.finished_before_hook.store(true, Ordering::SeqCst);
                }
            }
        }
    }

    #[test]
    fn test_abort_finishes_without_hook() {
        let counter = Arc::new(HookCounter::default());
        let op = AsyncOperation::new("aborted", CountingWork(counter.clone()));

        op.start();
        op.abort(OperationError::Panicked("on_start crashed".into()));

        assert!(op.is_finished());
        assert!(op.error().is_some_and(|e| e.is_panicked()));
        assert_eq!(counter.will_finish.load(Ordering::SeqCst), 0);
        assert!(!op.finish(None));
    }

    #[test]
    fn test_start_runs_hook_and_waits_for_finish() {
        let counter = Arc::new(HookCounter::default());
        let op = AsyncOperation::new("hooks", CountingWork(counter.clone()));

        op.start();
        assert!(op.is_executing());
        assert!(!op.is_finished());
        assert_eq!(counter.started.load(Ordering::SeqCst), 1);

        assert!(op.finish(Some(OperationError::msg("disk-full"))));
        assert!(op.is_finished());
        assert!(!op.is_executing());
        assert_eq!(counter.will_finish.load(Ordering::SeqCst), 1);
        assert!(!counter.finished_before_hook.load(Ordering::SeqCst));
    }

    #[test]
    fn test_second_finish_is_inert() {
        let counter = Arc::new(HookCounter::default());
        let op = AsyncOperation::new("twice", CountingWork(counter.clone()));
        op.start();

        assert!(op.finish(Some(OperationError::msg("e1"))));
        assert!(!op.finish(Some(OperationError::msg("e2"))));
        assert!(!op.finish_cancelled());

        assert_eq!(op.error().map(|e| e.to_string()), Some("e1".into()));
        assert_eq!(counter.will_finish.load(Ordering::SeqCst), 1);
        assert_eq!(op.state(), LifecycleState::Finished);
    }

    #[test]
    fn test_concurrent_finish_runs_hook_once() {
        let counter = Arc::new(HookCounter::default());
        let op = AsyncOperation::new("race", CountingWork(counter.clone()));
        op.start();
        let handle = op.handle();

        let threads: Vec<_> = (0..8)
            .map(|idx| {
                let handle = handle.clone();
                thread::spawn(move || handle.finish(Some(OperationError::msg(format!("e{idx}")))))
            })
            .collect();
        let winners = threads
            .into_iter()
            .map(|t| t.join().unwrap())
            .filter(|won| *won)
            .count();

        assert_eq!(winners, 1);
        assert_eq!(counter.will_finish.load(Ordering::SeqCst), 1);
        assert!(op.is_finished());
    }

    #[test]
    fn test_cancel_before_start_skips_on_start() {
        let counter = Arc::new(HookCounter::default());
        let op = AsyncOperation::new("cancelled", CountingWork(counter.clone()));

        op.cancel();
        assert_eq!(op.state(), LifecycleState::NotStarted);
        op.start();

        assert_eq!(counter.started.load(Ordering::SeqCst), 0);
        assert_eq!(counter.will_finish.load(Ordering::SeqCst), 1);
        assert!(op.is_finished());
        assert!(op.error().is_some_and(|e| e.is_cancelled()));
    }

    #[test]
    fn test_finish_before_start_is_ignored() {
        let op = AsyncOperation::from_fn("early", |_| {});
        assert!(!op.finish(Some(OperationError::msg("early"))));
        assert_eq!(op.state(), LifecycleState::NotStarted);

        op.start();
        assert!(op.is_executing());
        assert!(op.finish(None));
        assert!(op.error().is_none());
    }

    #[test]
    fn test_double_start_does_not_rerun_hook() {
        let counter = Arc::new(HookCounter::default());
        let op = AsyncOperation::new("restart", CountingWork(counter.clone()));

        op.start();
        op.start();
        assert_eq!(counter.started.load(Ordering::SeqCst), 1);

        op.finish(None);
        op.start();
        assert_eq!(counter.started.load(Ordering::SeqCst), 1);
        assert_eq!(op.state(), LifecycleState::Finished);
    }

    #[test]
    fn test_default_work_finishes_immediately() {
        struct Immediate;
        impl AsyncWork for Immediate {}

        let op = AsyncOperation::new("immediate", Immediate);
        op.start();
        assert!(op.is_finished());
        assert!(op.error().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_finish_from_another_thread_notifies_observers() {
        let op = AsyncOperation::from_fn("background", |op| {
            let op = op.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                op.finish(Some(OperationError::msg("timeout")));
            });
        });
        let mut rx = op.subscribe();

        op.start();
        let state = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| s.is_finished()))
            .await
            .expect("operation should finish")
            .map(|state| *state)
            .unwrap();

        assert_eq!(state, LifecycleState::Finished);
        assert_eq!(op.error().map(|e| e.to_string()), Some("timeout".into()));
    }
}
