/*
[INPUT]:  Operations submitted by callers or group populate hooks, QueueConfig, Tokio runtime handle
[OUTPUT]: Started operations, membership change events, drain/close signals
[POS]:    Host container - runs operations and reports membership deltas
[UPDATE]: When changing scheduling, pause/resume or membership notification semantics
*/

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinError;
use tracing::{debug, error};

use crate::config::QueueConfig;
use crate::error::{OperationError, QueueError};
use crate::operation::{BlockOperation, LifecycleState, Operation, OperationId};

/// Identifies a membership subscription on a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// One membership delta.
///
/// `seq` grows by one per change, in the order the queue applied them.
#[derive(Clone)]
pub struct MembershipChange {
    pub seq: u64,
    pub added: Vec<Arc<dyn Operation>>,
    pub removed: Vec<Arc<dyn Operation>>,
}

impl fmt::Debug for MembershipChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = |ops: &[Arc<dyn Operation>]| {
            ops.iter().map(|op| op.name().to_string()).collect::<Vec<_>>()
        };
        f.debug_struct("MembershipChange")
            .field("seq", &self.seq)
            .field("added", &names(&self.added[..]))
            .field("removed", &names(&self.removed[..]))
            .finish()
    }
}

/// Membership snapshot plus the stream of changes that follow it
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriptionId,
    /// Sequence number of the last change included in `count`
    pub seq: u64,
    /// Operations held when the subscription was taken
    pub count: usize,
    pub receiver: mpsc::UnboundedReceiver<MembershipChange>,
}

#[derive(Default)]
struct QueueState {
    members: Vec<Arc<dyn Operation>>,
    pending: VecDeque<Arc<dyn Operation>>,
    running: usize,
    paused: bool,
    closed: bool,
    cancelled: bool,
    seq: u64,
    next_subscription: u64,
    subscribers: Vec<(SubscriptionId, mpsc::UnboundedSender<MembershipChange>)>,
}

impl QueueState {
    fn publish(&mut self, added: Vec<Arc<dyn Operation>>, removed: Vec<Arc<dyn Operation>>) {
        self.seq += 1;
        let change = MembershipChange {
            seq: self.seq,
            added,
            removed,
        };
        self.subscribers.retain(|(_, tx)| tx.send(change.clone()).is_ok());
    }
}

struct Inner {
    config: QueueConfig,
    runtime: Handle,
    state: Mutex<QueueState>,
    count: watch::Sender<usize>,
}

impl Inner {
    fn has_capacity(&self, running: usize) -> bool {
        match self.config.concurrency_limit() {
            Some(max) => running < max,
            None => true,
        }
    }

    fn dispatch(self: &Arc<Self>, state: &mut QueueState) {
        if state.paused {
            return;
        }
        while self.has_capacity(state.running) {
            let Some(op) = state.pending.pop_front() else {
                break;
            };
            state.running += 1;
            self.spawn_driver(op);
        }
    }

    /// Start `op` on the blocking pool and reclaim its slot once it finishes.
    fn spawn_driver(self: &Arc<Self>, op: Arc<dyn Operation>) {
        let inner = self.clone();
        self.runtime.spawn(async move {
            let mut state_rx = op.subscribe();
            let starter = op.clone();
            match tokio::task::spawn_blocking(move || starter.start()).await {
                Ok(()) => {
                    let _ = state_rx.wait_for(LifecycleState::is_finished).await;
                }
                Err(err) => {
                    let failure = start_failure(err);
                    error!(
                        queue = %inner.config.name,
                        operation = %op.name(),
                        id = %op.id(),
                        error = %failure,
                        "operation start panicked, aborting"
                    );
                    op.abort(failure);
                }
            }
            inner.complete(&op);
        });
    }

    fn complete(self: &Arc<Self>, op: &Arc<dyn Operation>) {
        let id = op.id();
        let mut state = self.state.lock();
        state.members.retain(|member| member.id() != id);
        state.running = state.running.saturating_sub(1);
        state.publish(Vec::new(), vec![op.clone()]);
        self.count.send_replace(state.members.len());
        debug!(
            queue = %self.config.name,
            operation = %op.name(),
            id = %id,
            remaining = state.members.len(),
            "operation left queue"
        );
        self.dispatch(&mut state);
    }
}

fn start_failure(err: JoinError) -> OperationError {
    if !err.is_panic() {
        return OperationError::msg(format!("start did not complete: {err}"));
    }
    let payload = err.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    OperationError::Panicked(message)
}

/// Container that runs operations on a Tokio runtime.
///
/// Each operation's `start` runs on the blocking pool, so synchronous work
/// may block. An operation leaves the queue once it reports `Finished`.
/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct OperationQueue {
    inner: Arc<Inner>,
}

impl OperationQueue {
    /// Create a queue on the current Tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn new(config: QueueConfig) -> Self {
        Self::with_handle(Handle::current(), config)
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self::new(QueueConfig::named(name))
    }

    pub fn with_handle(runtime: Handle, config: QueueConfig) -> Self {
        let (count, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                config,
                runtime,
                state: Mutex::new(QueueState::default()),
                count,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.inner.runtime
    }

    /// Enqueue an operation. Safe to call while paused.
    pub fn add(&self, op: Arc<dyn Operation>) -> Result<OperationId, QueueError> {
        let id = op.id();
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(QueueError::Closed(self.inner.config.name.clone()));
        }
        let held = state.members.iter().any(|member| member.id() == id);
        if held || op.state() != LifecycleState::NotStarted {
            return Err(QueueError::AlreadyEnqueued(op.name().to_string()));
        }

        if state.cancelled {
            op.cancel();
        }
        state.members.push(op.clone());
        state.pending.push_back(op.clone());
        debug!(
            queue = %self.inner.config.name,
            operation = %op.name(),
            id = %id,
            paused = state.paused,
            "operation added"
        );
        state.publish(vec![op], Vec::new());
        self.inner.count.send_replace(state.members.len());
        self.inner.dispatch(&mut state);
        Ok(id)
    }

    /// Enqueue a closure as a [`BlockOperation`]
    pub fn add_fn<F>(&self, name: impl Into<String>, f: F) -> Result<OperationId, QueueError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.add(BlockOperation::new(name, f))
    }

    /// Hold queued operations instead of starting them
    pub fn pause(&self) {
        self.inner.state.lock().paused = true;
    }

    /// Release held operations
    pub fn resume(&self) {
        let mut state = self.inner.state.lock();
        state.paused = false;
        self.inner.dispatch(&mut state);
    }

    pub fn is_paused(&self) -> bool {
        self.inner.state.lock().paused
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Whether `cancel_all` was called
    pub fn is_cancelled(&self) -> bool {
        self.inner.state.lock().cancelled
    }

    pub fn operation_count(&self) -> usize {
        self.inner.state.lock().members.len()
    }

    /// Snapshot of held operations in submission order
    pub fn operations(&self) -> Vec<Arc<dyn Operation>> {
        self.inner.state.lock().members.clone()
    }

    /// Subscribe to membership changes.
    ///
    /// The snapshot and the subscription are taken atomically, so every
    /// change after `seq` is delivered on the receiver.
    pub fn subscribe(&self) -> Subscription {
        let (tx, receiver) = mpsc::unbounded_channel();
        let mut state = self.inner.state.lock();
        state.next_subscription += 1;
        let id = SubscriptionId(state.next_subscription);
        state.subscribers.push((id, tx));
        Subscription {
            id,
            seq: state.seq,
            count: state.members.len(),
            receiver,
        }
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.inner
            .state
            .lock()
            .subscribers
            .retain(|(subscriber, _)| *subscriber != id);
    }

    /// Set the cancel flag on every held operation and on every operation
    /// added from now on
    pub fn cancel_all(&self) {
        let members = {
            let mut state = self.inner.state.lock();
            state.cancelled = true;
            state.members.clone()
        };
        debug!(queue = %self.inner.config.name, count = members.len(), "cancelling all operations");
        for op in members {
            op.cancel();
        }
    }

    /// Seal the queue if it is empty and nothing changed after `seq`.
    ///
    /// Once sealed, `add` fails with [`QueueError::Closed`]. Returns true if
    /// the queue is sealed after the call.
    pub fn close_if_drained(&self, seq: u64) -> bool {
        let mut state = self.inner.state.lock();
        if state.closed {
            return true;
        }
        if !state.members.is_empty() || state.seq != seq {
            return false;
        }
        state.closed = true;
        debug!(queue = %self.inner.config.name, seq, "queue drained and closed");
        true
    }

    /// Wait until the queue holds no operations
    pub async fn wait_until_empty(&self) {
        let mut count = self.inner.count.subscribe();
        let _ = count.wait_for(|count| *count == 0).await;
    }
}

impl fmt::Debug for OperationQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("OperationQueue")
            .field("name", &self.inner.config.name)
            .field("members", &state.members.len())
            .field("running", &state.running)
            .field("paused", &state.paused)
            .field("closed", &state.closed)
            .field("cancelled", &state.cancelled)
            .finish()
    }
}
