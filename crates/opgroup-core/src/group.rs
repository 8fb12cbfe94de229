/*
[INPUT]:  GroupWork populate hook, private child OperationQueue, membership change stream
[OUTPUT]: Operation that finishes once every child left its queue, with an aggregated error
[POS]:    Composition layer - fan-out of child operations and multi-error aggregation
[UPDATE]: When changing harvesting, completion detection or cancellation propagation
*/

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::async_operation::{AsyncOperation, AsyncWork, OperationHandle};
use crate::config::QueueConfig;
use crate::error::{AggregateError, OperationError, Result};
use crate::operation::{LifecycleState, Operation, OperationId, ResultOperation, operation_error};
use crate::queue::{OperationQueue, Subscription};

/// Behaviour plugged into a [`GroupOperation`].
pub trait GroupWork: Send + Sync + 'static {
    /// Add child operations. The queue is paused while this runs.
    ///
    /// The queue handle may be cloned and kept to add more children later;
    /// they are awaited as long as they are added before the group finishes.
    fn populate(&self, children: &OperationQueue) -> Result<()>;

    fn on_will_finish(&self) {}
}

struct FnWork<F>(F);

impl<F> GroupWork for FnWork<F>
where
    F: Fn(&OperationQueue) -> Result<()> + Send + Sync + 'static,
{
    fn populate(&self, children: &OperationQueue) -> Result<()> {
        (self.0)(children)
    }
}

struct GroupDriver {
    children: OperationQueue,
    work: Box<dyn GroupWork>,
}

impl AsyncWork for GroupDriver {
    fn on_start(&self, op: &OperationHandle) {
        let mut aggregate = AggregateError::new();
        if let Err(err) = self.work.populate(&self.children) {
            warn!(group = %op.name(), error = %err, "populate failed, cancelling children");
            aggregate.push(err);
            self.children.cancel_all();
        }

        let subscription = self.children.subscribe();
        if subscription.count == 0 && self.children.close_if_drained(subscription.seq) {
            self.children.unsubscribe(subscription.id);
            debug!(group = %op.name(), "no children, finishing immediately");
            op.finish(aggregate.into_error());
            return;
        }

        debug!(group = %op.name(), children = subscription.count, "group started");
        let harvester = Harvester {
            children: self.children.clone(),
            op: op.clone(),
            aggregate,
        };
        self.children.runtime().spawn(harvester.run(subscription));
        self.children.resume();
    }

    fn on_will_finish(&self) {
        self.work.on_will_finish();
    }
}

/// Collects child errors in removal order and finishes the group once the
/// child queue is drained and sealed.
struct Harvester {
    children: OperationQueue,
    op: OperationHandle,
    aggregate: AggregateError,
}

impl Harvester {
    async fn run(mut self, mut subscription: Subscription) {
        let mut remaining = subscription.count;

        while let Some(change) = subscription.receiver.recv().await {
            remaining += change.added.len();
            for child in &change.removed {
                if let Some(err) = operation_error(child.as_ref()) {
                    debug!(
                        group = %self.op.name(),
                        child = %child.name(),
                        error = %err,
                        "child failed"
                    );
                    self.aggregate.push(err);
                }
            }
            remaining = remaining.saturating_sub(change.removed.len());

            if remaining == 0 && self.children.close_if_drained(change.seq) {
                break;
            }
        }

        self.children.unsubscribe(subscription.id);
        info!(
            group = %self.op.name(),
            failures = self.aggregate.len(),
            "all children finished"
        );
        self.op.finish(self.aggregate.into_error());
    }
}

/// Operation that runs a set of children and finishes when all of them have.
///
/// Owns a private child queue for its whole lifetime. Children's errors are
/// collected in the order the children finished; the group fails with
/// [`OperationError::Aggregate`](crate::OperationError::Aggregate) if any
/// child failed. One child's failure never stops its siblings.
pub struct GroupOperation {
    op: Arc<AsyncOperation>,
    children: OperationQueue,
}

impl GroupOperation {
    /// Create a group whose children run without a concurrency bound.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn new<W: GroupWork>(name: impl Into<String>, work: W) -> Arc<Self> {
        let name = name.into();
        let config = QueueConfig::named(format!("{name}.children"));
        Self::with_config(name, config, work)
    }

    /// Create a group whose child queue uses `config`
    pub fn with_config<W: GroupWork>(
        name: impl Into<String>,
        config: QueueConfig,
        work: W,
    ) -> Arc<Self> {
        let children = OperationQueue::new(config);
        children.pause();
        let driver = GroupDriver {
            children: children.clone(),
            work: Box::new(work),
        };
        Arc::new(Self {
            op: AsyncOperation::new(name, driver),
            children,
        })
    }

    pub fn from_fn<F>(name: impl Into<String>, populate: F) -> Arc<Self>
    where
        F: Fn(&OperationQueue) -> Result<()> + Send + Sync + 'static,
    {
        Self::new(name, FnWork(populate))
    }

    pub fn from_fn_with_config<F>(
        name: impl Into<String>,
        config: QueueConfig,
        populate: F,
    ) -> Arc<Self>
    where
        F: Fn(&OperationQueue) -> Result<()> + Send + Sync + 'static,
    {
        Self::with_config(name, config, FnWork(populate))
    }

    /// Number of children currently held
    pub fn child_count(&self) -> usize {
        self.children.operation_count()
    }
}

impl Operation for GroupOperation {
    fn id(&self) -> OperationId {
        self.op.id()
    }

    fn name(&self) -> &str {
        self.op.name()
    }

    fn start(&self) {
        self.op.start();
    }

    /// Cancel the group, its current children and any child added later
    fn cancel(&self) {
        self.op.cancel();
        self.children.cancel_all();
    }

    fn is_cancelled(&self) -> bool {
        self.op.is_cancelled()
    }

    /// Abort the group and release its children so they drain as cancelled
    fn abort(&self, error: OperationError) {
        self.op.abort(error);
        self.children.cancel_all();
        self.children.resume();
    }

    fn state(&self) -> LifecycleState {
        self.op.state()
    }

    fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.op.subscribe()
    }

    fn as_result(&self) -> Option<&dyn ResultOperation> {
        Some(self)
    }
}

impl ResultOperation for GroupOperation {
    fn error(&self) -> Option<OperationError> {
        self.op.error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync_operation::SyncOperation;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::timeout;

    async fn run(group: Arc<GroupOperation>) -> Option<OperationError> {
        let queue = OperationQueue::named("root");
        let mut state = group.subscribe();
        queue.add(group.clone()).unwrap();
        timeout(Duration::from_secs(5), state.wait_for(LifecycleState::is_finished))
            .await
            .expect("group should finish")
            .unwrap();
        group.error()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_empty_group_succeeds_immediately() {
        let group = GroupOperation::from_fn("empty", |_| Ok(()));
        assert!(run(group.clone()).await.is_none());
        assert!(group.is_finished());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_populate_error_comes_first_and_cancels_children() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let group = GroupOperation::from_fn("broken", move |children| {
            let flag = flag.clone();
            children.add(SyncOperation::from_fn("never", move |_| {
                flag.store(true, Ordering::SeqCst);
            }))?;
            Err(OperationError::msg("bad plan"))
        });

        let err = run(group).await.expect("group should fail");
        let aggregate = err.as_aggregate().expect("aggregate error");
        assert_eq!(aggregate.len(), 2);
        assert_eq!(aggregate.errors()[0].to_string(), "bad plan");
        assert!(aggregate.errors()[1].is_cancelled());
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancelled_group_never_populates() {
        let populated = Arc::new(AtomicBool::new(false));
        let flag = populated.clone();
        let group = GroupOperation::from_fn("cancelled", move |_| {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });

        group.cancel();
        let err = run(group).await;

        assert!(err.is_some_and(|e| e.is_cancelled()));
        assert!(!populated.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_group_hook_runs_once_after_children() {
        struct Counting {
            finished_children: Arc<AtomicUsize>,
            seen_at_finish: Arc<AtomicUsize>,
        }

        impl GroupWork for Counting {
            fn populate(&self, children: &OperationQueue) -> Result<()> {
                for idx in 0..3 {
                    let finished = self.finished_children.clone();
                    children.add(SyncOperation::from_fn(format!("child-{idx}"), move |_| {
                        finished.fetch_add(1, Ordering::SeqCst);
                    }))?;
                }
                Ok(())
            }

            fn on_will_finish(&self) {
                let done = self.finished_children.load(Ordering::SeqCst);
                self.seen_at_finish.fetch_add(done, Ordering::SeqCst);
            }
        }

        let finished_children = Arc::new(AtomicUsize::new(0));
        let seen_at_finish = Arc::new(AtomicUsize::new(0));
        let group = GroupOperation::new(
            "counting",
            Counting {
                finished_children: finished_children.clone(),
                seen_at_finish: seen_at_finish.clone(),
            },
        );

        assert!(run(group.clone()).await.is_none());
        assert_eq!(seen_at_finish.load(Ordering::SeqCst), 3);
        assert_eq!(group.child_count(), 0);
    }
}
