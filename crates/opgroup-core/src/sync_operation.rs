/*
[INPUT]:  SyncWork body, cancellation flag, finish calls from inside the body
[OUTPUT]: Operation that runs its body on the calling thread and finishes when it returns
[POS]:    Synchronous completion operation - uniform finish/cancel contract for blocking work
[UPDATE]: When synchronous completion or cancellation semantics change
*/

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::error::OperationError;
use crate::lifecycle::Lifecycle;
use crate::operation::{LifecycleState, Operation, OperationId, ResultOperation};

/// Body of a synchronous operation.
pub trait SyncWork: Send + Sync + 'static {
    /// Perform the work. Failures are reported through `op.finish`.
    fn main(&self, op: &SyncHandle<'_>);
}

/// View of a running synchronous operation handed to its body.
pub struct SyncHandle<'a> {
    op: &'a SyncOperation,
}

impl SyncHandle<'_> {
    /// Record the outcome. Only the first error is kept.
    pub fn finish(&self, error: Option<OperationError>) {
        self.op.finish(error);
    }

    pub fn finish_cancelled(&self) {
        self.op.finish_cancelled();
    }

    pub fn is_cancelled(&self) -> bool {
        self.op.lifecycle.is_cancelled()
    }

    pub fn name(&self) -> &str {
        &self.op.name
    }
}

struct FnWork<F>(F);

impl<F> SyncWork for FnWork<F>
where
    F: Fn(&SyncHandle<'_>) + Send + Sync + 'static,
{
    fn main(&self, op: &SyncHandle<'_>) {
        (self.0)(op)
    }
}

/// Operation whose work runs synchronously inside `start`.
pub struct SyncOperation {
    id: OperationId,
    name: String,
    lifecycle: Lifecycle,
    work: Box<dyn SyncWork>,
}

impl SyncOperation {
    pub fn new<W: SyncWork>(name: impl Into<String>, work: W) -> Arc<Self> {
        Arc::new(Self {
            id: OperationId::new(),
            name: name.into(),
            lifecycle: Lifecycle::new(),
            work: Box::new(work),
        })
    }

    pub fn from_fn<F>(name: impl Into<String>, f: F) -> Arc<Self>
    where
        F: Fn(&SyncHandle<'_>) + Send + Sync + 'static,
    {
        Self::new(name, FnWork(f))
    }

    /// Record the outcome. Idempotent: an already recorded error is kept.
    pub fn finish(&self, error: Option<OperationError>) {
        self.lifecycle.record_error(error);
    }

    pub fn finish_cancelled(&self) {
        self.finish(Some(OperationError::Cancelled));
    }
}

impl Operation for SyncOperation {
    fn id(&self) -> OperationId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn start(&self) {
        if !self.lifecycle.begin() {
            error!(operation = %self.name, id = %self.id, "start called twice, ignoring");
            return;
        }

        if self.lifecycle.is_cancelled() {
            debug!(operation = %self.name, id = %self.id, "cancelled before start");
            self.finish_cancelled();
        } else {
            debug!(operation = %self.name, id = %self.id, "operation started");
            self.work.main(&SyncHandle { op: self });
        }

        self.lifecycle.claim_finish(None);
        self.lifecycle.publish_finished();
        debug!(
            operation = %self.name,
            id = %self.id,
            failed = self.lifecycle.error().is_some(),
            "operation finished"
        );
    }

    fn cancel(&self) {
        self.lifecycle.cancel();
    }

    fn is_cancelled(&self) -> bool {
        self.lifecycle.is_cancelled()
    }

    fn abort(&self, error: OperationError) {
        if self.lifecycle.abort(error) {
            warn!(operation = %self.name, id = %self.id, "operation aborted");
        }
    }

    fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.lifecycle.subscribe()
    }

    fn as_result(&self) -> Option<&dyn ResultOperation> {
        Some(self)
    }
}

impl ResultOperation for SyncOperation {
    fn error(&self) -> Option<OperationError> {
        self.lifecycle.error()
    }
}
