/*
[INPUT]:  Concrete operation types (sync, async, group, block)
[OUTPUT]: Operation contract driven by the queue, ResultOperation capability, LifecycleState
[POS]:    Domain contract - what a host container needs from every operation
[UPDATE]: When the queue needs new observable properties from operations
*/

use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error};
use uuid::Uuid;

use crate::error::OperationError;
use crate::lifecycle::Lifecycle;

/// Unique identifier for an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperationId(Uuid);

impl OperationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of an operation.
///
/// ```text
/// NotStarted -> Running -> Finished
/// ```
///
/// Transitions only move forward. `Finished` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    NotStarted,
    Running,
    Finished,
}

impl LifecycleState {
    pub fn is_executing(&self) -> bool {
        matches!(self, Self::Running)
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Finished)
    }
}

/// An operation that carries at most one terminal error.
pub trait ResultOperation {
    /// Terminal error, meaningful once the operation is finished
    fn error(&self) -> Option<OperationError>;
}

/// Contract between an operation and the container that runs it.
pub trait Operation: Send + Sync + 'static {
    fn id(&self) -> OperationId;

    fn name(&self) -> &str;

    /// Entry point invoked once by the container
    fn start(&self);

    /// Mark the operation cancelled. Observed at `start`.
    fn cancel(&self);

    fn is_cancelled(&self) -> bool;

    /// Move straight to `Finished` with `error` unless an error is already
    /// recorded. Called by the container when `start` panics.
    fn abort(&self, error: OperationError);

    fn state(&self) -> LifecycleState;

    fn is_executing(&self) -> bool {
        self.state().is_executing()
    }

    fn is_finished(&self) -> bool {
        self.state().is_finished()
    }

    /// Receiver notified on every state transition
    fn subscribe(&self) -> watch::Receiver<LifecycleState>;

    /// The error capability, if this operation exposes one
    fn as_result(&self) -> Option<&dyn ResultOperation> {
        None
    }
}

impl fmt::Debug for dyn Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

/// Harvest the terminal error of any operation, if it exposes one.
pub fn operation_error(op: &dyn Operation) -> Option<OperationError> {
    op.as_result().and_then(|result| result.error())
}

type BlockFn = Box<dyn Fn() + Send + Sync>;

/// Closure operation without an error slot.
///
/// Runs the closure synchronously inside `start`. Its outcome cannot be
/// harvested by a group.
pub struct BlockOperation {
    id: OperationId,
    name: String,
    lifecycle: Lifecycle,
    block: BlockFn,
}

impl BlockOperation {
    pub fn new<F>(name: impl Into<String>, block: F) -> Arc<Self>
    where
        F: Fn() + Send + Sync + 'static,
    {
        Arc::new(Self {
            id: OperationId::new(),
            name: name.into(),
            lifecycle: Lifecycle::new(),
            block: Box::new(block),
        })
    }
}

impl Operation for BlockOperation {
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
        if !self.lifecycle.is_cancelled() {
            (self.block)();
        } else {
            debug!(operation = %self.name, id = %self.id, "block skipped, cancelled before start");
        }
        self.lifecycle.claim_finish(None);
        self.lifecycle.publish_finished();
    }

    fn cancel(&self) {
        self.lifecycle.cancel();
    }

    fn is_cancelled(&self) -> bool {
        self.lifecycle.is_cancelled()
    }

    fn abort(&self, error: OperationError) {
        self.lifecycle.abort(error);
    }

    fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.lifecycle.subscribe()
    }
}
