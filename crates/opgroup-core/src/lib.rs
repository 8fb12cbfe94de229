/*
[INPUT]:  Crate modules and public type definitions
[OUTPUT]: Public opgroup-core surface
[POS]:    Crate root - module wiring
[UPDATE]: When public modules or exports change
*/

//! Cancellable operations with an explicit lifecycle, and group operations
//! that run child operations to completion and aggregate their failures.
//!
//! ```no_run
//! use opgroup_core::{GroupOperation, Operation, OperationError, OperationQueue, SyncOperation};
//!
//! # async fn demo() {
//! let group = GroupOperation::from_fn("backup", |children| {
//!     children.add(SyncOperation::from_fn("copy", |op| {
//!         op.finish(Some(OperationError::msg("disk-full")));
//!     }))?;
//!     Ok(())
//! });
//!
//! let queue = OperationQueue::named("main");
//! queue.add(group.clone()).unwrap();
//! queue.wait_until_empty().await;
//! assert!(group.is_finished());
//! # }
//! ```

pub mod async_operation;
pub mod config;
pub mod error;
pub mod group;
mod lifecycle;
pub mod operation;
pub mod queue;
pub mod sync_operation;

pub use async_operation::{AsyncOperation, AsyncWork, OperationHandle};
pub use config::QueueConfig;
pub use error::{AggregateError, OperationError, QueueError, Result};
pub use group::{GroupOperation, GroupWork};
pub use operation::{
    BlockOperation, LifecycleState, Operation, OperationId, ResultOperation, operation_error,
};
pub use queue::{MembershipChange, OperationQueue, Subscription, SubscriptionId};
pub use sync_operation::{SyncHandle, SyncOperation, SyncWork};
