/*
[INPUT]:  Test scenarios needing timed children and a root queue
[OUTPUT]: Shared helpers for building delayed operations and awaiting completion
[POS]:    Test infrastructure - shared across integration test modules
[UPDATE]: When adding new operation fixtures
*/

//! Common test utilities for opgroup-core tests

use std::sync::Arc;
use std::time::Duration;

use opgroup_core::{AsyncOperation, LifecycleState, Operation, OperationError, OperationQueue};
use tokio::time::timeout;

#[allow(dead_code)]
pub const WAIT: Duration = Duration::from_secs(10);

/// Async operation that finishes after `delay_ms` with an optional error
#[allow(dead_code)]
pub fn delayed(name: &str, delay_ms: u64, error: Option<&str>) -> Arc<AsyncOperation> {
    let error = error.map(str::to_string);
    AsyncOperation::from_fn(name, move |op| {
        let op = op.clone();
        let error = error.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            op.finish(error.map(OperationError::msg));
        });
    })
}

/// Submit `op` to a fresh root queue and wait until it is finished
#[allow(dead_code)]
pub async fn run_to_completion(op: Arc<dyn Operation>) {
    let queue = OperationQueue::named("root");
    let mut state = op.subscribe();
    queue.add(op).expect("root queue accepts operation");
    timeout(WAIT, state.wait_for(LifecycleState::is_finished))
        .await
        .expect("operation should finish in time")
        .expect("state channel open");
    timeout(WAIT, queue.wait_until_empty())
        .await
        .expect("root queue should drain");
}

/// Messages of an aggregate error, in order
#[allow(dead_code)]
pub fn messages(err: &OperationError) -> Vec<String> {
    err.as_aggregate()
        .map(|aggregate| aggregate.iter().map(ToString::to_string).collect())
        .unwrap_or_default()
}
