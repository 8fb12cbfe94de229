/*
[INPUT]:  Failure sources (cancellation, caller-supplied work errors, child groups)
[OUTPUT]: OperationError taxonomy, AggregateError, QueueError
[POS]:    Error handling layer - terminal error values for every operation
[UPDATE]: When adding new error sources or changing aggregate formatting
*/

use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Terminal error carried by an operation.
///
/// Cloneable so the error slot can be read any number of times after the
/// operation finished.
#[derive(Error, Debug, Clone)]
pub enum OperationError {
    /// The operation was cancelled by its host before or while running
    #[error("operation was cancelled")]
    Cancelled,

    /// The operation's `start` panicked inside its container
    #[error("operation panicked: {0}")]
    Panicked(String),

    /// Caller-supplied failure described by a message
    #[error("{0}")]
    Message(String),

    /// Caller-supplied failure, passed through unchanged
    #[error("{0}")]
    Source(Arc<dyn std::error::Error + Send + Sync>),

    /// Ordered collection of child failures
    #[error(transparent)]
    Aggregate(AggregateError),
}

impl OperationError {
    /// Create a message error
    pub fn msg(message: impl Into<String>) -> Self {
        OperationError::Message(message.into())
    }

    /// Wrap an arbitrary error without altering it
    pub fn source<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        OperationError::Source(Arc::new(err))
    }

    /// Check if this is the standard cancellation error
    pub fn is_cancelled(&self) -> bool {
        matches!(self, OperationError::Cancelled)
    }

    pub fn is_panicked(&self) -> bool {
        matches!(self, OperationError::Panicked(_))
    }

    /// Borrow the aggregate if this error is one
    pub fn as_aggregate(&self) -> Option<&AggregateError> {
        match self {
            OperationError::Aggregate(aggregate) => Some(aggregate),
            _ => None,
        }
    }
}

impl From<AggregateError> for OperationError {
    fn from(aggregate: AggregateError) -> Self {
        OperationError::Aggregate(aggregate)
    }
}

/// Ordered, append-only collection of child errors.
///
/// Order is the order in which children left their container, not the order
/// in which they were submitted.
#[derive(Debug, Clone, Default)]
pub struct AggregateError {
    errors: Vec<OperationError>,
}

impl AggregateError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, error: OperationError) {
        self.errors.push(error);
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn errors(&self) -> &[OperationError] {
        &self.errors
    }

    pub fn iter(&self) -> std::slice::Iter<'_, OperationError> {
        self.errors.iter()
    }

    pub fn into_inner(self) -> Vec<OperationError> {
        self.errors
    }

    /// Convert into a single error, or `None` when nothing was collected
    pub fn into_error(self) -> Option<OperationError> {
        if self.has_errors() {
            Some(OperationError::Aggregate(self))
        } else {
            None
        }
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errors.len() {
            0 => write!(f, "no errors"),
            1 => write!(f, "1 error: {}", self.errors[0]),
            n => {
                write!(f, "{n} errors: ")?;
                for (idx, err) in self.errors.iter().enumerate() {
                    if idx > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{err}")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for AggregateError {}

impl From<Vec<OperationError>> for AggregateError {
    fn from(errors: Vec<OperationError>) -> Self {
        Self { errors }
    }
}

impl IntoIterator for AggregateError {
    type Item = OperationError;
    type IntoIter = std::vec::IntoIter<OperationError>;

    fn into_iter(self) -> Self::IntoIter {
        self.errors.into_iter()
    }
}

impl<'a> IntoIterator for &'a AggregateError {
    type Item = &'a OperationError;
    type IntoIter = std::slice::Iter<'a, OperationError>;

    fn into_iter(self) -> Self::IntoIter {
        self.errors.iter()
    }
}

/// Errors returned by the host container
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// The queue was sealed after draining and accepts no more operations
    #[error("queue {0} is closed")]
    Closed(String),

    /// The operation already ran or is already held by a queue
    #[error("operation {0} was already enqueued")]
    AlreadyEnqueued(String),
}

impl From<QueueError> for OperationError {
    fn from(err: QueueError) -> Self {
        OperationError::source(err)
    }
}

/// Result type alias for operation bodies
pub type Result<T> = std::result::Result<T, OperationError>;
