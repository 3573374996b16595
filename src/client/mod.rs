//! Client side: a locally declared subscription kept in sync with a server.

mod item;
mod listener;
mod subscription;

pub use item::*;
pub use listener::*;
pub use subscription::*;

use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::service::ServiceFault;
use crate::types::StatusCode;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("subscription has not been created")]
    NotCreated,

    #[error(transparent)]
    Service(#[from] ServiceFault),

    #[error("operation failed: {0}")]
    Operation(StatusCode),

    #[error(transparent)]
    SynchronizationFailed(Box<SynchronizationFailure>),
}

impl ClientError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ClientError::NotCreated => StatusCode::BAD_SUBSCRIPTION_ID_INVALID,
            ClientError::Service(fault) => fault.status_code(),
            ClientError::Operation(status) => *status,
            ClientError::SynchronizationFailed(failure) => failure
                .failed()
                .next()
                .map(|o| o.status())
                .unwrap_or(StatusCode::BAD),
        }
    }
}

/// Outcome of one item in a batched call.
#[derive(Debug, Clone)]
pub struct ItemOutcome {
    pub item: Arc<ClientMonitoredItem>,
    /// Call-level status of the chunk the item was sent in.
    pub service_status: StatusCode,
    /// Per-item status; equal to `service_status` when the chunk faulted.
    pub operation_status: StatusCode,
}

impl ItemOutcome {
    pub fn is_good(&self) -> bool {
        self.service_status.is_good() && self.operation_status.is_good()
    }

    /// The status that decided the outcome.
    pub fn status(&self) -> StatusCode {
        if self.service_status.is_good() {
            self.operation_status
        } else {
            self.service_status
        }
    }
}

/// Results of a chunked operation, one list per chunk, in request order.
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    pub chunks: Vec<Vec<ItemOutcome>>,
}

impl BatchOutcome {
    /// Per-item results across all chunks, in original order.
    pub fn merged(&self) -> impl Iterator<Item = &ItemOutcome> {
        self.chunks.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.chunks.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_good(&self) -> bool {
        self.merged().all(ItemOutcome::is_good)
    }

    pub fn failed(&self) -> impl Iterator<Item = &ItemOutcome> {
        self.merged().filter(|o| !o.is_good())
    }
}

/// Raised when any item failed during synchronization.
///
/// Carries every pass's chunked results so callers can retry exactly the
/// failed items.
#[derive(Debug, Clone, Default)]
pub struct SynchronizationFailure {
    pub create_results: BatchOutcome,
    pub modify_results: BatchOutcome,
    pub delete_results: BatchOutcome,
    pub mode_results: BatchOutcome,
}

impl SynchronizationFailure {
    pub fn failed(&self) -> impl Iterator<Item = &ItemOutcome> {
        self.create_results
            .failed()
            .chain(self.modify_results.failed())
            .chain(self.delete_results.failed())
            .chain(self.mode_results.failed())
    }

    pub fn failed_count(&self) -> usize {
        self.failed().count()
    }

    fn total(&self) -> usize {
        self.create_results.len() + self.modify_results.len() + self.delete_results.len() + self.mode_results.len()
    }
}

impl fmt::Display for SynchronizationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "monitored item synchronization failed for {} of {} operations",
            self.failed_count(),
            self.total()
        )
    }
}

impl std::error::Error for SynchronizationFailure {}
