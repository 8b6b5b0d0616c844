//! Queued operations (listing, transfers, packages, rename) with status and progress.
//!
//! Each operation is a small state machine (`Waiting -> InProgress -> Completed | Failed |
//! Canceled`) with its own progress sink and cancellation token. The queue runs them in
//! background tasks so the caller never blocks; status and progress are pushed to
//! subscribers, and `Operation::wait` suspends until the operation is terminal.

mod queue;
mod state;
mod types;


pub use queue::OperationQueue;
pub use state::Operation;
pub use types::{
    OperationKind, OperationOutput, OperationProgress, OperationRequest, OperationStatus, OperationSummary,
};
