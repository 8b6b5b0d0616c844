//! Per-operation state machine.
//!
//! All transitions go through one mutex, so `cancel` and `finish` can't interleave: once a
//! cancel was accepted, a later `finish` records `Canceled` whatever the work returned.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::sync::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::types::{OperationKind, OperationOutput, OperationProgress, OperationRequest, OperationStatus, OperationSummary};
use crate::error::AdbError;
use crate::ignore_poison::IgnorePoison;
use crate::progress::{ProgressSink, ProgressSubscription};

struct StateCell {
    status: OperationStatus,
    cancel_requested: bool,
    result: Option<Result<OperationOutput, AdbError>>,
}

/// A unit of queued, cancellable work.
///
/// Callers observe it; only the queue drives it.
pub struct Operation {
    id: String,
    request: OperationRequest,
    created_at: DateTime<Utc>,
    state: Mutex<StateCell>,
    /// Mirrors `state.status` for observers that want to await changes.
    status_tx: watch::Sender<OperationStatus>,
    cancel: CancellationToken,
    progress: ProgressSink<OperationProgress>,
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.id)
            .field("request", &self.request)
            .field("status", &self.status())
            .finish()
    }
}

impl Operation {
    pub(crate) fn new(request: OperationRequest) -> Self {
        let (status_tx, _) = watch::channel(OperationStatus::Waiting);
        Self {
            id: Uuid::new_v4().to_string(),
            request,
            created_at: Utc::now(),
            state: Mutex::new(StateCell {
                status: OperationStatus::Waiting,
                cancel_requested: false,
                result: None,
            }),
            status_tx,
            cancel: CancellationToken::new(),
            progress: ProgressSink::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> OperationKind {
        self.request.kind()
    }

    pub fn request(&self) -> &OperationRequest {
        &self.request
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn status(&self) -> OperationStatus {
        self.state.lock_ignore_poison().status.clone()
    }

    /// Receives every status change.
    pub fn subscribe_status(&self) -> watch::Receiver<OperationStatus> {
        self.status_tx.subscribe()
    }

    /// Progress records from the start of the operation, then new ones as they arrive.
    pub fn subscribe_progress(&self) -> ProgressSubscription<OperationProgress> {
        self.progress.subscribe()
    }

    pub fn progress_snapshot(&self) -> Vec<OperationProgress> {
        self.progress.snapshot()
    }

    /// The outcome, once the operation is terminal. `None` for canceled operations.
    pub fn result(&self) -> Option<Result<OperationOutput, AdbError>> {
        self.state.lock_ignore_poison().result.clone()
    }

    pub fn summary(&self) -> OperationSummary {
        OperationSummary {
            operation_id: self.id.clone(),
            kind: self.kind(),
            status: self.status(),
            description: self.request.description(),
            progress_count: self.progress.len(),
            created_at: self.created_at,
        }
    }

    /// Waits until the operation is terminal and returns its final status.
    pub async fn wait(&self) -> OperationStatus {
        let mut rx = self.status_tx.subscribe();
        let waited = rx.wait_for(OperationStatus::is_terminal).await.map(|status| status.clone());
        waited.unwrap_or_else(|_| self.status())
    }

    /// Moves `Waiting` to `InProgress` and hands out the token the work must observe.
    pub(crate) fn start(&self) -> Result<CancellationToken, AdbError> {
        let mut state = self.state.lock_ignore_poison();
        if state.status != OperationStatus::Waiting {
            warn!("Operation {} can't start while {}", self.id, state.status.label());
            return Err(self.invalid_state(&state.status));
        }
        self.set_status(&mut state, OperationStatus::InProgress);
        info!("Operation {} started: {}", self.id, self.request.description());
        Ok(self.cancel.clone())
    }

    /// Requests cancellation of a running operation. The work stops promptly and the
    /// operation ends as `Canceled`.
    pub fn cancel(&self) -> Result<(), AdbError> {
        let mut state = self.state.lock_ignore_poison();
        if state.status != OperationStatus::InProgress {
            debug!("Ignoring cancel of operation {} while {}", self.id, state.status.label());
            return Err(self.invalid_state(&state.status));
        }
        state.cancel_requested = true;
        drop(state);
        info!("Operation {} cancellation requested", self.id);
        self.cancel.cancel();
        Ok(())
    }

    /// Records the outcome of the work and moves to a terminal status.
    pub(crate) fn finish(&self, result: Result<OperationOutput, AdbError>) {
        let mut state = self.state.lock_ignore_poison();
        if state.status != OperationStatus::InProgress {
            warn!("Operation {} finished while {}, ignoring result", self.id, state.status.label());
            return;
        }

        let status = match &result {
            _ if state.cancel_requested => OperationStatus::Canceled,
            Err(e) if e.is_cancellation() => OperationStatus::Canceled,
            Ok(_) => OperationStatus::Completed,
            Err(e) => OperationStatus::Failed {
                message: e.user_message(),
            },
        };
        match &status {
            OperationStatus::Failed { message } => warn!("Operation {} failed: {}", self.id, message),
            other => info!("Operation {} {}", self.id, other.label()),
        }
        if status != OperationStatus::Canceled {
            state.result = Some(result);
        }
        self.set_status(&mut state, status);
        drop(state);
        self.progress.close();
    }

    pub(crate) fn progress_sink(&self) -> &ProgressSink<OperationProgress> {
        &self.progress
    }

    fn set_status(&self, state: &mut StateCell, status: OperationStatus) {
        state.status = status.clone();
        self.status_tx.send_replace(status);
    }

    fn invalid_state(&self, status: &OperationStatus) -> AdbError {
        AdbError::InvalidState {
            operation_id: self.id.clone(),
            status: status.label().to_string(),
        }
    }
}
