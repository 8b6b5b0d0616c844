//! Operation queue: accepts requests and runs them in background tasks.

use log::{debug, warn};
use std::sync::{Arc, RwLock};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use super::state::Operation;
use super::types::{OperationOutput, OperationProgress, OperationRequest, OperationSummary};
use crate::device::DeviceSession;
use crate::error::AdbError;
use crate::ignore_poison::IgnorePoisonRw;
use crate::process::{AdbProcess, CommandRunner};
use crate::progress::ProgressSubscription;
use crate::sync::TransferDirection;

/// Queue of operations against one device.
///
/// At most `max_concurrent_operations` (from the session's config) run at once; the rest
/// stay `Waiting` until a slot frees up.
pub struct OperationQueue<R: CommandRunner = AdbProcess> {
    session: Arc<DeviceSession<R>>,
    operations: RwLock<Vec<Arc<Operation>>>,
    slots: Arc<Semaphore>,
}

impl<R: CommandRunner> OperationQueue<R> {
    pub fn new(session: Arc<DeviceSession<R>>) -> Self {
        let slots = session.config().max_concurrent_operations.max(1);
        Self {
            session,
            operations: RwLock::new(Vec::new()),
            slots: Arc::new(Semaphore::new(slots)),
        }
    }

    pub fn session(&self) -> &Arc<DeviceSession<R>> {
        &self.session
    }

    /// Adds an operation and schedules it. Must be called from within a Tokio runtime.
    pub fn enqueue(&self, request: OperationRequest) -> Arc<Operation> {
        let operation = Arc::new(Operation::new(request));
        self.operations.write_ignore_poison().push(Arc::clone(&operation));
        debug!("Queued operation {}: {}", operation.id(), operation.request().description());

        let session = Arc::clone(&self.session);
        let slots = Arc::clone(&self.slots);
        let task_operation = Arc::clone(&operation);
        tokio::spawn(async move {
            let Ok(_slot) = slots.acquire_owned().await else {
                warn!("Operation queue closed before {} could run", task_operation.id());
                return;
            };
            let cancel = match task_operation.start() {
                Ok(cancel) => cancel,
                Err(e) => {
                    warn!("Couldn't start operation {}: {}", task_operation.id(), e);
                    return;
                }
            };
            let result = execute(&session, &task_operation, &cancel).await;
            task_operation.finish(result);
        });

        operation
    }

    pub fn get(&self, operation_id: &str) -> Option<Arc<Operation>> {
        self.operations
            .read_ignore_poison()
            .iter()
            .find(|op| op.id() == operation_id)
            .cloned()
    }

    /// Cancels a running operation. Unknown ids and operations that aren't running fail
    /// with `InvalidState`.
    pub fn cancel(&self, operation_id: &str) -> Result<(), AdbError> {
        match self.get(operation_id) {
            Some(operation) => operation.cancel(),
            None => Err(AdbError::InvalidState {
                operation_id: operation_id.to_string(),
                status: "unknown".to_string(),
            }),
        }
    }

    pub fn subscribe_progress(&self, operation_id: &str) -> Option<ProgressSubscription<OperationProgress>> {
        self.get(operation_id).map(|op| op.subscribe_progress())
    }

    /// Every operation still held by the queue, oldest first.
    pub fn operations(&self) -> Vec<Arc<Operation>> {
        self.operations.read_ignore_poison().clone()
    }

    /// Summaries of operations that are waiting or running.
    pub fn active_operations(&self) -> Vec<OperationSummary> {
        self.operations
            .read_ignore_poison()
            .iter()
            .map(|op| op.summary())
            .filter(|summary| !summary.status.is_terminal())
            .collect()
    }

    /// Forgets terminal operations. Returns how many were removed.
    pub fn remove_finished(&self) -> usize {
        let mut operations = self.operations.write_ignore_poison();
        let before = operations.len();
        operations.retain(|op| !op.status().is_terminal());
        before - operations.len()
    }
}

async fn execute<R: CommandRunner>(
    session: &DeviceSession<R>,
    operation: &Operation,
    cancel: &CancellationToken,
) -> Result<OperationOutput, AdbError> {
    match operation.request() {
        OperationRequest::List { path } => {
            let mut listing = session.list_directory(path, cancel).await?;
            let mut entries = Vec::new();
            while let Some(entry) = listing.next_entry().await {
                let entry = entry?;
                operation.progress_sink().push(OperationProgress::Entry(entry.clone()));
                entries.push(entry);
            }
            if cancel.is_cancelled() {
                return Err(AdbError::cancelled(&format!("ls {path}")));
            }
            Ok(OperationOutput::Listing(entries))
        }
        OperationRequest::Pull { source, target } => session
            .transfer(TransferDirection::Pull, source, target, operation.progress_sink(), cancel)
            .await
            .map(OperationOutput::Transfer),
        OperationRequest::Push { source, target } => session
            .transfer(TransferDirection::Push, source, target, operation.progress_sink(), cancel)
            .await
            .map(OperationOutput::Transfer),
        OperationRequest::Install { path, on_device } => session
            .install_package(path, *on_device, cancel)
            .await
            .map(OperationOutput::Package),
        OperationRequest::Uninstall { package } => session
            .uninstall_package(package, cancel)
            .await
            .map(OperationOutput::Package),
        OperationRequest::Rename { from, to } => session
            .rename(from, to, cancel)
            .await
            .map(|()| OperationOutput::Done),
    }
}
