//! Types for queued operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::listing::FileStat;
use crate::protocol::{SyncUpdate, TransferError, TransferProgress, TransferStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    List,
    Pull,
    Push,
    Install,
    Uninstall,
    Rename,
}

/// What to do. Paths on the device are absolute; host paths are passed to the tool as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum OperationRequest {
    List { path: String },
    /// Device to host.
    Pull { source: String, target: String },
    /// Host to device.
    Push { source: String, target: String },
    Install {
        path: String,
        /// The package is already on the device, rather than on the host.
        #[serde(default)]
        on_device: bool,
    },
    Uninstall { package: String },
    Rename { from: String, to: String },
}

impl OperationRequest {
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::List { .. } => OperationKind::List,
            Self::Pull { .. } => OperationKind::Pull,
            Self::Push { .. } => OperationKind::Push,
            Self::Install { .. } => OperationKind::Install,
            Self::Uninstall { .. } => OperationKind::Uninstall,
            Self::Rename { .. } => OperationKind::Rename,
        }
    }

    /// Short description for logs and operation lists.
    pub fn description(&self) -> String {
        match self {
            Self::List { path } => format!("list {path}"),
            Self::Pull { source, target } => format!("pull {source} -> {target}"),
            Self::Push { source, target } => format!("push {source} -> {target}"),
            Self::Install { path, .. } => format!("install {path}"),
            Self::Uninstall { package } => format!("uninstall {package}"),
            Self::Rename { from, to } => format!("rename {from} -> {to}"),
        }
    }
}

/// Operation lifecycle. `Waiting` and `InProgress` are the only non-terminal states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OperationStatus {
    Waiting,
    InProgress,
    Completed,
    Failed {
        /// Human-readable reason, ready for display.
        message: String,
    },
    Canceled,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed { .. } | Self::Canceled)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::InProgress => "in progress",
            Self::Completed => "completed",
            Self::Failed { .. } => "failed",
            Self::Canceled => "canceled",
        }
    }
}

/// One progress record of an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperationProgress {
    /// A listed entry, surfaced before the listing completes.
    Entry(FileStat),
    Transfer(TransferProgress),
    TransferError(TransferError),
}

impl From<SyncUpdate> for OperationProgress {
    fn from(update: SyncUpdate) -> Self {
        match update {
            SyncUpdate::Progress(progress) => Self::Transfer(progress),
            SyncUpdate::Error(error) => Self::TransferError(error),
        }
    }
}

/// What a completed operation produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum OperationOutput {
    Listing(Vec<FileStat>),
    Transfer(TransferStats),
    /// Package manager report, usually "Success".
    Package(String),
    Done,
}

/// Summary of an operation, for operation lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationSummary {
    pub operation_id: String,
    pub kind: OperationKind,
    pub status: OperationStatus,
    pub description: String,
    /// Progress records so far.
    pub progress_count: usize,
    pub created_at: DateTime<Utc>,
}
