//! Error types for the device transport and file-operation engine.

/// Errors surfaced by the engine.
///
/// Parser-level mismatches in lenient contexts (sync progress/error lines) never become
/// errors; everything else ends up here and, for queued work, in the operation's
/// `Failed` status.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum AdbError {
    /// The tool could not be started, or a buffered call exited non-zero.
    Transport {
        command: String,
        message: String,
        exit_code: Option<i32>,
    },
    /// An output line violated the grammar of a strict context (directory listing).
    Protocol { command: String, line: String },
    /// A transfer stream ended without a recognizable summary line.
    TransferIncomplete {
        source: String,
        target: String,
        last_line: Option<String>,
    },
    /// Operation contract violation, such as starting an already running operation.
    InvalidState { operation_id: String, status: String },
    /// The call observed its cancellation token and terminated the child process.
    Cancelled { command: String },
}

impl AdbError {
    pub(crate) fn transport(command: &str, message: impl Into<String>) -> Self {
        Self::Transport {
            command: command.to_string(),
            message: message.into(),
            exit_code: None,
        }
    }

    pub(crate) fn cancelled(command: &str) -> Self {
        Self::Cancelled {
            command: command.to_string(),
        }
    }

    /// Returns true if this error only records that the caller cancelled the work.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Returns a user-friendly message for this error.
    pub fn user_message(&self) -> String {
        match self {
            Self::Transport { message, exit_code, .. } => match exit_code {
                Some(code) if message.is_empty() => format!("The device tool failed (exit code {code})."),
                Some(code) => format!("{message} (exit code {code})"),
                None => format!("Couldn't run the device tool: {message}"),
            },
            Self::Protocol { line, .. } => {
                format!("The device sent output we couldn't understand: \"{line}\". Try reconnecting.")
            }
            Self::TransferIncomplete { source, .. } => {
                format!("The transfer of {source} ended before it finished. The target may be incomplete.")
            }
            Self::InvalidState { status, .. } => format!("The operation can't do that while it's {status}."),
            Self::Cancelled { .. } => "The operation was cancelled.".to_string(),
        }
    }
}

impl std::fmt::Display for AdbError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport {
                command,
                message,
                exit_code: Some(code),
            } => write!(f, "Transport error in `{command}` (exit code {code}): {message}"),
            Self::Transport { command, message, .. } => write!(f, "Transport error in `{command}`: {message}"),
            Self::Protocol { command, line } => write!(f, "Protocol error in `{command}`: unexpected line {line:?}"),
            Self::TransferIncomplete { source, target, .. } => {
                write!(f, "Transfer incomplete: {source} -> {target}")
            }
            Self::InvalidState { operation_id, status } => {
                write!(f, "Invalid state for operation {operation_id}: {status}")
            }
            Self::Cancelled { command } => write!(f, "Cancelled: `{command}`"),
        }
    }
}

impl std::error::Error for AdbError {}
