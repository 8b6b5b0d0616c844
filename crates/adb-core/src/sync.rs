//! File transfers over `adb push` / `adb pull`.
//!
//! Output lines are classified as they arrive: progress first, then error. Anything else is
//! noise. Only the last non-blank line may be the summary; a stream that ends on anything
//! else is an incomplete transfer, whatever the exit code says.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::device::DeviceSession;
use crate::error::AdbError;
use crate::process::{CommandRunner, OutputStreams};
use crate::progress::ProgressSink;
use crate::protocol::{SyncUpdate, TransferStats, parse_transfer_error, parse_transfer_progress, parse_transfer_stats};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransferDirection {
    /// Host to device.
    Push,
    /// Device to host.
    Pull,
}

impl TransferDirection {
    fn arguments(self) -> &'static [&'static str] {
        match self {
            Self::Push => &["push"],
            // Keep timestamps and modes of pulled files
            Self::Pull => &["pull", "-a"],
        }
    }
}

impl<R: CommandRunner> DeviceSession<R> {
    /// Copies `source` to `target`, appending progress and error records to `sink` in
    /// arrival order.
    ///
    /// A partially written target is left as it is on failure or cancellation.
    pub async fn transfer<P: From<SyncUpdate>>(
        &self,
        direction: TransferDirection,
        source: &str,
        target: &str,
        sink: &ProgressSink<P>,
        cancel: &CancellationToken,
    ) -> Result<TransferStats, AdbError> {
        let args = self.device_command(
            direction
                .arguments()
                .iter()
                .map(|a| a.to_string())
                .chain([source.to_string(), target.to_string()]),
        );
        let mut lines = self.runner().run_streaming(&args, OutputStreams::Merged, cancel).await?;
        info!("Transfer started: {:?} {} -> {}", direction, source, target);

        let mut last_line: Option<String> = None;
        let mut error_count = 0usize;
        while let Some(line) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            if let Some(progress) = parse_transfer_progress(&line) {
                sink.push(SyncUpdate::Progress(progress).into());
            } else if let Some(error) = parse_transfer_error(&line) {
                warn!("Transfer error in {}: {}", lines.command(), error.message);
                error_count += 1;
                sink.push(SyncUpdate::Error(error).into());
            } else {
                debug!("Ignoring transfer output line: {:?}", line);
            }
            last_line = Some(line);
        }

        if lines.is_cancelled() {
            info!("Transfer cancelled: {} -> {}", source, target);
            return Err(AdbError::cancelled(lines.command()));
        }

        let command = lines.command().to_string();
        let exit_code = lines.exit_code().await;
        match last_line.as_deref().and_then(parse_transfer_stats) {
            Some(stats) => {
                info!(
                    "Transfer finished: {} -> {}, {} files, {} bytes in {:?} ({} errors, exit {:?})",
                    source, target, stats.files_transferred, stats.total_bytes, stats.elapsed, error_count, exit_code
                );
                Ok(stats)
            }
            None => {
                warn!(
                    "`{}` ended without a summary (exit {:?}), last line: {:?}",
                    command, exit_code, last_line
                );
                Err(AdbError::TransferIncomplete {
                    source: source.to_string(),
                    target: target.to_string(),
                    last_line,
                })
            }
        }
    }
}
