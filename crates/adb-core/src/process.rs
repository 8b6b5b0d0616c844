//! Process runner: spawns the device tool and captures its output.
//!
//! Two flavors:
//! - `run` buffers stdout/stderr and returns them once the process exits.
//! - `run_streaming` hands back a `LineStream` that yields output lines as the child emits them.
//!
//! Both honor a `CancellationToken` by killing the child. Every call is one OS process.

use log::{debug, info, warn};
use std::future::Future;
use std::io::{self, PipeReader, Read};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::AdbError;
use crate::ignore_poison::IgnorePoison;

/// Lines buffered between the reader tasks and the consumer before the child is throttled.
const LINE_CHANNEL_CAPACITY: usize = 256;

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// How long output may keep flowing after the child exited. Past this, whatever still holds
/// the pipes open (usually a grandchild) is left behind and the stream ends.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Characters that carry meaning in the device shell and get a backslash in front of them.
const SHELL_SPECIAL_CHARS: &[char] = &[
    '(', ')', '<', '>', '|', ';', '&', '*', '\\', '~', '"', '\'', ' ', '$', '`',
];

/// Captured result of a buffered call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Turns a non-zero exit into a `Transport` error carrying stderr (or stdout, when the
    /// tool reported its failure there).
    pub fn check(self, command: &str) -> Result<Self, AdbError> {
        if self.success() {
            return Ok(self);
        }
        let message = if self.stderr.trim().is_empty() {
            self.stdout.trim().to_string()
        } else {
            self.stderr.trim().to_string()
        };
        warn!("`{}` failed: exit={:?}, message={}", command, self.exit_code, message);
        Err(AdbError::Transport {
            command: command.to_string(),
            message,
            exit_code: self.exit_code,
        })
    }
}

/// Which output streams a streaming call turns into lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStreams {
    /// stdout and stderr share one pipe, so lines come out in the order the child wrote
    /// them. Sync output needs this: errors go to stderr, progress and summary to stdout.
    Merged,
    /// Only stdout becomes lines. stderr is collected on the side (see `LineStream::stderr`),
    /// so tool chatter such as daemon start-up notices can't reach a strict parser.
    StdoutOnly,
}

/// Lazy, single-pass sequence of output lines from one child process.
///
/// Lines arrive in emission order. Cancelling the token the stream was created with kills
/// the child and ends the sequence; lines still buffered at that point are dropped.
pub struct LineStream {
    command: String,
    rx: mpsc::Receiver<String>,
    cancel: CancellationToken,
    /// Cancelled when the child exited but its pipes stayed open past the drain timeout.
    detached: CancellationToken,
    stderr: Arc<Mutex<Vec<u8>>>,
    exit: Option<oneshot::Receiver<Option<i32>>>,
}

impl LineStream {
    /// Builds a stream over already known lines. Used by runners that don't spawn a process.
    pub fn from_lines<I, S>(command: &str, lines: I, cancel: &CancellationToken) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let lines: Vec<String> = lines.into_iter().map(Into::into).collect();
        let (tx, rx) = mpsc::channel(lines.len().max(1));
        for line in lines {
            // Capacity matches the line count, so this can't fail
            let _ = tx.try_send(line);
        }
        Self::from_receiver(command, rx, cancel)
    }

    /// Builds a stream fed by an existing channel. It ends when every sender is dropped.
    pub(crate) fn from_receiver(command: &str, rx: mpsc::Receiver<String>, cancel: &CancellationToken) -> Self {
        Self {
            command: command.to_string(),
            rx,
            cancel: cancel.clone(),
            detached: CancellationToken::new(),
            stderr: Arc::default(),
            exit: None,
        }
    }

    /// Sets what `stderr` reports.
    pub fn with_stderr(self, stderr: &str) -> Self {
        self.stderr.lock_ignore_poison().extend_from_slice(stderr.as_bytes());
        self
    }

    /// Sets what `exit_code` reports. Defaults to a clean exit.
    pub fn with_exit_code(mut self, exit_code: Option<i32>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(exit_code);
        self.exit = Some(rx);
        self
    }

    /// The command line this stream belongs to, for diagnostics.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Returns the next line, or `None` once the process finished or the call was cancelled.
    pub async fn next_line(&mut self) -> Option<String> {
        let received = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            line = self.rx.recv() => Some(line),
            _ = self.detached.cancelled() => None,
        };
        match received {
            Some(line) => line,
            None => {
                self.rx.close();
                None
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// stderr collected so far. Always empty for `OutputStreams::Merged` calls, whose stderr
    /// is part of the line sequence.
    pub fn stderr(&self) -> String {
        String::from_utf8_lossy(&self.stderr.lock_ignore_poison()).into_owned()
    }

    /// Discards the remaining lines, waits for the child to exit and returns its exit code.
    ///
    /// A non-zero code is not an error for streaming calls; callers look at the last lines
    /// for a protocol-level error record instead.
    pub async fn exit_code(&mut self) -> Option<i32> {
        self.rx.close();
        while self.rx.recv().await.is_some() {}
        match self.exit.take() {
            Some(exit) => exit.await.ok().flatten(),
            None => Some(0),
        }
    }
}

/// Seam between the engine and the external tool.
pub trait CommandRunner: Send + Sync + 'static {
    /// Runs the tool to completion and captures its output. Never fails on a non-zero exit;
    /// use `CommandOutput::check` for that.
    fn run(
        &self,
        args: &[String],
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<CommandOutput, AdbError>> + Send;

    /// Starts the tool and returns its output as a line stream.
    fn run_streaming(
        &self,
        args: &[String],
        streams: OutputStreams,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<LineStream, AdbError>> + Send;

    /// Human-readable command line for logs and error messages.
    fn describe(&self, args: &[String]) -> String {
        describe_command("adb", args)
    }
}

/// Runs the real executable with `tokio::process`.
#[derive(Debug, Clone)]
pub struct AdbProcess {
    program: PathBuf,
}

impl AdbProcess {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn spawn_error(&self, command: &str, e: io::Error) -> AdbError {
        AdbError::transport(command, format!("Failed to start {}: {e}", self.program.display()))
    }
}

impl CommandRunner for AdbProcess {
    async fn run(&self, args: &[String], cancel: &CancellationToken) -> Result<CommandOutput, AdbError> {
        let command = self.describe(args);
        debug!("Running {}", command);

        let child = self.command(args).spawn().map_err(|e| self.spawn_error(&command, e))?;

        // Dropping `child` on cancellation kills it (kill_on_drop)
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Cancelled {}", command);
                Err(AdbError::cancelled(&command))
            }
            output = child.wait_with_output() => {
                let output = output.map_err(|e| AdbError::transport(&command, format!("Failed to read output: {e}")))?;
                let result = CommandOutput {
                    exit_code: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                };
                debug!("{} exited with {:?}", command, result.exit_code);
                Ok(result)
            }
        }
    }

    async fn run_streaming(
        &self,
        args: &[String],
        streams: OutputStreams,
        cancel: &CancellationToken,
    ) -> Result<LineStream, AdbError> {
        let command = self.describe(args);
        debug!("Streaming {} ({:?})", command, streams);

        let (tx, rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        let stderr: Arc<Mutex<Vec<u8>>> = Arc::default();
        let (mut child, mut readers) = match streams {
            OutputStreams::Merged => {
                let (reader, writer) = io::pipe()
                    .map_err(|e| AdbError::transport(&command, format!("Failed to create output pipe: {e}")))?;
                let stderr_writer = writer
                    .try_clone()
                    .map_err(|e| AdbError::transport(&command, format!("Failed to create output pipe: {e}")))?;
                let mut cmd = self.command(args);
                cmd.stdout(writer).stderr(stderr_writer);
                let child = cmd.spawn().map_err(|e| self.spawn_error(&command, e))?;
                // The reader only sees EOF once our copies of the write end are gone
                drop(cmd);
                let reader_tx = tx.clone();
                let reader_task = tokio::task::spawn_blocking(move || pump_pipe_lines(reader, reader_tx));
                (child, vec![reader_task])
            }
            OutputStreams::StdoutOnly => {
                let mut child = self.command(args).spawn().map_err(|e| self.spawn_error(&command, e))?;
                let mut readers = Vec::with_capacity(2);
                if let Some(out) = child.stdout.take() {
                    readers.push(tokio::spawn(pump_lines(out, tx.clone())));
                }
                if let Some(err) = child.stderr.take() {
                    readers.push(tokio::spawn(collect_output(err, Arc::clone(&stderr))));
                }
                (child, readers)
            }
        };
        drop(tx);

        let (exit_tx, exit_rx) = oneshot::channel();
        let detached = CancellationToken::new();
        let task_detached = detached.clone();
        let task_cancel = cancel.clone();
        let task_command = command.clone();
        tokio::spawn(async move {
            let finished = tokio::select! {
                biased;
                _ = task_cancel.cancelled() => None,
                status = child.wait() => Some(status.ok().and_then(|s| s.code())),
            };
            let exit_code = match finished {
                Some(code) => code,
                None => {
                    info!("Cancelled {}, killing child", task_command);
                    if let Err(e) = child.kill().await {
                        warn!("Failed to kill {}: {}", task_command, e);
                    }
                    None
                }
            };
            if task_cancel.is_cancelled() {
                // Grandchildren of a killed child may still hold the pipes open
                abort_readers(&readers);
            } else {
                let drain = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, async {
                    for reader in readers.iter_mut() {
                        let _ = reader.await;
                    }
                })
                .await;
                if drain.is_err() {
                    warn!("{} exited but its output is still open, detaching", task_command);
                    abort_readers(&readers);
                    task_detached.cancel();
                }
            }
            debug!("{} exited with {:?}", task_command, exit_code);
            let _ = exit_tx.send(exit_code);
        });

        Ok(LineStream {
            command,
            rx,
            cancel: cancel.clone(),
            detached,
            stderr,
            exit: Some(exit_rx),
        })
    }

    fn describe(&self, args: &[String]) -> String {
        describe_command(&self.program.to_string_lossy(), args)
    }
}

pub(crate) fn describe_command(program: &str, args: &[String]) -> String {
    if args.is_empty() {
        return program.to_string();
    }
    format!("{} {}", program, args.join(" "))
}

/// Blocking readers can't be stopped this way; they end when the pipe closes or the line
/// stream is dropped.
fn abort_readers(readers: &[JoinHandle<()>]) {
    for reader in readers {
        reader.abort();
    }
}

/// Reads a pipe and forwards complete lines. Both `\n` and `\r` end a line, since progress
/// output rewrites the current line with carriage returns.
async fn pump_lines<R: AsyncRead + Unpin>(mut reader: R, tx: mpsc::Sender<String>) {
    let mut pending = Vec::new();
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!("Failed to read child output: {}", e);
                break;
            }
        };
        for line in split_lines(&mut pending, &buf[..n]) {
            if tx.send(line).await.is_err() {
                return;
            }
        }
    }
    if !pending.is_empty() {
        let _ = tx.send(String::from_utf8_lossy(&pending).into_owned()).await;
    }
}

/// `pump_lines` for the shared stdout/stderr pipe, which is a plain OS pipe and gets read
/// on a blocking thread.
fn pump_pipe_lines(mut reader: PipeReader, tx: mpsc::Sender<String>) {
    let mut pending = Vec::new();
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("Failed to read child output: {}", e);
                break;
            }
        };
        for line in split_lines(&mut pending, &buf[..n]) {
            if tx.blocking_send(line).is_err() {
                return;
            }
        }
    }
    if !pending.is_empty() {
        let _ = tx.blocking_send(String::from_utf8_lossy(&pending).into_owned());
    }
}

/// Appends everything `reader` produces to `sink`.
async fn collect_output<R: AsyncRead + Unpin>(mut reader: R, sink: Arc<Mutex<Vec<u8>>>) {
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => sink.lock_ignore_poison().extend_from_slice(&buf[..n]),
            Err(e) => {
                warn!("Failed to read child stderr: {}", e);
                break;
            }
        }
    }
}

/// Appends `chunk` to `pending` and drains every complete, non-empty line.
fn split_lines(pending: &mut Vec<u8>, chunk: &[u8]) -> Vec<String> {
    let mut lines = Vec::new();
    for &byte in chunk {
        if byte == b'\n' || byte == b'\r' {
            if !pending.is_empty() {
                lines.push(String::from_utf8_lossy(pending).into_owned());
                pending.clear();
            }
        } else {
            pending.push(byte);
        }
    }
    lines
}

/// Escapes a string for use as one argument of a device shell command line.
///
/// Only needed for arguments that travel through `adb shell`; local process arguments
/// are passed as-is.
pub fn escape_shell_string(s: &str) -> String {
    let mut escaped = String::with_capacity(s.len());
    for c in s.chars() {
        if SHELL_SPECIAL_CHARS.contains(&c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
