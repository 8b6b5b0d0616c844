//! Directory listing over `adb ls`.
//!
//! Entries are surfaced one by one while the tool is still running, so a caller can show
//! the first rows of a large folder before the listing completes.

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::device::DeviceSession;
use crate::error::AdbError;
use crate::process::{CommandRunner, LineStream, OutputStreams};
use crate::protocol::{DirectoryEntryLine, parse_directory_entry};

// File-type bits of the packed mode field
const S_IFMT: u32 = 0xF000;
const S_IFSOCK: u32 = 0xC000;
const S_IFLNK: u32 = 0xA000;
const S_IFREG: u32 = 0x8000;
const S_IFBLK: u32 = 0x6000;
const S_IFDIR: u32 = 0x4000;
const S_IFCHR: u32 = 0x2000;
const S_IFIFO: u32 = 0x1000;

/// What a directory entry is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FileKind {
    File,
    Folder,
    /// A link whose target is known to exist. Never produced by the lister itself.
    Link,
    BrokenLink,
    Socket,
    BlockDevice,
    CharDevice,
    Fifo,
    Unknown,
    /// The synthetic `..` row.
    Parent,
}

/// One directory entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStat {
    pub name: String,
    /// Absolute path on the device.
    pub path: String,
    pub kind: FileKind,
    pub size: Option<u64>,
    pub modified: Option<DateTime<Utc>>,
    /// Symlinks come back as `Unknown`; the caller decides whether to follow them.
    pub is_link: bool,
}

impl FileStat {
    /// The `..` entry pointing at the parent of `path`.
    pub fn parent_entry(path: &str) -> Self {
        Self {
            name: "..".to_string(),
            path: parent_path(path),
            kind: FileKind::Parent,
            size: None,
            modified: None,
            is_link: false,
        }
    }

    /// Converts one parsed `ls` line. Fails on file-type bits outside the known table.
    pub fn from_entry(directory: &str, entry: DirectoryEntryLine) -> Result<Self, u32> {
        let (kind, is_link) = kind_from_mode(entry.mode).ok_or(entry.mode)?;
        let has_metadata = entry.mode != 0;
        let modified = if has_metadata && entry.mtime > 0 {
            DateTime::from_timestamp(entry.mtime, 0)
        } else {
            None
        };
        Ok(Self {
            path: join_path(directory, &entry.name),
            name: entry.name,
            kind,
            size: has_metadata.then_some(entry.size),
            modified,
            is_link,
        })
    }
}

/// Maps the file-type bits of `mode` to a kind and a link flag.
pub fn kind_from_mode(mode: u32) -> Option<(FileKind, bool)> {
    let kind = match mode & S_IFMT {
        S_IFSOCK => FileKind::Socket,
        S_IFLNK => return Some((FileKind::Unknown, true)),
        S_IFREG => FileKind::File,
        S_IFBLK => FileKind::BlockDevice,
        S_IFDIR => FileKind::Folder,
        S_IFCHR => FileKind::CharDevice,
        S_IFIFO => FileKind::Fifo,
        0 => FileKind::Unknown,
        _ => return None,
    };
    Some((kind, false))
}

/// A directory listing in progress.
pub struct DirectoryListing {
    directory: String,
    lines: LineStream,
    /// Child of the caller's token, so a protocol failure can stop the tool on its own.
    cancel: CancellationToken,
    caller_cancel: CancellationToken,
    finished: bool,
}

impl DirectoryListing {
    /// The listed directory, without a trailing separator (empty for the root).
    pub fn directory(&self) -> &str {
        &self.directory
    }

    /// Returns the next entry, `None` when the listing ended or was cancelled, a `Protocol`
    /// error for a line that doesn't look like an entry, or a `Transport` error when the tool
    /// exited non-zero. Nothing follows an error.
    pub async fn next_entry(&mut self) -> Option<Result<FileStat, AdbError>> {
        if self.finished {
            return None;
        }
        loop {
            let Some(line) = self.lines.next_line().await else {
                self.finished = true;
                return self.finish().await.err().map(Err);
            };
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }

            let stat = parse_directory_entry(line).and_then(|entry| {
                if entry.name == "." || entry.name == ".." {
                    return Some(None);
                }
                FileStat::from_entry(&self.directory, entry).ok().map(Some)
            });
            match stat {
                Some(Some(stat)) => return Some(Ok(stat)),
                Some(None) => continue,
                None => return Some(Err(self.fail(line))),
            }
        }
    }

    /// Drains the listing. Returns `Cancelled` rather than a partial result when the caller
    /// cancelled midway.
    pub async fn collect(mut self) -> Result<Vec<FileStat>, AdbError> {
        let mut entries = Vec::new();
        while let Some(entry) = self.next_entry().await {
            entries.push(entry?);
        }
        if self.caller_cancel.is_cancelled() {
            return Err(AdbError::cancelled(self.lines.command()));
        }
        debug!("Listed {} entries in {}/", entries.len(), self.directory);
        Ok(entries)
    }

    /// Checks how the tool exited once its stdout ended. stderr only matters on failure.
    async fn finish(&mut self) -> Result<(), AdbError> {
        if self.lines.is_cancelled() {
            return Ok(());
        }
        let exit_code = self.lines.exit_code().await;
        let stderr = self.lines.stderr();
        match exit_code {
            Some(code) if code != 0 => {
                warn!("`{}` failed: exit={}, stderr={}", self.lines.command(), code, stderr.trim());
                Err(AdbError::Transport {
                    command: self.lines.command().to_string(),
                    message: stderr.trim().to_string(),
                    exit_code,
                })
            }
            _ => {
                if !stderr.trim().is_empty() {
                    debug!("`{}` stderr: {}", self.lines.command(), stderr.trim());
                }
                Ok(())
            }
        }
    }

    fn fail(&mut self, line: &str) -> AdbError {
        warn!(
            "Unexpected ls output in {}: {:?} (stderr: {:?})",
            self.lines.command(),
            line,
            self.lines.stderr().trim()
        );
        self.finished = true;
        self.cancel.cancel();
        AdbError::Protocol {
            command: self.lines.command().to_string(),
            line: line.to_string(),
        }
    }
}

impl<R: CommandRunner> DeviceSession<R> {
    /// Starts listing `path`. Fails only if the tool can't be started; per-line failures
    /// come out of the returned stream.
    pub async fn list_directory(&self, path: &str, cancel: &CancellationToken) -> Result<DirectoryListing, AdbError> {
        let directory = path.trim_end_matches('/').to_string();
        let args = self.device_command(["ls".to_string(), format!("{directory}/")]);
        let child_cancel = cancel.child_token();
        let lines = self.runner().run_streaming(&args, OutputStreams::StdoutOnly, &child_cancel).await?;
        Ok(DirectoryListing {
            directory,
            lines,
            cancel: child_cancel,
            caller_cancel: cancel.clone(),
            finished: false,
        })
    }
}

fn join_path(directory: &str, name: &str) -> String {
    format!("{}/{}", directory.trim_end_matches('/'), name)
}

fn parent_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(index) => trimmed[..index].to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedRunner, session};

    fn entry(mode: u32, size: u64, mtime: i64, name: &str) -> DirectoryEntryLine {
        DirectoryEntryLine {
            mode,
            size,
            mtime,
            name: name.to_string(),
        }
    }

    #[test]
    fn test_kind_table() {
        assert_eq!(kind_from_mode(0xC1ED), Some((FileKind::Socket, false)));
        assert_eq!(kind_from_mode(0xA1FF), Some((FileKind::Unknown, true)));
        assert_eq!(kind_from_mode(0x81A4), Some((FileKind::File, false)));
        assert_eq!(kind_from_mode(0x61B0), Some((FileKind::BlockDevice, false)));
        assert_eq!(kind_from_mode(0x41F9), Some((FileKind::Folder, false)));
        assert_eq!(kind_from_mode(0x21B6), Some((FileKind::CharDevice, false)));
        assert_eq!(kind_from_mode(0x11B6), Some((FileKind::Fifo, false)));
        assert_eq!(kind_from_mode(0), Some((FileKind::Unknown, false)));
        assert_eq!(kind_from_mode(0xE000), None);
        assert_eq!(kind_from_mode(0x3000), None);
    }

    #[test]
    fn test_from_entry_file() {
        let stat = FileStat::from_entry("/sdcard", entry(0x81A4, 42, 1_700_000_000, "a.txt")).unwrap();
        assert_eq!(stat.path, "/sdcard/a.txt");
        assert_eq!(stat.kind, FileKind::File);
        assert_eq!(stat.size, Some(42));
        assert_eq!(stat.modified.map(|t| t.timestamp()), Some(1_700_000_000));
        assert!(!stat.is_link);
    }

    #[test]
    fn test_from_entry_zero_mode_has_no_metadata() {
        let stat = FileStat::from_entry("/proc", entry(0, 4096, 1_700_000_000, "secret")).unwrap();
        assert_eq!(stat.kind, FileKind::Unknown);
        assert_eq!(stat.size, None);
        assert_eq!(stat.modified, None);
    }

    #[test]
    fn test_from_entry_zero_time_is_absent() {
        let stat = FileStat::from_entry("", entry(0x41ED, 0, 0, "sdcard")).unwrap();
        assert_eq!(stat.path, "/sdcard");
        assert_eq!(stat.size, Some(0));
        assert_eq!(stat.modified, None);
    }

    #[test]
    fn test_from_entry_rejects_unknown_type_bits() {
        assert_eq!(FileStat::from_entry("/", entry(0xF1FF, 1, 1, "odd")), Err(0xF1FF));
    }

    const DAEMON_NOTICE: &str = "* daemon not running; starting now at tcp:5037\n* daemon started successfully\n";

    async fn list(runner: ScriptedRunner) -> Result<Vec<FileStat>, AdbError> {
        let cancel = CancellationToken::new();
        session(runner).list_directory("/sdcard", &cancel).await?.collect().await
    }

    #[tokio::test]
    async fn test_listing_ignores_stderr_chatter() {
        let runner = ScriptedRunner::new().with_output(
            "ls /sdcard/",
            0,
            "000041f9 00001000 65a1b2c3 .\n000041f9 00001000 65a1b2c3 DCIM\n",
            DAEMON_NOTICE,
        );
        let entries = list(runner).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "DCIM");
    }

    #[tokio::test]
    async fn test_listing_fails_on_non_zero_exit() {
        let runner = ScriptedRunner::new().with_output(
            "ls /sdcard/",
            1,
            "",
            "adb: error: failed to get feature set: device offline\n",
        );
        match list(runner).await {
            Err(AdbError::Transport { message, exit_code, .. }) => {
                assert_eq!(message, "adb: error: failed to get feature set: device offline");
                assert_eq!(exit_code, Some(1));
            }
            other => panic!("Expected transport error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_listing_rejects_malformed_stdout() {
        let runner = ScriptedRunner::new().with_lines("ls /sdcard/", &["000041f9 00001000 65a1b2c3 DCIM", "garbage"]);
        match list(runner).await {
            Err(AdbError::Protocol { line, .. }) => assert_eq!(line, "garbage"),
            other => panic!("Expected protocol error, got {:?}", other),
        }
    }

    #[test]
    fn test_parent_entry() {
        let parent = FileStat::parent_entry("/sdcard/DCIM/Camera/");
        assert_eq!(parent.name, "..");
        assert_eq!(parent.path, "/sdcard/DCIM");
        assert_eq!(parent.kind, FileKind::Parent);

        assert_eq!(FileStat::parent_entry("/sdcard").path, "/");
        assert_eq!(FileStat::parent_entry("/").path, "/");
    }
}
