//! Tests for the real process runner, using `sh` as a stand-in for the device tool.

use super::config::EngineConfig;
use super::device::DeviceSession;
use super::error::AdbError;
use super::listing::FileKind;
use super::process::{AdbProcess, CommandRunner, OutputStreams, escape_shell_string};
use super::progress::ProgressSink;
use super::protocol::SyncUpdate;
use super::sync::TransferDirection;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn sh() -> AdbProcess {
    init_logger();
    AdbProcess::new("sh")
}

/// Writes an executable stand-in for the device tool. Arguments arrive as
/// `-s <serial> <command> ...`.
fn fake_adb(dir: &tempfile::TempDir, body: &str) -> PathBuf {
    let path = dir.path().join("adb");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn fake_session(adb_path: PathBuf) -> DeviceSession {
    let config = EngineConfig {
        adb_path,
        max_concurrent_operations: 1,
        default_internal_path: "/sdcard".to_string(),
    };
    DeviceSession::connect("emulator-5554", config)
}

fn script(body: &str) -> Vec<String> {
    vec!["-c".to_string(), body.to_string()]
}

#[tokio::test]
async fn test_run_captures_stdout_stderr_and_exit_code() {
    let cancel = CancellationToken::new();
    let output = sh()
        .run(&script("echo hello; echo oops >&2; exit 3"), &cancel)
        .await
        .unwrap();

    assert_eq!(output.exit_code, Some(3));
    assert_eq!(output.stdout, "hello\n");
    assert_eq!(output.stderr, "oops\n");
    assert!(!output.success());

    let err = output.check("sh -c ...").unwrap_err();
    match err {
        AdbError::Transport { message, exit_code, .. } => {
            assert_eq!(message, "oops");
            assert_eq!(exit_code, Some(3));
        }
        other => panic!("Expected transport error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_run_cancellation_kills_child() {
    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let started = std::time::Instant::now();
    let err = sh().run(&script("sleep 10"), &cancel).await.unwrap_err();
    assert!(err.is_cancellation(), "{:?}", err);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_streaming_yields_lines_in_order() {
    let cancel = CancellationToken::new();
    let mut stream = sh()
        .run_streaming(&script("printf 'one\\ntwo\\r\\nthree'"), OutputStreams::Merged, &cancel)
        .await
        .unwrap();

    let mut lines = Vec::new();
    while let Some(line) = stream.next_line().await {
        lines.push(line);
    }
    assert_eq!(lines, vec!["one", "two", "three"]);
    assert_eq!(stream.exit_code().await, Some(0));
}

#[tokio::test]
async fn test_streaming_non_zero_exit_is_not_an_error() {
    let cancel = CancellationToken::new();
    let mut stream = sh()
        .run_streaming(&script("echo 'adb: error: failed' >&2; exit 1"), OutputStreams::Merged, &cancel)
        .await
        .unwrap();

    assert_eq!(stream.next_line().await.as_deref(), Some("adb: error: failed"));
    assert_eq!(stream.next_line().await, None);
    assert_eq!(stream.exit_code().await, Some(1));
}

#[tokio::test]
async fn test_streaming_cancellation_ends_sequence() {
    let cancel = CancellationToken::new();
    let mut stream = sh()
        .run_streaming(&script("echo first; exec sleep 10"), OutputStreams::Merged, &cancel)
        .await
        .unwrap();

    assert_eq!(stream.next_line().await.as_deref(), Some("first"));
    cancel.cancel();
    assert_eq!(stream.next_line().await, None);

    let exit = tokio::time::timeout(Duration::from_secs(5), stream.exit_code())
        .await
        .expect("child should be killed promptly");
    assert_eq!(exit, None);
}

async fn collect_lines(runner: &AdbProcess, body: &str, streams: OutputStreams) -> Vec<String> {
    let cancel = CancellationToken::new();
    let mut stream = runner.run_streaming(&script(body), streams, &cancel).await.unwrap();
    let mut lines = Vec::new();
    while let Some(line) = stream.next_line().await {
        lines.push(line);
    }
    lines
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_merged_streams_keep_write_order() {
    let runner = sh();
    for _ in 0..50 {
        let lines = collect_lines(&runner, "printf 'err\\n' >&2; printf 'out\\n'", OutputStreams::Merged).await;
        assert_eq!(lines, vec!["err", "out"]);

        let lines = collect_lines(&runner, "printf 'out\\n'; printf 'err\\n' >&2", OutputStreams::Merged).await;
        assert_eq!(lines, vec!["out", "err"]);
    }
}

#[tokio::test]
async fn test_stdout_only_keeps_stderr_aside() {
    let cancel = CancellationToken::new();
    let mut stream = sh()
        .run_streaming(
            &script("printf '* daemon started successfully\\n' >&2; printf 'entry\\n'; exit 2"),
            OutputStreams::StdoutOnly,
            &cancel,
        )
        .await
        .unwrap();

    assert_eq!(stream.next_line().await.as_deref(), Some("entry"));
    assert_eq!(stream.next_line().await, None);
    assert_eq!(stream.exit_code().await, Some(2));
    assert_eq!(stream.stderr(), "* daemon started successfully\n");
}

#[tokio::test]
async fn test_stream_ends_when_a_background_child_keeps_output_open() {
    let cancel = CancellationToken::new();
    let mut stream = sh()
        .run_streaming(&script("echo done; sleep 30 &"), OutputStreams::StdoutOnly, &cancel)
        .await
        .unwrap();

    let lines = tokio::time::timeout(Duration::from_secs(10), async {
        let mut lines = Vec::new();
        while let Some(line) = stream.next_line().await {
            lines.push(line);
        }
        lines
    })
    .await
    .expect("stream should end after the child exits");
    assert_eq!(lines, vec!["done"]);

    let exit = tokio::time::timeout(Duration::from_secs(10), stream.exit_code())
        .await
        .expect("exit code should not wait for the background child");
    assert_eq!(exit, Some(0));
}

#[tokio::test]
async fn test_escaped_path_round_trips_through_shell() {
    let cancel = CancellationToken::new();
    let original = "/sdcard/My Photos (2023)/it's a \"test\" & more;*.jpg";
    let body = format!("printf '%s' {}", escape_shell_string(original));
    let output = sh().run(&script(&body), &cancel).await.unwrap();

    assert!(output.success(), "stderr: {}", output.stderr);
    assert_eq!(output.stdout, original);
}

#[tokio::test]
async fn test_pull_through_fake_tool() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let adb = fake_adb(
        &dir,
        r#"[ "$3" = "pull" ] || exit 9
printf '[ 10%%] %s: 100\r[ 60%%] %s: 600\r' "$5" "$5"
printf '%s: 1 file pulled, 0 skipped. 1.0 MB/s (1000 bytes in 0.001s)\n' "$5""#,
    );
    let session = fake_session(adb);
    let sink: ProgressSink<SyncUpdate> = ProgressSink::new();

    let stats = session
        .transfer(
            TransferDirection::Pull,
            "/sdcard/a b.txt",
            "/tmp/a b.txt",
            &sink,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(stats.source_path, "/sdcard/a b.txt");
    assert_eq!(stats.total_bytes, 1000);
    let updates = sink.snapshot();
    assert_eq!(updates.len(), 2);
    assert!(matches!(&updates[1], SyncUpdate::Progress(p) if p.current_bytes == Some(600)));
}

#[tokio::test]
async fn test_listing_through_fake_tool() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let adb = fake_adb(
        &dir,
        r#"[ "$3" = "ls" ] && [ "$4" = "/sdcard/" ] || exit 9
printf '000041f9 00001000 65a1b2c3 .\n000041f9 00001000 65a1b2c3 ..\n'
printf '000041f9 00001000 65a1b2c3 DCIM\n000081b0 0000002a 65a1b2c3 notes.txt\r\n'"#,
    );
    let session = fake_session(adb);

    let entries = session
        .list_directory("/sdcard/", &CancellationToken::new())
        .await
        .unwrap()
        .collect()
        .await
        .unwrap();

    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].path, "/sdcard/DCIM");
    assert_eq!(entries[0].kind, FileKind::Folder);
    assert_eq!(entries[1].name, "notes.txt");
    assert_eq!(entries[1].size, Some(42));
}

#[tokio::test]
async fn test_listing_cancellation_stops_fake_tool() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let adb = fake_adb(&dir, "printf '000041f9 00001000 65a1b2c3 DCIM\\n'; sleep 10");
    let session = fake_session(adb);
    let cancel = CancellationToken::new();

    let mut listing = session.list_directory("/sdcard", &cancel).await.unwrap();
    let first = listing.next_entry().await.unwrap().unwrap();
    assert_eq!(first.name, "DCIM");

    cancel.cancel();
    let next = tokio::time::timeout(Duration::from_secs(5), listing.next_entry())
        .await
        .expect("listing should end promptly");
    assert!(next.is_none());
}

const PULL_SUMMARY: &str = "printf '%s: 1 file pulled, 0 skipped. 1.0 MB/s (1000 bytes in 0.001s)\\n' \"$5\"";

async fn pull_through(adb: PathBuf) -> Result<u64, AdbError> {
    let session = fake_session(adb);
    let sink: ProgressSink<SyncUpdate> = ProgressSink::new();
    session
        .transfer(
            TransferDirection::Pull,
            "/sdcard/a.txt",
            "/tmp/a.txt",
            &sink,
            &CancellationToken::new(),
        )
        .await
        .map(|stats| stats.total_bytes)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pull_result_follows_stderr_stdout_order() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let error_first = fake_adb(
        &dir,
        &format!("printf \"adb: error: failed to copy '%s'\\n\" \"$5\" >&2\n{PULL_SUMMARY}"),
    );
    for _ in 0..20 {
        assert_eq!(pull_through(error_first.clone()).await, Ok(1000));
    }

    let other = tempfile::tempdir().unwrap();
    let summary_first = fake_adb(
        &other,
        &format!("{PULL_SUMMARY}\nprintf \"adb: error: failed to copy '%s'\\n\" \"$5\" >&2"),
    );
    for _ in 0..20 {
        let result = pull_through(summary_first.clone()).await;
        assert!(matches!(result, Err(AdbError::TransferIncomplete { .. })), "{:?}", result);
    }
}

#[tokio::test]
async fn test_listing_ignores_daemon_notice_on_stderr() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let adb = fake_adb(
        &dir,
        r#"printf '* daemon not running; starting now at tcp:5037\n' >&2
printf '000041f9 00001000 65a1b2c3 DCIM\n'"#,
    );
    let session = fake_session(adb);

    let entries = session
        .list_directory("/sdcard", &CancellationToken::new())
        .await
        .unwrap()
        .collect()
        .await
        .unwrap();

    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "DCIM");
}
