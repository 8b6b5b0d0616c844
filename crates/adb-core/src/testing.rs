//! Scripted stand-in for the device tool.
//!
//! Commands are matched on their argument vector joined with spaces, with the leading
//! `-s <serial>` removed, so a test registers `shell df /` rather than the full line.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::device::DeviceSession;
use crate::error::AdbError;
use crate::ignore_poison::IgnorePoison;
use crate::process::{CommandOutput, CommandRunner, LineStream, OutputStreams};

pub(crate) const TEST_SERIAL: &str = "emulator-5554";

#[derive(Debug, Clone)]
enum Script {
    Output(CommandOutput),
    Lines(Vec<String>),
    SpawnError(String),
    /// Emits the lines, then stays open until cancelled.
    Hang(Vec<String>),
}

#[derive(Default)]
pub(crate) struct ScriptedRunner {
    scripts: Mutex<HashMap<String, Script>>,
    calls: Mutex<Vec<String>>,
    open_streams: Mutex<Vec<mpsc::Sender<String>>>,
}

impl ScriptedRunner {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_stdout(self, command: &str, stdout: &str) -> Self {
        self.with_output(command, 0, stdout, "")
    }

    pub(crate) fn with_output(self, command: &str, exit_code: i32, stdout: &str, stderr: &str) -> Self {
        self.script(
            command,
            Script::Output(CommandOutput {
                exit_code: Some(exit_code),
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            }),
        )
    }

    pub(crate) fn with_lines(self, command: &str, lines: &[&str]) -> Self {
        self.script(command, Script::Lines(lines.iter().map(|l| l.to_string()).collect()))
    }

    pub(crate) fn with_spawn_error(self, command: &str) -> Self {
        self.script(command, Script::SpawnError("No such file or directory (os error 2)".to_string()))
    }

    pub(crate) fn with_hang(self, command: &str, lines: &[&str]) -> Self {
        self.script(command, Script::Hang(lines.iter().map(|l| l.to_string()).collect()))
    }

    fn script(self, command: &str, script: Script) -> Self {
        self.scripts.lock_ignore_poison().insert(command.to_string(), script);
        self
    }

    /// Every command run so far, in `describe` form without the serial prefix.
    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock_ignore_poison().clone()
    }

    pub(crate) fn call_count(&self, command: &str) -> usize {
        self.calls.lock_ignore_poison().iter().filter(|c| *c == command).count()
    }

    fn lookup(&self, args: &[String]) -> (String, Option<Script>) {
        let args = match args {
            [flag, _serial, rest @ ..] if flag == "-s" => rest,
            _ => args,
        };
        let key = args.join(" ");
        self.calls.lock_ignore_poison().push(key.clone());
        let script = self.scripts.lock_ignore_poison().get(&key).cloned();
        (key, script)
    }
}

impl CommandRunner for ScriptedRunner {
    async fn run(&self, args: &[String], cancel: &CancellationToken) -> Result<CommandOutput, AdbError> {
        let command = self.describe(args);
        let (key, script) = self.lookup(args);
        match script {
            Some(Script::Output(output)) => Ok(output),
            Some(Script::Lines(lines)) => Ok(CommandOutput {
                exit_code: Some(0),
                stdout: lines.iter().map(|l| format!("{l}\n")).collect(),
                stderr: String::new(),
            }),
            Some(Script::SpawnError(message)) => Err(AdbError::transport(&command, message)),
            Some(Script::Hang(_)) => {
                cancel.cancelled().await;
                Err(AdbError::cancelled(&command))
            }
            None => Ok(CommandOutput {
                exit_code: Some(1),
                stdout: String::new(),
                stderr: format!("unscripted command: {key}"),
            }),
        }
    }

    async fn run_streaming(
        &self,
        args: &[String],
        streams: OutputStreams,
        cancel: &CancellationToken,
    ) -> Result<LineStream, AdbError> {
        let command = self.describe(args);
        let (key, script) = self.lookup(args);
        match script {
            Some(Script::Lines(lines)) => Ok(LineStream::from_lines(&command, lines, cancel)),
            Some(Script::Output(output)) => {
                let stream = match streams {
                    OutputStreams::Merged => LineStream::from_lines(
                        &command,
                        output.stdout.lines().chain(output.stderr.lines()).map(str::to_string),
                        cancel,
                    ),
                    OutputStreams::StdoutOnly => {
                        LineStream::from_lines(&command, output.stdout.lines(), cancel).with_stderr(&output.stderr)
                    }
                };
                Ok(stream.with_exit_code(output.exit_code))
            }
            Some(Script::Hang(lines)) => {
                let (tx, rx) = mpsc::channel(lines.len() + 1);
                for line in lines {
                    let _ = tx.try_send(line);
                }
                self.open_streams.lock_ignore_poison().push(tx);
                Ok(LineStream::from_receiver(&command, rx, cancel))
            }
            Some(Script::SpawnError(message)) => Err(AdbError::transport(&command, message)),
            None => Err(AdbError::transport(&command, format!("unscripted command: {key}"))),
        }
    }
}

pub(crate) fn test_config() -> EngineConfig {
    EngineConfig {
        adb_path: PathBuf::from("adb"),
        max_concurrent_operations: 1,
        default_internal_path: "/sdcard".to_string(),
    }
}

pub(crate) fn session(runner: ScriptedRunner) -> DeviceSession<ScriptedRunner> {
    DeviceSession::new(runner, TEST_SERIAL, test_config())
}

pub(crate) fn shared_session(runner: ScriptedRunner) -> Arc<DeviceSession<ScriptedRunner>> {
    Arc::new(session(runner))
}
