//! Device transport and file-operation engine for Android devices.
//!
//! Everything goes through the `adb` command-line tool: one process per call, text output
//! parsed line by line. On top of that sit a directory lister, a push/pull engine with live
//! progress, storage discovery, a per-device session with a property cache, and a queue of
//! cancellable background operations.

// Warn on unused code to catch dead code early
#![warn(unused)]
// Warn on redundant path prefixes (e.g., std::path::Path when Path is imported)
#![warn(unused_qualifications)]
// Use log::* macros instead of println!/eprintln! for proper log level control
#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod config;
pub mod device;
pub mod drives;
pub mod error;
mod ignore_poison;
pub mod listing;
pub mod operations;
pub mod process;
pub mod progress;
pub mod protocol;
pub mod sync;

#[cfg(test)]
mod testing;

#[cfg(all(test, unix))]
mod process_test;

pub use config::EngineConfig;
pub use device::{DeviceSession, list_devices};
pub use drives::{DriveType, LogicalDrive, format_size};
pub use error::AdbError;
pub use listing::{DirectoryListing, FileKind, FileStat};
pub use operations::{Operation, OperationQueue, OperationRequest, OperationStatus};
pub use process::{AdbProcess, CommandRunner, LineStream, OutputStreams};
pub use progress::{ProgressSink, ProgressSubscription};
pub use protocol::{DeviceInfo, TransferStats};
pub use sync::TransferDirection;
