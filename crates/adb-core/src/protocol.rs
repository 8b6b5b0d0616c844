//! Line parsers for the device tool's text protocol.
//!
//! Each parser looks at exactly one line and returns `None` when the line doesn't have its
//! shape. None of them fail: deciding whether a mismatch is noise or a fatal protocol
//! violation is up to the caller (the directory lister is strict, the sync engine is not).

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::sync::LazyLock;
use std::time::Duration;

static RE_LS_FILE_ENTRY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?<mode>[0-9a-fA-F]{1,8}) (?<size>[0-9a-fA-F]{1,16}) (?<time>[0-9a-fA-F]{1,8}) (?<name>[^/]+?)\r*$")
        .unwrap_or_else(|e| unreachable!("invalid ls pattern: {e}"))
});

static RE_PROGRESS_TOTAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[\s*(?:(?<total>\d{1,3})%|\?)\]\s*(?<rest>.*)$")
        .unwrap_or_else(|e| unreachable!("invalid progress pattern: {e}"))
});

static RE_PROGRESS_FILE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?<file>.+?): (?:(?<percent>\d{1,3})%|(?<bytes>\d+))$")
        .unwrap_or_else(|e| unreachable!("invalid progress pattern: {e}"))
});

static RE_SYNC_ERROR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^adb: error: (?<message>.+?)\s*$").unwrap_or_else(|e| unreachable!("invalid error pattern: {e}"))
});

static RE_QUOTED_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"'(?<name>[^']+)'").unwrap_or_else(|e| unreachable!("invalid quote pattern: {e}")));

static RE_SYNC_STATS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?<source>.+?): (?<files>\d+) files? (?<verb>pushed|pulled)(?:, (?<skipped>\d+) skipped)?\.(?: (?<rate>\d+(?:\.\d+)?) MB/s \((?<bytes>\d+) bytes in (?<secs>\d+(?:\.\d+)?)s\))?\s*$",
    )
    .unwrap_or_else(|e| unreachable!("invalid stats pattern: {e}"))
});

static RE_STORAGE_USAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?<fs>\S+)\s+(?<size>\d+)\s+(?<used>\d+)\s+(?<available>\d+)\s+(?<percent>\d{1,3})%\s+(?<path>/\S*)\s*$")
        .unwrap_or_else(|e| unreachable!("invalid df pattern: {e}"))
});

static RE_PROPERTY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[(?<key>[^\]]+)\]: \[(?<value>.*)\]\s*$").unwrap_or_else(|e| unreachable!("invalid prop pattern: {e}"))
});

static RE_INET_ADDRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\binet (?:addr:)?(?<ip>\d{1,3}(?:\.\d{1,3}){3})\b")
        .unwrap_or_else(|e| unreachable!("invalid inet pattern: {e}"))
});

static RE_DEVICE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?<serial>\S+)\s+(?<state>no permissions(?: \([^)]*\))?|[a-z]+)(?<attrs>(?:\s+\S+)*)\s*$")
        .unwrap_or_else(|e| unreachable!("invalid device pattern: {e}"))
});

// ============================================================================
// Directory entries
// ============================================================================

/// Raw fields of one `ls` output line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntryLine {
    pub mode: u32,
    pub size: u64,
    /// Seconds since the Unix epoch.
    pub mtime: i64,
    pub name: String,
}

/// Parses `<hex-mode> <hex-size> <hex-mtime> <name>`.
pub fn parse_directory_entry(line: &str) -> Option<DirectoryEntryLine> {
    let caps = RE_LS_FILE_ENTRY.captures(line)?;
    Some(DirectoryEntryLine {
        mode: u32::from_str_radix(&caps["mode"], 16).ok()?,
        size: u64::from_str_radix(&caps["size"], 16).ok()?,
        mtime: i64::from_str_radix(&caps["time"], 16).ok()?,
        name: caps["name"].to_string(),
    })
}

// ============================================================================
// File sync
// ============================================================================

/// A progress line of a push/pull.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    /// Overall progress, when the tool reports it.
    pub total_percentage: Option<u8>,
    pub current_file: String,
    /// Bytes transferred so far for `current_file`.
    pub current_bytes: Option<u64>,
    pub current_percentage: Option<u8>,
}

/// An error line of a push/pull.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferError {
    /// The first quoted path in the message, if any.
    pub file: Option<String>,
    pub message: String,
}

/// Direction reported by the summary line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncVerb {
    Pushed,
    Pulled,
}

/// Terminal summary of a push/pull.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferStats {
    pub source_path: String,
    pub verb: SyncVerb,
    pub files_transferred: u64,
    pub files_skipped: u64,
    pub total_bytes: u64,
    pub elapsed: Duration,
    /// Throughput in MB/s, as reported by the tool.
    pub average_rate: f64,
}

/// One non-terminal record of a transfer stream, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum SyncUpdate {
    Progress(TransferProgress),
    Error(TransferError),
}

/// Parses `[ 45%] /sdcard/file: 1234`, `[ 45%] /sdcard/file: 12%`, `[ 45%] /sdcard/file`
/// or a bare `/sdcard/file: 1234`.
pub fn parse_transfer_progress(line: &str) -> Option<TransferProgress> {
    let line = line.trim_end();
    let (total_percentage, rest, bracketed) = match RE_PROGRESS_TOTAL.captures(line) {
        Some(caps) => {
            let total = caps.name("total").and_then(|m| m.as_str().parse::<u8>().ok());
            (total, caps.name("rest").map_or("", |m| m.as_str()), true)
        }
        None => (None, line, false),
    };

    if let Some(caps) = RE_PROGRESS_FILE.captures(rest) {
        return Some(TransferProgress {
            total_percentage,
            current_file: caps["file"].to_string(),
            current_bytes: caps.name("bytes").and_then(|m| m.as_str().parse().ok()),
            current_percentage: caps.name("percent").and_then(|m| m.as_str().parse().ok()),
        });
    }

    // A bracketed line without a per-file figure still names the current file
    if bracketed && !rest.is_empty() {
        return Some(TransferProgress {
            total_percentage,
            current_file: rest.to_string(),
            current_bytes: None,
            current_percentage: None,
        });
    }

    None
}

/// Parses `adb: error: <message>`.
pub fn parse_transfer_error(line: &str) -> Option<TransferError> {
    let caps = RE_SYNC_ERROR.captures(line)?;
    let message = caps["message"].to_string();
    let file = RE_QUOTED_NAME
        .captures(&message)
        .map(|quoted| quoted["name"].to_string());
    Some(TransferError { file, message })
}

/// Parses `<path>: <n> files pulled, <m> skipped. <rate> MB/s (<bytes> bytes in <secs>s)`.
pub fn parse_transfer_stats(line: &str) -> Option<TransferStats> {
    let caps = RE_SYNC_STATS.captures(line)?;
    let verb = match &caps["verb"] {
        "pushed" => SyncVerb::Pushed,
        _ => SyncVerb::Pulled,
    };
    let seconds: f64 = caps.name("secs").map_or(Some(0.0), |m| m.as_str().parse().ok())?;
    Some(TransferStats {
        source_path: caps["source"].to_string(),
        verb,
        files_transferred: caps["files"].parse().ok()?,
        files_skipped: caps.name("skipped").map_or(Some(0), |m| m.as_str().parse().ok())?,
        total_bytes: caps.name("bytes").map_or(Some(0), |m| m.as_str().parse().ok())?,
        elapsed: Duration::try_from_secs_f64(seconds).ok()?,
        average_rate: caps.name("rate").map_or(Some(0.0), |m| m.as_str().parse().ok())?,
    })
}

// ============================================================================
// Storage, properties, network
// ============================================================================

/// One `df` row. Sizes are in KiB.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageUsage {
    pub filesystem: String,
    pub size_kb: u64,
    pub used_kb: u64,
    pub available_kb: u64,
    pub usage_percent: u8,
    pub mount_path: String,
}

/// Parses `<filesystem> <size> <used> <available> <percent>% <mount>`.
pub fn parse_storage_usage(line: &str) -> Option<StorageUsage> {
    let caps = RE_STORAGE_USAGE.captures(line)?;
    Some(StorageUsage {
        filesystem: caps["fs"].to_string(),
        size_kb: caps["size"].parse().ok()?,
        used_kb: caps["used"].parse().ok()?,
        available_kb: caps["available"].parse().ok()?,
        usage_percent: caps["percent"].parse::<u8>().ok()?.min(100),
        mount_path: caps["path"].to_string(),
    })
}

/// Parses `[key]: [value]`. Anything else is ignored.
pub fn parse_property(line: &str) -> Option<(String, String)> {
    let caps = RE_PROPERTY.captures(line)?;
    Some((caps["key"].to_string(), caps["value"].to_string()))
}

/// Finds the IPv4 address following an `inet` label.
pub fn parse_network_address(line: &str) -> Option<Ipv4Addr> {
    let caps = RE_INET_ADDRESS.captures(line)?;
    caps["ip"].parse().ok()
}

/// Parses loose `key: value` lines (as printed by `dumpsys`). Lines without a value are skipped.
pub fn parse_key_value(line: &str) -> Option<(String, String)> {
    let (key, value) = line.split_once(':')?;
    let key = key.trim();
    let value = value.trim();
    if key.is_empty() || value.is_empty() {
        return None;
    }
    Some((key.to_string(), value.to_string()))
}

// ============================================================================
// Device enumeration
// ============================================================================

/// A device as reported by `adb devices -l`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub serial: String,
    /// For example "device", "offline", "unauthorized".
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport_id: Option<String>,
}

impl DeviceInfo {
    /// Whether the device accepts commands.
    pub fn is_online(&self) -> bool {
        self.state == "device"
    }
}

/// Parses one `adb devices -l` row, skipping the header and daemon notices.
pub fn parse_device_line(line: &str) -> Option<DeviceInfo> {
    if line.starts_with("List of devices") || line.starts_with('*') {
        return None;
    }
    let caps = RE_DEVICE_LINE.captures(line)?;
    let mut info = DeviceInfo {
        serial: caps["serial"].to_string(),
        state: caps["state"].to_string(),
        product: None,
        model: None,
        device: None,
        transport_id: None,
    };
    for attr in caps["attrs"].split_whitespace() {
        let Some((key, value)) = attr.split_once(':') else {
            continue;
        };
        let slot = match key {
            "product" => &mut info.product,
            "model" => &mut info.model,
            "device" => &mut info.device,
            "transport_id" => &mut info.transport_id,
            _ => continue,
        };
        *slot = Some(value.to_string());
    }
    Some(info)
}
