//! Storage discovery from `df` output.

use log::{debug, warn};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::device::DeviceSession;
use crate::error::AdbError;
use crate::process::CommandRunner;
use crate::protocol::{StorageUsage, parse_storage_usage};

const ROOT_QUERY: &str = "df /";
const EXTERNAL_QUERY: &str = "df | grep -E '/mnt/media_rw/|/storage/'";

/// Mount points that are views of the primary internal storage.
const INTERNAL_MOUNTS: &[&str] = &[
    "/sdcard",
    "/storage/emulated",
    "/storage/self/primary",
    "/mnt/sdcard",
    "/data/media",
];

/// First partition of MMC block devices 0 and 1, where removable cards show up.
const MMC_BLOCK_DEVICES: &[&str] = &["/dev/block/mmcblk0p1", "/dev/block/mmcblk1p1"];

const SIZE_UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DriveType {
    Root,
    Internal,
    /// Removable card in the device's own slot.
    Expansion,
    /// USB/OTG and other mounted volumes.
    External,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogicalDrive {
    pub path: String,
    pub drive_type: DriveType,
    /// Human-scaled, empty for synthesized drives.
    pub size: String,
    pub used: String,
    pub available: String,
    pub usage_percent: u8,
}

impl LogicalDrive {
    fn from_usage(usage: &StorageUsage, drive_type: DriveType, path: String) -> Self {
        Self {
            path,
            drive_type,
            size: format_drive_size(usage.size_kb),
            used: format_drive_size(usage.used_kb),
            available: format_drive_size(usage.available_kb),
            usage_percent: usage.usage_percent,
        }
    }

    /// A placeholder for a drive the device didn't report.
    fn synthesized(path: &str, drive_type: DriveType) -> Self {
        Self {
            path: path.to_string(),
            drive_type,
            size: String::new(),
            used: String::new(),
            available: String::new(),
            usage_percent: 0,
        }
    }

    /// Last path component, which is the volume id for removable storage.
    pub fn id(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    pub fn pretty_name(&self) -> &'static str {
        match self.drive_type {
            DriveType::Root => "Root",
            DriveType::Internal => "Internal Storage",
            DriveType::Expansion => "SD Card",
            DriveType::External => "External Storage",
            DriveType::Unknown => "Unknown",
        }
    }
}

/// Classifies a mount point. `mmc_id` is the device's micro-SD volume id, if it has one.
pub fn classify_mount(path: &str, filesystem: &str, mmc_id: Option<&str>) -> DriveType {
    if path == "/" {
        return DriveType::Root;
    }
    if INTERNAL_MOUNTS.contains(&path.trim_end_matches('/')) {
        return DriveType::Internal;
    }
    let volume_id = path.rsplit('/').next().unwrap_or_default();
    let is_mmc = MMC_BLOCK_DEVICES.contains(&filesystem)
        || mmc_id.is_some_and(|id| !id.is_empty() && id.eq_ignore_ascii_case(volume_id));
    if is_mmc { DriveType::Expansion } else { DriveType::External }
}

/// Formats a byte count the way file sizes are shown: `0B`, `300B`, `32.2KB`, `1.1MB`.
pub fn format_size(bytes: u64) -> String {
    format_size_with(bytes, false, 1)
}

/// Like `format_size`, with a space before the unit and up to `decimals` fraction digits.
/// Trailing zeros are dropped.
pub fn format_size_with(bytes: u64, space: bool, decimals: usize) -> String {
    let separator = if space { " " } else { "" };
    let mut value = bytes as f64;
    let mut unit = 0;
    // Scaled by 1024, but four-digit values move up a unit
    while value >= 1000.0 && unit < SIZE_UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        return format!("{bytes}{separator}{}", SIZE_UNITS[0]);
    }

    let mut number = format!("{value:.decimals$}");
    if number.contains('.') {
        number.truncate(number.trim_end_matches('0').trim_end_matches('.').len());
    }
    format!("{number}{separator}{}", SIZE_UNITS[unit])
}

fn format_drive_size(kilobytes: u64) -> String {
    format_size_with(kilobytes.saturating_mul(1024), true, 2)
}

impl<R: CommandRunner> DeviceSession<R> {
    /// Lists the device's storage: Root first, Internal second, then other volumes in the
    /// order `df` reports them. Root and Internal are always present; they're synthesized
    /// when the device doesn't report them.
    pub async fn discover_drives(&self, cancel: &CancellationToken) -> Result<Vec<LogicalDrive>, AdbError> {
        let internal_path = self.config().default_internal_path.clone();

        let mut root = self
            .shell(ROOT_QUERY, cancel)
            .await?
            .lines()
            .find_map(parse_storage_usage)
            .map(|usage| LogicalDrive::from_usage(&usage, DriveType::Root, "/".to_string()));

        let mut internal = self
            .shell(&format!("df {internal_path}"), cancel)
            .await?
            .lines()
            .find_map(parse_storage_usage)
            .map(|usage| LogicalDrive::from_usage(&usage, DriveType::Internal, internal_path.clone()));

        let candidates = self.external_storage(cancel).await?;
        let mmc_id = if candidates.is_empty() {
            None
        } else {
            self.micro_sd_id(cancel).await
        };

        let mut externals: Vec<LogicalDrive> = Vec::new();
        for usage in &candidates {
            match classify_mount(&usage.mount_path, &usage.filesystem, mmc_id.as_deref()) {
                DriveType::Root => {
                    if root.is_none() {
                        root = Some(LogicalDrive::from_usage(usage, DriveType::Root, "/".to_string()));
                    }
                }
                DriveType::Internal => {
                    if internal.is_none() {
                        internal = Some(LogicalDrive::from_usage(usage, DriveType::Internal, internal_path.clone()));
                    }
                }
                drive_type => push_external(
                    &mut externals,
                    LogicalDrive::from_usage(usage, drive_type, usage.mount_path.clone()),
                ),
            }
        }

        let mut drives = Vec::with_capacity(externals.len() + 2);
        drives.push(root.unwrap_or_else(|| LogicalDrive::synthesized("/", DriveType::Root)));
        drives.push(internal.unwrap_or_else(|| LogicalDrive::synthesized(&internal_path, DriveType::Internal)));
        drives.extend(externals);
        debug!("Discovered {} drives on {}", drives.len(), self.serial());
        Ok(drives)
    }

    /// Rows of the filtered `df`. grep exits 1 when nothing matched, which isn't a failure.
    async fn external_storage(&self, cancel: &CancellationToken) -> Result<Vec<StorageUsage>, AdbError> {
        let args = self.shell_command(EXTERNAL_QUERY);
        let output = self.runner().run(&args, cancel).await?;
        if output.exit_code == Some(1) && output.stdout.trim().is_empty() && output.stderr.trim().is_empty() {
            return Ok(Vec::new());
        }
        let output = output.check(&self.runner().describe(&args))?;
        Ok(output.stdout.lines().filter_map(parse_storage_usage).collect())
    }

    async fn micro_sd_id(&self, cancel: &CancellationToken) -> Option<String> {
        match self.micro_sd_volume_id(cancel).await {
            Ok(id) => id,
            Err(e) => {
                warn!("Couldn't read the micro-SD volume id, classifying by block device only: {}", e);
                None
            }
        }
    }
}

/// The same volume often shows up under both `/mnt/media_rw/<id>` and `/storage/<id>`.
/// Keeps one entry per volume id, preferring the `/storage/` path.
fn push_external(externals: &mut Vec<LogicalDrive>, drive: LogicalDrive) {
    let existing = externals
        .iter_mut()
        .find(|d| d.path == drive.path || (!drive.id().is_empty() && d.id() == drive.id()));
    match existing {
        Some(existing) => {
            if drive.path.starts_with("/storage/") && !existing.path.starts_with("/storage/") {
                *existing = drive;
            }
        }
        None => externals.push(drive),
    }
}
