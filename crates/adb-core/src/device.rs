//! Device session: one connected device, its command prefix and its property cache.
//!
//! A session is created per connected device and dropped on disconnect. Nothing here is
//! process-wide; two sessions for the same serial each keep their own cache.

use log::{debug, info, warn};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::AdbError;
use crate::process::{AdbProcess, CommandOutput, CommandRunner, escape_shell_string};
use crate::protocol::{DeviceInfo, parse_device_line, parse_key_value, parse_network_address, parse_property};

const PROP_HOST_NAME: &str = "net.hostname";
const PROP_VENDOR: &str = "ro.vendor.config.CID";
const PROP_MODEL: &str = "ro.product.model";
const PROP_ANDROID_VERSION: &str = "ro.build.version.release";
const PROP_MICRO_SD_ID: &str = "vold.microsd.uuid";
const PROP_OTG_ID: &str = "vold.otgstorage.uuid";

const WLAN_INTERFACE: &str = "wlan0";

pub struct DeviceSession<R: CommandRunner = AdbProcess> {
    runner: R,
    serial: String,
    config: EngineConfig,
    /// Filled by the first successful `getprop`; failures aren't cached.
    properties: OnceCell<HashMap<String, String>>,
}

impl DeviceSession<AdbProcess> {
    /// Session backed by the executable configured in `config`.
    pub fn connect(serial: impl Into<String>, config: EngineConfig) -> Self {
        let runner = AdbProcess::new(config.adb_path.clone());
        Self::new(runner, serial, config)
    }
}

impl<R: CommandRunner> DeviceSession<R> {
    pub fn new(runner: R, serial: impl Into<String>, config: EngineConfig) -> Self {
        Self {
            runner,
            serial: serial.into(),
            config,
            properties: OnceCell::new(),
        }
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Prefixes `args` with `-s <serial>`.
    pub(crate) fn device_command<I>(&self, args: I) -> Vec<String>
    where
        I: IntoIterator<Item = String>,
    {
        ["-s".to_string(), self.serial.clone()].into_iter().chain(args).collect()
    }

    /// `adb -s <serial> shell <command_line>`. The command line is parsed by the device
    /// shell, so paths inside it must already be escaped.
    pub(crate) fn shell_command(&self, command_line: &str) -> Vec<String> {
        self.device_command(["shell".to_string(), command_line.to_string()])
    }

    /// Runs a device-scoped command and fails on a non-zero exit.
    pub(crate) async fn run_checked(&self, args: Vec<String>, cancel: &CancellationToken) -> Result<CommandOutput, AdbError> {
        let output = self.runner.run(&args, cancel).await?;
        output.check(&self.runner.describe(&args))
    }

    /// Runs `command_line` in the device shell and returns its stdout.
    pub async fn shell(&self, command_line: &str, cancel: &CancellationToken) -> Result<String, AdbError> {
        Ok(self.run_checked(self.shell_command(command_line), cancel).await?.stdout)
    }

    // ========================================================================
    // Properties
    // ========================================================================

    /// All device properties, fetched once per session.
    pub async fn properties(&self, cancel: &CancellationToken) -> Result<&HashMap<String, String>, AdbError> {
        self.properties
            .get_or_try_init(|| async {
                let stdout = self.shell("getprop", cancel).await?;
                let properties: HashMap<String, String> = stdout.lines().filter_map(parse_property).collect();
                debug!("Cached {} properties for {}", properties.len(), self.serial);
                Ok::<_, AdbError>(properties)
            })
            .await
    }

    pub async fn property(&self, key: &str, cancel: &CancellationToken) -> Result<Option<String>, AdbError> {
        Ok(self.properties(cancel).await?.get(key).cloned())
    }

    /// The cached properties, without fetching.
    pub fn cached_properties(&self) -> Option<&HashMap<String, String>> {
        self.properties.get()
    }

    /// Drops the cache so the next read fetches again.
    pub fn clear_property_cache(&mut self) {
        self.properties.take();
    }

    /// Human-facing device name. Empty when the device reports none of the name properties.
    pub async fn device_name(&self, cancel: &CancellationToken) -> Result<String, AdbError> {
        Ok(device_name_from(self.properties(cancel).await?))
    }

    pub async fn android_version(&self, cancel: &CancellationToken) -> Result<String, AdbError> {
        Ok(self.property(PROP_ANDROID_VERSION, cancel).await?.unwrap_or_default())
    }

    pub async fn micro_sd_volume_id(&self, cancel: &CancellationToken) -> Result<Option<String>, AdbError> {
        Ok(self.property(PROP_MICRO_SD_ID, cancel).await?.filter(|id| !id.is_empty()))
    }

    pub async fn otg_volume_id(&self, cancel: &CancellationToken) -> Result<Option<String>, AdbError> {
        Ok(self.property(PROP_OTG_ID, cancel).await?.filter(|id| !id.is_empty()))
    }

    // ========================================================================
    // Device state
    // ========================================================================

    /// `dumpsys battery` as a `key: value` map.
    pub async fn battery_info(&self, cancel: &CancellationToken) -> Result<HashMap<String, String>, AdbError> {
        let stdout = self.shell("dumpsys battery", cancel).await?;
        Ok(stdout.lines().filter_map(parse_key_value).collect())
    }

    /// IPv4 address of the Wi-Fi interface, if it has one.
    pub async fn wlan_address(&self, cancel: &CancellationToken) -> Result<Option<Ipv4Addr>, AdbError> {
        let stdout = self
            .shell(&format!("ip -f inet addr show {WLAN_INTERFACE}"), cancel)
            .await?;
        Ok(stdout.lines().find_map(parse_network_address))
    }

    /// Reboots the device, optionally into `mode` (`recovery`, `bootloader`, ...).
    pub async fn reboot(&self, mode: Option<&str>, cancel: &CancellationToken) -> Result<(), AdbError> {
        let args = self.device_command(std::iter::once("reboot".to_string()).chain(mode.map(str::to_string)));
        self.run_checked(args, cancel).await?;
        info!("Rebooting {} ({})", self.serial, mode.unwrap_or("system"));
        Ok(())
    }

    /// Resolves `path` to its canonical form on the device. `~` stands for the root.
    pub async fn translate_path(&self, path: &str, cancel: &CancellationToken) -> Result<String, AdbError> {
        let mut path = match path.strip_prefix('~') {
            Some("") => "/",
            Some(rest) => rest,
            None => path,
        };
        if path.starts_with("//") {
            path = &path[1..];
        }
        let stdout = self
            .shell(&format!("cd {} && pwd", escape_shell_string(path)), cancel)
            .await?;
        Ok(stdout.trim_end_matches(['\n', '\r']).to_string())
    }

    // ========================================================================
    // Packages and files
    // ========================================================================

    /// Installs a package. `on_device` packages are installed by the package manager from
    /// the device's storage; others are uploaded from the host first.
    pub async fn install_package(&self, path: &str, on_device: bool, cancel: &CancellationToken) -> Result<String, AdbError> {
        let args = if on_device {
            self.shell_command(&format!("pm install -r -d {}", escape_shell_string(path)))
        } else {
            self.device_command(["install".to_string(), path.to_string()])
        };
        let result = self.run_package_manager(args, cancel).await?;
        info!("Installed {} on {}", path, self.serial);
        Ok(result)
    }

    pub async fn uninstall_package(&self, package: &str, cancel: &CancellationToken) -> Result<String, AdbError> {
        let args = self.shell_command(&format!("pm uninstall {}", escape_shell_string(package)));
        let result = self.run_package_manager(args, cancel).await?;
        info!("Uninstalled {} from {}", package, self.serial);
        Ok(result)
    }

    /// Renames or moves a file on the device.
    pub async fn rename(&self, from: &str, to: &str, cancel: &CancellationToken) -> Result<(), AdbError> {
        let command_line = format!("mv {} {}", escape_shell_string(from), escape_shell_string(to));
        self.shell(&command_line, cancel).await?;
        info!("Renamed {} to {} on {}", from, to, self.serial);
        Ok(())
    }

    /// The package manager reports some failures on stdout with a zero exit.
    async fn run_package_manager(&self, args: Vec<String>, cancel: &CancellationToken) -> Result<String, AdbError> {
        let command = self.runner.describe(&args);
        let output = self.run_checked(args, cancel).await?;
        let report = output.stdout.trim();
        if let Some(failure) = report.lines().find(|l| l.starts_with("Failure")) {
            warn!("`{}` failed: {}", command, failure);
            return Err(AdbError::Transport {
                command,
                message: failure.to_string(),
                exit_code: output.exit_code,
            });
        }
        Ok(report.to_string())
    }
}

/// Devices known to the tool, online or not.
pub async fn list_devices<R: CommandRunner>(runner: &R, cancel: &CancellationToken) -> Result<Vec<DeviceInfo>, AdbError> {
    let args = vec!["devices".to_string(), "-l".to_string()];
    let output = runner.run(&args, cancel).await?.check(&runner.describe(&args))?;
    let devices: Vec<DeviceInfo> = output.stdout.lines().filter_map(parse_device_line).collect();
    debug!("Found {} devices", devices.len());
    Ok(devices)
}

/// `"<vendor> <host name>"` when the host name is set, else the model with underscores
/// as spaces.
pub(crate) fn device_name_from(properties: &HashMap<String, String>) -> String {
    let non_empty = |key: &str| properties.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());

    if let Some(host_name) = non_empty(PROP_HOST_NAME) {
        return match non_empty(PROP_VENDOR) {
            Some(vendor) => format!("{vendor} {host_name}"),
            None => host_name.to_string(),
        };
    }
    non_empty(PROP_MODEL)
        .map(|model| model.replace('_', " "))
        .unwrap_or_default()
}
