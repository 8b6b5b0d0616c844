//! Engine configuration.

use serde::Deserialize;
use std::env;
use std::path::PathBuf;

const DEFAULT_ADB_PATH: &str = "adb";
const DEFAULT_MAX_CONCURRENT_OPERATIONS: usize = 1;
pub(crate) const DEFAULT_INTERNAL_PATH: &str = "/sdcard";

/// Configuration for the device engine.
/// Priority: environment variables > user settings > defaults
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Executable used for every device call. A bare name is looked up on `PATH`.
    #[serde(default = "default_adb_path")]
    pub adb_path: PathBuf,
    /// How many queued operations may run at once. 1 means strictly serial.
    #[serde(default = "default_max_concurrent_operations")]
    pub max_concurrent_operations: usize,
    /// Mount point reported for internal storage, and synthesized when discovery finds none.
    #[serde(default = "default_internal_path")]
    pub default_internal_path: String,
}

fn default_adb_path() -> PathBuf {
    PathBuf::from(DEFAULT_ADB_PATH)
}

fn default_max_concurrent_operations() -> usize {
    DEFAULT_MAX_CONCURRENT_OPERATIONS
}

fn default_internal_path() -> String {
    DEFAULT_INTERNAL_PATH.to_string()
}

impl EngineConfig {
    /// Load configuration from environment variables only.
    pub fn from_env() -> Self {
        Self::from_settings_and_env(None)
    }

    /// Load configuration with priority: env vars > user settings > defaults.
    pub fn from_settings_and_env(settings: Option<EngineConfig>) -> Self {
        let base = settings.unwrap_or_else(Self::defaults);

        let adb_path = env::var("ADB_CORE_ADB_PATH")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or(base.adb_path);

        let max_concurrent_operations = env::var("ADB_CORE_MAX_OPERATIONS")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(base.max_concurrent_operations)
            .max(1);

        Self {
            adb_path,
            max_concurrent_operations,
            default_internal_path: base.default_internal_path,
        }
    }

    /// Parses the engine section of a settings JSON document, falling back to defaults
    /// for missing fields.
    pub fn from_settings_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    fn defaults() -> Self {
        Self {
            adb_path: default_adb_path(),
            max_concurrent_operations: default_max_concurrent_operations(),
            default_internal_path: default_internal_path(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
