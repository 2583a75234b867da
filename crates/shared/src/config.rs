use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

/// Flat configuration surface.
///
/// Loaded from JSON via `serde_json` rather than a bespoke parser.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub max_emulators: u32,
    pub max_null_devices: u32,
    pub max_gce_devices: u32,
    pub max_remote_devices: u32,
    pub max_local_virtual_devices: u32,

    /// Milliseconds between multi-device recovery sweeps.
    pub device_recovery_interval_ms: u64,

    pub adb_path: String,
    pub fastboot_path: String,

    /// Binary invoked by the virtual-device driver wrapper's
    /// `create`/`delete` subcommands, so the wrapper has somewhere to
    /// point without assuming a bare `cvd` on `PATH` in every deployment.
    pub virtual_driver_path: String,

    pub enabled_filesystem_check: bool,

    pub online_wait_time_ms: u64,
    pub device_wait_time_ms: u64,
    pub bootloader_wait_time_ms: u64,
    pub shell_wait_time_ms: u64,
    pub fastboot_wait_time_ms: u64,

    pub min_battery_after_recovery: Option<u8>,

    pub disable_unresponsive_reboot: bool,
    pub disable_usb_reset: bool,

    /// Whether fastbootd should be distinguished from bootloader mode for
    /// low-level-only records. Global, not per-device — a fleet either
    /// runs fastbootd-aware or it doesn't.
    #[serde(default = "default_true")]
    pub fastbootd_enabled: bool,

    /// How many times `allocate` retries under the sandbox env flag.
    pub sandbox_retry_attempts: u32,
    pub sandbox_retry_spacing_ms: u64,
}

impl Default for FleetConfig {
    fn default() -> Self {
        FleetConfig {
            max_emulators: 0,
            max_null_devices: 0,
            max_gce_devices: 0,
            max_remote_devices: 0,
            max_local_virtual_devices: 0,
            device_recovery_interval_ms: 30 * 60 * 1000,
            adb_path: "adb".to_string(),
            fastboot_path: "fastboot".to_string(),
            virtual_driver_path: "cvd".to_string(),
            enabled_filesystem_check: false,
            online_wait_time_ms: 60_000,
            device_wait_time_ms: 60_000,
            bootloader_wait_time_ms: 30_000,
            shell_wait_time_ms: 30_000,
            fastboot_wait_time_ms: 30_000,
            min_battery_after_recovery: None,
            disable_unresponsive_reboot: false,
            disable_usb_reset: false,
            fastbootd_enabled: true,
            sandbox_retry_attempts: 6,
            sandbox_retry_spacing_ms: 500,
        }
    }
}

impl FleetConfig {
    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }

    /// Env var consulted as the default selection target when no serial is
    /// set.
    pub const ANDROID_SERIAL_ENV: &'static str = "ANDROID_SERIAL";

    /// Env var gating the retry-on-allocate behavior.
    pub const SANDBOX_ENABLED_ENV: &'static str = "FLEET_SANDBOX_ENABLED";
}
