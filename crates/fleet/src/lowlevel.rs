//! Low-level binary wrapper.
//!
//! Models the external fastboot-shaped CLI: listing devices currently
//! sitting in bootloader/fastbootd mode, and issuing mode-reboots on a
//! specific serial. `async_trait` gives the Recoverer and Low-Level-Mode
//! Poller a swappable/mockable seam, the way
//! `lib/bridge-sdk::listener::DeviceChangeListener` is a seam for the
//! bridge callback surface.

use async_trait::async_trait;
use shared::FleetError;
use std::path::PathBuf;
use tokio::process::Command;

/// One line of `fastboot devices` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LowLevelDeviceEntry {
    pub serial: String,
    /// `true` for fastbootd (low-level-userspace), `false` for bootloader.
    pub is_fastbootd: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LowLevelRebootTarget {
    Bootloader,
    Fastboot,
    Normal,
}

#[async_trait]
pub trait LowLevelTool: Send + Sync {
    async fn list_devices(&self) -> Result<Vec<LowLevelDeviceEntry>, FleetError>;
    async fn reboot(&self, serial: &str, target: LowLevelRebootTarget) -> Result<(), FleetError>;
    async fn getvar_product(&self, serial: &str) -> Result<String, FleetError>;
}

/// Invokes the real `fastboot` binary.
pub struct FastbootTool {
    binary_path: PathBuf,
    /// Serial -> network-serial map for network-attached fastboot targets.
    network_serials: std::collections::HashMap<String, String>,
}

impl FastbootTool {
    pub fn new(binary_path: impl Into<PathBuf>) -> Self {
        FastbootTool {
            binary_path: binary_path.into(),
            network_serials: std::collections::HashMap::new(),
        }
    }

    pub fn with_network_serials(mut self, map: std::collections::HashMap<String, String>) -> Self {
        self.network_serials = map;
        self
    }

    fn resolve_target(&self, serial: &str) -> &str {
        self.network_serials.get(serial).map(|s| s.as_str()).unwrap_or(serial)
    }
}

#[async_trait]
impl LowLevelTool for FastbootTool {
    async fn list_devices(&self) -> Result<Vec<LowLevelDeviceEntry>, FleetError> {
        let output = Command::new(&self.binary_path)
            .arg("devices")
            .output()
            .await
            .map_err(|e| FleetError::ExternalToolFailure {
                tool: "fastboot".to_string(),
                reason: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(FleetError::ExternalToolFailure {
                tool: "fastboot".to_string(),
                reason: format!("exit status {:?}", output.status.code()),
            });
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_devices_output(&stdout))
    }

    async fn reboot(&self, serial: &str, target: LowLevelRebootTarget) -> Result<(), FleetError> {
        let target_serial = self.resolve_target(serial).to_string();
        let mut cmd = Command::new(&self.binary_path);
        cmd.arg("-s").arg(&target_serial);
        match target {
            LowLevelRebootTarget::Bootloader => cmd.arg("reboot-bootloader"),
            LowLevelRebootTarget::Fastboot => cmd.args(["reboot", "fastboot"]),
            LowLevelRebootTarget::Normal => cmd.arg("reboot"),
        };
        let status = cmd.status().await.map_err(|e| FleetError::ExternalToolFailure {
            tool: "fastboot".to_string(),
            reason: e.to_string(),
        })?;
        if status.success() {
            Ok(())
        } else {
            Err(FleetError::ExternalToolFailure {
                tool: "fastboot".to_string(),
                reason: format!("reboot exited with {:?}", status.code()),
            })
        }
    }

    async fn getvar_product(&self, serial: &str) -> Result<String, FleetError> {
        let target_serial = self.resolve_target(serial).to_string();
        let output = Command::new(&self.binary_path)
            .args(["-s", &target_serial, "getvar", "product"])
            .output()
            .await
            .map_err(|e| FleetError::ExternalToolFailure {
                tool: "fastboot".to_string(),
                reason: e.to_string(),
            })?;
        // fastboot writes getvar output to stderr.
        let combined = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        parse_getvar_product(&combined).ok_or_else(|| FleetError::ExternalToolFailure {
            tool: "fastboot".to_string(),
            reason: format!("unparseable getvar output: {combined:?}"),
        })
    }
}

/// Parses `fastboot devices` line-wise: `<serial>\tfastboot` or
/// `<serial>\tfastbootd`.
fn parse_devices_output(stdout: &str) -> Vec<LowLevelDeviceEntry> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let serial = parts.next()?;
            let mode = parts.next()?;
            Some(LowLevelDeviceEntry {
                serial: serial.to_string(),
                is_fastbootd: mode.eq_ignore_ascii_case("fastbootd"),
            })
        })
        .collect()
}

fn parse_getvar_product(output: &str) -> Option<String> {
    for line in output.lines() {
        if let Some(rest) = line.strip_prefix("product:") {
            return Some(rest.trim().to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bootloader_and_fastbootd_lines() {
        let out = "XYZ001\tfastboot\nXYZ002\tfastbootd\n";
        let entries = parse_devices_output(out);
        assert_eq!(entries.len(), 2);
        assert!(!entries[0].is_fastbootd);
        assert!(entries[1].is_fastbootd);
    }

    #[test]
    fn parses_getvar_product_from_stderr_style_output() {
        let out = "product: walleye\nFinished. Total time: 0.002s\n";
        assert_eq!(parse_getvar_product(out), Some("walleye".to_string()));
    }
}
