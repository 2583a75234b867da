//! Virtual-device driver wrapper.
//!
//! Spawns the external CLI (`create .../delete --instance-names ...`) and
//! parses its JSON report file. Tracks launch progress as a tagged state
//! rather than inferring it from "is the report file present", so a launch
//! that fails mid-way is distinguishable from a device that was simply
//! never launched — `free` only calls `delete` for `Running`.

use serde::Deserialize;
use shared::FleetError;
use std::path::{Path, PathBuf};
use tokio::process::Command;

#[derive(Debug, Clone, Deserialize)]
pub struct VirtualLogEntry {
    pub path: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VirtualDriverReport {
    pub status: String,
    pub instance_name: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub logs: Vec<VirtualLogEntry>,
}

/// Where a virtual instance is in its lifecycle.
#[derive(Debug, Clone)]
pub enum VirtualLaunchState {
    NeverLaunched,
    LaunchFailedMidway,
    Running(VirtualDriverReport),
}

pub struct VirtualDriver {
    binary_path: PathBuf,
}

impl VirtualDriver {
    pub fn new(binary_path: impl Into<PathBuf>) -> Self {
        VirtualDriver {
            binary_path: binary_path.into(),
        }
    }

    /// Spawns `create` with a report file and parses the result. A nonzero
    /// exit with no parseable report is `LaunchFailedMidway`, not an error
    /// the caller must handle specially — the caller inspects the returned
    /// state to decide whether `delete` is owed later.
    pub async fn create(&self, instance_name: &str, report_path: &Path) -> Result<VirtualLaunchState, FleetError> {
        let status = Command::new(&self.binary_path)
            .args(["create", "--instance_name", instance_name, "--report_file"])
            .arg(report_path)
            .status()
            .await
            .map_err(|e| FleetError::ExternalToolFailure {
                tool: "virtual-driver".to_string(),
                reason: e.to_string(),
            })?;

        let report = match tokio::fs::read_to_string(report_path).await {
            Ok(contents) => serde_json::from_str::<VirtualDriverReport>(&contents).ok(),
            Err(_) => None,
        };

        match report {
            Some(report) if status.success() && report.status == "success" => Ok(VirtualLaunchState::Running(report)),
            Some(_) => Ok(VirtualLaunchState::LaunchFailedMidway),
            None if status.success() => Ok(VirtualLaunchState::LaunchFailedMidway),
            None => Ok(VirtualLaunchState::NeverLaunched),
        }
    }

    /// Only meaningful for a `Running` instance: never-launched and
    /// launch-failed-midway instances are skipped by the caller before
    /// this is reached.
    pub async fn delete(&self, instance_name: &str) -> Result<(), FleetError> {
        let status = Command::new(&self.binary_path)
            .args(["delete", "--instance-names", instance_name])
            .status()
            .await
            .map_err(|e| FleetError::ExternalToolFailure {
                tool: "virtual-driver".to_string(),
                reason: e.to_string(),
            })?;
        if status.success() {
            Ok(())
        } else {
            Err(FleetError::ExternalToolFailure {
                tool: "virtual-driver".to_string(),
                reason: format!("delete exited with {:?}", status.code()),
            })
        }
    }
}

/// Decides whether `free` owes a `delete` call, per the launch state.
pub fn needs_teardown(state: &VirtualLaunchState) -> Option<&str> {
    match state {
        VirtualLaunchState::Running(report) => Some(report.instance_name.as_str()),
        VirtualLaunchState::NeverLaunched | VirtualLaunchState::LaunchFailedMidway => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn teardown_only_owed_for_running_instances() {
        assert!(needs_teardown(&VirtualLaunchState::NeverLaunched).is_none());
        assert!(needs_teardown(&VirtualLaunchState::LaunchFailedMidway).is_none());
        let report = VirtualDriverReport {
            status: "success".to_string(),
            instance_name: "cvd-1".to_string(),
            host: "127.0.0.1".to_string(),
            port: 6520,
            errors: vec![],
            logs: vec![],
        };
        assert_eq!(needs_teardown(&VirtualLaunchState::Running(report)), Some("cvd-1"));
    }

    #[test]
    fn report_deserializes_from_driver_json() {
        let json = r#"{"status":"success","instance_name":"cvd-1","host":"127.0.0.1","port":6520,"errors":[],"logs":[{"path":"/tmp/log","name":"kernel.log","type":"text"}]}"#;
        let report: VirtualDriverReport = serde_json::from_str(json).unwrap();
        assert_eq!(report.port, 6520);
        assert_eq!(report.logs[0].name, "kernel.log");
    }
}
