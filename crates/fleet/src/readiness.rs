//! The Readiness Monitor.
//!
//! Owns the three bounded readiness probes run in order when a Record
//! enters `Checking_Availability`: shell-responsive, boot-complete, and
//! (optionally) external-storage-mounted. Bootloader/low-level-userspace
//! waits are serviced separately, by [`crate::wait::wait_for_mode`] against
//! a mode the Low-Level-Mode Poller posts.

use crate::record::Record;
use crate::registry::Registry;
use bridge_sdk::error::BridgeError;
use bridge_sdk::BridgeClient;
use shared::{AllocationEvent, FleetConfig, FleetError};
use std::sync::Arc;
use std::time::Duration;

const SHELL_PROBE_BUDGET: Duration = Duration::from_secs(30);
const SHELL_PROBE_PER_TRY_TIMEOUT: Duration = Duration::from_secs(5);
const SHELL_PROBE_BASE_BACKOFF: Duration = Duration::from_secs(1);
const SHELL_PROBE_MAX_BACKOFF: Duration = Duration::from_secs(3);
const TRANSIENT_OFFLINE_TOLERANCE: u32 = 5;

const RAMDISK_MAGICS: &[&str] = &["1021994", "01021994"];

pub struct ReadinessMonitor {
    bridge: Arc<BridgeClient>,
    config: FleetConfig,
}

impl ReadinessMonitor {
    pub fn new(bridge: Arc<BridgeClient>, config: FleetConfig) -> Self {
        ReadinessMonitor { bridge, config }
    }

    /// Runs all enabled probes in order; the first failure short-circuits
    /// the rest.
    #[tracing::instrument(skip(self, record), fields(serial = %record.serial()))]
    pub async fn probe(&self, record: &Record) -> Result<(), FleetError> {
        self.probe_shell_responsive(record).await?;
        self.probe_boot_complete(record).await?;
        self.probe_external_storage(record).await?;
        Ok(())
    }

    /// Repeatedly executes `id` up to a ~30s budget, 1s base backoff
    /// growing linearly to 3s; success when output contains `uid=`. Up to
    /// 5 transient offline errors are tolerated before giving up early.
    async fn probe_shell_responsive(&self, record: &Record) -> Result<(), FleetError> {
        let start = tokio::time::Instant::now();
        let mut backoff = SHELL_PROBE_BASE_BACKOFF;
        let mut transient_offline_errors = 0u32;

        loop {
            match self.bridge.execute_shell(record.serial(), "id", SHELL_PROBE_PER_TRY_TIMEOUT).await {
                Ok(output) if output.contains("uid=") => return Ok(()),
                Ok(_) => {}
                Err(BridgeError::RejectedWhileOffline) => {
                    transient_offline_errors += 1;
                    if transient_offline_errors > TRANSIENT_OFFLINE_TOLERANCE {
                        return Err(FleetError::unavailable(record.serial(), "device went offline during shell probe"));
                    }
                }
                Err(_) => {}
            }

            if start.elapsed() >= SHELL_PROBE_BUDGET {
                return Err(FleetError::unresponsive(record.serial(), "shell never became responsive within budget"));
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff + Duration::from_millis(500)).min(SHELL_PROBE_MAX_BACKOFF);
        }
    }

    /// Polls `dev.bootcomplete` until it reads `1`.
    async fn probe_boot_complete(&self, record: &Record) -> Result<(), FleetError> {
        let budget = Duration::from_millis(self.config.device_wait_time_ms);
        let start = tokio::time::Instant::now();

        loop {
            if let Ok(value) = self
                .bridge
                .get_property(record.serial(), "dev.bootcomplete", SHELL_PROBE_PER_TRY_TIMEOUT)
                .await
            {
                if value.trim() == "1" {
                    return Ok(());
                }
            }
            if start.elapsed() >= budget {
                return Err(FleetError::unresponsive(record.serial(), "boot did not complete within budget"));
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    /// Resolves the storage mount point, optionally rejects RAM-disk-backed
    /// mounts, then write/read/deletes a marker file. A no-op when
    /// `enabled_filesystem_check` is off.
    async fn probe_external_storage(&self, record: &Record) -> Result<(), FleetError> {
        if !self.config.enabled_filesystem_check {
            return Ok(());
        }
        let wait = Duration::from_millis(self.config.shell_wait_time_ms);
        let mount_point = self
            .bridge
            .get_mount_point(record.serial(), "fleet-probe", wait)
            .await
            .map_err(|e| FleetError::unavailable(record.serial(), e.to_string()))?;

        let magic = self
            .bridge
            .execute_shell(record.serial(), &format!("stat -f -c %t {mount_point}"), wait)
            .await
            .map_err(|e| FleetError::unavailable(record.serial(), e.to_string()))?;
        if RAMDISK_MAGICS.contains(&magic.trim()) {
            return Err(FleetError::unavailable(record.serial(), "external storage resolves to a ram-disk"));
        }

        let marker = format!("{mount_point}/.fleet-probe-{}", sanitize_serial(record.serial()));
        let mut permission_denied_retries = 0u32;
        loop {
            let cmd = format!("echo ok > {marker} && cat {marker} && rm -f {marker}");
            match self.bridge.execute_shell(record.serial(), &cmd, wait).await {
                Ok(output) if output.trim() == "ok" => return Ok(()),
                Ok(other) => {
                    return Err(FleetError::DeviceUnexpectedResponse {
                        serial: record.serial().to_string(),
                        reason: format!("marker file round-trip returned {other:?}"),
                    });
                }
                Err(err) if err.to_string().contains("Permission denied") => {
                    permission_denied_retries += 1;
                    if permission_denied_retries > 1 {
                        return Err(FleetError::unavailable(record.serial(), "permission denied writing storage marker file"));
                    }
                }
                Err(err) => return Err(FleetError::unavailable(record.serial(), err.to_string())),
            }
        }
    }
}

fn sanitize_serial(serial: &str) -> String {
    serial.chars().map(|c| if c.is_alphanumeric() { c } else { '_' }).collect()
}

/// Runs a readiness probe for `serial` in the background and posts the
/// follow-up event. Shared between the Bridge Listener (a Record entering
/// `Checking_Availability` from discovery) and the Fleet Manager (a Record
/// entering it from `free`) so both sites apply the same rule: probe
/// failure routes to Unavailable, it never propagates to the caller.
pub fn spawn_availability_check(registry: Arc<Registry>, readiness: Arc<ReadinessMonitor>, serial: String) {
    tokio::spawn(async move {
        let Some(record) = registry.get(&serial) else {
            return;
        };
        match readiness.probe(&record).await {
            Ok(()) => {
                registry.apply_event(&serial, AllocationEvent::AvailableCheckPassed);
            }
            Err(err) => {
                tracing::warn!(%serial, %err, "readiness probe failed");
                registry.apply_event(&serial, AllocationEvent::AvailableCheckFailed);
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_network_serial_for_marker_filename() {
        assert_eq!(sanitize_serial("10.0.0.5:5555"), "10_0_0_5_5555");
    }

    #[test]
    fn ramdisk_magic_table_matches_known_values() {
        assert!(RAMDISK_MAGICS.contains(&"1021994"));
        assert!(RAMDISK_MAGICS.contains(&"01021994"));
    }
}
