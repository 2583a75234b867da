//! Recovery strategies and the Recoverer.
//!
//! A Record's `recovery_strategy` is a small tagged variant rather than a
//! trait object — cheap to clone out from under the Record's monitor and
//! hand to the recovery task without holding the lock across the ensuing
//! `.await`s.

use crate::lowlevel::{LowLevelRebootTarget, LowLevelTool};
use crate::record::Record;
use crate::usb::UsbBus;
use crate::wait::wait_for_mode;
use bridge_sdk::dto::RebootTarget;
use bridge_sdk::BridgeClient;
use shared::{DeviceKind, FleetConfig, FleetError, Mode};
use std::sync::Arc;
use std::time::Duration;

const INITIAL_PAUSE: Duration = Duration::from_secs(5);

/// The recovery strategy a Record carries.
#[derive(Debug, Clone)]
pub enum RecoveryStrategy {
    /// wait-online -> reboot -> USB-reset -> recovery-mode reboot -> give up.
    /// Used by physical devices.
    WaitRebootUsbReset,
    /// Virtual/emulator targets have no USB bus or bootloader to escalate
    /// through; recovery means relaunching the backing process instead.
    CvdRelaunch,
    /// Installed by `terminateHard`: every subsequent recovery call raises
    /// immediately with this message, the cancellation primitive for
    /// in-flight tests.
    AbortWithReason(String),
}

impl RecoveryStrategy {
    pub fn default_for(kind: DeviceKind) -> Self {
        match kind {
            DeviceKind::Physical | DeviceKind::LowLevelOnly => RecoveryStrategy::WaitRebootUsbReset,
            DeviceKind::EmulatorSlot | DeviceKind::VirtualLocal => RecoveryStrategy::CvdRelaunch,
            DeviceKind::VirtualRemoteKnownIp | DeviceKind::VirtualRemoteGce => RecoveryStrategy::CvdRelaunch,
            DeviceKind::Null => RecoveryStrategy::WaitRebootUsbReset,
        }
    }
}

/// Per-device recovery escalation, plus the periodic multi-device sweep.
pub struct Recoverer {
    bridge: Arc<BridgeClient>,
    lowlevel: Arc<dyn LowLevelTool>,
    usb: Arc<dyn UsbBus>,
    config: FleetConfig,
}

impl Recoverer {
    pub fn new(bridge: Arc<BridgeClient>, lowlevel: Arc<dyn LowLevelTool>, usb: Arc<dyn UsbBus>, config: FleetConfig) -> Self {
        Recoverer {
            bridge,
            lowlevel,
            usb,
            config,
        }
    }

    /// Attempts to bring `record` back online, per its current recovery
    /// strategy. Returns `Ok(())` on success (device online, shell
    /// responsive, battery post-condition satisfied); `Err` otherwise.
    #[tracing::instrument(skip(self, record), fields(serial = %record.serial()))]
    pub async fn recover(&self, record: &Record) -> Result<(), FleetError> {
        match record.recovery_strategy() {
            RecoveryStrategy::AbortWithReason(reason) => Err(FleetError::AllocationCancelled { reason }),
            RecoveryStrategy::CvdRelaunch => self.recover_virtual(record).await,
            RecoveryStrategy::WaitRebootUsbReset => self.recover_to_online(record).await,
        }
    }

    async fn recover_virtual(&self, record: &Record) -> Result<(), FleetError> {
        // Virtual targets have no bootloader/USB to escalate through; the
        // Fleet Manager relaunches the backing process on free/allocate
        // instead. Recovery here is a readiness re-check.
        if self.shell_responsive(record).await {
            Ok(())
        } else {
            Err(FleetError::unavailable(record.serial(), "virtual target not responsive; relaunch required"))
        }
    }

    async fn recover_to_online(&self, record: &Record) -> Result<(), FleetError> {
        tokio::time::sleep(INITIAL_PAUSE).await;

        // Fast path: already online and responsive means no reboot is
        // issued at all.
        if record.mode() == Mode::Online && self.shell_responsive(record).await {
            return self.check_post_recovery_battery(record).await;
        }

        // Step 2: update low-level mode once; reboot out of bootloader if
        // currently stuck there.
        if let Ok(entries) = self.lowlevel.list_devices().await {
            if entries.iter().any(|e| e.serial == record.serial()) {
                self.lowlevel.reboot(record.serial(), LowLevelRebootTarget::Normal).await.ok();
            }
        }

        // Step 3: wait for online, then shell readiness.
        let online_deadline = Duration::from_millis(self.config.online_wait_time_ms);
        if !wait_for_mode(record, online_deadline, |m| m == Mode::Online).await {
            return Err(FleetError::unavailable(record.serial(), "device did not come online within budget"));
        }
        let shell_deadline = Duration::from_millis(self.config.shell_wait_time_ms);
        if wait_for_shell(self, record, shell_deadline).await {
            return self.check_post_recovery_battery(record).await;
        }

        // Step 4: online but unresponsive; reboot and re-wait once, if
        // allowed.
        if !self.config.disable_unresponsive_reboot {
            self.bridge.reboot(record.serial(), RebootTarget::Normal).await.ok();
            if wait_for_mode(record, online_deadline, |m| m == Mode::Online).await
                && wait_for_shell(self, record, shell_deadline).await
            {
                return self.check_post_recovery_battery(record).await;
            }
        }

        // Step 5: USB bus reset, skipped for network-attached, fastboot
        // modes, and recovery-mode targets.
        let mode = record.mode();
        let usb_reset_applicable = !self.config.disable_usb_reset
            && !is_network_serial(record.serial())
            && !matches!(mode, Mode::Bootloader | Mode::LowLevelUserspace | Mode::RecoveryMode);
        if usb_reset_applicable && self.usb.reset(record.serial()).await.is_ok() {
            if wait_for_mode(record, online_deadline, |m| m == Mode::Online).await
                && wait_for_shell(self, record, shell_deadline).await
            {
                return self.check_post_recovery_battery(record).await;
            }
        }

        // Step 6: if the reset landed the device in recovery-mode, reboot
        // to normal and re-wait once more.
        if record.mode() == Mode::RecoveryMode {
            self.bridge.reboot(record.serial(), RebootTarget::Normal).await.ok();
            if wait_for_mode(record, online_deadline, |m| m == Mode::Online).await
                && wait_for_shell(self, record, shell_deadline).await
            {
                return self.check_post_recovery_battery(record).await;
            }
        }

        // Step 7: give up.
        Err(FleetError::unavailable(record.serial(), "recovery escalation exhausted"))
    }

    async fn shell_responsive(&self, record: &Record) -> bool {
        let wait = Duration::from_millis(self.config.shell_wait_time_ms);
        matches!(
            self.bridge.execute_shell(record.serial(), "id", wait).await,
            Ok(ref out) if out.contains("uid=")
        )
    }

    async fn check_post_recovery_battery(&self, record: &Record) -> Result<(), FleetError> {
        let Some(min_battery) = self.config.min_battery_after_recovery else {
            return Ok(());
        };
        let wait = Duration::from_millis(500);
        match self.bridge.get_battery(record.serial(), wait).await {
            Ok(Some(reading)) if reading.level_percent >= min_battery => Ok(()),
            _ => Err(FleetError::unavailable(
                record.serial(),
                format!("battery below minimum {min_battery} after recovery"),
            )),
        }
    }
}

const SHELL_POLL_INTERVAL: Duration = Duration::from_millis(200);

async fn wait_for_shell(recoverer: &Recoverer, record: &Record, deadline: Duration) -> bool {
    let start = tokio::time::Instant::now();
    loop {
        if recoverer.shell_responsive(record).await {
            return true;
        }
        if start.elapsed() >= deadline {
            return false;
        }
        tokio::time::sleep(SHELL_POLL_INTERVAL).await;
    }
}

fn is_network_serial(serial: &str) -> bool {
    serial.contains(':')
}

/// The periodic multi-device recovery sweep, distinct from per-Record
/// recovery above. Strategy failures are isolated behind a broad catch +
/// log so one bad Record never aborts the sweep.
pub async fn recovery_sweep(recoverer: &Recoverer, unavailable: Vec<Arc<Record>>) {
    for record in unavailable {
        match recoverer.recover(&record).await {
            Ok(()) => {
                tracing::info!(serial = %record.serial(), "recovery sweep: device recovered");
            }
            Err(err) => {
                tracing::warn!(serial = %record.serial(), %err, "recovery sweep: attempt failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lowlevel::LowLevelDeviceEntry;
    use crate::usb::mock::MockUsbBus;
    use async_trait::async_trait;

    struct NoLowLevelDevices;

    #[async_trait]
    impl LowLevelTool for NoLowLevelDevices {
        async fn list_devices(&self) -> Result<Vec<LowLevelDeviceEntry>, FleetError> {
            Ok(vec![])
        }
        async fn reboot(&self, _serial: &str, _target: LowLevelRebootTarget) -> Result<(), FleetError> {
            Ok(())
        }
        async fn getvar_product(&self, _serial: &str) -> Result<String, FleetError> {
            Ok(String::new())
        }
    }

    #[test]
    fn default_strategy_by_kind() {
        assert!(matches!(
            RecoveryStrategy::default_for(DeviceKind::Physical),
            RecoveryStrategy::WaitRebootUsbReset
        ));
        assert!(matches!(
            RecoveryStrategy::default_for(DeviceKind::EmulatorSlot),
            RecoveryStrategy::CvdRelaunch
        ));
    }

    #[tokio::test]
    async fn abort_strategy_raises_cancelled_immediately() {
        let record = Record::new("Y", DeviceKind::Physical);
        record.set_recovery(RecoveryStrategy::AbortWithReason(
            "aborted test session: cancelled by user".to_string(),
        ));
        let recoverer = Recoverer::new(
            BridgeClient::unconnected("adb", "127.0.0.1:5037"),
            Arc::new(NoLowLevelDevices),
            Arc::new(MockUsbBus::succeeding()),
            FleetConfig::default(),
        );
        let err = recoverer.recover(&record).await.unwrap_err();
        match err {
            FleetError::AllocationCancelled { reason } => {
                assert_eq!(reason, "aborted test session: cancelled by user");
            }
            other => panic!("expected AllocationCancelled, got {other:?}"),
        }
    }
}
