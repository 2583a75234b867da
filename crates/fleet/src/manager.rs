//! The Fleet Manager facade.
//!
//! Owns every other component's lifetime and wires them together: the
//! Registry, a Bridge Listener sitting atop a `BridgeClient`, the Readiness
//! Monitor, the Low-Level-Mode Poller (when a fastboot-shaped binary is
//! configured), the Recoverer, and the periodic multi-device recovery sweep.
//! `init`/`terminate` are idempotent; every other method assumes `init` has
//! already completed.
//!
//! Host-metric monitoring and unpacked-temp-directory cleanup are not
//! wired in here; nothing outside this crate depends on either, and they
//! can be layered on without touching the allocation path.

use crate::bridge_listener::{BridgeListener, FirstDeviceSeenLatch};
use crate::lowlevel::{FastbootTool, LowLevelDeviceEntry, LowLevelRebootTarget, LowLevelTool};
use crate::poller::LowLevelPoller;
use crate::readiness::{self, ReadinessMonitor};
use crate::record::Record;
use crate::recovery::{self, Recoverer};
use crate::registry::{AllocateMiss, Registry};
use crate::usb::{NusbBus, UsbBus};
use crate::virtual_driver::{self, VirtualDriver, VirtualLaunchState};
use async_trait::async_trait;
use bridge_sdk::{BridgeClient, ListenerHandle};
use parking_lot::Mutex;
use shared::{AllocationEvent, AllocationState, DeviceKind, FleetConfig, FleetError, SelectionCriteria};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_retry::strategy::FixedInterval;
use tokio_retry::Retry;
use tokio_util::sync::CancellationToken;

/// Outcome a caller reports when returning a device to the pool, mapped
/// onto the matching `Allocated -> *` row of the state-machine table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeState {
    Available,
    Unavailable,
    Unresponsive,
    Unknown,
}

/// No low-level binary was detected at `init` time; the Recoverer and poller
/// fall back to this rather than an `Option` threaded through every call
/// site. An empty device list is already a tolerated outcome of a real
/// listing, so this costs nothing extra downstream.
struct UnavailableLowLevelTool;

#[async_trait]
impl LowLevelTool for UnavailableLowLevelTool {
    async fn list_devices(&self) -> Result<Vec<LowLevelDeviceEntry>, FleetError> {
        Ok(Vec::new())
    }
    async fn reboot(&self, serial: &str, _target: LowLevelRebootTarget) -> Result<(), FleetError> {
        Err(FleetError::ExternalToolFailure {
            tool: "fastboot".to_string(),
            reason: format!("no low-level binary configured; cannot reboot {serial}"),
        })
    }
    async fn getvar_product(&self, _serial: &str) -> Result<String, FleetError> {
        Err(FleetError::ExternalToolFailure {
            tool: "fastboot".to_string(),
            reason: "no low-level binary configured".to_string(),
        })
    }
}

/// Everything only constructible once `init` runs, bundled so
/// `terminate`/`terminate_hard` can tear it all down in one place.
struct Daemons {
    bridge: Arc<BridgeClient>,
    listener_handle: ListenerHandle,
    readiness: Arc<ReadinessMonitor>,
    poller: Option<Arc<LowLevelPoller>>,
    recoverer: Arc<Recoverer>,
    recovery_sweep_cancel: CancellationToken,
    recovery_sweep_task: tokio::task::JoinHandle<()>,
}

pub struct FleetManager {
    config: FleetConfig,
    registry: Arc<Registry>,
    first_seen: Arc<FirstDeviceSeenLatch>,
    usb: Arc<dyn UsbBus>,
    virtual_driver: VirtualDriver,
    virtual_states: Mutex<HashMap<String, VirtualLaunchState>>,
    /// Serials of ephemeral null records `allocate(temporary=true)` seeded
    /// for a single request. `free` consults this to destroy them instead
    /// of returning them to the shared Available pool.
    temp_serials: Mutex<HashSet<String>>,
    daemons: Mutex<Option<Daemons>>,
    initialized: AtomicBool,
    next_temp_serial: AtomicU64,
}

impl FleetManager {
    /// Thin constructor: no I/O happens until [`FleetManager::init`] runs.
    pub fn new(config: FleetConfig) -> Arc<Self> {
        let registry = Arc::new(Registry::new(Arc::new(|serial: &str| Record::new(serial, DeviceKind::Physical))));
        let virtual_driver = VirtualDriver::new(config.virtual_driver_path.clone());
        Arc::new(FleetManager {
            config,
            registry,
            first_seen: Arc::new(FirstDeviceSeenLatch::default()),
            usb: Arc::new(NusbBus),
            virtual_driver,
            virtual_states: Mutex::new(HashMap::new()),
            temp_serials: Mutex::new(HashSet::new()),
            daemons: Mutex::new(None),
            initialized: AtomicBool::new(false),
            next_temp_serial: AtomicU64::new(0),
        })
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    /// Idempotent startup: a second call is a no-op. Order matters — the
    /// listener is registered before `start_tracking` so the bridge's
    /// initial discovery replay is never dropped
    /// (`bridge_sdk::BridgeClient::init`'s own ordering contract), and
    /// placeholder pools are seeded only after the Registry exists to
    /// receive them. Doesn't start any host-metric monitoring; there's
    /// none wired into this crate.
    pub async fn init(&self) -> Result<(), FleetError> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let bridge = BridgeClient::init(&self.config.adb_path).await.map_err(|e| FleetError::ExternalToolFailure {
            tool: "adb".to_string(),
            reason: e.to_string(),
        })?;

        let readiness = Arc::new(ReadinessMonitor::new(bridge.clone(), self.config.clone()));
        let listener = Arc::new(BridgeListener::new(
            bridge.clone(),
            self.registry.clone(),
            readiness.clone(),
            self.first_seen.clone(),
        ));
        let listener_handle = bridge.add_listener(listener);
        bridge.start_tracking();

        let has_lowlevel_binary = tokio::fs::try_exists(&self.config.fastboot_path).await.unwrap_or(false);
        let lowlevel: Arc<dyn LowLevelTool> = if has_lowlevel_binary {
            Arc::new(FastbootTool::new(self.config.fastboot_path.clone()))
        } else {
            Arc::new(UnavailableLowLevelTool)
        };

        let poller = if has_lowlevel_binary {
            let poller = LowLevelPoller::new(self.registry.clone(), lowlevel.clone(), self.config.clone(), None);
            poller.spawn();
            Some(poller)
        } else {
            None
        };

        let recoverer = Arc::new(Recoverer::new(bridge.clone(), lowlevel, self.usb.clone(), self.config.clone()));

        self.seed_placeholder_pools();

        let recovery_sweep_cancel = CancellationToken::new();
        let recovery_sweep_task = self.spawn_recovery_sweep(recoverer.clone(), recovery_sweep_cancel.clone());

        *self.daemons.lock() = Some(Daemons {
            bridge,
            listener_handle,
            readiness,
            poller,
            recoverer,
            recovery_sweep_cancel,
            recovery_sweep_task,
        });

        Ok(())
    }

    fn spawn_recovery_sweep(&self, recoverer: Arc<Recoverer>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let registry = self.registry.clone();
        let period = Duration::from_millis(self.config.device_recovery_interval_ms.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // first tick fires immediately; don't sweep at t=0
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = interval.tick() => {}
                }
                let unavailable = registry.records_in_state(AllocationState::Unavailable);
                recovery::recovery_sweep(&recoverer, unavailable).await;
            }
        })
    }

    fn seed_placeholder_pools(&self) {
        self.seed_pool(DeviceKind::Null, self.config.max_null_devices, "null-device");
        self.seed_pool(DeviceKind::EmulatorSlot, self.config.max_emulators, "emulator");
        self.seed_pool(DeviceKind::VirtualLocal, self.config.max_local_virtual_devices, "local-virtual");
        self.seed_pool(DeviceKind::VirtualRemoteGce, self.config.max_gce_devices, "remote-gce");
        self.seed_pool(DeviceKind::VirtualRemoteKnownIp, self.config.max_remote_devices, "remote-known-ip");
    }

    fn seed_pool(&self, kind: DeviceKind, count: u32, prefix: &str) {
        for i in 0..count {
            let serial = format!("{prefix}-{i}");
            self.registry.seed(&serial, kind);
            self.registry.force_available(&serial);
        }
    }

    fn active_readiness(&self) -> Option<Arc<ReadinessMonitor>> {
        self.daemons.lock().as_ref().map(|d| d.readiness.clone())
    }

    /// Services an allocation request. `temporary` seeds and pins a
    /// throwaway null record for the duration of a single invocation
    /// rather than drawing from the shared pool; `free` destroys it
    /// afterward instead of returning it to the pool. Under the
    /// `FLEET_SANDBOX_ENABLED` env var, a miss is retried up to
    /// `sandbox_retry_attempts` times, spaced `sandbox_retry_spacing_ms`
    /// apart, since sandboxed runs see the pool populate asynchronously
    /// after the manager starts.
    pub async fn allocate(&self, criteria: SelectionCriteria, temporary: bool) -> Result<Arc<Record>, FleetError> {
        let criteria = if temporary {
            let serial = format!("temp-null-{}", self.next_temp_serial.fetch_add(1, Ordering::SeqCst));
            self.registry.seed(&serial, DeviceKind::Null);
            self.registry.force_available(&serial);
            self.temp_serials.lock().insert(serial.clone());
            criteria.with_forced_serial(serial)
        } else {
            criteria
        };

        let sandboxed = std::env::var(FleetConfig::SANDBOX_ENABLED_ENV)
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let attempts = if sandboxed { self.config.sandbox_retry_attempts.max(1) } else { 1 };
        let spacing = Duration::from_millis(self.config.sandbox_retry_spacing_ms);

        let last_miss = Mutex::new(AllocateMiss::default());
        let retry_strategy = FixedInterval::new(spacing).take(attempts.saturating_sub(1) as usize);
        let result = Retry::spawn(retry_strategy, || async {
            match self.registry.allocate(&criteria) {
                Ok(record) => Ok(record),
                Err(miss) => {
                    *last_miss.lock() = miss;
                    Err(())
                }
            }
        })
        .await;

        match result {
            Ok(record) => {
                self.materialize_virtual(&record).await;
                Ok(record)
            }
            Err(()) => {
                let last_miss = last_miss.into_inner();
                let top_level_reason = last_miss
                    .reject_reasons
                    .get("*")
                    .cloned()
                    .unwrap_or_else(|| "no device matched the requested criteria".to_string());
                Err(FleetError::SelectionMismatch {
                    top_level_reason,
                    per_candidate: last_miss.reject_reasons,
                })
            }
        }
    }

    /// Launches the backing virtual instance for a freshly allocated
    /// virtual-local/virtual-remote record. A launch failure is logged,
    /// not propagated — the caller already holds an Allocated record and
    /// discovers the failure the same way a physical device's
    /// unresponsiveness would surface, through its own readiness probes
    /// on free.
    async fn materialize_virtual(&self, record: &Record) {
        if record.kind() != DeviceKind::VirtualLocal && !record.kind().is_virtual_remote() {
            return;
        }
        let report_path = std::env::temp_dir().join(format!("fleet-virtual-{}.json", record.serial()));
        match self.virtual_driver.create(record.serial(), &report_path).await {
            Ok(state) => {
                self.virtual_states.lock().insert(record.serial().to_string(), state);
            }
            Err(err) => {
                tracing::warn!(serial = %record.serial(), %err, "virtual driver: create failed");
                self.virtual_states
                    .lock()
                    .insert(record.serial().to_string(), VirtualLaunchState::NeverLaunched);
            }
        }
    }

    /// Returns `serial` to the pool, or destroys it if it was an ephemeral
    /// null record created for a single `allocate(temporary=true)` call.
    pub async fn free(&self, serial: &str, free_state: FreeState) -> Result<(), FleetError> {
        let record = self.registry.get(serial).ok_or_else(|| FleetError::unavailable(serial, "no such record"))?;

        // For emulators this manager launched, kill the process first.
        if record.kind() == DeviceKind::EmulatorSlot {
            record.stop_on_term().await;
        }

        // For virtual-remote and stub-virtual kinds, reset the target's
        // mode to not-available first so the next consumer gets a clean
        // slot.
        if record.kind() == DeviceKind::VirtualLocal || record.kind().is_virtual_remote() {
            record.set_mode(shared::Mode::NotAvailable);
            self.teardown_virtual(serial).await;
        }

        if self.temp_serials.lock().remove(serial) {
            self.registry.remove(serial);
            return Ok(());
        }

        let event = match free_state {
            FreeState::Available => AllocationEvent::FreeAvailable,
            FreeState::Unavailable => AllocationEvent::FreeUnavailable,
            FreeState::Unresponsive => AllocationEvent::FreeUnresponsive,
            FreeState::Unknown => AllocationEvent::FreeUnknown,
        };
        self.registry.apply_event(serial, event);

        if free_state == FreeState::Available {
            if record.kind().is_placeholder() {
                // No hardware behind a placeholder to readiness-probe; its
                // check always passes immediately.
                self.registry.apply_event(serial, AllocationEvent::AvailableCheckPassed);
            } else if let Some(readiness) = self.active_readiness() {
                readiness::spawn_availability_check(self.registry.clone(), readiness, serial.to_string());
            }
        }

        Ok(())
    }

    async fn teardown_virtual(&self, serial: &str) {
        let state = self.virtual_states.lock().remove(serial);
        let Some(state) = state else {
            return;
        };
        if let Some(instance_name) = virtual_driver::needs_teardown(&state) {
            if let Err(err) = self.virtual_driver.delete(instance_name).await {
                tracing::warn!(serial, %err, "virtual driver: delete failed");
            }
        }
    }

    /// Graceful shutdown: unregisters the bridge listener, stops the
    /// bridge tracker, the poller, and the recovery sweep. Idempotent — a
    /// manager that was never `init`'d, or already terminated, returns
    /// immediately. Doesn't delete any unpacked temporary directories a
    /// virtual driver may have left behind; nothing currently tracks
    /// those paths for cleanup.
    pub async fn terminate(&self) -> Result<(), FleetError> {
        let Some(daemons) = self.daemons.lock().take() else {
            return Ok(());
        };
        daemons.recovery_sweep_cancel.cancel();
        let _ = daemons.recovery_sweep_task.await;
        if let Some(poller) = &daemons.poller {
            poller.stop();
        }
        daemons.bridge.remove_listener(daemons.listener_handle);
        daemons
            .bridge
            .terminate()
            .await
            .map_err(|e| FleetError::ExternalToolFailure {
                tool: "adb".to_string(),
                reason: e.to_string(),
            })?;
        self.initialized.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Cancels every in-flight and future recovery attempt immediately:
    /// installs `AbortWithReason` on every known Record, then tears down
    /// the same way `terminate` does.
    pub async fn terminate_hard(&self, reason: impl Into<String>) -> Result<(), FleetError> {
        let reason = reason.into();
        for record in self.registry.records() {
            record.set_recovery(crate::recovery::RecoveryStrategy::AbortWithReason(reason.clone()));
        }
        self.terminate().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::RecoveryStrategy;

    fn config_with_null_pool(n: u32) -> FleetConfig {
        FleetConfig {
            max_null_devices: n,
            ..FleetConfig::default()
        }
    }

    /// `allocate`/`free` round-trip a null placeholder without ever
    /// calling `init` (seeding and the placeholder's own readiness pass
    /// need no bridge daemon).
    #[tokio::test]
    async fn facade_allocate_free_round_trips_null_placeholder() {
        let manager = FleetManager::new(config_with_null_pool(3));
        manager.seed_placeholder_pools();
        assert_eq!(manager.registry.len(), 3);

        let criteria = SelectionCriteria {
            device_kind_requested: Some(DeviceKind::Null),
            ..Default::default()
        };
        let record = manager.allocate(criteria, false).await.expect("should allocate a null placeholder");
        assert!(record.serial().starts_with("null-device-"));
        assert_eq!(record.allocation_state(), AllocationState::Allocated);

        manager.free(record.serial(), FreeState::Available).await.expect("free should succeed");
        // Placeholders skip the readiness probe entirely; the round trip
        // lands back on Available synchronously.
        assert_eq!(record.allocation_state(), AllocationState::Available);
    }

    /// `allocate(temporary=true)` pins a freshly seeded ephemeral null
    /// record via a forced serial.
    #[tokio::test]
    async fn temporary_allocate_creates_and_pins_ephemeral_null() {
        let manager = FleetManager::new(FleetConfig::default());
        let record = manager
            .allocate(SelectionCriteria::any(), true)
            .await
            .expect("temporary allocation should always succeed");
        assert!(record.serial().starts_with("temp-null-"));
        assert_eq!(record.kind(), DeviceKind::Null);
    }

    /// Freeing an ephemeral null record destroys it rather than returning
    /// it to the shared Available pool, where it could otherwise be
    /// handed to an unrelated non-temporary `allocate(kind=Null)` request.
    #[tokio::test]
    async fn free_destroys_temporary_null_instead_of_pooling_it() {
        let manager = FleetManager::new(FleetConfig::default());
        let record = manager
            .allocate(SelectionCriteria::any(), true)
            .await
            .expect("temporary allocation should always succeed");
        let serial = record.serial().to_string();
        drop(record);

        manager.free(&serial, FreeState::Available).await.expect("free should succeed");

        assert!(manager.registry.get(&serial).is_none());
        assert!(manager
            .registry
            .records_in_state(AllocationState::Available)
            .iter()
            .all(|r| r.serial() != serial));

        let criteria = SelectionCriteria {
            device_kind_requested: Some(DeviceKind::Null),
            ..Default::default()
        };
        let err = manager.allocate(criteria, false).await.unwrap_err();
        assert!(matches!(err, FleetError::SelectionMismatch { .. }));
    }

    /// A request nothing can satisfy returns `SelectionMismatch` rather
    /// than panicking or blocking.
    #[tokio::test]
    async fn allocate_with_no_match_returns_selection_mismatch() {
        let manager = FleetManager::new(FleetConfig::default());
        let err = manager
            .allocate(
                SelectionCriteria {
                    device_kind_requested: Some(DeviceKind::Physical),
                    ..Default::default()
                },
                false,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::SelectionMismatch { .. }));
    }

    /// `terminate_hard` installs `AbortWithReason` on every known Record
    /// before tearing down, so an in-flight recovery attempt fails fast
    /// with the cancellation reason rather than running to completion.
    #[tokio::test]
    async fn terminate_hard_installs_abort_on_every_record() {
        let manager = FleetManager::new(FleetConfig::default());
        let y = manager.registry.find_or_create("Y");
        assert!(matches!(y.recovery_strategy(), RecoveryStrategy::WaitRebootUsbReset));

        manager
            .terminate_hard("cancelled by user")
            .await
            .expect("terminate_hard without an active init should still succeed");

        match y.recovery_strategy() {
            RecoveryStrategy::AbortWithReason(reason) => assert_eq!(reason, "cancelled by user"),
            other => panic!("expected AbortWithReason, got {other:?}"),
        }
    }
}
