//! The Low-Level-Mode Poller.
//!
//! A daemon task sweeping the low-level tool for bootloader/fastbootd
//! devices every ~5s. Registered listeners are invoked once per sweep,
//! outside the Registry lock, against a defensive snapshot of the listener
//! set — the same "copy before invoking" pattern
//! `bridge_sdk::BridgeClient::snapshot_listeners` uses for its own
//! callback dispatch.

use crate::lowlevel::LowLevelTool;
use crate::registry::Registry;
use async_trait::async_trait;
use parking_lot::Mutex;
use shared::descriptor::DeviceDescriptor;
use shared::FleetConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const SWEEP_PERIOD: Duration = Duration::from_secs(5);

#[async_trait]
pub trait LowLevelListener: Send + Sync {
    async fn on_update(&self, devices: &[DeviceDescriptor]);
}

/// Admits or rejects a serial the poller has never seen before, per the
/// global device filter. `None` admits everything.
pub type GlobalFilter = Arc<dyn Fn(&str) -> bool + Send + Sync>;

pub struct LowLevelPoller {
    registry: Arc<Registry>,
    tool: Arc<dyn LowLevelTool>,
    config: FleetConfig,
    global_filter: Option<GlobalFilter>,
    listeners: Mutex<Vec<Arc<dyn LowLevelListener>>>,
    stop: CancellationToken,
}

impl LowLevelPoller {
    pub fn new(registry: Arc<Registry>, tool: Arc<dyn LowLevelTool>, config: FleetConfig, global_filter: Option<GlobalFilter>) -> Arc<Self> {
        Arc::new(LowLevelPoller {
            registry,
            tool,
            config,
            global_filter,
            listeners: Mutex::new(Vec::new()),
            stop: CancellationToken::new(),
        })
    }

    pub fn add_listener(&self, listener: Arc<dyn LowLevelListener>) {
        self.listeners.lock().push(listener);
    }

    fn snapshot_listeners(&self) -> Vec<Arc<dyn LowLevelListener>> {
        self.listeners.lock().clone()
    }

    fn admits(&self, serial: &str) -> bool {
        match &self.global_filter {
            Some(filter) => filter(serial),
            None => true,
        }
    }

    /// Spawns the daemon sweep loop. Cooperative cancellation only: early
    /// termination before the Fleet Manager finishes teardown must be
    /// avoided, so blocked waiters never livelock; `stop()` merely
    /// requests the loop exit at its next checkpoint.
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let poller = self.clone();
        tokio::spawn(async move { poller.run().await })
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }

    async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(SWEEP_PERIOD);
        loop {
            tokio::select! {
                _ = self.stop.cancelled() => return,
                _ = interval.tick() => {}
            }
            if let Err(err) = self.sweep().await {
                tracing::warn!(%err, "low-level poller: sweep failed");
            }
        }
    }

    async fn sweep(&self) -> Result<(), shared::FleetError> {
        let entries = self.tool.list_devices().await?;

        let mut bootloader_serials = Vec::new();
        let mut fastbootd_serials = Vec::new();
        for entry in &entries {
            if entry.is_fastbootd && self.config.fastbootd_enabled {
                fastbootd_serials.push(entry.serial.clone());
            } else {
                bootloader_serials.push(entry.serial.clone());
            }
        }

        self.registry
            .update_mode_states(&bootloader_serials, false, |serial| self.admits(serial));
        self.registry
            .update_mode_states(&fastbootd_serials, true, |serial| self.admits(serial));

        let snapshot = self.registry.snapshot();
        for listener in self.snapshot_listeners() {
            listener.on_update(&snapshot).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lowlevel::LowLevelDeviceEntry;
    use crate::lowlevel::LowLevelRebootTarget;
    use crate::record::Record;
    use shared::DeviceKind;
    use shared::FleetError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedTool(Vec<LowLevelDeviceEntry>);

    #[async_trait]
    impl LowLevelTool for FixedTool {
        async fn list_devices(&self) -> Result<Vec<LowLevelDeviceEntry>, FleetError> {
            Ok(self.0.clone())
        }
        async fn reboot(&self, _serial: &str, _target: LowLevelRebootTarget) -> Result<(), FleetError> {
            Ok(())
        }
        async fn getvar_product(&self, _serial: &str) -> Result<String, FleetError> {
            Ok(String::new())
        }
    }

    struct CountingListener(Arc<AtomicUsize>);

    #[async_trait]
    impl LowLevelListener for CountingListener {
        async fn on_update(&self, _devices: &[DeviceDescriptor]) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn sweep_classifies_and_creates_records() {
        let registry = Arc::new(Registry::new(Arc::new(|s: &str| Record::new(s, DeviceKind::Physical))));
        let tool = Arc::new(FixedTool(vec![
            LowLevelDeviceEntry {
                serial: "X1".to_string(),
                is_fastbootd: false,
            },
            LowLevelDeviceEntry {
                serial: "X2".to_string(),
                is_fastbootd: true,
            },
        ]));
        let poller = LowLevelPoller::new(registry.clone(), tool, FleetConfig::default(), None);
        let counter = Arc::new(AtomicUsize::new(0));
        poller.add_listener(Arc::new(CountingListener(counter.clone())));

        poller.sweep().await.unwrap();

        assert!(registry.get("X1").is_some());
        assert!(registry.get("X2").is_some());
        assert!(!registry.get("X1").unwrap().get_descriptor().is_low_level_userspace);
        assert!(registry.get("X2").unwrap().get_descriptor().is_low_level_userspace);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn global_filter_rejects_unknown_serials() {
        let registry = Arc::new(Registry::new(Arc::new(|s: &str| Record::new(s, DeviceKind::Physical))));
        let tool = Arc::new(FixedTool(vec![LowLevelDeviceEntry {
            serial: "BLOCKED".to_string(),
            is_fastbootd: false,
        }]));
        let filter: GlobalFilter = Arc::new(|s: &str| s != "BLOCKED");
        let poller = LowLevelPoller::new(registry.clone(), tool, FleetConfig::default(), Some(filter));
        poller.sweep().await.unwrap();
        assert!(registry.get("BLOCKED").is_none());
    }
}
