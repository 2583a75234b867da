//! The Bridge Listener.
//!
//! Translates `bridge_sdk::listener::DeviceChangeListener` callbacks into
//! Registry events. Callbacks run on bridge-owned dispatch and must never
//! hold a Registry lock across a bridge call, so every branch here does
//! its one `get_state` round-trip, then hands off to
//! `Registry::apply_event` (which takes and releases its own lock) rather
//! than threading a borrowed lock guard through the `.await`.

use crate::readiness::ReadinessMonitor;
use crate::registry::Registry;
use async_trait::async_trait;
use bridge_sdk::dto::{ChangeMask, DeviceState};
use bridge_sdk::listener::DeviceChangeListener;
use bridge_sdk::BridgeClient;
use shared::{AllocationEvent, Mode};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Startup synchronization primitive: released by the first ONLINE
/// transition any device makes.
#[derive(Default)]
pub struct FirstDeviceSeenLatch {
    fired: AtomicBool,
    notify: Notify,
}

impl FirstDeviceSeenLatch {
    fn fire(&self) {
        if !self.fired.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    pub async fn wait(&self) {
        if self.fired.load(Ordering::SeqCst) {
            return;
        }
        self.notify.notified().await;
    }
}

pub struct BridgeListener {
    bridge: Arc<BridgeClient>,
    registry: Arc<Registry>,
    readiness: Arc<ReadinessMonitor>,
    first_seen: Arc<FirstDeviceSeenLatch>,
}

impl BridgeListener {
    pub fn new(
        bridge: Arc<BridgeClient>,
        registry: Arc<Registry>,
        readiness: Arc<ReadinessMonitor>,
        first_seen: Arc<FirstDeviceSeenLatch>,
    ) -> Self {
        BridgeListener {
            bridge,
            registry,
            readiness,
            first_seen,
        }
    }

    /// Spawns the background readiness probe a `Checking_Availability`
    /// entry triggers. Bridge-callback bodies must swallow their own
    /// exceptions; see [`crate::readiness::spawn_availability_check`] for
    /// the shared probe-then-post-event logic.
    fn spawn_readiness_probe(&self, serial: String) {
        crate::readiness::spawn_availability_check(self.registry.clone(), self.readiness.clone(), serial);
    }
}

#[async_trait]
impl DeviceChangeListener for BridgeListener {
    async fn connected(&self, serial: &str) {
        match self.bridge.get_state(serial).await {
            Ok(DeviceState::Online) => {
                let record = self.registry.find_or_create(serial);
                record.set_mode(Mode::Online);
                self.registry.apply_event(serial, AllocationEvent::ConnectedOnline);
                self.first_seen.fire();
                self.spawn_readiness_probe(serial.to_string());
            }
            Ok(other) => {
                let record = self.registry.find_or_create(serial);
                record.set_mode(map_device_state(other));
                self.registry.apply_event(serial, AllocationEvent::ConnectedOffline);
            }
            Err(err) => {
                tracing::warn!(serial, %err, "bridge listener: connected callback could not read device state");
            }
        }
    }

    async fn disconnected(&self, serial: &str) {
        self.registry.apply_event(serial, AllocationEvent::Disconnected);
    }

    async fn changed(&self, serial: &str, mask: ChangeMask) {
        if !mask.contains(ChangeMask::STATE) {
            return;
        }
        match self.bridge.get_state(serial).await {
            Ok(DeviceState::Online) => {
                let record = self.registry.find_or_create(serial);
                record.set_mode(Mode::Online);
                self.registry.apply_event(serial, AllocationEvent::StateChangeOnline);
                self.first_seen.fire();
                self.spawn_readiness_probe(serial.to_string());
            }
            Ok(other) => {
                let record = self.registry.find_or_create(serial);
                record.set_mode(map_device_state(other));
                self.registry.apply_event(serial, AllocationEvent::StateChangeOffline);
            }
            Err(err) => {
                tracing::warn!(serial, %err, "bridge listener: changed callback could not read device state");
            }
        }
    }
}

/// Maps the bridge's own state vocabulary onto `shared::Mode`.
fn map_device_state(state: DeviceState) -> Mode {
    match state {
        DeviceState::Online => Mode::Online,
        DeviceState::Offline => Mode::Offline,
        DeviceState::Unauthorized => Mode::Unauthorized,
        DeviceState::Bootloader => Mode::Bootloader,
        DeviceState::Recovery => Mode::RecoveryMode,
        DeviceState::Sideload => Mode::Sideload,
        DeviceState::Disconnected => Mode::NotAvailable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn latch_releases_waiters_on_fire() {
        let latch = Arc::new(FirstDeviceSeenLatch::default());
        let waiter_latch = latch.clone();
        let waiter = tokio::spawn(async move {
            waiter_latch.wait().await;
        });
        latch.fire();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("latch wait should complete")
            .unwrap();
    }

    #[test]
    fn maps_bootloader_and_recovery_states() {
        assert_eq!(map_device_state(DeviceState::Bootloader), Mode::Bootloader);
        assert_eq!(map_device_state(DeviceState::Recovery), Mode::RecoveryMode);
    }
}
