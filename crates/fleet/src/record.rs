//! The Device Record.
//!
//! Mutable per-device state lives behind one `parking_lot::Mutex` (the
//! Record's monitor) so a transition and its derived cache update are
//! always atomic with respect to each other. The descriptor cache itself
//! sits in a separate `RwLock` so readers (the CLI, the selection
//! predicate during an `allocate` scan) never contend with the monitor for
//! a plain snapshot read.

use crate::recovery::RecoveryStrategy;
use crate::state_machine::{self, Transition};
use parking_lot::{Mutex, RwLock};
use shared::descriptor::DeviceDescriptor;
use shared::{AllocationEvent, AllocationState, DeviceKind, Mode};
use std::collections::HashMap;
use tokio::process::Child;
use tokio::sync::Notify;

/// Resources a materialized Record exclusively owns. Emulator and
/// local-virtual placeholders populate these once launched; everything
/// else stays `None` for the Record's lifetime.
#[derive(Default)]
pub struct OwnedResources {
    pub process: Option<Child>,
    pub stdout_capture: Option<tokio::fs::File>,
    pub ephemeral_port: Option<u16>,
    pub temp_dir: Option<tempfile::TempDir>,
}

impl OwnedResources {
    /// Kills the owned process (if any) and drops the rest. Best-effort:
    /// a process that already exited is not an error.
    async fn release(&mut self) {
        if let Some(mut child) = self.process.take() {
            let _ = child.kill().await;
        }
        self.stdout_capture.take();
        self.ephemeral_port.take();
        self.temp_dir.take();
    }
}

struct RecordState {
    mode: Mode,
    allocation_state: AllocationState,
    product: Option<String>,
    variant: Option<String>,
    build_id: Option<String>,
    battery_level: Option<u8>,
    battery_temperature: Option<u32>,
    is_low_level_userspace: bool,
    properties: HashMap<String, String>,
    recovery_strategy: RecoveryStrategy,
    owned: OwnedResources,
}

/// Per-device mutable state. Identity (`serial`, `kind`) is fixed at
/// construction; everything else is interior-mutable.
pub struct Record {
    serial: String,
    kind: DeviceKind,
    state: Mutex<RecordState>,
    descriptor_cache: RwLock<DeviceDescriptor>,
    /// Notified on every `set_mode` call; the Readiness Monitor's
    /// mode-change listener waits on this.
    pub(crate) mode_changed: Notify,
}

impl Record {
    pub fn new(serial: impl Into<String>, kind: DeviceKind) -> Self {
        let serial = serial.into();
        let initial_mode = if kind == DeviceKind::LowLevelOnly {
            Mode::Bootloader
        } else {
            Mode::NotAvailable
        };
        let state = RecordState {
            mode: initial_mode,
            allocation_state: AllocationState::Unknown,
            product: None,
            variant: None,
            build_id: None,
            battery_level: None,
            battery_temperature: None,
            is_low_level_userspace: false,
            properties: HashMap::new(),
            recovery_strategy: RecoveryStrategy::default_for(kind),
            owned: OwnedResources::default(),
        };
        let descriptor = build_descriptor(&serial, kind, &state);
        Record {
            serial,
            kind,
            state: Mutex::new(state),
            descriptor_cache: RwLock::new(descriptor),
            mode_changed: Notify::new(),
        }
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn allocation_state(&self) -> AllocationState {
        self.state.lock().allocation_state
    }

    pub fn mode(&self) -> Mode {
        self.state.lock().mode
    }

    /// Applies `event` under the Record's monitor, updating the descriptor
    /// cache atomically with the transition.
    ///
    /// This is `pub(crate)`: the Registry is the sole caller, so the
    /// by-state reverse index it maintains never drifts from a Record's
    /// own belief about its state.
    pub(crate) fn handle_allocation_event(&self, event: AllocationEvent) -> Transition {
        let mut state = self.state.lock();
        let transition = state_machine::transition(state.allocation_state, event);
        if transition.changed {
            tracing::debug!(serial = %self.serial, from = %state.allocation_state, to = %transition.to, ?event, "allocation state transition");
            state.allocation_state = transition.to;
        }
        self.refresh_descriptor_locked(&state);
        transition
    }

    /// Called by the Bridge Listener; never blocks.
    pub fn set_mode(&self, mode: Mode) {
        let mut state = self.state.lock();
        state.mode = mode;
        self.refresh_descriptor_locked(&state);
        drop(state);
        self.mode_changed.notify_waiters();
    }

    pub fn set_build_info(&self, product: Option<String>, variant: Option<String>, build_id: Option<String>) {
        let mut state = self.state.lock();
        if product.is_some() {
            state.product = product;
        }
        if variant.is_some() {
            state.variant = variant;
        }
        if build_id.is_some() {
            state.build_id = build_id;
        }
        self.refresh_descriptor_locked(&state);
    }

    pub fn set_properties(&self, properties: HashMap<String, String>) {
        let mut state = self.state.lock();
        state.properties = properties;
        self.refresh_descriptor_locked(&state);
    }

    pub fn set_battery(&self, level: Option<u8>, temperature: Option<u32>) {
        let mut state = self.state.lock();
        state.battery_level = level;
        state.battery_temperature = temperature;
        self.refresh_descriptor_locked(&state);
    }

    pub fn set_low_level_userspace(&self, flag: bool) {
        let mut state = self.state.lock();
        state.is_low_level_userspace = flag;
        self.refresh_descriptor_locked(&state);
    }

    /// Clears the low-level-userspace flag only if it currently matches
    /// `if_currently`; backs the Low-Level-Mode Poller's "records not in
    /// the current sweep have their flag cleared" pass.
    pub fn clear_low_level_flag_if(&self, if_currently: bool) {
        let mut state = self.state.lock();
        if state.is_low_level_userspace == if_currently {
            state.is_low_level_userspace = false;
            self.refresh_descriptor_locked(&state);
        }
    }

    pub fn set_recovery(&self, strategy: RecoveryStrategy) {
        self.state.lock().recovery_strategy = strategy;
    }

    pub fn recovery_strategy(&self) -> RecoveryStrategy {
        self.state.lock().recovery_strategy.clone()
    }

    /// O(1), read-lock-free read path.
    pub fn get_descriptor(&self) -> DeviceDescriptor {
        self.descriptor_cache.read().clone()
    }

    pub async fn take_owned_resources(&self, process: Option<Child>, ephemeral_port: Option<u16>, temp_dir: Option<tempfile::TempDir>) {
        let mut state = self.state.lock();
        state.owned.process = process;
        state.owned.ephemeral_port = ephemeral_port;
        state.owned.temp_dir = temp_dir;
    }

    pub fn ephemeral_port(&self) -> Option<u16> {
        self.state.lock().owned.ephemeral_port
    }

    /// Releases owned resources: kills any owned process and drops the
    /// rest.
    pub async fn stop_on_term(&self) {
        // The process kill is async; take it out from under the sync lock
        // first so we never hold `state` across an `.await`.
        let mut owned = {
            let mut state = self.state.lock();
            std::mem::take(&mut state.owned)
        };
        owned.release().await;
    }

    fn refresh_descriptor_locked(&self, state: &RecordState) {
        let descriptor = build_descriptor(&self.serial, self.kind, state);
        *self.descriptor_cache.write() = descriptor;
    }
}

fn build_descriptor(serial: &str, kind: DeviceKind, state: &RecordState) -> DeviceDescriptor {
    DeviceDescriptor {
        serial: serial.to_string(),
        kind,
        mode: state.mode,
        allocation_state: state.allocation_state,
        product: state.product.clone(),
        variant: state.variant.clone(),
        build_id: state.build_id.clone(),
        battery_level: state.battery_level,
        battery_temperature: state.battery_temperature,
        is_low_level_userspace: state.is_low_level_userspace,
        properties: state.properties.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_record_starts_unknown() {
        let r = Record::new("ABC123", DeviceKind::Physical);
        assert_eq!(r.allocation_state(), AllocationState::Unknown);
        assert_eq!(r.get_descriptor().serial, "ABC123");
    }

    #[test]
    fn descriptor_cache_reflects_transition_atomically() {
        let r = Record::new("ABC123", DeviceKind::Physical);
        r.handle_allocation_event(AllocationEvent::ConnectedOnline);
        assert_eq!(r.allocation_state(), AllocationState::CheckingAvailability);
        assert_eq!(
            r.get_descriptor().allocation_state,
            AllocationState::CheckingAvailability
        );
    }

    #[test]
    fn set_mode_never_touches_allocation_state() {
        let r = Record::new("ABC123", DeviceKind::Physical);
        r.handle_allocation_event(AllocationEvent::ConnectedOnline);
        r.set_mode(Mode::Offline);
        assert_eq!(r.mode(), Mode::Offline);
        assert_eq!(r.allocation_state(), AllocationState::CheckingAvailability);
    }

    #[tokio::test]
    async fn stop_on_term_releases_process() {
        let r = Record::new("emulator-5554", DeviceKind::EmulatorSlot);
        let child = tokio::process::Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .expect("spawn sleep");
        r.take_owned_resources(Some(child), Some(5554), None).await;
        assert!(r.ephemeral_port().is_some());
        r.stop_on_term().await;
        assert!(r.ephemeral_port().is_none());
    }
}
