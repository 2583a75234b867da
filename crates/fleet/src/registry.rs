//! The Registry: owner of every known Record and the sole mutator of
//! allocation state.
//!
//! Every transition anywhere in the workspace goes through one of this
//! type's methods, which is what keeps the by-state reverse index (and
//! therefore `allocate`'s scan order) consistent with each Record's own
//! belief about its state. Callers hold the scan lock for the duration of
//! an `allocate` call, so two concurrent callers can never walk away with
//! the same Record.

use crate::record::Record;
use crate::selection::{self, MatchOutcome};
use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;
use shared::descriptor::DeviceDescriptor;
use shared::{AllocationEvent, AllocationState, DeviceKind, SelectionCriteria};
use std::collections::HashMap;
use std::sync::Arc;

/// A factory invoked by `findOrCreate` for serials the Registry has never
/// seen before. Pulled out as a closure rather than hardcoded `Record::new`
/// so the Fleet Manager can inject build-info enrichment at construction
/// time without the Registry depending on the bridge.
pub type RecordFactory = Arc<dyn Fn(&str) -> Record + Send + Sync>;

/// Outcome of an `allocate` call that matched nothing, carrying the
/// predicate's per-serial reject reasons.
#[derive(Debug, Default)]
pub struct AllocateMiss {
    pub reject_reasons: HashMap<String, String>,
    /// True if `serials_include` was set and at least one serial in it was
    /// visited by the scan (even if ultimately rejected) — false triggers
    /// the top-level "couldn't match it" reason.
    pub any_serial_matched: bool,
}

struct Inner {
    by_serial: IndexMap<String, Arc<Record>>,
    by_state: HashMap<AllocationState, IndexSet<String>>,
    factory: RecordFactory,
}

impl Inner {
    fn index_for(serial: &str, state: AllocationState, set: &mut HashMap<AllocationState, IndexSet<String>>) {
        set.entry(state).or_default().insert(serial.to_string());
    }

    fn reindex(&mut self, serial: &str, from: AllocationState, to: AllocationState) {
        if from == to {
            return;
        }
        if let Some(set) = self.by_state.get_mut(&from) {
            set.shift_remove(serial);
        }
        Self::index_for(serial, to, &mut self.by_state);
    }

    fn insert_new(&mut self, serial: String, record: Record) -> Arc<Record> {
        let record = Arc::new(record);
        Self::index_for(&serial, record.allocation_state(), &mut self.by_state);
        self.by_serial.insert(serial, record.clone());
        record
    }

    /// Applies `event` to `record` and keeps the reverse index in sync.
    /// This is the *only* place an allocation-state transition happens.
    fn apply(&mut self, record: &Record, event: AllocationEvent) -> bool {
        let from = record.allocation_state();
        let transition = record.handle_allocation_event(event);
        if transition.changed {
            self.reindex(record.serial(), from, transition.to);
        }
        transition.changed
    }
}

pub struct Registry {
    inner: Mutex<Inner>,
}

impl Registry {
    pub fn new(factory: RecordFactory) -> Self {
        Registry {
            inner: Mutex::new(Inner {
                by_serial: IndexMap::new(),
                by_state: HashMap::new(),
                factory,
            }),
        }
    }

    /// Returns the existing Record for `serial`, or constructs one via the
    /// configured factory. Same instance for the same serial across the
    /// process lifetime.
    pub fn find_or_create(&self, serial: &str) -> Arc<Record> {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.by_serial.get(serial) {
            return existing.clone();
        }
        let record = (inner.factory.clone())(serial);
        inner.insert_new(serial.to_string(), record)
    }

    /// Directly seeds a placeholder Record of a given kind, bypassing
    /// discovery. Returns the existing record if the serial is already
    /// known.
    pub fn seed(&self, serial: impl Into<String>, kind: DeviceKind) -> Arc<Record> {
        let serial = serial.into();
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.by_serial.get(&serial) {
            return existing.clone();
        }
        inner.insert_new(serial.clone(), Record::new(serial, kind))
    }

    pub fn get(&self, serial: &str) -> Option<Arc<Record>> {
        self.inner.lock().by_serial.get(serial).cloned()
    }

    /// Removes `serial` entirely, unlinking it from the by-state index.
    /// For records that should stop existing rather than cycle back to
    /// Available — ephemeral placeholders created for a single request.
    /// Returns the removed record, if it was known.
    pub fn remove(&self, serial: &str) -> Option<Arc<Record>> {
        let mut inner = self.inner.lock();
        let record = inner.by_serial.shift_remove(serial)?;
        if let Some(set) = inner.by_state.get_mut(&record.allocation_state()) {
            set.shift_remove(serial);
        }
        Some(record)
    }

    /// Injects `event` for `serial`, creating the Record first if unknown.
    /// Used by the Bridge Listener and anywhere else that just wants to
    /// post an event without caring about the outcome.
    pub fn apply_event(&self, serial: &str, event: AllocationEvent) -> bool {
        let record = self.find_or_create(serial);
        let mut inner = self.inner.lock();
        inner.apply(&record, event)
    }

    /// Scans the Available set in deterministic (insertion) order under a
    /// single lock; the first Record whose descriptor satisfies `criteria`
    /// is atomically transitioned to Allocated and returned. Holding the
    /// lock across the whole scan is what makes two concurrent `allocate`
    /// calls mutually exclusive.
    pub fn allocate(&self, criteria: &SelectionCriteria) -> Result<Arc<Record>, AllocateMiss> {
        let mut inner = self.inner.lock();
        let mut miss = AllocateMiss::default();

        let candidates: Vec<String> = inner
            .by_state
            .get(&AllocationState::Available)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();

        for serial in candidates {
            let Some(record) = inner.by_serial.get(&serial).cloned() else {
                continue;
            };
            let descriptor = record.get_descriptor();
            match selection::matches(criteria, &descriptor) {
                MatchOutcome::Match => {
                    inner.apply(&record, AllocationEvent::AllocateRequest);
                    return Ok(record);
                }
                MatchOutcome::Reject(reason) => {
                    miss.any_serial_matched = true;
                    miss.reject_reasons.insert(serial, reason);
                }
                MatchOutcome::SilentReject => {}
            }
        }

        if !criteria.serials_include.is_empty() && !miss.any_serial_matched {
            miss.reject_reasons.insert(
                "*".to_string(),
                format!(
                    "need serial ({}) but couldn't match it",
                    criteria.serials_include.join(", ")
                ),
            );
        }
        Err(miss)
    }

    /// Bypasses the predicate entirely; only succeeds if `serial` is
    /// currently Available.
    pub fn force_allocate(&self, serial: &str) -> Option<Arc<Record>> {
        let mut inner = self.inner.lock();
        let record = inner.by_serial.get(serial).cloned()?;
        if inner.apply(&record, AllocationEvent::ForceAllocateRequest) {
            Some(record)
        } else {
            None
        }
    }

    /// Forces a Record to Available regardless of its current state,
    /// creating it first if unknown. Used for placeholder seeding and for
    /// returning placeholder slots to the pool on free.
    pub fn force_available(&self, serial: &str) -> Arc<Record> {
        let record = self.find_or_create(serial);
        let mut inner = self.inner.lock();
        inner.apply(&record, AllocationEvent::ForceAvailable);
        record
    }

    /// Used by the Low-Level-Mode Poller. `is_low_level_userspace` selects
    /// whether this call is classifying the fastbootd sweep or the
    /// bootloader sweep; Records previously flagged under that same value
    /// but absent from `serials` this time have the flag cleared.
    pub fn update_mode_states(&self, serials: &[String], is_low_level_userspace: bool, admit_unknown: impl Fn(&str) -> bool) {
        let mut inner = self.inner.lock();
        let present: std::collections::HashSet<&str> = serials.iter().map(|s| s.as_str()).collect();

        let known_serials: Vec<String> = inner.by_serial.keys().cloned().collect();
        for serial in &known_serials {
            if !present.contains(serial.as_str()) {
                if let Some(record) = inner.by_serial.get(serial) {
                    record.clear_low_level_flag_if(is_low_level_userspace);
                }
            }
        }

        for serial in serials {
            if !inner.by_serial.contains_key(serial) {
                if !admit_unknown(serial) {
                    continue;
                }
                let record = Record::new(serial.clone(), DeviceKind::LowLevelOnly);
                inner.insert_new(serial.clone(), record);
            }
            let record = inner.by_serial.get(serial).cloned().unwrap();
            record.set_low_level_userspace(is_low_level_userspace);
            inner.apply(&record, AllocationEvent::LowLevelDetected);
        }
    }

    /// Point-in-time snapshot of every known Record's descriptor.
    pub fn snapshot(&self) -> Vec<DeviceDescriptor> {
        self.inner
            .lock()
            .by_serial
            .values()
            .map(|r| r.get_descriptor())
            .collect()
    }

    pub fn records(&self) -> Vec<Arc<Record>> {
        self.inner.lock().by_serial.values().cloned().collect()
    }

    pub fn records_in_state(&self, state: AllocationState) -> Vec<Arc<Record>> {
        let inner = self.inner.lock();
        inner
            .by_state
            .get(&state)
            .map(|set| set.iter().filter_map(|s| inner.by_serial.get(s).cloned()).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_serial.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::ProductType;

    fn registry() -> Registry {
        Registry::new(Arc::new(|serial: &str| Record::new(serial, DeviceKind::Physical)))
    }

    #[test]
    fn find_or_create_returns_same_instance() {
        let reg = registry();
        let a = reg.find_or_create("ABC123");
        let b = reg.find_or_create("ABC123");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn null_placeholder_allocation_round_trips() {
        let reg = registry();
        for i in 0..3 {
            let serial = format!("null-device-{i}");
            reg.seed(&serial, DeviceKind::Null);
            reg.force_available(&serial);
        }
        let criteria = SelectionCriteria {
            device_kind_requested: Some(DeviceKind::Null),
            ..Default::default()
        };
        let record = reg.allocate(&criteria).expect("should allocate a null placeholder");
        assert!(record.serial().starts_with("null-device-"));
        assert_eq!(record.allocation_state(), AllocationState::Allocated);

        reg.apply_event(record.serial(), AllocationEvent::FreeAvailable);
        assert_eq!(record.allocation_state(), AllocationState::CheckingAvailability);
        reg.apply_event(record.serial(), AllocationEvent::AvailableCheckPassed);
        assert_eq!(record.allocation_state(), AllocationState::Available);
    }

    #[test]
    fn selection_by_product_variant() {
        let reg = registry();
        let d1 = reg.find_or_create("D1");
        d1.set_build_info(Some("walleye".into()), Some("walleye".into()), None);
        reg.apply_event("D1", AllocationEvent::ConnectedOnline);
        reg.apply_event("D1", AllocationEvent::AvailableCheckPassed);

        let d2 = reg.find_or_create("D2");
        d2.set_build_info(Some("walleye".into()), Some("walleye-retail".into()), None);
        reg.apply_event("D2", AllocationEvent::ConnectedOnline);
        reg.apply_event("D2", AllocationEvent::AvailableCheckPassed);

        let criteria = SelectionCriteria {
            product_types: vec![ProductType::parse("walleye:walleye-retail")],
            ..Default::default()
        };
        let record = reg.allocate(&criteria).expect("D2 should match");
        assert_eq!(record.serial(), "D2");
    }

    #[test]
    fn selection_fails_with_reason_when_only_mismatched_variant_present() {
        let reg = registry();
        let d1 = reg.find_or_create("D1");
        d1.set_build_info(Some("walleye".into()), Some("walleye".into()), None);
        reg.apply_event("D1", AllocationEvent::ConnectedOnline);
        reg.apply_event("D1", AllocationEvent::AvailableCheckPassed);

        let criteria = SelectionCriteria {
            product_types: vec![ProductType::parse("walleye:walleye-retail")],
            ..Default::default()
        };
        let miss = reg.allocate(&criteria).unwrap_err();
        let reason = miss.reject_reasons.get("D1").expect("D1 should be a recorded reject");
        assert!(reason.contains("does not match requested variants"));
        assert!(reason.contains("walleye-retail"));
    }

    #[test]
    fn low_level_poll_creates_records() {
        let reg = registry();
        reg.update_mode_states(&["X1".to_string()], false, |_| true);
        reg.update_mode_states(&["X2".to_string()], true, |_| true);

        let x1 = reg.get("X1").unwrap();
        assert_eq!(x1.allocation_state(), AllocationState::Available);
        assert!(!x1.get_descriptor().is_low_level_userspace);

        let x2 = reg.get("X2").unwrap();
        assert_eq!(x2.allocation_state(), AllocationState::Available);
        assert!(x2.get_descriptor().is_low_level_userspace);
    }

    #[test]
    fn force_allocate_requires_available_state() {
        let reg = registry();
        reg.find_or_create("ABC123");
        assert!(reg.force_allocate("ABC123").is_none());
        reg.force_available("ABC123");
        assert!(reg.force_allocate("ABC123").is_some());
    }

    #[test]
    fn remove_unlinks_from_both_indexes() {
        let reg = registry();
        reg.seed("temp-null-0", DeviceKind::Null);
        reg.force_available("temp-null-0");
        assert_eq!(reg.len(), 1);

        let removed = reg.remove("temp-null-0").expect("record should have existed");
        assert_eq!(removed.serial(), "temp-null-0");
        assert!(reg.is_empty());
        assert!(reg.records_in_state(AllocationState::Available).is_empty());
        assert!(reg.get("temp-null-0").is_none());
    }

    #[test]
    fn remove_of_unknown_serial_is_none() {
        let reg = registry();
        assert!(reg.remove("nope").is_none());
    }
}
