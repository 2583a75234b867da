//! Real concurrent-thread coverage for the exclusivity property: many
//! allocators racing a single Available record must hand it to exactly
//! one of them.

use fleet::record::Record;
use fleet::registry::Registry;
use shared::{AllocationState, DeviceKind, SelectionCriteria};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

#[test]
fn exclusive_allocation_under_contention() {
    let registry = Arc::new(Registry::new(Arc::new(|serial: &str| Record::new(serial, DeviceKind::Null))));
    registry.seed("contended-0", DeviceKind::Null);
    registry.force_available("contended-0");

    let successes = Arc::new(AtomicUsize::new(0));
    let criteria = SelectionCriteria {
        device_kind_requested: Some(DeviceKind::Null),
        ..Default::default()
    };

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let registry = registry.clone();
            let successes = successes.clone();
            let criteria = criteria.clone();
            thread::spawn(move || {
                if registry.allocate(&criteria).is_ok() {
                    successes.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("allocator thread panicked");
    }

    assert_eq!(successes.load(Ordering::SeqCst), 1, "exactly one allocator should win the race");
    let record = registry.get("contended-0").expect("record must still exist");
    assert_eq!(record.allocation_state(), AllocationState::Allocated);
}
