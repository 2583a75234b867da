//! The per-record allocation state machine.
//!
//! Pure and total: every `(state, event)` pair has a defined outcome, even
//! when that outcome is "no change". Keeping this as a free function rather
//! than a method on `Record` is what makes it checkable in
//! `tests/state_machine_props.rs` without spinning up any I/O.
use shared::{AllocationEvent, AllocationState};

/// Result of applying an event to a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub to: AllocationState,
    pub changed: bool,
}

impl Transition {
    fn same(state: AllocationState) -> Self {
        Transition {
            to: state,
            changed: false,
        }
    }

    fn to(state: AllocationState) -> Self {
        Transition {
            to: state,
            changed: true,
        }
    }
}

/// Applies `event` to `from`, returning the next state and whether it
/// actually moved. Unlisted pairs are no-ops rather than errors — the
/// caller logs them but the registry's invariants never depend on an event
/// being "expected" in a given state.
pub fn transition(from: AllocationState, event: AllocationEvent) -> Transition {
    use AllocationEvent::*;
    use AllocationState::*;

    // FORCE_AVAILABLE always wins — used for placeholder seeding and for
    // returning placeholder slots to the pool on free, from whatever state
    // they happen to be in.
    if matches!(event, ForceAvailable) {
        return if from == Available {
            Transition::same(from)
        } else {
            Transition::to(Available)
        };
    }

    match (from, event) {
        (Unknown, ConnectedOnline) => Transition::to(CheckingAvailability),
        (Unknown, StateChangeOnline) => Transition::to(CheckingAvailability),
        (Unknown, LowLevelDetected) => Transition::to(Available),

        (CheckingAvailability, AvailableCheckPassed) => Transition::to(Available),
        (CheckingAvailability, AvailableCheckFailed) => Transition::to(Unavailable),
        (CheckingAvailability, AvailableCheckIgnored) => Transition::to(Ignored),

        (Available, AllocateRequest) => Transition::to(Allocated),
        (Available, ForceAllocateRequest) => Transition::to(Allocated),
        (Available, StateChangeOffline) => Transition::to(Unavailable),
        (Available, ConnectedOffline) => Transition::to(Unavailable),
        (Available, Disconnected) => Transition::to(Unknown),

        (Allocated, FreeAvailable) => Transition::to(CheckingAvailability),
        (Allocated, FreeUnavailable) => Transition::to(Unavailable),
        (Allocated, FreeUnresponsive) => Transition::to(Unavailable),
        (Allocated, FreeUnknown) => Transition::to(Unknown),
        // A device vanishing mid-test shouldn't leave the record stuck
        // claiming it's still allocated; route back to Unknown so
        // rediscovery starts clean.
        (Allocated, Disconnected) => Transition::to(Unknown),

        (Unavailable, StateChangeOnline) => Transition::to(CheckingAvailability),
        (Unavailable, ConnectedOnline) => Transition::to(CheckingAvailability),
        (Unavailable, Disconnected) => Transition::to(Unknown),

        _ => Transition::same(from),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovery_to_allocation_happy_path() {
        let t = transition(AllocationState::Unknown, AllocationEvent::ConnectedOnline);
        assert_eq!(t.to, AllocationState::CheckingAvailability);
        assert!(t.changed);

        let t = transition(
            AllocationState::CheckingAvailability,
            AllocationEvent::AvailableCheckPassed,
        );
        assert_eq!(t.to, AllocationState::Available);

        let t = transition(AllocationState::Available, AllocationEvent::AllocateRequest);
        assert_eq!(t.to, AllocationState::Allocated);

        let t = transition(AllocationState::Allocated, AllocationEvent::FreeAvailable);
        assert_eq!(t.to, AllocationState::CheckingAvailability);
    }

    #[test]
    fn force_available_overrides_from_any_state() {
        for state in [
            AllocationState::Unknown,
            AllocationState::CheckingAvailability,
            AllocationState::Allocated,
            AllocationState::Unavailable,
            AllocationState::Ignored,
        ] {
            let t = transition(state, AllocationEvent::ForceAvailable);
            assert_eq!(t.to, AllocationState::Available);
        }
    }

    #[test]
    fn unlisted_pairs_are_no_ops() {
        let t = transition(AllocationState::Unknown, AllocationEvent::AllocateRequest);
        assert_eq!(t.to, AllocationState::Unknown);
        assert!(!t.changed);
    }

    #[test]
    fn is_total_over_every_pair() {
        let states = [
            AllocationState::Unknown,
            AllocationState::CheckingAvailability,
            AllocationState::Available,
            AllocationState::Allocated,
            AllocationState::Unavailable,
            AllocationState::Ignored,
        ];
        let events = [
            AllocationEvent::ConnectedOnline,
            AllocationEvent::ConnectedOffline,
            AllocationEvent::StateChangeOnline,
            AllocationEvent::StateChangeOffline,
            AllocationEvent::LowLevelDetected,
            AllocationEvent::AvailableCheckPassed,
            AllocationEvent::AvailableCheckFailed,
            AllocationEvent::AvailableCheckIgnored,
            AllocationEvent::AllocateRequest,
            AllocationEvent::ForceAllocateRequest,
            AllocationEvent::ForceAvailable,
            AllocationEvent::FreeAvailable,
            AllocationEvent::FreeUnavailable,
            AllocationEvent::FreeUnresponsive,
            AllocationEvent::FreeUnknown,
            AllocationEvent::Disconnected,
        ];
        for &s in &states {
            for &e in &events {
                // must not panic; every pair has a defined outcome
                let _ = transition(s, e);
            }
        }
    }
}
