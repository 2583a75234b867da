//! Property tests for the per-record allocation state machine. Runs
//! entirely over the pure `transition` function — no Registry, no I/O.

use fleet::state_machine::transition;
use proptest::prelude::*;
use shared::{AllocationEvent, AllocationState};

fn any_state() -> impl Strategy<Value = AllocationState> {
    prop_oneof![
        Just(AllocationState::Unknown),
        Just(AllocationState::CheckingAvailability),
        Just(AllocationState::Available),
        Just(AllocationState::Allocated),
        Just(AllocationState::Unavailable),
        Just(AllocationState::Ignored),
    ]
}

fn any_event() -> impl Strategy<Value = AllocationEvent> {
    prop_oneof![
        Just(AllocationEvent::ConnectedOnline),
        Just(AllocationEvent::ConnectedOffline),
        Just(AllocationEvent::StateChangeOnline),
        Just(AllocationEvent::StateChangeOffline),
        Just(AllocationEvent::LowLevelDetected),
        Just(AllocationEvent::AvailableCheckPassed),
        Just(AllocationEvent::AvailableCheckFailed),
        Just(AllocationEvent::AvailableCheckIgnored),
        Just(AllocationEvent::AllocateRequest),
        Just(AllocationEvent::ForceAllocateRequest),
        Just(AllocationEvent::ForceAvailable),
        Just(AllocationEvent::FreeAvailable),
        Just(AllocationEvent::FreeUnavailable),
        Just(AllocationEvent::FreeUnresponsive),
        Just(AllocationEvent::FreeUnknown),
        Just(AllocationEvent::Disconnected),
    ]
}

proptest! {
    /// Every (state, event) pair is defined and deterministic — no panics,
    /// no hidden randomness.
    #[test]
    fn transition_is_total_and_deterministic(state in any_state(), event in any_event()) {
        let first = transition(state, event);
        let second = transition(state, event);
        prop_assert_eq!(first, second);
    }

    /// FORCE_AVAILABLE wins from any state.
    #[test]
    fn force_available_always_lands_on_available(state in any_state()) {
        let t = transition(state, AllocationEvent::ForceAvailable);
        prop_assert_eq!(t.to, AllocationState::Available);
    }

    /// An unlisted pair reports `changed = false` and leaves the state as
    /// given, rather than silently drifting it.
    #[test]
    fn unchanged_transition_keeps_reported_state(state in any_state(), event in any_event()) {
        let t = transition(state, event);
        if !t.changed {
            prop_assert_eq!(t.to, state);
        }
    }
}
