use serde::{Deserialize, Serialize};

/// Events driving the per-record allocation state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AllocationEvent {
    ConnectedOnline,
    ConnectedOffline,
    StateChangeOnline,
    StateChangeOffline,
    /// Covers both bootloader and fastbootd; the low-level poller tags
    /// which one via `Record::set_low_level_userspace`.
    LowLevelDetected,
    AvailableCheckPassed,
    AvailableCheckFailed,
    AvailableCheckIgnored,
    AllocateRequest,
    ForceAllocateRequest,
    ForceAvailable,
    FreeAvailable,
    FreeUnavailable,
    FreeUnresponsive,
    FreeUnknown,
    Disconnected,
}
