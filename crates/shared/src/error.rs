use std::collections::HashMap;

/// Error taxonomy shared across the workspace. Kinds, not type names:
/// every external collaborator error funnels through one of these
/// variants before crossing into `crates/fleet`.
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    /// Device not visible, offline, unauthorized, or exhausted recovery.
    #[error("device {serial} unavailable: {reason}")]
    DeviceUnavailable { serial: String, reason: String },

    /// Visible and online but shell/boot checks failed after reboot.
    #[error("device {serial} unresponsive: {reason}")]
    DeviceUnresponsive { serial: String, reason: String },

    /// Shell output malformed when a contract was expected.
    #[error("device {serial} returned unexpected response: {reason}")]
    DeviceUnexpectedResponse { serial: String, reason: String },

    /// Allocator request cannot be satisfied; carries per-candidate reasons.
    #[error("selection mismatch: {top_level_reason}")]
    SelectionMismatch {
        top_level_reason: String,
        per_candidate: HashMap<String, String>,
    },

    /// Malformed configuration (e.g. invalid CPU-affinity grammar).
    #[error("invalid configuration: {0}")]
    InfraConfigurationError(String),

    /// Raised from an "abort" recovery strategy installed by
    /// `terminate_hard`.
    #[error("aborted test session: {reason}")]
    AllocationCancelled { reason: String },

    /// Non-zero exit or unparseable output from low-level/virtual-driver
    /// tools.
    #[error("external tool {tool} failed: {reason}")]
    ExternalToolFailure { tool: String, reason: String },
}

impl FleetError {
    pub fn unavailable(serial: impl Into<String>, reason: impl Into<String>) -> Self {
        FleetError::DeviceUnavailable {
            serial: serial.into(),
            reason: reason.into(),
        }
    }

    pub fn unresponsive(serial: impl Into<String>, reason: impl Into<String>) -> Self {
        FleetError::DeviceUnresponsive {
            serial: serial.into(),
            reason: reason.into(),
        }
    }
}
