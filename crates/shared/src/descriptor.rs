use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// What kind of target a [`crate::descriptor::DeviceDescriptor`] refers to.
///
/// Physical records materialize on first discovery; every other kind is a
/// placeholder slot seeded by the Fleet Manager at init.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    Physical,
    EmulatorSlot,
    Null,
    VirtualLocal,
    /// `known_ip` virtual-remote family.
    VirtualRemoteKnownIp,
    /// GCE/acloud-spawned virtual-remote family.
    VirtualRemoteGce,
    LowLevelOnly,
}

impl DeviceKind {
    /// Whether this kind is a placeholder slot rather than a materialized
    /// physical device.
    pub fn is_placeholder(self) -> bool {
        !matches!(self, DeviceKind::Physical | DeviceKind::LowLevelOnly)
    }

    pub fn is_virtual_remote(self) -> bool {
        matches!(
            self,
            DeviceKind::VirtualRemoteKnownIp | DeviceKind::VirtualRemoteGce
        )
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceKind::Physical => "physical",
            DeviceKind::EmulatorSlot => "emulator",
            DeviceKind::Null => "null",
            DeviceKind::VirtualLocal => "virtual-local",
            DeviceKind::VirtualRemoteKnownIp => "virtual-remote(known-ip)",
            DeviceKind::VirtualRemoteGce => "virtual-remote(gce)",
            DeviceKind::LowLevelOnly => "low-level-only",
        };
        f.write_str(s)
    }
}

/// Protocol mode as reported by the bridge listener or the low-level
/// poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mode {
    Online,
    Offline,
    Unauthorized,
    RecoveryMode,
    Bootloader,
    /// Entered after `reboot fastboot`; userspace-only variant of bootloader.
    LowLevelUserspace,
    Sideload,
    NotAvailable,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Mode::Online => "online",
            Mode::Offline => "offline",
            Mode::Unauthorized => "unauthorized",
            Mode::RecoveryMode => "recovery",
            Mode::Bootloader => "bootloader",
            Mode::LowLevelUserspace => "fastbootd",
            Mode::Sideload => "sideload",
            Mode::NotAvailable => "not-available",
        };
        f.write_str(s)
    }
}

/// Per-record allocation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AllocationState {
    Unknown,
    CheckingAvailability,
    Available,
    Allocated,
    Unavailable,
    Ignored,
}

impl fmt::Display for AllocationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AllocationState::Unknown => "Unknown",
            AllocationState::CheckingAvailability => "Checking_Availability",
            AllocationState::Available => "Available",
            AllocationState::Allocated => "Allocated",
            AllocationState::Unavailable => "Unavailable",
            AllocationState::Ignored => "Ignored",
        };
        f.write_str(s)
    }
}

/// Immutable snapshot of a Device Record, recomputed on transitions and
/// otherwise read-lock-free.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub serial: String,
    pub kind: DeviceKind,
    pub mode: Mode,
    pub allocation_state: AllocationState,
    pub product: Option<String>,
    pub variant: Option<String>,
    pub build_id: Option<String>,
    pub battery_level: Option<u8>,
    pub battery_temperature: Option<u32>,
    pub is_low_level_userspace: bool,
    /// Raw reported properties (`ro.*` getprop keys), consulted by the
    /// selection predicate for `required-properties` and SDK-level
    /// bounds.
    pub properties: HashMap<String, String>,
}

impl DeviceDescriptor {
    /// Trims a descriptor down to the short-form columns shown by
    /// `list-devices` without `--full`.
    pub fn short(&self) -> ShortDescriptor<'_> {
        ShortDescriptor(self)
    }

    /// Adds the `class`/`DeviceState` columns `list-devices --full` shows.
    pub fn full(&self) -> FullDescriptor<'_> {
        FullDescriptor(self)
    }
}

/// Wrapper that renders only {Serial, State, Allocation, Product, Variant,
/// Build, Battery} — the non `--full` column set.
pub struct ShortDescriptor<'a>(&'a DeviceDescriptor);

impl fmt::Display for ShortDescriptor<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<20} {:<10} {:<12} {:<10} {:<12} {:<10} {:<4}",
            self.0.serial,
            self.0.mode,
            self.0.allocation_state,
            self.0.product.as_deref().unwrap_or("-"),
            self.0.variant.as_deref().unwrap_or("-"),
            self.0.build_id.as_deref().unwrap_or("-"),
            self.0
                .battery_level
                .map(|b| b.to_string())
                .unwrap_or_else(|| "-".into()),
        )
    }
}

/// Wrapper rendering the `--full` column set: {Serial, State, Allocation,
/// Product, Variant, Build, Battery, class, DeviceState}.
pub struct FullDescriptor<'a>(&'a DeviceDescriptor);

impl fmt::Display for FullDescriptor<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:<9} {:<21}",
            self.0.short(),
            self.0.kind,
            if self.0.is_low_level_userspace {
                "fastbootd"
            } else {
                "-"
            },
        )
    }
}
