//! Core device-fleet-manager crate: the allocation state machine, the
//! Registry, and every collaborator wired together by the Fleet Manager
//! facade.

pub mod bridge_listener;
pub mod lowlevel;
pub mod manager;
pub mod poller;
pub mod readiness;
pub mod record;
pub mod recovery;
pub mod registry;
pub mod selection;
pub mod state_machine;
pub mod usb;
pub mod virtual_driver;
pub mod wait;

pub use manager::{FleetManager, FreeState};
pub use record::Record;
pub use registry::{AllocateMiss, Registry};
