pub mod config;
pub mod criteria;
pub mod descriptor;
pub mod error;
pub mod events;

pub use config::FleetConfig;
pub use criteria::{EnabledBound, ProductType, SelectionCriteria};
pub use descriptor::{AllocationState, DeviceDescriptor, DeviceKind, Mode};
pub use error::FleetError;
pub use events::AllocationEvent;
