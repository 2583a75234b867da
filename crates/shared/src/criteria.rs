use crate::descriptor::DeviceKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single `product[:variant]` requirement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductType {
    pub product: String,
    pub variant: Option<String>,
}

impl ProductType {
    /// Parse the `product-type` configuration key's `product:variant` form.
    pub fn parse(s: &str) -> Self {
        match s.split_once(':') {
            Some((product, variant)) => ProductType {
                product: product.to_string(),
                variant: Some(variant.to_lowercase()),
            },
            None => ProductType {
                product: s.to_string(),
                variant: None,
            },
        }
    }
}

/// A bound that must be explicitly enabled to take effect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnabledBound<T> {
    pub enabled: bool,
    pub value: Option<T>,
}

impl<T> EnabledBound<T> {
    pub fn disabled() -> Self {
        EnabledBound {
            enabled: false,
            value: None,
        }
    }
}

/// Multi-predicate selection criteria.
///
/// Default kind-requested is physical-existing-device.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SelectionCriteria {
    pub serials_include: Vec<String>,
    pub serials_exclude: Vec<String>,
    pub product_types: Vec<ProductType>,
    pub required_properties: HashMap<String, String>,
    pub device_kind_requested: Option<DeviceKind>,
    pub min_battery: EnabledBound<u8>,
    pub max_battery: EnabledBound<u8>,
    pub max_battery_temperature: EnabledBound<u32>,
    pub min_sdk_level: Option<u32>,
    pub max_sdk_level: Option<u32>,
}

impl SelectionCriteria {
    pub fn any() -> Self {
        Self::default()
    }

    /// Force a specific serial into the criteria, used by the Fleet
    /// Manager's `allocate(temporary=true)` path to pin a freshly created
    /// ephemeral null record.
    pub fn with_forced_serial(mut self, serial: impl Into<String>) -> Self {
        self.serials_include = vec![serial.into()];
        self
    }
}
