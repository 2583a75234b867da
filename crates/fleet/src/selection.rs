//! The selection predicate used to pick a device out of the Available pool.
//!
//! Pure and side-effect-free: evaluated while the Registry holds its scan
//! lock, so nothing here may block or touch I/O. Battery/battery temperature
//! are read from the descriptor's cached values rather than probed live —
//! the bounded-wait read happens once per record, when the descriptor cache
//! is refreshed, not once per candidate per `allocate`.

use shared::{DeviceKind, SelectionCriteria};
use shared::descriptor::DeviceDescriptor;

/// Ordered fallback keys tried when resolving a device's reported product.
const PRODUCT_PROPERTY_FALLBACKS: &[&str] = &["ro.product.name", "ro.build.product", "ro.product.device"];
const VARIANT_PROPERTY_FALLBACKS: &[&str] = &["ro.build.flavor", "ro.build.type"];
const SDK_PROPERTY: &str = "ro.build.version.sdk";

/// Evaluates `criteria` against `descriptor` as an ordered, short-circuiting
/// list of checks. A plain serial-include mismatch is rejected silently
/// (not diagnostic); everything past that records a human-readable reason.
pub fn matches(criteria: &SelectionCriteria, descriptor: &DeviceDescriptor) -> MatchOutcome {
    // 1. serials-include: a mismatch here is not diagnostic.
    if !criteria.serials_include.is_empty() && !criteria.serials_include.contains(&descriptor.serial) {
        return MatchOutcome::SilentReject;
    }

    // 2. serials-exclude.
    if criteria.serials_exclude.contains(&descriptor.serial) {
        return MatchOutcome::Reject(format!("serial {} is excluded", descriptor.serial));
    }

    // 3. product[:variant].
    for wanted in &criteria.product_types {
        let product = resolve_property(descriptor, PRODUCT_PROPERTY_FALLBACKS)
            .or_else(|| descriptor.product.clone());
        if product.as_deref() != Some(wanted.product.as_str()) {
            return MatchOutcome::Reject(format!(
                "device product ({}) does not match requested product ({})",
                product.as_deref().unwrap_or("unknown"),
                wanted.product,
            ));
        }
        if let Some(wanted_variant) = &wanted.variant {
            let variant = resolve_property(descriptor, VARIANT_PROPERTY_FALLBACKS)
                .or_else(|| descriptor.variant.clone())
                .map(|v| v.to_lowercase());
            if variant.as_deref() != Some(wanted_variant.as_str()) {
                return MatchOutcome::Reject(format!(
                    "device variant ({}) does not match requested variants(...{}...)",
                    variant.as_deref().unwrap_or("unknown"),
                    wanted_variant,
                ));
            }
        }
    }

    // 4. required properties.
    for (key, expected) in &criteria.required_properties {
        match descriptor.properties.get(key) {
            Some(actual) if actual == expected => {}
            Some(actual) => {
                return MatchOutcome::Reject(format!(
                    "property {key}={expected} required, device has {key}={actual}"
                ));
            }
            None => {
                return MatchOutcome::Reject(format!("property {key}={expected} required, device has no {key}"));
            }
        }
    }

    // 5. kind check.
    let requested_kind = criteria.device_kind_requested.unwrap_or(DeviceKind::Physical);
    if !kind_is_compatible(requested_kind, descriptor.kind, &descriptor.serial) {
        return MatchOutcome::Reject(format!(
            "device kind ({}) does not match requested kind ({requested_kind})",
            descriptor.kind
        ));
    }

    // 6. SDK bounds.
    if criteria.min_sdk_level.is_some() || criteria.max_sdk_level.is_some() {
        match descriptor.properties.get(SDK_PROPERTY).and_then(|v| v.parse::<u32>().ok()) {
            None => return MatchOutcome::Reject("sdk level unparseable or missing".to_string()),
            Some(sdk) => {
                if let Some(min) = criteria.min_sdk_level {
                    if sdk < min {
                        return MatchOutcome::Reject(format!("sdk level {sdk} below minimum {min}"));
                    }
                }
                if let Some(max) = criteria.max_sdk_level {
                    if sdk > max {
                        return MatchOutcome::Reject(format!("sdk level {sdk} above maximum {max}"));
                    }
                }
            }
        }
    }

    // 7. battery level — physical kinds only.
    if descriptor.kind == DeviceKind::Physical && criteria.min_battery.enabled {
        if let Some(min) = criteria.min_battery.value {
            match descriptor.battery_level {
                None => return MatchOutcome::Reject("battery level check enabled but no reading available".to_string()),
                Some(level) if level < min => {
                    return MatchOutcome::Reject(format!("battery level {level} below minimum {min}"));
                }
                _ => {}
            }
        }
    }
    if descriptor.kind == DeviceKind::Physical && criteria.max_battery.enabled {
        if let Some(max) = criteria.max_battery.value {
            match descriptor.battery_level {
                None => return MatchOutcome::Reject("battery level check enabled but no reading available".to_string()),
                Some(level) if level > max => {
                    return MatchOutcome::Reject(format!("battery level {level} above maximum {max}"));
                }
                _ => {}
            }
        }
    }

    // 8. battery temperature.
    if descriptor.kind == DeviceKind::Physical && criteria.max_battery_temperature.enabled {
        if let Some(max) = criteria.max_battery_temperature.value {
            match descriptor.battery_temperature {
                None => return MatchOutcome::Reject("battery temperature check enabled but no reading available".to_string()),
                Some(temp) if temp > max => {
                    return MatchOutcome::Reject(format!("battery temperature {temp} above maximum {max}"));
                }
                _ => {}
            }
        }
    }

    MatchOutcome::Match
}

/// Outcome of [`matches`]. Kept distinct from a plain `(bool, Option<String>)`
/// so callers can't accidentally record a reject reason for the silent
/// serial-mismatch case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    Match,
    /// Rejected, diagnostic reason recorded.
    Reject(String),
    /// Rejected, not diagnostic (serial not in the include set).
    SilentReject,
}

impl MatchOutcome {
    pub fn is_match(&self) -> bool {
        matches!(self, MatchOutcome::Match)
    }
}

fn resolve_property(descriptor: &DeviceDescriptor, fallbacks: &[&str]) -> Option<String> {
    fallbacks.iter().find_map(|key| descriptor.properties.get(*key).cloned())
}

/// Placeholder kinds must match the corresponding placeholder class exactly;
/// a physical request excludes emulator kinds and network-serial-looking
/// serials.
fn kind_is_compatible(requested: DeviceKind, actual: DeviceKind, serial: &str) -> bool {
    if requested == DeviceKind::Physical {
        return actual == DeviceKind::Physical && !looks_like_network_serial(serial);
    }
    requested == actual
}

/// adb's network-attached serials are `host:port`; USB serials never embed
/// a colon.
fn looks_like_network_serial(serial: &str) -> bool {
    serial.contains(':')
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{EnabledBound, ProductType};
    use std::collections::HashMap;

    fn descriptor(serial: &str, kind: DeviceKind) -> DeviceDescriptor {
        DeviceDescriptor {
            serial: serial.to_string(),
            kind,
            mode: shared::Mode::Online,
            allocation_state: shared::AllocationState::Available,
            product: Some("walleye".to_string()),
            variant: Some("walleye".to_string()),
            build_id: None,
            battery_level: Some(80),
            battery_temperature: Some(300),
            is_low_level_userspace: false,
            properties: HashMap::new(),
        }
    }

    #[test]
    fn silent_reject_on_serial_include_mismatch() {
        let criteria = SelectionCriteria {
            serials_include: vec!["other".to_string()],
            ..Default::default()
        };
        let d = descriptor("ABC123", DeviceKind::Physical);
        assert_eq!(matches(&criteria, &d), MatchOutcome::SilentReject);
    }

    #[test]
    fn product_variant_mismatch_is_diagnostic() {
        let criteria = SelectionCriteria {
            product_types: vec![ProductType::parse("walleye:walleye-retail")],
            ..Default::default()
        };
        let mut d = descriptor("D1", DeviceKind::Physical);
        d.variant = Some("walleye".to_string());
        match matches(&criteria, &d) {
            MatchOutcome::Reject(reason) => {
                assert!(reason.contains("walleye"));
                assert!(reason.contains("walleye-retail"));
            }
            other => panic!("expected reject, got {other:?}"),
        }
    }

    #[test]
    fn product_variant_match_succeeds() {
        let criteria = SelectionCriteria {
            product_types: vec![ProductType::parse("walleye:walleye-retail")],
            ..Default::default()
        };
        let mut d = descriptor("D2", DeviceKind::Physical);
        d.variant = Some("walleye-retail".to_string());
        assert!(matches(&criteria, &d).is_match());
    }

    #[test]
    fn kind_mismatch_rejects_placeholder_request_against_physical() {
        let criteria = SelectionCriteria {
            device_kind_requested: Some(DeviceKind::Null),
            ..Default::default()
        };
        let d = descriptor("ABC123", DeviceKind::Physical);
        assert!(!matches(&criteria, &d).is_match());
    }

    #[test]
    fn missing_battery_reading_rejects_when_check_enabled() {
        let criteria = SelectionCriteria {
            min_battery: EnabledBound {
                enabled: true,
                value: Some(50),
            },
            ..Default::default()
        };
        let mut d = descriptor("ABC123", DeviceKind::Physical);
        d.battery_level = None;
        assert!(!matches(&criteria, &d).is_match());
    }

    #[test]
    fn battery_check_skipped_for_placeholder_kinds() {
        let criteria = SelectionCriteria {
            device_kind_requested: Some(DeviceKind::Null),
            min_battery: EnabledBound {
                enabled: true,
                value: Some(50),
            },
            ..Default::default()
        };
        let mut d = descriptor("null-device-0", DeviceKind::Null);
        d.battery_level = None;
        assert!(matches(&criteria, &d).is_match());
    }

    #[test]
    fn unparseable_sdk_level_rejects() {
        let criteria = SelectionCriteria {
            min_sdk_level: Some(28),
            ..Default::default()
        };
        let d = descriptor("ABC123", DeviceKind::Physical);
        assert!(!matches(&criteria, &d).is_match());
    }
}
