//! USB bus helper.
//!
//! Wraps `nusb` directly rather than hand-rolling ioctls. Used only by the
//! Recoverer's USB-reset escalation step, which is itself skipped for
//! network-attached, fastboot/fastbootd, and recovery-mode targets.

use async_trait::async_trait;
use shared::FleetError;

#[async_trait]
pub trait UsbBus: Send + Sync {
    /// Resets the USB device whose serial number matches `serial`. `Ok(())`
    /// on a serial with no matching USB device is not correct — callers
    /// must treat "not found" as a failure so the Recoverer's escalation
    /// doesn't silently no-op.
    async fn reset(&self, serial: &str) -> Result<(), FleetError>;
}

/// Production implementation over `nusb::list_devices()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NusbBus;

#[async_trait]
impl UsbBus for NusbBus {
    async fn reset(&self, serial: &str) -> Result<(), FleetError> {
        let devices = nusb::list_devices().await.map_err(|e| FleetError::ExternalToolFailure {
            tool: "usb".to_string(),
            reason: e.to_string(),
        })?;

        let info = devices
            .into_iter()
            .find(|info| info.serial_number() == Some(serial))
            .ok_or_else(|| FleetError::ExternalToolFailure {
                tool: "usb".to_string(),
                reason: format!("no usb device with serial {serial}"),
            })?;

        let device = info.open().await.map_err(|e| FleetError::ExternalToolFailure {
            tool: "usb".to_string(),
            reason: e.to_string(),
        })?;

        device.reset().await.map_err(|e| FleetError::ExternalToolFailure {
            tool: "usb".to_string(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use parking_lot::Mutex;

    /// Records reset calls and returns a canned result; used by the
    /// Recoverer's unit tests so they never touch real hardware.
    #[derive(Default)]
    pub struct MockUsbBus {
        pub calls: Mutex<Vec<String>>,
        pub should_succeed: bool,
    }

    impl MockUsbBus {
        pub fn succeeding() -> Self {
            MockUsbBus {
                calls: Mutex::new(Vec::new()),
                should_succeed: true,
            }
        }

        pub fn failing() -> Self {
            MockUsbBus {
                calls: Mutex::new(Vec::new()),
                should_succeed: false,
            }
        }
    }

    #[async_trait]
    impl UsbBus for MockUsbBus {
        async fn reset(&self, serial: &str) -> Result<(), FleetError> {
            self.calls.lock().push(serial.to_string());
            if self.should_succeed {
                Ok(())
            } else {
                Err(FleetError::ExternalToolFailure {
                    tool: "usb".to_string(),
                    reason: "mock failure".to_string(),
                })
            }
        }
    }
}
