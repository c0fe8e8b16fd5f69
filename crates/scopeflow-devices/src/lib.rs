/*!
 * ScopeFlow Devices
 *
 * This crate provides the serial command protocol engine for DM microscope
 * stands and the device facades built on top of it.
 */

#![warn(missing_docs)]

// Re-export core types
pub use scopeflow_core::prelude;

pub mod device;
pub mod devices;
pub mod protocol;
pub mod registry;

// Re-export device trait and basic implementations
pub use device::{Device, DeviceError, DeviceEvent, DeviceInfo, DeviceKind, DeviceState};
pub use devices::{FocusDrive, Lamp, Microscope, Nosepiece};
pub use protocol::{CommandHub, SharedHub};
pub use registry::{available_devices, create_device, DeviceRegistry, SharedDeviceRegistry};

/// ScopeFlow devices crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the device system
pub fn init() -> Result<(), scopeflow_core::error::Error> {
    tracing::info!("ScopeFlow Devices {} initialized", VERSION);
    Ok(())
}

/// Information about available transports
pub fn available_transports() -> Vec<&'static str> {
    let serial = cfg!(feature = "serial").then_some("serial");
    std::iter::once("simulated").chain(serial).collect()
}
