/*!
 * Liaison Devices
 *
 * This crate provides the device registry, the device trait, the TPad
 * response box driver with its button, photodiode and voice key inputs, and a
 * generic serial device.
 */

#![warn(missing_docs)]

pub mod clock;
pub mod device;
pub mod devices;
pub mod discovery;
pub mod registry;
pub mod response;
pub mod spec;
pub mod transport;

// Re-export device trait and basic implementations
pub use device::{Device, DeviceError, DeviceIdentity, Result};
pub use devices::{
    register_default_factories, DeviceContext, SerialDevice, SerialOptions, TPad, TPadOptions,
};
pub use registry::{DeviceRegistry, Registration, RegistryEvent, SharedDeviceRegistry};
pub use response::{Response, ResponseClass, ResponseListener, ResponseLog};

/// Liaison devices crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the device system
pub fn init() -> std::result::Result<(), liaison_core::error::Error> {
    tracing::info!(
        "Liaison Devices {} initialized (transports: {:?})",
        VERSION,
        available_transports()
    );
    Ok(())
}

/// Serial transports compiled into this build
pub fn available_transports() -> Vec<&'static str> {
    let mut transports = vec!["loopback"];

    #[cfg(feature = "serial")]
    transports.push("serial");

    transports
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_available_transports() {
        assert!(available_transports().contains(&"loopback"));
        assert!(init().is_ok());
    }
}
