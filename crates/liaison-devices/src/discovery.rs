/*!
 * Device discovery for Liaison.
 *
 * Port enumeration, TPad port detection and the per-kind lookups behind
 * `getAvailableDevices`.
 */
use std::fmt::Debug;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use liaison_core::types::{Metadata, Value};

use crate::device::{DeviceError, Result};

/// Manufacturer string reported by the TPad's USB-serial bridge
pub const TPAD_MANUFACTURER: &str = "FTDI";

/// A serial port as reported by the operating system
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortInfo {
    /// Port name, e.g. `COM3` or `/dev/ttyUSB0`
    pub port_name: String,
    /// USB manufacturer string
    pub manufacturer: Option<String>,
    /// Human readable description
    pub description: Option<String>,
    /// USB vendor id
    pub vid: Option<u16>,
    /// USB product id
    pub pid: Option<u16>,
    /// USB serial number
    pub serial_number: Option<String>,
}

impl PortInfo {
    /// Create a port entry with only a name
    pub fn new<S: Into<String>>(port_name: S) -> Self {
        Self {
            port_name: port_name.into(),
            ..Default::default()
        }
    }

    /// Set the manufacturer
    pub fn with_manufacturer<S: Into<String>>(mut self, manufacturer: S) -> Self {
        self.manufacturer = Some(manufacturer.into());
        self
    }

    /// Set the description
    pub fn with_description<S: Into<String>>(mut self, description: S) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Describe the port as a device profile
    pub fn to_metadata(&self) -> Metadata {
        let mut profile = Metadata::new();
        profile.insert("port".to_string(), Value::from(self.port_name.clone()));
        profile.insert("manufacturer".to_string(), Value::from(self.manufacturer.clone()));
        profile.insert("description".to_string(), Value::from(self.description.clone()));
        profile.insert("vid".to_string(), Value::from(self.vid.map(i64::from)));
        profile.insert("pid".to_string(), Value::from(self.pid.map(i64::from)));
        profile.insert("serialNumber".to_string(), Value::from(self.serial_number.clone()));
        profile
    }
}

/// Source of serial port listings
pub trait PortEnumerator: Send + Sync + Debug {
    /// List the ports currently present
    fn ports(&self) -> Result<Vec<PortInfo>>;
}

/// A fixed port listing
#[derive(Debug, Clone, Default)]
pub struct StaticPorts(pub Vec<PortInfo>);

impl PortEnumerator for StaticPorts {
    fn ports(&self) -> Result<Vec<PortInfo>> {
        Ok(self.0.clone())
    }
}

/// Ports reported by the operating system
#[cfg(feature = "serial")]
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPorts;

#[cfg(feature = "serial")]
impl PortEnumerator for SystemPorts {
    fn ports(&self) -> Result<Vec<PortInfo>> {
        use serialport::SerialPortType;

        let ports = serialport::available_ports()
            .map_err(|e| DeviceError::ConnectionError(format!("Failed to list ports: {}", e)))?;
        Ok(ports
            .into_iter()
            .map(|port| match port.port_type {
                SerialPortType::UsbPort(usb) => PortInfo {
                    port_name: port.port_name,
                    manufacturer: usb.manufacturer,
                    description: usb.product,
                    vid: Some(usb.vid),
                    pid: Some(usb.pid),
                    serial_number: usb.serial_number,
                },
                _ => PortInfo::new(port.port_name),
            })
            .collect())
    }
}

/// Find the TPad among the listed ports.
///
/// The last FTDI port wins. A `COM` port must carry its number in the
/// description, in the form `... (COMn)`; other ports (`/dev/ttyUSB0`) are
/// returned by name.
pub fn detect_tpad_port(ports: &[PortInfo]) -> Result<String> {
    let port = ports
        .iter()
        .filter(|p| p.manufacturer.as_deref() == Some(TPAD_MANUFACTURER))
        .last()
        .ok_or_else(|| DeviceError::ConnectionError("No TPad device found".to_string()))?;

    if !port.port_name.starts_with("COM") {
        debug!(port = %port.port_name, "Detected TPad");
        return Ok(port.port_name.clone());
    }

    let description = port.description.as_deref().unwrap_or_default();
    let number = description
        .find("COM")
        .map(|start| &description[start + 3..])
        .and_then(|rest| rest.find(')').map(|end| &rest[..end]))
        .filter(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
        .ok_or_else(|| {
            DeviceError::ConnectionError(format!(
                "Could not read a COM port from {:?} on {}",
                description, port.port_name
            ))
        })?;

    debug!(port = %port.port_name, "Detected TPad on COM{}", number);
    Ok(format!("COM{}", number))
}

/// Lists available hardware of one kind as device profiles
pub trait DeviceLookup: Send + Sync + Debug {
    /// The kind this lookup answers for, e.g. `serial`
    fn kind(&self) -> &str;

    /// Enumerate profiles
    fn available(&self) -> Result<Vec<Metadata>>;
}

/// Lookup listing serial ports
#[derive(Debug, Clone)]
pub struct SerialLookup {
    ports: Arc<dyn PortEnumerator>,
}

impl SerialLookup {
    /// Create a lookup over `ports`
    pub fn new(ports: Arc<dyn PortEnumerator>) -> Self {
        Self { ports }
    }
}

impl DeviceLookup for SerialLookup {
    fn kind(&self) -> &str {
        "serial"
    }

    fn available(&self) -> Result<Vec<Metadata>> {
        Ok(self.ports.ports()?.iter().map(PortInfo::to_metadata).collect())
    }
}

/// Lookup listing TPads that can be detected
#[derive(Debug, Clone)]
pub struct TPadLookup {
    ports: Arc<dyn PortEnumerator>,
}

impl TPadLookup {
    /// Create a lookup over `ports`
    pub fn new(ports: Arc<dyn PortEnumerator>) -> Self {
        Self { ports }
    }
}

impl DeviceLookup for TPadLookup {
    fn kind(&self) -> &str {
        "TPad"
    }

    fn available(&self) -> Result<Vec<Metadata>> {
        let ports = self.ports.ports()?;
        match detect_tpad_port(&ports) {
            Ok(port) => {
                let mut profile = Metadata::new();
                profile.insert("type".to_string(), Value::from("TPad"));
                profile.insert("port".to_string(), Value::from(port));
                Ok(vec![profile])
            }
            Err(DeviceError::ConnectionError(_)) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }
}
