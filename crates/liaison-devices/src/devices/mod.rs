/*!
 * Device implementations for Liaison.
 *
 * This module contains the concrete drivers and the factories that build
 * them from spec entries.
 */
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use liaison_core::types::{Metadata, Value};

use crate::clock::{Clock, SystemClock};
use crate::device::{Device, DeviceError, DeviceIdentity, Result};
use crate::discovery::{
    detect_tpad_port, PortEnumerator, PortInfo, SerialLookup, StaticPorts, TPadLookup,
};
use crate::registry::{DeviceFactory, DeviceRegistry};
use crate::transport::{LoopbackBus, Parity, SerialSettings, SerialTransport};

// Export device implementations
pub mod serial;
pub mod tpad;

// Re-export specific device implementations for convenience
pub use serial::{SerialDevice, SerialOptions, DEFAULT_SERIAL_BAUD_RATE};
pub use tpad::{InputKind, TPad, TPadInput, TPadMode, TPadOptions};

/// Opens a serial link to the named port
pub type Connector =
    Arc<dyn Fn(&str, &SerialSettings) -> Result<Box<dyn SerialTransport>> + Send + Sync>;

/// Everything the built-in factories need to reach hardware
#[derive(Clone)]
pub struct DeviceContext {
    /// Defaults for new TPads
    pub tpad: TPadOptions,
    /// Defaults for new generic serial devices
    pub serial: SerialOptions,
    /// Clock used to timestamp responses
    pub clock: Arc<dyn Clock>,
    /// Port listing used for detection and lookups
    pub ports: Arc<dyn PortEnumerator>,
    /// Opens links to ports
    pub connector: Connector,
}

impl DeviceContext {
    /// Create a context from a port listing and a connector
    pub fn new(ports: Arc<dyn PortEnumerator>, connector: Connector) -> Self {
        Self {
            tpad: TPadOptions::default(),
            serial: SerialOptions::default(),
            clock: Arc::new(SystemClock),
            ports,
            connector,
        }
    }

    /// Context backed by the operating system's serial ports
    #[cfg(feature = "serial")]
    pub fn system() -> Self {
        use crate::discovery::SystemPorts;
        use crate::transport::SerialPortTransport;

        Self::new(
            Arc::new(SystemPorts),
            Arc::new(|port: &str, settings: &SerialSettings| {
                let transport = SerialPortTransport::open(port, settings)?;
                Ok(Box::new(transport) as Box<dyn SerialTransport>)
            }),
        )
    }

    /// Context where every port is an in-memory link on `bus`
    pub fn loopback(bus: LoopbackBus, ports: Vec<PortInfo>) -> Self {
        Self::new(
            Arc::new(StaticPorts(ports)),
            Arc::new(move |port: &str, settings: &SerialSettings| {
                settings.validate()?;
                Ok(Box::new(bus.link(port)) as Box<dyn SerialTransport>)
            }),
        )
    }

    /// Replace the TPad defaults
    pub fn with_tpad_options(mut self, options: TPadOptions) -> Self {
        self.tpad = options;
        self
    }

    /// Replace the generic serial defaults
    pub fn with_serial_options(mut self, options: SerialOptions) -> Self {
        self.serial = options;
        self
    }

    /// Replace the clock
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

impl fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceContext")
            .field("tpad", &self.tpad)
            .field("serial", &self.serial)
            .field("clock", &self.clock)
            .field("ports", &self.ports)
            .finish()
    }
}

/// Register the built-in device factories and lookups
pub fn register_default_factories(registry: &DeviceRegistry, context: DeviceContext) {
    registry.register_lookup(Arc::new(SerialLookup::new(context.ports.clone())));
    registry.register_lookup(Arc::new(TPadLookup::new(context.ports.clone())));
    registry.register_factory("Serial", Arc::new(SerialFactory::new(context.clone())));
    registry.register_factory("TPad", Arc::new(TPadFactory::new(context)));
}

fn string_param<'a>(params: &'a Metadata, key: &str) -> Result<Option<&'a str>> {
    match params.get(key) {
        Some(Value::String(value)) if !value.is_empty() => Ok(Some(value)),
        Some(Value::String(_)) | Some(Value::Null) | None => Ok(None),
        Some(other) => Err(DeviceError::InvalidValue(format!(
            "{} must be a string, got {}",
            key,
            other.type_name()
        ))),
    }
}

fn identity_port(identity: &DeviceIdentity) -> Result<String> {
    identity
        .params
        .get("port")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| DeviceError::MissingParameter("port".to_string()))
}

/// Factory for `TPad` spec entries.
///
/// Accepts `port` (detected when absent), `pauseDuration` in seconds and
/// `poll`. The device is identified by its port alone.
#[derive(Debug, Clone)]
pub struct TPadFactory {
    context: DeviceContext,
}

impl TPadFactory {
    /// Create a factory drawing on `context`
    pub fn new(context: DeviceContext) -> Self {
        Self { context }
    }

    fn options(&self, params: &Metadata) -> Result<TPadOptions> {
        let mut options = self.context.tpad.clone();
        if let Some(value) = params.get("pauseDuration") {
            let seconds = value
                .as_float()
                .filter(|s| s.is_finite() && *s >= 0.0)
                .ok_or_else(|| {
                    DeviceError::InvalidValue(format!("pauseDuration must be seconds, got {}", value))
                })?;
            options.settle = Duration::from_secs_f64(seconds);
        }
        if let Some(value) = params.get("poll") {
            options.poll = value.as_flag().ok_or_else(|| {
                DeviceError::InvalidValue(format!("poll must be a flag, got {}", value))
            })?;
        }
        Ok(options)
    }
}

impl DeviceFactory for TPadFactory {
    fn identify(&self, params: &Metadata) -> Result<DeviceIdentity> {
        let port = match string_param(params, "port")? {
            Some(port) => port.to_string(),
            None => detect_tpad_port(&self.context.ports.ports()?)?,
        };
        // Bad options are reported before any duplicate check
        self.options(params)?;
        Ok(DeviceIdentity::new("TPad").with_param("port", port))
    }

    fn build(&self, name: &str, identity: &DeviceIdentity, params: Metadata) -> Result<Arc<dyn Device>> {
        let port = identity_port(identity)?;
        let options = self.options(&params)?;
        debug!(name, port = %port, "Opening TPad");
        let transport = (self.context.connector)(&port, &SerialSettings::default())?;
        let tpad = TPad::open(transport, options, self.context.clock.clone())?;
        Ok(Arc::new(tpad) as Arc<dyn Device>)
    }
}

/// Factory for `Serial` spec entries.
///
/// Requires `port`; accepts `baudrate`, `byteSize`, `stopBits` and `parity`
/// (`N`, `O` or `E`), defaulting to 9600 8N1.
#[derive(Debug, Clone)]
pub struct SerialFactory {
    context: DeviceContext,
}

impl SerialFactory {
    /// Create a factory drawing on `context`
    pub fn new(context: DeviceContext) -> Self {
        Self { context }
    }

    fn settings(params: &Metadata) -> Result<SerialSettings> {
        let number = |key: &str, default: i64| -> Result<i64> {
            match params.get(key) {
                None | Some(Value::Null) => Ok(default),
                Some(value) => value.as_integer().ok_or_else(|| {
                    DeviceError::InvalidValue(format!("{} must be an integer, got {}", key, value))
                }),
            }
        };
        let narrow = |key: &str, value: i64| {
            DeviceError::InvalidValue(format!("{} out of range: {}", key, value))
        };

        let baud_rate = number("baudrate", i64::from(DEFAULT_SERIAL_BAUD_RATE))?;
        let data_bits = number("byteSize", 8)?;
        let stop_bits = number("stopBits", 1)?;
        let settings = SerialSettings {
            baud_rate: u32::try_from(baud_rate).map_err(|_| narrow("baudrate", baud_rate))?,
            data_bits: u8::try_from(data_bits).map_err(|_| narrow("byteSize", data_bits))?,
            stop_bits: u8::try_from(stop_bits).map_err(|_| narrow("stopBits", stop_bits))?,
            parity: match string_param(params, "parity")? {
                Some(code) => Parity::from_code(code)?,
                None => Parity::None,
            },
        };
        settings.validate()?;
        Ok(settings)
    }
}

impl DeviceFactory for SerialFactory {
    fn identify(&self, params: &Metadata) -> Result<DeviceIdentity> {
        let port = string_param(params, "port")?
            .ok_or_else(|| DeviceError::MissingParameter("port".to_string()))?;
        Self::settings(params)?;
        Ok(DeviceIdentity::new("Serial").with_param("port", port))
    }

    fn build(&self, name: &str, identity: &DeviceIdentity, params: Metadata) -> Result<Arc<dyn Device>> {
        let port = identity_port(identity)?;
        let settings = Self::settings(&params)?;
        debug!(name, port = %port, settings = %settings, "Opening serial device");
        let transport = (self.context.connector)(&port, &settings)?;
        let device = SerialDevice::new(transport, settings, self.context.serial.clone());
        Ok(Arc::new(device) as Arc<dyn Device>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::registry::Registration;

    fn quick() -> TPadOptions {
        TPadOptions {
            settle: Duration::ZERO,
            drain_timeout: Duration::ZERO,
            dispatch_timeout: Duration::from_millis(5),
            operation_timeout: Some(Duration::from_secs(2)),
            poll: false,
        }
    }

    fn registry_with(bus: &LoopbackBus, ports: Vec<PortInfo>) -> DeviceRegistry {
        let registry = DeviceRegistry::new();
        let context = DeviceContext::loopback(bus.clone(), ports)
            .with_tpad_options(quick())
            .with_clock(Arc::new(ManualClock::new(0.0)));
        register_default_factories(&registry, context);
        registry
    }

    fn spec(pairs: &[(&str, Value)]) -> Metadata {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_tpad_from_spec_with_port() {
        let bus = LoopbackBus::new();
        let registry = registry_with(&bus, Vec::new());

        let registrations = registry
            .add_from_spec(vec![
                spec(&[("type", Value::from("TPad")), ("port", Value::from("COM3"))]),
                spec(&[("type", Value::from("TPad")), ("port", Value::from("COM4"))]),
            ])
            .unwrap();

        assert_eq!(registrations[0].name(), "TPad");
        assert_eq!(registrations[1].name(), "TPad1");
        assert_eq!(bus.ports(), vec!["COM3", "COM4"]);
        assert!(bus.link("COM3").sent().contains(&"REST".to_string()));

        let photodiode = registry.get_device("TPad1.photodiode2").unwrap();
        assert_eq!(photodiode.device_type(), "TPadPhotodiode");
    }

    #[test]
    fn test_same_port_registered_once() {
        let bus = LoopbackBus::new();
        let registry = registry_with(&bus, Vec::new());
        let entry = spec(&[("type", Value::from("TPad")), ("port", Value::from("COM3"))]);

        registry.add_from_spec(vec![entry.clone()]).unwrap();
        bus.link("COM3").clear_sent();
        let again = registry.add_from_spec(vec![entry]).unwrap();

        assert_eq!(
            again,
            vec![Registration::Duplicate {
                existing: "TPad".to_string()
            }]
        );
        assert_eq!(registry.count_devices().unwrap(), 1);
        assert!(bus.link("COM3").sent().is_empty(), "no second reset");
    }

    #[test]
    fn test_duplicate_with_extra_params_keeps_timer() {
        let bus = LoopbackBus::new();
        let clock = Arc::new(ManualClock::new(100.0));
        let registry = DeviceRegistry::new();
        let context = DeviceContext::loopback(bus.clone(), Vec::new())
            .with_tpad_options(quick())
            .with_clock(clock.clone());
        register_default_factories(&registry, context);

        registry
            .add_from_spec(vec![spec(&[("type", Value::from("TPad")), ("port", Value::from("COM3"))])])
            .unwrap();
        bus.link("COM3").clear_sent();
        clock.set(200.0);

        let again = registry
            .add_from_spec(vec![spec(&[
                ("type", Value::from("TPad")),
                ("port", Value::from("COM3")),
                ("pauseDuration", Value::Integer(0)),
                ("poll", Value::from("False")),
            ])])
            .unwrap();
        assert_eq!(again, vec![Registration::Duplicate { existing: "TPad".to_string() }]);
        assert!(bus.link("COM3").sent().is_empty());

        bus.link("COM3").push_line("A P 1 0");
        let pad = registry.get_device("TPad").unwrap();
        tokio_test::block_on(pad.execute_command("dispatchMessages", Vec::new())).unwrap();
        let messages = tokio_test::block_on(pad.execute_command("getMessages", Vec::new())).unwrap();
        let first = &messages.as_array().unwrap()[0];
        assert_eq!(first.as_object().unwrap().get("t"), Some(&Value::Float(100.0)));
    }

    #[test]
    fn test_detected_duplicate_is_not_reopened() {
        let bus = LoopbackBus::new();
        let ports = vec![PortInfo::new("COM5")
            .with_manufacturer("FTDI")
            .with_description("USB Serial Port (COM5)")];
        let registry = registry_with(&bus, ports);

        registry.add_device("TPad", "pad", Metadata::new()).unwrap();
        bus.link("COM5").clear_sent();
        let again = registry
            .add_device("TPad", "other", spec(&[("port", Value::from("COM5"))]))
            .unwrap();
        assert_eq!(again.name(), "pad");
        assert!(bus.link("COM5").sent().is_empty());
    }

    #[test]
    fn test_serial_from_spec() {
        let bus = LoopbackBus::new();
        let registry = registry_with(&bus, Vec::new());

        let registrations = registry
            .add_from_spec(vec![spec(&[
                ("type", Value::from("Serial")),
                ("name", Value::from("pump")),
                ("port", Value::from("COM9")),
                ("baudrate", Value::Integer(19200)),
                ("parity", Value::from("E")),
            ])])
            .unwrap();
        assert_eq!(registrations[0].name(), "pump");
        assert!(bus.link("COM9").sent().is_empty());

        let pump = registry.get_device("pump").unwrap();
        assert_eq!(pump.device_type(), "Serial");
        let state = tokio_test::block_on(pump.state()).unwrap();
        let state = state.as_object().unwrap();
        assert_eq!(state.get("baudrate"), Some(&Value::Integer(19200)));
        assert_eq!(state.get("byteSize"), Some(&Value::Integer(8)));
        assert_eq!(state.get("parity"), Some(&Value::from("E")));

        let again = registry
            .add_device("Serial", "pump2", spec(&[("port", Value::from("COM9"))]))
            .unwrap();
        assert_eq!(again.name(), "pump");
    }

    #[test]
    fn test_serial_params_validation() {
        let registry = registry_with(&LoopbackBus::new(), Vec::new());
        assert!(matches!(
            registry.add_device("Serial", "s", Metadata::new()),
            Err(DeviceError::MissingParameter(_))
        ));
        for (key, value) in [
            ("byteSize", Value::Integer(9)),
            ("stopBits", Value::Integer(3)),
            ("parity", Value::from("Q")),
            ("baudrate", Value::Integer(-1)),
            ("baudrate", Value::from("fast")),
        ] {
            let params = spec(&[("port", Value::from("COM9")), (key, value)]);
            assert!(
                matches!(registry.add_device("Serial", "s", params), Err(DeviceError::InvalidValue(_))),
                "{} should be rejected",
                key
            );
        }
        assert_eq!(registry.count_devices().unwrap(), 0);
    }

    #[test]
    fn test_tpad_port_detection() {
        let bus = LoopbackBus::new();
        let ports = vec![PortInfo::new("COM5")
            .with_manufacturer("FTDI")
            .with_description("USB Serial Port (COM5)")];
        let registry = registry_with(&bus, ports);

        registry
            .add_device("TPad", "pad", Metadata::new())
            .unwrap();
        assert_eq!(bus.ports(), vec!["COM5"]);

        let available = registry.available_devices("TPad").unwrap();
        assert_eq!(available[0].get("port"), Some(&Value::from("COM5")));
        assert_eq!(registry.available_devices("serial").unwrap().len(), 1);
    }

    #[test]
    fn test_tpad_detection_failure() {
        let registry = registry_with(&LoopbackBus::new(), Vec::new());
        assert!(matches!(
            registry.add_device("TPad", "pad", Metadata::new()),
            Err(DeviceError::ConnectionError(_))
        ));
        assert_eq!(registry.count_devices().unwrap(), 0);
    }

    #[test]
    fn test_tpad_params_validation() {
        let registry = registry_with(&LoopbackBus::new(), Vec::new());
        let bad = spec(&[
            ("port", Value::from("COM3")),
            ("pauseDuration", Value::from("soon")),
        ]);
        assert!(matches!(
            registry.add_device("TPad", "pad", bad),
            Err(DeviceError::InvalidValue(_))
        ));
        let bad = spec(&[("port", Value::Integer(3))]);
        assert!(matches!(
            registry.add_device("TPad", "pad", bad),
            Err(DeviceError::InvalidValue(_))
        ));
    }
}
