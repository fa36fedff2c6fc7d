/*!
 * Device trait and core device abstractions.
 *
 * This module defines the interface every device held by the registry
 * implements, together with the identity used to deduplicate devices.
 */
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use liaison_core::{
    error::Error as CoreError,
    types::{Metadata, Value},
};

use crate::response::ResponseListener;

/// Error type for device operations
#[derive(Error, Debug)]
pub enum DeviceError {
    /// No factory is registered for the requested device type
    #[error("Unknown device type: {0}")]
    UnknownDeviceType(String),

    /// The hardware could not be located or opened
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Communication error with an opened device
    #[error("Communication error: {0}")]
    CommunicationError(String),

    /// A device operation did not finish in time
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// A value was out of range or of the wrong type
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// A required parameter was not supplied
    #[error("Missing parameter: {0}")]
    MissingParameter(String),

    /// No device with this name exists
    #[error("Device not found: {0}")]
    NotFound(String),

    /// The device does not support the operation
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Other error
    #[error("Other error: {0}")]
    Other(String),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] CoreError),
}

/// Result type for device operations
pub type Result<T> = std::result::Result<T, DeviceError>;

impl DeviceError {
    /// Stable name of the error kind
    pub fn kind(&self) -> &'static str {
        match self {
            DeviceError::UnknownDeviceType(_) => "UnknownDeviceType",
            DeviceError::ConnectionError(_) => "ConnectionError",
            DeviceError::CommunicationError(_) => "CommunicationError",
            DeviceError::Timeout(_) => "Timeout",
            DeviceError::InvalidValue(_) => "InvalidValue",
            DeviceError::MissingParameter(_) => "MissingParameter",
            DeviceError::NotFound(_) => "NotFound",
            DeviceError::NotSupported(_) => "NotSupported",
            DeviceError::ConfigurationError(_) => "ConfigurationError",
            DeviceError::Other(_) => "Other",
            DeviceError::Core(_) => "Core",
        }
    }

    /// Map a core error onto the closest device error
    pub fn from_core(err: CoreError) -> Self {
        match err {
            CoreError::Timeout(msg) => DeviceError::Timeout(msg),
            other => DeviceError::Core(other),
        }
    }
}

/// The identity of a physical device.
///
/// Two device instances with equal identities drive the same hardware, so the
/// registry keeps only the first of them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceIdentity {
    /// The device type tag
    pub device_type: String,
    /// The construction parameters that single out the hardware
    pub params: BTreeMap<String, Value>,
}

impl DeviceIdentity {
    /// Create an identity with no parameters
    pub fn new<S: Into<String>>(device_type: S) -> Self {
        Self {
            device_type: device_type.into(),
            params: BTreeMap::new(),
        }
    }

    /// Add an identity parameter
    pub fn with_param<K: Into<String>, V: Into<Value>>(mut self, key: K, value: V) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Render the identity as a value for remote callers
    pub fn to_value(&self) -> Value {
        let mut params: Metadata = self
            .params
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        params.insert("type".to_string(), Value::String(self.device_type.clone()));
        Value::Object(params)
    }
}

/// The core device trait
///
/// Blocking hardware I/O happens behind the async methods; implementations move
/// it off the async executor themselves.
#[async_trait]
pub trait Device: Send + Sync + Debug {
    /// Get the device type tag
    fn device_type(&self) -> &str;

    /// Get the identity of the hardware this instance drives
    fn identity(&self) -> DeviceIdentity;

    /// Check whether this instance drives the hardware described by `other`
    fn is_same_device(&self, other: &DeviceIdentity) -> bool {
        self.identity() == *other
    }

    /// Sub-devices addressable as `<parent>.<child>`
    fn children(&self) -> Vec<(String, Arc<dyn Device>)> {
        Vec::new()
    }

    /// Attach a listener that sees every response this device receives
    fn add_listener(&self, _listener: Arc<dyn ResponseListener>) -> Result<()> {
        Err(DeviceError::NotSupported(format!(
            "{} does not emit responses",
            self.device_type()
        )))
    }

    /// Detach all listeners
    fn clear_listeners(&self) {}

    /// Get the latest known state of the device
    async fn state(&self) -> Result<Value>;

    /// Commands accepted by [`Device::execute_command`]
    fn available_commands(&self) -> Vec<&'static str> {
        Vec::new()
    }

    /// Check if a command is supported by the device
    fn supports_command(&self, command: &str) -> bool {
        self.available_commands().contains(&command)
    }

    /// Execute a command on the device
    async fn execute_command(&self, command: &str, _args: Vec<Value>) -> Result<Value> {
        Err(DeviceError::NotSupported(format!(
            "Command {} not supported by {}",
            command,
            self.device_type()
        )))
    }

    /// Release the hardware and stop background work
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

/// Positional argument access for device commands
pub(crate) fn arg_u8(args: &[Value], index: usize, name: &str) -> Result<u8> {
    let value = args
        .get(index)
        .ok_or_else(|| DeviceError::MissingParameter(name.to_string()))?;
    value
        .as_integer()
        .and_then(|i| u8::try_from(i).ok())
        .ok_or_else(|| DeviceError::InvalidValue(format!("{} must be 0-255, got {}", name, value)))
}
