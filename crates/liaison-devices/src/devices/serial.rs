/*!
 * Generic line-oriented serial device.
 *
 * Remote callers write lines to the port and collect whatever came back.
 * Nothing is sent on open, so adding one is free of side effects on the
 * attached hardware.
 */
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use liaison_core::{
    config::RuntimeConfig,
    types::{Metadata, Value},
    utils::spawn_blocking_with_timeout,
};

use crate::device::{Device, DeviceError, DeviceIdentity, Result};
use crate::transport::{SerialSettings, SerialTransport};

/// Baud rate used when a spec entry does not name one
pub const DEFAULT_SERIAL_BAUD_RATE: u32 = 9600;

/// Timing knobs for generic serial devices
#[derive(Debug, Clone)]
pub struct SerialOptions {
    /// How long `getResponse` waits when the caller gives no timeout
    pub response_timeout: Duration,
    /// Upper bound for an operation issued from async code
    pub operation_timeout: Option<Duration>,
}

impl Default for SerialOptions {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_millis(100),
            operation_timeout: Some(Duration::from_secs(5)),
        }
    }
}

impl SerialOptions {
    /// Options from the `[runtime]` configuration section
    pub fn from_config(runtime: &RuntimeConfig) -> Self {
        Self {
            operation_timeout: runtime.operation_timeout(),
            ..Self::default()
        }
    }
}

struct SerialInner {
    port: String,
    settings: SerialSettings,
    options: SerialOptions,
    link: Mutex<Box<dyn SerialTransport>>,
    last_response: Mutex<Option<String>>,
}

impl SerialInner {
    fn lock_link(&self) -> Result<MutexGuard<'_, Box<dyn SerialTransport>>> {
        self.link
            .lock()
            .map_err(|_| DeviceError::Other(format!("Serial link on {} is poisoned", self.port)))
    }

    fn send_message(&self, message: &str) -> Result<()> {
        self.lock_link()?.send_message(message)
    }

    fn get_response(&self, timeout: Duration) -> Result<Vec<String>> {
        let lines = self.lock_link()?.read_lines(timeout)?;
        if let Some(last) = lines.last() {
            if let Ok(mut slot) = self.last_response.lock() {
                *slot = Some(last.clone());
            }
        }
        debug!(port = %self.port, count = lines.len(), "Read serial response");
        Ok(lines)
    }

    fn last_response(&self) -> Option<String> {
        self.last_response.lock().ok().and_then(|slot| slot.clone())
    }
}

/// A serial port exposed as a device
#[derive(Clone)]
pub struct SerialDevice {
    inner: Arc<SerialInner>,
}

impl SerialDevice {
    /// Wrap an opened transport
    pub fn new(transport: Box<dyn SerialTransport>, settings: SerialSettings, options: SerialOptions) -> Self {
        let port = transport.port_name().to_string();
        info!(port = %port, settings = %settings, "Serial device ready");
        Self {
            inner: Arc::new(SerialInner {
                port,
                settings,
                options,
                link: Mutex::new(transport),
                last_response: Mutex::new(None),
            }),
        }
    }

    /// Port the device is attached to
    pub fn port(&self) -> &str {
        &self.inner.port
    }

    /// Line settings the port was opened with
    pub fn settings(&self) -> &SerialSettings {
        &self.inner.settings
    }

    /// Write one line to the device
    pub fn send_message(&self, message: &str) -> Result<()> {
        self.inner.send_message(message)
    }

    /// Lines received within `timeout`
    pub fn get_response(&self, timeout: Duration) -> Result<Vec<String>> {
        self.inner.get_response(timeout)
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&SerialInner) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = self.inner.clone();
        spawn_blocking_with_timeout(self.inner.options.operation_timeout, move || f(&inner))
            .await
            .map_err(DeviceError::from_core)?
    }
}

impl fmt::Debug for SerialDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialDevice")
            .field("port", &self.inner.port)
            .field("settings", &self.inner.settings)
            .finish()
    }
}

fn response_timeout(args: &[Value], default: Duration) -> Result<Duration> {
    match args.first() {
        None | Some(Value::Null) => Ok(default),
        Some(value) => value
            .as_float()
            .filter(|s| s.is_finite() && *s >= 0.0)
            .map(Duration::from_secs_f64)
            .ok_or_else(|| DeviceError::InvalidValue(format!("timeout must be seconds, got {}", value))),
    }
}

#[async_trait]
impl Device for SerialDevice {
    fn device_type(&self) -> &str {
        "Serial"
    }

    fn identity(&self) -> DeviceIdentity {
        DeviceIdentity::new("Serial").with_param("port", self.inner.port.clone())
    }

    async fn state(&self) -> Result<Value> {
        let settings = &self.inner.settings;
        let mut state = Metadata::new();
        state.insert("port".to_string(), Value::from(self.inner.port.clone()));
        state.insert("baudrate".to_string(), Value::from(settings.baud_rate));
        state.insert("byteSize".to_string(), Value::from(settings.data_bits));
        state.insert("stopBits".to_string(), Value::from(settings.stop_bits));
        state.insert("parity".to_string(), Value::from(settings.parity.code()));
        state.insert("lastResponse".to_string(), Value::from(self.inner.last_response()));
        Ok(Value::Object(state))
    }

    fn available_commands(&self) -> Vec<&'static str> {
        vec!["sendMessage", "getResponse"]
    }

    async fn execute_command(&self, command: &str, args: Vec<Value>) -> Result<Value> {
        match command {
            "sendMessage" => {
                let message = args
                    .first()
                    .and_then(Value::as_str)
                    .ok_or_else(|| DeviceError::MissingParameter("message".to_string()))?
                    .to_string();
                self.blocking(move |inner| inner.send_message(&message)).await?;
                Ok(Value::from(true))
            }
            "getResponse" => {
                let timeout = response_timeout(&args, self.inner.options.response_timeout)?;
                let lines = self.blocking(move |inner| inner.get_response(timeout)).await?;
                Ok(Value::Array(lines.into_iter().map(Value::from).collect()))
            }
            other => Err(DeviceError::NotSupported(format!(
                "Command {} not supported by Serial",
                other
            ))),
        }
    }
}
