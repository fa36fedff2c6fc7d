//! Per-input handlers owned by a TPad.

use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use tracing::trace;

use liaison_core::{types::Value, utils::spawn_blocking_with_timeout};

use super::message::Message;
use super::TPadInner;
use crate::device::{arg_u8, Device, DeviceError, DeviceIdentity, Result};
use crate::response::{Response, ResponseClass, ResponseListener, ResponseLog};

/// The kind of physical input a handler stands for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputKind {
    /// Push button
    Button,
    /// Photodiode
    Photodiode,
    /// Voice key
    Voicekey,
}

impl InputKind {
    /// Prefix of child names, e.g. `button3`
    pub fn prefix(&self) -> &'static str {
        match self {
            InputKind::Button => "button",
            InputKind::Photodiode => "photodiode",
            InputKind::Voicekey => "voicekey",
        }
    }

    /// Device type tag of the handler
    pub fn device_type(&self) -> &'static str {
        match self {
            InputKind::Button => "TPadButton",
            InputKind::Photodiode => "TPadPhotodiode",
            InputKind::Voicekey => "TPadVoicekey",
        }
    }

    /// Class of the responses the handler produces
    pub fn response_class(&self) -> ResponseClass {
        match self {
            InputKind::Button => ResponseClass::Button,
            InputKind::Photodiode => ResponseClass::Photodiode,
            InputKind::Voicekey => ResponseClass::Voicekey,
        }
    }
}

/// One button, photodiode or voice key on a TPad.
///
/// Handlers keep their own response log. State queries go back to the parent
/// driver to pull pending lines off the wire first.
pub struct TPadInput {
    kind: InputKind,
    number: u8,
    port: String,
    log: ResponseLog,
    threshold: Mutex<Option<u8>>,
    parent: Weak<TPadInner>,
}

impl TPadInput {
    pub(super) fn new(kind: InputKind, number: u8, port: &str, parent: Weak<TPadInner>) -> Self {
        Self {
            kind,
            number,
            port: port.to_string(),
            log: ResponseLog::new(),
            threshold: Mutex::new(None),
            parent,
        }
    }

    /// What kind of input this is
    pub fn kind(&self) -> InputKind {
        self.kind
    }

    /// Input number on the box, starting at 1
    pub fn number(&self) -> u8 {
        self.number
    }

    /// Name under the parent, e.g. `photodiode1`
    pub fn child_name(&self) -> String {
        format!("{}{}", self.kind.prefix(), self.number)
    }

    /// The response history
    pub fn log(&self) -> &ResponseLog {
        &self.log
    }

    /// Build a response from a parsed line
    pub fn parse_message(&self, message: &Message, epoch: f64) -> Response {
        Response {
            class: self.kind.response_class(),
            t: message.timestamp(epoch),
            value: message.pressed,
            threshold: self.threshold(),
            channel: message.channel.code(),
            code: message.code,
        }
    }

    /// Record a response and notify listeners
    pub fn receive_message(&self, response: Response) {
        let count = self.log.push(response);
        trace!(port = %self.port, input = %self.child_name(), count, "response received");
    }

    /// Latest value after pulling pending lines off the wire.
    ///
    /// `None` until the input has reported anything.
    pub fn get_state(&self) -> Result<Option<bool>> {
        if let Some(parent) = self.parent.upgrade() {
            parent.dispatch_messages(parent.options.dispatch_timeout)?;
        }
        Ok(self.log.last().map(|r| r.value))
    }

    /// Current photodiode threshold
    pub fn threshold(&self) -> Option<u8> {
        self.threshold.lock().map(|t| *t).unwrap_or_default()
    }

    pub(super) fn mirror_threshold(&self, level: u8) {
        if let Ok(mut threshold) = self.threshold.lock() {
            *threshold = Some(level);
        }
    }

    /// Set the trigger level of this photodiode on the device
    pub fn set_threshold(&self, level: u8) -> Result<()> {
        if self.kind != InputKind::Photodiode {
            return Err(DeviceError::NotSupported(format!(
                "{} has no threshold",
                self.child_name()
            )));
        }
        let parent = self.parent.upgrade().ok_or_else(|| {
            DeviceError::ConnectionError(format!("TPad on {} is closed", self.port))
        })?;
        parent.set_photodiode_threshold(self.number, level)
    }

    // Owned handle to this input plus its driver, for work moved off the executor
    fn owned(&self) -> Result<(Arc<TPadInner>, Arc<TPadInput>)> {
        let parent = self.parent.upgrade().ok_or_else(|| {
            DeviceError::ConnectionError(format!("TPad on {} is closed", self.port))
        })?;
        let input = parent
            .input(self.kind, self.number)
            .ok_or_else(|| DeviceError::NotFound(self.child_name()))?;
        Ok((parent, input))
    }

    fn responses_value(&self) -> Value {
        let responses = self
            .log
            .snapshot()
            .iter()
            .map(|r| {
                let mut entry = liaison_core::types::Metadata::new();
                entry.insert("t".to_string(), Value::from(r.t));
                entry.insert("value".to_string(), Value::from(r.value));
                entry.insert("threshold".to_string(), Value::from(r.threshold));
                Value::Object(entry)
            })
            .collect::<Vec<_>>();
        Value::Array(responses)
    }
}

impl fmt::Debug for TPadInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TPadInput")
            .field("kind", &self.kind)
            .field("number", &self.number)
            .field("port", &self.port)
            .field("responses", &self.log.len())
            .finish()
    }
}

#[async_trait]
impl Device for TPadInput {
    fn device_type(&self) -> &str {
        self.kind.device_type()
    }

    fn identity(&self) -> DeviceIdentity {
        DeviceIdentity::new(self.kind.device_type())
            .with_param("port", self.port.clone())
            .with_param("number", self.number)
    }

    fn add_listener(&self, listener: Arc<dyn ResponseListener>) -> Result<()> {
        self.log.add_listener(listener);
        Ok(())
    }

    fn clear_listeners(&self) {
        self.log.clear_listeners();
    }

    async fn state(&self) -> Result<Value> {
        let (parent, input) = self.owned()?;
        let state = spawn_blocking_with_timeout(parent.options.operation_timeout, move || {
            input.get_state()
        })
        .await
        .map_err(DeviceError::from_core)??;
        Ok(Value::from(state))
    }

    fn available_commands(&self) -> Vec<&'static str> {
        match self.kind {
            InputKind::Photodiode => vec!["getState", "getResponses", "setThreshold", "getThreshold"],
            _ => vec!["getState", "getResponses"],
        }
    }

    async fn execute_command(&self, command: &str, args: Vec<Value>) -> Result<Value> {
        if !self.supports_command(command) {
            return Err(DeviceError::NotSupported(format!(
                "Command {} not supported by {}",
                command,
                self.device_type()
            )));
        }
        let (parent, input) = self.owned()?;
        match command {
            "getState" => self.state().await,
            "getResponses" => Ok(self.responses_value()),
            "getThreshold" => Ok(Value::from(self.threshold())),
            "setThreshold" => {
                let level = arg_u8(&args, 0, "threshold")?;
                spawn_blocking_with_timeout(parent.options.operation_timeout, move || {
                    input.set_threshold(level)
                })
                .await
                .map_err(DeviceError::from_core)??;
                Ok(Value::from(level))
            }
            _ => Err(DeviceError::NotSupported(command.to_string())),
        }
    }
}
