/*!
 * TPad response box driver.
 *
 * The TPad streams button, photodiode and voice key events over a serial
 * link and accepts short ASCII commands. Every command sequence runs under
 * the link lock: commands sent in configuration mode (`MOD0`) always finish
 * with a return to streaming mode (`MOD3`) before another caller can talk to
 * the device.
 */
pub mod input;
pub mod message;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, trace, warn};

use liaison_core::{
    config::{DevicesConfig, RuntimeConfig},
    logging::component_span,
    types::{Metadata, Value},
    utils::spawn_blocking_with_timeout,
};

pub use self::input::{InputKind, TPadInput};
pub use self::message::{Channel, Message, RawMessage};

use crate::clock::Clock;
use crate::device::{arg_u8, Device, DeviceError, DeviceIdentity, Result};
use crate::response::ResponseListener;
use crate::transport::SerialTransport;

/// Number of photodiode inputs
pub const PHOTODIODE_COUNT: u8 = 2;
/// Number of button inputs
pub const BUTTON_COUNT: u8 = 10;
/// Number of voice key inputs
pub const VOICEKEY_COUNT: u8 = 1;
/// Photodiode level used when calibration is requested without one
pub const DEFAULT_CALIBRATION_LEVEL: u8 = 127;

/// Device operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TPadMode {
    /// Mode 0: accepts configuration commands, no streaming
    Configuration,
    /// Mode 3: streams input events
    Streaming,
}

impl TPadMode {
    /// Numeric mode id used on the wire
    pub fn number(&self) -> u8 {
        match self {
            TPadMode::Configuration => 0,
            TPadMode::Streaming => 3,
        }
    }

    /// Look up a mode by its numeric id
    pub fn from_number(number: i64) -> Result<Self> {
        match number {
            0 => Ok(TPadMode::Configuration),
            3 => Ok(TPadMode::Streaming),
            other => Err(DeviceError::InvalidValue(format!(
                "Unsupported TPad mode {}",
                other
            ))),
        }
    }

    fn command(&self) -> String {
        format!("MOD{}", self.number())
    }
}

/// Timing and behavior knobs for a TPad
#[derive(Debug, Clone)]
pub struct TPadOptions {
    /// Pause after each command so the firmware can act on it
    pub settle: Duration,
    /// How long to wait for stray lines when clearing the input buffer
    pub drain_timeout: Duration,
    /// How long one dispatch cycle waits for lines
    pub dispatch_timeout: Duration,
    /// Upper bound for an operation issued from async code
    pub operation_timeout: Option<Duration>,
    /// Run a background dispatch loop
    pub poll: bool,
}

impl Default for TPadOptions {
    fn default() -> Self {
        Self {
            settle: Duration::from_millis(16),
            drain_timeout: Duration::from_millis(50),
            dispatch_timeout: Duration::from_millis(33),
            operation_timeout: Some(Duration::from_secs(5)),
            poll: true,
        }
    }
}

impl TPadOptions {
    /// Options from the `[devices]` and `[runtime]` configuration sections
    pub fn from_config(devices: &DevicesConfig, runtime: &RuntimeConfig) -> Self {
        Self {
            settle: devices.settle(),
            dispatch_timeout: devices.dispatch_timeout(),
            operation_timeout: runtime.operation_timeout(),
            poll: devices.poll,
            ..Self::default()
        }
    }
}

fn pause(duration: Duration) {
    if !duration.is_zero() {
        thread::sleep(duration);
    }
}

/// Exclusive state of the serial link
#[derive(Debug)]
struct Link {
    transport: Box<dyn SerialTransport>,
    mode: Option<TPadMode>,
    last_reset: Option<f64>,
}

impl Link {
    fn set_mode(&mut self, mode: TPadMode, options: &TPadOptions) -> Result<()> {
        // The exit command fails harmlessly when no mode is active.
        if let Err(e) = self.transport.send_message("X") {
            debug!(port = %self.transport.port_name(), "Ignoring mode exit failure: {}", e);
        }
        pause(options.settle);
        self.transport.send_message(&mode.command())?;
        pause(options.settle);
        let discarded = self.transport.read_lines(options.drain_timeout)?;
        if !discarded.is_empty() {
            trace!(count = discarded.len(), "Discarded lines while switching mode");
        }
        self.mode = Some(mode);
        Ok(())
    }

    fn send(&mut self, command: &str, options: &TPadOptions) -> Result<()> {
        self.transport.send_message(command)?;
        pause(options.settle);
        Ok(())
    }
}

/// Shared driver state, referenced weakly by inputs and the poll thread
pub(crate) struct TPadInner {
    port: String,
    pub(crate) options: TPadOptions,
    clock: Arc<dyn Clock>,
    link: Mutex<Link>,
    history: Mutex<Vec<RawMessage>>,
    photodiodes: Vec<Arc<TPadInput>>,
    buttons: Vec<Arc<TPadInput>>,
    voicekeys: Vec<Arc<TPadInput>>,
    poller: Mutex<Option<PollWorker>>,
}

impl TPadInner {
    fn lock_link(&self) -> Result<MutexGuard<'_, Link>> {
        self.link
            .lock()
            .map_err(|_| DeviceError::Other(format!("TPad link on {} is poisoned", self.port)))
    }

    fn inputs_of(&self, kind: InputKind) -> &[Arc<TPadInput>] {
        match kind {
            InputKind::Button => &self.buttons,
            InputKind::Photodiode => &self.photodiodes,
            InputKind::Voicekey => &self.voicekeys,
        }
    }

    pub(crate) fn input(&self, kind: InputKind, number: u8) -> Option<Arc<TPadInput>> {
        let index = usize::from(number).checked_sub(1)?;
        self.inputs_of(kind).get(index).cloned()
    }

    fn all_inputs(&self) -> impl Iterator<Item = &Arc<TPadInput>> {
        self.photodiodes
            .iter()
            .chain(self.buttons.iter())
            .chain(self.voicekeys.iter())
    }

    fn route(&self, message: &Message) -> Option<Arc<TPadInput>> {
        let kind = match message.channel {
            Channel::Buttons => InputKind::Button,
            Channel::Optos => InputKind::Photodiode,
            Channel::VoiceKey => InputKind::Voicekey,
            Channel::TtlIn => return None,
        };
        self.input(kind, message.number()?)
    }

    fn set_mode(&self, mode: TPadMode) -> Result<()> {
        self.lock_link()?.set_mode(mode, &self.options)
    }

    fn reset_timer(&self) -> Result<f64> {
        let mut link = self.lock_link()?;
        link.set_mode(TPadMode::Configuration, &self.options)?;
        link.send("REST", &self.options)?;
        let epoch = self.clock.now();
        link.last_reset = Some(epoch);
        link.set_mode(TPadMode::Streaming, &self.options)?;
        debug!(port = %self.port, epoch, "TPad timer reset");
        Ok(epoch)
    }

    /// Read pending lines and hand each one to its input.
    ///
    /// Lines that do not parse are dropped. Returns the number of responses
    /// delivered to inputs.
    pub(crate) fn dispatch_messages(&self, timeout: Duration) -> Result<usize> {
        let mut link = self.lock_link()?;
        let lines = link.transport.read_lines(timeout)?;
        if lines.is_empty() {
            return Ok(0);
        }

        let epoch = link.last_reset.unwrap_or_default();
        let mut delivered = 0;
        for line in lines {
            let message = match Message::parse(&line) {
                Some(message) => message,
                None => {
                    debug!(port = %self.port, line = %line, "Discarding unparseable line");
                    continue;
                }
            };

            let t = message.timestamp(epoch);
            if let Ok(mut history) = self.history.lock() {
                history.push(RawMessage { t, line });
            }

            match self.route(&message) {
                Some(input) => {
                    let response = input.parse_message(&message, epoch);
                    input.receive_message(response);
                    delivered += 1;
                }
                None => trace!(port = %self.port, %message, "No input for message"),
            }
        }
        Ok(delivered)
    }

    fn calibrate_photodiode(&self, level: u8) -> Result<()> {
        let mut link = self.lock_link()?;
        link.set_mode(TPadMode::Configuration, &self.options)?;
        for number in 1..=PHOTODIODE_COUNT {
            link.send(&format!("AAO{} {}", number, level), &self.options)?;
        }
        link.transport.read_lines(self.options.drain_timeout)?;
        link.set_mode(TPadMode::Streaming, &self.options)?;
        for photodiode in &self.photodiodes {
            photodiode.mirror_threshold(level);
        }
        info!(port = %self.port, level, "Calibrated photodiodes");
        Ok(())
    }

    pub(crate) fn set_photodiode_threshold(&self, number: u8, level: u8) -> Result<()> {
        let photodiode = self.input(InputKind::Photodiode, number).ok_or_else(|| {
            DeviceError::NotFound(format!("photodiode{} on {}", number, self.port))
        })?;
        let mut link = self.lock_link()?;
        link.set_mode(TPadMode::Configuration, &self.options)?;
        link.send(&format!("AAO{} {}", number, level), &self.options)?;
        link.set_mode(TPadMode::Streaming, &self.options)?;
        photodiode.mirror_threshold(level);
        debug!(port = %self.port, number, level, "Photodiode threshold set");
        Ok(())
    }

    fn is_awake(&self) -> Result<bool> {
        let mut link = self.lock_link()?;
        link.set_mode(TPadMode::Configuration, &self.options)?;
        link.send("HELP", &self.options)?;
        let reply = link
            .transport
            .read_lines(self.options.dispatch_timeout.max(self.options.drain_timeout))?;
        link.set_mode(TPadMode::Streaming, &self.options)?;
        Ok(!reply.is_empty())
    }

    fn messages(&self) -> Vec<RawMessage> {
        self.history.lock().map(|h| h.clone()).unwrap_or_default()
    }

    fn state_snapshot(&self) -> Value {
        let state: Metadata = self
            .all_inputs()
            .map(|input| {
                let value = input.log().last().map(|r| r.value);
                (input.child_name(), Value::from(value))
            })
            .collect();
        Value::Object(state)
    }
}

/// Background dispatch loop on a dedicated thread
struct PollWorker {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl PollWorker {
    fn spawn(device: Weak<TPadInner>, port: &str, interval: Duration) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let interval = interval.max(Duration::from_millis(1));
        let handle = thread::Builder::new()
            .name(format!("tpad-poll-{}", port))
            .spawn({
                let span = component_span("tpad", Some(port));
                move || span.in_scope(|| poll_loop(device, flag, interval))
            })
            .map_err(|e| DeviceError::Other(format!("Failed to start poll thread: {}", e)))?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            // The last driver handle can be released on the poll thread itself.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for PollWorker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

fn poll_loop(device: Weak<TPadInner>, stop: Arc<AtomicBool>, interval: Duration) {
    while !stop.load(Ordering::SeqCst) {
        let inner = match device.upgrade() {
            Some(inner) => inner,
            None => break,
        };
        if let Err(e) = inner.dispatch_messages(interval) {
            warn!(port = %inner.port, "TPad dispatch failed: {}", e);
            drop(inner);
            thread::sleep(interval);
        }
    }
    debug!("TPad poll loop stopped");
}

/// A TPad response box.
///
/// Cloning yields another handle to the same device.
#[derive(Clone)]
pub struct TPad {
    inner: Arc<TPadInner>,
}

impl TPad {
    /// Take over `transport`, reset the device timer and start polling if
    /// configured.
    pub fn open(
        transport: Box<dyn SerialTransport>,
        options: TPadOptions,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let port = transport.port_name().to_string();
        let inner = Arc::new_cyclic(|weak: &Weak<TPadInner>| {
            let make = |kind, count: u8| {
                (1..=count)
                    .map(|n| Arc::new(TPadInput::new(kind, n, &port, weak.clone())))
                    .collect::<Vec<_>>()
            };
            TPadInner {
                port: port.clone(),
                photodiodes: make(InputKind::Photodiode, PHOTODIODE_COUNT),
                buttons: make(InputKind::Button, BUTTON_COUNT),
                voicekeys: make(InputKind::Voicekey, VOICEKEY_COUNT),
                options,
                clock,
                link: Mutex::new(Link {
                    transport,
                    mode: None,
                    last_reset: None,
                }),
                history: Mutex::new(Vec::new()),
                poller: Mutex::new(None),
            }
        });

        let tpad = Self { inner };
        tpad.reset_timer()?;
        if tpad.inner.options.poll {
            tpad.start_polling()?;
        }
        info!(port = %port, "TPad ready");
        Ok(tpad)
    }

    /// Port the device is attached to
    pub fn port(&self) -> &str {
        &self.inner.port
    }

    /// Switch the device mode
    pub fn set_mode(&self, mode: TPadMode) -> Result<()> {
        self.inner.set_mode(mode)
    }

    /// Current mode, if one has been set
    pub fn mode(&self) -> Option<TPadMode> {
        self.inner.lock_link().ok().and_then(|link| link.mode)
    }

    /// Zero the device clock and record the matching host time.
    ///
    /// Returns the new epoch.
    pub fn reset_timer(&self) -> Result<f64> {
        self.inner.reset_timer()
    }

    /// Host time of the last reset
    pub fn last_reset(&self) -> Option<f64> {
        self.inner.lock_link().ok().and_then(|link| link.last_reset)
    }

    /// Run one dispatch cycle with the configured timeout
    pub fn dispatch_messages(&self) -> Result<usize> {
        self.inner.dispatch_messages(self.inner.options.dispatch_timeout)
    }

    /// Run one dispatch cycle with an explicit timeout
    pub fn dispatch_messages_within(&self, timeout: Duration) -> Result<usize> {
        self.inner.dispatch_messages(timeout)
    }

    /// Set both photodiode thresholds to `level`
    pub fn calibrate_photodiode(&self, level: u8) -> Result<()> {
        self.inner.calibrate_photodiode(level)
    }

    /// Check the device answers a help request
    pub fn is_awake(&self) -> Result<bool> {
        self.inner.is_awake()
    }

    /// Every parsed line seen so far
    pub fn messages(&self) -> Vec<RawMessage> {
        self.inner.messages()
    }

    /// Photodiode `number`, starting at 1
    pub fn photodiode(&self, number: u8) -> Option<Arc<TPadInput>> {
        self.inner.input(InputKind::Photodiode, number)
    }

    /// Button `number`, starting at 1
    pub fn button(&self, number: u8) -> Option<Arc<TPadInput>> {
        self.inner.input(InputKind::Button, number)
    }

    /// Voice key `number`, starting at 1
    pub fn voicekey(&self, number: u8) -> Option<Arc<TPadInput>> {
        self.inner.input(InputKind::Voicekey, number)
    }

    /// All inputs: photodiodes, then buttons, then voice keys
    pub fn inputs(&self) -> Vec<Arc<TPadInput>> {
        self.inner.all_inputs().cloned().collect()
    }

    /// Start the background dispatch loop.
    ///
    /// Returns `false` if it was already running.
    pub fn start_polling(&self) -> Result<bool> {
        let mut poller = self
            .inner
            .poller
            .lock()
            .map_err(|_| DeviceError::Other("Failed to acquire poller lock".to_string()))?;
        if poller.is_some() {
            return Ok(false);
        }
        *poller = Some(PollWorker::spawn(
            Arc::downgrade(&self.inner),
            &self.inner.port,
            self.inner.options.dispatch_timeout,
        )?);
        debug!(port = %self.inner.port, "TPad polling started");
        Ok(true)
    }

    /// Stop the background dispatch loop and wait for it to exit.
    ///
    /// Returns `false` if it was not running.
    pub fn stop_polling(&self) -> bool {
        let worker = match self.inner.poller.lock() {
            Ok(mut poller) => poller.take(),
            Err(_) => None,
        };
        match worker {
            Some(worker) => {
                worker.stop();
                debug!(port = %self.inner.port, "TPad polling stopped");
                true
            }
            None => false,
        }
    }

    /// Check if the background dispatch loop is running
    pub fn is_polling(&self) -> bool {
        self.inner
            .poller
            .lock()
            .map(|p| p.is_some())
            .unwrap_or(false)
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&TPadInner) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = self.inner.clone();
        spawn_blocking_with_timeout(self.inner.options.operation_timeout, move || f(&inner))
            .await
            .map_err(DeviceError::from_core)?
    }
}

impl fmt::Debug for TPad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TPad")
            .field("port", &self.inner.port)
            .field("options", &self.inner.options)
            .field("polling", &self.is_polling())
            .finish()
    }
}

#[async_trait]
impl Device for TPad {
    fn device_type(&self) -> &str {
        "TPad"
    }

    fn identity(&self) -> DeviceIdentity {
        DeviceIdentity::new("TPad").with_param("port", self.inner.port.clone())
    }

    fn children(&self) -> Vec<(String, Arc<dyn Device>)> {
        self.inner
            .all_inputs()
            .map(|input| (input.child_name(), input.clone() as Arc<dyn Device>))
            .collect()
    }

    fn add_listener(&self, listener: Arc<dyn ResponseListener>) -> Result<()> {
        for input in self.inner.all_inputs() {
            input.log().add_listener(listener.clone());
        }
        Ok(())
    }

    fn clear_listeners(&self) {
        for input in self.inner.all_inputs() {
            input.log().clear_listeners();
        }
    }

    async fn state(&self) -> Result<Value> {
        self.blocking(|inner| {
            inner.dispatch_messages(inner.options.dispatch_timeout)?;
            Ok(inner.state_snapshot())
        })
        .await
    }

    fn available_commands(&self) -> Vec<&'static str> {
        vec![
            "resetTimer",
            "setMode",
            "calibratePhotodiode",
            "isAwake",
            "dispatchMessages",
            "getMessages",
            "startPolling",
            "stopPolling",
        ]
    }

    async fn execute_command(&self, command: &str, args: Vec<Value>) -> Result<Value> {
        match command {
            "resetTimer" => {
                let epoch = self.blocking(|inner| inner.reset_timer()).await?;
                Ok(Value::from(epoch))
            }
            "setMode" => {
                let number = args
                    .first()
                    .and_then(Value::as_integer)
                    .ok_or_else(|| DeviceError::MissingParameter("mode".to_string()))?;
                let mode = TPadMode::from_number(number)?;
                self.blocking(move |inner| inner.set_mode(mode)).await?;
                Ok(Value::from(i64::from(mode.number())))
            }
            "calibratePhotodiode" => {
                let level = if args.is_empty() {
                    DEFAULT_CALIBRATION_LEVEL
                } else {
                    arg_u8(&args, 0, "level")?
                };
                self.blocking(move |inner| inner.calibrate_photodiode(level))
                    .await?;
                Ok(Value::from(level))
            }
            "isAwake" => {
                let awake = self.blocking(|inner| inner.is_awake()).await?;
                Ok(Value::from(awake))
            }
            "dispatchMessages" => {
                let count = self
                    .blocking(|inner| inner.dispatch_messages(inner.options.dispatch_timeout))
                    .await?;
                Ok(Value::from(count))
            }
            "getMessages" => {
                let messages = self
                    .messages()
                    .into_iter()
                    .map(|m| {
                        let mut entry = Metadata::new();
                        entry.insert("t".to_string(), Value::from(m.t));
                        entry.insert("line".to_string(), Value::from(m.line));
                        Value::Object(entry)
                    })
                    .collect::<Vec<_>>();
                Ok(Value::Array(messages))
            }
            "startPolling" => Ok(Value::from(self.start_polling()?)),
            "stopPolling" => {
                let this = self.clone();
                let stopped = self.blocking(move |_| Ok(this.stop_polling())).await?;
                Ok(Value::from(stopped))
            }
            other => Err(DeviceError::NotSupported(format!(
                "Command {} not supported by TPad",
                other
            ))),
        }
    }

    async fn shutdown(&self) -> Result<()> {
        let this = self.clone();
        self.blocking(move |_| Ok(this.stop_polling())).await?;
        self.clear_listeners();
        info!(port = %self.inner.port, "TPad shut down");
        Ok(())
    }
}
