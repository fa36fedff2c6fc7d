/*!
 * Line-oriented serial transports.
 *
 * Response boxes talk newline-terminated ASCII. A transport sends one command
 * per line and hands back whatever complete lines arrived within a timeout.
 */
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::{self, Debug};
use std::io::{self, ErrorKind};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tracing::trace;

use crate::device::{DeviceError, Result};

/// Default baud rate of the TPad response box
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Parity checking on a serial line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    /// No parity bit
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
}

impl Parity {
    /// Parse the one-letter code used in device specs (`N`, `O`, `E`)
    pub fn from_code(code: &str) -> Result<Self> {
        match code.trim().to_ascii_uppercase().as_str() {
            "N" | "NONE" => Ok(Parity::None),
            "O" | "ODD" => Ok(Parity::Odd),
            "E" | "EVEN" => Ok(Parity::Even),
            other => Err(DeviceError::InvalidValue(format!(
                "parity must be N, O or E, got {}",
                other
            ))),
        }
    }

    /// One-letter code
    pub fn code(&self) -> &'static str {
        match self {
            Parity::None => "N",
            Parity::Odd => "O",
            Parity::Even => "E",
        }
    }
}

/// Line settings used when opening a port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialSettings {
    /// Bits per second
    pub baud_rate: u32,
    /// Data bits per character, 5 to 8
    pub data_bits: u8,
    /// Stop bits, 1 or 2
    pub stop_bits: u8,
    /// Parity checking
    pub parity: Parity,
}

impl SerialSettings {
    /// 8N1 at `baud_rate`
    pub fn new(baud_rate: u32) -> Self {
        Self {
            baud_rate,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
        }
    }

    /// Reject settings no UART accepts
    pub fn validate(&self) -> Result<()> {
        if self.baud_rate == 0 {
            return Err(DeviceError::InvalidValue("baudrate must be positive".to_string()));
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(DeviceError::InvalidValue(format!(
                "byteSize must be 5-8, got {}",
                self.data_bits
            )));
        }
        if !(1..=2).contains(&self.stop_bits) {
            return Err(DeviceError::InvalidValue(format!(
                "stopBits must be 1 or 2, got {}",
                self.stop_bits
            )));
        }
        Ok(())
    }
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self::new(DEFAULT_BAUD_RATE)
    }
}

impl fmt::Display for SerialSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}{}{}",
            self.baud_rate,
            self.data_bits,
            self.parity.code(),
            self.stop_bits
        )
    }
}

/// A bidirectional, line-oriented serial link
pub trait SerialTransport: Send + Debug {
    /// Name of the underlying port
    fn port_name(&self) -> &str;

    /// Send one command, terminated by a newline
    fn send_message(&mut self, message: &str) -> Result<()>;

    /// Collect complete lines, waiting at most `timeout` for the first one.
    ///
    /// Returns an empty vector when nothing arrived in time.
    fn read_lines(&mut self, timeout: Duration) -> Result<Vec<String>>;
}

/// Splits a byte stream into text lines
#[derive(Debug, Default)]
pub struct LineBuffer {
    buffer: BytesMut,
}

impl LineBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Remove and return every complete line, without terminators.
    ///
    /// Blank lines are skipped and a trailing `\r` is stripped.
    pub fn take_lines(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw = self.buffer.split_to(pos + 1);
            let text = String::from_utf8_lossy(&raw[..pos]);
            let text = text.trim_end_matches('\r');
            if !text.is_empty() {
                lines.push(text.to_string());
            }
        }
        lines
    }

    /// Bytes held back waiting for a terminator
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Raw byte access to a port, as used by [`collect_lines`]
#[cfg_attr(not(any(feature = "serial", test)), allow(dead_code))]
pub(crate) trait ByteSource {
    /// Bytes received and not read yet
    fn bytes_waiting(&mut self) -> io::Result<usize>;

    /// Read into `buf`, blocking at most `timeout`
    fn read_within(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;
}

/// Read complete lines from `source` for at most `timeout`.
///
/// Returns early once lines are in hand and the input is idle. At the
/// deadline only what is already waiting is taken, so a device that never
/// stops sending cannot hold the reader past `timeout`.
#[cfg_attr(not(any(feature = "serial", test)), allow(dead_code))]
pub(crate) fn collect_lines<S: ByteSource>(
    source: &mut S,
    buffer: &mut LineBuffer,
    timeout: Duration,
) -> io::Result<Vec<String>> {
    let deadline = Instant::now() + timeout;
    let mut lines = Vec::new();
    let mut chunk = [0u8; 256];
    loop {
        lines.extend(buffer.take_lines());
        let waiting = source.bytes_waiting()?;
        let now = Instant::now();
        if now >= deadline {
            if waiting > 0 {
                let len = waiting.min(chunk.len());
                match source.read_within(&mut chunk[..len], Duration::from_millis(1)) {
                    Ok(n) => buffer.extend(&chunk[..n]),
                    Err(e) if e.kind() == ErrorKind::TimedOut => {}
                    Err(e) => return Err(e),
                }
            }
            break;
        }
        if !lines.is_empty() && waiting == 0 {
            break;
        }
        match source.read_within(&mut chunk, deadline - now) {
            Ok(0) => break,
            Ok(n) => buffer.extend(&chunk[..n]),
            Err(e) if e.kind() == ErrorKind::TimedOut => break,
            Err(e) => return Err(e),
        }
    }
    lines.extend(buffer.take_lines());
    Ok(lines)
}

#[derive(Debug, Default)]
struct LoopbackState {
    sent: Vec<String>,
    incoming: LineBuffer,
    ready: VecDeque<String>,
    failures: HashSet<String>,
    replies: HashMap<String, Vec<String>>,
}

#[derive(Debug, Default)]
struct LoopbackShared {
    state: Mutex<LoopbackState>,
    arrived: Condvar,
}

/// In-memory transport standing in for a real port.
///
/// Clones share one link: the device side owns one clone while a test or
/// simulator feeds lines through another.
#[derive(Debug, Clone)]
pub struct LoopbackTransport {
    port_name: String,
    shared: Arc<LoopbackShared>,
}

impl LoopbackTransport {
    /// Create a loopback link with the given port name
    pub fn new<S: Into<String>>(port_name: S) -> Self {
        Self {
            port_name: port_name.into(),
            shared: Arc::new(LoopbackShared::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, LoopbackState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Queue one line as if the device had sent it
    pub fn push_line<S: AsRef<str>>(&self, line: S) {
        self.push_bytes(format!("{}\n", line.as_ref()).as_bytes());
    }

    /// Queue raw bytes as if the device had sent them
    pub fn push_bytes(&self, bytes: &[u8]) {
        let mut state = self.state();
        state.incoming.extend(bytes);
        let lines = state.incoming.take_lines();
        if !lines.is_empty() {
            state.ready.extend(lines);
            self.shared.arrived.notify_all();
        }
    }

    /// Make every future send of `command` fail
    pub fn fail_on<S: Into<String>>(&self, command: S) {
        self.state().failures.insert(command.into());
    }

    /// Answer `command` with `lines` whenever it is sent
    pub fn reply_to<S: Into<String>>(&self, command: S, lines: Vec<String>) {
        self.state().replies.insert(command.into(), lines);
    }

    /// Commands sent so far
    pub fn sent(&self) -> Vec<String> {
        self.state().sent.clone()
    }

    /// Forget the record of sent commands
    pub fn clear_sent(&self) {
        self.state().sent.clear();
    }

    /// Lines queued but not read yet
    pub fn pending_lines(&self) -> usize {
        self.state().ready.len()
    }
}

impl SerialTransport for LoopbackTransport {
    fn port_name(&self) -> &str {
        &self.port_name
    }

    fn send_message(&mut self, message: &str) -> Result<()> {
        let mut state = self.state();
        if state.failures.contains(message) {
            return Err(DeviceError::CommunicationError(format!(
                "Write of {:?} to {} failed",
                message, self.port_name
            )));
        }
        trace!(port = %self.port_name, message, "loopback send");
        state.sent.push(message.to_string());
        if let Some(reply) = state.replies.get(message).cloned() {
            state.ready.extend(reply);
            self.shared.arrived.notify_all();
        }
        Ok(())
    }

    fn read_lines(&mut self, timeout: Duration) -> Result<Vec<String>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state();
        while state.ready.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            state = self
                .shared
                .arrived
                .wait_timeout(state, deadline - now)
                .map(|(guard, _)| guard)
                .map_err(|_| DeviceError::Other("Loopback lock poisoned".to_string()))?;
        }
        Ok(state.ready.drain(..).collect())
    }
}

/// A set of loopback links keyed by port name
#[derive(Debug, Clone, Default)]
pub struct LoopbackBus {
    links: Arc<Mutex<HashMap<String, LoopbackTransport>>>,
}

impl LoopbackBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// The link for `port_name`, created on first use
    pub fn link(&self, port_name: &str) -> LoopbackTransport {
        let mut links = self
            .links
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        links
            .entry(port_name.to_string())
            .or_insert_with(|| LoopbackTransport::new(port_name))
            .clone()
    }

    /// Names of the links opened so far
    pub fn ports(&self) -> Vec<String> {
        let links = self
            .links
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut ports: Vec<_> = links.keys().cloned().collect();
        ports.sort();
        ports
    }
}

#[cfg(feature = "serial")]
pub use self::hardware::SerialPortTransport;

#[cfg(feature = "serial")]
mod hardware {
    use std::io::{self, Read, Write};
    use std::time::Duration;

    use serialport::{DataBits, SerialPort, StopBits};
    use tracing::{debug, trace};

    use super::{collect_lines, ByteSource, LineBuffer, Parity, SerialSettings, SerialTransport};
    use crate::device::{DeviceError, Result};

    /// Transport over an operating system serial port
    pub struct SerialPortTransport {
        port_name: String,
        port: Box<dyn SerialPort>,
        buffer: LineBuffer,
    }

    impl SerialPortTransport {
        /// Open `port_name` with the given line settings
        pub fn open(port_name: &str, settings: &SerialSettings) -> Result<Self> {
            settings.validate()?;
            let data_bits = match settings.data_bits {
                5 => DataBits::Five,
                6 => DataBits::Six,
                7 => DataBits::Seven,
                _ => DataBits::Eight,
            };
            let stop_bits = match settings.stop_bits {
                2 => StopBits::Two,
                _ => StopBits::One,
            };
            let parity = match settings.parity {
                Parity::None => serialport::Parity::None,
                Parity::Odd => serialport::Parity::Odd,
                Parity::Even => serialport::Parity::Even,
            };
            let port = serialport::new(port_name, settings.baud_rate)
                .data_bits(data_bits)
                .stop_bits(stop_bits)
                .parity(parity)
                .timeout(Duration::from_millis(10))
                .open()
                .map_err(|e| {
                    DeviceError::ConnectionError(format!("Failed to open {}: {}", port_name, e))
                })?;
            debug!(port = port_name, settings = %settings, "Opened serial port");
            Ok(Self {
                port_name: port_name.to_string(),
                port,
                buffer: LineBuffer::new(),
            })
        }

        fn comm_error(&self, e: impl std::fmt::Display) -> DeviceError {
            DeviceError::CommunicationError(format!("{}: {}", self.port_name, e))
        }
    }

    impl std::fmt::Debug for SerialPortTransport {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("SerialPortTransport")
                .field("port_name", &self.port_name)
                .field("pending", &self.buffer.pending())
                .finish()
        }
    }

    impl ByteSource for Box<dyn SerialPort> {
        fn bytes_waiting(&mut self) -> io::Result<usize> {
            let waiting = self.bytes_to_read().map_err(io::Error::from)?;
            Ok(waiting as usize)
        }

        fn read_within(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
            self.set_timeout(timeout.max(Duration::from_millis(1)))
                .map_err(io::Error::from)?;
            self.read(buf)
        }
    }

    impl SerialTransport for SerialPortTransport {
        fn port_name(&self) -> &str {
            &self.port_name
        }

        fn send_message(&mut self, message: &str) -> Result<()> {
            trace!(port = %self.port_name, message, "serial send");
            let line = format!("{}\n", message);
            self.port
                .write_all(line.as_bytes())
                .and_then(|_| self.port.flush())
                .map_err(|e| self.comm_error(e))
        }

        fn read_lines(&mut self, timeout: Duration) -> Result<Vec<String>> {
            collect_lines(&mut self.port, &mut self.buffer, timeout).map_err(|e| self.comm_error(e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_buffer_splits_partial_input() {
        let mut buffer = LineBuffer::new();
        buffer.extend(b"C P 1 5");
        assert!(buffer.take_lines().is_empty());
        assert_eq!(buffer.pending(), 7);

        buffer.extend(b"00\r\n\nA R 3 12\nM");
        assert_eq!(buffer.take_lines(), vec!["C P 1 500", "A R 3 12"]);
        assert_eq!(buffer.pending(), 1);
    }

    /// A port that always has another line waiting
    struct Chatty {
        reads: usize,
    }

    impl ByteSource for Chatty {
        fn bytes_waiting(&mut self) -> io::Result<usize> {
            Ok(64)
        }

        fn read_within(&mut self, buf: &mut [u8], _timeout: Duration) -> io::Result<usize> {
            std::thread::sleep(Duration::from_millis(1));
            self.reads += 1;
            let line = b"C P 1 100\n";
            let n = line.len().min(buf.len());
            buf[..n].copy_from_slice(&line[..n]);
            Ok(n)
        }
    }

    /// A port that never answers
    struct Silent;

    impl ByteSource for Silent {
        fn bytes_waiting(&mut self) -> io::Result<usize> {
            Ok(0)
        }

        fn read_within(&mut self, _buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
            std::thread::sleep(timeout);
            Err(io::Error::new(ErrorKind::TimedOut, "no data"))
        }
    }

    #[test]
    fn test_collect_lines_stops_at_deadline_while_streaming() {
        let mut source = Chatty { reads: 0 };
        let mut buffer = LineBuffer::new();
        let start = Instant::now();

        let lines = collect_lines(&mut source, &mut buffer, Duration::from_millis(30)).unwrap();

        assert!(start.elapsed() < Duration::from_millis(500));
        assert!(!lines.is_empty());
        assert!(lines.iter().all(|line| line == "C P 1 100"));
        assert_eq!(lines.len(), source.reads);
    }

    #[test]
    fn test_collect_lines_times_out_empty() {
        let mut buffer = LineBuffer::new();
        buffer.extend(b"A P");
        let lines = collect_lines(&mut Silent, &mut buffer, Duration::from_millis(10)).unwrap();
        assert!(lines.is_empty());
        assert_eq!(buffer.pending(), 3);
    }

    #[test]
    fn test_serial_settings() {
        let settings = SerialSettings::new(9600);
        assert_eq!(settings.to_string(), "9600 8N1");
        assert!(settings.validate().is_ok());
        assert_eq!(SerialSettings::default().baud_rate, DEFAULT_BAUD_RATE);

        assert_eq!(Parity::from_code("e").unwrap(), Parity::Even);
        assert!(matches!(Parity::from_code("X"), Err(DeviceError::InvalidValue(_))));

        let bad = SerialSettings {
            data_bits: 9,
            ..SerialSettings::new(9600)
        };
        assert!(bad.validate().is_err());
        let bad = SerialSettings {
            stop_bits: 0,
            ..SerialSettings::new(9600)
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_loopback_records_sent_commands() {
        let mut transport = LoopbackTransport::new("COM3");
        let observer = transport.clone();
        transport.send_message("MOD0").unwrap();
        transport.send_message("REST").unwrap();
        assert_eq!(observer.sent(), vec!["MOD0", "REST"]);
        assert_eq!(transport.port_name(), "COM3");
    }

    #[test]
    fn test_loopback_failure_injection() {
        let mut transport = LoopbackTransport::new("COM3");
        transport.fail_on("X");
        assert!(matches!(
            transport.send_message("X"),
            Err(DeviceError::CommunicationError(_))
        ));
        assert!(transport.sent().is_empty());
    }

    #[test]
    fn test_loopback_reply() {
        let mut transport = LoopbackTransport::new("COM3");
        transport.reply_to("HELP", vec!["TPad v1".to_string()]);
        transport.send_message("HELP").unwrap();
        let lines = transport.read_lines(Duration::ZERO).unwrap();
        assert_eq!(lines, vec!["TPad v1"]);
    }

    #[test]
    fn test_loopback_read_times_out_empty() {
        let mut transport = LoopbackTransport::new("COM3");
        let start = Instant::now();
        let lines = transport.read_lines(Duration::from_millis(20)).unwrap();
        assert!(lines.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_loopback_bus_shares_links_per_port() {
        let bus = LoopbackBus::new();
        let mut device_side = bus.link("COM3");
        bus.link("COM3").push_line("A P 1 1");
        bus.link("COM4");

        assert_eq!(device_side.read_lines(Duration::ZERO).unwrap(), vec!["A P 1 1"]);
        assert_eq!(bus.ports(), vec!["COM3", "COM4"]);
    }

    #[test]
    fn test_loopback_read_wakes_on_push() {
        let mut transport = LoopbackTransport::new("COM3");
        let feeder = transport.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            feeder.push_line("A P 1 10");
        });
        let lines = transport.read_lines(Duration::from_secs(2)).unwrap();
        handle.join().unwrap();
        assert_eq!(lines, vec!["A P 1 10"]);
        assert_eq!(transport.pending_lines(), 0);
    }
}
