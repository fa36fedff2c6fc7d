//! TPad line grammar.
//!
//! Streaming mode emits one line per input event:
//! `<channel> <P|R> <code> <milliseconds>`, e.g. `C P 1 500`. The separating
//! spaces are optional, so the packed form `CP1500` is accepted too.

use std::fmt;
use std::iter::Peekable;
use std::str::Chars;

use serde::Serialize;

/// Input channel a message belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Channel {
    /// `A`: push buttons
    Buttons,
    /// `C`: photodiodes
    Optos,
    /// `M`: voice key
    VoiceKey,
    /// `T`: TTL input lines
    TtlIn,
}

impl Channel {
    /// Parse a channel letter
    pub fn from_code(code: char) -> Option<Self> {
        match code {
            'A' => Some(Channel::Buttons),
            'C' => Some(Channel::Optos),
            'M' => Some(Channel::VoiceKey),
            'T' => Some(Channel::TtlIn),
            _ => None,
        }
    }

    /// The channel letter
    pub fn code(&self) -> char {
        match self {
            Channel::Buttons => 'A',
            Channel::Optos => 'C',
            Channel::VoiceKey => 'M',
            Channel::TtlIn => 'T',
        }
    }
}

/// One parsed streaming line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Source channel
    pub channel: Channel,
    /// Press/onset (`P`) or release/offset (`R`)
    pub pressed: bool,
    /// Input code: `0-9`, `[` or `]`
    pub code: char,
    /// Device time since the last reset, in milliseconds
    pub raw_time_ms: u64,
}

fn is_code(c: char) -> bool {
    c.is_ascii_digit() || c == '[' || c == ']'
}

fn skip_space(chars: &mut Peekable<Chars<'_>>) {
    if chars.peek() == Some(&' ') {
        chars.next();
    }
}

impl Message {
    /// Parse a line, or `None` if it does not follow the grammar
    pub fn parse(line: &str) -> Option<Self> {
        let mut chars = line.trim_end().chars().peekable();

        let channel = Channel::from_code(chars.next()?)?;
        skip_space(&mut chars);
        let pressed = match chars.next()? {
            'P' => true,
            'R' => false,
            _ => return None,
        };
        skip_space(&mut chars);
        let code = chars.next().filter(|c| is_code(*c))?;
        skip_space(&mut chars);

        let digits: String = chars.collect();
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let raw_time_ms = digits.parse().ok()?;

        Some(Self {
            channel,
            pressed,
            code,
            raw_time_ms,
        })
    }

    /// Input number the code addresses.
    ///
    /// Digits map to themselves except `0`, which is input 10. The photodiode
    /// codes `[` and `]` are inputs 1 and 2.
    pub fn number(&self) -> Option<u8> {
        match self.code {
            '0' => Some(10),
            '1'..='9' => self.code.to_digit(10).map(|d| d as u8),
            '[' => Some(1),
            ']' => Some(2),
            _ => None,
        }
    }

    /// Host time of the event given the host time of the last reset
    pub fn timestamp(&self, epoch: f64) -> f64 {
        epoch + self.raw_time_ms as f64 / 1000.0
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {}",
            self.channel.code(),
            if self.pressed { 'P' } else { 'R' },
            self.code,
            self.raw_time_ms
        )
    }
}

/// A raw line kept in the driver history
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawMessage {
    /// Host time of the event
    pub t: f64,
    /// The line as received
    pub line: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_spaced() {
        let message = Message::parse("C P 1 500").unwrap();
        assert_eq!(message.channel, Channel::Optos);
        assert!(message.pressed);
        assert_eq!(message.code, '1');
        assert_eq!(message.raw_time_ms, 500);
        assert_eq!(message.number(), Some(1));
    }

    #[test]
    fn test_parse_packed_and_trailing_whitespace() {
        let message = Message::parse("AR012\r").unwrap();
        assert_eq!(message.channel, Channel::Buttons);
        assert!(!message.pressed);
        assert_eq!(message.number(), Some(10));
        assert_eq!(message.raw_time_ms, 12);
        assert_eq!(message.to_string(), "A R 0 12");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for line in [
            "",
            "Z Q 9 abc",
            "C P 1",
            "C P 1 ",
            "C X 1 500",
            "C P a 500",
            "C P 1 5x0",
            "C  P 1 500",
            "c p 1 500",
        ] {
            assert_eq!(Message::parse(line), None, "{:?} should be rejected", line);
        }
    }

    #[test]
    fn test_bracket_codes() {
        assert_eq!(Message::parse("C P [ 1").unwrap().number(), Some(1));
        assert_eq!(Message::parse("C R ] 1").unwrap().number(), Some(2));
    }

    #[test]
    fn test_timestamp() {
        let message = Message::parse("M P 1 1500").unwrap();
        assert_eq!(message.channel, Channel::VoiceKey);
        assert_eq!(message.timestamp(100.0), 101.5);
    }
}
