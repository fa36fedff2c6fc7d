/*!
 * Host clock abstraction used to timestamp device responses.
 */
use std::fmt::Debug;
use std::sync::Mutex;

use liaison_core::utils::now_seconds;

/// Source of host time in seconds
pub trait Clock: Send + Sync + Debug {
    /// Current time in seconds
    fn now(&self) -> f64;
}

/// Wall clock backed by the system time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        now_seconds()
    }
}

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<f64>,
}

impl ManualClock {
    /// Create a clock reading `start`
    pub fn new(start: f64) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Jump to an absolute time
    pub fn set(&self, t: f64) {
        if let Ok(mut now) = self.now.lock() {
            *now = t;
        }
    }

    /// Move forward by `dt` seconds
    pub fn advance(&self, dt: f64) {
        if let Ok(mut now) = self.now.lock() {
            *now += dt;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        self.now.lock().map(|now| *now).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(10.0);
        assert_eq!(clock.now(), 10.0);
        clock.advance(0.25);
        assert_eq!(clock.now(), 10.25);
        clock.set(3.0);
        assert_eq!(clock.now(), 3.0);
    }

    #[test]
    fn test_system_clock_moves_forward() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
