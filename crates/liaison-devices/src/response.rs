/*!
 * Timestamped responses and the per-input response log.
 */
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use serde::Serialize;

/// The kind of input a response came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ResponseClass {
    /// A push button
    Button,
    /// A photodiode (opto) sensor
    Photodiode,
    /// A voice key
    Voicekey,
}

impl ResponseClass {
    /// Class name carried in event notifications
    pub fn name(&self) -> &'static str {
        match self {
            ResponseClass::Button => "ButtonResponse",
            ResponseClass::Photodiode => "PhotodiodeResponse",
            ResponseClass::Voicekey => "VoicekeyResponse",
        }
    }
}

impl fmt::Display for ResponseClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single timestamped state change reported by a physical input
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    /// Which kind of input produced the response
    #[serde(skip)]
    pub class: ResponseClass,
    /// Seconds on the host clock
    pub t: f64,
    /// `true` on press/onset, `false` on release/offset
    pub value: bool,
    /// Photodiode threshold in force when the response was parsed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<u8>,
    /// Channel letter from the wire
    pub channel: char,
    /// Input code from the wire
    pub code: char,
}

/// Observer of responses.
///
/// Called on the thread that delivered the response while the log is locked,
/// so implementations must not block.
pub trait ResponseListener: Send + Sync {
    /// Handle one response
    fn on_response(&self, response: &Response);
}

/// Append-only response history with listener fan-out.
///
/// Appending and notifying happen under one lock, so listeners observe
/// responses in append order and no response is seen twice.
#[derive(Default)]
pub struct ResponseLog {
    entries: Mutex<Vec<Response>>,
    listeners: RwLock<Vec<Arc<dyn ResponseListener>>>,
}

// Entries are only ever appended, so a poisoned lock still guards valid data.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ResponseLog {
    /// Create an empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a response and notify every listener.
    ///
    /// Returns the new length of the log.
    pub fn push(&self, response: Response) -> usize {
        let mut entries = lock(&self.entries);
        entries.push(response);
        let listeners = self.listeners.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(latest) = entries.last() {
            for listener in listeners.iter() {
                listener.on_response(latest);
            }
        }
        entries.len()
    }

    /// The most recent response
    pub fn last(&self) -> Option<Response> {
        lock(&self.entries).last().cloned()
    }

    /// Copy of the whole history
    pub fn snapshot(&self) -> Vec<Response> {
        lock(&self.entries).clone()
    }

    /// Number of responses received so far
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    /// Check if no response has been received yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register a listener for future responses
    pub fn add_listener(&self, listener: Arc<dyn ResponseListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Remove all listeners
    pub fn clear_listeners(&self) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl fmt::Debug for ResponseLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseLog")
            .field("len", &self.len())
            .field("listeners", &self.listener_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Response>>,
    }

    impl ResponseListener for Recorder {
        fn on_response(&self, response: &Response) {
            self.seen.lock().unwrap().push(response.clone());
        }
    }

    fn response(t: f64, value: bool) -> Response {
        Response {
            class: ResponseClass::Button,
            t,
            value,
            threshold: None,
            channel: 'A',
            code: '1',
        }
    }

    #[test]
    fn test_push_notifies_each_listener_once() {
        let log = ResponseLog::new();
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        log.add_listener(first.clone());
        log.add_listener(second.clone());

        assert_eq!(log.push(response(1.0, true)), 1);
        assert_eq!(log.push(response(2.0, false)), 2);

        assert_eq!(first.seen.lock().unwrap().len(), 2);
        assert_eq!(*second.seen.lock().unwrap(), log.snapshot());
        assert_eq!(log.last().unwrap().t, 2.0);
    }

    #[test]
    fn test_clear_listeners() {
        let log = ResponseLog::new();
        let recorder = Arc::new(Recorder::default());
        log.add_listener(recorder.clone());
        log.clear_listeners();
        log.push(response(1.0, true));

        assert!(recorder.seen.lock().unwrap().is_empty());
        assert_eq!(log.len(), 1);
        assert_eq!(log.listener_count(), 0);
    }

    #[test]
    fn test_response_serialization() {
        let mut r = response(0.5, true);
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["t"], 0.5);
        assert_eq!(json["channel"], "A");
        assert!(json.get("threshold").is_none());
        assert!(json.get("class").is_none());

        r.threshold = Some(127);
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["threshold"], 127);
    }

    #[test]
    fn test_class_names() {
        assert_eq!(ResponseClass::Button.name(), "ButtonResponse");
        assert_eq!(ResponseClass::Photodiode.to_string(), "PhotodiodeResponse");
        assert_eq!(ResponseClass::Voicekey.name(), "VoicekeyResponse");
    }
}
