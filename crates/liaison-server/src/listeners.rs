/*!
 * Fan-out of device responses to subscribed connections.
 *
 * Every open connection owns a bounded outbound queue. Devices report
 * responses through a [`DeviceListener`]; the hub serializes one
 * notification per response and offers it to each subscribed queue without
 * blocking. A full queue drops the new notification.
 */
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use liaison_core::types::Id;
use liaison_devices::{Response, ResponseListener};

use crate::error::{Result, ServerError};
use crate::protocol::EventNotification;

/// Identifies one open connection
pub type ConnectionId = Id;

/// Connection reference meaning "every open connection"
pub const ALL_CONNECTIONS: &str = "liaison";

/// Connection reference meaning "the calling connection"
pub const CALLER: &str = "self";

/// Who receives notifications for a device
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Subscriber {
    /// Every open connection, including ones opened later
    All,
    /// One connection
    Connection(ConnectionId),
}

impl Subscriber {
    /// Resolve a connection reference as sent by remote callers
    pub fn parse(reference: &str, caller: &ConnectionId) -> Self {
        match reference {
            ALL_CONNECTIONS => Subscriber::All,
            CALLER | "" => Subscriber::Connection(caller.clone()),
            other => Subscriber::Connection(ConnectionId::from(other)),
        }
    }
}

/// Routes device responses to connection queues
pub struct ListenerHub {
    capacity: usize,
    connections: RwLock<HashMap<ConnectionId, mpsc::Sender<String>>>,
    subscriptions: RwLock<HashMap<String, HashSet<Subscriber>>>,
    attached: Mutex<HashSet<String>>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

fn lock_error(what: &str) -> ServerError {
    ServerError::Invocation(format!("Failed to acquire {} lock", what))
}

impl ListenerHub {
    /// Create a hub whose connection queues hold `capacity` notifications
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            connections: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
            attached: Mutex::new(HashSet::new()),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Queue capacity of each connection
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Open a connection and return its outbound queue
    pub fn open_connection(&self) -> Result<(ConnectionId, mpsc::Receiver<String>)> {
        let id = ConnectionId::new();
        let (sender, receiver) = mpsc::channel(self.capacity);
        self.connections
            .write()
            .map_err(|_| lock_error("connections"))?
            .insert(id.clone(), sender);
        debug!(connection = %id, "Connection opened");
        Ok((id, receiver))
    }

    /// Close a connection and drop its subscriptions
    pub fn close_connection(&self, id: &ConnectionId) {
        let removed = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .is_some();
        let subscriber = Subscriber::Connection(id.clone());
        let mut subscriptions = self
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        for subscribers in subscriptions.values_mut() {
            subscribers.remove(&subscriber);
        }
        subscriptions.retain(|_, subscribers| !subscribers.is_empty());
        if removed {
            debug!(connection = %id, "Connection closed");
        }
    }

    /// Whether a connection is open
    pub fn is_open(&self, id: &ConnectionId) -> bool {
        self.connections
            .read()
            .map(|connections| connections.contains_key(id))
            .unwrap_or(false)
    }

    /// Number of open connections
    pub fn connection_count(&self) -> usize {
        self.connections.read().map(|c| c.len()).unwrap_or(0)
    }

    /// Turn notifications for `device` on or off for a subscriber
    pub fn set_listening(&self, device: &str, subscriber: Subscriber, enabled: bool) -> Result<()> {
        if enabled {
            if let Subscriber::Connection(id) = &subscriber {
                if !self.is_open(id) {
                    return Err(ServerError::UnknownConnection(id.to_string()));
                }
            }
        }

        let mut subscriptions = self
            .subscriptions
            .write()
            .map_err(|_| lock_error("subscriptions"))?;
        if enabled {
            subscriptions
                .entry(device.to_string())
                .or_default()
                .insert(subscriber.clone());
        } else if let Some(subscribers) = subscriptions.get_mut(device) {
            subscribers.remove(&subscriber);
            if subscribers.is_empty() {
                subscriptions.remove(device);
            }
        }
        debug!(device, ?subscriber, enabled, "Listener updated");
        Ok(())
    }

    /// Subscribers of `device`
    pub fn subscribers(&self, device: &str) -> Vec<Subscriber> {
        self.subscriptions
            .read()
            .ok()
            .and_then(|subscriptions| {
                subscriptions
                    .get(device)
                    .map(|set| set.iter().cloned().collect())
            })
            .unwrap_or_default()
    }

    /// Record that the hub's listener is installed on `device`.
    ///
    /// Returns `false` if it already was.
    pub fn mark_attached(&self, device: &str) -> bool {
        self.attached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(device.to_string())
    }

    /// Forget a device's listener and subscriptions
    pub fn forget_device(&self, device: &str) {
        self.attached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(device);
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(device);
    }

    /// Listener to install on `device`
    pub fn listener_for(self: &Arc<Self>, device: &str) -> Arc<dyn ResponseListener> {
        Arc::new(DeviceListener {
            device: device.to_string(),
            hub: Arc::downgrade(self),
        })
    }

    fn targets(&self, device: &str) -> Vec<(ConnectionId, mpsc::Sender<String>)> {
        let subscriptions = self
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let subscribers = match subscriptions.get(device) {
            Some(subscribers) if !subscribers.is_empty() => subscribers,
            _ => return Vec::new(),
        };
        let connections = self
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        if subscribers.contains(&Subscriber::All) {
            return connections
                .iter()
                .map(|(id, sender)| (id.clone(), sender.clone()))
                .collect();
        }
        subscribers
            .iter()
            .filter_map(|subscriber| match subscriber {
                Subscriber::Connection(id) => {
                    connections.get(id).map(|sender| (id.clone(), sender.clone()))
                }
                Subscriber::All => None,
            })
            .collect()
    }

    /// Offer a notification for `response` to every subscriber of `device`.
    ///
    /// Returns the number of queues that accepted it.
    pub fn publish(&self, device: &str, response: &Response) -> usize {
        let targets = self.targets(device);
        if targets.is_empty() {
            return 0;
        }

        let text = match EventNotification::new(device, response).to_json() {
            Ok(text) => text,
            Err(err) => {
                warn!(device, "Failed to encode notification: {}", err);
                return 0;
            }
        };

        let mut accepted = 0;
        let mut closed = Vec::new();
        for (id, sender) in targets {
            match sender.try_send(text.clone()) {
                Ok(()) => {
                    accepted += 1;
                    trace!(device, connection = %id, "Notification queued");
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(device, connection = %id, "Outbound queue full, notification dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(id),
            }
        }
        self.delivered.fetch_add(accepted as u64, Ordering::Relaxed);

        for id in closed {
            self.close_connection(&id);
        }
        accepted
    }

    /// Notifications accepted by connection queues so far
    pub fn delivered_count(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Notifications dropped on full queues so far
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for ListenerHub {
    fn default() -> Self {
        Self::new(64)
    }
}

impl fmt::Debug for ListenerHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerHub")
            .field("capacity", &self.capacity)
            .field("connections", &self.connection_count())
            .field("delivered", &self.delivered_count())
            .field("dropped", &self.dropped_count())
            .finish()
    }
}

/// Installed on a device; forwards its responses to the hub
pub struct DeviceListener {
    device: String,
    hub: Weak<ListenerHub>,
}

impl ResponseListener for DeviceListener {
    fn on_response(&self, response: &Response) {
        if let Some(hub) = self.hub.upgrade() {
            hub.publish(&self.device, response);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use liaison_devices::ResponseClass;

    fn press(t: f64) -> Response {
        Response {
            class: ResponseClass::Button,
            t,
            value: true,
            threshold: None,
            channel: 'A',
            code: '1',
        }
    }

    #[test]
    fn test_no_subscribers_nothing_queued() {
        let hub = ListenerHub::new(4);
        let (_id, mut rx) = hub.open_connection().unwrap();

        assert_eq!(hub.publish("pad", &press(1.0)), 0);
        assert!(rx.try_recv().is_err());
        assert_eq!(hub.delivered_count(), 0);
    }

    #[test]
    fn test_one_notification_per_response() {
        let hub = Arc::new(ListenerHub::new(4));
        let (a, mut rx_a) = hub.open_connection().unwrap();
        let (_b, mut rx_b) = hub.open_connection().unwrap();
        tokio_test::assert_ok!(hub.set_listening("pad", Subscriber::Connection(a.clone()), true));

        let listener = hub.listener_for("pad");
        listener.on_response(&press(1.5));

        let text = rx_a.try_recv().unwrap();
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["type"], "hardware_response");
        assert_eq!(json["class"], "ButtonResponse");
        assert_eq!(json["device"], "pad");
        assert_eq!(json["data"]["t"], 1.5);
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_err(), "not subscribed");

        // Other devices do not reach this connection
        hub.listener_for("other").on_response(&press(2.0));
        assert!(rx_a.try_recv().is_err());

        tokio_test::assert_ok!(hub.set_listening("pad", Subscriber::Connection(a), false));
        listener.on_response(&press(3.0));
        assert!(rx_a.try_recv().is_err());
    }

    #[test]
    fn test_all_connections() {
        let hub = ListenerHub::new(4);
        let caller = ConnectionId::from("caller");
        assert_eq!(Subscriber::parse("liaison", &caller), Subscriber::All);
        assert_eq!(
            Subscriber::parse("self", &caller),
            Subscriber::Connection(caller.clone())
        );

        hub.set_listening("pad", Subscriber::All, true).unwrap();
        let (_a, mut rx_a) = hub.open_connection().unwrap();
        let (_b, mut rx_b) = hub.open_connection().unwrap();

        assert_eq!(hub.publish("pad", &press(1.0)), 2);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
    }

    #[test]
    fn test_full_queue_drops_newest() {
        let hub = ListenerHub::new(2);
        let (id, mut rx) = hub.open_connection().unwrap();
        hub.set_listening("pad", Subscriber::Connection(id), true)
            .unwrap();

        for i in 0..5 {
            hub.publish("pad", &press(f64::from(i)));
        }

        assert_eq!(hub.delivered_count(), 2);
        assert_eq!(hub.dropped_count(), 3);
        let first: serde_json::Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(first["data"]["t"], 0.0);
        let second: serde_json::Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(second["data"]["t"], 1.0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_closed_connections_pruned() {
        let hub = ListenerHub::new(2);
        let (id, rx) = hub.open_connection().unwrap();
        hub.set_listening("pad", Subscriber::Connection(id.clone()), true)
            .unwrap();
        drop(rx);

        assert_eq!(hub.publish("pad", &press(1.0)), 0);
        assert!(!hub.is_open(&id));
        assert!(hub.subscribers("pad").is_empty());
    }

    #[test]
    fn test_unknown_connection_rejected() {
        let hub = ListenerHub::new(2);
        let err = hub
            .set_listening("pad", Subscriber::Connection(ConnectionId::from("ghost")), true)
            .unwrap_err();
        assert!(matches!(err, ServerError::UnknownConnection(_)));
        // Disabling an unknown subscription is a no-op
        hub.set_listening("pad", Subscriber::Connection(ConnectionId::from("ghost")), false)
            .unwrap();
    }

    #[test]
    fn test_attach_once() {
        let hub = ListenerHub::new(2);
        assert!(hub.mark_attached("pad"));
        assert!(!hub.mark_attached("pad"));
        hub.forget_device("pad");
        assert!(hub.mark_attached("pad"));
    }

    #[test]
    fn test_listener_outliving_hub() {
        let hub = Arc::new(ListenerHub::new(2));
        let listener = hub.listener_for("pad");
        drop(hub);
        listener.on_response(&press(1.0));
    }
}
