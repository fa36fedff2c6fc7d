/*!
 * Liaison Server
 *
 * A WebSocket server through which a remote controller invokes methods on
 * named server-side objects and receives hardware response notifications
 * for the devices it listens to.
 */

#![warn(missing_docs)]

pub mod error;
pub mod listeners;
pub mod manager;
pub mod protocol;
pub mod remote;
pub mod server;

pub use error::{Result, ServerError};
pub use listeners::{ConnectionId, ListenerHub, Subscriber};
pub use manager::{DeviceManager, DEVICE_MANAGER};
pub use protocol::{ErrorPayload, EventNotification, RpcRequest};
pub use remote::{Args, CallContext, ClassFactory, ObjectRegistry, RemoteObject};
pub use server::LiaisonServer;

/// Liaison server crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
