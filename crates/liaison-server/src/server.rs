/*!
 * WebSocket RPC server.
 *
 * Each connection runs as its own task. Requests on a connection are handled
 * one at a time; replies and hardware notifications share a writer task so
 * notifications keep flowing while a call is in progress.
 */
use std::any::Any;
use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, info_span, warn, Instrument};

use liaison_core::config::ServerConfig;
use liaison_core::logging::operation_span;
use liaison_core::types::Value;
use liaison_core::utils::spawn_and_log;
use liaison_devices::SharedDeviceRegistry;

use crate::error::{Result, ServerError};
use crate::listeners::{ConnectionId, ListenerHub};
use crate::manager::{DeviceManager, DEVICE_MANAGER};
use crate::protocol::{encode_error, encode_result, RpcRequest};
use crate::remote::{CallContext, ClassFactory, ObjectRegistry, RemoteObject, Target};

struct ServerInner {
    objects: ObjectRegistry,
    hub: Arc<ListenerHub>,
    call_timeout: Duration,
    bind_address: String,
}

/// The Liaison server
#[derive(Clone)]
pub struct LiaisonServer {
    inner: Arc<ServerInner>,
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "method panicked".to_string()
    }
}

impl LiaisonServer {
    /// Create a server from its configuration section
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                objects: ObjectRegistry::new(),
                hub: Arc::new(ListenerHub::new(config.outbound_queue_capacity)),
                call_timeout: config.call_timeout(),
                bind_address: config.bind_address(),
            }),
        }
    }

    /// Expose `registry` as the `DeviceManager` object
    pub fn with_device_manager(self, registry: SharedDeviceRegistry) -> Result<Self> {
        self.register_class(DEVICE_MANAGER, DeviceManager::class(registry.clone()))?;
        self.register_object(DEVICE_MANAGER, Arc::new(DeviceManager::new(registry)))?;
        Ok(self)
    }

    /// Register a class; remote callers construct instances with `init`
    pub fn register_class<S: Into<String>>(&self, name: S, factory: ClassFactory) -> Result<()> {
        self.inner.objects.register_class(name, factory)
    }

    /// Register an object instance under `name`
    pub fn register_object<S: Into<String>>(
        &self,
        name: S,
        instance: Arc<dyn RemoteObject>,
    ) -> Result<usize> {
        self.inner.objects.register_object(name, instance)
    }

    /// Register an object instance with only `methods` callable remotely
    pub fn register_object_exposing<S: Into<String>>(
        &self,
        name: S,
        instance: Arc<dyn RemoteObject>,
        methods: &[&str],
    ) -> Result<usize> {
        self.inner
            .objects
            .register_object_exposing(name, instance, methods)
    }

    /// Registered remote objects
    pub fn objects(&self) -> &ObjectRegistry {
        &self.inner.objects
    }

    /// Subscription hub
    pub fn hub(&self) -> &Arc<ListenerHub> {
        &self.inner.hub
    }

    /// Address used by [`LiaisonServer::run`]
    pub fn bind_address(&self) -> &str {
        &self.inner.bind_address
    }

    /// Handle one raw request and produce the reply text
    pub async fn process_message(&self, connection: &ConnectionId, raw: &str) -> String {
        let reply = match self.dispatch(connection, raw).await {
            Ok(value) => encode_result(&value),
            Err(err) => Err(err),
        };
        match reply {
            Ok(text) => text,
            Err(err) => {
                warn!(connection = %connection, kind = err.kind(), "Request failed: {}", err);
                encode_error(&err)
            }
        }
    }

    /// Decode, resolve and invoke a request
    pub async fn dispatch(&self, connection: &ConnectionId, raw: &str) -> Result<Value> {
        let request = RpcRequest::decode(raw)?;
        debug!(
            connection = %connection,
            object = %request.object,
            method = %request.method,
            "Dispatching call"
        );

        match self.inner.objects.resolve(&request)? {
            Target::Construct(factory) => {
                let args = request.args;
                let instance = std::panic::catch_unwind(AssertUnwindSafe(|| factory(args)))
                    .map_err(|payload| ServerError::Invocation(panic_message(payload)))??;
                let index = self.register_object(request.object.clone(), instance)?;
                info!("Constructed {} instance {}", request.object, index);
                Ok(Value::from(index))
            }
            Target::Instance(instance) => {
                let span = operation_span(&request.method, &request.object);
                let ctx = CallContext {
                    connection: connection.clone(),
                    hub: self.inner.hub.clone(),
                };
                let method = request.method;
                let args = request.args;
                let call = async move { instance.invoke(&ctx, &method, args).await };
                self.guarded(call).instrument(span).await
            }
        }
    }

    async fn guarded<F>(&self, call: F) -> Result<Value>
    where
        F: Future<Output = Result<Value>>,
    {
        let timeout = self.inner.call_timeout;
        match tokio::time::timeout(timeout, AssertUnwindSafe(call).catch_unwind()).await {
            Ok(Ok(result)) => result,
            Ok(Err(payload)) => {
                let msg = panic_message(payload);
                error!("Remote method panicked: {}", msg);
                Err(ServerError::Invocation(msg))
            }
            Err(_) => Err(ServerError::Timeout(format!(
                "call did not finish within {} ms",
                timeout.as_millis()
            ))),
        }
    }

    /// Bind the configured address and serve until the listener fails
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(self.bind_address()).await?;
        self.serve(listener).await
    }

    /// Serve connections from `listener`
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        self.serve_with_shutdown(listener, std::future::pending())
            .await
    }

    /// Serve connections from `listener` until `shutdown` resolves
    pub async fn serve_with_shutdown<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!("Liaison listening on ws://{}", listener.local_addr()?);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    let server = self.clone();
                    spawn_and_log(&format!("connection {}", peer), async move {
                        server.handle_connection(stream, peer).await
                    });
                }
                _ = &mut shutdown => {
                    info!("Liaison shutting down");
                    break;
                }
            }
        }
        Ok(())
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (id, events) = self.inner.hub.open_connection()?;
        let span = info_span!("connection", %peer, id = %id);

        self.run_connection(ws_stream, &id, events)
            .instrument(span)
            .await
    }

    async fn run_connection(
        &self,
        ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
        id: &ConnectionId,
        mut events: mpsc::Receiver<String>,
    ) -> Result<()> {
        info!("New WebSocket connection");
        let (mut write, mut read) = ws_stream.split();
        let (reply_tx, mut replies) = mpsc::channel::<Message>(16);

        let writer = tokio::spawn(
            async move {
                loop {
                    let message = tokio::select! {
                        Some(message) = replies.recv() => message,
                        Some(text) = events.recv() => Message::Text(text),
                        else => break,
                    };
                    if let Err(e) = write.send(message).await {
                        debug!("Writer stopped: {}", e);
                        break;
                    }
                }
                let _ = write.close().await;
            }
            .in_current_span(),
        );

        while let Some(frame) = read.next().await {
            let reply = match frame {
                Ok(Message::Text(text)) => Message::Text(self.process_message(id, &text).await),
                Ok(Message::Binary(data)) => match String::from_utf8(data) {
                    Ok(text) => Message::Text(self.process_message(id, &text).await),
                    Err(_) => Message::Text(encode_error(&ServerError::MalformedRequest(
                        "binary frame is not UTF-8".to_string(),
                    ))),
                },
                Ok(Message::Ping(data)) => Message::Pong(data),
                Ok(Message::Close(_)) => {
                    info!("Client disconnected");
                    break;
                }
                Ok(_) => continue,
                Err(e) => {
                    warn!("WebSocket error: {}", e);
                    break;
                }
            };
            if reply_tx.send(reply).await.is_err() {
                break;
            }
        }

        drop(reply_tx);
        self.inner.hub.close_connection(id);
        if let Err(e) = writer.await {
            warn!("Writer task failed: {}", e);
        }
        Ok(())
    }
}

impl std::fmt::Debug for LiaisonServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiaisonServer")
            .field("objects", &self.inner.objects)
            .field("hub", &self.inner.hub)
            .field("call_timeout", &self.inner.call_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::remote::Args;

    struct EchoServer;

    #[async_trait]
    impl RemoteObject for EchoServer {
        fn class_name(&self) -> &str {
            "EchoServer"
        }

        fn methods(&self) -> &[&'static str] {
            &["echo", "echoArgs", "panic", "sleep", "fail"]
        }

        async fn invoke(&self, _ctx: &CallContext, method: &str, args: Vec<Value>) -> Result<Value> {
            match method {
                "echo" => Ok(Value::from(Args(&args).str(0, "text")?.to_string())),
                "echoArgs" => Ok(Value::Array(args)),
                "panic" => panic!("boom"),
                "sleep" => {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(Value::Null)
                }
                _ => Err(ServerError::Invocation("failed on purpose".to_string())),
            }
        }
    }

    fn server(call_timeout_ms: u64) -> LiaisonServer {
        let config = ServerConfig {
            call_timeout_ms,
            ..ServerConfig::default()
        };
        let server = LiaisonServer::new(&config);
        server
            .register_object("EchoServer", Arc::new(EchoServer))
            .unwrap();
        server
    }

    fn error_of(reply: &str) -> serde_json::Value {
        let json: serde_json::Value = serde_json::from_str(reply).unwrap();
        assert_eq!(json["type"], "error", "{}", reply);
        json
    }

    #[tokio::test]
    async fn test_echo() {
        let server = server(1_000);
        let conn = ConnectionId::new();
        let reply = server
            .process_message(&conn, r#"{"object":"EchoServer","method":"echo","args":["hi"]}"#)
            .await;
        assert_eq!(reply, r#""hi""#);
    }

    #[tokio::test]
    async fn test_args_round_trip_unchanged() {
        let server = server(1_000);
        let conn = ConnectionId::new();
        let args = serde_json::json!(["text", 42, -7, 2.5, true, false, null, ""]);
        let request = serde_json::json!({
            "object": "EchoServer",
            "method": "echoArgs",
            "args": args,
        });

        let reply = server.process_message(&conn, &request.to_string()).await;
        let reply: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(reply, args);

        let reply = server
            .process_message(&conn, r#"{"object":"EchoServer","method":"echoArgs","args":[]}"#)
            .await;
        assert_eq!(reply, "[]");
    }

    #[tokio::test]
    async fn test_lookup_errors_change_nothing() {
        let server = server(1_000);
        let conn = ConnectionId::new();

        let reply = server
            .process_message(&conn, r#"{"object":"Nope","method":"echo","args":[]}"#)
            .await;
        assert_eq!(error_of(&reply)["error"], "UnknownObject");
        let reply = server
            .process_message(&conn, r#"{"object":"EchoServer","method":"shout"}"#)
            .await;
        assert_eq!(error_of(&reply)["error"], "UnknownMethod");
        let reply = server.process_message(&conn, "{").await;
        assert_eq!(error_of(&reply)["error"], "MalformedRequest");

        assert_eq!(server.objects().names(), vec!["EchoServer"]);
        assert_eq!(server.objects().instance_count("EchoServer"), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_panic_becomes_error() {
        let server = server(1_000);
        let conn = ConnectionId::new();
        let reply = server
            .process_message(&conn, r#"{"object":"EchoServer","method":"panic"}"#)
            .await;
        let json = error_of(&reply);
        assert_eq!(json["error"], "Invocation");
        assert!(json["msg"].as_str().unwrap().contains("boom"));

        // The server keeps working afterwards
        let reply = server
            .process_message(&conn, r#"{"object":"EchoServer","method":"echo","args":["ok"]}"#)
            .await;
        assert_eq!(reply, r#""ok""#);
    }

    #[test_log::test(tokio::test)]
    async fn test_timeout_and_failure() {
        let server = server(20);
        let conn = ConnectionId::new();
        let reply = server
            .process_message(&conn, r#"{"object":"EchoServer","method":"sleep"}"#)
            .await;
        assert_eq!(error_of(&reply)["error"], "Timeout");

        let reply = server
            .process_message(&conn, r#"{"object":"EchoServer","method":"fail"}"#)
            .await;
        let json = error_of(&reply);
        assert_eq!(json["error"], "Invocation");
        assert_eq!(json["msg"], "Invocation failed: failed on purpose");
    }

    #[tokio::test]
    async fn test_init_constructs_active_instance() {
        let server = server(1_000);
        server
            .register_class(
                "Session",
                Arc::new(|_args: Vec<Value>| Ok(Arc::new(EchoServer) as Arc<dyn RemoteObject>)),
            )
            .unwrap();
        let conn = ConnectionId::new();

        let reply = server
            .process_message(&conn, r#"{"object":"Session","method":"init","args":["root"]}"#)
            .await;
        assert_eq!(reply, "0");
        let reply = server
            .process_message(&conn, r#"{"object":"Session","method":"echo","args":["x"]}"#)
            .await;
        assert_eq!(reply, r#""x""#);
    }

    #[tokio::test]
    async fn test_exposed_methods_only() {
        let server = LiaisonServer::new(&ServerConfig::default());
        server
            .register_object_exposing("EchoServer", Arc::new(EchoServer), &["echo"])
            .unwrap();
        let conn = ConnectionId::new();
        let reply = server
            .process_message(&conn, r#"{"object":"EchoServer","method":"panic"}"#)
            .await;
        assert_eq!(error_of(&reply)["error"], "MethodNotExposed");
    }
}
