/*!
 * Remotely callable objects.
 *
 * Objects are registered under a name. A name holds at most one factory and
 * any number of instances; calls go to the most recently registered instance
 * unless the request picks one explicitly. The reserved method `init`
 * constructs a new instance through the factory.
 */
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::debug;

use liaison_core::types::Value;

use crate::error::{Result, ServerError};
use crate::listeners::{ConnectionId, ListenerHub};
use crate::protocol::RpcRequest;

/// Method name that constructs an instance from a registered class
pub const INIT_METHOD: &str = "init";

/// Per-call information handed to remote objects
#[derive(Clone)]
pub struct CallContext {
    /// Connection the request arrived on
    pub connection: ConnectionId,
    /// Subscription hub of the server
    pub hub: Arc<ListenerHub>,
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("connection", &self.connection)
            .finish()
    }
}

/// An object whose methods can be invoked over the wire
#[async_trait]
pub trait RemoteObject: Send + Sync {
    /// Name of the object's class, for diagnostics
    fn class_name(&self) -> &str;

    /// Methods the object implements
    fn methods(&self) -> &[&'static str];

    /// Invoke `method` with positional arguments
    async fn invoke(&self, ctx: &CallContext, method: &str, args: Vec<Value>) -> Result<Value>;
}

/// Builds a remote object from `init` arguments
pub type ClassFactory = Arc<dyn Fn(Vec<Value>) -> Result<Arc<dyn RemoteObject>> + Send + Sync>;

#[derive(Default)]
struct ObjectSlot {
    factory: Option<ClassFactory>,
    instances: Vec<Arc<dyn RemoteObject>>,
    exposed: Option<HashSet<String>>,
}

/// What a request resolved to
pub enum Target {
    /// Invoke a method on this instance
    Instance(Arc<dyn RemoteObject>),
    /// Construct a new instance with this factory
    Construct(ClassFactory),
}

/// Named slots of remote objects
#[derive(Default)]
pub struct ObjectRegistry {
    slots: RwLock<HashMap<String, ObjectSlot>>,
}

fn lock_error() -> ServerError {
    ServerError::Invocation("Failed to acquire object registry lock".to_string())
}

impl ObjectRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under `name`; remote callers create instances with `init`
    pub fn register_class<S: Into<String>>(&self, name: S, factory: ClassFactory) -> Result<()> {
        let name = name.into();
        let mut slots = self.slots.write().map_err(|_| lock_error())?;
        slots.entry(name.clone()).or_default().factory = Some(factory);
        debug!("Registered class {}", name);
        Ok(())
    }

    /// Register an instance under `name`; it becomes the active instance
    pub fn register_object<S: Into<String>>(
        &self,
        name: S,
        instance: Arc<dyn RemoteObject>,
    ) -> Result<usize> {
        let name = name.into();
        let mut slots = self.slots.write().map_err(|_| lock_error())?;
        let slot = slots.entry(name.clone()).or_default();
        slot.instances.push(instance);
        debug!("Registered object {} (instance {})", name, slot.instances.len() - 1);
        Ok(slot.instances.len() - 1)
    }

    /// Register an instance and restrict remote calls on `name` to `methods`
    pub fn register_object_exposing<S: Into<String>>(
        &self,
        name: S,
        instance: Arc<dyn RemoteObject>,
        methods: &[&str],
    ) -> Result<usize> {
        let name = name.into();
        let index = self.register_object(name.clone(), instance)?;
        let mut slots = self.slots.write().map_err(|_| lock_error())?;
        if let Some(slot) = slots.get_mut(&name) {
            slot.exposed = Some(methods.iter().map(|m| m.to_string()).collect());
        }
        Ok(index)
    }

    /// Registered names
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .slots
            .read()
            .map(|slots| slots.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Number of instances registered under `name`
    pub fn instance_count(&self, name: &str) -> usize {
        self.slots
            .read()
            .ok()
            .and_then(|slots| slots.get(name).map(|s| s.instances.len()))
            .unwrap_or(0)
    }

    /// Find what a request should run against
    pub fn resolve(&self, request: &RpcRequest) -> Result<Target> {
        let slots = self.slots.read().map_err(|_| lock_error())?;
        let slot = slots
            .get(&request.object)
            .ok_or_else(|| ServerError::UnknownObject(request.object.clone()))?;

        if request.method == INIT_METHOD {
            if let Some(factory) = &slot.factory {
                return Ok(Target::Construct(factory.clone()));
            }
        }

        let instance = match request.instance {
            Some(index) => slot.instances.get(index).ok_or_else(|| {
                ServerError::UnknownObject(format!("{}[{}]", request.object, index))
            })?,
            None => slot.instances.last().ok_or_else(|| {
                ServerError::UnknownObject(format!("{} has no instance", request.object))
            })?,
        };

        if !instance.methods().contains(&request.method.as_str()) {
            return Err(ServerError::UnknownMethod(format!(
                "{}.{}",
                request.object, request.method
            )));
        }
        if let Some(exposed) = &slot.exposed {
            if !exposed.contains(&request.method) {
                return Err(ServerError::MethodNotExposed(format!(
                    "{}.{}",
                    request.object, request.method
                )));
            }
        }
        Ok(Target::Instance(instance.clone()))
    }
}

impl fmt::Debug for ObjectRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectRegistry")
            .field("names", &self.names())
            .finish()
    }
}

/// Typed access to positional call arguments
#[derive(Debug, Clone, Copy)]
pub struct Args<'a>(pub &'a [Value]);

impl<'a> Args<'a> {
    fn get(&self, index: usize, name: &str) -> Result<&'a Value> {
        self.0
            .get(index)
            .ok_or_else(|| ServerError::InvalidArgument(format!("missing argument {}", name)))
    }

    /// Required string argument
    pub fn str(&self, index: usize, name: &str) -> Result<&'a str> {
        let value = self.get(index, name)?;
        value.as_str().ok_or_else(|| {
            ServerError::InvalidArgument(format!(
                "{} must be a string, got {}",
                name,
                value.type_name()
            ))
        })
    }

    /// Optional string argument
    pub fn opt_str(&self, index: usize) -> Option<&'a str> {
        self.0.get(index).and_then(Value::as_str)
    }

    /// Flag argument, `default` when absent
    pub fn flag(&self, index: usize, name: &str, default: bool) -> Result<bool> {
        match self.0.get(index) {
            None | Some(Value::Null) => Ok(default),
            Some(value) => value.as_flag().ok_or_else(|| {
                ServerError::InvalidArgument(format!("{} must be a flag, got {}", name, value))
            }),
        }
    }

    /// Arguments from `index` on
    pub fn rest(&self, index: usize) -> Vec<Value> {
        self.0.get(index..).map(<[Value]>::to_vec).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter {
        start: i64,
    }

    #[async_trait]
    impl RemoteObject for Counter {
        fn class_name(&self) -> &str {
            "Counter"
        }

        fn methods(&self) -> &[&'static str] {
            &["get", "secret"]
        }

        async fn invoke(&self, _ctx: &CallContext, method: &str, _args: Vec<Value>) -> Result<Value> {
            match method {
                "get" => Ok(Value::Integer(self.start)),
                _ => Ok(Value::from("hidden")),
            }
        }
    }

    fn request(object: &str, method: &str) -> RpcRequest {
        RpcRequest::new(object, method, vec![])
    }

    fn start_of(target: Target) -> i64 {
        match target {
            Target::Instance(_) => 0,
            Target::Construct(_) => -1,
        }
    }

    #[test]
    fn test_unknown_object_and_method() {
        let registry = ObjectRegistry::new();
        registry
            .register_object("Counter", Arc::new(Counter { start: 1 }))
            .unwrap();

        assert!(matches!(
            registry.resolve(&request("Nope", "get")),
            Err(ServerError::UnknownObject(_))
        ));
        assert!(matches!(
            registry.resolve(&request("Counter", "set")),
            Err(ServerError::UnknownMethod(_))
        ));
        assert_eq!(start_of(registry.resolve(&request("Counter", "get")).unwrap()), 0);
    }

    #[test]
    fn test_exposed_methods() {
        let registry = ObjectRegistry::new();
        registry
            .register_object_exposing("Counter", Arc::new(Counter { start: 1 }), &["get"])
            .unwrap();

        assert!(registry.resolve(&request("Counter", "get")).is_ok());
        assert!(matches!(
            registry.resolve(&request("Counter", "secret")),
            Err(ServerError::MethodNotExposed(_))
        ));
    }

    #[tokio::test]
    async fn test_last_registered_instance_is_active() {
        let registry = ObjectRegistry::new();
        let ctx = CallContext {
            connection: ConnectionId::new(),
            hub: Arc::new(ListenerHub::new(4)),
        };
        registry
            .register_object("Counter", Arc::new(Counter { start: 1 }))
            .unwrap();
        let index = registry
            .register_object("Counter", Arc::new(Counter { start: 2 }))
            .unwrap();
        assert_eq!(index, 1);

        let active = match registry.resolve(&request("Counter", "get")).unwrap() {
            Target::Instance(instance) => instance,
            Target::Construct(_) => panic!("expected an instance"),
        };
        assert_eq!(
            active.invoke(&ctx, "get", vec![]).await.unwrap(),
            Value::Integer(2)
        );

        let mut first = request("Counter", "get");
        first.instance = Some(0);
        let first = match registry.resolve(&first).unwrap() {
            Target::Instance(instance) => instance,
            Target::Construct(_) => panic!("expected an instance"),
        };
        assert_eq!(first.invoke(&ctx, "get", vec![]).await.unwrap(), Value::Integer(1));

        let mut missing = request("Counter", "get");
        missing.instance = Some(5);
        assert!(matches!(
            registry.resolve(&missing),
            Err(ServerError::UnknownObject(_))
        ));
    }

    #[test]
    fn test_init_resolves_to_factory() {
        let registry = ObjectRegistry::new();
        registry
            .register_class(
                "Counter",
                Arc::new(|_args: Vec<Value>| {
                    Ok(Arc::new(Counter { start: 0 }) as Arc<dyn RemoteObject>)
                }),
            )
            .unwrap();

        assert_eq!(start_of(registry.resolve(&request("Counter", "init")).unwrap()), -1);
        assert!(matches!(
            registry.resolve(&request("Counter", "get")),
            Err(ServerError::UnknownObject(_))
        ));
        assert_eq!(registry.names(), vec!["Counter"]);
        assert_eq!(registry.instance_count("Counter"), 0);
    }

    #[test]
    fn test_args() {
        let values = vec![Value::from("pad"), Value::from("True"), Value::Integer(3)];
        let args = Args(&values);
        assert_eq!(args.str(0, "device").unwrap(), "pad");
        assert!(args.flag(1, "enabled", false).unwrap());
        assert!(args.flag(5, "enabled", true).unwrap());
        assert!(matches!(args.str(2, "name"), Err(ServerError::InvalidArgument(_))));
        assert!(matches!(args.str(9, "name"), Err(ServerError::InvalidArgument(_))));
        assert_eq!(args.rest(2), vec![Value::Integer(3)]);
        assert!(args.rest(7).is_empty());
        assert_eq!(args.opt_str(1), Some("True"));
    }
}
