/*!
 * Remote face of the device registry.
 */
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use liaison_core::types::{Metadata, Value};
use liaison_core::utils::spawn_blocking_with_timeout;
use liaison_devices::spec;
use liaison_devices::{DeviceError, Registration, SharedDeviceRegistry};

use crate::error::{Result, ServerError};
use crate::listeners::Subscriber;
use crate::remote::{Args, CallContext, ClassFactory, RemoteObject};

/// Name the device manager is registered under
pub const DEVICE_MANAGER: &str = "DeviceManager";

const METHODS: &[&str] = &[
    "addDevice",
    "addDevicesFromSpec",
    "removeDevice",
    "getDevices",
    "getDeviceState",
    "deviceCommand",
    "addListener",
    "getAvailableDevices",
    "getSerialDevices",
];

/// Exposes the shared device registry to remote callers
#[derive(Debug, Clone)]
pub struct DeviceManager {
    registry: SharedDeviceRegistry,
}

fn registration_value(registration: &Registration) -> Value {
    let mut fields = HashMap::new();
    fields.insert("name".to_string(), Value::from(registration.name()));
    fields.insert("added".to_string(), Value::from(registration.is_added()));
    Value::Object(fields)
}

fn params_from_json(text: &str) -> Result<Metadata> {
    if text.trim().is_empty() {
        return Ok(Metadata::new());
    }
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(params)) => Ok(params),
        Ok(other) => Err(ServerError::InvalidArgument(format!(
            "device params must be an object, got {}",
            other.type_name()
        ))),
        Err(e) => Err(ServerError::InvalidArgument(format!(
            "device params are not JSON: {}",
            e
        ))),
    }
}

impl DeviceManager {
    /// Wrap a registry
    pub fn new(registry: SharedDeviceRegistry) -> Self {
        Self { registry }
    }

    /// Factory that hands every `init` call a manager over `registry`
    pub fn class(registry: SharedDeviceRegistry) -> ClassFactory {
        Arc::new(move |_args: Vec<Value>| {
            Ok(Arc::new(DeviceManager::new(registry.clone())) as Arc<dyn RemoteObject>)
        })
    }

    /// The managed registry
    pub fn registry(&self) -> &SharedDeviceRegistry {
        &self.registry
    }

    async fn add_device(&self, args: Args<'_>) -> Result<Value> {
        let device_type = args.str(0, "type")?.to_string();
        let name = match args.opt_str(1) {
            Some(name) if !name.trim().is_empty() => name.trim().to_string(),
            _ => device_type.clone(),
        };
        let params = params_from_json(args.opt_str(2).unwrap_or(""))?;

        let registry = self.registry.clone();
        let registration = spawn_blocking_with_timeout(None, move || {
            registry.registry().add_device(&device_type, &name, params)
        })
        .await??;
        info!("Device {} ready", registration.name());
        Ok(registration_value(&registration))
    }

    async fn add_from_spec(&self, args: Args<'_>) -> Result<Value> {
        let entries = spec::parse_json(args.str(0, "spec")?)?;
        let registry = self.registry.clone();
        let registrations =
            spawn_blocking_with_timeout(None, move || registry.registry().add_from_spec(entries))
                .await??;
        Ok(Value::Array(
            registrations.iter().map(registration_value).collect(),
        ))
    }

    async fn remove_device(&self, ctx: &CallContext, args: Args<'_>) -> Result<Value> {
        let name = args.str(0, "name")?;
        let device = self.registry.registry().remove_device(name)?;
        ctx.hub.forget_device(name);
        device.clear_listeners();
        device.shutdown().await?;
        Ok(Value::from(name))
    }

    fn devices(&self) -> Result<Value> {
        let devices = self.registry.registry().get_devices()?;
        Ok(Value::Object(
            devices
                .into_iter()
                .map(|(name, device)| (name, device.identity().to_value()))
                .collect(),
        ))
    }

    async fn device_state(&self, args: Args<'_>) -> Result<Value> {
        let device = self.registry.registry().get_device(args.str(0, "name")?)?;
        Ok(device.state().await?)
    }

    async fn device_command(&self, args: Args<'_>) -> Result<Value> {
        let device = self.registry.registry().get_device(args.str(0, "name")?)?;
        let command = args.str(1, "command")?;
        if !device.supports_command(command) {
            return Err(DeviceError::NotSupported(format!(
                "Command {} not supported by {}",
                command,
                device.device_type()
            ))
            .into());
        }
        Ok(device.execute_command(command, args.rest(2)).await?)
    }

    fn add_listener(&self, ctx: &CallContext, args: Args<'_>) -> Result<Value> {
        let name = args.str(0, "device")?;
        let subscriber = Subscriber::parse(args.opt_str(1).unwrap_or(""), &ctx.connection);
        let enabled = args.flag(2, "enabled", true)?;

        if enabled {
            let device = self.registry.registry().get_device(name)?;
            if ctx.hub.mark_attached(name) {
                if let Err(err) = device.add_listener(ctx.hub.listener_for(name)) {
                    ctx.hub.forget_device(name);
                    return Err(err.into());
                }
                debug!("Listener attached to {}", name);
            }
        }
        ctx.hub.set_listening(name, subscriber, enabled)?;
        Ok(Value::from(enabled))
    }

    fn available_devices(&self, args: Args<'_>) -> Result<Value> {
        let kind = args.str(0, "kind")?;
        let profiles = self.registry.registry().available_devices(kind)?;
        Ok(Value::Array(profiles.into_iter().map(Value::Object).collect()))
    }

    fn serial_devices(&self) -> Result<Value> {
        let profiles = self.registry.registry().available_devices("serial")?;
        Ok(Value::Object(
            profiles
                .into_iter()
                .filter_map(|profile| {
                    let port = profile.get("port")?.as_str()?.to_string();
                    Some((port, Value::Object(profile)))
                })
                .collect(),
        ))
    }
}

#[async_trait]
impl RemoteObject for DeviceManager {
    fn class_name(&self) -> &str {
        DEVICE_MANAGER
    }

    fn methods(&self) -> &[&'static str] {
        METHODS
    }

    async fn invoke(&self, ctx: &CallContext, method: &str, args: Vec<Value>) -> Result<Value> {
        let args = Args(&args);
        match method {
            "addDevice" => self.add_device(args).await,
            "addDevicesFromSpec" => self.add_from_spec(args).await,
            "removeDevice" => self.remove_device(ctx, args).await,
            "getDevices" => self.devices(),
            "getDeviceState" => self.device_state(args).await,
            "deviceCommand" => self.device_command(args).await,
            "addListener" => self.add_listener(ctx, args),
            "getAvailableDevices" => self.available_devices(args),
            "getSerialDevices" => self.serial_devices(),
            other => Err(ServerError::UnknownMethod(format!(
                "{}.{}",
                DEVICE_MANAGER, other
            ))),
        }
    }
}
