/*!
 * Device registry for Liaison.
 *
 * The registry maps device names to live devices, builds devices from
 * declarative specs through per-type factories, and guarantees that one
 * piece of hardware is registered at most once.
 */
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, RwLock};

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use liaison_core::types::{Metadata, Value};

use crate::device::{Device, DeviceError, DeviceIdentity, Result};
use crate::discovery::DeviceLookup;

/// Builds devices of one type from spec parameters.
///
/// Building happens in two steps so the registry can refuse a duplicate
/// before any hardware is touched.
pub trait DeviceFactory: Send + Sync {
    /// Work out which hardware `params` describe, without opening it.
    ///
    /// The result must equal the [`Device::identity`] of the device that
    /// [`DeviceFactory::build`] returns for the same parameters.
    fn identify(&self, params: &Metadata) -> Result<DeviceIdentity>;

    /// Open the hardware named by `identity` and build the device
    fn build(&self, name: &str, identity: &DeviceIdentity, params: Metadata) -> Result<Arc<dyn Device>>;
}

/// Outcome of registering a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    /// The device was stored under `name`
    Added {
        /// Final, unique name
        name: String,
    },
    /// The same hardware was already registered under `existing`
    Duplicate {
        /// Name of the device that was kept
        existing: String,
    },
}

impl Registration {
    /// Name under which the hardware can be addressed
    pub fn name(&self) -> &str {
        match self {
            Registration::Added { name } => name,
            Registration::Duplicate { existing } => existing,
        }
    }

    /// Check if a new entry was created
    pub fn is_added(&self) -> bool {
        matches!(self, Registration::Added { .. })
    }
}

/// Event types for device registry
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// A device was added to the registry
    DeviceAdded {
        /// Registered name
        name: String,
        /// Device type tag
        device_type: String,
    },
    /// A device was removed from the registry
    DeviceRemoved {
        /// Name it was registered under
        name: String,
    },
}

struct DeviceEntry {
    name: String,
    device: Arc<dyn Device>,
}

/// Device registry
pub struct DeviceRegistry {
    /// Registered devices in insertion order
    devices: RwLock<Vec<DeviceEntry>>,
    /// Factories keyed by device type
    factories: RwLock<HashMap<String, Arc<dyn DeviceFactory>>>,
    /// Identities whose factory is running
    building: Mutex<Vec<DeviceIdentity>>,
    /// Signalled whenever a build finishes
    built: Condvar,
    /// Hardware lookups keyed by kind
    lookups: RwLock<HashMap<String, Arc<dyn DeviceLookup>>>,
    /// Event sender for registry events
    event_sender: broadcast::Sender<RegistryEvent>,
}

fn lock_error(what: &str) -> DeviceError {
    DeviceError::Other(format!("Failed to acquire {} lock on device registry", what))
}

impl DeviceRegistry {
    /// Create a new device registry
    pub fn new() -> Self {
        let (event_sender, _) = broadcast::channel(100);
        Self {
            devices: RwLock::new(Vec::new()),
            factories: RwLock::new(HashMap::new()),
            building: Mutex::new(Vec::new()),
            built: Condvar::new(),
            lookups: RwLock::new(HashMap::new()),
            event_sender,
        }
    }

    /// Register the factory for `device_type`, replacing any previous one
    pub fn register_factory<S: Into<String>>(&self, device_type: S, factory: Arc<dyn DeviceFactory>) {
        let device_type = device_type.into();
        match self.factories.write() {
            Ok(mut factories) => {
                if factories.insert(device_type.clone(), factory).is_some() {
                    debug!("Replaced factory for {}", device_type);
                }
            }
            Err(_) => warn!("Factory table poisoned, {} not registered", device_type),
        }
    }

    /// Device types that have a factory
    pub fn factory_types(&self) -> Result<Vec<String>> {
        let factories = self.factories.read().map_err(|_| lock_error("read"))?;
        let mut types: Vec<_> = factories.keys().cloned().collect();
        types.sort();
        Ok(types)
    }

    fn factory(&self, device_type: &str) -> Result<Arc<dyn DeviceFactory>> {
        let factories = self.factories.read().map_err(|_| lock_error("read"))?;
        factories
            .get(device_type)
            .cloned()
            .ok_or_else(|| DeviceError::UnknownDeviceType(device_type.to_string()))
    }

    /// Register a lookup under its kind
    pub fn register_lookup(&self, lookup: Arc<dyn DeviceLookup>) {
        if let Ok(mut lookups) = self.lookups.write() {
            lookups.insert(lookup.kind().to_string(), lookup);
        }
    }

    /// List hardware of `kind` that could be added
    pub fn available_devices(&self, kind: &str) -> Result<Vec<Metadata>> {
        let lookup = {
            let lookups = self.lookups.read().map_err(|_| lock_error("read"))?;
            lookups.get(kind).cloned()
        };
        match lookup {
            Some(lookup) => lookup.available(),
            None => Err(DeviceError::NotSupported(format!(
                "No lookup for device kind {}",
                kind
            ))),
        }
    }

    /// Register a device under `name`.
    ///
    /// If a registered device drives the same hardware, nothing is stored and
    /// the existing name is reported. A name already in use gets a numeric
    /// suffix.
    pub fn register(&self, name: &str, device: Arc<dyn Device>) -> Result<Registration> {
        let identity = device.identity();
        let mut devices = self.devices.write().map_err(|_| lock_error("write"))?;

        if let Some(existing) = devices.iter().find(|e| e.device.is_same_device(&identity)) {
            debug!(
                "Device {} duplicates {}, keeping the existing one",
                name, existing.name
            );
            return Ok(Registration::Duplicate {
                existing: existing.name.clone(),
            });
        }

        let name = unique_name(&devices, name);
        let device_type = device.device_type().to_string();
        devices.push(DeviceEntry {
            name: name.clone(),
            device,
        });
        let _ = self.event_sender.send(RegistryEvent::DeviceAdded {
            name: name.clone(),
            device_type: device_type.clone(),
        });
        info!("Registered {} device as {}", device_type, name);

        Ok(Registration::Added { name })
    }

    fn find_same(&self, identity: &DeviceIdentity) -> Result<Option<String>> {
        let devices = self.devices.read().map_err(|_| lock_error("read"))?;
        Ok(devices
            .iter()
            .find(|e| e.device.is_same_device(identity))
            .map(|e| e.name.clone()))
    }

    /// Reserve `identity` for building, or report the device that owns it.
    ///
    /// Waits while another caller is building the same identity.
    fn claim(&self, identity: &DeviceIdentity) -> Result<Claim<'_>> {
        let mut building = self.building.lock().map_err(|_| lock_error("build"))?;
        loop {
            if let Some(existing) = self.find_same(identity)? {
                return Ok(Claim::Existing(existing));
            }
            if !building.contains(identity) {
                building.push(identity.clone());
                return Ok(Claim::Reserved(BuildGuard {
                    registry: self,
                    identity: identity.clone(),
                }));
            }
            building = self.built.wait(building).map_err(|_| lock_error("build"))?;
        }
    }

    /// Build a device through its factory and register it.
    ///
    /// The factory first names the hardware. When it is registered already,
    /// or being built by another caller that then succeeds, the existing
    /// name is reported and the hardware is not opened again.
    pub fn add_device(&self, device_type: &str, name: &str, params: Metadata) -> Result<Registration> {
        let factory = self.factory(device_type)?;
        let identity = factory.identify(&params)?;

        let _guard = match self.claim(&identity)? {
            Claim::Existing(existing) => {
                debug!("{} {} is already registered as {}", device_type, name, existing);
                return Ok(Registration::Duplicate { existing });
            }
            Claim::Reserved(guard) => guard,
        };

        let device = factory.build(name, &identity, params)?;
        if device.identity() != identity {
            warn!(
                "{} factory built {:?} for requested {:?}",
                device_type,
                device.identity(),
                identity
            );
        }
        self.register(name, device)
    }

    /// Build and register every device in `spec`.
    ///
    /// Each entry names its `type`; `name` defaults to the type and the
    /// remaining keys go to the factory. Stops at the first failing entry.
    pub fn add_from_spec(&self, spec: Vec<Metadata>) -> Result<Vec<Registration>> {
        let mut registrations = Vec::with_capacity(spec.len());
        for mut params in spec {
            let device_type = match params.remove("type") {
                Some(Value::String(device_type)) => device_type,
                Some(other) => {
                    return Err(DeviceError::ConfigurationError(format!(
                        "Device type must be a string, got {}",
                        other.type_name()
                    )))
                }
                None => {
                    return Err(DeviceError::ConfigurationError(
                        "Device spec entry has no type".to_string(),
                    ))
                }
            };
            let name = match params.remove("name") {
                Some(Value::String(name)) if !name.is_empty() => name,
                Some(Value::Null) | None => device_type.clone(),
                Some(other) => other.to_string(),
            };
            registrations.push(self.add_device(&device_type, &name, params)?);
        }
        Ok(registrations)
    }

    /// Remove a device by name
    pub fn remove_device(&self, name: &str) -> Result<Arc<dyn Device>> {
        let mut devices = self.devices.write().map_err(|_| lock_error("write"))?;
        let index = devices
            .iter()
            .position(|e| e.name == name)
            .ok_or_else(|| DeviceError::NotFound(name.to_string()))?;
        let entry = devices.remove(index);
        let _ = self.event_sender.send(RegistryEvent::DeviceRemoved {
            name: entry.name.clone(),
        });
        debug!("Unregistered device {}", entry.name);
        Ok(entry.device)
    }

    /// Get a device by name.
    ///
    /// `parent.child` addresses a sub-device, e.g. `tpad.photodiode1`.
    pub fn get_device(&self, name: &str) -> Result<Arc<dyn Device>> {
        let devices = self.devices.read().map_err(|_| lock_error("read"))?;

        if let Some(entry) = devices.iter().find(|e| e.name == name) {
            return Ok(entry.device.clone());
        }
        for entry in devices.iter() {
            let child = match name
                .strip_prefix(entry.name.as_str())
                .and_then(|rest| rest.strip_prefix('.'))
            {
                Some(child) => child,
                None => continue,
            };
            if let Some((_, device)) = entry
                .device
                .children()
                .into_iter()
                .find(|(child_name, _)| child_name == child)
            {
                return Ok(device);
            }
        }
        Err(DeviceError::NotFound(name.to_string()))
    }

    /// Names of all registered devices, in registration order
    pub fn device_names(&self) -> Result<Vec<String>> {
        let devices = self.devices.read().map_err(|_| lock_error("read"))?;
        Ok(devices.iter().map(|e| e.name.clone()).collect())
    }

    /// Get all registered devices with their names
    pub fn get_devices(&self) -> Result<Vec<(String, Arc<dyn Device>)>> {
        let devices = self.devices.read().map_err(|_| lock_error("read"))?;
        Ok(devices
            .iter()
            .map(|e| (e.name.clone(), e.device.clone()))
            .collect())
    }

    /// Get devices by type
    pub fn get_devices_by_type(&self, device_type: &str) -> Result<Vec<Arc<dyn Device>>> {
        let devices = self.devices.read().map_err(|_| lock_error("read"))?;
        Ok(devices
            .iter()
            .filter(|e| e.device.device_type() == device_type)
            .map(|e| e.device.clone())
            .collect())
    }

    /// Subscribe to registry events
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_sender.subscribe()
    }

    /// Shutdown all devices
    pub async fn shutdown_all_devices(&self) -> Result<()> {
        // Snapshot first so no lock is held across the awaits.
        let devices = self.get_devices()?;

        for (name, device) in devices.iter() {
            debug!("Shutting down device {}", name);
            if let Err(e) = device.shutdown().await {
                warn!("Failed to shut down device {}: {}", name, e);
                // Continue with other devices even if one fails
            }
        }

        info!("Shut down {} devices", devices.len());
        Ok(())
    }

    /// Count registered devices
    pub fn count_devices(&self) -> Result<usize> {
        let devices = self.devices.read().map_err(|_| lock_error("read"))?;
        Ok(devices.len())
    }

    /// Check if a device is registered under `name`
    pub fn has_device(&self, name: &str) -> Result<bool> {
        let devices = self.devices.read().map_err(|_| lock_error("read"))?;
        Ok(devices.iter().any(|e| e.name == name))
    }
}

fn unique_name(devices: &[DeviceEntry], requested: &str) -> String {
    let taken = |candidate: &str| devices.iter().any(|e| e.name == candidate);
    if !taken(requested) {
        return requested.to_string();
    }
    (1..)
        .map(|i| format!("{}{}", requested, i))
        .find(|candidate| !taken(candidate.as_str()))
        .unwrap_or_else(|| requested.to_string())
}

enum Claim<'a> {
    Existing(String),
    Reserved(BuildGuard<'a>),
}

/// Releases a build reservation when dropped
struct BuildGuard<'a> {
    registry: &'a DeviceRegistry,
    identity: DeviceIdentity,
}

impl Drop for BuildGuard<'_> {
    fn drop(&mut self) {
        let mut building = self
            .registry
            .building
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        building.retain(|identity| *identity != self.identity);
        self.registry.built.notify_all();
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("devices", &self.device_names().unwrap_or_default())
            .field("factories", &self.factory_types().unwrap_or_default())
            .finish()
    }
}

/// A shared device registry that can be cloned
#[derive(Debug, Clone)]
pub struct SharedDeviceRegistry(Arc<DeviceRegistry>);

impl SharedDeviceRegistry {
    /// Create a new shared device registry
    pub fn new() -> Self {
        Self(Arc::new(DeviceRegistry::new()))
    }

    /// Get a reference to the device registry
    pub fn registry(&self) -> &DeviceRegistry {
        &self.0
    }
}

impl Default for SharedDeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AsRef<DeviceRegistry> for SharedDeviceRegistry {
    fn as_ref(&self) -> &DeviceRegistry {
        self.registry()
    }
}
