/*!
 * Device registry for ScopeFlow.
 *
 * Lists the device kinds the host can create, builds facades by device name
 * around a shared hub, and keeps track of the created instances.
 */
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use scopeflow_core::config::Config;
use scopeflow_core::logging::component_span;
use scopeflow_core::types::Id;

use crate::device::{Device, DeviceError, DeviceInfo, DeviceKind, DeviceState, Result};
use crate::devices::{FocusDrive, Lamp, Microscope, Nosepiece};
use crate::protocol::hub::SharedHub;

/// Device kinds the host can create, with their names and descriptions
pub fn available_devices() -> Vec<(&'static str, &'static str)> {
    DeviceKind::ALL
        .into_iter()
        .map(|kind| (kind.device_name(), kind.description()))
        .collect()
}

/// Create the facade registered under `name`, identified by `label`
pub fn create_device(
    name: &str,
    label: &str,
    hub: &SharedHub,
    config: &Config,
) -> Result<Arc<dyn Device>> {
    let kind = DeviceKind::from_device_name(name)
        .ok_or_else(|| DeviceError::UnknownDevice(name.to_string()))?;
    let id = Id::from(label);
    let hub = hub.clone();
    debug!("Creating {} as {}", kind, id);

    let device: Arc<dyn Device> = match kind {
        DeviceKind::Microscope => Arc::new(Microscope::new(id, hub, &config.hub)),
        DeviceKind::Lamp => Arc::new(Lamp::new(id, hub, &config.lamp)),
        DeviceKind::FocusDrive => Arc::new(FocusDrive::new(id, hub, &config.focus)),
        DeviceKind::Nosepiece => Arc::new(Nosepiece::new(id, hub, &config.nosepiece)?),
    };
    Ok(device)
}

/// Event types for device registry
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// A device was added to the registry
    DeviceAdded(DeviceInfo),
    /// A device was removed from the registry
    DeviceRemoved(Id),
    /// A device state changed during a registry-wide lifecycle call
    DeviceStateChanged {
        /// The device ID
        id: Id,
        /// The old state
        old_state: DeviceState,
        /// The new state
        new_state: DeviceState,
    },
}

/// Device registry
#[derive(Debug)]
pub struct DeviceRegistry {
    /// The registered devices
    devices: RwLock<HashMap<Id, Arc<dyn Device>>>,
    /// Event sender for registry events
    event_sender: broadcast::Sender<RegistryEvent>,
}

impl DeviceRegistry {
    /// Create a new device registry
    pub fn new() -> Self {
        let (event_sender, _) = broadcast::channel(100);
        Self {
            devices: RwLock::new(HashMap::new()),
            event_sender,
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<Id, Arc<dyn Device>>>> {
        self.devices.read().map_err(|_| {
            DeviceError::Other("Failed to acquire read lock on device registry".to_string())
        })
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<Id, Arc<dyn Device>>>> {
        self.devices.write().map_err(|_| {
            DeviceError::Other("Failed to acquire write lock on device registry".to_string())
        })
    }

    /// Register a device with the registry
    pub fn register_device(&self, device: Arc<dyn Device>) -> Result<()> {
        let id = device.id().clone();
        let info = device.info().clone();

        let mut devices = self.write()?;
        if devices.contains_key(&id) {
            return Err(DeviceError::Other(format!(
                "Device with ID {} already registered",
                id
            )));
        }

        devices.insert(id.clone(), device);
        let _ = self.event_sender.send(RegistryEvent::DeviceAdded(info));
        debug!("Registered device with ID {}", id);

        Ok(())
    }

    /// Create a device by name and register it
    pub fn create_device(
        &self,
        name: &str,
        label: &str,
        hub: &SharedHub,
        config: &Config,
    ) -> Result<Arc<dyn Device>> {
        let device = create_device(name, label, hub, config)?;
        self.register_device(device.clone())?;
        Ok(device)
    }

    /// Unregister a device from the registry
    pub fn unregister_device(&self, id: &Id) -> Result<()> {
        let mut devices = self.write()?;

        if devices.remove(id).is_none() {
            return Err(DeviceError::Other(format!(
                "Device with ID {} not registered",
                id
            )));
        }

        let _ = self.event_sender.send(RegistryEvent::DeviceRemoved(id.clone()));
        debug!("Unregistered device with ID {}", id);

        Ok(())
    }

    /// Get a device by ID
    pub fn get_device(&self, id: &Id) -> Result<Arc<dyn Device>> {
        self.read()?
            .get(id)
            .cloned()
            .ok_or_else(|| DeviceError::Other(format!("Device with ID {} not found", id)))
    }

    /// Get all registered devices
    pub fn get_devices(&self) -> Result<Vec<Arc<dyn Device>>> {
        Ok(self.read()?.values().cloned().collect())
    }

    /// Get all device IDs
    pub fn get_device_ids(&self) -> Result<Vec<Id>> {
        Ok(self.read()?.keys().cloned().collect())
    }

    /// Get devices by kind
    pub fn get_devices_by_kind(&self, kind: DeviceKind) -> Result<Vec<Arc<dyn Device>>> {
        Ok(self
            .read()?
            .values()
            .filter(|device| device.kind() == kind)
            .cloned()
            .collect())
    }

    /// Subscribe to registry events
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_sender.subscribe()
    }

    /// Devices in registration-kind order: the stand first, then its sub-devices
    fn ordered(&self) -> Result<Vec<Arc<dyn Device>>> {
        let mut devices = self.get_devices()?;
        devices.sort_by_key(|device| {
            let rank = DeviceKind::ALL.iter().position(|kind| *kind == device.kind());
            (rank, device.id().clone())
        });
        Ok(devices)
    }

    fn notify_state(&self, device: &Arc<dyn Device>, old_state: DeviceState) {
        let new_state = device.state();
        if old_state != new_state {
            let _ = self.event_sender.send(RegistryEvent::DeviceStateChanged {
                id: device.id().clone(),
                old_state,
                new_state,
            });
        }
    }

    /// Initialize all devices, stopping at the first failure
    pub fn initialize_all_devices(&self) -> Result<()> {
        let devices = self.ordered()?;

        for device in &devices {
            let _span = component_span(device.name(), Some(device.id().as_str())).entered();
            debug!("Initializing device with ID {}", device.id());
            let old_state = device.state();
            let result = device.initialize();
            self.notify_state(device, old_state);
            if let Err(e) = result {
                error!("Failed to initialize device with ID {}: {}", device.id(), e);
                return Err(e);
            }
        }

        info!("Initialized {} devices", devices.len());
        Ok(())
    }

    /// Shutdown all devices
    pub fn shutdown_all_devices(&self) -> Result<()> {
        let devices = self.ordered()?;

        for device in devices.iter().rev() {
            debug!("Shutting down device with ID {}", device.id());
            let old_state = device.state();
            if let Err(e) = device.shutdown() {
                warn!("Failed to shut down device with ID {}: {}", device.id(), e);
                // Continue with other devices even if one fails
            }
            self.notify_state(device, old_state);
        }

        info!("Shut down {} devices", devices.len());
        Ok(())
    }

    /// Count registered devices
    pub fn count_devices(&self) -> Result<usize> {
        Ok(self.read()?.len())
    }

    /// Check if a device is registered
    pub fn has_device(&self, id: &Id) -> Result<bool> {
        Ok(self.read()?.contains_key(id))
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
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

#[cfg(test)]
mod tests {
    use super::*;

    use crate::protocol::hub::CommandHub;
    use crate::protocol::simulator::{SimulatedPorts, SimulatedStand};

    fn hub_with(stand: &SimulatedStand) -> SharedHub {
        let ports = SimulatedPorts::new().with_port("COM7", stand.clone());
        let mut hub = CommandHub::new(Arc::new(ports));
        hub.configure_port("COM7").unwrap();
        SharedHub::new(hub)
    }

    #[test]
    fn test_available_devices() {
        let names: Vec<&str> = available_devices().into_iter().map(|(name, _)| name).collect();
        assert_eq!(
            names,
            vec!["DM Microscope", "Halogen Lamp", "Z Drive", "Objective Nosepiece"]
        );
    }

    #[test]
    fn test_create_device_by_name() {
        let hub = hub_with(&SimulatedStand::new());
        let config = Config::default();

        let lamp = create_device("Halogen Lamp", "lamp", &hub, &config).unwrap();
        assert_eq!(lamp.kind(), DeviceKind::Lamp);
        assert_eq!(lamp.id().as_str(), "lamp");
        assert_eq!(lamp.name(), "Halogen Lamp");

        assert!(matches!(
            create_device("Fluorescence Turret", "ft", &hub, &config),
            Err(DeviceError::UnknownDevice(_))
        ));
    }

    #[test]
    fn test_register_and_lookup() {
        let hub = hub_with(&SimulatedStand::new());
        let config = Config::default();
        let registry = DeviceRegistry::new();
        let mut events = registry.subscribe();

        registry.create_device("Z Drive", "z", &hub, &config).unwrap();
        registry.create_device("Halogen Lamp", "lamp", &hub, &config).unwrap();
        assert!(matches!(
            registry.create_device("Z Drive", "z", &hub, &config),
            Err(DeviceError::Other(_))
        ));

        assert_eq!(registry.count_devices().unwrap(), 2);
        assert!(registry.has_device(&Id::from("z")).unwrap());
        assert_eq!(registry.get_devices_by_kind(DeviceKind::FocusDrive).unwrap().len(), 1);
        assert!(matches!(events.try_recv(), Ok(RegistryEvent::DeviceAdded(_))));

        registry.unregister_device(&Id::from("z")).unwrap();
        assert!(registry.get_device(&Id::from("z")).is_err());
        assert!(registry.unregister_device(&Id::from("z")).is_err());
    }

    #[test]
    fn test_lifecycle_shares_one_connection() {
        let stand = SimulatedStand::new();
        let hub = hub_with(&stand);
        let config = Config::default();
        let registry = DeviceRegistry::new();

        for (name, label) in [("DM Microscope", "scope"), ("Halogen Lamp", "lamp"), ("Z Drive", "z")] {
            registry.create_device(name, label, &hub, &config).unwrap();
        }

        registry.initialize_all_devices().unwrap();
        assert_eq!(stand.frames_starting_with("50025").len(), 1);
        assert_eq!(hub.lock().unwrap().users(), 3);

        registry.shutdown_all_devices().unwrap();
        assert_eq!(hub.lock().unwrap().users(), 0);
        assert!(!hub.is_connected().unwrap());
        for device in registry.get_devices().unwrap() {
            assert_eq!(device.state(), DeviceState::Uninitialized);
        }
    }

    #[test]
    fn test_initialize_stops_at_failure() {
        let stand = SimulatedStand::new().with_nosepiece_id(0);
        let hub = hub_with(&stand);
        let config = Config::default();
        let registry = DeviceRegistry::new();
        let mut events = registry.subscribe();

        registry.create_device("Objective Nosepiece", "turret", &hub, &config).unwrap();
        assert!(matches!(
            registry.initialize_all_devices(),
            Err(DeviceError::DeviceNotFound(_))
        ));

        // added, then the state change to Error
        assert!(matches!(events.try_recv(), Ok(RegistryEvent::DeviceAdded(_))));
        assert!(matches!(
            events.try_recv(),
            Ok(RegistryEvent::DeviceStateChanged { new_state: DeviceState::Error, .. })
        ));
        registry.shutdown_all_devices().unwrap();
    }
}
