/*!
 * The microscope stand facade.
 *
 * Owns the serial port setting and exposes what the handshake learned about
 * the stand. The port is a pre-initialization property: once the stand is
 * initialized, a change is either ignored or refused depending on the
 * configured [`PortChangePolicy`].
 */
use std::sync::Mutex;
use std::time::Duration;

use tracing::{info, warn};

use scopeflow_core::config::{HubConfig, PortChangePolicy};
use scopeflow_core::types::{Id, Value};

use crate::device::{
    BaseDevice, Device, DeviceError, DeviceEventReceiver, DeviceInfo, DeviceKind, DeviceState,
    PropertyDataType, PropertyMetadata, Result,
};
use crate::protocol::commands;
use crate::protocol::hub::SharedHub;

/// Value shown for the port before one is chosen
pub const UNDEFINED_PORT: &str = "Undefined";

const MANUAL_ON: &str = "On";
const MANUAL_OFF: &str = "Off";

/// Properties of the microscope facade
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicroscopeProperty {
    /// Serial port (pre-initialization)
    Port,
    /// Firmware version from the handshake
    FirmwareVersion,
    /// Microscope type from the handshake
    Microscope,
    /// Firmware checksum
    Checksum,
    /// Front panel control
    ManualMode,
}

impl MicroscopeProperty {
    /// All properties
    pub const ALL: [MicroscopeProperty; 5] = [
        MicroscopeProperty::Port,
        MicroscopeProperty::FirmwareVersion,
        MicroscopeProperty::Microscope,
        MicroscopeProperty::Checksum,
        MicroscopeProperty::ManualMode,
    ];

    /// Host-visible name
    pub fn name(self) -> &'static str {
        match self {
            MicroscopeProperty::Port => "Port",
            MicroscopeProperty::FirmwareVersion => "Firmware version",
            MicroscopeProperty::Microscope => "Microscope",
            MicroscopeProperty::Checksum => "Checksum",
            MicroscopeProperty::ManualMode => "Manual mode",
        }
    }

    /// Look a property up by name
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.name() == name)
    }

    fn metadata(self) -> PropertyMetadata {
        match self {
            MicroscopeProperty::Port => PropertyMetadata::new(self.name(), PropertyDataType::String)
                .with_description("Serial port the stand is connected to")
                .pre_init(),
            MicroscopeProperty::FirmwareVersion | MicroscopeProperty::Microscope | MicroscopeProperty::Checksum => {
                PropertyMetadata::new(self.name(), PropertyDataType::String).read_only()
            }
            MicroscopeProperty::ManualMode => PropertyMetadata::new(
                self.name(),
                PropertyDataType::Enum(vec![MANUAL_OFF.to_string(), MANUAL_ON.to_string()]),
            )
            .with_description("Hand control to the stand's front panel"),
        }
    }
}

/// The stand itself
#[derive(Debug)]
pub struct Microscope {
    base: BaseDevice,
    hub: SharedHub,
    policy: PortChangePolicy,
    manual: Mutex<bool>,
}

impl Microscope {
    /// Create the facade
    pub fn new(id: Id, hub: SharedHub, config: &HubConfig) -> Self {
        let properties = MicroscopeProperty::ALL.into_iter().map(MicroscopeProperty::metadata).collect();
        Self {
            base: BaseDevice::new(DeviceInfo::new(id, DeviceKind::Microscope), properties, Duration::ZERO),
            hub,
            policy: config.port_change_policy,
            manual: Mutex::new(false),
        }
    }

    /// Select the serial port
    ///
    /// After initialization, or while any device holds the hub open, the change
    /// is ignored or refused according to the port change policy; setting the
    /// current port again always succeeds.
    pub fn set_port(&self, port: &str) -> Result<()> {
        let current = self.hub.port()?;
        if current.as_deref() == Some(port) {
            return Ok(());
        }

        if self.base.is_ready() || self.hub.is_connected()? {
            return match self.policy {
                PortChangePolicy::SilentRevert => {
                    warn!(
                        "Ignoring port change to {} while the stand is connected; keeping {}",
                        port,
                        current.as_deref().unwrap_or(UNDEFINED_PORT)
                    );
                    Ok(())
                }
                PortChangePolicy::Reject => Err(DeviceError::PortChangeForbidden),
            };
        }

        self.hub.configure_port(port)?;
        self.base.publish_property_change(
            MicroscopeProperty::Port.name(),
            current.map(Value::from),
            Value::from(port),
        );
        Ok(())
    }

    /// Selected serial port
    pub fn port(&self) -> Result<Option<String>> {
        self.hub.port()
    }

    /// Firmware version reported by the stand
    pub fn firmware_version(&self) -> Result<String> {
        self.base.require_ready()?;
        self.hub.version()
    }

    /// Microscope type reported by the stand, or the default type
    pub fn microscope_type(&self) -> Result<String> {
        self.base.require_ready()?;
        self.hub.microscope()
    }

    /// Firmware checksum
    pub fn firmware_checksum(&self) -> Result<String> {
        self.base.require_ready()?;
        self.hub.query(commands::FIRMWARE_CHECKSUM)
    }

    /// Hand control to the front panel, or take it back
    pub fn set_manual_mode(&self, on: bool) -> Result<()> {
        self.base.require_ready()?;
        let command = if on { commands::MANUAL_ON } else { commands::MANUAL_OFF };
        self.hub.command(command, None)?;

        let old = std::mem::replace(&mut *self.manual.lock().unwrap_or_else(|e| e.into_inner()), on);
        if old != on {
            self.base.publish_property_change(
                MicroscopeProperty::ManualMode.name(),
                Some(Value::from(manual_label(old))),
                Value::from(manual_label(on)),
            );
        }
        Ok(())
    }

    /// Last manual mode set through this facade
    pub fn manual_mode(&self) -> bool {
        *self.manual.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn manual_label(on: bool) -> &'static str {
    if on {
        MANUAL_ON
    } else {
        MANUAL_OFF
    }
}

impl Device for Microscope {
    fn info(&self) -> &DeviceInfo {
        self.base.info()
    }

    fn state(&self) -> DeviceState {
        self.base.state()
    }

    fn initialize(&self) -> Result<()> {
        self.base.initialize_with(&self.hub, || Ok(()))?;
        let microscope = self.hub.microscope()?;
        let version = self.hub.version()?;
        info!(microscope = %microscope, version = %version, "Microscope initialized");
        Ok(())
    }

    fn shutdown(&self) -> Result<()> {
        self.base.shutdown_with(&self.hub)
    }

    fn busy(&self) -> bool {
        false
    }

    fn properties(&self) -> &[PropertyMetadata] {
        self.base.properties()
    }

    fn read(&self, property: &str) -> Result<Value> {
        let which = MicroscopeProperty::from_name(property)
            .ok_or_else(|| DeviceError::PropertyNotSupported(property.to_string()))?;
        self.base.check_readable(property)?;

        Ok(match which {
            MicroscopeProperty::Port => {
                Value::from(self.port()?.unwrap_or_else(|| UNDEFINED_PORT.to_string()))
            }
            MicroscopeProperty::FirmwareVersion => Value::from(self.firmware_version()?),
            MicroscopeProperty::Microscope => Value::from(self.microscope_type()?),
            MicroscopeProperty::Checksum => Value::from(self.firmware_checksum()?),
            MicroscopeProperty::ManualMode => Value::from(manual_label(self.manual_mode())),
        })
    }

    fn write(&self, property: &str, value: Value) -> Result<()> {
        let which = MicroscopeProperty::from_name(property)
            .ok_or_else(|| DeviceError::PropertyNotSupported(property.to_string()))?;
        self.base.check_writable(property, &value)?;

        match (which, value.as_str()) {
            (MicroscopeProperty::Port, Some(port)) => self.set_port(port),
            (MicroscopeProperty::ManualMode, Some(mode)) => self.set_manual_mode(mode == MANUAL_ON),
            _ => Err(DeviceError::PermissionDenied(format!(
                "Property {} is read-only",
                property
            ))),
        }
    }

    fn subscribe_events(&self) -> Result<DeviceEventReceiver> {
        self.base.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use scopeflow_core::config::LampConfig;

    use crate::devices::lamp::Lamp;
    use crate::protocol::hub::CommandHub;
    use crate::protocol::simulator::{SimulatedPorts, SimulatedStand};

    fn microscope(policy: PortChangePolicy) -> (Microscope, SimulatedStand) {
        let stand = SimulatedStand::new().with_version("1.3");
        let ports = SimulatedPorts::new()
            .with_port("COM7", stand.clone())
            .with_port("COM8", SimulatedStand::new());
        let hub = SharedHub::new(CommandHub::new(Arc::new(ports)));
        let config = HubConfig {
            port_change_policy: policy,
            ..HubConfig::default()
        };
        (Microscope::new("scope".into(), hub, &config), stand)
    }

    #[test]
    fn test_port_is_pre_init() {
        let (scope, _) = microscope(PortChangePolicy::SilentRevert);
        assert_eq!(scope.read("Port").unwrap(), Value::from(UNDEFINED_PORT));
        assert!(matches!(scope.initialize(), Err(DeviceError::PortNotSet)));
        assert_eq!(scope.state(), DeviceState::Error);

        scope.write("Port", Value::from("COM7")).unwrap();
        assert!(matches!(scope.read("Firmware version"), Err(DeviceError::NotInitialized(_))));
        scope.initialize().unwrap();
        assert_eq!(scope.read("Firmware version").unwrap(), Value::from("1.3"));
        assert_eq!(scope.read("Microscope").unwrap(), Value::from("DMRXA"));
    }

    #[test]
    fn test_port_change_silently_reverted() {
        let (scope, _) = microscope(PortChangePolicy::SilentRevert);
        scope.set_port("COM7").unwrap();
        scope.initialize().unwrap();

        scope.write("Port", Value::from("COM8")).unwrap();
        assert_eq!(scope.read("Port").unwrap(), Value::from("COM7"));
    }

    #[test]
    fn test_port_change_rejected() {
        let (scope, _) = microscope(PortChangePolicy::Reject);
        scope.set_port("COM7").unwrap();
        scope.initialize().unwrap();

        assert!(matches!(scope.set_port("COM8"), Err(DeviceError::PortChangeForbidden)));
        assert!(scope.set_port("COM7").is_ok());
        assert_eq!(scope.port().unwrap().as_deref(), Some("COM7"));
    }

    #[test]
    fn test_port_change_allowed_after_shutdown() {
        let (scope, _) = microscope(PortChangePolicy::Reject);
        scope.set_port("COM7").unwrap();
        scope.initialize().unwrap();
        scope.shutdown().unwrap();

        scope.set_port("COM8").unwrap();
        assert_eq!(scope.port().unwrap().as_deref(), Some("COM8"));
    }

    fn shared_with_lamp(
        policy: PortChangePolicy,
    ) -> (Microscope, Lamp, SimulatedStand, Arc<SimulatedPorts>) {
        let spare = SimulatedStand::new();
        let ports = Arc::new(
            SimulatedPorts::new()
                .with_port("COM7", SimulatedStand::new())
                .with_port("COM8", spare.clone()),
        );
        let hub = SharedHub::new(CommandHub::new(ports.clone()));
        let config = HubConfig {
            port_change_policy: policy,
            ..HubConfig::default()
        };
        let scope = Microscope::new("scope".into(), hub.clone(), &config);
        let lamp = Lamp::new("lamp".into(), hub, &LampConfig::default());
        (scope, lamp, spare, ports)
    }

    #[test]
    fn test_port_change_ignored_while_lamp_holds_hub() {
        let (scope, lamp, spare, ports) = shared_with_lamp(PortChangePolicy::SilentRevert);
        scope.set_port("COM7").unwrap();
        lamp.initialize().unwrap();
        assert_eq!(scope.state(), DeviceState::Uninitialized);

        scope.write("Port", Value::from("COM8")).unwrap();
        assert_eq!(scope.port().unwrap().as_deref(), Some("COM7"));

        lamp.set_open(true).unwrap();
        assert!(spare.written_frames().is_empty());
        assert_eq!(ports.opened(), vec!["COM7"]);
    }

    #[test]
    fn test_port_change_rejected_while_lamp_holds_hub() {
        let (scope, lamp, spare, ports) = shared_with_lamp(PortChangePolicy::Reject);
        scope.set_port("COM7").unwrap();
        lamp.initialize().unwrap();

        assert!(matches!(scope.set_port("COM8"), Err(DeviceError::PortChangeForbidden)));
        lamp.set_intensity(10).unwrap();
        lamp.set_open(true).unwrap();
        assert!(spare.written_frames().is_empty());
        assert_eq!(ports.opened(), vec!["COM7"]);

        lamp.shutdown().unwrap();
        scope.set_port("COM8").unwrap();
        assert_eq!(scope.port().unwrap().as_deref(), Some("COM8"));
    }

    #[test]
    fn test_manual_mode_and_checksum() {
        let (scope, stand) = microscope(PortChangePolicy::SilentRevert);
        scope.set_port("COM7").unwrap();
        scope.initialize().unwrap();

        scope.write("Manual mode", Value::from("On")).unwrap();
        assert!(stand.manual_mode());
        assert_eq!(scope.read("Manual mode").unwrap(), Value::from("On"));
        scope.set_manual_mode(false).unwrap();
        assert!(!stand.manual_mode());

        assert_eq!(scope.read("Checksum").unwrap(), Value::from("A5C3"));
        assert!(matches!(
            scope.write("Microscope", Value::from("DMRB")),
            Err(DeviceError::PermissionDenied(_))
        ));
    }
}
