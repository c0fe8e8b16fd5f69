/*!
 * Objective nosepiece (turret) facade.
 *
 * The stand numbers positions from 1 and reports 0 while the turret sits
 * between detents. The facade exposes 0-based indices to the host. Moving the
 * turret needs a set command that the general command set does not define;
 * it comes from configuration, and without it the turret is read-only.
 */
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, info};

use scopeflow_core::config::NosepieceConfig;
use scopeflow_core::types::{Id, Value};

use crate::device::{
    BaseDevice, Device, DeviceError, DeviceEventReceiver, DeviceInfo, DeviceKind, DeviceState,
    PropertyDataType, PropertyMetadata, Result,
};
use crate::protocol::commands;
use crate::protocol::frame::CommandId;
use crate::protocol::hub::SharedHub;

/// Nosepiece id reported when no nosepiece is fitted
pub const NO_NOSEPIECE: i32 = 0;

/// Position reported while the turret is between detents
pub const BETWEEN_POSITIONS: i32 = 0;

/// Properties of the nosepiece facade
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NosepieceProperty {
    /// 0-based objective index
    State,
    /// Magnification of the current objective
    Label,
}

impl NosepieceProperty {
    /// All properties
    pub const ALL: [NosepieceProperty; 2] = [NosepieceProperty::State, NosepieceProperty::Label];

    /// Host-visible name
    pub fn name(self) -> &'static str {
        match self {
            NosepieceProperty::State => "State",
            NosepieceProperty::Label => "Label",
        }
    }

    /// Look a property up by name
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.name() == name)
    }

    fn metadata(self, positions: usize, movable: bool) -> PropertyMetadata {
        match self {
            NosepieceProperty::State => {
                let last = i64::try_from(positions.saturating_sub(1)).unwrap_or(i64::MAX);
                let metadata = PropertyMetadata::new(self.name(), PropertyDataType::Integer)
                    .with_limits(0, last);
                if movable {
                    metadata
                } else {
                    metadata.read_only()
                }
            }
            NosepieceProperty::Label => {
                PropertyMetadata::new(self.name(), PropertyDataType::String).read_only()
            }
        }
    }
}

/// The objective turret
#[derive(Debug)]
pub struct Nosepiece {
    base: BaseDevice,
    hub: SharedHub,
    positions: usize,
    set_command: Option<CommandId>,
    position: Mutex<usize>,
}

impl Nosepiece {
    /// Create the facade
    pub fn new(id: Id, hub: SharedHub, config: &NosepieceConfig) -> Result<Self> {
        if config.positions == 0 {
            return Err(DeviceError::ConfigurationError(
                "Nosepiece needs at least one position".to_string(),
            ));
        }
        let set_command = config
            .set_position_command
            .map(|cmd| {
                CommandId::try_new(cmd).ok_or_else(|| {
                    DeviceError::ConfigurationError(format!(
                        "Nosepiece command {} does not fit in three digits",
                        cmd
                    ))
                })
            })
            .transpose()?;

        let properties = NosepieceProperty::ALL
            .into_iter()
            .map(|p| p.metadata(config.positions, set_command.is_some()))
            .collect();
        Ok(Self {
            base: BaseDevice::new(
                DeviceInfo::new(id, DeviceKind::Nosepiece),
                properties,
                Duration::ZERO,
            ),
            hub,
            positions: config.positions,
            set_command,
            position: Mutex::new(0),
        })
    }

    fn cached(&self) -> MutexGuard<'_, usize> {
        self.position.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of objective positions
    pub fn positions(&self) -> usize {
        self.positions
    }

    /// Whether the turret can be moved over the serial line
    pub fn is_movable(&self) -> bool {
        self.set_command.is_some()
    }

    fn read_hardware_position(&self) -> Result<usize> {
        let reported = self.hub.query_int(commands::NOSEPIECE_GET_POSITION)?;
        if reported == BETWEEN_POSITIONS {
            return Err(DeviceError::InvalidPosition(
                "Objective nosepiece reports an invalid position. Is it clicked into position correctly?"
                    .to_string(),
            ));
        }
        reported
            .checked_sub(1)
            .and_then(|index| usize::try_from(index).ok())
            .ok_or_else(|| DeviceError::InvalidPayload(format!("Nosepiece position {}", reported)))
    }

    /// Current 0-based objective index
    pub fn position(&self) -> Result<usize> {
        self.base.require_ready()?;
        let index = self.read_hardware_position()?;
        *self.cached() = index;
        Ok(index)
    }

    /// Turn to an objective; out-of-range indices are clamped
    pub fn set_position(&self, index: usize) -> Result<()> {
        self.base.require_ready()?;
        let command = self.set_command.ok_or_else(|| {
            DeviceError::CommandCannotExecute(
                "No command for moving the objective nosepiece is configured".to_string(),
            )
        })?;

        let target = index.min(self.positions - 1);
        let mut cached = self.cached();
        if *cached == target {
            return Ok(());
        }

        let device_position = i32::try_from(target + 1)
            .map_err(|_| DeviceError::InvalidPosition(format!("Position {}", target)))?;
        self.hub.command(command, Some(device_position))?;
        let old = std::mem::replace(&mut *cached, target);
        drop(cached);

        debug!(from = old, to = target, "Nosepiece moved");
        self.base.publish_property_change(
            NosepieceProperty::State.name(),
            Some(Value::from(old)),
            Value::from(target),
        );
        Ok(())
    }

    /// Magnification of the current objective, e.g. "40x"
    pub fn label(&self) -> Result<String> {
        self.base.require_ready()?;
        let magnification = self.hub.query_int(commands::NOSEPIECE_MAGNIFICATION)?;
        Ok(format!("{}x", magnification))
    }
}

impl Device for Nosepiece {
    fn info(&self) -> &DeviceInfo {
        self.base.info()
    }

    fn state(&self) -> DeviceState {
        self.base.state()
    }

    fn initialize(&self) -> Result<()> {
        self.base.initialize_with(&self.hub, || {
            let id = self.hub.query_int(commands::NOSEPIECE_ID)?;
            if id == NO_NOSEPIECE {
                return Err(DeviceError::DeviceNotFound(
                    "No objective nosepiece in this microscope".to_string(),
                ));
            }
            let index = self.read_hardware_position()?;
            *self.cached() = index;
            info!(id, position = index, "Objective nosepiece found");
            Ok(())
        })
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
        let which = NosepieceProperty::from_name(property)
            .ok_or_else(|| DeviceError::PropertyNotSupported(property.to_string()))?;
        self.base.check_readable(property)?;

        Ok(match which {
            NosepieceProperty::State => Value::from(self.position()?),
            NosepieceProperty::Label => Value::from(self.label()?),
        })
    }

    fn write(&self, property: &str, value: Value) -> Result<()> {
        let which = NosepieceProperty::from_name(property)
            .ok_or_else(|| DeviceError::PropertyNotSupported(property.to_string()))?;
        self.base.check_writable(property, &value)?;

        match (which, value.as_integer()) {
            (NosepieceProperty::State, Some(index)) => {
                self.set_position(usize::try_from(index).unwrap_or(0))
            }
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

    use crate::protocol::hub::CommandHub;
    use crate::protocol::simulator::{SimulatedPorts, SimulatedStand};

    const SET_POSITION: u16 = 12;

    fn nosepiece_with(stand: &SimulatedStand, config: &NosepieceConfig) -> Nosepiece {
        let ports = SimulatedPorts::new().with_port("COM7", stand.clone());
        let mut hub = CommandHub::new(Arc::new(ports));
        hub.configure_port("COM7").unwrap();
        Nosepiece::new("turret".into(), SharedHub::new(hub), config).unwrap()
    }

    fn movable() -> NosepieceConfig {
        NosepieceConfig {
            set_position_command: Some(SET_POSITION),
            ..NosepieceConfig::default()
        }
    }

    #[test]
    fn test_position_sentinel() {
        let stand = SimulatedStand::new();
        let turret = nosepiece_with(&stand, &NosepieceConfig::default());
        turret.initialize().unwrap();

        assert_eq!(turret.position().unwrap(), 0);
        stand.set_nosepiece_position(4);
        assert_eq!(turret.read("State").unwrap(), Value::Integer(3));

        stand.set_nosepiece_position(0);
        assert!(matches!(turret.position(), Err(DeviceError::InvalidPosition(_))));
    }

    #[test]
    fn test_out_of_range_position_is_invalid_payload() {
        let stand = SimulatedStand::new();
        let turret = nosepiece_with(&stand, &NosepieceConfig::default());
        turret.initialize().unwrap();

        for reported in [i32::MIN, -1] {
            stand.set_nosepiece_position(reported);
            assert!(
                matches!(turret.position(), Err(DeviceError::InvalidPayload(_))),
                "position {}",
                reported
            );
        }
        stand.set_nosepiece_position(2);
        assert_eq!(turret.position().unwrap(), 1);
    }

    #[test]
    fn test_missing_nosepiece() {
        let stand = SimulatedStand::new().with_nosepiece_id(0);
        let turret = nosepiece_with(&stand, &NosepieceConfig::default());

        assert!(matches!(turret.initialize(), Err(DeviceError::DeviceNotFound(_))));
        assert_eq!(turret.state(), DeviceState::Error);
    }

    #[test]
    fn test_initialize_between_positions_fails() {
        let stand = SimulatedStand::new();
        stand.set_nosepiece_position(0);
        let turret = nosepiece_with(&stand, &NosepieceConfig::default());

        assert!(matches!(turret.initialize(), Err(DeviceError::InvalidPosition(_))));
    }

    #[test]
    fn test_label_shows_magnification() {
        let stand = SimulatedStand::new();
        let turret = nosepiece_with(&stand, &NosepieceConfig::default());
        turret.initialize().unwrap();

        assert_eq!(turret.label().unwrap(), "5x");
        stand.set_nosepiece_position(4);
        assert_eq!(turret.read("Label").unwrap(), Value::from("40x"));
    }

    #[test]
    fn test_read_only_without_set_command() {
        let stand = SimulatedStand::new();
        let turret = nosepiece_with(&stand, &NosepieceConfig::default());
        turret.initialize().unwrap();

        assert!(!turret.is_movable());
        assert!(matches!(
            turret.set_position(2),
            Err(DeviceError::CommandCannotExecute(_))
        ));
        assert!(matches!(
            turret.write("State", Value::Integer(2)),
            Err(DeviceError::PermissionDenied(_))
        ));
    }

    #[test]
    fn test_set_position_sends_one_based() {
        let stand =
            SimulatedStand::new().with_set_position_command(CommandId::new(SET_POSITION));
        let turret = nosepiece_with(&stand, &movable());
        turret.initialize().unwrap();
        stand.clear_written();

        turret.set_position(3).unwrap();
        assert_eq!(stand.written_frames(), vec!["500124"]);
        assert_eq!(stand.nosepiece_position(), 4);
        assert_eq!(turret.position().unwrap(), 3);
    }

    #[test]
    fn test_set_position_clamps_and_skips_unchanged() {
        let stand =
            SimulatedStand::new().with_set_position_command(CommandId::new(SET_POSITION));
        let turret = nosepiece_with(&stand, &movable());
        turret.initialize().unwrap();
        stand.clear_written();

        turret.set_position(0).unwrap();
        assert!(stand.written_frames().is_empty());

        turret.set_position(42).unwrap();
        assert_eq!(stand.written_frames(), vec!["500127"]);
        assert_eq!(stand.nosepiece_position(), 7);
    }

    #[test]
    fn test_invalid_set_command_rejected() {
        let ports = SimulatedPorts::new();
        let hub = SharedHub::new(CommandHub::new(Arc::new(ports)));
        let config = NosepieceConfig {
            set_position_command: Some(1000),
            ..NosepieceConfig::default()
        };
        assert!(matches!(
            Nosepiece::new("turret".into(), hub, &config),
            Err(DeviceError::ConfigurationError(_))
        ));
    }
}
