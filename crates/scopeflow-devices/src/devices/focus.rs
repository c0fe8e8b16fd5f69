/*!
 * Motorized focus (Z) drive facade.
 *
 * Positions are absolute drive steps converted to micrometers with a fixed
 * step size. The stand also keeps an upper threshold that its own display is
 * relative to; the facade can move that threshold to the current position but
 * does not report positions relative to it.
 */
use std::time::Duration;

use tracing::debug;

use scopeflow_core::config::FocusConfig;
use scopeflow_core::types::{Id, Value};

use crate::device::{
    BaseDevice, Device, DeviceError, DeviceEventReceiver, DeviceInfo, DeviceKind, DeviceState,
    PropertyDataType, PropertyMetadata, Result,
};
use crate::devices::units::{max_focus_speed, speed_to_speed_number, steps_to_um, um_to_steps};
use crate::protocol::commands;
use crate::protocol::frame::CommandId;
use crate::protocol::hub::SharedHub;

const THRESHOLD_SET: &str = "Set";
const THRESHOLD_UPDATE: &str = "Update";

/// What to do with the drive's upper threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdAction {
    /// Leave the threshold where it is
    Keep,
    /// Move the threshold to the current position
    Update,
}

/// Properties of the focus facade
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusProperty {
    /// Upper threshold action
    Threshold,
    /// Drive step size in µm
    StepSize,
}

impl FocusProperty {
    /// All properties
    pub const ALL: [FocusProperty; 2] = [FocusProperty::Threshold, FocusProperty::StepSize];

    /// Host-visible name
    pub fn name(self) -> &'static str {
        match self {
            FocusProperty::Threshold => "Threshold",
            FocusProperty::StepSize => "Step size",
        }
    }

    /// Look a property up by name
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.name() == name)
    }

    fn metadata(self) -> PropertyMetadata {
        match self {
            FocusProperty::Threshold => PropertyMetadata::new(
                self.name(),
                PropertyDataType::Enum(vec![THRESHOLD_SET.to_string(), THRESHOLD_UPDATE.to_string()]),
            )
            .with_description("Update moves the upper threshold to the current position"),
            FocusProperty::StepSize => PropertyMetadata::new(self.name(), PropertyDataType::Float)
                .with_unit("µm")
                .read_only(),
        }
    }
}

/// The focus drive
#[derive(Debug)]
pub struct FocusDrive {
    base: BaseDevice,
    hub: SharedHub,
    step_size_um: f64,
    lower_limit_um: f64,
    upper_limit_um: f64,
}

impl FocusDrive {
    /// Create the facade
    pub fn new(id: Id, hub: SharedHub, config: &FocusConfig) -> Self {
        let properties = FocusProperty::ALL.into_iter().map(FocusProperty::metadata).collect();
        Self {
            base: BaseDevice::new(
                DeviceInfo::new(id, DeviceKind::FocusDrive),
                properties,
                Duration::from_millis(config.settle_delay_ms),
            ),
            hub,
            step_size_um: config.step_size_um,
            lower_limit_um: config.lower_limit_um,
            upper_limit_um: config.upper_limit_um,
        }
    }

    /// Step size in µm
    pub fn step_size_um(&self) -> f64 {
        self.step_size_um
    }

    /// Travel limits in µm, lower first
    pub fn limits(&self) -> (f64, f64) {
        (self.lower_limit_um, self.upper_limit_um)
    }

    fn moved(&self, command: CommandId, data: Option<i32>) -> Result<()> {
        self.base.require_ready()?;
        self.hub.command(command, data)?;
        self.base.mark_changed();
        Ok(())
    }

    /// Move to an absolute position in steps
    pub fn set_position_steps(&self, steps: i32) -> Result<()> {
        debug!(steps, "Focus absolute move");
        self.moved(commands::Z_SET_ABSOLUTE, Some(steps))
    }

    /// Move by a number of steps
    pub fn set_relative_position_steps(&self, steps: i32) -> Result<()> {
        debug!(steps, "Focus relative move");
        self.moved(commands::Z_SET_RELATIVE, Some(steps))
    }

    /// Current position in steps
    pub fn position_steps(&self) -> Result<i32> {
        self.base.require_ready()?;
        self.hub.query_int(commands::Z_GET_POSITION)
    }

    /// Move to an absolute position in µm (truncated to whole steps)
    pub fn set_position_um(&self, um: f64) -> Result<()> {
        self.set_position_steps(um_to_steps(um, self.step_size_um))
    }

    /// Move by a distance in µm (truncated to whole steps)
    pub fn set_relative_position_um(&self, um: f64) -> Result<()> {
        self.set_relative_position_steps(um_to_steps(um, self.step_size_um))
    }

    /// Current position in µm
    pub fn position_um(&self) -> Result<f64> {
        Ok(steps_to_um(self.position_steps()?, self.step_size_um))
    }

    /// Accepted for compatibility; the drive keeps its own zero
    pub fn set_origin(&self) -> Result<()> {
        self.base.require_ready()
    }

    /// Apply a threshold action
    pub fn set_threshold(&self, action: ThresholdAction) -> Result<()> {
        self.base.require_ready()?;
        if action == ThresholdAction::Update {
            self.hub.command(commands::Z_SET_UPPER_THRESHOLD, None)?;
            debug!("Focus upper threshold moved to current position");
        }
        Ok(())
    }

    /// Drive to the lower end of travel
    pub fn move_to_lower_limit(&self) -> Result<()> {
        self.moved(commands::Z_MOVE_TO_LOWER, None)
    }

    /// Drive to the upper end of travel
    pub fn move_to_upper_limit(&self) -> Result<()> {
        self.moved(commands::Z_MOVE_TO_UPPER, None)
    }

    /// Start moving at a constant speed in µm/s; negative moves down, zero stops
    pub fn move_at_speed(&self, um_per_s: f64) -> Result<()> {
        self.base.require_ready()?;
        let max_speed = max_focus_speed(&self.hub.microscope()?);
        let number = speed_to_speed_number(um_per_s, max_speed);
        debug!(um_per_s, number, "Focus constant speed move");
        self.moved(commands::Z_MOVE_CONSTANT_SPEED, Some(number))
    }
}

impl Device for FocusDrive {
    fn info(&self) -> &DeviceInfo {
        self.base.info()
    }

    fn state(&self) -> DeviceState {
        self.base.state()
    }

    fn initialize(&self) -> Result<()> {
        self.base.initialize_with(&self.hub, || {
            let steps = self.hub.query_int(commands::Z_GET_POSITION)?;
            debug!(steps, "Focus position read from stand");
            Ok(())
        })
    }

    fn shutdown(&self) -> Result<()> {
        self.base.shutdown_with(&self.hub)
    }

    fn busy(&self) -> bool {
        self.base.busy()
    }

    fn properties(&self) -> &[PropertyMetadata] {
        self.base.properties()
    }

    fn read(&self, property: &str) -> Result<Value> {
        let which = FocusProperty::from_name(property)
            .ok_or_else(|| DeviceError::PropertyNotSupported(property.to_string()))?;
        self.base.check_readable(property)?;

        Ok(match which {
            FocusProperty::Threshold => Value::from(THRESHOLD_SET),
            FocusProperty::StepSize => Value::from(self.step_size_um),
        })
    }

    fn write(&self, property: &str, value: Value) -> Result<()> {
        let which = FocusProperty::from_name(property)
            .ok_or_else(|| DeviceError::PropertyNotSupported(property.to_string()))?;
        self.base.check_writable(property, &value)?;

        match which {
            FocusProperty::Threshold => {
                let action = if value.as_str() == Some(THRESHOLD_UPDATE) {
                    ThresholdAction::Update
                } else {
                    ThresholdAction::Keep
                };
                self.set_threshold(action)
            }
            FocusProperty::StepSize => Err(DeviceError::PermissionDenied(format!(
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

    fn focus_on(stand: &SimulatedStand) -> FocusDrive {
        let ports = SimulatedPorts::new().with_port("COM7", stand.clone());
        let mut hub = CommandHub::new(Arc::new(ports));
        hub.configure_port("COM7").unwrap();
        let focus = FocusDrive::new("z".into(), SharedHub::new(hub), &FocusConfig::default());
        focus.initialize().unwrap();
        stand.clear_written();
        focus
    }

    #[test]
    fn test_absolute_move_in_um() {
        let stand = SimulatedStand::new();
        let focus = focus_on(&stand);

        focus.set_position_um(1000.0).unwrap();
        assert_eq!(stand.written_frames(), vec!["5000110000"]);
        assert_eq!(stand.z_steps(), 10000);
        assert!((focus.position_um().unwrap() - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn test_relative_move_truncates() {
        let stand = SimulatedStand::new();
        let focus = focus_on(&stand);

        focus.set_position_steps(500).unwrap();
        focus.set_relative_position_um(-12.34).unwrap();
        assert_eq!(stand.frames_starting_with("50002"), vec!["50002-123"]);
        assert_eq!(focus.position_steps().unwrap(), 377);
    }

    #[test]
    fn test_threshold_update() {
        let stand = SimulatedStand::new();
        let focus = focus_on(&stand);

        focus.set_position_steps(4200).unwrap();
        focus.write("Threshold", Value::from("Set")).unwrap();
        assert!(stand.frames_starting_with("50019").is_empty());

        focus.write("Threshold", Value::from("Update")).unwrap();
        assert_eq!(stand.z_upper_threshold(), 4200);
        assert_eq!(focus.read("Threshold").unwrap(), Value::from("Set"));
    }

    #[test]
    fn test_travel_limits() {
        let stand = SimulatedStand::new();
        let focus = focus_on(&stand);

        focus.move_to_upper_limit().unwrap();
        assert_eq!(stand.z_steps(), 250_000);
        focus.move_to_lower_limit().unwrap();
        assert_eq!(stand.z_steps(), 0);
        assert_eq!(focus.limits(), (0.0, 25000.0));
    }

    #[test]
    fn test_constant_speed_scaled_per_stand() {
        let fast = SimulatedStand::new();
        let focus = focus_on(&fast);
        focus.move_at_speed(2350.0).unwrap();
        assert_eq!(fast.z_speed(), 127);

        let slow = SimulatedStand::new().without_microscope_query();
        let focus = focus_on(&slow);
        focus.move_at_speed(-5000.0).unwrap();
        assert_eq!(slow.z_speed(), -255);
    }

    #[test]
    fn test_step_size_is_read_only() {
        let stand = SimulatedStand::new();
        let focus = focus_on(&stand);

        assert_eq!(focus.read("Step size").unwrap(), Value::Float(0.1));
        assert!(matches!(
            focus.write("Step size", Value::Float(0.5)),
            Err(DeviceError::PermissionDenied(_))
        ));
    }

    #[test]
    fn test_failed_move_is_not_busy() {
        let stand = SimulatedStand::new();
        let ports = SimulatedPorts::new().with_port("COM7", stand.clone());
        let mut hub = CommandHub::new(Arc::new(ports));
        hub.configure_port("COM7").unwrap();
        let config = FocusConfig {
            settle_delay_ms: 1000,
            ..FocusConfig::default()
        };
        let focus = FocusDrive::new("z".into(), SharedHub::new(hub), &config);
        focus.initialize().unwrap();

        stand.drop_answers(1);
        assert!(matches!(focus.set_position_um(10.0), Err(DeviceError::NoAnswer(_))));
        assert!(!focus.busy());

        focus.set_position_um(10.0).unwrap();
        assert!(focus.busy());
    }
}
