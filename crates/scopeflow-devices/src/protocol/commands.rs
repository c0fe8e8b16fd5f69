/*!
 * Command ids of the general microscope command set (device group 50).
 */
use super::frame::CommandId;

/// Move the focus drive to an absolute step position
pub const Z_SET_ABSOLUTE: CommandId = CommandId::new(1);
/// Move the focus drive by a relative number of steps
pub const Z_SET_RELATIVE: CommandId = CommandId::new(2);
/// Move the focus drive at a constant signed speed (-255..=255)
pub const Z_MOVE_CONSTANT_SPEED: CommandId = CommandId::new(4);
/// Set the lamp intensity (0..=255)
pub const LAMP_SET_INTENSITY: CommandId = CommandId::new(6);
/// Read the focus drive position in steps
pub const Z_GET_POSITION: CommandId = CommandId::new(8);
/// Read the lamp intensity
pub const LAMP_GET_INTENSITY: CommandId = CommandId::new(9);
/// Read the nosepiece position (1-based, 0 while between positions)
pub const NOSEPIECE_GET_POSITION: CommandId = CommandId::new(10);
/// Leave manual (front panel) mode
pub const MANUAL_OFF: CommandId = CommandId::new(14);
/// Enter manual (front panel) mode
pub const MANUAL_ON: CommandId = CommandId::new(15);
/// Drive focus to its lower threshold
pub const Z_MOVE_TO_LOWER: CommandId = CommandId::new(16);
/// Drive focus to its upper threshold
pub const Z_MOVE_TO_UPPER: CommandId = CommandId::new(17);
/// Store the current focus position as upper threshold
pub const Z_SET_UPPER_THRESHOLD: CommandId = CommandId::new(19);
/// Identify the fitted nosepiece (0 none, 1 uncoded, 2 coded)
pub const NOSEPIECE_ID: CommandId = CommandId::new(20);
/// Read the magnification of the objective in the light path
pub const NOSEPIECE_MAGNIFICATION: CommandId = CommandId::new(21);
/// Read the firmware checksum
pub const FIRMWARE_CHECKSUM: CommandId = CommandId::new(24);
/// Read the firmware version
pub const FIRMWARE_VERSION: CommandId = CommandId::new(25);
/// Read the microscope type (not supported by every stand)
pub const MICROSCOPE_TYPE: CommandId = CommandId::new(26);
