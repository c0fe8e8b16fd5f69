/*!
 * Sub-device facades of the microscope stand.
 */

pub mod focus;
pub mod lamp;
pub mod microscope;
pub mod nosepiece;
pub mod units;

pub use focus::{FocusDrive, FocusProperty, ThresholdAction};
pub use lamp::{Lamp, LampProperty};
pub use microscope::{Microscope, MicroscopeProperty};
pub use nosepiece::{Nosepiece, NosepieceProperty};
