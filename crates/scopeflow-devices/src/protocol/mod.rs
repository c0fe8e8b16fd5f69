/*!
 * Serial command protocol engine.
 *
 * Leaf first: [`transport`] is the boundary to the physical line, [`frame`]
 * encodes and validates frames, and [`hub`] serializes all traffic to one
 * stand. [`simulator`] stands in for the hardware in tests and demos.
 */

pub mod commands;
pub mod frame;
pub mod hub;
pub mod simulator;
pub mod transport;

pub use frame::{CommandId, DeviceGroup, Payload, ProtocolError};
pub use hub::{CommandHub, ConnectionState, SharedHub};
pub use simulator::{SimulatedPorts, SimulatedStand};
pub use transport::{PortProvider, Transport};

#[cfg(feature = "serial")]
pub use transport::{SerialPortProvider, SerialTransport};
