/*!
 * In-process stand simulator.
 *
 * `SimulatedStand` implements [`Transport`] by interpreting the frames written
 * to it the way a stand running the general microscope command set would, and
 * queueing the answer bytes for the next read. It records every frame it
 * receives and can drop or corrupt answers, or leave stale bytes in the
 * receive buffer, to exercise the hub's failure paths.
 *
 * Handles are cheap clones sharing one state, so a test can keep a handle
 * after giving another to the hub.
 */
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::trace;

use super::commands;
use super::frame::{encode_query, CommandId, DeviceGroup, PREFIX_LEN};
use super::transport::{PortProvider, Transport};

const DEFAULT_VERSION: &str = "03.08";
const DEFAULT_MICROSCOPE: &str = "DMRXA";
const DEFAULT_CHECKSUM: &str = "A5C3";
const DEFAULT_MAGNIFICATIONS: [i32; 7] = [5, 10, 20, 40, 63, 100, 0];
const DEFAULT_UPPER_STEPS: i32 = 250_000;

#[derive(Debug)]
struct StandState {
    group: DeviceGroup,
    version: String,
    microscope: Option<String>,
    checksum: String,
    z_steps: i32,
    z_lower: i32,
    z_upper: i32,
    z_speed: i32,
    lamp_intensity: i32,
    manual: bool,
    nosepiece_id: i32,
    nosepiece_position: i32,
    magnifications: Vec<i32>,
    set_position_command: Option<CommandId>,
    rx: VecDeque<u8>,
    written: Vec<String>,
    drop_answers: usize,
    corrupt_answers: usize,
}

impl Default for StandState {
    fn default() -> Self {
        Self {
            group: DeviceGroup::GENERAL_MICROSCOPE,
            version: DEFAULT_VERSION.to_string(),
            microscope: Some(DEFAULT_MICROSCOPE.to_string()),
            checksum: DEFAULT_CHECKSUM.to_string(),
            z_steps: 0,
            z_lower: 0,
            z_upper: DEFAULT_UPPER_STEPS,
            z_speed: 0,
            lamp_intensity: 0,
            manual: false,
            nosepiece_id: 2,
            nosepiece_position: 1,
            magnifications: DEFAULT_MAGNIFICATIONS.to_vec(),
            set_position_command: None,
            rx: VecDeque::new(),
            written: Vec::new(),
            drop_answers: 0,
            corrupt_answers: 0,
        }
    }
}

impl StandState {
    /// Interpret one frame; `None` means the stand stays silent
    fn answer(&mut self, frame: &str) -> Option<String> {
        let group: u8 = frame.get(0..2)?.parse().ok()?;
        let command: u16 = frame.get(2..PREFIX_LEN)?.parse().ok()?;
        if group != self.group.get() {
            return None;
        }
        let data: Option<i32> = frame.get(PREFIX_LEN..).and_then(|d| d.parse().ok());
        let command = CommandId::try_new(command)?;

        let payload = match command {
            commands::Z_SET_ABSOLUTE => {
                self.z_steps = data?.clamp(self.z_lower, self.z_upper);
                String::new()
            }
            commands::Z_SET_RELATIVE => {
                self.z_steps = self.z_steps.saturating_add(data?).clamp(self.z_lower, self.z_upper);
                String::new()
            }
            commands::Z_MOVE_CONSTANT_SPEED => {
                self.z_speed = data?;
                String::new()
            }
            commands::LAMP_SET_INTENSITY => {
                self.lamp_intensity = data?.clamp(0, 255);
                String::new()
            }
            commands::Z_GET_POSITION => self.z_steps.to_string(),
            commands::LAMP_GET_INTENSITY => self.lamp_intensity.to_string(),
            commands::NOSEPIECE_GET_POSITION => self.nosepiece_position.to_string(),
            commands::MANUAL_OFF => {
                self.manual = false;
                String::new()
            }
            commands::MANUAL_ON => {
                self.manual = true;
                String::new()
            }
            commands::Z_MOVE_TO_LOWER => {
                self.z_steps = self.z_lower;
                String::new()
            }
            commands::Z_MOVE_TO_UPPER => {
                self.z_steps = self.z_upper;
                String::new()
            }
            commands::Z_SET_UPPER_THRESHOLD => {
                self.z_upper = self.z_steps;
                String::new()
            }
            commands::NOSEPIECE_ID => self.nosepiece_id.to_string(),
            commands::NOSEPIECE_MAGNIFICATION => {
                self.nosepiece_position
                    .checked_sub(1)
                    .and_then(|i| usize::try_from(i).ok())
                    .and_then(|i| self.magnifications.get(i))
                    .copied()
                    .unwrap_or(0)
                    .to_string()
            }
            commands::FIRMWARE_CHECKSUM => self.checksum.clone(),
            commands::FIRMWARE_VERSION => self.version.clone(),
            commands::MICROSCOPE_TYPE => self.microscope.clone()?,
            other if Some(other) == self.set_position_command => {
                let position = data?;
                if position >= 1 && position as usize <= self.magnifications.len() {
                    self.nosepiece_position = position;
                }
                String::new()
            }
            _ => String::new(),
        };

        let echoed = if self.corrupt_answers > 0 {
            self.corrupt_answers -= 1;
            CommandId::new((command.get() + 1) % 1000)
        } else {
            command
        };

        Some(format!("{}{}", encode_query(self.group, echoed), payload))
    }
}

/// A simulated stand reachable through the [`Transport`] trait
#[derive(Debug, Clone, Default)]
pub struct SimulatedStand {
    state: Arc<Mutex<StandState>>,
}

impl SimulatedStand {
    /// Create a stand with a coded seven-position nosepiece and the type query supported
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, StandState> {
        // A panic while holding the lock only happens inside a failing test
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Firmware version string reported by query 25
    pub fn with_version(self, version: &str) -> Self {
        self.state().version = version.to_string();
        self
    }

    /// Microscope type reported by query 26
    pub fn with_microscope(self, microscope: &str) -> Self {
        self.state().microscope = Some(microscope.to_string());
        self
    }

    /// Make the stand ignore the microscope type query, as older firmware does
    pub fn without_microscope_query(self) -> Self {
        self.state().microscope = None;
        self
    }

    /// Nosepiece id reported by query 20
    pub fn with_nosepiece_id(self, id: i32) -> Self {
        self.state().nosepiece_id = id;
        self
    }

    /// Objective magnifications, one per nosepiece position
    pub fn with_magnifications(self, magnifications: &[i32]) -> Self {
        self.state().magnifications = magnifications.to_vec();
        self
    }

    /// Accept `command` as "move nosepiece to position" (1-based payload)
    pub fn with_set_position_command(self, command: CommandId) -> Self {
        self.state().set_position_command = Some(command);
        self
    }

    /// Lamp intensity the stand powers up with
    pub fn with_lamp_intensity(self, intensity: i32) -> Self {
        self.state().lamp_intensity = intensity;
        self
    }

    /// Stay silent for the next `count` frames
    pub fn drop_answers(&self, count: usize) {
        self.state().drop_answers = count;
    }

    /// Echo the wrong command id in the next `count` answers
    pub fn corrupt_answers(&self, count: usize) {
        self.state().corrupt_answers = count;
    }

    /// Leave bytes in the receive buffer as if a late answer had arrived
    pub fn inject_stale(&self, bytes: &[u8]) {
        self.state().rx.extend(bytes.iter().copied());
    }

    /// Bytes waiting to be read
    pub fn pending_bytes(&self) -> usize {
        self.state().rx.len()
    }

    /// Every frame written so far, without terminators
    pub fn written_frames(&self) -> Vec<String> {
        self.state().written.clone()
    }

    /// Frames written so far that start with `prefix`
    pub fn frames_starting_with(&self, prefix: &str) -> Vec<String> {
        self.state()
            .written
            .iter()
            .filter(|f| f.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Forget the recorded frames
    pub fn clear_written(&self) {
        self.state().written.clear();
    }

    /// Focus position in steps
    pub fn z_steps(&self) -> i32 {
        self.state().z_steps
    }

    /// Upper focus threshold in steps
    pub fn z_upper_threshold(&self) -> i32 {
        self.state().z_upper
    }

    /// Last constant speed command (-255..=255)
    pub fn z_speed(&self) -> i32 {
        self.state().z_speed
    }

    /// Lamp intensity
    pub fn lamp_intensity(&self) -> i32 {
        self.state().lamp_intensity
    }

    /// Whether the front panel has control
    pub fn manual_mode(&self) -> bool {
        self.state().manual
    }

    /// Nosepiece position (1-based, 0 while between positions)
    pub fn nosepiece_position(&self) -> i32 {
        self.state().nosepiece_position
    }

    /// Turn the nosepiece by hand
    pub fn set_nosepiece_position(&self, position: i32) {
        self.state().nosepiece_position = position;
    }
}

impl Transport for SimulatedStand {
    fn send_command(&mut self, command: &str, terminator: &str) -> io::Result<()> {
        let mut state = self.state();
        state.written.push(command.to_string());
        trace!("Simulated stand received {:?}", command);

        let answer = state.answer(command);
        if state.drop_answers > 0 {
            state.drop_answers -= 1;
            return Ok(());
        }
        if let Some(answer) = answer {
            state.rx.extend(answer.bytes());
            state.rx.extend(terminator.bytes());
        }
        Ok(())
    }

    fn read_answer(&mut self, terminator: &str, max_len: usize) -> io::Result<String> {
        let mut state = self.state();
        let terminator = terminator.as_bytes();
        let buffered: Vec<u8> = state.rx.iter().copied().collect();

        let end = buffered
            .windows(terminator.len())
            .position(|w| w == terminator)
            .ok_or_else(|| io::Error::new(io::ErrorKind::TimedOut, "no answer from stand"))?;

        if end > max_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "answer exceeds receive buffer",
            ));
        }

        state.rx.drain(..end + terminator.len());
        Ok(String::from_utf8_lossy(&buffered[..end]).into_owned())
    }

    fn read_pending(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state();
        let n = buf.len().min(state.rx.len());
        for (slot, byte) in buf.iter_mut().zip(state.rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

/// Hands out [`SimulatedStand`] handles by port name
#[derive(Debug, Default)]
pub struct SimulatedPorts {
    stands: HashMap<String, SimulatedStand>,
    opened: Mutex<Vec<String>>,
}

impl SimulatedPorts {
    /// Create an empty port table
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `stand` to `port`
    pub fn with_port(mut self, port: &str, stand: SimulatedStand) -> Self {
        self.stands.insert(port.to_string(), stand);
        self
    }

    /// Ports opened so far, in order
    pub fn opened(&self) -> Vec<String> {
        match self.opened.lock() {
            Ok(opened) => opened.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl PortProvider for SimulatedPorts {
    fn open(&self, port: &str) -> io::Result<Box<dyn Transport>> {
        let stand = self.stands.get(port).cloned().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no such port: {}", port))
        })?;
        if let Ok(mut opened) = self.opened.lock() {
            opened.push(port.to_string());
        }
        Ok(Box::new(stand))
    }
}
