/*!
 * Command hub: the single owner of the stand's serial line.
 *
 * Every request goes through the same sequence: drain stale bytes from the
 * receive buffer, write one frame, read one terminated answer, and check that
 * it echoes the device group and command that were sent. There is one
 * command in flight at a time and no automatic retry, except for the
 * firmware version query while connecting.
 */
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::BytesMut;
use tracing::{debug, info, trace, warn};

use scopeflow_core::config::Config;
use scopeflow_core::logging::operation_span;
use scopeflow_core::utils::with_retry;

use super::commands;
use super::frame::{decode_response, encode_action, encode_query, CommandId, DeviceGroup, Payload};
use super::transport::{PortProvider, Transport};
use crate::device::{DeviceError, Result};

/// Receive buffer size; also the longest answer accepted
pub const RCV_BUF_LENGTH: usize = 1024;

/// Microscope type assumed when the stand does not report one
pub const DEFAULT_MICROSCOPE: &str = "RxE";

/// Connection state of the hub
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No handshake has been done
    Uninitialized,
    /// The stand answered the version query
    Connected,
}

/// Serializes all traffic to one stand
#[derive(Debug)]
pub struct CommandHub {
    group: DeviceGroup,
    provider: Arc<dyn PortProvider>,
    port: Option<String>,
    transport: Option<Box<dyn Transport>>,
    terminator: String,
    state: ConnectionState,
    version: String,
    microscope: String,
    default_microscope: String,
    rcv_buf: BytesMut,
    users: usize,
}

impl CommandHub {
    /// Create a hub for the general microscope group with no port set
    pub fn new(provider: Arc<dyn PortProvider>) -> Self {
        Self {
            group: DeviceGroup::GENERAL_MICROSCOPE,
            provider,
            port: None,
            transport: None,
            terminator: "\r".to_string(),
            state: ConnectionState::Uninitialized,
            version: String::new(),
            microscope: String::new(),
            default_microscope: DEFAULT_MICROSCOPE.to_string(),
            rcv_buf: BytesMut::with_capacity(RCV_BUF_LENGTH),
            users: 0,
        }
    }

    /// Create a hub from the serial and hub sections of the configuration
    pub fn from_config(config: &Config, provider: Arc<dyn PortProvider>) -> Result<Self> {
        let group = DeviceGroup::try_new(config.hub.device_group).ok_or_else(|| {
            DeviceError::ConfigurationError(format!(
                "Device group {} does not fit in two digits",
                config.hub.device_group
            ))
        })?;
        if config.serial.terminator.is_empty() {
            return Err(DeviceError::ConfigurationError(
                "Serial terminator must not be empty".to_string(),
            ));
        }

        let mut hub = Self::new(provider);
        hub.group = group;
        hub.port = config.serial.port.clone();
        hub.terminator = config.serial.terminator.clone();
        hub.default_microscope = config.hub.default_microscope.clone();
        Ok(hub)
    }

    /// Select the serial port; a different port drops the open transport
    ///
    /// Fails with `PortChangeForbidden` when a different port is requested
    /// while connected.
    pub fn configure_port(&mut self, port: &str) -> Result<()> {
        if self.port.as_deref() == Some(port) {
            return Ok(());
        }
        if self.is_connected() {
            return Err(DeviceError::PortChangeForbidden);
        }
        debug!("Hub port set to {}", port);
        self.port = Some(port.to_string());
        self.transport = None;
        Ok(())
    }

    /// Selected serial port
    pub fn port(&self) -> Option<&str> {
        self.port.as_deref()
    }

    /// Device group addressed by every frame
    pub fn device_group(&self) -> DeviceGroup {
        self.group
    }

    /// Connection state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// True after a successful handshake
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Firmware version reported during the handshake
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Microscope type reported during the handshake (or the default)
    pub fn microscope(&self) -> &str {
        &self.microscope
    }

    /// Number of facades currently attached
    pub fn users(&self) -> usize {
        self.users
    }

    /// Perform the handshake; does nothing when already connected
    ///
    /// The version query is tried twice. A stand that does not answer the
    /// microscope type query is assumed to be the default type.
    pub fn connect(&mut self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        let port = self.port.clone().ok_or(DeviceError::PortNotSet)?;
        let _span = operation_span("connect", &port).entered();

        self.flush_receive_buffer()?;
        let version = with_retry(1, || self.query(commands::FIRMWARE_VERSION))?;

        let microscope = match self.query(commands::MICROSCOPE_TYPE) {
            Ok(microscope) => microscope,
            Err(e) => {
                warn!(
                    "Microscope type query failed ({}), assuming {}",
                    e, self.default_microscope
                );
                self.default_microscope.clone()
            }
        };

        self.version = version;
        self.microscope = microscope;
        self.state = ConnectionState::Connected;
        info!(
            port = %port,
            microscope = %self.microscope,
            version = %self.version,
            "Connected to microscope"
        );
        Ok(())
    }

    /// Forget the handshake; the transport stays open
    pub fn disconnect(&mut self) {
        if self.is_connected() {
            info!("Disconnected from microscope");
        }
        self.state = ConnectionState::Uninitialized;
    }

    /// Send a query and return its payload text
    pub fn query(&mut self, command: CommandId) -> Result<String> {
        let frame = encode_query(self.group, command);
        Ok(self.transact(command, &frame)?.into_string())
    }

    /// Send a query and parse its payload as an integer
    pub fn query_int(&mut self, command: CommandId) -> Result<i32> {
        let frame = encode_query(self.group, command);
        Ok(self.transact(command, &frame)?.parse_int()?)
    }

    /// Send an action with an optional payload and wait for its echo
    pub fn command(&mut self, command: CommandId, data: Option<i32>) -> Result<()> {
        let frame = encode_action(self.group, command, data);
        self.transact(command, &frame)?;
        Ok(())
    }

    fn transport(&mut self) -> Result<&mut (dyn Transport + 'static)> {
        let port = self.port.as_deref().ok_or(DeviceError::PortNotSet)?;
        if self.transport.is_none() {
            let transport = self.provider.open(port).map_err(|e| {
                DeviceError::Transport(format!("Failed to open port {}: {}", port, e))
            })?;
            debug!("Opened port {}", port);
            self.transport = Some(transport);
        }
        self.transport
            .as_deref_mut()
            .ok_or_else(|| DeviceError::Transport("Port is not open".to_string()))
    }

    /// Discard whatever is waiting in the receive buffer
    fn flush_receive_buffer(&mut self) -> Result<()> {
        let mut buf = std::mem::take(&mut self.rcv_buf);
        buf.clear();
        buf.resize(RCV_BUF_LENGTH, 0);

        let transport = self.transport()?;
        let mut discarded = 0;
        loop {
            match transport.read_pending(&mut buf[..]) {
                Ok(n) => {
                    discarded += n;
                    if n < RCV_BUF_LENGTH {
                        break;
                    }
                }
                Err(e) => {
                    trace!("Receive buffer drain stopped: {}", e);
                    break;
                }
            }
        }
        if discarded > 0 {
            debug!("Discarded {} stale bytes", discarded);
        }

        buf.clear();
        self.rcv_buf = buf;
        Ok(())
    }

    fn transact(&mut self, command: CommandId, frame: &str) -> Result<Payload> {
        self.flush_receive_buffer()?;

        let group = self.group;
        let terminator = self.terminator.clone();
        let transport = self.transport()?;

        debug!(frame = %frame, "Sending command");
        transport
            .send_command(frame, &terminator)
            .map_err(|e| io_error(frame, e))?;
        let answer = transport
            .read_answer(&terminator, RCV_BUF_LENGTH)
            .map_err(|e| io_error(frame, e))?;
        debug!(answer = %answer, "Received answer");

        Ok(decode_response(&answer, group, command)?)
    }
}

fn io_error(frame: &str, err: io::Error) -> DeviceError {
    if err.kind() == io::ErrorKind::TimedOut {
        DeviceError::NoAnswer(frame.to_string())
    } else {
        DeviceError::Transport(err.to_string())
    }
}

/// A hub handle shared by every facade of one stand
#[derive(Debug, Clone)]
pub struct SharedHub(Arc<Mutex<CommandHub>>);

impl SharedHub {
    /// Share `hub`
    pub fn new(hub: CommandHub) -> Self {
        Self(Arc::new(Mutex::new(hub)))
    }

    /// Lock the hub for a sequence of calls
    pub fn lock(&self) -> Result<MutexGuard<'_, CommandHub>> {
        self.0
            .lock()
            .map_err(|_| DeviceError::Other("Failed to acquire lock on command hub".to_string()))
    }

    /// Register a facade, connecting on first use
    pub fn attach(&self) -> Result<()> {
        let mut hub = self.lock()?;
        hub.connect()?;
        hub.users += 1;
        trace!("Hub users: {}", hub.users);
        Ok(())
    }

    /// Release a facade; the last one out disconnects
    pub fn detach(&self) -> Result<()> {
        let mut hub = self.lock()?;
        hub.users = hub.users.saturating_sub(1);
        trace!("Hub users: {}", hub.users);
        if hub.users == 0 {
            hub.disconnect();
        }
        Ok(())
    }

    /// See [`CommandHub::query`]
    pub fn query(&self, command: CommandId) -> Result<String> {
        self.lock()?.query(command)
    }

    /// See [`CommandHub::query_int`]
    pub fn query_int(&self, command: CommandId) -> Result<i32> {
        self.lock()?.query_int(command)
    }

    /// See [`CommandHub::command`]
    pub fn command(&self, command: CommandId, data: Option<i32>) -> Result<()> {
        self.lock()?.command(command, data)
    }

    /// See [`CommandHub::configure_port`]
    pub fn configure_port(&self, port: &str) -> Result<()> {
        self.lock()?.configure_port(port)
    }

    /// Selected serial port
    pub fn port(&self) -> Result<Option<String>> {
        Ok(self.lock()?.port().map(str::to_string))
    }

    /// True after a successful handshake
    pub fn is_connected(&self) -> Result<bool> {
        Ok(self.lock()?.is_connected())
    }

    /// Microscope type from the handshake
    pub fn microscope(&self) -> Result<String> {
        Ok(self.lock()?.microscope().to_string())
    }

    /// Firmware version from the handshake
    pub fn version(&self) -> Result<String> {
        Ok(self.lock()?.version().to_string())
    }
}
