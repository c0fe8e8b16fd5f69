/*!
 * Device trait and core device abstractions.
 *
 * Every sub-device of the stand (the stand itself, the lamp, the focus drive
 * and the nosepiece) is a facade over the shared command hub. Facades keep a
 * small cache, expose typed operations, and present a property table to the
 * host through the [`Device`] trait.
 */
use std::fmt::{self, Debug};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use scopeflow_core::{
    error::Error as CoreError,
    event::{Priority, SharedEventBus, TypedEvent},
    types::{Id, Metadata, Value},
};

use crate::protocol::frame::ProtocolError;
use crate::protocol::hub::SharedHub;

/// Error type for device operations
#[derive(Error, Debug)]
pub enum DeviceError {
    /// No serial port has been configured
    #[error("No serial port set. Configure the microscope's port before initializing")]
    PortNotSet,

    /// The stand did not answer in time
    #[error("No answer to command {0}. Is the microscope connected to the correct serial port and switched on?")]
    NoAnswer(String),

    /// The answer did not echo the command that was sent
    #[error("Unexpected answer: {0}")]
    UnexpectedAnswer(String),

    /// The answer payload could not be interpreted
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// The addressed hardware is not fitted
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// The hardware reports a position between detents
    #[error("Invalid position: {0}")]
    InvalidPosition(String),

    /// The operation is not available on this hardware
    #[error("Command cannot be executed: {0}")]
    CommandCannotExecute(String),

    /// Opening or using the transport failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// The device has not been initialized
    #[error("Device not initialized: {0}")]
    NotInitialized(String),

    /// The port cannot change once the stand is initialized
    #[error("Port change forbidden after initialization")]
    PortChangeForbidden,

    /// The property is not supported by the device
    #[error("Property not supported: {0}")]
    PropertyNotSupported(String),

    /// The value type is not valid for the property
    #[error("Invalid value type for property {0}: expected {1}, got {2}")]
    InvalidValueType(String, String, String),

    /// The value is out of range for the property
    #[error("Value out of range for property {0}: {1}")]
    ValueOutOfRange(String, String),

    /// Permission error
    #[error("Permission error: {0}")]
    PermissionDenied(String),

    /// No device kind with this name
    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Other error
    #[error("Other error: {0}")]
    Other(String),

    /// Core error
    #[error("Core error: {0}")]
    CoreError(#[from] CoreError),
}

impl From<ProtocolError> for DeviceError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::UnexpectedAnswer { .. } => DeviceError::UnexpectedAnswer(err.to_string()),
            ProtocolError::InvalidPayload { .. } => DeviceError::InvalidPayload(err.to_string()),
        }
    }
}

/// Result type for device operations
pub type Result<T> = std::result::Result<T, DeviceError>;

/// The role a device plays for the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceCategory {
    /// The stand itself, owning the serial port setting
    Generic,
    /// Something that opens and closes
    Shutter,
    /// A single-axis positioner
    Stage,
    /// A device with a discrete set of positions
    State,
}

/// The device kinds this crate can create
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    /// The microscope stand
    Microscope,
    /// The halogen lamp
    Lamp,
    /// The motorized focus drive
    FocusDrive,
    /// The objective nosepiece
    Nosepiece,
}

impl DeviceKind {
    /// All kinds, in registration order
    pub const ALL: [DeviceKind; 4] = [
        DeviceKind::Microscope,
        DeviceKind::Lamp,
        DeviceKind::FocusDrive,
        DeviceKind::Nosepiece,
    ];

    /// Name the host uses to create the device
    pub fn device_name(self) -> &'static str {
        match self {
            DeviceKind::Microscope => "DM Microscope",
            DeviceKind::Lamp => "Halogen Lamp",
            DeviceKind::FocusDrive => "Z Drive",
            DeviceKind::Nosepiece => "Objective Nosepiece",
        }
    }

    /// Human-readable description
    pub fn description(self) -> &'static str {
        match self {
            DeviceKind::Microscope => "DM (RE, RXE, RME, RBE) stand controller",
            DeviceKind::Lamp => "Transmitted light halogen lamp",
            DeviceKind::FocusDrive => "Motorized focus (Z) drive",
            DeviceKind::Nosepiece => "Coded objective nosepiece",
        }
    }

    /// Host category
    pub fn category(self) -> DeviceCategory {
        match self {
            DeviceKind::Microscope => DeviceCategory::Generic,
            DeviceKind::Lamp => DeviceCategory::Shutter,
            DeviceKind::FocusDrive => DeviceCategory::Stage,
            DeviceKind::Nosepiece => DeviceCategory::State,
        }
    }

    /// Look a kind up by its device name
    pub fn from_device_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.device_name() == name)
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.device_name())
    }
}

/// Device lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceState {
    /// Created but not initialized
    Uninitialized,
    /// Initialization in progress
    Initializing,
    /// Ready for use
    Ready,
    /// Shutdown in progress
    ShuttingDown,
    /// Initialization failed
    Error,
}

/// Device event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DeviceEvent {
    /// The device state has changed
    StateChanged {
        /// The device ID
        device_id: Id,
        /// The old state
        old_state: DeviceState,
        /// The new state
        new_state: DeviceState,
    },
    /// A property value has changed
    PropertyChanged {
        /// The device ID
        device_id: Id,
        /// The property name
        property: String,
        /// The old value
        old_value: Option<Value>,
        /// The new value
        new_value: Value,
    },
    /// An error has occurred
    Error {
        /// The device ID
        device_id: Id,
        /// The error message
        message: String,
    },
}

/// Receiver for a device's events
pub type DeviceEventReceiver = broadcast::Receiver<TypedEvent<DeviceEvent>>;

/// Device information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// The device ID (the host's label for this instance)
    pub id: Id,
    /// The device name
    pub name: String,
    /// The device kind
    pub kind: DeviceKind,
    /// The device description
    pub description: String,
    /// Additional device metadata
    pub metadata: Metadata,
}

impl DeviceInfo {
    /// Describe a new instance of `kind`
    pub fn new(id: Id, kind: DeviceKind) -> Self {
        Self {
            id,
            name: kind.device_name().to_string(),
            kind,
            description: kind.description().to_string(),
            metadata: Metadata::new(),
        }
    }
}

/// The core device trait
///
/// Calls block until the stand has answered. Implementations must tolerate
/// `shutdown` being called more than once.
pub trait Device: Send + Sync + Debug {
    /// Get the device information
    fn info(&self) -> &DeviceInfo;

    /// Get the device ID
    fn id(&self) -> &Id {
        &self.info().id
    }

    /// Get the device name
    fn name(&self) -> &str {
        &self.info().name
    }

    /// Get the device kind
    fn kind(&self) -> DeviceKind {
        self.info().kind
    }

    /// Get the device state
    fn state(&self) -> DeviceState;

    /// Connect through the shared hub and load the device's initial state
    fn initialize(&self) -> Result<()>;

    /// Release the device; safe to call repeatedly
    fn shutdown(&self) -> Result<()>;

    /// Whether the device is still settling after its last change
    fn busy(&self) -> bool;

    /// The device's property table
    fn properties(&self) -> &[PropertyMetadata];

    /// Metadata of a single property
    fn property_metadata(&self, property: &str) -> Result<&PropertyMetadata> {
        self.properties()
            .iter()
            .find(|p| p.name == property)
            .ok_or_else(|| DeviceError::PropertyNotSupported(property.to_string()))
    }

    /// Check if a property is supported by the device
    fn supports_property(&self, property: &str) -> bool {
        self.properties().iter().any(|p| p.name == property)
    }

    /// Read a property value
    fn read(&self, property: &str) -> Result<Value>;

    /// Write a property value
    fn write(&self, property: &str, value: Value) -> Result<()>;

    /// Subscribe to device events
    fn subscribe_events(&self) -> Result<DeviceEventReceiver>;
}

/// Property metadata
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PropertyMetadata {
    /// The property name
    pub name: String,
    /// The property description
    pub description: Option<String>,
    /// The property data type
    pub data_type: PropertyDataType,
    /// The property access mode
    pub access: PropertyAccess,
    /// The property unit
    pub unit: Option<String>,
    /// The property minimum value
    pub min_value: Option<Value>,
    /// The property maximum value
    pub max_value: Option<Value>,
    /// Whether the property is set before initialization
    pub pre_init: bool,
}

/// Property data type
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PropertyDataType {
    /// Integer
    Integer,
    /// Float
    Float,
    /// String
    String,
    /// One of a fixed set of strings
    Enum(Vec<String>),
}

/// Property access mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropertyAccess {
    /// Read-only property
    ReadOnly,
    /// Read-write property
    ReadWrite,
}

impl PropertyMetadata {
    /// Create a read-write property
    pub fn new<S: Into<String>>(name: S, data_type: PropertyDataType) -> Self {
        Self {
            name: name.into(),
            description: None,
            data_type,
            access: PropertyAccess::ReadWrite,
            unit: None,
            min_value: None,
            max_value: None,
            pre_init: false,
        }
    }

    /// Set the description
    pub fn with_description<S: Into<String>>(mut self, description: S) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Set the unit
    pub fn with_unit<S: Into<String>>(mut self, unit: S) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Set inclusive limits
    pub fn with_limits<V: Into<Value>>(mut self, min: V, max: V) -> Self {
        self.min_value = Some(min.into());
        self.max_value = Some(max.into());
        self
    }

    /// Make the property read-only
    pub fn read_only(mut self) -> Self {
        self.access = PropertyAccess::ReadOnly;
        self
    }

    /// Mark the property as a pre-initialization setting
    pub fn pre_init(mut self) -> Self {
        self.pre_init = true;
        self
    }

    /// Allowed values of an enumerated property
    pub fn allowed_values(&self) -> &[String] {
        match &self.data_type {
            PropertyDataType::Enum(values) => values,
            _ => &[],
        }
    }

    /// Check a value against the type and limits of this property
    pub fn validate(&self, value: &Value) -> Result<()> {
        match (&self.data_type, value) {
            (PropertyDataType::Integer, Value::Integer(_)) => {}
            (PropertyDataType::Float, v) if v.is_numeric() => {}
            (PropertyDataType::String, Value::String(_)) => {}
            (PropertyDataType::Enum(variants), Value::String(s)) => {
                if !variants.contains(s) {
                    return Err(DeviceError::InvalidValueType(
                        self.name.clone(),
                        format!("one of {:?}", variants),
                        s.clone(),
                    ));
                }
            }
            _ => {
                return Err(DeviceError::InvalidValueType(
                    self.name.clone(),
                    format!("{:?}", self.data_type),
                    format!("{:?}", value),
                ))
            }
        }

        let below = self
            .min_value
            .as_ref()
            .and_then(Value::as_float)
            .zip(value.as_float())
            .filter(|(min, v)| v < min);
        if let Some((min, v)) = below {
            return Err(DeviceError::ValueOutOfRange(
                self.name.clone(),
                format!("Value {} is less than minimum {}", v, min),
            ));
        }

        let above = self
            .max_value
            .as_ref()
            .and_then(Value::as_float)
            .zip(value.as_float())
            .filter(|(max, v)| v > max);
        if let Some((max, v)) = above {
            return Err(DeviceError::ValueOutOfRange(
                self.name.clone(),
                format!("Value {} is greater than maximum {}", v, max),
            ));
        }

        Ok(())
    }
}

/// Reports busy until a fixed delay has passed since the last change
#[derive(Debug)]
pub struct SettleTimer {
    delay: Duration,
    changed_at: Mutex<Option<Instant>>,
}

impl SettleTimer {
    /// Create a timer with the given settle delay
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            changed_at: Mutex::new(None),
        }
    }

    /// Settle delay
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Record a change now
    pub fn mark_changed(&self) {
        *self.changed_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
    }

    /// True while less than the settle delay has elapsed since the last change
    pub fn is_settling(&self) -> bool {
        match *self.changed_at.lock().unwrap_or_else(|e| e.into_inner()) {
            Some(changed) => changed.elapsed() < self.delay,
            None => false,
        }
    }
}

/// State and plumbing shared by all facades
#[derive(Debug)]
pub struct BaseDevice {
    /// Device information
    info: DeviceInfo,
    /// Device state
    state: RwLock<DeviceState>,
    /// Property table, fixed at construction
    properties: Vec<PropertyMetadata>,
    /// Device event bus
    event_bus: SharedEventBus,
    /// Busy tracking
    settle: SettleTimer,
}

impl BaseDevice {
    /// Create a new base device
    pub fn new(info: DeviceInfo, properties: Vec<PropertyMetadata>, settle_delay: Duration) -> Self {
        Self {
            info,
            state: RwLock::new(DeviceState::Uninitialized),
            properties,
            event_bus: SharedEventBus::new(),
            settle: SettleTimer::new(settle_delay),
        }
    }

    /// Device information
    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Current state
    pub fn state(&self) -> DeviceState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    /// True once initialization has completed
    pub fn is_ready(&self) -> bool {
        self.state() == DeviceState::Ready
    }

    /// Set the device state
    pub fn set_state(&self, new_state: DeviceState) {
        let old_state = {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *state, new_state)
        };

        if old_state != new_state {
            debug!(device = %self.info.id, "State {:?} -> {:?}", old_state, new_state);
            self.publish(DeviceEvent::StateChanged {
                device_id: self.info.id.clone(),
                old_state,
                new_state,
            });
        }
    }

    /// Fail with `NotInitialized` unless the device is ready
    pub fn require_ready(&self) -> Result<()> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(DeviceError::NotInitialized(self.info.name.clone()))
        }
    }

    /// Property table
    pub fn properties(&self) -> &[PropertyMetadata] {
        &self.properties
    }

    fn property(&self, property: &str) -> Result<&PropertyMetadata> {
        self.properties
            .iter()
            .find(|p| p.name == property)
            .ok_or_else(|| DeviceError::PropertyNotSupported(property.to_string()))
    }

    /// Check that `property` exists and may be read in the current state
    pub fn check_readable(&self, property: &str) -> Result<&PropertyMetadata> {
        let metadata = self.property(property)?;
        if !metadata.pre_init {
            self.require_ready()?;
        }
        Ok(metadata)
    }

    /// Check that `property` exists, is writable, and accepts `value`
    pub fn check_writable(&self, property: &str, value: &Value) -> Result<&PropertyMetadata> {
        let metadata = self.property(property)?;
        if metadata.access == PropertyAccess::ReadOnly {
            return Err(DeviceError::PermissionDenied(format!(
                "Property {} is read-only",
                property
            )));
        }
        if !metadata.pre_init {
            self.require_ready()?;
        }
        metadata.validate(value)?;
        Ok(metadata)
    }

    /// Record a change for busy tracking
    pub fn mark_changed(&self) {
        self.settle.mark_changed();
    }

    /// Whether the device is still settling
    pub fn busy(&self) -> bool {
        self.settle.is_settling()
    }

    /// Publish a property change
    pub fn publish_property_change(&self, property: &str, old_value: Option<Value>, new_value: Value) {
        self.publish(DeviceEvent::PropertyChanged {
            device_id: self.info.id.clone(),
            property: property.to_string(),
            old_value,
            new_value,
        });
    }

    /// Publish a device error event
    pub fn publish_error(&self, message: String) {
        self.publish(DeviceEvent::Error {
            device_id: self.info.id.clone(),
            message,
        });
    }

    fn publish(&self, event: DeviceEvent) {
        let priority = match event {
            DeviceEvent::Error { .. } => Priority::High,
            _ => Priority::Normal,
        };
        let event = TypedEvent::new("device", event)
            .with_source(self.info.id.clone())
            .with_priority(priority);
        if let Err(e) = self.event_bus.publish(event) {
            warn!(device = %self.info.id, "Dropped device event: {}", e);
        }
    }

    /// Subscribe to this device's events
    pub fn subscribe(&self) -> Result<DeviceEventReceiver> {
        Ok(self.event_bus.subscribe()?)
    }

    /// Run the common initialization sequence around `load`
    ///
    /// Attaches to the hub (connecting it on first use), runs the facade's own
    /// initialization, and detaches again if that fails. Already-ready devices
    /// return immediately.
    pub fn initialize_with<F>(&self, hub: &SharedHub, load: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        if self.is_ready() {
            return Ok(());
        }

        self.set_state(DeviceState::Initializing);
        if let Err(e) = hub.attach() {
            self.set_state(DeviceState::Error);
            self.publish_error(e.to_string());
            return Err(e);
        }

        if let Err(e) = load() {
            if let Err(detach) = hub.detach() {
                warn!(device = %self.info.id, "Failed to release hub: {}", detach);
            }
            self.set_state(DeviceState::Error);
            self.publish_error(e.to_string());
            return Err(e);
        }

        self.set_state(DeviceState::Ready);
        Ok(())
    }

    /// Run the common shutdown sequence; a no-op unless the device is ready
    pub fn shutdown_with(&self, hub: &SharedHub) -> Result<()> {
        if !self.is_ready() {
            if self.state() == DeviceState::Error {
                self.set_state(DeviceState::Uninitialized);
            }
            return Ok(());
        }

        self.set_state(DeviceState::ShuttingDown);
        let released = hub.detach();
        self.set_state(DeviceState::Uninitialized);
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn intensity() -> PropertyMetadata {
        PropertyMetadata::new("Intensity", PropertyDataType::Integer).with_limits(0, 255)
    }

    #[test]
    fn test_validate_integer_limits() {
        let meta = intensity();
        assert!(meta.validate(&Value::Integer(150)).is_ok());
        assert!(matches!(
            meta.validate(&Value::Integer(256)),
            Err(DeviceError::ValueOutOfRange(..))
        ));
        assert!(matches!(
            meta.validate(&Value::Integer(-1)),
            Err(DeviceError::ValueOutOfRange(..))
        ));
        assert!(matches!(
            meta.validate(&Value::from("high")),
            Err(DeviceError::InvalidValueType(..))
        ));
    }

    #[test]
    fn test_validate_enum() {
        let meta = PropertyMetadata::new(
            "Threshold",
            PropertyDataType::Enum(vec!["Set".to_string(), "Update".to_string()]),
        );
        assert_eq!(meta.allowed_values(), ["Set", "Update"]);
        assert!(meta.validate(&Value::from("Update")).is_ok());
        assert!(meta.validate(&Value::from("Reset")).is_err());
    }

    #[test]
    fn test_float_accepts_integers() {
        let meta = PropertyMetadata::new("Speed", PropertyDataType::Float).with_limits(-10.0, 10.0);
        assert!(meta.validate(&Value::Integer(5)).is_ok());
        assert!(meta.validate(&Value::Float(10.5)).is_err());
    }

    #[test]
    fn test_device_kind_names() {
        for kind in DeviceKind::ALL {
            assert_eq!(DeviceKind::from_device_name(kind.device_name()), Some(kind));
        }
        assert_eq!(DeviceKind::from_device_name("Filter Wheel"), None);
        assert_eq!(DeviceKind::Lamp.category(), DeviceCategory::Shutter);
    }

    #[test]
    fn test_events_serialize_for_the_host() {
        let event = DeviceEvent::PropertyChanged {
            device_id: "lamp".into(),
            property: "Intensity".to_string(),
            old_value: None,
            new_value: Value::Integer(150),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["PropertyChanged"]["new_value"], 150);
        assert_eq!(json["PropertyChanged"]["device_id"], "lamp");

        let info = DeviceInfo::new("z".into(), DeviceKind::FocusDrive);
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["name"], "Z Drive");
        assert_eq!(json["kind"], "FocusDrive");
    }

    #[test]
    fn test_settle_timer() {
        let timer = SettleTimer::new(Duration::from_millis(30));
        assert!(!timer.is_settling());
        timer.mark_changed();
        assert!(timer.is_settling());
        thread::sleep(Duration::from_millis(40));
        assert!(!timer.is_settling());

        let instant = SettleTimer::new(Duration::ZERO);
        instant.mark_changed();
        assert!(!instant.is_settling());
    }

    #[test]
    fn test_base_device_access_checks() {
        let info = DeviceInfo::new("lamp".into(), DeviceKind::Lamp);
        let port = PropertyMetadata::new("Port", PropertyDataType::String).pre_init();
        let version = PropertyMetadata::new("Firmware version", PropertyDataType::String).read_only();
        let base = BaseDevice::new(info, vec![intensity(), port, version], Duration::ZERO);

        assert!(matches!(
            base.check_writable("Intensity", &Value::Integer(1)),
            Err(DeviceError::NotInitialized(_))
        ));
        assert!(base.check_writable("Port", &Value::from("COM7")).is_ok());
        assert!(matches!(
            base.check_writable("Firmware version", &Value::from("x")),
            Err(DeviceError::PermissionDenied(_))
        ));
        assert!(matches!(
            base.check_readable("Shutter"),
            Err(DeviceError::PropertyNotSupported(_))
        ));
    }

    #[test]
    fn test_state_changes_are_published() {
        let info = DeviceInfo::new("z".into(), DeviceKind::FocusDrive);
        let base = BaseDevice::new(info, Vec::new(), Duration::ZERO);
        let mut rx = base.subscribe().unwrap();

        base.set_state(DeviceState::Ready);
        base.set_state(DeviceState::Ready);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.source.as_ref().map(Id::as_str), Some("z"));
        assert!(matches!(
            event.payload,
            DeviceEvent::StateChanged { new_state: DeviceState::Ready, .. }
        ));
        assert!(rx.try_recv().is_err());
    }
}
