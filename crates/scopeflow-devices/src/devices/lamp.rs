/*!
 * Halogen lamp facade, presented to the host as a shutter.
 *
 * The stand has no separate shutter: "closed" means intensity 0. The facade
 * remembers the intensity the user asked for and applies it when the lamp is
 * opened, so setting the intensity while closed does not light the lamp.
 */
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tracing::debug;

use scopeflow_core::config::LampConfig;
use scopeflow_core::types::{Id, Value};

use crate::device::{
    BaseDevice, Device, DeviceError, DeviceEventReceiver, DeviceInfo, DeviceKind, DeviceState,
    PropertyDataType, PropertyMetadata, Result,
};
use crate::protocol::commands;
use crate::protocol::hub::SharedHub;

/// Properties of the lamp facade
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LampProperty {
    /// 1 when open, 0 when closed
    State,
    /// Intensity applied while open
    Intensity,
}

impl LampProperty {
    /// All properties
    pub const ALL: [LampProperty; 2] = [LampProperty::State, LampProperty::Intensity];

    /// Host-visible name
    pub fn name(self) -> &'static str {
        match self {
            LampProperty::State => "State",
            LampProperty::Intensity => "Intensity",
        }
    }

    /// Look a property up by name
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.name() == name)
    }

    fn metadata(self, max_intensity: u8) -> PropertyMetadata {
        match self {
            LampProperty::State => PropertyMetadata::new(self.name(), PropertyDataType::Integer)
                .with_description("0 closed, 1 open")
                .with_limits(0, 1),
            LampProperty::Intensity => PropertyMetadata::new(self.name(), PropertyDataType::Integer)
                .with_limits(0, i32::from(max_intensity)),
        }
    }
}

#[derive(Debug, Default)]
struct LampCache {
    open: bool,
    intensity: u8,
}

/// The transmitted light lamp
#[derive(Debug)]
pub struct Lamp {
    base: BaseDevice,
    hub: SharedHub,
    cache: Mutex<LampCache>,
    max_intensity: u8,
}

impl Lamp {
    /// Create the facade
    pub fn new(id: Id, hub: SharedHub, config: &LampConfig) -> Self {
        let properties = LampProperty::ALL
            .into_iter()
            .map(|p| p.metadata(config.max_intensity))
            .collect();
        Self {
            base: BaseDevice::new(
                DeviceInfo::new(id, DeviceKind::Lamp),
                properties,
                Duration::from_millis(config.settle_delay_ms),
            ),
            hub,
            cache: Mutex::new(LampCache::default()),
            max_intensity: config.max_intensity,
        }
    }

    fn cache(&self) -> MutexGuard<'_, LampCache> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn read_hardware_intensity(&self) -> Result<u8> {
        let raw = self.hub.query_int(commands::LAMP_GET_INTENSITY)?;
        u8::try_from(raw)
            .map_err(|_| DeviceError::InvalidPayload(format!("Lamp intensity {} out of range", raw)))
    }

    /// Open (light at the remembered intensity) or close (intensity 0)
    pub fn set_open(&self, open: bool) -> Result<()> {
        self.base.require_ready()?;
        let mut cache = self.cache();
        let target = if open { cache.intensity } else { 0 };
        self.hub.command(commands::LAMP_SET_INTENSITY, Some(i32::from(target)))?;

        let was_open = std::mem::replace(&mut cache.open, open);
        drop(cache);

        self.base.mark_changed();
        debug!(open, intensity = target, "Lamp switched");
        if was_open != open {
            self.base.publish_property_change(
                LampProperty::State.name(),
                Some(Value::from(i32::from(was_open))),
                Value::from(i32::from(open)),
            );
        }
        Ok(())
    }

    /// Whether the lamp is open
    pub fn is_open(&self) -> Result<bool> {
        self.base.require_ready()?;
        Ok(self.cache().open)
    }

    /// Set the intensity; only sent to the stand while the lamp is open
    pub fn set_intensity(&self, intensity: u8) -> Result<()> {
        self.base.require_ready()?;
        if intensity > self.max_intensity {
            return Err(DeviceError::ValueOutOfRange(
                LampProperty::Intensity.name().to_string(),
                format!("Value {} is greater than maximum {}", intensity, self.max_intensity),
            ));
        }

        let mut cache = self.cache();
        if cache.open {
            self.hub.command(commands::LAMP_SET_INTENSITY, Some(i32::from(intensity)))?;
            self.base.mark_changed();
        }
        let old = std::mem::replace(&mut cache.intensity, intensity);
        drop(cache);

        if old != intensity {
            self.base.publish_property_change(
                LampProperty::Intensity.name(),
                Some(Value::from(old)),
                Value::from(intensity),
            );
        }
        Ok(())
    }

    /// Current intensity: read from the stand while open, remembered while closed
    pub fn intensity(&self) -> Result<u8> {
        self.base.require_ready()?;
        let mut cache = self.cache();
        if cache.open {
            cache.intensity = self.read_hardware_intensity()?;
        }
        Ok(cache.intensity)
    }

    /// Timed exposure is not available on this lamp
    pub fn fire(&self, _duration: Duration) -> Result<()> {
        Err(DeviceError::CommandCannotExecute(
            "The lamp does not support timed exposures".to_string(),
        ))
    }
}

impl Device for Lamp {
    fn info(&self) -> &DeviceInfo {
        self.base.info()
    }

    fn state(&self) -> DeviceState {
        self.base.state()
    }

    fn initialize(&self) -> Result<()> {
        self.base.initialize_with(&self.hub, || {
            let intensity = self.read_hardware_intensity()?;
            // The lamp may already be lit; it still starts out "closed"
            *self.cache() = LampCache { open: false, intensity };
            debug!(intensity, "Lamp intensity read from stand");
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
        let which = LampProperty::from_name(property)
            .ok_or_else(|| DeviceError::PropertyNotSupported(property.to_string()))?;
        self.base.check_readable(property)?;

        Ok(match which {
            LampProperty::State => Value::from(i32::from(self.is_open()?)),
            LampProperty::Intensity => Value::from(self.intensity()?),
        })
    }

    fn write(&self, property: &str, value: Value) -> Result<()> {
        let which = LampProperty::from_name(property)
            .ok_or_else(|| DeviceError::PropertyNotSupported(property.to_string()))?;
        self.base.check_writable(property, &value)?;
        let number = value.as_integer().unwrap_or_default();

        match which {
            LampProperty::State => self.set_open(number == 1),
            LampProperty::Intensity => {
                let intensity = u8::try_from(number).map_err(|_| {
                    DeviceError::ValueOutOfRange(property.to_string(), number.to_string())
                })?;
                self.set_intensity(intensity)
            }
        }
    }

    fn subscribe_events(&self) -> Result<DeviceEventReceiver> {
        self.base.subscribe()
    }
}
