/*!
 * Configuration management for ScopeFlow.
 *
 * Settings are layered from built-in defaults, an optional TOML file and
 * environment variables (`PREFIX__SECTION__KEY`).
 */
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use config::{Config as ConfigLib, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Core configuration for ScopeFlow
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General configuration
    #[serde(default)]
    pub general: GeneralConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Serial line configuration
    #[serde(default)]
    pub serial: SerialConfig,

    /// Command hub configuration
    #[serde(default)]
    pub hub: HubConfig,

    /// Focus drive configuration
    #[serde(default)]
    pub focus: FocusConfig,

    /// Lamp configuration
    #[serde(default)]
    pub lamp: LampConfig,

    /// Objective nosepiece configuration
    #[serde(default)]
    pub nosepiece: NosepieceConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// Application environment (development, production, etc.)
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log filter (trace, debug, info, warn, error, or a full directive)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to print the event target
    #[serde(default = "default_true")]
    pub show_target: bool,
}

/// Serial line configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Port name (e.g. "COM7", "/dev/ttyUSB0"); unset until the host picks one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,

    /// Baud rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Answer timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Frame terminator
    #[serde(default = "default_terminator")]
    pub terminator: String,
}

/// What happens when the host changes the port after initialization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortChangePolicy {
    /// Keep the old port and report success
    #[default]
    SilentRevert,
    /// Refuse the change with an error
    Reject,
}

/// Command hub configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Device group id addressed by every frame
    #[serde(default = "default_device_group")]
    pub device_group: u8,

    /// Microscope type assumed when the stand does not answer the type query
    #[serde(default = "default_microscope")]
    pub default_microscope: String,

    /// Port change behavior after initialization
    #[serde(default)]
    pub port_change_policy: PortChangePolicy,
}

/// Focus drive configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FocusConfig {
    /// Size of one drive step in micrometers
    #[serde(default = "default_step_size_um")]
    pub step_size_um: f64,

    /// Lower travel limit in micrometers
    #[serde(default)]
    pub lower_limit_um: f64,

    /// Upper travel limit in micrometers
    #[serde(default = "default_upper_limit_um")]
    pub upper_limit_um: f64,

    /// Time after a move during which the drive reports busy
    #[serde(default)]
    pub settle_delay_ms: u64,
}

/// Lamp configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LampConfig {
    /// Time after a change during which the lamp reports busy
    #[serde(default)]
    pub settle_delay_ms: u64,

    /// Highest intensity value accepted by the lamp
    #[serde(default = "default_max_intensity")]
    pub max_intensity: u8,
}

/// Objective nosepiece configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NosepieceConfig {
    /// Number of objective positions
    #[serde(default = "default_positions")]
    pub positions: usize,

    /// Command id that moves the nosepiece; unset makes the position read-only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set_position_command: Option<u16>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            environment: default_environment(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            show_target: true,
        }
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: default_baud_rate(),
            timeout_ms: default_timeout_ms(),
            terminator: default_terminator(),
        }
    }
}

impl SerialConfig {
    /// Answer timeout as a duration
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            device_group: default_device_group(),
            default_microscope: default_microscope(),
            port_change_policy: PortChangePolicy::default(),
        }
    }
}

impl Default for FocusConfig {
    fn default() -> Self {
        Self {
            step_size_um: default_step_size_um(),
            lower_limit_um: 0.0,
            upper_limit_um: default_upper_limit_um(),
            settle_delay_ms: 0,
        }
    }
}

impl Default for LampConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: 0,
            max_intensity: default_max_intensity(),
        }
    }
}

impl Default for NosepieceConfig {
    fn default() -> Self {
        Self {
            positions: default_positions(),
            set_position_command: None,
        }
    }
}

fn default_app_name() -> String {
    "scopeflow".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_terminator() -> String {
    "\r".to_string()
}

fn default_device_group() -> u8 {
    50
}

fn default_microscope() -> String {
    "RxE".to_string()
}

fn default_step_size_um() -> f64 {
    0.1
}

fn default_upper_limit_um() -> f64 {
    25000.0
}

fn default_max_intensity() -> u8 {
    255
}

fn default_positions() -> usize {
    7
}

impl Config {
    /// Validate values that serde cannot check on its own
    pub fn validate(&self) -> Result<()> {
        if self.hub.device_group > 99 {
            return Err(Error::config(format!(
                "Device group {} does not fit in two digits",
                self.hub.device_group
            )));
        }
        if self.focus.step_size_um <= 0.0 {
            return Err(Error::config("Focus step size must be positive"));
        }
        if self.focus.lower_limit_um > self.focus.upper_limit_um {
            return Err(Error::config("Focus lower limit is above the upper limit"));
        }
        if self.nosepiece.positions == 0 {
            return Err(Error::config("Nosepiece needs at least one position"));
        }
        if let Some(cmd) = self.nosepiece.set_position_command {
            if cmd > 999 {
                return Err(Error::config(format!(
                    "Nosepiece command {} does not fit in three digits",
                    cmd
                )));
            }
        }
        if self.serial.terminator.is_empty() {
            return Err(Error::config("Serial terminator must not be empty"));
        }
        Ok(())
    }

    /// Render the configuration as TOML, e.g. to write a template file
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// A builder for creating a configuration
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config_file: Option<String>,
    environment_prefix: Option<String>,
    override_with: Option<Config>,
}

impl ConfigBuilder {
    /// Create a new ConfigBuilder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the config file path
    pub fn with_config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Set the environment variable prefix for configuration
    pub fn with_environment_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.environment_prefix = Some(prefix.as_ref().to_string());
        self
    }

    /// Override with an existing config
    pub fn override_with(mut self, config: Config) -> Self {
        self.override_with = Some(config);
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<Config> {
        if let Some(config) = self.override_with {
            config.validate()?;
            return Ok(config);
        }

        let mut config_builder = ConfigLib::builder();

        let default_config = Config::default();
        config_builder = config_builder.add_source(
            ConfigLib::try_from(&default_config)
                .map_err(|e| Error::config(format!("Failed to create default config: {}", e)))?,
        );

        if let Some(config_file) = self.config_file {
            let path = Path::new(&config_file);
            if path.exists() {
                debug!("Loading configuration from {}", config_file);
                config_builder = config_builder.add_source(File::with_name(&config_file));
            } else {
                debug!("Configuration file {} does not exist, using defaults", config_file);
            }
        }

        if let Some(prefix) = self.environment_prefix {
            debug!("Loading configuration from environment variables with prefix {}", prefix);
            config_builder = config_builder.add_source(
                Environment::with_prefix(&prefix)
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let config_lib = config_builder
            .build()
            .map_err(|e| Error::config(format!("Failed to build configuration: {}", e)))?;

        let config: Config = config_lib
            .try_deserialize()
            .map_err(|e| Error::config(format!("Failed to deserialize configuration: {}", e)))?;

        config.validate()?;
        info!("Configuration loaded successfully");
        Ok(config)
    }
}

/// A thread-safe reference to a configuration
#[derive(Debug, Clone)]
pub struct SharedConfig(Arc<Config>);

impl SharedConfig {
    /// Create a new SharedConfig
    pub fn new(config: Config) -> Self {
        Self(Arc::new(config))
    }

    /// Get a reference to the config
    pub fn get(&self) -> &Config {
        &self.0
    }
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl From<Config> for SharedConfig {
    fn from(config: Config) -> Self {
        Self::new(config)
    }
}

impl AsRef<Config> for SharedConfig {
    fn as_ref(&self) -> &Config {
        self.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.general.app_name, "scopeflow");
        assert_eq!(config.serial.port, None);
        assert_eq!(config.serial.terminator, "\r");
        assert_eq!(config.hub.device_group, 50);
        assert_eq!(config.hub.default_microscope, "RxE");
        assert_eq!(config.hub.port_change_policy, PortChangePolicy::SilentRevert);
        assert_eq!(config.focus.step_size_um, 0.1);
        assert_eq!(config.focus.upper_limit_um, 25000.0);
        assert_eq!(config.nosepiece.positions, 7);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder_defaults() -> Result<()> {
        let config = ConfigBuilder::new().build()?;
        assert_eq!(config.general.app_name, "scopeflow");
        assert_eq!(config.serial.baud_rate, 9600);
        assert_eq!(config.serial.port, None);
        Ok(())
    }

    #[test]
    fn test_config_builder_with_file() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("scope.toml");

        {
            let mut file = File::create(&file_path)?;
            file.write_all(br#"
                [serial]
                port = "COM7"
                timeout_ms = 250

                [hub]
                port_change_policy = "reject"

                [nosepiece]
                positions = 5
                set_position_command = 22
            "#)?;
        }

        let config = ConfigBuilder::new().with_config_file(&file_path).build()?;

        assert_eq!(config.serial.port.as_deref(), Some("COM7"));
        assert_eq!(config.serial.timeout(), Duration::from_millis(250));
        assert_eq!(config.hub.port_change_policy, PortChangePolicy::Reject);
        assert_eq!(config.nosepiece.positions, 5);
        assert_eq!(config.nosepiece.set_position_command, Some(22));
        assert_eq!(config.focus.step_size_um, 0.1);

        Ok(())
    }

    #[test]
    fn test_config_builder_with_env() -> Result<()> {
        env::set_var("SCOPEFLOW_ENV_TEST__LOGGING__LEVEL", "trace");
        env::set_var("SCOPEFLOW_ENV_TEST__LAMP__SETTLE_DELAY_MS", "40");

        let config = ConfigBuilder::new()
            .with_environment_prefix("scopeflow_env_test")
            .build()?;

        assert_eq!(config.logging.level, "trace");
        assert_eq!(config.lamp.settle_delay_ms, 40);

        env::remove_var("SCOPEFLOW_ENV_TEST__LOGGING__LEVEL");
        env::remove_var("SCOPEFLOW_ENV_TEST__LAMP__SETTLE_DELAY_MS");

        Ok(())
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.hub.device_group = 100;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = Config::default();
        config.focus.step_size_um = 0.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.nosepiece.set_position_command = Some(1000);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_to_toml_template() -> Result<()> {
        let rendered = Config::default().to_toml()?;
        assert!(rendered.contains("[serial]"));
        assert!(rendered.contains("device_group = 50"));
        assert!(!rendered.contains("port ="));
        Ok(())
    }

    #[test]
    fn test_shared_config() {
        let shared = SharedConfig::new(Config::default());
        let clone = shared.clone();
        assert_eq!(clone.get().hub.device_group, 50);
        assert_eq!(shared.as_ref().general.app_name, "scopeflow");
    }
}
