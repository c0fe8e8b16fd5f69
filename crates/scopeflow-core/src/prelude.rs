/*!
 * Prelude module for ScopeFlow Core.
 *
 * Re-exports the types most crates built on ScopeFlow Core need.
 */

pub use crate::error::{Error, Result};

pub use crate::types::{Id, Metadata, Value};

pub use crate::event::{EventBus, Priority, SharedEventBus, TypedEvent};

pub use crate::config::{
    Config, ConfigBuilder, FocusConfig, HubConfig, LampConfig, NosepieceConfig,
    PortChangePolicy, SerialConfig, SharedConfig,
};

pub use crate::utils::{duration_to_millis, millis_to_duration, with_retry};

pub use tracing::{debug, error, info, trace, warn};

pub use crate::init;
