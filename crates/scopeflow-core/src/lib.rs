/*!
 * ScopeFlow Core
 *
 * Shared plumbing for the ScopeFlow microscope stack: configuration,
 * logging, the event bus and the core error type.
 */

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod event;
pub mod logging;
pub mod prelude;
pub mod types;
pub mod utils;

/// Re-export of dependencies that are part of the public API
pub mod deps {
    pub use chrono;
    pub use serde;
    pub use tokio;
    pub use tracing;
    pub use uuid;
}

/// ScopeFlow core crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library initialization
pub fn init() -> Result<(), error::Error> {
    logging::init()?;
    tracing::info!("ScopeFlow Core {} initialized", VERSION);
    Ok(())
}
