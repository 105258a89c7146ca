pub mod config;
pub mod controller;
pub mod dispatch;
pub mod logging;
pub mod metrics;
#[cfg(test)]
mod testing;

pub use config::{ConfigError, TrackingConfig};
pub use controller::{BodyOutcome, PluginController};
pub use dispatch::EventDispatcher;
