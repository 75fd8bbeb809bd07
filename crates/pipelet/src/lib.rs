//! pipelet: duplex remote-call channel over newline-delimited JSON.
//!
//! One `Channel` per process owns the action registry, pending-call table,
//! lifecycle state and the line transport (stdio by default).

pub mod bridge;
pub mod channel;
pub mod config;
mod dispatch;
pub mod error;
pub mod lifecycle;
pub mod log;
pub mod pending;
pub mod registry;
pub mod telemetry;

#[cfg(test)]
mod test_support;

pub use bridge::protocol::{CorrelationId, Envelope, LogLevel, LogRecord};
pub use channel::{Channel, Shutdown, exit_code};
pub use config::ChannelConfig;
pub use error::{CallError, ChannelError, HandlerError, LifecycleError, LogError};
pub use lifecycle::{LifecycleEvent, Phase};
pub use registry::ActionResult;
pub use telemetry::init_tracing;
