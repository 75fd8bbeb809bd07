//! Channel configuration.

use std::io::Write;
use std::time::Duration;

/// Default time an outbound call waits for its response.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_millis(3000);

/// Set to a truthy value to disable the debug channel.
pub const PRODUCTION_ENV: &str = "PIPELET_PRODUCTION";

/// Overrides the call timeout, in milliseconds.
pub const CALL_TIMEOUT_ENV: &str = "PIPELET_CALL_TIMEOUT_MS";

/// Destination of the debug side channel.
pub type DebugWriter = Box<dyn Write + Send>;

pub struct ChannelConfig {
    /// Production mode drops `debug` output; `info`/`warn`/`error` are unaffected.
    pub production: bool,
    pub call_timeout: Duration,
    /// Defaults to stderr.
    pub debug_writer: Option<DebugWriter>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            production: false,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            debug_writer: None,
        }
    }
}

impl ChannelConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read `PIPELET_PRODUCTION` and `PIPELET_CALL_TIMEOUT_MS`.
    pub fn from_env() -> Self {
        let mut config = Self::new();

        if let Ok(value) = std::env::var(PRODUCTION_ENV) {
            config.production = parse_flag(&value);
        }

        if let Ok(value) = std::env::var(CALL_TIMEOUT_ENV) {
            match value.trim().parse::<u64>() {
                Ok(ms) => config.call_timeout = Duration::from_millis(ms),
                Err(e) => tracing::warn!(
                    var = CALL_TIMEOUT_ENV,
                    value = %value,
                    error = %e,
                    "Ignoring invalid call timeout"
                ),
            }
        }

        config
    }

    pub fn with_production(mut self, production: bool) -> Self {
        self.production = production;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_debug_writer(mut self, writer: impl Write + Send + 'static) -> Self {
        self.debug_writer = Some(Box::new(writer));
        self
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on" | "production"
    )
}
