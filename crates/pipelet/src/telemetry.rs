//! Process-wide tracing setup.
//!
//! Diagnostics always go to stderr: stdout carries the NDJSON stream when
//! the channel runs over stdio.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Level for pipelet targets when `RUST_LOG` is unset.
pub const LOG_LEVEL_ENV: &str = "PIPELET_LOG";

/// Install a stderr subscriber. `RUST_LOG` wins; otherwise `PIPELET_LOG`
/// picks the level. `LOG_FORMAT=json` switches to JSON lines.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = base_level(std::env::var(LOG_LEVEL_ENV).ok().as_deref());
        EnvFilter::new(format!("pipelet={level},pipelet_mock={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn base_level(value: Option<&str>) -> &'static str {
    match value {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names() {
        assert_eq!(base_level(None), "info");
        assert_eq!(base_level(Some("debug")), "debug");
        assert_eq!(base_level(Some("warning")), "warn");
        assert_eq!(base_level(Some("error")), "error");
        assert_eq!(base_level(Some("loud")), "info");
    }

    #[test]
    fn init_twice_is_harmless() {
        init_tracing();
        init_tracing();
    }
}
