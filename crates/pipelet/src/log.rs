//! Log emitter.
//!
//! - `debug`: human-readable, timestamped lines on a side channel (stderr by
//!   default), switched off entirely in production mode.
//! - `info`/`warn`/`error`: `LogRecord` envelopes on the primary transport.

use std::io::Write;
use std::sync::Mutex;

use chrono::SecondsFormat;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::bridge::protocol::{LogLevel, LogRecord, kind_of};
use crate::config::DebugWriter;
use crate::error::LogError;

pub struct LogEmitter {
    debug: Option<Mutex<DebugWriter>>,
}

impl LogEmitter {
    pub fn new(production: bool, writer: Option<DebugWriter>) -> Self {
        let debug = if production {
            None
        } else {
            Some(Mutex::new(
                writer.unwrap_or_else(|| Box::new(std::io::stderr()) as DebugWriter),
            ))
        };
        Self { debug }
    }

    pub fn debug(&self, message: &str) {
        let Some(ref writer) = self.debug else {
            return;
        };
        let timestamp = chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let mut writer = writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(e) = writeln!(writer, "[{}] debug: {}", timestamp, message)
            .and_then(|()| writer.flush())
        {
            tracing::warn!(error = %e, "Failed to write debug line");
        }
    }
}

/// Build a log record, rejecting metadata that does not serialize to a mapping.
///
/// Metadata that serializes to `null` (`None`, unit) is deliberately accepted
/// and sent as an empty mapping. Every other non-mapping value is rejected.
pub fn log_record<M>(level: LogLevel, message: &str, metadata: &M) -> Result<LogRecord, LogError>
where
    M: Serialize + ?Sized,
{
    let metadata = match serde_json::to_value(metadata)? {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => return Err(LogError::InvalidMetadata(kind_of(&other))),
    };

    Ok(LogRecord {
        level,
        message: message.to_string(),
        metadata,
    })
}
