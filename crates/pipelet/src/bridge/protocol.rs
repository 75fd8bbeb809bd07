//! Wire protocol types for the duplex channel.
//!
//! Every envelope is a JSON array on its own line, tagged by its first element:
//!
//! ```text
//! ["request", id, action, ...params]
//! ["response", id, result]
//! ["init", ready]
//! ["terminate"]
//! ["debug"|"info"|"warn"|"error", message, metadata]
//! ```

use serde::ser::{Serialize, SerializeSeq, Serializer};
use serde_json::{Map, Value};

/// Correlation id linking a request to its response.
///
/// Outbound ids are counters, but the peer may use any JSON value, so inbound
/// ids are echoed back verbatim.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Value);

impl CorrelationId {
    pub fn as_u64(&self) -> Option<u64> {
        self.0.as_u64()
    }
}

impl From<u64> for CorrelationId {
    fn from(id: u64) -> Self {
        Self(Value::from(id))
    }
}

impl From<Value> for CorrelationId {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Severity of a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warn" => Some(Self::Warn),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured diagnostic record carried on the primary transport.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub level: LogLevel,
    pub message: String,
    pub metadata: Map<String, Value>,
}

/// One line of the wire protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Request {
        id: CorrelationId,
        action: String,
        params: Vec<Value>,
    },

    Response {
        id: CorrelationId,
        result: Value,
    },

    Log(LogRecord),

    /// Lifecycle announcement, sent once by `Channel::init`.
    Init {
        ready: bool,
    },

    Terminate,
}

impl Envelope {
    /// Discriminator string written as the first array element.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Request { .. } => "request",
            Self::Response { .. } => "response",
            Self::Log(record) => record.level.as_str(),
            Self::Init { .. } => "init",
            Self::Terminate => "terminate",
        }
    }
}

impl Serialize for Envelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Request { id, action, params } => {
                let mut seq = serializer.serialize_seq(Some(3 + params.len()))?;
                seq.serialize_element(self.tag())?;
                seq.serialize_element(id)?;
                seq.serialize_element(action)?;
                for param in params {
                    seq.serialize_element(param)?;
                }
                seq.end()
            }
            Self::Response { id, result } => {
                let mut seq = serializer.serialize_seq(Some(3))?;
                seq.serialize_element(self.tag())?;
                seq.serialize_element(id)?;
                seq.serialize_element(result)?;
                seq.end()
            }
            Self::Log(record) => {
                let mut seq = serializer.serialize_seq(Some(3))?;
                seq.serialize_element(self.tag())?;
                seq.serialize_element(&record.message)?;
                seq.serialize_element(&record.metadata)?;
                seq.end()
            }
            Self::Init { ready } => {
                let mut seq = serializer.serialize_seq(Some(2))?;
                seq.serialize_element(self.tag())?;
                seq.serialize_element(ready)?;
                seq.end()
            }
            Self::Terminate => {
                let mut seq = serializer.serialize_seq(Some(1))?;
                seq.serialize_element(self.tag())?;
                seq.end()
            }
        }
    }
}

/// A line parsed as JSON but did not form a valid envelope.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("expected a JSON array, got {0}")]
    NotAnArray(&'static str),

    #[error("empty envelope")]
    Empty,

    #[error("discriminator must be a string, got {0}")]
    BadDiscriminator(&'static str),

    #[error("unknown discriminator {0:?}")]
    UnknownDiscriminator(String),

    #[error("malformed {tag} envelope: {reason}")]
    Malformed { tag: &'static str, reason: String },
}

impl DecodeError {
    fn malformed(tag: &'static str, reason: impl Into<String>) -> Self {
        Self::Malformed {
            tag,
            reason: reason.into(),
        }
    }
}

pub(crate) fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

impl TryFrom<Value> for Envelope {
    type Error = DecodeError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let items = match value {
            Value::Array(items) => items,
            other => return Err(DecodeError::NotAnArray(kind_of(&other))),
        };

        let mut items = items.into_iter();
        let tag = match items.next() {
            Some(Value::String(tag)) => tag,
            Some(other) => return Err(DecodeError::BadDiscriminator(kind_of(&other))),
            None => return Err(DecodeError::Empty),
        };
        let rest: Vec<Value> = items.collect();

        match tag.as_str() {
            "request" => decode_request(rest),
            "response" => decode_response(rest),
            "init" => decode_init(rest),
            "terminate" => {
                if !rest.is_empty() {
                    return Err(DecodeError::malformed("terminate", "unexpected payload"));
                }
                Ok(Self::Terminate)
            }
            other => match LogLevel::from_tag(other) {
                Some(level) => decode_log(level, rest),
                None => Err(DecodeError::UnknownDiscriminator(other.to_string())),
            },
        }
    }
}

fn decode_request(rest: Vec<Value>) -> Result<Envelope, DecodeError> {
    let mut rest = rest.into_iter();
    let id = rest
        .next()
        .ok_or_else(|| DecodeError::malformed("request", "missing correlation id"))?;
    let action = match rest.next() {
        Some(Value::String(action)) => action,
        Some(other) => {
            return Err(DecodeError::malformed(
                "request",
                format!("action name must be a string, got {}", kind_of(&other)),
            ));
        }
        None => return Err(DecodeError::malformed("request", "missing action name")),
    };

    Ok(Envelope::Request {
        id: CorrelationId(id),
        action,
        params: rest.collect(),
    })
}

fn decode_response(rest: Vec<Value>) -> Result<Envelope, DecodeError> {
    if rest.len() > 2 {
        return Err(DecodeError::malformed("response", "too many elements"));
    }
    let mut rest = rest.into_iter();
    let id = rest
        .next()
        .ok_or_else(|| DecodeError::malformed("response", "missing correlation id"))?;

    Ok(Envelope::Response {
        id: CorrelationId(id),
        result: rest.next().unwrap_or(Value::Null),
    })
}

// A missing flag means ready, matching the flagless announcement of older peers.
fn decode_init(rest: Vec<Value>) -> Result<Envelope, DecodeError> {
    match rest.as_slice() {
        [] => Ok(Envelope::Init { ready: true }),
        [Value::Bool(ready)] => Ok(Envelope::Init { ready: *ready }),
        [other] => Err(DecodeError::malformed(
            "init",
            format!("ready flag must be a boolean, got {}", kind_of(other)),
        )),
        _ => Err(DecodeError::malformed("init", "too many elements")),
    }
}

fn decode_log(level: LogLevel, rest: Vec<Value>) -> Result<Envelope, DecodeError> {
    let tag = level.as_str();
    let mut rest = rest.into_iter();
    let message = match rest.next() {
        Some(Value::String(message)) => message,
        Some(other) => {
            return Err(DecodeError::malformed(
                tag,
                format!("message must be a string, got {}", kind_of(&other)),
            ));
        }
        None => return Err(DecodeError::malformed(tag, "missing message")),
    };
    let metadata = match rest.next() {
        Some(Value::Object(map)) => map,
        None | Some(Value::Null) => Map::new(),
        Some(other) => {
            return Err(DecodeError::malformed(
                tag,
                format!("metadata must be an object, got {}", kind_of(&other)),
            ));
        }
    };
    if rest.next().is_some() {
        return Err(DecodeError::malformed(tag, "too many elements"));
    }

    Ok(Envelope::Log(LogRecord {
        level,
        message,
        metadata,
    }))
}
