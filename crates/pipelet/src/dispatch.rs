//! Inbound dispatch - routes one decoded envelope at a time.
//!
//! Dispatch is synchronous: a request handler runs to completion and its
//! response is queued before the read loop decodes the next line.

use serde_json::Value;

use crate::bridge::protocol::{Envelope, LogLevel, LogRecord};
use crate::bridge::transport::LineWriter;
use crate::error::ChannelError;
use crate::pending::PendingCalls;
use crate::registry::ActionRegistry;

/// What the read loop should do after an envelope was dispatched.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Terminate,
}

pub(crate) struct Dispatcher<'a> {
    pub registry: &'a ActionRegistry,
    pub pending: &'a PendingCalls,
    pub writer: &'a LineWriter,
}

impl Dispatcher<'_> {
    pub fn dispatch(&self, envelope: Envelope) -> Result<Flow, ChannelError> {
        match envelope {
            Envelope::Request { id, action, params } => {
                let handler = self
                    .registry
                    .get(&action)
                    .ok_or_else(|| ChannelError::UnknownAction {
                        action: action.clone(),
                    })?;

                tracing::debug!(%id, action = %action, params = params.len(), "Dispatching request");
                let result = handler(params).map_err(|source| ChannelError::Handler {
                    action: action.clone(),
                    source,
                })?;

                self.writer.send(Envelope::Response { id, result })?;
                Ok(Flow::Continue)
            }

            Envelope::Response { id, result } => {
                let resolved = id
                    .as_u64()
                    .is_some_and(|n| self.pending.resolve(n, result));
                if !resolved {
                    tracing::debug!(%id, "Discarding response with no pending call");
                }
                Ok(Flow::Continue)
            }

            Envelope::Terminate => {
                tracing::info!("Peer requested termination");
                Ok(Flow::Terminate)
            }

            // Init is only ever announced by this side.
            Envelope::Init { ready } => {
                tracing::warn!(ready, "Ignoring inbound init announcement");
                Ok(Flow::Continue)
            }

            Envelope::Log(record) => {
                emit_peer_log(&record);
                Ok(Flow::Continue)
            }
        }
    }
}

/// Re-emit a peer's log record through tracing, preserving its level.
fn emit_peer_log(record: &LogRecord) {
    let metadata = Value::Object(record.metadata.clone());
    let message = record.message.as_str();
    match record.level {
        LogLevel::Debug => tracing::debug!(target: "pipelet::peer", %metadata, "{}", message),
        LogLevel::Info => tracing::info!(target: "pipelet::peer", %metadata, "{}", message),
        LogLevel::Warn => tracing::warn!(target: "pipelet::peer", %metadata, "{}", message),
        LogLevel::Error => tracing::error!(target: "pipelet::peer", %metadata, "{}", message),
    }
}
