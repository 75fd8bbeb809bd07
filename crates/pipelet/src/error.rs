//! Error types for the channel.

use std::io;
use std::time::Duration;

use crate::bridge::codec::CodecError;
use crate::lifecycle::Phase;

/// Error returned by a registered action handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Failure of a single outbound call. Only the awaiting caller sees it.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("request timeout - {id} (no response after {}ms)", .after.as_millis())]
    Timeout { id: u64, after: Duration },

    #[error("channel closed before a response arrived")]
    ChannelClosed,
}

/// Invalid lifecycle transition.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("cannot move from {from:?} to {to:?}")]
    InvalidTransition { from: Phase, to: Phase },
}

/// Rejected log emission.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("log metadata must be a key-value mapping, got {0}")]
    InvalidMetadata(&'static str),

    #[error("log metadata is not serializable: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Channel-level errors.
///
/// `Protocol`, `UnknownAction` and `Handler` are fatal: the dispatch loop stops
/// and the embedding process is expected to exit.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("protocol decode error: {0}")]
    Protocol(#[source] CodecError),

    #[error("unknown action {action:?}")]
    UnknownAction { action: String },

    #[error("action {action:?} failed: {source}")]
    Handler {
        action: String,
        #[source]
        source: HandlerError,
    },

    #[error("dispatch loop panicked: {0}")]
    Panicked(String),

    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    Call(#[from] CallError),

    #[error("channel is not running")]
    NotRunning,
}

impl ChannelError {
    /// Whether this error means the channel is desynchronized and the process must exit.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Protocol(_) | Self::UnknownAction { .. } | Self::Handler { .. } | Self::Panicked(_)
        )
    }
}
