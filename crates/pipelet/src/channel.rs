//! Channel - the one instance per process that owns the action registry,
//! pending-call table, lifecycle state and transport.
//!
//! Flow:
//! 1. `Channel::new` (or `Channel::stdio`), register actions and lifecycle subscribers
//! 2. `init` starts the read loop and announces readiness to the peer
//! 3. The read loop dispatches inbound lines one at a time
//! 4. On terminate (either side): fire `end`, close the transport, reject pending calls
//! 5. `closed` reports how the loop stopped

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::CodecError;
use crate::bridge::protocol::{Envelope, LogLevel};
use crate::bridge::transport::{LineReader, LineWriter, line_reader};
use crate::config::ChannelConfig;
use crate::dispatch::{Dispatcher, Flow};
use crate::error::{CallError, ChannelError};
use crate::lifecycle::{Lifecycle, LifecycleEvent, Phase};
use crate::log::{LogEmitter, log_record};
use crate::pending::{PendingCalls, PendingReply};
use crate::registry::{ActionRegistry, ActionResult};

/// How the read loop stopped without a fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// A terminate envelope arrived or `terminate` was called locally.
    Terminated,
    /// The inbound stream reached end of input.
    Disconnected,
}

type Outcome = Result<Shutdown, ChannelError>;

/// Process exit code for a channel outcome: 0 on a clean stop, 1 on a fatal error.
pub fn exit_code(outcome: &Result<Shutdown, ChannelError>) -> i32 {
    match outcome {
        Ok(_) => 0,
        Err(_) => 1,
    }
}

/// Held until `init` moves it into the read loop.
struct Startup {
    reader: LineReader,
    outcome: oneshot::Sender<Outcome>,
}

struct Inner {
    registry: ActionRegistry,
    pending: Arc<PendingCalls>,
    lifecycle: Lifecycle,
    writer: LineWriter,
    log: LogEmitter,
    startup: StdMutex<Option<Startup>>,
    outcome: StdMutex<Option<oneshot::Receiver<Outcome>>>,
    /// Cancelled when close starts; stops the read loop.
    closing: CancellationToken,
    /// Cancelled once close has flushed the writer and rejected pending calls.
    shut_down: CancellationToken,
    closed: AtomicBool,
}

/// Handle to the duplex channel. Cheap to clone; all clones share one instance.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<Inner>,
}

impl Channel {
    /// Build a channel over an inbound and outbound byte stream.
    ///
    /// Must be called within a Tokio runtime (the outbound writer task starts here).
    pub fn new<R, W>(reader: R, writer: W, config: ChannelConfig) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (outcome_tx, outcome_rx) = oneshot::channel();

        let inner = Inner {
            registry: ActionRegistry::new(),
            pending: Arc::new(PendingCalls::new(config.call_timeout)),
            lifecycle: Lifecycle::new(),
            writer: LineWriter::new(writer),
            log: LogEmitter::new(config.production, config.debug_writer),
            startup: StdMutex::new(Some(Startup {
                reader: line_reader(reader),
                outcome: outcome_tx,
            })),
            outcome: StdMutex::new(Some(outcome_rx)),
            closing: CancellationToken::new(),
            shut_down: CancellationToken::new(),
            closed: AtomicBool::new(false),
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    /// Channel over this process's stdin/stdout.
    pub fn stdio(config: ChannelConfig) -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout(), config)
    }

    /// Expose an action to the peer. Handlers run on the read loop and block
    /// further inbound dispatch until they return.
    pub fn register<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Vec<Value>) -> ActionResult + Send + Sync + 'static,
    {
        self.inner.registry.register(name, handler);
    }

    /// Subscribe to a local lifecycle event.
    pub fn on<F>(&self, event: LifecycleEvent, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.lifecycle.subscribe(event, callback);
    }

    pub fn phase(&self) -> Phase {
        self.inner.lifecycle.phase()
    }

    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    /// Start the read loop and announce readiness.
    ///
    /// Sends `["init", ready]`, then moves to Online/Offline and waits for the
    /// peer to acknowledge the matching `online`/`offline` request.
    pub async fn init(&self, ready: bool) -> Result<(), ChannelError> {
        let inner = &self.inner;
        inner.lifecycle.transition(Phase::Ready)?;

        let startup = inner
            .startup
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or(ChannelError::NotRunning)?;
        spawn_read_loop(Arc::clone(inner), startup);

        inner.lifecycle.emit(LifecycleEvent::Init);
        inner.writer.send(Envelope::Init { ready })?;

        let phase = if ready { Phase::Online } else { Phase::Offline };
        let reply = self.announce(phase)?;
        reply.await?;
        tracing::info!(?phase, "Channel initialized");
        Ok(())
    }

    /// Go online now and tell the peer, without waiting for its acknowledgement.
    pub fn online(&self) -> Result<(), ChannelError> {
        self.switch_phase(Phase::Online)
    }

    /// Go offline now and tell the peer, without waiting for its acknowledgement.
    pub fn offline(&self) -> Result<(), ChannelError> {
        self.switch_phase(Phase::Offline)
    }

    fn switch_phase(&self, phase: Phase) -> Result<(), ChannelError> {
        let reply = self.announce(phase)?;
        tokio::spawn(async move {
            if let Err(e) = reply.await {
                tracing::warn!(error = %e, ?phase, "Peer did not acknowledge phase change");
            }
        });
        Ok(())
    }

    fn announce(&self, phase: Phase) -> Result<PendingReply, ChannelError> {
        let (event, action) = match phase {
            Phase::Online => (LifecycleEvent::Online, "online"),
            _ => (LifecycleEvent::Offline, "offline"),
        };
        self.inner.lifecycle.transition(phase)?;
        self.inner.lifecycle.emit(event);
        Ok(self.request(action, Vec::new())?)
    }

    /// Invoke `action` on the peer and wait for its result.
    ///
    /// Fails with `CallError::Timeout` if no response arrives within the
    /// configured call timeout. There is no retry.
    pub async fn call(&self, action: &str, params: Vec<Value>) -> Result<Value, CallError> {
        self.request(action, params)?.await
    }

    /// Queue a request and return the future for its response.
    ///
    /// The request is on the outbound queue when this returns, so requests
    /// issued in sequence reach the peer in that order.
    pub fn request(&self, action: &str, params: Vec<Value>) -> Result<PendingReply, CallError> {
        let reply = self.inner.pending.register();
        let id = reply.id();
        tracing::debug!(id, action, "Sending request");

        let envelope = Envelope::Request {
            id: id.into(),
            action: action.to_string(),
            params,
        };
        if self.inner.writer.send(envelope).is_err() {
            self.inner.pending.cancel(id);
            return Err(CallError::ChannelClosed);
        }
        Ok(reply)
    }

    /// Write a timestamped line to the debug side channel (no-op in production).
    pub fn debug(&self, message: &str) {
        self.inner.log.debug(message);
    }

    pub fn info<M>(&self, message: &str, metadata: &M) -> Result<(), ChannelError>
    where
        M: Serialize + ?Sized,
    {
        self.log(LogLevel::Info, message, metadata)
    }

    pub fn warn<M>(&self, message: &str, metadata: &M) -> Result<(), ChannelError>
    where
        M: Serialize + ?Sized,
    {
        self.log(LogLevel::Warn, message, metadata)
    }

    pub fn error<M>(&self, message: &str, metadata: &M) -> Result<(), ChannelError>
    where
        M: Serialize + ?Sized,
    {
        self.log(LogLevel::Error, message, metadata)
    }

    /// Emit a log record at `level`. `Debug` goes to the side channel and ignores metadata.
    pub fn log<M>(&self, level: LogLevel, message: &str, metadata: &M) -> Result<(), ChannelError>
    where
        M: Serialize + ?Sized,
    {
        if level == LogLevel::Debug {
            self.debug(message);
            return Ok(());
        }
        let record = log_record(level, message, metadata)?;
        self.inner.writer.send(Envelope::Log(record))?;
        Ok(())
    }

    /// Terminate locally: fire `end`, tell the peer, close the transport.
    pub async fn terminate(&self) {
        self.inner.terminate(true).await;
    }

    /// Wait for the read loop to stop and the transport to finish closing.
    ///
    /// By the time this resolves, queued output is flushed and pending calls
    /// are rejected. Resolves with the fatal error if dispatch failed. Only the first caller
    /// receives the outcome; later calls get `ChannelError::NotRunning`.
    pub async fn closed(&self) -> Result<Shutdown, ChannelError> {
        let rx = self
            .inner
            .outcome
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or(ChannelError::NotRunning)?;
        rx.await.unwrap_or(Err(ChannelError::NotRunning))
    }
}

impl Inner {
    fn dispatcher(&self) -> Dispatcher<'_> {
        Dispatcher {
            registry: &self.registry,
            pending: &self.pending,
            writer: &self.writer,
        }
    }

    /// Termination transition. The first caller fires `end`, and every
    /// subscriber returns before the transport is closed.
    async fn terminate(&self, notify_peer: bool) {
        if !self.lifecycle.begin_termination() {
            tracing::debug!("Termination already in progress");
            return;
        }

        self.lifecycle.emit(LifecycleEvent::End);

        if notify_peer {
            if let Err(e) = self.writer.send(Envelope::Terminate) {
                tracing::debug!(error = %e, "Could not send terminate to peer");
            }
        }

        self.close(Shutdown::Terminated).await;
    }

    /// Close the transport exactly once and reject whatever is still pending.
    async fn close(&self, reason: Shutdown) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.closing.cancel();
        self.writer.close().await;

        let rejected = self.pending.reject_all();
        if rejected > 0 {
            tracing::debug!(rejected, "Rejected pending calls at shutdown");
        }
        self.lifecycle.close();
        self.shut_down.cancel();

        // The read loop never started, so nobody else will report the outcome.
        let startup = self
            .startup
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(startup) = startup {
            let _ = startup.outcome.send(Ok(reason));
        }

        tracing::info!(?reason, "Channel closed");
    }
}

fn spawn_read_loop(inner: Arc<Inner>, startup: Startup) {
    let Startup { reader, outcome } = startup;
    let handle = tokio::spawn(read_loop(Arc::clone(&inner), reader));

    tokio::spawn(async move {
        let result = match handle.await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(error = %e, "Read loop task failed");
                inner.close(Shutdown::Terminated).await;
                Err(ChannelError::Panicked(e.to_string()))
            }
        };
        // The loop may have stopped on a close another task is still running.
        inner.shut_down.cancelled().await;
        let _ = outcome.send(result);
    });
}

async fn read_loop(inner: Arc<Inner>, mut reader: LineReader) -> Outcome {
    let dispatcher = inner.dispatcher();
    tracing::debug!("Read loop started");

    loop {
        let next = tokio::select! {
            biased;

            _ = inner.closing.cancelled() => {
                tracing::debug!("Read loop stopped by local close");
                return Ok(Shutdown::Terminated);
            }

            next = reader.next() => next,
        };

        match next {
            Some(Ok(envelope)) => match dispatcher.dispatch(envelope) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Terminate) => {
                    inner.terminate(false).await;
                    return Ok(Shutdown::Terminated);
                }
                Err(e) => {
                    if inner.closing.is_cancelled() {
                        tracing::debug!(error = %e, "Dispatch failed after close");
                        return Ok(Shutdown::Terminated);
                    }
                    tracing::error!(error = %e, "Fatal dispatch error");
                    inner.close(Shutdown::Terminated).await;
                    return Err(e);
                }
            },
            Some(Err(e)) => {
                tracing::error!(error = %e, "Failed to read inbound line");
                inner.close(Shutdown::Terminated).await;
                return Err(match e {
                    CodecError::Io(e) => ChannelError::Transport(e),
                    other => ChannelError::Protocol(other),
                });
            }
            None => {
                tracing::info!("Inbound stream ended, peer disconnected");
                inner.close(Shutdown::Disconnected).await;
                return Ok(Shutdown::Disconnected);
            }
        }
    }
}
