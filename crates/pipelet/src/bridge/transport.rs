//! Byte-stream transport for the channel.
//!
//! Inbound: a framed line reader over any AsyncRead, consumed by the dispatch loop.
//! Outbound: every envelope is queued onto one mpsc channel and written by a
//! single task, so concurrently produced envelopes never interleave mid-line.

use std::io;
use std::sync::Mutex as StdMutex;

use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use super::codec::{CodecError, EnvelopeCodec};
use super::protocol::Envelope;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Inbound half: yields one decoded envelope per line.
pub type LineReader = FramedRead<BoxedReader, EnvelopeCodec>;

pub fn line_reader<R>(reader: R) -> LineReader
where
    R: AsyncRead + Send + Unpin + 'static,
{
    FramedRead::new(Box::new(reader) as BoxedReader, EnvelopeCodec::new())
}

/// Outbound half: serialized line writer.
///
/// `send` never blocks; envelopes are written in the order they were queued.
/// Must be created within a Tokio runtime.
pub struct LineWriter {
    tx: StdMutex<Option<mpsc::UnboundedSender<Envelope>>>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl LineWriter {
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let sink = FramedWrite::new(Box::new(writer) as BoxedWriter, EnvelopeCodec::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(write_loop(sink, rx));

        Self {
            tx: StdMutex::new(Some(tx)),
            task: tokio::sync::Mutex::new(Some(task)),
        }
    }

    /// Queue an envelope for writing.
    pub fn send(&self, envelope: Envelope) -> io::Result<()> {
        let guard = self.tx.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let tx = guard
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "transport closed"))?;
        tx.send(envelope)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "transport writer exited"))
    }

    /// Stop accepting envelopes, flush everything already queued and shut the stream down.
    ///
    /// Safe to call more than once; later calls return once the first has finished.
    pub async fn close(&self) {
        let sender = self
            .tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        drop(sender);

        let mut task = self.task.lock().await;
        if let Some(handle) = task.take()
            && let Err(e) = handle.await
        {
            tracing::error!(error = %e, "Transport writer task failed");
        }
    }
}

async fn write_loop(
    mut sink: FramedWrite<BoxedWriter, EnvelopeCodec>,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
) {
    while let Some(envelope) = rx.recv().await {
        if let Err(e) = sink.send(envelope).await {
            log_write_error(&e);
            return;
        }
    }

    if let Err(e) = sink.close().await {
        log_write_error(&e);
    }
    tracing::trace!("Transport writer exiting");
}

fn log_write_error(err: &CodecError) {
    match err {
        CodecError::Io(e) if e.kind() == io::ErrorKind::BrokenPipe => {
            tracing::debug!("Peer closed the outbound stream");
        }
        _ => tracing::error!(error = %err, "Failed to write envelope"),
    }
}
