//! Shared helpers for unit tests: an in-memory peer and a capturable writer.

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines};

use crate::channel::Channel;
use crate::config::ChannelConfig;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// `Write` sink whose contents can be inspected from another handle.
#[derive(Clone, Default)]
pub(crate) struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    pub(crate) fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// The far end of a channel under test, speaking raw lines.
pub(crate) struct Peer {
    lines: Lines<BufReader<DuplexStream>>,
    writer: Option<DuplexStream>,
}

impl Peer {
    /// Next line the channel wrote, parsed as JSON. `None` once the channel closed its output.
    pub(crate) async fn recv(&mut self) -> Option<Value> {
        let line = tokio::time::timeout(RECV_TIMEOUT, self.lines.next_line())
            .await
            .expect("timed out waiting for a line from the channel")
            .expect("peer read failed")?;
        Some(serde_json::from_str(&line).expect("channel wrote invalid json"))
    }

    pub(crate) async fn expect(&mut self) -> Value {
        self.recv().await.expect("channel closed its output")
    }

    pub(crate) async fn send(&mut self, value: Value) {
        self.send_raw(&value.to_string()).await;
    }

    pub(crate) async fn send_raw(&mut self, line: &str) {
        let writer = self.writer.as_mut().expect("peer output already closed");
        writer.write_all(line.as_bytes()).await.unwrap();
        writer.write_all(b"\n").await.unwrap();
        writer.flush().await.unwrap();
    }

    /// Close our output: the channel sees end of input.
    pub(crate) fn hang_up(&mut self) {
        self.writer = None;
    }
}

pub(crate) fn channel_pair(config: ChannelConfig) -> (Channel, Peer) {
    let (channel_in, peer_out) = tokio::io::duplex(64 * 1024);
    let (channel_out, peer_in) = tokio::io::duplex(64 * 1024);

    let channel = Channel::new(channel_in, channel_out, config);
    let peer = Peer {
        lines: BufReader::new(peer_in).lines(),
        writer: Some(peer_out),
    };
    (channel, peer)
}
