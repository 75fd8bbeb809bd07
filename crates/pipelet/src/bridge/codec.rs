//! Line codec for envelopes.
//!
//! Uses LinesCodec for framing + serde_json for serialization.
//! Works over any AsyncRead/AsyncWrite (stdio, pipes, sockets).

use std::io;

use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use super::protocol::{DecodeError, Envelope};

/// Longest accepted inbound line. Anything longer means the stream is out of sync.
pub const MAX_LINE_LENGTH: usize = 64 * 1024 * 1024;

/// Readiness marker written by legacy peers as a bare JSON string.
const LEGACY_INIT_MARKER: &str = "\"init\"";

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("line exceeds {} bytes", MAX_LINE_LENGTH)]
    LineTooLong,

    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl From<LinesCodecError> for CodecError {
    fn from(err: LinesCodecError) -> Self {
        match err {
            LinesCodecError::MaxLineLengthExceeded => Self::LineTooLong,
            LinesCodecError::Io(e) => Self::Io(e),
        }
    }
}

/// Codec that frames envelopes one per line and serializes them as JSON arrays.
///
/// Wraps LinesCodec and adds envelope (de)serialization.
pub struct EnvelopeCodec {
    inner: LinesCodec,
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
        }
    }

    fn decode_line(line: &str) -> Result<Option<Envelope>, CodecError> {
        if line.trim() == LEGACY_INIT_MARKER {
            tracing::debug!("Skipping legacy init marker");
            return Ok(None);
        }
        let value: serde_json::Value = serde_json::from_str(line)?;
        Ok(Some(Envelope::try_from(value)?))
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        while let Some(line) = self.inner.decode(src)? {
            if let Some(envelope) = Self::decode_line(&line)? {
                return Ok(Some(envelope));
            }
        }
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        while let Some(line) = self.inner.decode_eof(src)? {
            if let Some(envelope) = Self::decode_line(&line)? {
                return Ok(Some(envelope));
            }
        }
        Ok(None)
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        // serde_json escapes control characters, so the output never contains '\n'.
        let line = serde_json::to_string(&item)?;
        tracing::trace!(tag = item.tag(), line_bytes = line.len(), "Encoding envelope");
        self.inner.encode(line, dst)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::CorrelationId;
    use serde_json::json;

    fn buf(s: &str) -> BytesMut {
        BytesMut::from(s.as_bytes())
    }

    #[test]
    fn encodes_one_line_per_envelope() {
        let mut codec = EnvelopeCodec::new();
        let mut dst = BytesMut::new();

        codec
            .encode(
                Envelope::Request {
                    id: CorrelationId::from(1),
                    action: "echo".to_string(),
                    params: vec![json!("multi\nline")],
                },
                &mut dst,
            )
            .unwrap();
        codec.encode(Envelope::Terminate, &mut dst).unwrap();

        let text = std::str::from_utf8(&dst).unwrap();
        assert_eq!(
            text,
            "[\"request\",1,\"echo\",\"multi\\nline\"]\n[\"terminate\"]\n"
        );
    }

    #[test]
    fn decodes_complete_lines_only() {
        let mut codec = EnvelopeCodec::new();
        let mut src = buf("[\"response\",1,42]\n[\"termin");

        let first = codec.decode(&mut src).unwrap();
        assert_eq!(
            first,
            Some(Envelope::Response {
                id: CorrelationId::from(1),
                result: json!(42),
            })
        );
        assert_eq!(codec.decode(&mut src).unwrap(), None);

        src.extend_from_slice(b"ate\"]\n");
        assert_eq!(codec.decode(&mut src).unwrap(), Some(Envelope::Terminate));
    }

    #[test]
    fn skips_legacy_init_marker() {
        let mut codec = EnvelopeCodec::new();
        let mut src = buf("\"init\"\n[\"terminate\"]\n");

        assert_eq!(codec.decode(&mut src).unwrap(), Some(Envelope::Terminate));
    }

    #[test]
    fn decodes_unterminated_last_line_at_eof() {
        let mut codec = EnvelopeCodec::new();
        let mut src = buf("[\"terminate\"]");

        assert_eq!(codec.decode(&mut src).unwrap(), None);
        assert_eq!(codec.decode_eof(&mut src).unwrap(), Some(Envelope::Terminate));
    }

    #[test]
    fn invalid_json_is_an_error() {
        let mut codec = EnvelopeCodec::new();
        let mut src = buf("not json\n");

        let err = codec.decode(&mut src).unwrap_err();
        assert!(matches!(err, CodecError::Json(_)));
    }

    #[test]
    fn unknown_discriminator_is_an_error() {
        let mut codec = EnvelopeCodec::new();
        let mut src = buf("[\"bogus\"]\n");

        let err = codec.decode(&mut src).unwrap_err();
        assert!(matches!(
            err,
            CodecError::Decode(DecodeError::UnknownDiscriminator(_))
        ));
    }
}
