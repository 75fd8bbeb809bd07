//! Wire layer for the duplex channel.
//!
//! # Architecture
//!
//! - **protocol**: Envelope types (request, response, log record, init, terminate)
//! - **codec**: newline framing + JSON array encoding
//! - **transport**: inbound line reader and the serialized outbound writer

pub mod codec;
pub mod protocol;
pub mod transport;
