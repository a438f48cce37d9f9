#![deny(unsafe_code)]

//! MQTT v3.1.1 packet codec used by the smqtt client session
//!
//! ## Core Features:
//! - **Complete 3.1.1 packet set**: CONNECT through DISCONNECT, including the QoS 2 handshake packets
//! - **Resumable decoding**: a partial frame is reported as "need more data" and the input is left untouched
//! - **Bounded remaining length**: variable-byte integers longer than 4 bytes are rejected as malformed
//! - **Tokio Integration**: framing over sockets via `tokio_util::codec`
//!
//! ## Architecture Components:
//! - [`v3::Codec`]: `Encoder`/`Decoder` pair with an inbound size limit
//! - [`encode`] / [`decode`]: stateless functions over plain byte buffers
//! - [`error`]: dedicated `EncodeError`/`DecodeError` types
//!
//! ```
//! use smqtt_codec::{decode, encode, v3::Packet};
//!
//! let bytes = encode(&Packet::PingRequest).unwrap();
//! assert_eq!(&bytes[..], b"\xc0\x00");
//!
//! let (packet, consumed) = decode(&bytes, 0).unwrap().unwrap();
//! assert_eq!(packet, Packet::PingRequest);
//! assert_eq!(consumed, 2);
//!
//! // a truncated frame needs more data
//! assert!(decode(&bytes[..1], 0).unwrap().is_none());
//! ```

#[macro_use]
mod utils;

/// Error types for encoding/decoding operations
pub mod error;

/// Shared types and constants for MQTT protocol
pub mod types;

/// MQTT v3.1.1 protocol implementation
pub mod v3;

pub use v3::codec::{decode, encode};
pub use v3::{Codec, Packet};
