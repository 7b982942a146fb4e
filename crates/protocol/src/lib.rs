//! # Veles Protocol
//!
//! Core protocol machinery for the veles messaging library:
//!
//! - [`Packet`] and [`PacketType`]: the unit of wire traffic
//! - [`codec`]: encoder/decoder for the wire text format
//! - [`EventEmitter`]: event name → listeners registry with ordered dispatch
//! - [`AckTable`] / [`AckSender`]: acknowledgment correlation for both
//!   socket sides
//!
//! # Example
//!
//! ```
//! use veles_protocol::{codec, Packet};
//!
//! let packet = Packet::event("/", r#"["chat message","hi"]"#, None);
//! assert_eq!(codec::encode(&packet), r#"2["chat message","hi"]"#);
//! ```

pub mod ack;
pub mod codec;
pub mod emitter;
pub mod error;
pub mod packet;

pub use ack::{AckCallback, AckSender, AckTable, ACK_TIMEOUT};
pub use emitter::{arg, Callback, EventEmitter, Signature};
pub use error::DecodeError;
pub use packet::{event_data, Packet, PacketType};
