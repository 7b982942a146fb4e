use thiserror::Error;

/// Errors produced while decoding a wire frame into a [`Packet`].
///
/// A decode error never tears down a connection: the offending frame is
/// logged and dropped, and the read loop continues.
///
/// [`Packet`]: crate::Packet
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("empty packet")]
    EmptyPacket,

    #[error("invalid packet type")]
    InvalidType,

    #[error("invalid ack id: {0}")]
    InvalidId(String),
}
