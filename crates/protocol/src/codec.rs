//! Wire codec: text frames to and from [`Packet`]s.
//!
//! Wire grammar (ASCII):
//!
//! ```text
//! packet     := type-digit [namespace ","] [id] [json-data]
//! type-digit := "0".."6"
//! namespace  := "/" path-chars
//! id         := digit+
//! json-data  := any JSON value text
//! ```
//!
//! The default namespace `"/"` is elided on the wire, and an ack id is
//! meaningful only on Event and Ack packets. When a non-default namespace
//! coexists with an id, the id follows the comma: `2/ns,123[...]`.
//!
//! # Example
//!
//! ```
//! use veles_protocol::{codec, Packet};
//!
//! let packet = Packet::event("/chat", r#"["test"]"#, None);
//! let frame = codec::encode(&packet);
//! assert_eq!(frame, r#"2/chat,["test"]"#);
//! assert_eq!(codec::decode(&frame).unwrap(), packet);
//! ```

use crate::error::DecodeError;
use crate::packet::{Packet, PacketType};

/// Encodes a packet into its wire text representation.
pub fn encode(packet: &Packet) -> String {
    let mut out = String::with_capacity(packet.namespace.len() + packet.data.len() + 22);
    out.push((b'0' + packet.kind as u8) as char);
    if !packet.namespace.is_empty() && packet.namespace != "/" {
        out.push_str(&packet.namespace);
        out.push(',');
    }
    if let Some(id) = packet.id {
        out.push_str(&id.to_string());
    }
    out.push_str(&packet.data);
    out
}

/// Decodes a wire text frame into a packet.
///
/// Ids are consumed only for Event and Ack frames; on every other type a
/// leading digit run belongs to the payload.
pub fn decode(frame: &str) -> Result<Packet, DecodeError> {
    let mut bytes = frame.bytes();
    let first = bytes.next().ok_or(DecodeError::EmptyPacket)?;
    if !first.is_ascii_digit() {
        return Err(DecodeError::InvalidType);
    }
    let kind = PacketType::try_from(first - b'0').map_err(|_| DecodeError::InvalidType)?;

    let mut rest = &frame[1..];
    let mut namespace = String::from("/");
    if rest.starts_with('/') {
        match rest.find(',') {
            Some(comma) => {
                namespace = rest[..comma].to_owned();
                rest = &rest[comma + 1..];
            }
            None => {
                namespace = rest.to_owned();
                rest = "";
            }
        }
    }

    let mut id = None;
    if matches!(kind, PacketType::Event | PacketType::Ack) {
        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        if digits > 0 {
            let parsed = rest[..digits]
                .parse::<u64>()
                .map_err(|_| DecodeError::InvalidId(rest[..digits].to_owned()))?;
            id = Some(parsed);
            rest = &rest[digits..];
        }
    }

    Ok(Packet {
        kind,
        namespace,
        id,
        data: rest.to_owned(),
    })
}
