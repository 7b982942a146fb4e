//! Packet model for the wire protocol.
//!
//! A [`Packet`] is the unit of wire traffic: a type tag, a namespace path,
//! an optional acknowledgment id and an opaque JSON payload. For event
//! packets the payload is a JSON array whose head is the event name and
//! whose tail is the argument list.

use serde_json::Value;

/// The tag carried in the first byte of every wire frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Sent when a peer connects to a namespace.
    Connect = 0,
    /// Sent when a peer disconnects from a namespace.
    Disconnect = 1,
    /// A named event with a JSON argument list.
    Event = 2,
    /// An acknowledgment correlated to a prior event by id.
    Ack = 3,
    /// An error report.
    Error = 4,
    /// Reserved: event with binary payload. Carried as opaque JSON here.
    BinaryEvent = 5,
    /// Reserved: acknowledgment with binary payload. Carried as opaque JSON.
    BinaryAck = 6,
}

impl TryFrom<u8> for PacketType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0 => Ok(PacketType::Connect),
            1 => Ok(PacketType::Disconnect),
            2 => Ok(PacketType::Event),
            3 => Ok(PacketType::Ack),
            4 => Ok(PacketType::Error),
            5 => Ok(PacketType::BinaryEvent),
            6 => Ok(PacketType::BinaryAck),
            other => Err(other),
        }
    }
}

/// A protocol packet.
///
/// `data` holds the payload as raw JSON text and is written to the wire
/// verbatim; it is empty for payload-less packets such as plain Connect or
/// Disconnect. The namespace `"/"` is the canonical default and is elided
/// on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketType,
    pub namespace: String,
    /// Present on an Event requesting an acknowledgment and on the matching
    /// Ack.
    pub id: Option<u64>,
    pub data: String,
}

impl Packet {
    /// A Connect packet for the given namespace.
    pub fn connect(namespace: impl Into<String>) -> Self {
        Self {
            kind: PacketType::Connect,
            namespace: namespace.into(),
            id: None,
            data: String::new(),
        }
    }

    /// A Disconnect packet for the given namespace.
    pub fn disconnect(namespace: impl Into<String>) -> Self {
        Self {
            kind: PacketType::Disconnect,
            namespace: namespace.into(),
            id: None,
            data: String::new(),
        }
    }

    /// An Event packet. `data` must be the JSON array text produced by
    /// [`event_data`]; `id` is set when an acknowledgment is requested.
    pub fn event(namespace: impl Into<String>, data: impl Into<String>, id: Option<u64>) -> Self {
        Self {
            kind: PacketType::Event,
            namespace: namespace.into(),
            id,
            data: data.into(),
        }
    }

    /// An Ack packet answering the event that carried `id`.
    pub fn ack(namespace: impl Into<String>, id: u64, data: impl Into<String>) -> Self {
        Self {
            kind: PacketType::Ack,
            namespace: namespace.into(),
            id: Some(id),
            data: data.into(),
        }
    }

    /// An Error packet whose payload is the message as a JSON string.
    pub fn error(namespace: impl Into<String>, message: &str) -> Self {
        Self {
            kind: PacketType::Error,
            namespace: namespace.into(),
            id: None,
            data: Value::String(message.to_owned()).to_string(),
        }
    }

    /// Extracts the event name from an Event or BinaryEvent packet.
    ///
    /// Returns `None` for other packet types, for malformed payloads and
    /// for payloads whose head element is not a string.
    pub fn event_name(&self) -> Option<String> {
        let values = self.event_payload()?;
        values.first()?.as_str().map(str::to_owned)
    }

    /// Extracts the argument list from an Event or BinaryEvent packet.
    pub fn event_args(&self) -> Option<Vec<Value>> {
        let mut values = self.event_payload()?;
        if values.is_empty() {
            return None;
        }
        Some(values.split_off(1))
    }

    fn event_payload(&self) -> Option<Vec<Value>> {
        if !matches!(self.kind, PacketType::Event | PacketType::BinaryEvent) {
            return None;
        }
        match serde_json::from_str(&self.data) {
            Ok(values) => Some(values),
            Err(err) => {
                tracing::warn!(error = %err, "malformed event payload");
                None
            }
        }
    }
}

/// Builds the JSON array text `[event, ...args]` used as event payload.
pub fn event_data(event: &str, args: &[Value]) -> String {
    let mut payload = Vec::with_capacity(args.len() + 1);
    payload.push(Value::String(event.to_owned()));
    payload.extend_from_slice(args);
    match serde_json::to_string(&payload) {
        Ok(data) => data,
        Err(_) => String::from("[]"),
    }
}
