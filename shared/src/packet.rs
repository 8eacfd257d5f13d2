//! Datagram envelope
//!
//! Connectionless packets start with [`CONNLESS_HEADER`] followed by an 8 byte
//! preamble. Everything else is a bincode encoded [`Datagram`].

use crate::error::ProtocolError;
use bincode::{deserialize, serialize};
use serde::{Deserialize, Serialize};

pub const MAX_PACKET_SIZE: usize = 1400;
pub const CONNLESS_HEADER: [u8; 6] = [0xff; 6];
pub const SERVERBROWSE_GETINFO: [u8; 8] = [0xff, 0xff, 0xff, 0xff, b'g', b'i', b'e', b'3'];
pub const SERVERBROWSE_INFO: [u8; 8] = [0xff, 0xff, 0xff, 0xff, b'i', b'n', b'f', b'3'];

/// Connection management messages handled by the transport
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum ControlMsg {
    Connect { sixup: bool },
    Accept,
    KeepAlive,
    Close { reason: String },
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum Datagram {
    Control(ControlMsg),
    /// One message body. Vital chunks carry a sequence number so duplicates
    /// can be dropped by the receiver.
    Chunk {
        vital: bool,
        sequence: u16,
        payload: Vec<u8>,
    },
}

impl Datagram {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serialize(self)?)
    }
}

/// A received packet, classified
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawPacket<'a> {
    Connless(&'a [u8]),
    Routed(Datagram),
}

pub fn parse_packet(data: &[u8]) -> Result<RawPacket<'_>, ProtocolError> {
    if data.len() > MAX_PACKET_SIZE {
        return Err(ProtocolError::Envelope("oversized packet".to_string()));
    }
    if let Some(payload) = data.strip_prefix(&CONNLESS_HEADER[..]) {
        return Ok(RawPacket::Connless(payload));
    }
    Ok(RawPacket::Routed(deserialize(data)?))
}

/// Builds a connectionless packet from a preamble and its body
pub fn connless_packet(preamble: &[u8; 8], body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(CONNLESS_HEADER.len() + preamble.len() + body.len());
    out.extend_from_slice(&CONNLESS_HEADER);
    out.extend_from_slice(preamble);
    out.extend_from_slice(body);
    out
}
