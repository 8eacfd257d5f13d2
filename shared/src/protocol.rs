//! System message ids, message headers and snapshot message framing
//!
//! Every chunk starts with `varint((msg_id << 1) | system)`. Id 0 means the
//! message is named by the 16 bytes that follow: a name-based UUID in the
//! teeworlds namespace.

use crate::error::ProtocolError;
use crate::packer::{Packer, Unpacker};
use uuid::Uuid;

pub const NET_VERSION: &str = "0.6 626fce9a778df4d4";
pub const GAME_VERSION: &str = "0.6.4, 19.1";
pub const SERVER_TICK_SPEED: i32 = 50;
pub const MAX_CLIENTS: usize = 64;
/// Input payload limit in ints
pub const MAX_INPUT_SIZE: usize = 128;
/// Byte limit of one compressed snapshot chunk
pub const MAX_SNAPSHOT_PACKSIZE: usize = 900;
pub const MAX_SNAPSHOT_PARTS: usize = 64;
pub const MAP_CHUNK_SIZE: usize = 1024;
/// Highest tick a client may target with its input
pub const MAX_TICK: i32 = i32::MAX / 2;

pub const NETMSG_EX: i32 = 0;
pub const NETMSG_INFO: i32 = 1;
pub const NETMSG_MAP_CHANGE: i32 = 2;
pub const NETMSG_MAP_DATA: i32 = 3;
pub const NETMSG_CON_READY: i32 = 4;
pub const NETMSG_SNAP: i32 = 5;
pub const NETMSG_SNAPEMPTY: i32 = 6;
pub const NETMSG_SNAPSINGLE: i32 = 7;
pub const NETMSG_SNAPSMALL: i32 = 8;
pub const NETMSG_INPUTTIMING: i32 = 9;
pub const NETMSG_RCON_AUTH_STATUS: i32 = 10;
pub const NETMSG_RCON_LINE: i32 = 11;
pub const NETMSG_READY: i32 = 14;
pub const NETMSG_ENTERGAME: i32 = 15;
pub const NETMSG_INPUT: i32 = 16;
pub const NETMSG_RCON_CMD: i32 = 17;
pub const NETMSG_RCON_AUTH: i32 = 18;
pub const NETMSG_REQUEST_MAP_DATA: i32 = 19;
pub const NETMSG_PING: i32 = 22;
pub const NETMSG_PING_REPLY: i32 = 23;
pub const NETMSG_RCON_CMD_ADD: i32 = 25;
pub const NETMSG_RCON_CMD_REM: i32 = 26;

/// Namespace all extended message UUIDs are derived from
pub const TEEWORLDS_NAMESPACE: Uuid = Uuid::from_bytes([
    0xe0, 0x5d, 0xda, 0xaa, 0xc4, 0xe6, 0x4c, 0xfb, 0xb6, 0x42, 0x5d, 0x48, 0xe8, 0x0c, 0x00, 0x29,
]);

/// Messages addressed by UUID rather than by numeric id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtMsg {
    ClientVer,
    PingEx,
    PongEx,
    Redirect,
    MaplistAdd,
    MaplistStart,
    MaplistDone,
}

impl ExtMsg {
    pub const ALL: [ExtMsg; 7] = [
        ExtMsg::ClientVer,
        ExtMsg::PingEx,
        ExtMsg::PongEx,
        ExtMsg::Redirect,
        ExtMsg::MaplistAdd,
        ExtMsg::MaplistStart,
        ExtMsg::MaplistDone,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ExtMsg::ClientVer => "clientver@ddnet.tw",
            ExtMsg::PingEx => "ping@ddnet.tw",
            ExtMsg::PongEx => "pong@ddnet.tw",
            ExtMsg::Redirect => "redirect@ddnet.org",
            ExtMsg::MaplistAdd => "sv-maplist-add@ddnet.org",
            ExtMsg::MaplistStart => "sv-maplist-start@ddnet.org",
            ExtMsg::MaplistDone => "sv-maplist-result@ddnet.org",
        }
    }

    pub fn uuid(self) -> Uuid {
        Uuid::new_v3(&TEEWORLDS_NAMESPACE, self.name().as_bytes())
    }

    pub fn from_uuid(uuid: &Uuid) -> Option<ExtMsg> {
        ExtMsg::ALL.into_iter().find(|msg| msg.uuid() == *uuid)
    }
}

/// Decoded message header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgId {
    Id(i32),
    Ext(ExtMsg),
    UnknownExt(Uuid),
}

/// Starts a message body with the header of a numbered message
pub fn msg_packer(msg_id: i32, system: bool) -> Packer {
    let mut packer = Packer::new();
    packer.add_int((msg_id << 1) | system as i32);
    packer
}

/// Starts a message body with the header of an extended message
pub fn ext_msg_packer(msg: ExtMsg, system: bool) -> Packer {
    let mut packer = Packer::new();
    packer
        .add_int((NETMSG_EX << 1) | system as i32)
        .add_raw(msg.uuid().as_bytes());
    packer
}

/// Reads the header, returning the message id and the system flag
pub fn unpack_msg_header(unpacker: &mut Unpacker<'_>) -> Result<(MsgId, bool), ProtocolError> {
    let header = unpacker.get_int()?;
    let system = header & 1 != 0;
    let msg_id = header >> 1;
    if msg_id != NETMSG_EX {
        return Ok((MsgId::Id(msg_id), system));
    }
    let raw = unpacker.get_raw(16)?;
    let uuid = Uuid::from_slice(raw).map_err(|_| ProtocolError::UnexpectedEnd)?;
    Ok(match ExtMsg::from_uuid(&uuid) {
        Some(msg) => (MsgId::Ext(msg), system),
        None => (MsgId::UnknownExt(uuid), system),
    })
}

/// Server to client snapshot messages. `delta_tick` is absolute here and sent
/// as an offset from `tick` on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapMsg {
    Empty {
        tick: i32,
        delta_tick: i32,
    },
    Single {
        tick: i32,
        delta_tick: i32,
        crc: i32,
        data: Vec<u8>,
    },
    Part {
        tick: i32,
        delta_tick: i32,
        num_parts: i32,
        part: i32,
        crc: i32,
        data: Vec<u8>,
    },
}

impl SnapMsg {
    /// Splits a compressed delta into size-bounded snapshot messages
    pub fn split(tick: i32, delta_tick: i32, crc: u32, compressed: &[u8]) -> Vec<SnapMsg> {
        if compressed.is_empty() {
            return vec![SnapMsg::Empty { tick, delta_tick }];
        }
        let crc = crc as i32;
        let chunks: Vec<&[u8]> = compressed.chunks(MAX_SNAPSHOT_PACKSIZE).collect();
        if chunks.len() == 1 {
            return vec![SnapMsg::Single {
                tick,
                delta_tick,
                crc,
                data: compressed.to_vec(),
            }];
        }
        let num_parts = chunks.len() as i32;
        chunks
            .into_iter()
            .enumerate()
            .map(|(part, data)| SnapMsg::Part {
                tick,
                delta_tick,
                num_parts,
                part: part as i32,
                crc,
                data: data.to_vec(),
            })
            .collect()
    }

    pub fn tick(&self) -> i32 {
        match self {
            SnapMsg::Empty { tick, .. } | SnapMsg::Single { tick, .. } | SnapMsg::Part { tick, .. } => {
                *tick
            }
        }
    }

    /// Full message body including the header
    pub fn encode(&self) -> Vec<u8> {
        match self {
            SnapMsg::Empty { tick, delta_tick } => {
                let mut packer = msg_packer(NETMSG_SNAPEMPTY, true);
                packer.add_int(*tick).add_int(tick - delta_tick);
                packer.into_bytes()
            }
            SnapMsg::Single {
                tick,
                delta_tick,
                crc,
                data,
            } => {
                let mut packer = msg_packer(NETMSG_SNAPSINGLE, true);
                packer
                    .add_int(*tick)
                    .add_int(tick - delta_tick)
                    .add_int(*crc)
                    .add_int(data.len() as i32)
                    .add_raw(data);
                packer.into_bytes()
            }
            SnapMsg::Part {
                tick,
                delta_tick,
                num_parts,
                part,
                crc,
                data,
            } => {
                let mut packer = msg_packer(NETMSG_SNAP, true);
                packer
                    .add_int(*tick)
                    .add_int(tick - delta_tick)
                    .add_int(*num_parts)
                    .add_int(*part)
                    .add_int(*crc)
                    .add_int(data.len() as i32)
                    .add_raw(data);
                packer.into_bytes()
            }
        }
    }

    /// Decodes the body of a snapshot message whose header was already read
    pub fn decode(msg_id: i32, unpacker: &mut Unpacker<'_>) -> Result<SnapMsg, ProtocolError> {
        let tick = unpacker.get_int()?;
        let delta_tick = tick.wrapping_sub(unpacker.get_int()?);
        match msg_id {
            NETMSG_SNAPEMPTY => Ok(SnapMsg::Empty { tick, delta_tick }),
            NETMSG_SNAPSINGLE => {
                let crc = unpacker.get_int()?;
                let size = unpacker.get_int()?;
                let data = read_sized(unpacker, size)?;
                Ok(SnapMsg::Single {
                    tick,
                    delta_tick,
                    crc,
                    data,
                })
            }
            NETMSG_SNAP => {
                let num_parts = unpacker.get_int()?;
                let part = unpacker.get_int()?;
                let crc = unpacker.get_int()?;
                let size = unpacker.get_int()?;
                if !(1..=MAX_SNAPSHOT_PARTS as i32).contains(&num_parts)
                    || !(0..num_parts).contains(&part)
                {
                    return Err(ProtocolError::DeltaBounds);
                }
                let data = read_sized(unpacker, size)?;
                Ok(SnapMsg::Part {
                    tick,
                    delta_tick,
                    num_parts,
                    part,
                    crc,
                    data,
                })
            }
            other => Err(ProtocolError::UnknownMessage(other)),
        }
    }
}

fn read_sized(unpacker: &mut Unpacker<'_>, size: i32) -> Result<Vec<u8>, ProtocolError> {
    if !(0..=MAX_SNAPSHOT_PACKSIZE as i32).contains(&size) {
        return Err(ProtocolError::DeltaSize(size));
    }
    Ok(unpacker.get_raw(size as usize)?.to_vec())
}

/// A complete compressed delta rebuilt from one or more snapshot messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledSnap {
    pub tick: i32,
    pub delta_tick: i32,
    pub crc: u32,
    /// Compressed delta bytes; empty for a no-change snapshot
    pub data: Vec<u8>,
}

/// Receiver-side collector for multi-part snapshots
#[derive(Debug, Default)]
pub struct SnapshotReassembler {
    tick: i32,
    parts: Vec<Option<Vec<u8>>>,
}

impl SnapshotReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one message, returning the delta once every part of a tick has
    /// arrived. A part for a newer tick discards the incomplete older one.
    pub fn push(&mut self, msg: SnapMsg) -> Option<AssembledSnap> {
        match msg {
            SnapMsg::Empty { tick, delta_tick } => Some(AssembledSnap {
                tick,
                delta_tick,
                crc: 0,
                data: Vec::new(),
            }),
            SnapMsg::Single {
                tick,
                delta_tick,
                crc,
                data,
            } => Some(AssembledSnap {
                tick,
                delta_tick,
                crc: crc as u32,
                data,
            }),
            SnapMsg::Part {
                tick,
                delta_tick,
                num_parts,
                part,
                crc,
                data,
            } => {
                if tick != self.tick || self.parts.len() != num_parts as usize {
                    self.tick = tick;
                    self.parts = vec![None; num_parts as usize];
                }
                if let Some(slot) = self.parts.get_mut(part as usize) {
                    *slot = Some(data);
                }
                if self.parts.iter().any(Option::is_none) {
                    return None;
                }
                let data = self.parts.drain(..).flatten().flatten().collect();
                Some(AssembledSnap {
                    tick,
                    delta_tick,
                    crc: crc as u32,
                    data,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let packer = msg_packer(NETMSG_INPUT, true);
        let mut unpacker = Unpacker::new(packer.data());
        assert_eq!(
            unpack_msg_header(&mut unpacker).unwrap(),
            (MsgId::Id(NETMSG_INPUT), true)
        );

        let packer = msg_packer(3, false);
        let mut unpacker = Unpacker::new(packer.data());
        assert_eq!(unpack_msg_header(&mut unpacker).unwrap(), (MsgId::Id(3), false));
    }

    #[test]
    fn test_ext_header() {
        let packer = ext_msg_packer(ExtMsg::PingEx, true);
        assert_eq!(packer.size(), 17);
        let mut unpacker = Unpacker::new(packer.data());
        assert_eq!(
            unpack_msg_header(&mut unpacker).unwrap(),
            (MsgId::Ext(ExtMsg::PingEx), true)
        );
    }

    #[test]
    fn test_ext_uuids_are_distinct() {
        let mut uuids: Vec<Uuid> = ExtMsg::ALL.iter().map(|msg| msg.uuid()).collect();
        uuids.sort();
        uuids.dedup();
        assert_eq!(uuids.len(), ExtMsg::ALL.len());
        assert_eq!(ExtMsg::ClientVer.uuid().get_version_num(), 3);
    }

    #[test]
    fn test_truncated_ext_header() {
        let mut bytes = ext_msg_packer(ExtMsg::ClientVer, true).into_bytes();
        bytes.truncate(8);
        let mut unpacker = Unpacker::new(&bytes);
        assert!(unpack_msg_header(&mut unpacker).is_err());
    }

    #[test]
    fn test_split_sizes() {
        assert_eq!(
            SnapMsg::split(5, 3, 0, &[]),
            vec![SnapMsg::Empty { tick: 5, delta_tick: 3 }]
        );
        let single = SnapMsg::split(5, 3, 9, &[1; 100]);
        assert!(matches!(single.as_slice(), [SnapMsg::Single { .. }]));

        let parts = SnapMsg::split(5, -1, 9, &vec![7u8; MAX_SNAPSHOT_PACKSIZE * 2 + 1]);
        assert_eq!(parts.len(), 3);
        match &parts[2] {
            SnapMsg::Part { num_parts, part, data, .. } => {
                assert_eq!(*num_parts, 3);
                assert_eq!(*part, 2);
                assert_eq!(data.len(), 1);
            }
            _ => panic!("Unexpected snapshot message"),
        }
    }

    #[test]
    fn test_snap_msg_wire_format() {
        let msg = SnapMsg::Single {
            tick: 100,
            delta_tick: -1,
            crc: 42,
            data: vec![1, 2],
        };
        let bytes = msg.encode();
        let mut unpacker = Unpacker::new(&bytes);
        let (id, system) = unpack_msg_header(&mut unpacker).unwrap();
        assert_eq!(id, MsgId::Id(NETMSG_SNAPSINGLE));
        assert!(system);

        let mut fields = unpacker.clone();
        assert_eq!(fields.get_int().unwrap(), 100);
        assert_eq!(fields.get_int().unwrap(), 101);

        assert_eq!(SnapMsg::decode(NETMSG_SNAPSINGLE, &mut unpacker).unwrap(), msg);
    }

    #[test]
    fn test_reassembly_out_of_order() {
        let payload: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
        let mut parts = SnapMsg::split(8, 6, 77, &payload);
        parts.reverse();

        let mut reassembler = SnapshotReassembler::new();
        let mut result = None;
        for part in parts {
            assert!(result.is_none());
            result = reassembler.push(part);
        }
        let snap = result.unwrap();
        assert_eq!(snap.tick, 8);
        assert_eq!(snap.delta_tick, 6);
        assert_eq!(snap.crc, 77);
        assert_eq!(snap.data, payload);
    }
}
