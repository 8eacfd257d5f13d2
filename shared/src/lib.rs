//! # Shared protocol crate
//!
//! Wire-level building blocks used by the dedicated server and by anything that
//! talks to it: the variable-length integer codec, the message packer, the
//! snapshot model with its delta engine and per-client history, and the
//! datagram envelope.
//!
//! ## Snapshots
//!
//! The server builds one [`snapshot::Snapshot`] per observer per tick. It is
//! diffed against the last snapshot the client acknowledged using
//! [`delta::SnapshotDelta`], compressed with [`varint::compress`], and split
//! into [`protocol::SnapMsg`] chunks that each fit in one packet. The receiving
//! side reverses this with [`protocol::SnapshotReassembler`],
//! [`varint::decompress`] and [`delta::SnapshotDelta::unpack_delta`], and
//! verifies the result against the CRC carried in the message.

pub mod delta;
pub mod error;
pub mod packer;
pub mod packet;
pub mod protocol;
pub mod snapshot;
pub mod storage;
pub mod varint;

pub use delta::SnapshotDelta;
pub use error::ProtocolError;
pub use packer::{Packer, Unpacker};
pub use packet::{ControlMsg, Datagram, RawPacket};
pub use protocol::{MsgId, SnapMsg};
pub use snapshot::{Snapshot, SnapshotBuilder};
pub use storage::SnapshotStorage;
