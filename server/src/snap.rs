//! Per-client snapshot production
//!
//! Each snapshot tick the game fills one [`Snapshot`] per observer. This module
//! stores it in the client's history, diffs it against the last acknowledged
//! snapshot and splits the compressed delta into network sized messages.

use crate::client_manager::{ClientSlot, SnapRate};
use log::warn;
use shared::protocol::{MAX_SNAPSHOT_PACKSIZE, MAX_SNAPSHOT_PARTS};
use shared::varint;
use shared::{Snapshot, SnapshotDelta, SnapMsg};
use std::time::Instant;

/// Ticks between snapshots while a client is still loading
pub const INIT_SNAP_INTERVAL: i32 = 10;

/// Receives the full-view snapshot of every snapshot tick
pub trait DemoRecorder: Send {
    fn record_snapshot(&mut self, tick: i32, snap: &Snapshot);
}

/// Whether `slot` gets a snapshot on `tick`. Clients that have not
/// acknowledged anything yet only get one every [`INIT_SNAP_INTERVAL`] ticks,
/// recovering clients one per second.
pub fn should_snap(slot: &ClientSlot, tick: i32, tick_speed: i32) -> bool {
    match slot.snap_rate {
        SnapRate::Recover => tick % tick_speed == 0,
        SnapRate::Init => tick % INIT_SNAP_INTERVAL == 0,
        SnapRate::Full => true,
    }
}

/// Stores `snap` for `tick` and builds the messages carrying its delta.
/// A delta that needs more than [`MAX_SNAPSHOT_PARTS`] parts is not sent and
/// the snapshot is not kept.
pub fn build_messages(
    slot: &mut ClientSlot,
    snap: Snapshot,
    tick: i32,
    tick_speed: i32,
    delta: &SnapshotDelta,
    now: Instant,
) -> Vec<SnapMsg> {
    let crc = snap.crc();

    slot.snapshots.purge_until(tick - tick_speed * 3);

    let empty = Snapshot::empty();
    let (base, delta_tick) = match slot.snapshots.get(slot.last_acked_snapshot) {
        Some(holder) => (&holder.snap, slot.last_acked_snapshot),
        None => {
            if slot.snap_rate == SnapRate::Full {
                slot.snap_rate = SnapRate::Recover;
            }
            (&empty, -1)
        }
    };

    let ints = delta.create_delta(base, &snap);
    let messages = if ints.is_empty() {
        vec![SnapMsg::Empty { tick, delta_tick }]
    } else {
        let compressed = varint::compress(&ints);
        if compressed.len() > MAX_SNAPSHOT_PARTS * MAX_SNAPSHOT_PACKSIZE {
            warn!(
                "snapshot for tick {} needs {} bytes, more than {} parts, not sent",
                tick,
                compressed.len(),
                MAX_SNAPSHOT_PARTS
            );
            return Vec::new();
        }
        SnapMsg::split(tick, delta_tick, crc, &compressed)
    };

    slot.snapshots.add(tick, now, snap);
    messages
}
