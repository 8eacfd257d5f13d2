//! Snapshot deltas
//!
//! Layout of a delta as an int stream:
//!
//! ```text
//! num_deleted num_updates num_temp
//! key * num_deleted
//! (type id [size] data...) * num_updates
//! ```
//!
//! `size` (in ints) is left out for item types with a registered static size.
//! Items present in the base with the same size are sent as the per-int
//! difference, new or resized items carry their raw data.

use crate::error::ProtocolError;
use crate::snapshot::{item_key, Snapshot, SnapshotBuilder, MAX_ID, MAX_TYPE};

/// Item types below this value may have a static size
pub const MAX_NETOBJSIZES: usize = 64;

const HEADER_INTS: usize = 3;

/// Delta encoder/decoder with the static item size table
#[derive(Debug, Clone)]
pub struct SnapshotDelta {
    item_sizes: [usize; MAX_NETOBJSIZES],
}

impl Default for SnapshotDelta {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotDelta {
    pub fn new() -> Self {
        Self {
            item_sizes: [0; MAX_NETOBJSIZES],
        }
    }

    /// Registers the fixed size (in ints) of an item type. Ignored for types
    /// outside the static table.
    pub fn set_static_size(&mut self, type_id: u16, size: usize) {
        if let Some(slot) = self.item_sizes.get_mut(type_id as usize) {
            *slot = size;
        }
    }

    fn static_size(&self, type_id: u16) -> Option<usize> {
        self.item_sizes
            .get(type_id as usize)
            .copied()
            .filter(|size| *size != 0)
    }

    /// Computes the delta that turns `from` into `to`. An empty vector means
    /// nothing changed.
    pub fn create_delta(&self, from: &Snapshot, to: &Snapshot) -> Vec<i32> {
        let mut out = vec![0; HEADER_INTS];
        let mut num_deleted = 0;
        let mut num_updates = 0;

        for item in from.items() {
            if to.find(item.key).is_none() {
                out.push(item.key);
                num_deleted += 1;
            }
        }

        for item in to.items() {
            let include_size = self.static_size(item.type_id()).is_none();
            match from.find(item.key) {
                Some(past) if past.data.len() == item.data.len() => {
                    if past.data == item.data {
                        continue;
                    }
                    out.push(item.type_id() as i32);
                    out.push(item.id() as i32);
                    if include_size {
                        out.push(item.data.len() as i32);
                    }
                    out.extend(
                        item.data
                            .iter()
                            .zip(past.data.iter())
                            .map(|(cur, old)| cur.wrapping_sub(*old)),
                    );
                }
                _ => {
                    out.push(item.type_id() as i32);
                    out.push(item.id() as i32);
                    if include_size {
                        out.push(item.data.len() as i32);
                    }
                    out.extend_from_slice(&item.data);
                }
            }
            num_updates += 1;
        }

        if num_deleted == 0 && num_updates == 0 {
            return Vec::new();
        }
        out[0] = num_deleted;
        out[1] = num_updates;
        out
    }

    /// Applies a delta produced by [`SnapshotDelta::create_delta`] to `from`
    pub fn unpack_delta(&self, from: &Snapshot, delta: &[i32]) -> Result<Snapshot, ProtocolError> {
        if delta.is_empty() {
            return Ok(from.clone());
        }
        if delta.len() < HEADER_INTS {
            return Err(ProtocolError::DeltaBounds);
        }
        let num_deleted = usize::try_from(delta[0]).map_err(|_| ProtocolError::DeltaBounds)?;
        let num_updates = usize::try_from(delta[1]).map_err(|_| ProtocolError::DeltaBounds)?;

        let mut pos = HEADER_INTS;
        let deleted = delta
            .get(pos..pos + num_deleted)
            .ok_or(ProtocolError::DeltaBounds)?;
        pos += num_deleted;

        let mut builder = SnapshotBuilder::new();
        for item in from.items() {
            if !deleted.contains(&item.key) && !builder.push_raw(item.key, item.data.clone()) {
                return Err(ProtocolError::TooManyItems);
            }
        }

        for _ in 0..num_updates {
            let head = delta.get(pos..pos + 2).ok_or(ProtocolError::DeltaBounds)?;
            let (type_id, id) = (head[0], head[1]);
            pos += 2;
            if !(0..=MAX_TYPE).contains(&type_id) {
                return Err(ProtocolError::DeltaType(type_id));
            }
            if !(0..=MAX_ID).contains(&id) {
                return Err(ProtocolError::DeltaId(id));
            }

            let size = match self.static_size(type_id as u16) {
                Some(size) => size,
                None => {
                    let declared = *delta.get(pos).ok_or(ProtocolError::DeltaBounds)?;
                    pos += 1;
                    usize::try_from(declared).map_err(|_| ProtocolError::DeltaSize(declared))?
                }
            };
            let end = pos.checked_add(size).ok_or(ProtocolError::DeltaBounds)?;
            let payload = delta.get(pos..end).ok_or(ProtocolError::DeltaSize(size as i32))?;
            pos = end;

            let key = item_key(type_id as u16, id as u16);
            let data: Vec<i32> = match from.find(key) {
                Some(past) if past.data.len() == size => payload
                    .iter()
                    .zip(past.data.iter())
                    .map(|(diff, old)| old.wrapping_add(*diff))
                    .collect(),
                _ => payload.to_vec(),
            };

            match builder.item_data_mut(key) {
                Some(existing) => *existing = data,
                None => {
                    if !builder.push_raw(key, data) {
                        return Err(ProtocolError::TooManyItems);
                    }
                }
            }
        }

        Ok(builder.finish())
    }
}
