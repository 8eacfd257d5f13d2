//! World snapshots: typed items keyed by `(type, id)`
//!
//! A [`Snapshot`] is immutable once built. Items are stored sorted by key so two
//! snapshots with the same content compare equal regardless of the order in
//! which the game added them.

/// Largest item type id
pub const MAX_TYPE: i32 = 0x7fff;
/// Largest item id
pub const MAX_ID: i32 = 0xffff;
/// Item count limit of a single snapshot
pub const MAX_ITEMS: usize = 1024;
/// Payload byte limit of a single snapshot (keys plus item data)
pub const MAX_SIZE: usize = 64 * 1024;

/// Combines type and id into the item key
pub fn item_key(type_id: u16, id: u16) -> i32 {
    ((type_id as i32) << 16) | id as i32
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapItem {
    pub key: i32,
    pub data: Vec<i32>,
}

impl SnapItem {
    pub fn type_id(&self) -> u16 {
        ((self.key >> 16) & MAX_TYPE) as u16
    }

    pub fn id(&self) -> u16 {
        (self.key & MAX_ID) as u16
    }

    /// Size on the wire in bytes, excluding the key
    pub fn size(&self) -> usize {
        self.data.len() * 4
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    items: Vec<SnapItem>,
}

impl Snapshot {
    /// The canonical empty snapshot used as delta base for clients that have
    /// not acknowledged anything yet
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn num_items(&self) -> usize {
        self.items.len()
    }

    pub fn items(&self) -> &[SnapItem] {
        &self.items
    }

    pub fn item(&self, index: usize) -> Option<&SnapItem> {
        self.items.get(index)
    }

    pub fn find(&self, key: i32) -> Option<&SnapItem> {
        self.items
            .binary_search_by_key(&key, |item| item.key)
            .ok()
            .map(|index| &self.items[index])
    }

    /// Total size in bytes: one key per item plus all item data
    pub fn data_size(&self) -> usize {
        self.items.iter().map(|item| 4 + item.size()).sum()
    }

    /// Wrapping sum of every data integer. Sent with each delta so the client
    /// can verify the reconstructed state.
    pub fn crc(&self) -> u32 {
        self.items
            .iter()
            .flat_map(|item| item.data.iter())
            .fold(0u32, |crc, value| crc.wrapping_add(*value as u32))
    }
}

/// Collects items for one snapshot
#[derive(Debug, Default)]
pub struct SnapshotBuilder {
    items: Vec<SnapItem>,
    data_size: usize,
}

impl SnapshotBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves a zeroed item of `size` ints and returns its data for filling.
    /// Returns `None` on an out-of-range type, a duplicate key, or when the
    /// item or size limit is reached.
    pub fn new_item(&mut self, type_id: u16, id: u16, size: usize) -> Option<&mut [i32]> {
        if type_id as i32 > MAX_TYPE || self.items.len() >= MAX_ITEMS {
            return None;
        }
        let added = 4 + size * 4;
        if self.data_size + added > MAX_SIZE {
            return None;
        }
        let key = item_key(type_id, id);
        if self.items.iter().any(|item| item.key == key) {
            return None;
        }

        self.data_size += added;
        self.items.push(SnapItem {
            key,
            data: vec![0; size],
        });
        self.items.last_mut().map(|item| item.data.as_mut_slice())
    }

    /// Convenience wrapper around [`SnapshotBuilder::new_item`]
    pub fn add_item(&mut self, type_id: u16, id: u16, data: &[i32]) -> bool {
        match self.new_item(type_id, id, data.len()) {
            Some(slot) => {
                slot.copy_from_slice(data);
                true
            }
            None => false,
        }
    }

    pub(crate) fn item_data_mut(&mut self, key: i32) -> Option<&mut Vec<i32>> {
        self.items
            .iter_mut()
            .find(|item| item.key == key)
            .map(|item| &mut item.data)
    }

    pub(crate) fn push_raw(&mut self, key: i32, data: Vec<i32>) -> bool {
        let added = 4 + data.len() * 4;
        if self.items.len() >= MAX_ITEMS || self.data_size + added > MAX_SIZE {
            return false;
        }
        self.data_size += added;
        self.items.push(SnapItem { key, data });
        true
    }

    pub fn num_items(&self) -> usize {
        self.items.len()
    }

    pub fn finish(mut self) -> Snapshot {
        self.items.sort_by_key(|item| item.key);
        Snapshot { items: self.items }
    }
}
