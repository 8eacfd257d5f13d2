//! Map files served to connecting clients

use crate::error::ServerError;
use sha2::{Digest, Sha256};
use shared::protocol::MAP_CHUNK_SIZE;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct MapFile {
    pub name: String,
    pub data: Vec<u8>,
    pub sha256: [u8; 32],
    /// CRC32 of the whole file
    pub crc: u32,
}

impl MapFile {
    pub fn from_bytes(name: &str, data: Vec<u8>) -> Self {
        let sha256: [u8; 32] = Sha256::digest(&data).into();
        let crc = crc32fast::hash(&data);
        Self {
            name: name.to_string(),
            data,
            sha256,
            crc,
        }
    }

    pub fn load(maps_dir: &Path, name: &str) -> Result<Self, ServerError> {
        let path = maps_dir.join(format!("{}.map", name));
        let data = fs::read(&path).map_err(|source| ServerError::MapLoad { path, source })?;
        Ok(Self::from_bytes(name, data))
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn num_chunks(&self) -> usize {
        self.data.len().div_ceil(MAP_CHUNK_SIZE)
    }

    /// Data of chunk `index` and whether it is the last one
    pub fn chunk(&self, index: usize) -> Option<(&[u8], bool)> {
        if index >= self.num_chunks() {
            return None;
        }
        let start = index * MAP_CHUNK_SIZE;
        let end = (start + MAP_CHUNK_SIZE).min(self.data.len());
        Some((&self.data[start..end], end == self.data.len()))
    }
}

/// Names of the `.map` files in `maps_dir`, sorted
pub fn list_maps(maps_dir: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(maps_dir) else {
        return Vec::new();
    };
    let mut maps: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "map"))
        .filter_map(|path| path.file_stem().and_then(|stem| stem.to_str()).map(String::from))
        .collect();
    maps.sort();
    maps
}
