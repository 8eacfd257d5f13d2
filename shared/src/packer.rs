//! Message body packing: varints, zero-terminated strings and raw bytes

use crate::error::ProtocolError;
use crate::varint;

/// Upper bound for one packed message body
pub const PACKER_BUFFER_SIZE: usize = 1024 * 2;

/// Builds a message body; once the size limit is hit every further add is
/// ignored and [`Packer::error`] reports it
#[derive(Debug, Default, Clone)]
pub struct Packer {
    buffer: Vec<u8>,
    error: bool,
}

impl Packer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_int(&mut self, value: i32) -> &mut Self {
        if self.error {
            return self;
        }
        let start = self.buffer.len();
        varint::pack(&mut self.buffer, value);
        if self.buffer.len() > PACKER_BUFFER_SIZE {
            self.buffer.truncate(start);
            self.error = true;
        }
        self
    }

    /// Appends `value` followed by a zero byte. Embedded zero bytes are dropped.
    pub fn add_string(&mut self, value: &str) -> &mut Self {
        if self.error {
            return self;
        }
        let start = self.buffer.len();
        self.buffer.extend(value.bytes().filter(|b| *b != 0));
        self.buffer.push(0);
        if self.buffer.len() > PACKER_BUFFER_SIZE {
            self.buffer.truncate(start);
            self.error = true;
        }
        self
    }

    pub fn add_raw(&mut self, data: &[u8]) -> &mut Self {
        if self.error {
            return self;
        }
        if self.buffer.len() + data.len() > PACKER_BUFFER_SIZE {
            self.error = true;
            return self;
        }
        self.buffer.extend_from_slice(data);
        self
    }

    pub fn error(&self) -> bool {
        self.error
    }

    pub fn size(&self) -> usize {
        self.buffer.len()
    }

    pub fn data(&self) -> &[u8] {
        &self.buffer
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }
}

/// Reads back what a [`Packer`] wrote
#[derive(Debug, Clone)]
pub struct Unpacker<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Unpacker<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn get_int(&mut self) -> Result<i32, ProtocolError> {
        if self.pos >= self.data.len() {
            return Err(ProtocolError::UnexpectedEnd);
        }
        let (value, used) = varint::unpack(&self.data[self.pos..])?;
        self.pos += used;
        Ok(value)
    }

    /// Reads a zero-terminated string, replacing control characters with spaces
    pub fn get_string(&mut self) -> Result<String, ProtocolError> {
        let rest = self.data.get(self.pos..).ok_or(ProtocolError::UnexpectedEnd)?;
        let end = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or(ProtocolError::UnexpectedEnd)?;
        let text = std::str::from_utf8(&rest[..end]).map_err(|_| ProtocolError::InvalidString)?;
        self.pos += end + 1;
        Ok(text
            .chars()
            .map(|c| if c.is_control() { ' ' } else { c })
            .collect())
    }

    pub fn get_raw(&mut self, len: usize) -> Result<&'a [u8], ProtocolError> {
        let end = self.pos.checked_add(len).ok_or(ProtocolError::UnexpectedEnd)?;
        let raw = self
            .data
            .get(self.pos..end)
            .ok_or(ProtocolError::UnexpectedEnd)?;
        self.pos = end;
        Ok(raw)
    }

    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos.min(self.data.len())..]
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }
}
