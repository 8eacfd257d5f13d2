//! Variable-length integer codec used for message headers and snapshot deltas
//!
//! Layout of the first byte: bit 7 extends, bit 6 is the sign, bits 0..6 carry
//! data. Every following byte carries 7 data bits plus the extend bit. Negative
//! values are stored bit-inverted with the sign bit set, so small magnitudes of
//! either sign take a single byte.

use crate::error::ProtocolError;

/// Worst-case encoded length of one `i32`
pub const MAX_BYTES_PACKED: usize = 5;

/// Appends the encoding of `value` to `dst`
pub fn pack(dst: &mut Vec<u8>, value: i32) {
    let mut first = ((value >> 25) & 0x40) as u8;
    let mut rest = (value ^ (value >> 31)) as u32;

    first |= (rest & 0x3f) as u8;
    rest >>= 6;
    if rest == 0 {
        dst.push(first);
        return;
    }

    dst.push(first | 0x80);
    loop {
        let mut byte = (rest & 0x7f) as u8;
        rest >>= 7;
        if rest != 0 {
            byte |= 0x80;
        }
        dst.push(byte);
        if rest == 0 {
            break;
        }
    }
}

/// Decodes one integer from the front of `src`, returning it with the number
/// of bytes consumed
pub fn unpack(src: &[u8]) -> Result<(i32, usize), ProtocolError> {
    let first = *src.first().ok_or(ProtocolError::TruncatedVarint)?;
    let sign = ((first >> 6) & 1) as i32;
    let mut value = (first & 0x3f) as i32;
    let mut used = 1;

    if first & 0x80 != 0 {
        let mut shift = 6;
        loop {
            let byte = *src.get(used).ok_or(ProtocolError::TruncatedVarint)?;
            used += 1;
            let bits = if shift == 27 { byte & 0x0f } else { byte & 0x7f };
            value |= (bits as i32) << shift;
            if byte & 0x80 == 0 || shift == 27 {
                break;
            }
            shift += 7;
        }
    }

    value ^= -sign;
    Ok((value, used))
}

/// Packs a whole int stream, as done for snapshot deltas before chunking
pub fn compress(src: &[i32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(src.len() * 2);
    for value in src {
        pack(&mut out, *value);
    }
    out
}

/// Inverse of [`compress`]; fails if the last integer is cut off
pub fn decompress(src: &[u8]) -> Result<Vec<i32>, ProtocolError> {
    let mut out = Vec::with_capacity(src.len());
    let mut pos = 0;
    while pos < src.len() {
        let (value, used) = unpack(&src[pos..])?;
        out.push(value);
        pos += used;
    }
    Ok(out)
}
