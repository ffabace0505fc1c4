use alloc::{
    string::{String, ToString},
    vec::Vec,
};
use core::{
    any::type_name,
    ops::{Add, Rem, Sub},
};

use zerocopy::FromBytes;

use crate::ReadError;

/// Read a plain header struct at the given offset.
pub fn read_at<T: FromBytes + Copy>(data: &[u8], offset: usize) -> Result<T, ReadError> {
    let bytes = data.get(offset..).ok_or_else(|| {
        ReadError(alloc::format!("{} at {:#x} (size {:#x})", type_name::<T>(), offset, data.len()))
    })?;
    T::read_from_prefix(bytes)
        .map_err(|_| ReadError(type_name::<T>().to_string()))
        .map(|(value, _)| value)
}

pub fn aligned_to<T: Add<Output = T> + Sub<Output = T> + Rem<Output = T> + Eq + Copy + Default>(
    value: T, alignment: T,
) -> T {
    if value % alignment == T::default() {
        return value;
    }
    value + alignment - (value % alignment)
}

pub fn read_u8(data: &[u8], offset: usize) -> Result<u8, ReadError> {
    data.get(offset).copied().ok_or_else(|| ReadError(alloc::format!("u8 at {:#x}", offset)))
}

pub fn read_u16(data: &[u8], offset: usize) -> Result<u16, ReadError> {
    data.get(offset..offset + 2)
        .map(|bytes| u16::from_le_bytes([bytes[0], bytes[1]]))
        .ok_or_else(|| ReadError(alloc::format!("u16 at {:#x}", offset)))
}

pub fn read_u32(data: &[u8], offset: usize) -> Result<u32, ReadError> {
    data.get(offset..offset + 4)
        .map(|bytes| u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        .ok_or_else(|| ReadError(alloc::format!("u32 at {:#x}", offset)))
}

pub fn write_u16(data: &mut Vec<u8>, value: u16) { data.extend_from_slice(&value.to_le_bytes()); }

pub fn write_u32(data: &mut Vec<u8>, value: u32) { data.extend_from_slice(&value.to_le_bytes()); }

/// Pad with zeroes until the length is a multiple of four.
pub fn pad_to_dword(data: &mut Vec<u8>) {
    let padded = aligned_to(data.len(), 4);
    data.resize(padded, 0);
}

/// Read a null-terminated UTF-16LE string starting at the offset.
/// Returns the string and the number of bytes consumed including the terminator.
pub fn read_u16_string(data: &[u8], offset: usize) -> Result<(String, usize), ReadError> {
    let mut units = Vec::new();
    let mut position = offset;
    loop {
        let unit = read_u16(data, position)?;
        position += 2;
        if unit == 0 {
            break;
        }
        units.push(unit);
    }
    Ok((String::from_utf16_lossy(&units), position - offset))
}

/// Encode a string as null-terminated UTF-16LE.
pub fn string_to_u16<S: AsRef<str>>(string: S) -> Vec<u8> {
    let string = string.as_ref();
    let mut data = Vec::with_capacity(string.len() * 2 + 2);
    data.extend(string.encode_utf16().flat_map(|c| c.to_le_bytes()));
    data.extend([0, 0]);
    data
}
