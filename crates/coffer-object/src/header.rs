//! The `"<type> <size>\0"` header prefixed to every stored object.

use crate::{Kind, ObjectError};

/// Parse an object header, returning `(kind, payload_size, header_len)`.
///
/// `header_len` includes the NUL terminator, so `data[header_len..]` is the
/// payload.
pub fn parse(data: &[u8]) -> Result<(Kind, usize, usize), ObjectError> {
    let nul = data
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| ObjectError::InvalidHeader("missing NUL terminator".into()))?;
    let header = &data[..nul];
    let space = header
        .iter()
        .position(|&b| b == b' ')
        .ok_or_else(|| ObjectError::InvalidHeader("missing space".into()))?;

    let kind = Kind::from_name(&header[..space])?;
    let size_str = std::str::from_utf8(&header[space + 1..])
        .map_err(|_| ObjectError::InvalidHeader("non-ASCII size".into()))?;
    if size_str.len() > 1 && size_str.starts_with('0') {
        return Err(ObjectError::InvalidHeader(format!(
            "size has leading zero: {size_str}"
        )));
    }
    let size: usize = size_str
        .parse()
        .map_err(|_| ObjectError::InvalidHeader(format!("bad size: {size_str}")))?;

    Ok((kind, size, nul + 1))
}

/// Render a header for a payload of `size` bytes.
pub fn encode(kind: Kind, size: usize) -> Vec<u8> {
    format!("{} {}\0", kind.name(), size).into_bytes()
}
