use crate::v3::DecodeError;

pub(crate) fn read_u8(bytes: &[u8]) -> Result<(u8, &[u8]), DecodeError> {
    let ([byte], rest) = read_chunk::<1>(bytes)?;

    Ok((*byte, rest))
}

pub(crate) fn read_u16(bytes: &[u8]) -> Result<(u16, &[u8]), DecodeError> {
    let (value, rest) = read_chunk::<2>(bytes)?;

    Ok((u16::from_be_bytes(*value), rest))
}

pub(crate) fn read_exact(bytes: &[u8], length: usize) -> Result<(&[u8], &[u8]), DecodeError> {
    if length > bytes.len() {
        return Err(DecodeError::not_enough(bytes, length));
    }

    Ok(bytes.split_at(length))
}

pub(crate) fn read_chunk<const N: usize>(bytes: &[u8]) -> Result<(&[u8; N], &[u8]), DecodeError> {
    let (read, rest) = read_exact(bytes, N)?;

    read.try_into()
        .map(|read| (read, rest))
        .map_err(|_| DecodeError::not_enough(bytes, N))
}

/// Reads a two bytes length prefixed binary field.
pub(crate) fn read_binary(bytes: &[u8]) -> Result<(&[u8], &[u8]), DecodeError> {
    let (length, bytes) = read_u16(bytes)?;

    // The size can't be bigger than the u16 max
    read_exact(bytes, usize::from(length))
}
