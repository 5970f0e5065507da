//! Variable byte integer carrying the size of a packet after its
//! [`FixedHeader`](super::FixedHeader).

use core::{fmt::Display, num::TryFromIntError, ops::Deref};

use crate::{
    bytes::read_u8,
    v3::{Decode, DecodeError, Encode, EncodeError, Writer},
};

/// Invalid size of a packet.
#[derive(Debug)]
#[non_exhaustive]
pub enum RemainingLengthError {
    /// Doesn't fit in four encoded bytes.
    Max {
        /// Value that was requested.
        value: u64,
    },
    /// Length doesn't fit in the platform `usize`.
    TryFromInt(TryFromIntError),
    /// Packet with a fixed size carried a different one.
    InvalidLength {
        /// Size mandated for the packet type.
        expected: u32,
        /// Size in the header.
        actual: u32,
    },
}

impl Display for RemainingLengthError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Max { value } => {
                write!(f, "length {value} exceeds {}", RemainingLength::MAX)
            }
            Self::TryFromInt(..) => f.write_str("length doesn't fit the platform size"),
            Self::InvalidLength { expected, actual } => {
                write!(f, "expected a length of {expected} bytes, got {actual}")
            }
        }
    }
}

impl std::error::Error for RemainingLengthError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        if let Self::TryFromInt(err) = self {
            Some(err)
        } else {
            None
        }
    }
}

impl From<TryFromIntError> for RemainingLengthError {
    fn from(value: TryFromIntError) -> Self {
        Self::TryFromInt(value)
    }
}

/// Number of bytes in the variable header and payload of a packet.
///
/// Encoded in 1 to 4 bytes, 7 bits each starting from the least significant, with the high bit
/// set when another byte follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RemainingLength(u32);

impl RemainingLength {
    const MORE: u8 = 0x80;
    const DIGIT_BITS: u32 = 7;
    const MAX_BYTES: usize = 4;
    /// Largest length representable in four bytes.
    pub const MAX: u32 = 268_435_455;

    /// Creates a length in a const context.
    ///
    /// # Panics
    ///
    /// If the value is greater than the [`MAX`](RemainingLength::MAX).
    #[must_use]
    pub const fn new_const(value: u32) -> Self {
        assert!(value <= Self::MAX, "remaining length exceeds the maximum");

        Self(value)
    }
}

impl<'a> Decode<'a> for RemainingLength {
    fn parse(mut bytes: &'a [u8]) -> Result<(Self, &'a [u8]), DecodeError> {
        let mut value = 0u32;

        for i in 0..Self::MAX_BYTES {
            let (byte, rest) = read_u8(bytes)?;
            bytes = rest;

            value |= u32::from(byte & !Self::MORE) << (Self::DIGIT_BITS * i as u32);

            if byte & Self::MORE == 0 {
                return Ok((Self(value), bytes));
            }
        }

        Err(DecodeError::RemainingLengthBytes)
    }
}

impl Encode for RemainingLength {
    fn encode_len(&self) -> usize {
        let mut len = 1;
        let mut value = self.0 >> Self::DIGIT_BITS;

        while value > 0 {
            len += 1;
            value >>= Self::DIGIT_BITS;
        }

        len
    }

    fn write<W>(&self, writer: &mut W) -> Result<usize, EncodeError<W::Err>>
    where
        W: Writer,
    {
        let mut buf = [0u8; Self::MAX_BYTES];
        let mut value = self.0;
        let mut len = 0;

        loop {
            let digit = (value & u32::from(!Self::MORE)) as u8;
            value >>= Self::DIGIT_BITS;

            if value == 0 {
                buf[len] = digit;
                len += 1;

                break;
            }

            buf[len] = digit | Self::MORE;
            len += 1;
        }

        writer
            .write_slice(&buf[..len])
            .map_err(EncodeError::Write)
    }
}

impl TryFrom<u32> for RemainingLength {
    type Error = RemainingLengthError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        if value <= Self::MAX {
            Ok(Self(value))
        } else {
            Err(RemainingLengthError::Max {
                value: u64::from(value),
            })
        }
    }
}

impl TryFrom<usize> for RemainingLength {
    type Error = RemainingLengthError;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        u32::try_from(value)
            .map_err(|_| RemainingLengthError::Max {
                value: value as u64,
            })
            .and_then(Self::try_from)
    }
}

impl TryFrom<RemainingLength> for usize {
    type Error = RemainingLengthError;

    fn try_from(value: RemainingLength) -> Result<Self, Self::Error> {
        Ok(usize::try_from(value.0)?)
    }
}

impl Deref for RemainingLength {
    type Target = u32;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
