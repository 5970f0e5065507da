//! Fixed header and the common fields of the MQTT packets.

use core::{fmt::Display, mem, num::NonZeroU16, ops::Deref};

use bitflags::bitflags;

use crate::bytes::{read_binary, read_u16, read_u8};

use super::{Decode, DecodeError, Encode, EncodeError, Writer};

pub use self::remaining_length::{RemainingLength, RemainingLengthError};

mod remaining_length;

/// Invalid text field.
#[derive(Debug)]
#[non_exhaustive]
pub enum StrError {
    /// Doesn't fit the two bytes length prefix.
    MaxBytes {
        /// Bytes in the string.
        len: usize,
    },
    /// Invalid UTF-8, or a code point forbidden in MQTT strings.
    Utf8,
}

impl Display for StrError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::MaxBytes { len } => write!(f, "string of {len} bytes is too long"),
            Self::Utf8 => f.write_str("string contains invalid characters"),
        }
    }
}

impl std::error::Error for StrError {}

/// Borrowed text field, checked for the characters MQTT forbids.
///
/// On the wire it's the UTF-8 bytes after a big endian `u16` length.
///
/// <https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718016>
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Str<'a>(&'a str);

impl<'a> Str<'a> {
    /// Longest string the length prefix allows.
    pub const MAX_BYTES: usize = u16::MAX as usize;

    /// Empty string.
    #[must_use]
    pub const fn new() -> Self {
        Self("")
    }

    /// Returns the inner string.
    #[must_use]
    pub const fn as_str(self) -> &'a str {
        self.0
    }
}

impl Default for Str<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for Str<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        Display::fmt(self.0, f)
    }
}

impl<'a> TryFrom<&'a str> for Str<'a> {
    type Error = StrError;

    fn try_from(value: &'a str) -> Result<Self, Self::Error> {
        let len = value.len();
        if len > Str::MAX_BYTES {
            return Err(StrError::MaxBytes { len });
        }

        value
            .chars()
            .all(is_valid_char)
            .then_some(Str(value))
            .ok_or(StrError::Utf8)
    }
}

impl Deref for Str<'_> {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.0
    }
}

impl Encode for Str<'_> {
    fn encode_len(&self) -> usize {
        mem::size_of::<u16>().saturating_add(self.0.len())
    }

    fn write<W>(&self, writer: &mut W) -> Result<usize, EncodeError<W::Err>>
    where
        W: Writer,
    {
        let len = u16::try_from(self.0.len()).map_err(|_| EncodeError::FrameTooBig {
            max: Str::MAX_BYTES,
        })?;

        let len = writer.write_u16(len).map_err(EncodeError::Write)?;
        let bytes = writer
            .write_slice(self.0.as_bytes())
            .map_err(EncodeError::Write)?;

        Ok(len.saturating_add(bytes))
    }
}

impl<'a> Decode<'a> for Str<'a> {
    fn parse(bytes: &'a [u8]) -> Result<(Self, &'a [u8]), DecodeError> {
        let (data, bytes) = read_binary(bytes)?;

        let data = core::str::from_utf8(data)
            .map_err(|_| StrError::Utf8)
            .and_then(Str::try_from)?;

        Ok((data, bytes))
    }
}

/// Validates and encodes a string field.
pub(crate) fn write_str<W>(value: &str, writer: &mut W) -> Result<usize, EncodeError<W::Err>>
where
    W: Writer,
{
    Str::try_from(value)?.write(writer)
}

/// Length of an encoded string field.
pub(crate) fn str_len(value: &str) -> usize {
    mem::size_of::<u16>().saturating_add(value.len())
}

/// Rejects NUL, the C0 controls and the Unicode noncharacters.
///
/// Noncharacters are U+FDD0..U+FDEF and the last two code points of every plane, see
/// <https://www.unicode.org/faq/private_use.html#nonchar1>.
fn is_valid_char(c: char) -> bool {
    let code = u32::from(c);

    if code <= 0x1F || (0xFDD0..=0xFDEF).contains(&code) {
        return false;
    }

    // xFFFE and xFFFF in any plane
    code & 0xFFFE != 0xFFFE
}

/// Binary data prefixed by its two bytes length.
///
/// Used for the password and the will message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BytesBuf<'a>(&'a [u8]);

impl BytesBuf<'_> {
    /// Maximum number of bytes in the buffer.
    pub const MAX: usize = u16::MAX as usize;
}

impl Deref for BytesBuf<'_> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.0
    }
}

impl<'a> From<&'a [u8]> for BytesBuf<'a> {
    fn from(value: &'a [u8]) -> Self {
        Self(value)
    }
}

impl<'a> Decode<'a> for BytesBuf<'a> {
    fn parse(bytes: &'a [u8]) -> Result<(Self, &'a [u8]), DecodeError> {
        let (buf, bytes) = read_binary(bytes)?;

        Ok((Self(buf), bytes))
    }
}

impl Encode for BytesBuf<'_> {
    fn encode_len(&self) -> usize {
        mem::size_of::<u16>().saturating_add(self.len())
    }

    fn write<W>(&self, writer: &mut W) -> Result<usize, EncodeError<W::Err>>
    where
        W: Writer,
    {
        let len = u16::try_from(self.len())
            .map_err(|_| EncodeError::FrameTooBig { max: BytesBuf::MAX })?;

        let len = writer.write_u16(len).map_err(EncodeError::Write)?;
        let bytes = writer.write_slice(self).map_err(EncodeError::Write)?;

        Ok(len.saturating_add(bytes))
    }
}

/// First bytes of every packet: type, type specific flags and the size of the rest.
///
/// <https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718020>
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedHeader {
    packet_type: ControlPacketType,
    flags: TypeFlags,
    remaining_length: RemainingLength,
}

impl FixedHeader {
    /// Longest encoded header, a type byte and four length bytes.
    pub const MAX_BYTES: usize = 1 + 4;

    /// Creates a new header.
    #[must_use]
    pub fn new(
        packet_type: ControlPacketType,
        flags: TypeFlags,
        remaining_length: RemainingLength,
    ) -> Self {
        Self {
            packet_type,
            flags,
            remaining_length,
        }
    }

    /// Returns the control packet type.
    #[must_use]
    pub fn packet_type(&self) -> ControlPacketType {
        self.packet_type
    }

    /// Returns the control packet flags.
    #[must_use]
    pub fn flags(&self) -> TypeFlags {
        self.flags
    }

    /// Returns the length of the variable header and payload.
    #[must_use]
    pub fn remaining_length(&self) -> RemainingLength {
        self.remaining_length
    }
}

impl<'a> Decode<'a> for FixedHeader {
    fn parse(bytes: &'a [u8]) -> Result<(Self, &'a [u8]), DecodeError> {
        let (type_and_flags, bytes) = read_u8(bytes)?;

        let packet_type = ControlPacketType::try_from(type_and_flags >> 4)?;
        let flags = packet_type.read_flags(type_and_flags & TypeFlags::MASK.bits())?;

        let (remaining_length, bytes) = RemainingLength::parse(bytes)?;

        Ok((
            Self {
                packet_type,
                flags,
                remaining_length,
            },
            bytes,
        ))
    }
}

impl Encode for FixedHeader {
    fn encode_len(&self) -> usize {
        mem::size_of::<u8>().saturating_add(self.remaining_length.encode_len())
    }

    fn write<W>(&self, writer: &mut W) -> Result<usize, EncodeError<W::Err>>
    where
        W: Writer,
    {
        writer
            .write_u8(u8::from(self.packet_type) << 4 | self.flags.bits())
            .map_err(EncodeError::Write)?;

        self.remaining_length.write(writer)?;

        Ok(self.encode_len())
    }
}

/// Kind of a packet, the high nibble of the [`FixedHeader`].
///
/// Values 0 and 15 are reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum ControlPacketType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    PubRec = 5,
    PubRel = 6,
    PubComp = 7,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
}

impl ControlPacketType {
    const ALL: [Self; 14] = [
        Self::Connect,
        Self::ConnAck,
        Self::Publish,
        Self::PubAck,
        Self::PubRec,
        Self::PubRel,
        Self::PubComp,
        Self::Subscribe,
        Self::SubAck,
        Self::Unsubscribe,
        Self::UnsubAck,
        Self::PingReq,
        Self::PingResp,
        Self::Disconnect,
    ];

    /// Upper case name used in the protocol documents.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::ConnAck => "CONNACK",
            Self::Publish => "PUBLISH",
            Self::PubAck => "PUBACK",
            Self::PubRec => "PUBREC",
            Self::PubRel => "PUBREL",
            Self::PubComp => "PUBCOMP",
            Self::Subscribe => "SUBSCRIBE",
            Self::SubAck => "SUBACK",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::UnsubAck => "UNSUBACK",
            Self::PingReq => "PINGREQ",
            Self::PingResp => "PINGRESP",
            Self::Disconnect => "DISCONNECT",
        }
    }

    /// Checks the low nibble of the first header byte.
    pub(crate) fn read_flags(self, flags: u8) -> Result<TypeFlags, DecodeError> {
        let flags = TypeFlags::from_bits_retain(flags & TypeFlags::MASK.bits());

        let expected = match self {
            // Any combination except QoS 3
            Self::Publish if !flags.contains(TypeFlags::PUBLISH_QOS_MASK) => return Ok(flags),
            Self::Publish => None,
            Self::PubRel | Self::Subscribe | Self::Unsubscribe => Some(TypeFlags::RESERVED_ONE),
            _ => Some(TypeFlags::empty()),
        };

        if expected == Some(flags) {
            Ok(flags)
        } else {
            Err(DecodeError::ControlFlags {
                packet_type: self,
                flags,
            })
        }
    }
}

impl Display for ControlPacketType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}({})", self.name(), u8::from(*self))
    }
}

impl TryFrom<u8> for ControlPacketType {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        value
            .checked_sub(1)
            .and_then(|idx| Self::ALL.get(usize::from(idx)))
            .copied()
            .ok_or(DecodeError::PacketType(value))
    }
}

impl From<ControlPacketType> for u8 {
    fn from(value: ControlPacketType) -> Self {
        value as u8
    }
}

bitflags! {
    /// Control Packet type flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TypeFlags: u8 {
        /// Mask for the flag in the [`FixedHeader`].
        const MASK = 0b0000_1111;

        /// Publish is duplicate.
        const PUBLISH_DUP = 0b1000;
        /// Publish QoS first bit.
        const PUBLISH_QOS_1 = 0b0010;
        /// Publish QoS second bit.
        const PUBLISH_QOS_2 = 0b0100;
        /// Publish QoS both bytes
        const PUBLISH_QOS_MASK = 0b0110;
        /// Publish retain flag.
        const PUBLISH_RETAIN = 0b0001;

        /// Reserved flags of PUBREL, SUBSCRIBE and UNSUBSCRIBE.
        const RESERVED_ONE = 0b0010;
    }
}

impl Display for TypeFlags {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:04b}", self.bits())
    }
}

/// Error from an invalid [`PacketId`].
///
/// The packet id must be a valid non zero [`u16`] value.
#[derive(Debug)]
pub struct PacketIdError;

impl Display for PacketIdError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "the packet id must be a valid non zero u16 value")
    }
}

impl std::error::Error for PacketIdError {}

/// Identifier for a Packet with QoS > 0, SUBSCRIBE and UNSUBSCRIBE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PacketId(NonZeroU16);

impl PacketId {
    /// The first identifier.
    pub const MIN: PacketId = PacketId(NonZeroU16::MIN);

    /// Creates the identifier from a non zero value.
    #[must_use]
    pub const fn new(value: NonZeroU16) -> Self {
        Self(value)
    }
}

impl Display for PacketId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<'a> Decode<'a> for PacketId {
    fn parse(bytes: &'a [u8]) -> Result<(Self, &'a [u8]), DecodeError> {
        let (pkid, rest) = read_u16(bytes)?;

        let pkid = PacketId::try_from(pkid)?;

        Ok((pkid, rest))
    }
}

impl Encode for PacketId {
    fn encode_len(&self) -> usize {
        mem::size_of::<u16>()
    }

    fn write<W>(&self, writer: &mut W) -> Result<usize, EncodeError<W::Err>>
    where
        W: Writer,
    {
        writer.write_u16(self.0.get()).map_err(EncodeError::Write)
    }
}

impl Deref for PacketId {
    type Target = NonZeroU16;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<u16> for PacketId {
    type Error = PacketIdError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        NonZeroU16::new(value).ok_or(PacketIdError).map(PacketId)
    }
}

impl From<PacketId> for u16 {
    fn from(value: PacketId) -> Self {
        value.0.get()
    }
}
