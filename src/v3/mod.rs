//! Data representation and codec of the MQTT v3.1.1 packets.
//!
//! <https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html>

use core::{
    convert::Infallible,
    fmt::Display,
    num::TryFromIntError,
};
use std::io::{self, BufWriter, Write};

use header::{
    ControlPacketType, FixedHeader, PacketId, PacketIdError, RemainingLength,
    RemainingLengthError, StrError, TypeFlags,
};

use crate::bytes::read_exact;

/// Implements the codec for a packet made of only the fixed header.
macro_rules! header_only_packet {
    ($name:ident) => {
        impl $name {
            const REMAINING_LENGTH: $crate::v3::header::RemainingLength =
                $crate::v3::header::RemainingLength::new_const(0);
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}", $crate::v3::header::ControlPacketType::$name)
            }
        }

        impl $crate::v3::EncodePacket for $name {
            fn packet_type(&self) -> $crate::v3::header::ControlPacketType {
                $crate::v3::header::ControlPacketType::$name
            }

            fn packet_flags(&self) -> $crate::v3::header::TypeFlags {
                $crate::v3::header::TypeFlags::empty()
            }

            fn remaining_len(&self) -> usize {
                0
            }

            fn write_packet<W>(
                &self,
                _writer: &mut W,
            ) -> Result<usize, $crate::v3::EncodeError<W::Err>>
            where
                W: $crate::v3::Writer,
            {
                Ok(0)
            }
        }

        impl $crate::v3::DecodePacket for $name {
            fn packet_type() -> $crate::v3::header::ControlPacketType {
                $crate::v3::header::ControlPacketType::$name
            }

            fn fixed_remaining_length() -> Option<$crate::v3::header::RemainingLength> {
                Some(Self::REMAINING_LENGTH)
            }

            fn parse_with_header(
                _header: $crate::v3::header::FixedHeader,
                _bytes: &[u8],
            ) -> Result<Self, $crate::v3::DecodeError> {
                Ok(Self)
            }
        }
    };
}

pub mod connect;
pub mod disconnect;
pub mod header;
pub mod packet;
pub mod ping;
pub mod publish;
pub mod subscribe;
pub mod topic;
pub mod unsubscribe;

pub use self::packet::ControlPacket;

/// Maximum size of an encoded packet, fixed header included.
pub const MAX_PACKET_SIZE: usize = FixedHeader::MAX_BYTES + RemainingLength::MAX as usize;

/// Error returned when a packet couldn't be decoded.
#[derive(Debug)]
#[non_exhaustive]
pub enum DecodeError {
    /// The buffer doesn't contain the whole value.
    NotEnoughBytes {
        /// Number of bytes missing.
        needed: usize,
    },
    /// The remaining length was encoded with more than 4 bytes.
    RemainingLengthBytes,
    /// The remaining length is invalid for the packet.
    RemainingLength(RemainingLengthError),
    /// Reserved or unknown control packet type.
    PacketType(u8),
    /// The packet type is valid, but not supported by the client.
    Unsupported(ControlPacketType),
    /// A different packet was expected.
    WrongPacket {
        /// Packet type that was expected.
        expected: ControlPacketType,
        /// Packet type that was received.
        actual: ControlPacketType,
    },
    /// Invalid flags in the fixed header.
    ControlFlags {
        /// The type of the packet.
        packet_type: ControlPacketType,
        /// The received flags.
        flags: TypeFlags,
    },
    /// Invalid UTF-8 string.
    Str(StrError),
    /// The packet identifier was zero.
    PacketIdentifier(PacketIdError),
    /// Invalid topic name or filter.
    Topic(topic::TopicError),
    /// The CONNECT protocol name is not "MQTT".
    ProtocolName,
    /// The CONNECT protocol level is not 4.
    ProtocolLevel(u8),
    /// A reserved bit or value was used.
    Reserved,
    /// Invalid QoS value.
    QoS(u8),
    /// A SUBSCRIBE or SUBACK without topics or return codes.
    EmptySubscribe,
    /// An UNSUBSCRIBE without topics.
    EmptyTopics,
    /// Bytes are left in the packet after decoding all the fields.
    TrailingBytes {
        /// Number of bytes left.
        remaining: usize,
    },
}

impl DecodeError {
    pub(crate) const fn not_enough(bytes: &[u8], length: usize) -> Self {
        DecodeError::NotEnoughBytes {
            needed: length.saturating_sub(bytes.len()),
        }
    }
}

impl Display for DecodeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            DecodeError::NotEnoughBytes { needed } => {
                write!(f, "not enough bytes, {needed} more are needed")
            }
            DecodeError::RemainingLengthBytes => {
                write!(f, "remaining length exceeded the maximum of 4 bytes")
            }
            DecodeError::RemainingLength(_) => write!(f, "invalid remaining length"),
            DecodeError::PacketType(packet_type) => {
                write!(f, "invalid control packet type {packet_type}")
            }
            DecodeError::Unsupported(packet_type) => {
                write!(f, "unsupported control packet {packet_type}")
            }
            DecodeError::WrongPacket { expected, actual } => {
                write!(f, "expected packet {expected}, but received {actual}")
            }
            DecodeError::ControlFlags { packet_type, flags } => {
                write!(f, "invalid control packet flags {flags} for {packet_type}")
            }
            DecodeError::Str(_) => write!(f, "invalid UTF-8 encoded string"),
            DecodeError::PacketIdentifier(_) => write!(f, "invalid packet identifier"),
            DecodeError::Topic(_) => write!(f, "invalid topic"),
            DecodeError::ProtocolName => write!(f, "the protocol name is not MQTT"),
            DecodeError::ProtocolLevel(level) => {
                write!(f, "unsupported protocol level {level}")
            }
            DecodeError::Reserved => write!(f, "reserved value or flag was set"),
            DecodeError::QoS(qos) => write!(f, "invalid QoS value {qos}"),
            DecodeError::EmptySubscribe => {
                write!(f, "subscribe packet must contain at least one topic")
            }
            DecodeError::EmptyTopics => {
                write!(f, "unsubscribe packet must contain at least one topic")
            }
            DecodeError::TrailingBytes { remaining } => {
                write!(f, "{remaining} bytes left in the packet after decoding")
            }
        }
    }
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DecodeError::RemainingLength(err) => Some(err),
            DecodeError::Str(err) => Some(err),
            DecodeError::PacketIdentifier(err) => Some(err),
            DecodeError::Topic(err) => Some(err),
            DecodeError::NotEnoughBytes { .. }
            | DecodeError::RemainingLengthBytes
            | DecodeError::PacketType(_)
            | DecodeError::Unsupported(_)
            | DecodeError::WrongPacket { .. }
            | DecodeError::ControlFlags { .. }
            | DecodeError::ProtocolName
            | DecodeError::ProtocolLevel(_)
            | DecodeError::Reserved
            | DecodeError::QoS(_)
            | DecodeError::EmptySubscribe
            | DecodeError::EmptyTopics
            | DecodeError::TrailingBytes { .. } => None,
        }
    }
}

impl From<RemainingLengthError> for DecodeError {
    fn from(value: RemainingLengthError) -> Self {
        DecodeError::RemainingLength(value)
    }
}

impl From<TryFromIntError> for DecodeError {
    fn from(value: TryFromIntError) -> Self {
        DecodeError::RemainingLength(RemainingLengthError::TryFromInt(value))
    }
}

impl From<StrError> for DecodeError {
    fn from(value: StrError) -> Self {
        DecodeError::Str(value)
    }
}

impl From<PacketIdError> for DecodeError {
    fn from(value: PacketIdError) -> Self {
        DecodeError::PacketIdentifier(value)
    }
}

impl From<topic::TopicError> for DecodeError {
    fn from(value: topic::TopicError) -> Self {
        DecodeError::Topic(value)
    }
}

/// Error returned when a packet couldn't be encoded.
#[derive(Debug)]
#[non_exhaustive]
pub enum EncodeError<E> {
    /// The underlying [`Writer`] failed.
    Write(E),
    /// A field is bigger than its maximum length.
    FrameTooBig {
        /// Maximum number of bytes for the field.
        max: usize,
    },
    /// The packet exceeds the maximum remaining length.
    RemainingLength(RemainingLengthError),
    /// Invalid UTF-8 string.
    Str(StrError),
    /// A SUBSCRIBE or UNSUBSCRIBE without topics.
    EmptyTopics,
}

impl<E> Display for EncodeError<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            EncodeError::Write(_) => write!(f, "couldn't write the packet"),
            EncodeError::FrameTooBig { max } => {
                write!(f, "field exceeds the maximum of {max} bytes")
            }
            EncodeError::RemainingLength(_) => write!(f, "invalid remaining length"),
            EncodeError::Str(_) => write!(f, "invalid UTF-8 encoded string"),
            EncodeError::EmptyTopics => write!(f, "the packet must contain at least one topic"),
        }
    }
}

impl<E> std::error::Error for EncodeError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EncodeError::Write(err) => Some(err),
            EncodeError::RemainingLength(err) => Some(err),
            EncodeError::Str(err) => Some(err),
            EncodeError::FrameTooBig { .. } | EncodeError::EmptyTopics => None,
        }
    }
}

impl<E> From<RemainingLengthError> for EncodeError<E> {
    fn from(value: RemainingLengthError) -> Self {
        EncodeError::RemainingLength(value)
    }
}

impl<E> From<StrError> for EncodeError<E> {
    fn from(value: StrError) -> Self {
        EncodeError::Str(value)
    }
}

impl EncodeError<Infallible> {
    /// Changes the writer error of an in-memory encode, which can't fail to write.
    #[must_use]
    pub fn into_writer_err<E>(self) -> EncodeError<E> {
        match self {
            EncodeError::Write(never) => match never {},
            EncodeError::FrameTooBig { max } => EncodeError::FrameTooBig { max },
            EncodeError::RemainingLength(err) => EncodeError::RemainingLength(err),
            EncodeError::Str(err) => EncodeError::Str(err),
            EncodeError::EmptyTopics => EncodeError::EmptyTopics,
        }
    }
}

/// Destination of the encoded packets.
pub trait Writer {
    /// Error returned by the writer.
    type Err;

    /// Writes the whole slice, returning the number of bytes written.
    fn write_slice(&mut self, buf: &[u8]) -> Result<usize, Self::Err>;

    /// Writes a single byte.
    fn write_u8(&mut self, value: u8) -> Result<usize, Self::Err> {
        self.write_slice(&[value])
    }

    /// Writes a big endian two bytes integer.
    fn write_u16(&mut self, value: u16) -> Result<usize, Self::Err> {
        self.write_slice(&value.to_be_bytes())
    }

    /// Writes the whole slice.
    fn write_all(&mut self, buf: &[u8]) -> Result<(), Self::Err> {
        self.write_slice(buf).map(|_| ())
    }
}

impl Writer for Vec<u8> {
    type Err = Infallible;

    fn write_slice(&mut self, buf: &[u8]) -> Result<usize, Self::Err> {
        self.extend_from_slice(buf);

        Ok(buf.len())
    }
}

impl<W> Writer for BufWriter<W>
where
    W: Write,
{
    type Err = io::Error;

    fn write_slice(&mut self, buf: &[u8]) -> Result<usize, Self::Err> {
        Write::write_all(self, buf)?;

        Ok(buf.len())
    }
}

/// Encode a field of a packet.
pub trait Encode {
    /// Number of bytes of the encoded value.
    fn encode_len(&self) -> usize;

    /// Writes the value returning the number of bytes written.
    ///
    /// # Errors
    ///
    /// If the value is invalid or the writer failed.
    fn write<W>(&self, writer: &mut W) -> Result<usize, EncodeError<W::Err>>
    where
        W: Writer;
}

/// Parses a value from the bytes.
pub trait Decode<'a>: Sized {
    /// Parses the bytes into a value.
    ///
    /// It returns the remaining bytes after the value was parsed.
    ///
    /// # Errors
    ///
    /// If the bytes are not a valid value, or more bytes are needed.
    fn parse(bytes: &'a [u8]) -> Result<(Self, &'a [u8]), DecodeError>;
}

/// Encode a whole control packet, fixed header included.
pub trait EncodePacket {
    /// Control packet type of the fixed header.
    fn packet_type(&self) -> ControlPacketType;

    /// Flags of the fixed header.
    fn packet_flags(&self) -> TypeFlags;

    /// Length of the variable header and payload.
    fn remaining_len(&self) -> usize;

    /// Writes the variable header and payload.
    ///
    /// # Errors
    ///
    /// If a field is invalid or the writer failed.
    fn write_packet<W>(&self, writer: &mut W) -> Result<usize, EncodeError<W::Err>>
    where
        W: Writer;

    /// Returns the fixed header of the packet.
    ///
    /// # Errors
    ///
    /// If the packet exceeds the maximum [`RemainingLength`].
    fn fixed_header(&self) -> Result<FixedHeader, RemainingLengthError> {
        RemainingLength::try_from(self.remaining_len()).map(|remaining_length| {
            FixedHeader::new(self.packet_type(), self.packet_flags(), remaining_length)
        })
    }

    /// Writes the full packet, returning the number of bytes written.
    ///
    /// # Errors
    ///
    /// If the packet is invalid or the writer failed.
    fn encode<W>(&self, writer: &mut W) -> Result<usize, EncodeError<W::Err>>
    where
        W: Writer,
    {
        let fixed_header = self.fixed_header()?;

        let header = fixed_header.write(writer)?;
        let body = self.write_packet(writer)?;

        debug_assert_eq!(
            body,
            self.remaining_len(),
            "BUG: remaining length differs from the written bytes"
        );

        Ok(header.saturating_add(body))
    }

    /// Encodes the packet into a new buffer.
    ///
    /// # Errors
    ///
    /// If the packet is invalid.
    fn to_bytes(&self) -> Result<Vec<u8>, EncodeError<Infallible>> {
        let capacity = FixedHeader::MAX_BYTES.saturating_add(self.remaining_len());
        let mut buf = Vec::with_capacity(capacity);

        self.encode(&mut buf)?;

        Ok(buf)
    }
}

/// Decode a whole control packet.
pub trait DecodePacket: Sized {
    /// Control packet type of the packet.
    fn packet_type() -> ControlPacketType;

    /// Remaining length for packets that have a fixed one.
    fn fixed_remaining_length() -> Option<RemainingLength> {
        None
    }

    /// Parses the variable header and payload.
    ///
    /// The bytes are exactly the remaining length of the header.
    ///
    /// # Errors
    ///
    /// If the packet is malformed.
    fn parse_with_header(header: FixedHeader, bytes: &[u8]) -> Result<Self, DecodeError>;

    /// Checks the packet type and remaining length of the header.
    ///
    /// # Errors
    ///
    /// If the header is for a different packet or has an invalid length.
    fn check_header(header: &FixedHeader) -> Result<(), DecodeError> {
        if header.packet_type() != Self::packet_type() {
            return Err(DecodeError::WrongPacket {
                expected: Self::packet_type(),
                actual: header.packet_type(),
            });
        }

        if let Some(expected) = Self::fixed_remaining_length() {
            if header.remaining_length() != expected {
                return Err(DecodeError::RemainingLength(
                    RemainingLengthError::InvalidLength {
                        expected: *expected,
                        actual: *header.remaining_length(),
                    },
                ));
            }
        }

        Ok(())
    }

    /// Parses a full packet, returning the bytes after it.
    ///
    /// # Errors
    ///
    /// If the packet is malformed, or more bytes are needed.
    fn parse(bytes: &[u8]) -> Result<(Self, &[u8]), DecodeError> {
        let (header, bytes) = FixedHeader::parse(bytes)?;

        Self::check_header(&header)?;

        let remaining_length = usize::try_from(header.remaining_length())?;
        let (bytes, rest) = read_exact(bytes, remaining_length)?;

        let packet = Self::parse_with_header(header, bytes)?;

        Ok((packet, rest))
    }
}

/// Writes the packet identifier followed by every entry of a list payload.
pub(crate) fn write_list<W, I, F>(
    pkid: PacketId,
    entries: I,
    writer: &mut W,
    mut write_entry: F,
) -> Result<usize, EncodeError<W::Err>>
where
    W: Writer,
    I: IntoIterator,
    F: FnMut(I::Item, &mut W) -> Result<usize, EncodeError<W::Err>>,
{
    let mut written = pkid.write(writer)?;

    for entry in entries {
        written = written.saturating_add(write_entry(entry, writer)?);
    }

    Ok(written)
}

/// Comma separated entries, for the [`Display`] of list packets.
pub(crate) struct DisplayList<'a, T>(pub(crate) &'a [T]);

impl<T: Display> Display for DisplayList<'_, T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        for (i, entry) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }

            write!(f, "{entry}")?;
        }

        Ok(())
    }
}

/// Checks that all the bytes of a packet were consumed.
pub(crate) fn expect_empty(bytes: &[u8]) -> Result<(), DecodeError> {
    if bytes.is_empty() {
        Ok(())
    } else {
        Err(DecodeError::TrailingBytes {
            remaining: bytes.len(),
        })
    }
}

/// Quality of Service level for the delivery of an Application Message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum QoS {
    /// At most once delivery (fire and forget).
    #[default]
    AtMostOnce = 0,
    /// At least once delivery, acknowledged by a PUBACK.
    AtLeastOnce = 1,
    /// Exactly once delivery.
    ExactlyOnce = 2,
}

impl Display for QoS {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "QoS({})", *self as u8)
    }
}

impl From<QoS> for u8 {
    fn from(value: QoS) -> Self {
        value as u8
    }
}

impl TryFrom<u8> for QoS {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(DecodeError::QoS(value)),
        }
    }
}
