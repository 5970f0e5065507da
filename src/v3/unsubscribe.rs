//! Removing subscriptions: UNSUBSCRIBE and the UNSUBACK reply.

use core::fmt::Display;

use super::{
    header::{
        str_len, write_str, ControlPacketType, FixedHeader, PacketId, RemainingLength, Str,
        TypeFlags,
    },
    subscribe::SubscribeError,
    topic, write_list, Decode, DecodeError, DecodePacket, Encode, EncodeError, EncodePacket,
    Writer,
};

/// Drops the subscriptions matching the given filters exactly.
///
/// <https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718072>
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pkid: PacketId,
    topics: Vec<String>,
}

impl Unsubscribe {
    /// Creates an UNSUBSCRIBE for the given filters.
    ///
    /// # Errors
    ///
    /// If the list is empty or a filter is invalid.
    pub fn new(pkid: PacketId, topics: Vec<String>) -> Result<Self, SubscribeError> {
        if topics.is_empty() {
            return Err(SubscribeError::Empty);
        }

        for filter in &topics {
            topic::validate_topic_filter(filter)?;
        }

        Ok(Self { pkid, topics })
    }

    /// Returns the packet identifier.
    #[must_use]
    pub fn pkid(&self) -> PacketId {
        self.pkid
    }

    /// Returns the topic filters to unsubscribe from.
    #[must_use]
    pub fn topics(&self) -> &[String] {
        &self.topics
    }
}

impl Display for Unsubscribe {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{} pkid({}) ({})",
            ControlPacketType::Unsubscribe,
            self.pkid,
            self.topics.join(", ")
        )
    }
}

impl EncodePacket for Unsubscribe {
    fn packet_type(&self) -> ControlPacketType {
        ControlPacketType::Unsubscribe
    }

    fn packet_flags(&self) -> TypeFlags {
        TypeFlags::RESERVED_ONE
    }

    fn remaining_len(&self) -> usize {
        self.topics
            .iter()
            .map(|topic| str_len(topic))
            .fold(self.pkid.encode_len(), |acc, len| acc.saturating_add(len))
    }

    fn write_packet<W>(&self, writer: &mut W) -> Result<usize, EncodeError<W::Err>>
    where
        W: Writer,
    {
        if self.topics.is_empty() {
            return Err(EncodeError::EmptyTopics);
        }

        write_list(self.pkid, &self.topics, writer, |topic, writer| {
            write_str(topic, writer)
        })
    }
}

impl DecodePacket for Unsubscribe {
    fn packet_type() -> ControlPacketType {
        ControlPacketType::Unsubscribe
    }

    fn parse_with_header(_header: FixedHeader, bytes: &[u8]) -> Result<Self, DecodeError> {
        let (pkid, mut bytes) = PacketId::parse(bytes)?;

        if bytes.is_empty() {
            return Err(DecodeError::EmptyTopics);
        }

        let mut topics = Vec::new();

        while !bytes.is_empty() {
            let (filter, rest) = Str::parse(bytes)?;
            topic::validate_topic_filter(&filter)?;

            topics.push(filter.as_str().to_owned());
            bytes = rest;
        }

        Ok(Self { pkid, topics })
    }
}

/// Confirms an [`Unsubscribe`].
///
/// <https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718077>
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UnsubAck {
    pkid: PacketId,
}

impl UnsubAck {
    const REMAINING_LENGTH: RemainingLength = RemainingLength::new_const(2);

    /// Confirmation for `pkid`.
    #[must_use]
    pub const fn new(pkid: PacketId) -> Self {
        Self { pkid }
    }

    /// Returns the packet identifier.
    #[must_use]
    pub fn pkid(&self) -> PacketId {
        self.pkid
    }
}

impl Display for UnsubAck {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{} pkid({})", ControlPacketType::UnsubAck, self.pkid)
    }
}

impl DecodePacket for UnsubAck {
    fn packet_type() -> ControlPacketType {
        ControlPacketType::UnsubAck
    }

    fn fixed_remaining_length() -> Option<RemainingLength> {
        Some(Self::REMAINING_LENGTH)
    }

    fn parse_with_header(_header: FixedHeader, bytes: &[u8]) -> Result<Self, DecodeError> {
        let (pkid, _) = PacketId::parse(bytes)?;

        Ok(Self::new(pkid))
    }
}

impl EncodePacket for UnsubAck {
    fn packet_type(&self) -> ControlPacketType {
        ControlPacketType::UnsubAck
    }

    fn packet_flags(&self) -> TypeFlags {
        TypeFlags::empty()
    }

    fn remaining_len(&self) -> usize {
        2
    }

    fn write_packet<W>(&self, writer: &mut W) -> Result<usize, EncodeError<W::Err>>
    where
        W: Writer,
    {
        self.pkid.write(writer)
    }
}
