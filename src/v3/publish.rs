//! Application messages: PUBLISH and its QoS 1 acknowledgement.

use core::fmt::Display;

use super::{
    header::{
        str_len, write_str, ControlPacketType, FixedHeader, PacketId, RemainingLength, Str,
        TypeFlags,
    },
    topic, Decode, DecodeError, DecodePacket, Encode, EncodeError, EncodePacket, QoS, Writer,
};

/// Application message, sent in both directions.
///
/// <https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718037>
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    qos: PublishQos,
    retain: bool,
    topic: String,
    payload: Vec<u8>,
}

impl Publish {
    /// Creates a new PUBLISH.
    ///
    /// # Errors
    ///
    /// If the topic is not a valid topic name.
    pub fn new(
        topic: impl Into<String>,
        qos: PublishQos,
        retain: bool,
        payload: impl Into<Vec<u8>>,
    ) -> Result<Self, topic::TopicError> {
        let topic = topic.into();

        topic::validate_topic_name(&topic)?;

        Ok(Self {
            qos,
            retain,
            topic,
            payload: payload.into(),
        })
    }

    /// Identifier of a QoS 1 or 2 message.
    #[must_use]
    pub fn pkid(&self) -> Option<PacketId> {
        self.qos.pkid()
    }

    /// Returns the publish QoS.
    #[must_use]
    pub fn qos(&self) -> PublishQos {
        self.qos
    }

    /// Returns the RETAIN flag.
    #[must_use]
    pub fn retain(&self) -> bool {
        self.retain
    }

    /// Returns the topic name.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Returns the application message.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Splits the packet into topic and payload.
    #[must_use]
    pub fn into_parts(self) -> (String, Vec<u8>) {
        (self.topic, self.payload)
    }
}

impl Display for Publish {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{} topic({}) {} retain({}) payload({} bytes)",
            ControlPacketType::Publish,
            self.topic,
            self.qos,
            self.retain,
            self.payload.len()
        )
    }
}

impl EncodePacket for Publish {
    fn packet_type(&self) -> ControlPacketType {
        ControlPacketType::Publish
    }

    fn packet_flags(&self) -> TypeFlags {
        let mut flags = match self.qos.level() {
            QoS::AtMostOnce => TypeFlags::empty(),
            QoS::AtLeastOnce => TypeFlags::PUBLISH_QOS_1,
            QoS::ExactlyOnce => TypeFlags::PUBLISH_QOS_2,
        };

        flags.set(TypeFlags::PUBLISH_DUP, self.qos.dup());
        flags.set(TypeFlags::PUBLISH_RETAIN, self.retain);

        flags
    }

    fn remaining_len(&self) -> usize {
        let pkid = self.qos.pkid().map_or(0, |pkid| pkid.encode_len());

        str_len(&self.topic)
            .saturating_add(pkid)
            .saturating_add(self.payload.len())
    }

    fn write_packet<W>(&self, writer: &mut W) -> Result<usize, EncodeError<W::Err>>
    where
        W: Writer,
    {
        let mut written = write_str(&self.topic, writer)?;

        if let Some(pkid) = self.qos.pkid() {
            written = written.saturating_add(pkid.write(writer)?);
        }

        // Raw bytes up to the end of the packet
        let payload = writer
            .write_slice(&self.payload)
            .map_err(EncodeError::Write)?;

        Ok(written.saturating_add(payload))
    }
}

impl DecodePacket for Publish {
    fn packet_type() -> ControlPacketType {
        ControlPacketType::Publish
    }

    fn parse_with_header(header: FixedHeader, bytes: &[u8]) -> Result<Self, DecodeError> {
        let (topic, bytes) = Str::parse(bytes)?;
        topic::validate_topic_name(&topic)?;

        let (qos, payload) = PublishQos::parse_with_header(header, bytes)?;

        let retain = header.flags().contains(TypeFlags::PUBLISH_RETAIN);

        Ok(Self {
            qos,
            retain,
            topic: topic.as_str().to_owned(),
            payload: payload.to_vec(),
        })
    }
}

/// Delivery level of a [`Publish`] together with the fields that only exist above QoS 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::enum_variant_names)]
pub enum PublishQos {
    /// Fire and forget.
    AtMostOnce,
    /// Acknowledged with a PUBACK.
    AtLeastOnce {
        /// Redelivery of an earlier attempt.
        dup: bool,
        /// Correlates the acknowledgement.
        pkid: PacketId,
    },
    /// Four way handshake, decoded but never sent by this crate.
    ExactlyOnce {
        /// Redelivery of an earlier attempt.
        dup: bool,
        /// Correlates the handshake.
        pkid: PacketId,
    },
}

impl PublishQos {
    /// Returns the packet identifier for QoS 1 and 2.
    #[must_use]
    pub fn pkid(self) -> Option<PacketId> {
        match self {
            PublishQos::AtMostOnce => None,
            PublishQos::AtLeastOnce { pkid, .. } | PublishQos::ExactlyOnce { pkid, .. } => {
                Some(pkid)
            }
        }
    }

    /// Returns the DUP flag.
    #[must_use]
    pub fn dup(self) -> bool {
        match self {
            PublishQos::AtMostOnce => false,
            PublishQos::AtLeastOnce { dup, .. } | PublishQos::ExactlyOnce { dup, .. } => dup,
        }
    }

    /// Returns the [`QoS`] level without the identifier.
    #[must_use]
    pub fn level(self) -> QoS {
        match self {
            PublishQos::AtMostOnce => QoS::AtMostOnce,
            PublishQos::AtLeastOnce { .. } => QoS::AtLeastOnce,
            PublishQos::ExactlyOnce { .. } => QoS::ExactlyOnce,
        }
    }

    /// Reads the packet identifier following the topic, if the header flags call for one.
    fn parse_with_header(header: FixedHeader, bytes: &[u8]) -> Result<(Self, &[u8]), DecodeError> {
        let flags = header.flags();
        let dup = flags.contains(TypeFlags::PUBLISH_DUP);

        let level = (flags & TypeFlags::PUBLISH_QOS_MASK).bits() >> 1;
        let level = QoS::try_from(level)?;

        if level == QoS::AtMostOnce {
            // No redelivery without an acknowledgement
            if dup {
                return Err(DecodeError::ControlFlags {
                    packet_type: ControlPacketType::Publish,
                    flags,
                });
            }

            return Ok((Self::AtMostOnce, bytes));
        }

        let (pkid, bytes) = PacketId::parse(bytes)?;

        let qos = if level == QoS::AtLeastOnce {
            Self::AtLeastOnce { dup, pkid }
        } else {
            Self::ExactlyOnce { dup, pkid }
        };

        Ok((qos, bytes))
    }
}

impl Display for PublishQos {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            PublishQos::AtMostOnce => write!(f, "QoS(0)"),
            PublishQos::AtLeastOnce { dup, pkid } => write!(f, "QoS(1) pkid({pkid}) dup({dup})"),
            PublishQos::ExactlyOnce { dup, pkid } => write!(f, "QoS(2) pkid({pkid}) dup({dup})"),
        }
    }
}

/// Acknowledges a QoS 1 [`Publish`].
///
/// <https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718043>
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PubAck {
    pkid: PacketId,
}

impl PubAck {
    const REMAINING_LENGTH: RemainingLength = RemainingLength::new_const(2);

    /// Acknowledgement for `pkid`.
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

impl Display for PubAck {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{} pkid({})", ControlPacketType::PubAck, self.pkid)
    }
}

impl DecodePacket for PubAck {
    fn packet_type() -> ControlPacketType {
        ControlPacketType::PubAck
    }

    fn fixed_remaining_length() -> Option<RemainingLength> {
        Some(Self::REMAINING_LENGTH)
    }

    fn parse_with_header(_header: FixedHeader, bytes: &[u8]) -> Result<Self, DecodeError> {
        let (pkid, _) = PacketId::parse(bytes)?;

        Ok(Self::new(pkid))
    }
}

impl EncodePacket for PubAck {
    fn packet_type(&self) -> ControlPacketType {
        ControlPacketType::PubAck
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

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::v3::tests::TestWriter;

    use super::*;

    #[test]
    fn should_reject_wildcards() {
        let err = Publish::new("sport/+", PublishQos::AtMostOnce, false, Vec::new()).unwrap_err();

        assert_eq!(err, topic::TopicError::Wildcard);

        let err = Publish::new("sport/#", PublishQos::AtMostOnce, false, Vec::new()).unwrap_err();

        assert_eq!(err, topic::TopicError::Wildcard);
    }

    #[test]
    fn should_encode_and_decode_publish() {
        let publish = Publish::new(
            "a/b",
            PublishQos::AtLeastOnce {
                dup: false,
                pkid: PacketId::try_from(10).unwrap(),
            },
            true,
            b"hello".to_vec(),
        )
        .unwrap();

        let mut writer = TestWriter::new();

        publish.encode(&mut writer).unwrap();

        let expected = [
            0b0011_0011, // publish, QoS 1, retain
            12,          // remaining length
            0, 3, b'a', b'/', b'b', // topic
            0, 10, // pkid
            b'h', b'e', b'l', b'l', b'o',
        ];

        assert_eq!(writer.buf, expected);

        let (decoded, rest) = Publish::parse(&writer.buf).unwrap();

        assert!(rest.is_empty());
        assert_eq!(decoded, publish);
        assert_eq!(decoded.qos().level(), QoS::AtLeastOnce);
    }

    #[test]
    fn should_decode_qos0_without_pkid() {
        let bytes = [0b0011_0000, 6, 0, 1, b't', b'a', b'b', b'c'];

        let (publish, rest) = Publish::parse(&bytes).unwrap();

        assert!(rest.is_empty());
        assert_eq!(publish.pkid(), None);
        assert_eq!(publish.topic(), "t");
        assert_eq!(publish.payload(), b"abc");
    }

    #[test]
    fn should_reject_dup_on_qos0() {
        let bytes = [0b0011_1000, 3, 0, 1, b't'];

        let err = Publish::parse(&bytes).unwrap_err();

        assert!(matches!(err, DecodeError::ControlFlags { .. }), "{err:?}");
    }

    #[test]
    fn should_reject_wildcard_topic_on_decode() {
        let bytes = [0b0011_0000, 3, 0, 1, b'#'];

        let err = Publish::parse(&bytes).unwrap_err();

        assert!(
            matches!(err, DecodeError::Topic(topic::TopicError::Wildcard)),
            "{err:?}"
        );
    }

    #[test]
    fn should_encode_and_decode_puback() {
        let exp_bytes = [0b0100_0000, 2, 0x01, 0x02];

        let puback = PubAck::new(PacketId::try_from(0x0102).unwrap());

        let mut writer = TestWriter::new();

        puback.encode(&mut writer).unwrap();

        assert_eq!(writer.buf, exp_bytes);

        let (decoded, rest) = PubAck::parse(&exp_bytes).unwrap();

        assert!(rest.is_empty());
        assert_eq!(decoded, puback);
    }

    #[test]
    fn should_reject_puback_with_wrong_length() {
        let err = PubAck::parse(&[0b0100_0000, 3, 0, 1, 0]).unwrap_err();

        assert!(matches!(err, DecodeError::RemainingLength(_)), "{err:?}");
    }
}
