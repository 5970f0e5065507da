//! SUBSCRIBE with its filters, and the SUBACK granting them.

use core::fmt::Display;

use crate::bytes::read_u8;

use super::{
    header::{str_len, write_str, ControlPacketType, FixedHeader, PacketId, Str, TypeFlags},
    topic, write_list, Decode, DecodeError, DecodePacket, DisplayList, Encode, EncodeError,
    EncodePacket, QoS, Writer,
};

/// Registers one or more [`TopicFilter`]s, answered by a [`SubAck`] with the same identifier.
///
/// <https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718063>
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pkid: PacketId,
    filters: Vec<TopicFilter>,
}

impl Subscribe {
    /// Creates a SUBSCRIBE for the filters.
    ///
    /// # Errors
    ///
    /// If the list is empty or a filter is invalid.
    pub fn new(pkid: PacketId, filters: Vec<TopicFilter>) -> Result<Self, SubscribeError> {
        if filters.is_empty() {
            return Err(SubscribeError::Empty);
        }

        for filter in &filters {
            topic::validate_topic_filter(filter.topic())?;
        }

        Ok(Self { pkid, filters })
    }

    /// Identifier echoed by the SUBACK.
    #[must_use]
    pub fn pkid(&self) -> PacketId {
        self.pkid
    }

    /// Returns the requested subscriptions.
    #[must_use]
    pub fn filters(&self) -> &[TopicFilter] {
        &self.filters
    }
}

impl EncodePacket for Subscribe {
    fn packet_type(&self) -> ControlPacketType {
        ControlPacketType::Subscribe
    }

    fn packet_flags(&self) -> TypeFlags {
        TypeFlags::RESERVED_ONE
    }

    fn remaining_len(&self) -> usize {
        self.filters
            .iter()
            .map(Encode::encode_len)
            .fold(self.pkid.encode_len(), usize::saturating_add)
    }

    fn write_packet<W>(&self, writer: &mut W) -> Result<usize, EncodeError<W::Err>>
    where
        W: Writer,
    {
        if self.filters.is_empty() {
            return Err(EncodeError::EmptyTopics);
        }

        write_list(self.pkid, &self.filters, writer, |filter, writer| {
            filter.write(writer)
        })
    }
}

impl DecodePacket for Subscribe {
    fn packet_type() -> ControlPacketType {
        ControlPacketType::Subscribe
    }

    fn parse_with_header(_header: FixedHeader, bytes: &[u8]) -> Result<Self, DecodeError> {
        let (pkid, mut bytes) = PacketId::parse(bytes)?;

        if bytes.is_empty() {
            return Err(DecodeError::EmptySubscribe);
        }

        let mut filters = Vec::new();

        while !bytes.is_empty() {
            let (filter, rest) = TopicFilter::parse(bytes)?;

            filters.push(filter);
            bytes = rest;
        }

        Ok(Subscribe { pkid, filters })
    }
}

impl Display for Subscribe {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{} pkid({}) ({})",
            ControlPacketType::Subscribe,
            self.pkid,
            DisplayList(&self.filters)
        )
    }
}

/// Error returned when creating an invalid [`Subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeError {
    /// No topic filter was given.
    Empty,
    /// A topic filter is invalid.
    Topic(topic::TopicError),
}

impl Display for SubscribeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SubscribeError::Empty => write!(f, "at least one topic filter is required"),
            SubscribeError::Topic(_) => write!(f, "invalid topic filter"),
        }
    }
}

impl std::error::Error for SubscribeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SubscribeError::Empty => None,
            SubscribeError::Topic(err) => Some(err),
        }
    }
}

impl From<topic::TopicError> for SubscribeError {
    fn from(value: topic::TopicError) -> Self {
        Self::Topic(value)
    }
}

/// Filter of a [`Subscribe`] with the highest QoS the client accepts for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicFilter {
    topic: String,
    qos: QoS,
}

impl TopicFilter {
    /// Creates a filter with the requested QoS.
    pub fn new(topic: impl Into<String>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            qos,
        }
    }

    /// Returns the topic filter.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Returns the requested QoS.
    #[must_use]
    pub fn qos(&self) -> QoS {
        self.qos
    }
}

impl Encode for TopicFilter {
    fn encode_len(&self) -> usize {
        // Requested QoS byte after the filter
        str_len(&self.topic).saturating_add(1)
    }

    fn write<W>(&self, writer: &mut W) -> Result<usize, EncodeError<W::Err>>
    where
        W: Writer,
    {
        let filter = write_str(&self.topic, writer)?;
        let qos = writer
            .write_u8(self.qos.into())
            .map_err(EncodeError::Write)?;

        Ok(filter.saturating_add(qos))
    }
}

impl<'a> Decode<'a> for TopicFilter {
    fn parse(bytes: &'a [u8]) -> Result<(Self, &'a [u8]), DecodeError> {
        let (topic, bytes) = Str::parse(bytes)?;
        topic::validate_topic_filter(&topic)?;

        let (qos, bytes) = read_u8(bytes)?;

        let qos = QoS::try_from(qos)?;

        Ok((TopicFilter::new(topic.as_str(), qos), bytes))
    }
}

impl Display for TopicFilter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "topic({}) {}", self.topic, self.qos)
    }
}

/// Server verdict on a [`Subscribe`], one [`ReturnCode`] per filter in request order.
///
/// <https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718068>
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    pkid: PacketId,
    return_codes: Vec<ReturnCode>,
}

impl SubAck {
    /// Creates a SUBACK with a return code for each filter.
    #[must_use]
    pub fn new(pkid: PacketId, return_codes: Vec<ReturnCode>) -> Self {
        Self { pkid, return_codes }
    }

    /// Identifier of the answered SUBSCRIBE.
    #[must_use]
    pub fn pkid(&self) -> PacketId {
        self.pkid
    }

    /// Returns the return codes, in the order of the subscribed filters.
    #[must_use]
    pub fn return_codes(&self) -> &[ReturnCode] {
        &self.return_codes
    }
}

impl EncodePacket for SubAck {
    fn packet_type(&self) -> ControlPacketType {
        ControlPacketType::SubAck
    }

    fn packet_flags(&self) -> TypeFlags {
        TypeFlags::empty()
    }

    fn remaining_len(&self) -> usize {
        self.pkid
            .encode_len()
            .saturating_add(self.return_codes.len())
    }

    fn write_packet<W>(&self, writer: &mut W) -> Result<usize, EncodeError<W::Err>>
    where
        W: Writer,
    {
        write_list(self.pkid, &self.return_codes, writer, |code, writer| {
            code.write(writer)
        })
    }
}

impl DecodePacket for SubAck {
    fn packet_type() -> ControlPacketType {
        ControlPacketType::SubAck
    }

    fn parse_with_header(_header: FixedHeader, bytes: &[u8]) -> Result<Self, DecodeError> {
        let (pkid, mut bytes) = PacketId::parse(bytes)?;

        if bytes.is_empty() {
            return Err(DecodeError::EmptySubscribe);
        }

        let mut return_codes = Vec::with_capacity(bytes.len());

        while !bytes.is_empty() {
            let (code, rest) = ReturnCode::parse(bytes)?;

            return_codes.push(code);
            bytes = rest;
        }

        Ok(SubAck { pkid, return_codes })
    }
}

impl Display for SubAck {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{} pkid({}) ({})",
            ControlPacketType::SubAck,
            self.pkid,
            DisplayList(&self.return_codes)
        )
    }
}

/// Per filter outcome in a [`SubAck`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReturnCode {
    /// Granted at QoS 0.
    Qos0 = 0x00,
    /// Granted at QoS 1.
    Qos1 = 0x01,
    /// Granted at QoS 2.
    Qos2 = 0x02,
    /// Refused.
    Failure = 0x80,
}

impl ReturnCode {
    /// Returns the granted QoS, or [`None`] on failure.
    #[must_use]
    pub fn granted(&self) -> Option<QoS> {
        match self {
            ReturnCode::Qos0 => Some(QoS::AtMostOnce),
            ReturnCode::Qos1 => Some(QoS::AtLeastOnce),
            ReturnCode::Qos2 => Some(QoS::ExactlyOnce),
            ReturnCode::Failure => None,
        }
    }

    /// Whether the server refused the filter.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure)
    }
}

impl From<QoS> for ReturnCode {
    fn from(value: QoS) -> Self {
        match value {
            QoS::AtMostOnce => ReturnCode::Qos0,
            QoS::AtLeastOnce => ReturnCode::Qos1,
            QoS::ExactlyOnce => ReturnCode::Qos2,
        }
    }
}

impl Display for ReturnCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            ReturnCode::Qos0 => "success(QoS 0)",
            ReturnCode::Qos1 => "success(QoS 1)",
            ReturnCode::Qos2 => "success(QoS 2)",
            ReturnCode::Failure => "failure",
        };

        write!(f, "{s}")
    }
}

impl TryFrom<u8> for ReturnCode {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        if value == Self::Failure as u8 {
            return Ok(Self::Failure);
        }

        // Any other value is a granted QoS
        QoS::try_from(value)
            .map(Self::from)
            .map_err(|_| DecodeError::Reserved)
    }
}

impl<'a> Decode<'a> for ReturnCode {
    fn parse(bytes: &'a [u8]) -> Result<(Self, &'a [u8]), DecodeError> {
        let (code, bytes) = read_u8(bytes)?;

        Ok((ReturnCode::try_from(code)?, bytes))
    }
}

impl Encode for ReturnCode {
    fn encode_len(&self) -> usize {
        1
    }

    fn write<W>(&self, writer: &mut W) -> Result<usize, EncodeError<W::Err>>
    where
        W: Writer,
    {
        writer.write_u8(*self as u8).map_err(EncodeError::Write)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::v3::tests::TestWriter;

    use super::*;

    fn pkid(value: u16) -> PacketId {
        PacketId::try_from(value).unwrap()
    }

    #[test]
    fn should_encode_and_decode_subscribe() {
        let subscribe = Subscribe::new(
            pkid(10),
            vec![
                TopicFilter::new("a/b", QoS::AtLeastOnce),
                TopicFilter::new("c/+", QoS::AtMostOnce),
            ],
        )
        .unwrap();

        let mut writer = TestWriter::new();

        subscribe.encode(&mut writer).unwrap();

        let expected = [
            0b1000_0010, // subscribe, reserved flags
            14,          // remaining length
            0, 10, // pkid
            0, 3, b'a', b'/', b'b', 1, // first filter
            0, 3, b'c', b'/', b'+', 0, // second filter
        ];

        assert_eq!(writer.buf, expected);

        let (decoded, rest) = Subscribe::parse(&writer.buf).unwrap();

        assert!(rest.is_empty());
        assert_eq!(decoded, subscribe);
    }

    #[test]
    fn should_reject_empty_subscribe() {
        let err = Subscribe::new(pkid(1), Vec::new()).unwrap_err();

        assert_eq!(err, SubscribeError::Empty);

        let err = Subscribe::parse(&[0b1000_0010, 2, 0, 1]).unwrap_err();

        assert!(matches!(err, DecodeError::EmptySubscribe), "{err:?}");
    }

    #[test]
    fn should_reject_invalid_filter() {
        let err = Subscribe::new(pkid(1), vec![TopicFilter::new("a/#/b", QoS::AtMostOnce)])
            .unwrap_err();

        assert_eq!(err, SubscribeError::Topic(topic::TopicError::MultiLevel));
    }

    #[test]
    fn should_reject_reserved_qos_bits() {
        let bytes = [0b1000_0010, 6, 0, 1, 0, 1, b'a', 0b0000_0100];

        let err = Subscribe::parse(&bytes).unwrap_err();

        assert!(matches!(err, DecodeError::QoS(4)), "{err:?}");
    }

    #[test]
    fn should_encode_and_decode_suback() {
        let suback = SubAck::new(
            pkid(0x0102),
            vec![
                ReturnCode::Qos0,
                ReturnCode::Qos1,
                ReturnCode::Qos2,
                ReturnCode::Failure,
            ],
        );

        let mut writer = TestWriter::new();

        suback.encode(&mut writer).unwrap();

        assert_eq!(writer.buf, [0b1001_0000, 6, 0x01, 0x02, 0, 1, 2, 0x80]);

        let (decoded, rest) = SubAck::parse(&writer.buf).unwrap();

        assert!(rest.is_empty());
        assert_eq!(decoded, suback);
        assert_eq!(decoded.return_codes()[3].granted(), None);
        assert_eq!(decoded.return_codes()[1].granted(), Some(QoS::AtLeastOnce));
    }

    #[test]
    fn should_reject_invalid_return_code() {
        let err = SubAck::parse(&[0b1001_0000, 3, 0, 1, 3]).unwrap_err();

        assert!(matches!(err, DecodeError::Reserved), "{err:?}");
    }
}
