//! Any of the MQTT control packets.

use core::fmt::Display;

use crate::bytes::read_exact;

use super::{
    connect::{ConnAck, Connect},
    disconnect::Disconnect,
    header::{ControlPacketType, FixedHeader, TypeFlags},
    ping::{PingReq, PingResp},
    publish::{PubAck, Publish},
    subscribe::{SubAck, Subscribe},
    unsubscribe::{UnsubAck, Unsubscribe},
    Decode, DecodeError, DecodePacket, EncodeError, EncodePacket, Writer,
};

/// Control packets supported by the client.
///
/// The QoS 2 flow (PUBREC, PUBREL and PUBCOMP) is not supported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlPacket {
    /// CONNECT
    Connect(Connect),
    /// CONNACK
    ConnAck(ConnAck),
    /// PUBLISH
    Publish(Publish),
    /// PUBACK
    PubAck(PubAck),
    /// SUBSCRIBE
    Subscribe(Subscribe),
    /// SUBACK
    SubAck(SubAck),
    /// UNSUBSCRIBE
    Unsubscribe(Unsubscribe),
    /// UNSUBACK
    UnsubAck(UnsubAck),
    /// PINGREQ
    PingReq(PingReq),
    /// PINGRESP
    PingResp(PingResp),
    /// DISCONNECT
    Disconnect(Disconnect),
}

impl ControlPacket {
    fn parse_packet<P>(header: FixedHeader, bytes: &[u8]) -> Result<Self, DecodeError>
    where
        P: DecodePacket + Into<Self>,
    {
        P::check_header(&header)?;

        P::parse_with_header(header, bytes).map(Into::into)
    }

    /// Decodes the body announced by `header`.
    ///
    /// `bytes` holds exactly the remaining length.
    ///
    /// # Errors
    ///
    /// If the body is malformed, or the type is one of the unsupported QoS 2 packets.
    pub fn parse_with_header(header: FixedHeader, bytes: &[u8]) -> Result<Self, DecodeError> {
        match header.packet_type() {
            ControlPacketType::Connect => Self::parse_packet::<Connect>(header, bytes),
            ControlPacketType::ConnAck => Self::parse_packet::<ConnAck>(header, bytes),
            ControlPacketType::Publish => Self::parse_packet::<Publish>(header, bytes),
            ControlPacketType::PubAck => Self::parse_packet::<PubAck>(header, bytes),
            ControlPacketType::Subscribe => Self::parse_packet::<Subscribe>(header, bytes),
            ControlPacketType::SubAck => Self::parse_packet::<SubAck>(header, bytes),
            ControlPacketType::Unsubscribe => Self::parse_packet::<Unsubscribe>(header, bytes),
            ControlPacketType::UnsubAck => Self::parse_packet::<UnsubAck>(header, bytes),
            ControlPacketType::PingReq => Self::parse_packet::<PingReq>(header, bytes),
            ControlPacketType::PingResp => Self::parse_packet::<PingResp>(header, bytes),
            ControlPacketType::Disconnect => Self::parse_packet::<Disconnect>(header, bytes),
            packet_type @ (ControlPacketType::PubRec
            | ControlPacketType::PubRel
            | ControlPacketType::PubComp) => Err(DecodeError::Unsupported(packet_type)),
        }
    }

    /// Unwraps a [`ConnAck`].
    ///
    /// # Errors
    ///
    /// Gives the packet back when it's anything else.
    pub fn try_into_conn_ack(self) -> Result<ConnAck, Self> {
        if let Self::ConnAck(v) = self {
            Ok(v)
        } else {
            Err(self)
        }
    }
}

impl Display for ControlPacket {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ControlPacket::Connect(value) => Display::fmt(value, f),
            ControlPacket::ConnAck(value) => Display::fmt(value, f),
            ControlPacket::Publish(value) => Display::fmt(value, f),
            ControlPacket::PubAck(value) => Display::fmt(value, f),
            ControlPacket::Subscribe(value) => Display::fmt(value, f),
            ControlPacket::SubAck(value) => Display::fmt(value, f),
            ControlPacket::Unsubscribe(value) => Display::fmt(value, f),
            ControlPacket::UnsubAck(value) => Display::fmt(value, f),
            ControlPacket::PingReq(value) => Display::fmt(value, f),
            ControlPacket::PingResp(value) => Display::fmt(value, f),
            ControlPacket::Disconnect(value) => Display::fmt(value, f),
        }
    }
}

impl EncodePacket for ControlPacket {
    fn packet_type(&self) -> ControlPacketType {
        match self {
            ControlPacket::Connect(value) => value.packet_type(),
            ControlPacket::ConnAck(value) => value.packet_type(),
            ControlPacket::Publish(value) => value.packet_type(),
            ControlPacket::PubAck(value) => value.packet_type(),
            ControlPacket::Subscribe(value) => value.packet_type(),
            ControlPacket::SubAck(value) => value.packet_type(),
            ControlPacket::Unsubscribe(value) => value.packet_type(),
            ControlPacket::UnsubAck(value) => value.packet_type(),
            ControlPacket::PingReq(value) => value.packet_type(),
            ControlPacket::PingResp(value) => value.packet_type(),
            ControlPacket::Disconnect(value) => value.packet_type(),
        }
    }

    fn packet_flags(&self) -> TypeFlags {
        match self {
            ControlPacket::Connect(value) => value.packet_flags(),
            ControlPacket::ConnAck(value) => value.packet_flags(),
            ControlPacket::Publish(value) => value.packet_flags(),
            ControlPacket::PubAck(value) => value.packet_flags(),
            ControlPacket::Subscribe(value) => value.packet_flags(),
            ControlPacket::SubAck(value) => value.packet_flags(),
            ControlPacket::Unsubscribe(value) => value.packet_flags(),
            ControlPacket::UnsubAck(value) => value.packet_flags(),
            ControlPacket::PingReq(value) => value.packet_flags(),
            ControlPacket::PingResp(value) => value.packet_flags(),
            ControlPacket::Disconnect(value) => value.packet_flags(),
        }
    }

    fn remaining_len(&self) -> usize {
        match self {
            ControlPacket::Connect(value) => value.remaining_len(),
            ControlPacket::ConnAck(value) => value.remaining_len(),
            ControlPacket::Publish(value) => value.remaining_len(),
            ControlPacket::PubAck(value) => value.remaining_len(),
            ControlPacket::Subscribe(value) => value.remaining_len(),
            ControlPacket::SubAck(value) => value.remaining_len(),
            ControlPacket::Unsubscribe(value) => value.remaining_len(),
            ControlPacket::UnsubAck(value) => value.remaining_len(),
            ControlPacket::PingReq(value) => value.remaining_len(),
            ControlPacket::PingResp(value) => value.remaining_len(),
            ControlPacket::Disconnect(value) => value.remaining_len(),
        }
    }

    fn write_packet<W>(&self, writer: &mut W) -> Result<usize, EncodeError<W::Err>>
    where
        W: Writer,
    {
        match self {
            ControlPacket::Connect(value) => value.write_packet(writer),
            ControlPacket::ConnAck(value) => value.write_packet(writer),
            ControlPacket::Publish(value) => value.write_packet(writer),
            ControlPacket::PubAck(value) => value.write_packet(writer),
            ControlPacket::Subscribe(value) => value.write_packet(writer),
            ControlPacket::SubAck(value) => value.write_packet(writer),
            ControlPacket::Unsubscribe(value) => value.write_packet(writer),
            ControlPacket::UnsubAck(value) => value.write_packet(writer),
            ControlPacket::PingReq(value) => value.write_packet(writer),
            ControlPacket::PingResp(value) => value.write_packet(writer),
            ControlPacket::Disconnect(value) => value.write_packet(writer),
        }
    }
}

impl<'a> Decode<'a> for ControlPacket {
    fn parse(bytes: &'a [u8]) -> Result<(Self, &'a [u8]), DecodeError> {
        let (header, bytes) = FixedHeader::parse(bytes)?;

        let remaining_length = usize::try_from(header.remaining_length())?;

        let (bytes, rest) = read_exact(bytes, remaining_length)?;

        let packet = Self::parse_with_header(header, bytes)?;

        Ok((packet, rest))
    }
}

macro_rules! impl_from_packet {
    ($($name:ident),* $(,)?) => {
        $(
            impl From<$name> for ControlPacket {
                fn from(value: $name) -> Self {
                    ControlPacket::$name(value)
                }
            }
        )*
    };
}

impl_from_packet!(
    Connect,
    ConnAck,
    Publish,
    PubAck,
    Subscribe,
    SubAck,
    Unsubscribe,
    UnsubAck,
    PingReq,
    PingResp,
    Disconnect,
);
