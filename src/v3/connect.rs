//! Session handshake: CONNECT from the client and the CONNACK reply.

use core::{
    fmt::{Debug, Display},
    mem,
    num::TryFromIntError,
    ops::Deref,
    time::Duration,
};

use bitflags::bitflags;

use crate::bytes::{read_chunk, read_u16, read_u8};

use super::{
    expect_empty,
    header::{
        str_len, write_str, BytesBuf, ControlPacketType, FixedHeader, RemainingLength, Str,
        TypeFlags,
    },
    topic, Decode, DecodeError, DecodePacket, Encode, EncodeError, EncodePacket, QoS, Writer,
};

/// Opens the session, must be the first packet on a new connection.
///
/// <https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718028>
#[derive(Clone, PartialEq, Eq)]
pub struct Connect {
    flags: ConnectFlags,
    keep_alive: KeepAlive,
    client_id: String,
    will: Option<Will>,
    username: Option<String>,
    password: Option<Vec<u8>>,
}

impl Connect {
    /// Length prefixed "MQTT" string at the start of the variable header.
    pub const PROTOCOL_NAME: [u8; 6] = [0x0, 0x4, b'M', b'Q', b'T', b'T'];

    /// Protocol level byte of MQTT v3.1.1.
    pub const PROTOCOL_LEVEL_V3_1_1: u8 = 0x4;

    /// Protocol name, level, flags and keep alive.
    const VARIABLE_HEADER_LEN: usize = Self::PROTOCOL_NAME.len()
        + mem::size_of::<u8>()
        + mem::size_of::<u8>()
        + mem::size_of::<u16>();

    /// Packet for the client identifier.
    ///
    /// An empty identifier forces a [clean session](ConnectFlags::CLEAN_SESSION), servers refuse
    /// to keep state for anonymous clients.
    pub fn new(client_id: impl Into<String>, keep_alive: KeepAlive) -> Self {
        let client_id = client_id.into();

        let flags = if client_id.is_empty() {
            ConnectFlags::CLEAN_SESSION
        } else {
            ConnectFlags::empty()
        };

        Self {
            flags,
            keep_alive,
            client_id,
            will: None,
            username: None,
            password: None,
        }
    }

    /// Asks the server to drop any stored state for this client.
    pub fn clean_session(&mut self) -> &mut Self {
        self.flags.insert(ConnectFlags::CLEAN_SESSION);

        self
    }

    /// Message the server publishes if the connection drops without a DISCONNECT.
    pub fn will(&mut self, message: Will, qos: QoS, retain: bool) -> &mut Self {
        self.will = Some(message);

        let qos_flag = match qos {
            QoS::AtMostOnce => ConnectFlags::empty(),
            QoS::AtLeastOnce => ConnectFlags::WILL_QOS_1,
            QoS::ExactlyOnce => ConnectFlags::WILL_QOS_2,
        };

        self.flags.remove(ConnectFlags::WILL_QOS_MASK);
        self.flags.insert(ConnectFlags::WILL_FLAG | qos_flag);
        self.flags.set(ConnectFlags::WILL_RETAIN, retain);

        self
    }

    /// Authenticates with a user name only.
    pub fn username(&mut self, username: impl Into<String>) -> &mut Self {
        self.flags.insert(ConnectFlags::USERNAME);

        self.username = Some(username.into());

        self
    }

    /// Authenticates with user name and password.
    pub fn username_password(
        &mut self,
        username: impl Into<String>,
        password: impl Into<Vec<u8>>,
    ) -> &mut Self {
        self.flags.insert(ConnectFlags::USERNAME | ConnectFlags::PASSWORD);

        self.username = Some(username.into());
        self.password = Some(password.into());

        self
    }

    /// Returns the client identifier.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Returns the keep alive interval.
    #[must_use]
    pub fn keep_alive(&self) -> KeepAlive {
        self.keep_alive
    }

    /// Returns the connect flags.
    #[must_use]
    pub fn flags(&self) -> ConnectFlags {
        self.flags
    }

    /// Returns `true` if the clean session flag is set.
    #[must_use]
    pub fn is_clean_session(&self) -> bool {
        self.flags.contains(ConnectFlags::CLEAN_SESSION)
    }

    /// Returns the will message, if set.
    #[must_use]
    pub fn will_message(&self) -> Option<&Will> {
        self.will.as_ref()
    }

    /// Returns the QoS of the will message.
    #[must_use]
    pub fn will_qos(&self) -> QoS {
        if self.flags.contains(ConnectFlags::WILL_QOS_2) {
            QoS::ExactlyOnce
        } else if self.flags.contains(ConnectFlags::WILL_QOS_1) {
            QoS::AtLeastOnce
        } else {
            QoS::AtMostOnce
        }
    }

    /// Returns the username, if set.
    #[must_use]
    pub fn username_value(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Returns the password, if set.
    #[must_use]
    pub fn password_value(&self) -> Option<&[u8]> {
        self.password.as_deref()
    }

    fn read_flags(flags: u8) -> Result<ConnectFlags, DecodeError> {
        let flags = ConnectFlags::from_bits_retain(flags);

        if flags.contains(ConnectFlags::RESERVED) {
            return Err(DecodeError::Reserved);
        }

        if flags.contains(ConnectFlags::WILL_QOS_MASK) {
            return Err(DecodeError::QoS(3));
        }

        let will_flags = ConnectFlags::WILL_RETAIN | ConnectFlags::WILL_QOS_MASK;
        if !flags.contains(ConnectFlags::WILL_FLAG) && flags.intersects(will_flags) {
            return Err(DecodeError::Reserved);
        }

        if flags.contains(ConnectFlags::PASSWORD) && !flags.contains(ConnectFlags::USERNAME) {
            return Err(DecodeError::Reserved);
        }

        Ok(flags)
    }
}

impl Debug for Connect {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Connect")
            .field("flags", &self.flags)
            .field("keep_alive", &self.keep_alive)
            .field("client_id", &self.client_id)
            .field("will", &self.will)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "..."))
            .finish()
    }
}

impl Display for Connect {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{} client_id({}) keep_alive({}) clean_session({})",
            ControlPacketType::Connect,
            self.client_id,
            *self.keep_alive,
            self.is_clean_session()
        )
    }
}

impl EncodePacket for Connect {
    fn packet_type(&self) -> ControlPacketType {
        ControlPacketType::Connect
    }

    fn packet_flags(&self) -> TypeFlags {
        TypeFlags::empty()
    }

    fn remaining_len(&self) -> usize {
        let mut payload = str_len(&self.client_id);

        if let Some(will) = &self.will {
            payload = payload.saturating_add(will.encode_len());
        }

        if let Some(username) = &self.username {
            payload = payload.saturating_add(str_len(username));
        }

        if let Some(password) = &self.password {
            payload = payload
                .saturating_add(mem::size_of::<u16>())
                .saturating_add(password.len());
        }

        Self::VARIABLE_HEADER_LEN.saturating_add(payload)
    }

    fn write_packet<W>(&self, writer: &mut W) -> Result<usize, EncodeError<W::Err>>
    where
        W: Writer,
    {
        writer
            .write_all(&Self::PROTOCOL_NAME)
            .and_then(|()| writer.write_u8(Self::PROTOCOL_LEVEL_V3_1_1))
            .and_then(|_| writer.write_u8(self.flags.bits()))
            .and_then(|_| writer.write_u16(*self.keep_alive))
            .map_err(EncodeError::Write)?;

        let mut count =
            Self::VARIABLE_HEADER_LEN.saturating_add(write_str(&self.client_id, writer)?);

        if let Some(will) = &self.will {
            count = count.saturating_add(will.write(writer)?);
        }

        if let Some(username) = &self.username {
            count = count.saturating_add(write_str(username, writer)?);
        }

        if let Some(password) = &self.password {
            count = count.saturating_add(BytesBuf::from(password.as_slice()).write(writer)?);
        }

        Ok(count)
    }
}

impl DecodePacket for Connect {
    fn packet_type() -> ControlPacketType {
        ControlPacketType::Connect
    }

    fn parse_with_header(_header: FixedHeader, bytes: &[u8]) -> Result<Self, DecodeError> {
        let (name, bytes) = read_chunk::<6>(bytes)?;
        if *name != Self::PROTOCOL_NAME {
            return Err(DecodeError::ProtocolName);
        }

        let (level, bytes) = read_u8(bytes)?;
        if level != Self::PROTOCOL_LEVEL_V3_1_1 {
            return Err(DecodeError::ProtocolLevel(level));
        }

        let (flags, bytes) = read_u8(bytes)?;
        let flags = Self::read_flags(flags)?;

        let (keep_alive, bytes) = read_u16(bytes)?;

        let (client_id, mut bytes) = Str::parse(bytes)?;

        let mut will = None;
        if flags.contains(ConnectFlags::WILL_FLAG) {
            let (value, rest) = Will::parse(bytes)?;

            will = Some(value);
            bytes = rest;
        }

        let mut username = None;
        if flags.contains(ConnectFlags::USERNAME) {
            let (value, rest) = Str::parse(bytes)?;

            username = Some(value.as_str().to_owned());
            bytes = rest;
        }

        let mut password = None;
        if flags.contains(ConnectFlags::PASSWORD) {
            let (value, rest) = BytesBuf::parse(bytes)?;

            password = Some(value.to_vec());
            bytes = rest;
        }

        expect_empty(bytes)?;

        Ok(Self {
            flags,
            keep_alive: KeepAlive(keep_alive),
            client_id: client_id.as_str().to_owned(),
            will,
            username,
            password,
        })
    }
}

bitflags! {
    /// Byte after the protocol level, telling which payload fields follow.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ConnectFlags: u8 {
        /// Payload has a user name.
        const USERNAME = 0b1000_0000;
        /// Payload has a password, requires [`USERNAME`](ConnectFlags::USERNAME).
        const PASSWORD = 0b0100_0000;

        /// Will is published as retained.
        const WILL_RETAIN = 0b0010_0000;

        /// Will at QoS 1.
        const WILL_QOS_1 = 0b0000_1000;
        /// Will at QoS 2.
        const WILL_QOS_2 = 0b0001_0000;
        /// Both will QoS bits.
        const WILL_QOS_MASK = 0b0001_1000;

        /// Payload has the will topic and message.
        const WILL_FLAG = 0b0000_0100;

        /// Discard the session on connect and disconnect.
        const CLEAN_SESSION = 0b0000_0010;

        /// Reserved, must be zero.
        const RESERVED = 0b0000_0001;
    }
}

/// Seconds the client may stay silent before the server considers it gone.
///
/// Zero turns the mechanism off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAlive(u16);

impl KeepAlive {
    /// Whether the interval is non zero.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.0 != 0
    }

    /// Returns the interval as a [`Duration`].
    #[must_use]
    pub fn as_duration(&self) -> Duration {
        Duration::from_secs(self.0.into())
    }
}

impl From<u16> for KeepAlive {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl TryFrom<Duration> for KeepAlive {
    type Error = TryFromIntError;

    fn try_from(value: Duration) -> Result<Self, Self::Error> {
        let keep_alive = u16::try_from(value.as_secs())?;

        Ok(Self(keep_alive))
    }
}

impl Deref for KeepAlive {
    type Target = u16;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Topic and payload of the last will.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    topic: String,
    message: Vec<u8>,
}

impl Will {
    /// Will published on `topic`.
    pub fn new(topic: impl Into<String>, message: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            message: message.into(),
        }
    }

    /// Returns the topic of the will.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Returns the will message.
    #[must_use]
    pub fn message(&self) -> &[u8] {
        &self.message
    }
}

impl Encode for Will {
    fn encode_len(&self) -> usize {
        str_len(&self.topic)
            .saturating_add(mem::size_of::<u16>())
            .saturating_add(self.message.len())
    }

    fn write<W>(&self, writer: &mut W) -> Result<usize, EncodeError<W::Err>>
    where
        W: Writer,
    {
        let topic = write_str(&self.topic, writer)?;
        let msg = BytesBuf::from(self.message.as_slice()).write(writer)?;

        Ok(topic.saturating_add(msg))
    }
}

impl<'a> Decode<'a> for Will {
    fn parse(bytes: &'a [u8]) -> Result<(Self, &'a [u8]), DecodeError> {
        let (topic, bytes) = Str::parse(bytes)?;
        topic::validate_topic_name(&topic)?;

        let (message, bytes) = BytesBuf::parse(bytes)?;

        Ok((Will::new(topic.as_str(), message.to_vec()), bytes))
    }
}

/// Server answer to [`Connect`], always its first packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAck {
    session_present: bool,
    return_code: ConnectReturnCode,
}

impl ConnAck {
    /// Flags byte and return code.
    pub const REMAINING_LENGTH: RemainingLength = RemainingLength::new_const(2);

    /// Creates a new CONNACK.
    #[must_use]
    pub fn new(session_present: bool, return_code: ConnectReturnCode) -> Self {
        Self {
            session_present,
            return_code,
        }
    }

    /// Whether the server resumed a stored session.
    #[must_use]
    pub fn session_present(&self) -> bool {
        self.session_present
    }

    /// Outcome of the connection attempt.
    #[must_use]
    pub fn return_code(&self) -> ConnectReturnCode {
        self.return_code
    }
}

impl Display for ConnAck {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{} session_present({}) {}",
            ControlPacketType::ConnAck,
            self.session_present,
            self.return_code
        )
    }
}

impl EncodePacket for ConnAck {
    fn packet_type(&self) -> ControlPacketType {
        ControlPacketType::ConnAck
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
        let mut flags = ConnAckFlags::empty();
        flags.set(ConnAckFlags::SESSION_PRESENT, self.session_present);

        let flags = writer.write_u8(flags.bits()).map_err(EncodeError::Write)?;
        let code = writer
            .write_u8(self.return_code.into())
            .map_err(EncodeError::Write)?;

        Ok(flags.saturating_add(code))
    }
}

impl DecodePacket for ConnAck {
    fn packet_type() -> ControlPacketType {
        ControlPacketType::ConnAck
    }

    fn fixed_remaining_length() -> Option<RemainingLength> {
        Some(Self::REMAINING_LENGTH)
    }

    fn parse_with_header(_header: FixedHeader, bytes: &[u8]) -> Result<Self, DecodeError> {
        let (flags, bytes) = read_u8(bytes)?;
        let flags = ConnAckFlags::from_bits_retain(flags);

        if !(flags & ConnAckFlags::MASK).is_empty() {
            return Err(DecodeError::Reserved);
        }

        let session_present = flags.contains(ConnAckFlags::SESSION_PRESENT);

        let (return_code, bytes) = read_u8(bytes)?;
        expect_empty(bytes)?;

        let return_code = ConnectReturnCode::try_from(return_code)?;

        Ok(Self {
            return_code,
            session_present,
        })
    }
}

/// Outcome carried by [`ConnAck`]; anything but [`Accepted`](Self::Accepted) closes the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectReturnCode {
    /// Session opened.
    Accepted = 0,
    /// Protocol level not supported.
    ProtocolVersion = 1,
    /// Client identifier refused.
    IdentifierRejected = 2,
    /// MQTT service down.
    ServerUnavailable = 3,
    /// Malformed credentials.
    BadUsernamePassword = 4,
    /// Credentials not allowed.
    NotAuthorized = 5,
}

impl ConnectReturnCode {
    /// Whether the session was opened.
    #[must_use]
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }

    /// Human readable reason of the return code.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            ConnectReturnCode::Accepted => "Connection Accepted",
            ConnectReturnCode::ProtocolVersion => "Unacceptable Protocol Version",
            ConnectReturnCode::IdentifierRejected => "Client Identifier Rejected",
            ConnectReturnCode::ServerUnavailable => "Server Unavailable",
            ConnectReturnCode::BadUsernamePassword => "Bad User Name or Password",
            ConnectReturnCode::NotAuthorized => "Not Authorized",
        }
    }
}

impl Display for ConnectReturnCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{} ({})", self.reason(), *self as u8)
    }
}

impl From<ConnectReturnCode> for u8 {
    fn from(value: ConnectReturnCode) -> Self {
        value as u8
    }
}

impl TryFrom<u8> for ConnectReturnCode {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        let code = match value {
            0 => ConnectReturnCode::Accepted,
            1 => ConnectReturnCode::ProtocolVersion,
            2 => ConnectReturnCode::IdentifierRejected,
            3 => ConnectReturnCode::ServerUnavailable,
            4 => ConnectReturnCode::BadUsernamePassword,
            5 => ConnectReturnCode::NotAuthorized,
            6.. => return Err(DecodeError::Reserved),
        };

        Ok(code)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy)]
    struct ConnAckFlags: u8 {
        const MASK = 0b1111_1110;
        const SESSION_PRESENT = 0b0000_0001;
    }
}
