//! Errors returned by the blocking client.

use core::{convert::Infallible, fmt::Display, num::NonZeroUsize};
use std::{collections::TryReserveError, io};

use crate::v3::{
    connect::ConnectReturnCode, header::ControlPacketType, subscribe::SubscribeError,
    topic::TopicError, DecodeError, EncodeError,
};

/// Failure while receiving a packet from the server.
#[derive(Debug)]
#[non_exhaustive]
pub enum ReadError {
    /// End of stream.
    Disconnected,
    /// Malformed packet.
    Decode(DecodeError),
    /// Socket error, including read timeouts.
    Read(io::Error),
    /// Packet larger than the [`ReadBuffer`](super::reader::ReadBuffer) may grow.
    OutOfMemory {
        /// Buffer limit.
        max: NonZeroUsize,
        /// Bytes the packet needs.
        required: usize,
    },
    /// Growing the buffer failed.
    Reserve(TryReserveError),
}

impl ReadError {
    /// Returns `true` if the read timed out.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ReadError::Read(err)
                if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
        )
    }
}

impl Display for ReadError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ReadError::Disconnected => write!(f, "server closed the connection"),
            ReadError::Decode(_) => write!(f, "malformed packet"),
            ReadError::Read(_) => write!(f, "read from the socket failed"),
            ReadError::OutOfMemory { max, required } => {
                write!(f, "packet of {required} bytes exceeds the {max} bytes buffer limit")
            }
            ReadError::Reserve(_) => write!(f, "couldn't grow the read buffer"),
        }
    }
}

impl std::error::Error for ReadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReadError::Disconnected | ReadError::OutOfMemory { .. } => None,
            ReadError::Decode(err) => Some(err),
            ReadError::Read(err) => Some(err),
            ReadError::Reserve(err) => Some(err),
        }
    }
}

impl From<TryReserveError> for ReadError {
    fn from(value: TryReserveError) -> Self {
        ReadError::Reserve(value)
    }
}

impl From<io::Error> for ReadError {
    fn from(value: io::Error) -> Self {
        ReadError::Read(value)
    }
}

impl From<DecodeError> for ReadError {
    fn from(value: DecodeError) -> Self {
        ReadError::Decode(value)
    }
}

/// Error returned by the [`Client`](super::Client) operations.
#[derive(Debug)]
#[non_exhaustive]
pub enum ClientError {
    /// Couldn't dial the server or write to the connection.
    Transport(io::Error),
    /// Couldn't read an incoming packet.
    Read(ReadError),
    /// Couldn't encode an outgoing packet.
    Encode(EncodeError<io::Error>),
    /// The server sent a malformed packet.
    Protocol(DecodeError),
    /// The server sent a packet that wasn't expected.
    UnexpectedPacket(ControlPacketType),
    /// The server refused the connection.
    Handshake(ConnectReturnCode),
    /// The acknowledgment wasn't received in time.
    Timeout,
    /// The connection was lost while waiting for the acknowledgment.
    ConnectionLost,
    /// The client is not connected.
    NotConnected,
    /// The client is already connected.
    AlreadyConnected,
    /// No server was configured.
    NoServers,
    /// All the packet identifiers are in use.
    TooManyInflight,
    /// Only QoS 0 and 1 are supported.
    UnsupportedQos,
    /// Invalid topic name or filter.
    Topic(TopicError),
    /// The server refused some of the subscriptions.
    SubscribeRejected {
        /// The refused topic filters.
        filters: Vec<String>,
    },
    /// Couldn't parse the server address.
    InvalidAddress(String),
}

impl Display for ClientError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ClientError::Transport(_) => write!(f, "transport error"),
            ClientError::Read(_) => write!(f, "couldn't read from the connection"),
            ClientError::Encode(_) => write!(f, "couldn't write the packet"),
            ClientError::Protocol(_) => write!(f, "protocol error"),
            ClientError::UnexpectedPacket(packet_type) => {
                write!(f, "unexpected packet {packet_type}")
            }
            ClientError::Handshake(code) => write!(f, "connection refused: {}", code.reason()),
            ClientError::Timeout => write!(f, "request timed out"),
            ClientError::ConnectionLost => write!(f, "the connection was lost"),
            ClientError::NotConnected => write!(f, "the client is not connected"),
            ClientError::AlreadyConnected => write!(f, "the client is already connected"),
            ClientError::NoServers => write!(f, "no server to connect to"),
            ClientError::TooManyInflight => write!(f, "too many requests waiting for an ack"),
            ClientError::UnsupportedQos => write!(f, "QoS 2 is not supported"),
            ClientError::Topic(_) => write!(f, "invalid topic"),
            ClientError::SubscribeRejected { filters } => {
                write!(f, "subscription refused for {}", filters.join(", "))
            }
            ClientError::InvalidAddress(addr) => write!(f, "invalid server address {addr}"),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClientError::Transport(err) => Some(err),
            ClientError::Read(err) => Some(err),
            ClientError::Encode(err) => Some(err),
            ClientError::Protocol(err) => Some(err),
            ClientError::Topic(err) => Some(err),
            ClientError::UnexpectedPacket(_)
            | ClientError::Handshake(_)
            | ClientError::Timeout
            | ClientError::ConnectionLost
            | ClientError::NotConnected
            | ClientError::AlreadyConnected
            | ClientError::NoServers
            | ClientError::TooManyInflight
            | ClientError::UnsupportedQos
            | ClientError::SubscribeRejected { .. }
            | ClientError::InvalidAddress(_) => None,
        }
    }
}

impl From<io::Error> for ClientError {
    fn from(value: io::Error) -> Self {
        ClientError::Transport(value)
    }
}

impl From<ReadError> for ClientError {
    fn from(value: ReadError) -> Self {
        match value {
            ReadError::Decode(err) => ClientError::Protocol(err),
            err => ClientError::Read(err),
        }
    }
}

impl From<EncodeError<Infallible>> for ClientError {
    fn from(value: EncodeError<Infallible>) -> Self {
        ClientError::Encode(value.into_writer_err())
    }
}

impl From<EncodeError<io::Error>> for ClientError {
    fn from(value: EncodeError<io::Error>) -> Self {
        match value {
            EncodeError::Write(err) => ClientError::Transport(err),
            err => ClientError::Encode(err),
        }
    }
}

impl From<DecodeError> for ClientError {
    fn from(value: DecodeError) -> Self {
        ClientError::Protocol(value)
    }
}

impl From<TopicError> for ClientError {
    fn from(value: TopicError) -> Self {
        ClientError::Topic(value)
    }
}

impl From<SubscribeError> for ClientError {
    fn from(value: SubscribeError) -> Self {
        match value {
            SubscribeError::Empty => ClientError::Topic(TopicError::Empty),
            SubscribeError::Topic(err) => ClientError::Topic(err),
        }
    }
}
