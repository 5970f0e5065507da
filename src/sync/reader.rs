//! Reads whole control packets from a byte stream.

use core::num::NonZeroUsize;
use std::io::Read;

use tracing::trace;

use crate::v3::{header::FixedHeader, ControlPacket, Decode, DecodeError, MAX_PACKET_SIZE};

use super::error::ReadError;

/// Buffer to store the data read from the stream.
#[derive(Debug)]
pub struct ReadBuffer {
    buf: Vec<u8>,
    data_start: usize,
    data_end: usize,
    max_size: NonZeroUsize,
}

impl ReadBuffer {
    /// Starting size, enough for most packets.
    pub const DEFAULT_INITIAL: NonZeroUsize = const_non_zero(8 * 1024);

    /// Grows up to the largest packet MQTT allows.
    pub const DEFAULT_MAX_SIZE: NonZeroUsize = const_non_zero(MAX_PACKET_SIZE);

    /// Buffer starting at `initial` bytes, growing up to
    /// [`DEFAULT_MAX_SIZE`](Self::DEFAULT_MAX_SIZE).
    #[must_use]
    pub fn new(initial: NonZeroUsize) -> Self {
        Self::with_max_size(initial, Self::DEFAULT_MAX_SIZE)
    }

    /// Buffer starting at `initial` bytes, never larger than `max_size`.
    #[must_use]
    pub fn with_max_size(initial: NonZeroUsize, max_size: NonZeroUsize) -> Self {
        Self {
            buf: vec![0; initial.get().min(max_size.get())],
            data_start: 0,
            data_end: 0,
            max_size,
        }
    }

    fn is_empty(&self) -> bool {
        self.data_start == self.data_end
    }

    fn reset(&mut self) {
        self.data_start = 0;
        self.data_end = 0;
    }

    fn writable(&mut self) -> &mut [u8] {
        &mut self.buf[self.data_end..]
    }

    fn filled(&mut self, read: usize) {
        self.data_end = self.data_end.saturating_add(read).min(self.buf.len());
    }

    fn readable(&self) -> &[u8] {
        &self.buf[self.data_start..self.data_end]
    }

    fn writable_len(&self) -> usize {
        self.buf.len().saturating_sub(self.data_end)
    }

    fn readable_len(&self) -> usize {
        self.data_end.saturating_sub(self.data_start)
    }

    /// Moves the unread bytes to the front.
    fn compact(&mut self) {
        if self.data_start == 0 {
            return;
        }

        self.buf.copy_within(self.data_start..self.data_end, 0);

        self.data_end = self.readable_len();
        self.data_start = 0;
    }

    /// Parses the fixed header, consuming its bytes.
    fn parse_header(&mut self) -> Result<FixedHeader, DecodeError> {
        let readable = self.readable();

        let (header, rest) = FixedHeader::parse(readable)?;

        let consumed = readable.len().saturating_sub(rest.len());
        self.data_start = self.data_start.saturating_add(consumed);

        Ok(header)
    }

    /// Parses the packet body of `len` bytes, consuming it.
    fn parse_packet(
        &mut self,
        header: FixedHeader,
        len: usize,
    ) -> Result<ControlPacket, DecodeError> {
        debug_assert!(len <= self.readable_len());

        let start = self.data_start;
        let end = start.saturating_add(len).min(self.data_end);

        self.data_start = end;

        ControlPacket::parse_with_header(header, &self.buf[start..end])
    }

    /// Makes sure there are at least `needed` writable bytes after the data.
    fn reserve(&mut self, needed: usize) -> Result<(), ReadError> {
        if self.writable_len() >= needed {
            return Ok(());
        }

        self.compact();

        if self.writable_len() >= needed {
            return Ok(());
        }

        let required = self.data_end.saturating_add(needed);

        if required > self.max_size.get() {
            return Err(ReadError::OutOfMemory {
                max: self.max_size,
                required,
            });
        }

        // Over allocate to prevent frequent resizing, capped at the max size
        let new_len = self
            .buf
            .len()
            .saturating_mul(2)
            .max(required)
            .min(self.max_size.get());

        self.buf
            .try_reserve_exact(new_len.saturating_sub(self.buf.len()))?;
        self.buf.resize(new_len, 0);

        Ok(())
    }
}

impl Default for ReadBuffer {
    fn default() -> Self {
        ReadBuffer::new(Self::DEFAULT_INITIAL)
    }
}

/// Reads [`ControlPacket`] from a stream.
#[derive(Debug)]
pub struct PacketReader<R> {
    buf: ReadBuffer,
    stream: R,
}

impl<R> PacketReader<R>
where
    R: Read,
{
    /// Creates a reader with the default buffer.
    pub fn new(stream: R) -> Self {
        Self::with_read_buffer(stream, ReadBuffer::default())
    }

    /// Specify a configurable [`ReadBuffer`] for the reader.
    pub fn with_read_buffer(stream: R, buf: ReadBuffer) -> Self {
        Self { buf, stream }
    }

    /// Returns a reference to the underlying stream.
    pub fn get_ref(&self) -> &R {
        &self.stream
    }

    fn read(&mut self) -> Result<(), ReadError> {
        let read = self.stream.read(self.buf.writable())?;

        if read == 0 {
            return Err(ReadError::Disconnected);
        }

        trace!(read, "read bytes from the stream");

        self.buf.filled(read);

        Ok(())
    }

    /// Returns the next packet.
    ///
    /// Tries to parse the data in the buffer first. If more bytes are needed, makes sure the
    /// capacity is reserved and reads more from the stream.
    ///
    /// # Errors
    ///
    /// If the read fails, the stream is closed or the packet is malformed.
    pub fn recv(&mut self) -> Result<ControlPacket, ReadError> {
        if self.buf.is_empty() {
            self.buf.reset();
        }

        let header = loop {
            match self.buf.parse_header() {
                Ok(header) => break header,
                Err(DecodeError::NotEnoughBytes { needed }) => {
                    self.buf.reserve(needed)?;

                    self.read()?;
                }
                Err(err) => {
                    return Err(ReadError::Decode(err));
                }
            }
        };

        let len = usize::try_from(header.remaining_length()).map_err(DecodeError::RemainingLength)?;

        self.buf
            .reserve(len.saturating_sub(self.buf.readable_len()))?;

        while self.buf.readable_len() < len {
            self.read()?;
        }

        let packet = self.buf.parse_packet(header, len)?;

        Ok(packet)
    }
}

/// Const constructor for the [`NonZeroUsize`] without unsafe.
const fn const_non_zero(value: usize) -> NonZeroUsize {
    let Some(value) = NonZeroUsize::new(value) else {
        panic!("BUG: non zero value passed const_non_zero");
    };

    value
}

#[cfg(test)]
mod tests {
    use std::io::{self, Cursor};

    use pretty_assertions::assert_eq;

    use crate::v3::{
        header::PacketId,
        ping::PingResp,
        publish::{PubAck, Publish, PublishQos},
        EncodePacket,
    };

    use super::*;

    /// Returns the bytes one at the time.
    struct Trickle {
        bytes: Vec<u8>,
        pos: usize,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let Some(byte) = self.bytes.get(self.pos) else {
                return Ok(0);
            };

            buf[0] = *byte;
            self.pos += 1;

            Ok(1)
        }
    }

    fn small_buffer() -> ReadBuffer {
        ReadBuffer::with_max_size(
            NonZeroUsize::new(4).unwrap(),
            NonZeroUsize::new(1024).unwrap(),
        )
    }

    #[test]
    fn should_read_consecutive_packets() {
        let mut bytes = PingResp.to_bytes().unwrap();
        bytes.extend(PubAck::new(PacketId::MIN).to_bytes().unwrap());

        let mut reader = PacketReader::new(Cursor::new(bytes));

        assert_eq!(reader.recv().unwrap(), ControlPacket::PingResp(PingResp));
        assert_eq!(
            reader.recv().unwrap(),
            ControlPacket::PubAck(PubAck::new(PacketId::MIN))
        );

        let err = reader.recv().unwrap_err();
        assert!(matches!(err, ReadError::Disconnected), "{err:?}");
    }

    #[test]
    fn should_grow_for_partial_reads() {
        let publish = Publish::new("a/b", PublishQos::AtMostOnce, false, vec![7; 100]).unwrap();

        let mut bytes = publish.to_bytes().unwrap();
        bytes.extend(PingResp.to_bytes().unwrap());

        let stream = Trickle { bytes, pos: 0 };

        let mut reader = PacketReader::with_read_buffer(stream, small_buffer());

        assert_eq!(reader.recv().unwrap(), ControlPacket::Publish(publish));
        assert_eq!(reader.recv().unwrap(), ControlPacket::PingResp(PingResp));
    }

    #[test]
    fn should_refuse_packets_over_the_max_size() {
        let publish = Publish::new("a/b", PublishQos::AtMostOnce, false, vec![7; 2048]).unwrap();

        let bytes = publish.to_bytes().unwrap();

        let mut reader = PacketReader::with_read_buffer(Cursor::new(bytes), small_buffer());

        let err = reader.recv().unwrap_err();
        assert!(matches!(err, ReadError::OutOfMemory { .. }), "{err:?}");
    }

    #[test]
    fn should_return_decode_errors() {
        let mut reader = PacketReader::new(Cursor::new(vec![0b1111_0000, 0]));

        let err = reader.recv().unwrap_err();
        assert!(
            matches!(err, ReadError::Decode(DecodeError::PacketType(15))),
            "{err:?}"
        );
    }
}
