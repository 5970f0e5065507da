//! Network streams to the server.

use std::{
    io::{self, Read, Write},
    net::{Shutdown, TcpStream, ToSocketAddrs},
    time::Duration,
};

use tracing::{debug, trace};

use super::options::{Options, Scheme, ServerAddr};

/// Reading half of the connection.
pub(crate) type BoxReader = Box<dyn Read + Send>;
/// Writing half of the connection.
pub(crate) type BoxWriter = Box<dyn Write + Send>;

/// A connected stream, split in the reading and writing halves.
///
/// The socket is kept to set the timeouts and shut the connection down.
#[derive(Debug)]
pub(crate) struct Transport {
    socket: TcpStream,
}

impl Transport {
    /// Dials the server, with the TCP connect bounded by the timeout.
    #[cfg_attr(not(feature = "tls"), allow(unused_variables))]
    pub(crate) fn dial(
        server: &ServerAddr,
        timeout: Duration,
        opts: &Options,
    ) -> io::Result<(Self, BoxReader, BoxWriter)> {
        let socket = connect_tcp(server, timeout)?;

        socket.set_nodelay(true)?;

        match server.scheme() {
            Scheme::Tcp => {
                let reader = socket.try_clone()?;
                let writer = socket.try_clone()?;

                Ok((Self { socket }, Box::new(reader), Box::new(writer)))
            }
            #[cfg(feature = "tls")]
            Scheme::Tls => {
                let (reader, writer) = tls::handshake(&socket, server, timeout, opts)?;

                Ok((Self { socket }, Box::new(reader), Box::new(writer)))
            }
        }
    }

    /// Sets the timeout for the reads, [`None`] blocks indefinitely.
    pub(crate) fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.socket.set_read_timeout(timeout.filter(|t| !t.is_zero()))
    }

    /// Sets the timeout for the writes.
    pub(crate) fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.socket.set_write_timeout(timeout.filter(|t| !t.is_zero()))
    }

    /// Shuts both halves of the connection down, unblocking the reader.
    pub(crate) fn shutdown(&self) {
        if let Err(err) = self.socket.shutdown(Shutdown::Both) {
            // Already closed by the peer
            debug!(error = %err, "couldn't shutdown the socket");
        }
    }
}

fn connect_tcp(server: &ServerAddr, timeout: Duration) -> io::Result<TcpStream> {
    let addrs = (server.host(), server.port()).to_socket_addrs()?;

    let mut last_err = None;

    for addr in addrs {
        trace!(%addr, "connecting");

        let res = if timeout.is_zero() {
            TcpStream::connect(addr)
        } else {
            TcpStream::connect_timeout(&addr, timeout)
        };

        match res {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                debug!(%addr, error = %err, "couldn't connect");

                last_err = Some(err);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("no address found for {server}"),
        )
    }))
}

#[cfg(feature = "tls")]
mod tls {
    use std::{
        io::{self, Read, Write},
        net::TcpStream,
        sync::{Arc, Mutex, MutexGuard, PoisonError},
        time::Duration,
    };

    use rustls::{pki_types::ServerName, ClientConnection};
    use tracing::trace;

    use crate::sync::options::{Options, ServerAddr};

    type Shared = Arc<Mutex<ClientConnection>>;

    fn lock(conn: &Shared) -> MutexGuard<'_, ClientConnection> {
        conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn tls_error(err: rustls::Error) -> io::Error {
        io::Error::new(io::ErrorKind::InvalidData, err)
    }

    /// Performs the TLS handshake and splits the connection.
    pub(super) fn handshake(
        socket: &TcpStream,
        server: &ServerAddr,
        timeout: Duration,
        opts: &Options,
    ) -> io::Result<(TlsReader, TlsWriter)> {
        let config = opts.tls.clone().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "missing TLS configuration for the server",
            )
        })?;

        let name = ServerName::try_from(server.host().to_string())
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;

        let mut conn = ClientConnection::new(config, name).map_err(tls_error)?;

        let timeout = Some(timeout).filter(|t| !t.is_zero());
        socket.set_read_timeout(timeout)?;
        socket.set_write_timeout(timeout)?;

        let mut stream = socket.try_clone()?;
        while conn.is_handshaking() {
            conn.complete_io(&mut stream)?;
        }

        trace!("TLS handshake completed");

        let conn = Arc::new(Mutex::new(conn));

        let reader = TlsReader {
            socket: socket.try_clone()?,
            conn: Arc::clone(&conn),
            raw: vec![0; 16 * 1024],
        };
        let writer = TlsWriter { socket: stream, conn };

        Ok((reader, writer))
    }

    /// Reads the TLS records from the socket, without holding the lock while blocked.
    pub(super) struct TlsReader {
        socket: TcpStream,
        conn: Shared,
        raw: Vec<u8>,
    }

    impl Read for TlsReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            loop {
                match lock(&self.conn).reader().read(buf) {
                    Ok(read) => return Ok(read),
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                    Err(err) => return Err(err),
                }

                let read = self.socket.read(&mut self.raw)?;
                if read == 0 {
                    return Ok(0);
                }

                let mut conn = lock(&self.conn);
                let mut records = &self.raw[..read];

                while !records.is_empty() {
                    conn.read_tls(&mut records)?;

                    conn.process_new_packets().map_err(tls_error)?;
                }

                // Alerts or key updates
                while conn.wants_write() {
                    conn.write_tls(&mut self.socket)?;
                }
            }
        }
    }

    /// Encrypts the data and writes the records to the socket.
    pub(super) struct TlsWriter {
        socket: TcpStream,
        conn: Shared,
    }

    impl TlsWriter {
        fn write_records(&mut self, conn: &mut ClientConnection) -> io::Result<()> {
            while conn.wants_write() {
                conn.write_tls(&mut self.socket)?;
            }

            Ok(())
        }
    }

    impl Write for TlsWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let conn = Arc::clone(&self.conn);
            let mut conn = lock(&conn);

            let written = conn.writer().write(buf)?;

            self.write_records(&mut conn)?;

            Ok(written)
        }

        fn flush(&mut self) -> io::Result<()> {
            let conn = Arc::clone(&self.conn);
            let mut conn = lock(&conn);

            conn.writer().flush()?;

            self.write_records(&mut conn)?;

            self.socket.flush()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use super::*;

    #[test]
    fn should_dial_a_listening_server() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = ServerAddr::tcp("127.0.0.1", port);

        let (transport, _reader, mut writer) =
            Transport::dial(&server, Duration::from_secs(1), &Options::default()).unwrap();

        let (mut accepted, _) = listener.accept().unwrap();

        writer.write_all(b"ping").unwrap();
        writer.flush().unwrap();

        let mut buf = [0; 4];
        accepted.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        transport.shutdown();

        let read = accepted.read(&mut buf).unwrap();
        assert_eq!(read, 0);
    }

    #[test]
    fn should_fail_to_dial_a_closed_port() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let server = ServerAddr::tcp("127.0.0.1", port);

        assert!(Transport::dial(&server, Duration::from_secs(1), &Options::default()).is_err());
    }
}
