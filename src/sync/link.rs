//! A live connection to the server and its background threads.

use core::fmt::Display;
use std::{
    io::{BufWriter, Write},
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use tracing::{debug, error, info, trace, warn};

use crate::v3::{
    connect::{ConnAck, Connect},
    disconnect::Disconnect,
    packet::ControlPacket,
    ping::PingReq,
    publish::{PubAck, PublishQos},
    EncodePacket,
};

use super::{
    error::{ClientError, ReadError},
    inflight::{Ack, Inflight},
    options::{Options, ServerAddr},
    reader::PacketReader,
    router::{Message, Router},
    transport::{BoxReader, BoxWriter, Transport},
};

/// Lifecycle of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection to the server.
    Disconnected = 0,
    /// The connection handshake is in progress.
    Connecting = 1,
    /// Connected to the server.
    Connected = 2,
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

/// Connection state shared between the client and the threads of the link.
#[derive(Debug)]
pub(crate) struct State(AtomicU8);

impl State {
    pub(crate) fn get(&self) -> ConnectionState {
        match self.0.load(Ordering::Acquire) {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }

    pub(crate) fn set(&self, state: ConnectionState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

impl Default for State {
    fn default() -> Self {
        Self(AtomicU8::new(ConnectionState::Disconnected as u8))
    }
}

/// Messages for the keep alive thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    /// A packet was written, restart the timer.
    Reset,
    /// The connection is closing.
    Exit,
}

/// Shared half of the link, used by the client commands and both threads.
pub(crate) struct Connection {
    transport: Transport,
    writer: Mutex<BufWriter<BoxWriter>>,
    signal: Sender<Signal>,
    inflight: Arc<Inflight>,
    state: Arc<State>,
    keep_alive: Duration,
    last_inbound: Mutex<Instant>,
    closed: AtomicBool,
}

impl core::fmt::Debug for Connection {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Connection")
            .field("transport", &self.transport)
            .field("inflight", &self.inflight)
            .field("state", &self.state.get())
            .field("keep_alive", &self.keep_alive)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl Connection {
    fn lock_writer(&self) -> MutexGuard<'_, BufWriter<BoxWriter>> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn inflight(&self) -> &Arc<Inflight> {
        &self.inflight
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Writes a whole packet, serialized with the other writers.
    ///
    /// The packet is encoded before touching the stream, an invalid packet only fails this call.
    /// A failed write closes the connection, since a partial frame can't be recovered.
    pub(crate) fn send<P>(&self, packet: &P) -> Result<(), ClientError>
    where
        P: EncodePacket + Display,
    {
        if self.is_closed() {
            return Err(ClientError::NotConnected);
        }

        let frame = packet.to_bytes()?;

        let res = {
            let mut writer = self.lock_writer();

            writer.write_all(&frame).and_then(|()| writer.flush())
        };

        match res {
            Ok(()) => {
                trace!(%packet, "packet sent");

                // The keep alive thread could have exited already
                let _ = self.signal.send(Signal::Reset);

                Ok(())
            }
            Err(err) => {
                if self.close() {
                    error!(error = %err, "couldn't write to the connection");
                }

                Err(ClientError::Transport(err))
            }
        }
    }

    fn touch(&self) {
        *self
            .last_inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn inbound_idle(&self) -> Duration {
        self.last_inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    /// Tears the connection down, only the first call has effect.
    ///
    /// Returns `true` if this call closed the connection.
    pub(crate) fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }

        self.state.set(ConnectionState::Disconnected);

        self.transport.shutdown();

        let _ = self.signal.send(Signal::Exit);

        self.inflight.fail_all();

        info!("connection closed");

        true
    }
}

/// Failure to establish a [`Link`].
#[derive(Debug)]
pub(crate) enum EstablishError {
    /// The server couldn't be reached.
    Dial(ClientError),
    /// The server was reached, but the session couldn't be opened.
    Session(ClientError),
}

impl EstablishError {
    pub(crate) fn into_inner(self) -> ClientError {
        match self {
            EstablishError::Dial(err) | EstablishError::Session(err) => err,
        }
    }
}

/// A live connection with its inbound and keep alive threads.
#[derive(Debug)]
pub(crate) struct Link {
    conn: Arc<Connection>,
    inbound: Option<JoinHandle<()>>,
    keep_alive: Option<JoinHandle<()>>,
}

impl Link {
    /// Dials the server and performs the CONNECT handshake before the deadline.
    ///
    /// Only the failures before the server is reached are [`EstablishError::Dial`].
    pub(crate) fn establish(
        server: &ServerAddr,
        opts: &Options,
        deadline: Instant,
        state: &Arc<State>,
        router: &Arc<Router>,
    ) -> Result<(Self, ConnAck), EstablishError> {
        let (transport, reader, writer) = remaining(deadline)
            .and_then(|remaining| {
                Transport::dial(server, opts.connect_timeout.min(remaining), opts)
                    .map_err(ClientError::from)
            })
            .map_err(EstablishError::Dial)?;

        debug!(%server, "connected to the server");

        Self::open(transport, reader, writer, opts, deadline, state, router)
            .map_err(EstablishError::Session)
    }

    /// Runs the handshake on a dialed connection and starts the threads.
    fn open(
        transport: Transport,
        reader: BoxReader,
        writer: BoxWriter,
        opts: &Options,
        deadline: Instant,
        state: &Arc<State>,
        router: &Arc<Router>,
    ) -> Result<(Self, ConnAck), ClientError> {
        let mut writer = BufWriter::new(writer);
        let mut reader = PacketReader::new(reader);

        let connect = opts.connect_packet();
        let keep_alive = connect.keep_alive().as_duration();

        let conn_ack = handshake(&transport, &mut reader, &mut writer, &connect, deadline, opts)
            .map_err(|err| {
                transport.shutdown();

                err
            })?;

        if !conn_ack.return_code().is_accepted() {
            transport.shutdown();

            return Err(ClientError::Handshake(conn_ack.return_code()));
        }

        // Two intervals without any packet from the server
        transport.set_read_timeout(Some(keep_alive.saturating_mul(2)))?;
        transport.set_write_timeout(Some(opts.write_timeout))?;

        let (signal, signals) = mpsc::channel();

        let conn = Arc::new(Connection {
            transport,
            writer: Mutex::new(writer),
            signal,
            inflight: Arc::new(Inflight::default()),
            state: Arc::clone(state),
            keep_alive,
            last_inbound: Mutex::new(Instant::now()),
            closed: AtomicBool::new(false),
        });

        state.set(ConnectionState::Connected);

        let inbound = {
            let conn = Arc::clone(&conn);
            let router = Arc::clone(router);

            thread::Builder::new()
                .name("mqtt-inbound".to_string())
                .spawn(move || inbound_loop(&conn, reader, &router))
        };

        let inbound = match inbound {
            Ok(handle) => handle,
            Err(err) => {
                conn.close();

                return Err(err.into());
            }
        };

        let keep_alive = {
            let conn = Arc::clone(&conn);

            thread::Builder::new()
                .name("mqtt-keep-alive".to_string())
                .spawn(move || keep_alive_loop(&conn, &signals))
        };

        let keep_alive = match keep_alive {
            Ok(handle) => handle,
            Err(err) => {
                conn.close();

                let link = Self {
                    conn,
                    inbound: Some(inbound),
                    keep_alive: None,
                };
                link.join();

                return Err(err.into());
            }
        };

        let link = Self {
            conn,
            inbound: Some(inbound),
            keep_alive: Some(keep_alive),
        };

        Ok((link, conn_ack))
    }

    pub(crate) fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Sends the DISCONNECT, closes the connection and waits for the threads.
    pub(crate) fn disconnect(self, timeout: Duration) -> Result<(), ClientError> {
        let res = if self.conn.is_closed() {
            Ok(())
        } else {
            self.conn
                .transport
                .set_write_timeout(Some(timeout))
                .map_err(ClientError::from)
                .and_then(|()| self.conn.send(&Disconnect))
        };

        self.conn.close();

        self.join();

        res
    }

    /// Waits for the threads to exit.
    ///
    /// The current thread is skipped, when called from a message handler.
    pub(crate) fn join(mut self) {
        let current = thread::current().id();

        for handle in [self.inbound.take(), self.keep_alive.take()]
            .into_iter()
            .flatten()
        {
            if handle.thread().id() == current {
                trace!("skipping join of the current thread");

                continue;
            }

            let name = handle.thread().name().unwrap_or("unnamed").to_string();

            if handle.join().is_err() {
                error!(thread = name, "thread panicked");
            }
        }
    }
}

fn remaining(deadline: Instant) -> Result<Duration, ClientError> {
    let remaining = deadline.saturating_duration_since(Instant::now());

    if remaining.is_zero() {
        return Err(ClientError::Timeout);
    }

    Ok(remaining)
}

fn handshake(
    transport: &Transport,
    reader: &mut PacketReader<BoxReader>,
    writer: &mut BufWriter<BoxWriter>,
    connect: &Connect,
    deadline: Instant,
    opts: &Options,
) -> Result<ConnAck, ClientError> {
    transport.set_write_timeout(Some(opts.write_timeout.min(remaining(deadline)?)))?;

    connect.encode(writer)?;
    writer.flush()?;

    trace!(%connect, "sent CONNECT");

    transport.set_read_timeout(Some(remaining(deadline)?))?;

    let packet = reader.recv().map_err(|err| {
        if err.is_timeout() {
            ClientError::Timeout
        } else {
            ClientError::from(err)
        }
    })?;

    match packet.try_into_conn_ack() {
        Ok(conn_ack) => {
            debug!(%conn_ack, "received CONNACK");

            Ok(conn_ack)
        }
        Err(packet) => Err(ClientError::UnexpectedPacket(packet.packet_type())),
    }
}

/// Reads the packets from the server until the connection is closed.
fn inbound_loop(conn: &Connection, mut reader: PacketReader<BoxReader>, router: &Router) {
    loop {
        let packet = match reader.recv() {
            Ok(packet) => packet,
            Err(err) => {
                if conn.is_closed() {
                    debug!("connection closed, stopping the inbound loop");
                } else if err.is_timeout() {
                    warn!("no packet received from the server in the keep alive interval");
                } else if matches!(err, ReadError::Disconnected) {
                    warn!("connection closed by the server");
                } else {
                    error!(error = %err, "couldn't read the packet");
                }

                break;
            }
        };

        conn.touch();

        trace!(%packet, "received packet");

        match packet {
            ControlPacket::PubAck(ack) => {
                conn.inflight.deliver(Ack::PubAck(ack));
            }
            ControlPacket::SubAck(ack) => {
                conn.inflight.deliver(Ack::SubAck(ack));
            }
            ControlPacket::UnsubAck(ack) => {
                conn.inflight.deliver(Ack::UnsubAck(ack));
            }
            ControlPacket::Publish(publish) => {
                let qos = publish.qos();

                router.dispatch(&Message::from(publish));

                match qos {
                    PublishQos::AtMostOnce => {}
                    PublishQos::AtLeastOnce { pkid, .. } => {
                        if let Err(err) = conn.send(&PubAck::new(pkid)) {
                            debug!(error = %err, %pkid, "couldn't acknowledge the publish");

                            break;
                        }
                    }
                    PublishQos::ExactlyOnce { pkid, .. } => {
                        warn!(%pkid, "QoS 2 is not supported, the publish won't be acknowledged");
                    }
                }
            }
            ControlPacket::PingResp(_) => {
                trace!("received PINGRESP");
            }
            packet => {
                error!(packet_type = %packet.packet_type(), "unexpected packet from the server");

                break;
            }
        }
    }

    conn.close();
}

/// Sends a PINGREQ when the connection has been idle for the keep alive interval.
///
/// Writes restart the timer only while the server keeps sending packets, so the read timeout of
/// the inbound loop is never reached on a healthy connection.
fn keep_alive_loop(conn: &Connection, signals: &Receiver<Signal>) {
    if conn.keep_alive.is_zero() {
        // Wait for the exit
        while let Ok(Signal::Reset) = signals.recv() {}

        return;
    }

    let mut deadline = Instant::now() + conn.keep_alive;

    loop {
        let timeout = deadline.saturating_duration_since(Instant::now());

        match signals.recv_timeout(timeout) {
            Ok(Signal::Reset) => {
                if conn.inbound_idle() < conn.keep_alive {
                    deadline = Instant::now() + conn.keep_alive;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                trace!("sending PINGREQ");

                if let Err(err) = conn.send(&PingReq) {
                    debug!(error = %err, "couldn't send the PINGREQ");

                    break;
                }

                deadline = Instant::now() + conn.keep_alive;
            }
            Ok(Signal::Exit) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    debug!("keep alive loop exited");
}
