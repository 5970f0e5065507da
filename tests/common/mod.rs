//! In-process broker to test the client against.

#![allow(dead_code)]

use std::{
    io::{BufWriter, Write},
    net::{Shutdown, SocketAddr, TcpListener, TcpStream},
    sync::{Arc, Mutex, Once, PoisonError},
    thread,
    time::{Duration, Instant},
};

use mqtt_engine::{
    sync::{Options, PacketReader, ServerAddr},
    v3::{
        connect::{ConnAck, ConnectReturnCode},
        header::{ControlPacketType, PacketId},
        packet::ControlPacket,
        ping::PingResp,
        publish::{PubAck, Publish, PublishQos},
        subscribe::{ReturnCode, SubAck},
        topic,
        unsubscribe::UnsubAck,
        EncodePacket, QoS,
    },
};
use tracing::{debug, trace};

/// Publishes on topics with this prefix are never acknowledged.
pub const NO_ACK_PREFIX: &str = "noack/";
/// Publishes on topics with this prefix are acknowledged in batches, in reverse order.
pub const BATCH_PREFIX: &str = "batch/";
/// Subscriptions to filters with this prefix are refused.
pub const REJECT_PREFIX: &str = "reject/";
/// Subscriptions to filters with this prefix receive [`Config::burst`] QoS 1 messages.
pub const BURST_PREFIX: &str = "burst/";

pub fn init_tracing() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .init();
    });
}

/// Behaviour of the broker.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub return_code: ConnectReturnCode,
    /// Number of PUBACKs to hold for the [`BATCH_PREFIX`] topics.
    pub batch: usize,
    /// Answers the CONNECT with a PINGRESP.
    pub ping_on_connect: bool,
    /// Doesn't answer anything after the CONNACK.
    pub mute: bool,
    /// Messages sent after a subscription to a [`BURST_PREFIX`] filter.
    pub burst: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            return_code: ConnectReturnCode::Accepted,
            batch: 1,
            ping_on_connect: false,
            mute: false,
            burst: 0,
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    received: Mutex<Vec<ControlPacketType>>,
    pub_acks: Mutex<Vec<u16>>,
    streams: Mutex<Vec<TcpStream>>,
}

#[derive(Debug)]
pub struct Broker {
    addr: SocketAddr,
    shared: Arc<Shared>,
}

impl Broker {
    pub fn start() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        init_tracing();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let shared = Arc::new(Shared::default());

        {
            let shared = Arc::clone(&shared);

            thread::spawn(move || {
                for stream in listener.incoming() {
                    let Ok(stream) = stream else {
                        break;
                    };

                    shared
                        .streams
                        .lock()
                        .unwrap()
                        .push(stream.try_clone().unwrap());

                    let shared = Arc::clone(&shared);

                    thread::spawn(move || {
                        if let Err(err) = handle(stream, config, &shared) {
                            debug!(error = %err, "connection handler stopped");
                        }
                    });
                }
            });
        }

        Self { addr, shared }
    }

    pub fn server(&self) -> ServerAddr {
        ServerAddr::tcp(self.addr.ip().to_string(), self.addr.port())
    }

    pub fn options(&self, client_id: &str) -> Options {
        let mut opts = Options::new(client_id);

        opts.server(self.server());

        opts
    }

    /// Packet types received from the clients, in order.
    pub fn received(&self) -> Vec<ControlPacketType> {
        self.shared
            .received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Identifiers of the PUBACKs received from the clients, in order.
    pub fn pub_acks(&self) -> Vec<u16> {
        self.shared
            .pub_acks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn count(&self, packet_type: ControlPacketType) -> usize {
        self.received()
            .into_iter()
            .filter(|received| *received == packet_type)
            .count()
    }

    /// Waits until the broker received the packet type.
    pub fn wait_for(&self, packet_type: ControlPacketType, timeout: Duration) -> bool {
        wait_until(timeout, || self.count(packet_type) > 0)
    }

    /// Closes every client connection from the server side.
    pub fn close_connections(&self) {
        for stream in self.shared.streams.lock().unwrap().drain(..) {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

/// Polls the condition until it's true or the timeout expires.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;

    while Instant::now() < deadline {
        if cond() {
            return true;
        }

        thread::sleep(Duration::from_millis(10));
    }

    cond()
}

/// Address of a port nobody is listening on.
pub fn closed_server() -> ServerAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    drop(listener);

    ServerAddr::tcp("127.0.0.1", port)
}

fn send<P>(writer: &mut BufWriter<TcpStream>, packet: &P) -> color_eyre::Result<()>
where
    P: EncodePacket,
{
    packet.encode(writer)?;
    writer.flush()?;

    Ok(())
}

fn handle(stream: TcpStream, config: Config, shared: &Shared) -> color_eyre::Result<()> {
    let mut reader = PacketReader::new(stream.try_clone()?);
    let mut writer = BufWriter::new(stream);

    let mut subscriptions: Vec<String> = Vec::new();
    let mut held: Vec<PubAck> = Vec::new();
    let mut next_pkid: u16 = 1;

    loop {
        let packet = reader.recv()?;

        trace!(%packet, "broker received");

        shared
            .received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(packet.packet_type());

        if let ControlPacket::PubAck(ack) = &packet {
            shared
                .pub_acks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(ack.pkid().into());
        }

        let connect = matches!(packet, ControlPacket::Connect(_));

        if config.mute && !connect {
            continue;
        }

        match packet {
            ControlPacket::Connect(_) if config.ping_on_connect => {
                send(&mut writer, &PingResp)?;

                return Ok(());
            }
            ControlPacket::Connect(_) => {
                send(&mut writer, &ConnAck::new(false, config.return_code))?;

                if !config.return_code.is_accepted() {
                    return Ok(());
                }
            }
            ControlPacket::Publish(publish) => {
                let echo = subscriptions
                    .iter()
                    .any(|filter| topic::matches(filter, publish.topic()));

                if echo {
                    let qos = match publish.qos().level() {
                        QoS::AtMostOnce => PublishQos::AtMostOnce,
                        _ => {
                            let pkid = PacketId::try_from(next_pkid)?;
                            next_pkid = next_pkid.checked_add(1).unwrap_or(1);

                            PublishQos::AtLeastOnce { dup: false, pkid }
                        }
                    };

                    let forward =
                        Publish::new(publish.topic(), qos, false, publish.payload().to_vec())?;

                    send(&mut writer, &forward)?;
                }

                let Some(pkid) = publish.pkid() else {
                    continue;
                };

                if publish.topic().starts_with(NO_ACK_PREFIX) {
                    continue;
                }

                if publish.topic().starts_with(BATCH_PREFIX) {
                    held.push(PubAck::new(pkid));

                    if held.len() >= config.batch {
                        for ack in held.drain(..).rev() {
                            send(&mut writer, &ack)?;
                        }
                    }

                    continue;
                }

                send(&mut writer, &PubAck::new(pkid))?;
            }
            ControlPacket::Subscribe(subscribe) => {
                let burst = subscribe
                    .filters()
                    .iter()
                    .any(|filter| filter.topic().starts_with(BURST_PREFIX));

                let codes = subscribe
                    .filters()
                    .iter()
                    .map(|filter| {
                        if filter.topic().starts_with(REJECT_PREFIX) {
                            ReturnCode::Failure
                        } else {
                            subscriptions.push(filter.topic().to_string());

                            ReturnCode::from(filter.qos())
                        }
                    })
                    .collect();

                send(&mut writer, &SubAck::new(subscribe.pkid(), codes))?;

                if burst {
                    for i in 0..config.burst {
                        let pkid = PacketId::try_from(next_pkid)?;
                        next_pkid = next_pkid.checked_add(1).unwrap_or(1);

                        let publish = Publish::new(
                            format!("{BURST_PREFIX}{i}"),
                            PublishQos::AtLeastOnce { dup: false, pkid },
                            false,
                            i.to_be_bytes().to_vec(),
                        )?;

                        send(&mut writer, &publish)?;
                    }
                }
            }
            ControlPacket::Unsubscribe(unsubscribe) => {
                subscriptions.retain(|filter| !unsubscribe.topics().contains(filter));

                send(&mut writer, &UnsubAck::new(unsubscribe.pkid()))?;
            }
            ControlPacket::PingReq(_) => {
                send(&mut writer, &PingResp)?;
            }
            ControlPacket::PubAck(_) => {}
            ControlPacket::Disconnect(_) => return Ok(()),
            packet => {
                color_eyre::eyre::bail!("unexpected packet {}", packet.packet_type());
            }
        }
    }
}
