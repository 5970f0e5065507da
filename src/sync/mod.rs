//! Blocking client using the standard library [`TcpStream`](std::net::TcpStream) and threads.
//!
//! Every command runs on the calling thread and waits for its acknowledgment. Each live
//! connection owns an inbound thread, reading and dispatching the packets from the server, and a
//! keep alive thread.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use tracing::{debug, info, instrument, warn};

use crate::v3::{
    header::ControlPacketType,
    publish::{Publish, PublishQos},
    subscribe::{Subscribe, TopicFilter},
    topic,
    unsubscribe::Unsubscribe,
    QoS,
};

use self::{
    inflight::Ack,
    link::{Connection, EstablishError, Link, State},
};

pub use self::error::{ClientError, ReadError};
pub use self::link::ConnectionState;
pub use self::options::{Options, Scheme, ServerAddr};
pub use self::reader::{PacketReader, ReadBuffer};
pub use self::router::{Message, MessageHandler};

mod error;
mod inflight;
mod link;
mod options;
mod pkid;
mod reader;
mod router;
mod transport;

/// Result of a successful connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAckInfo {
    session_present: bool,
}

impl ConnAckInfo {
    /// Returns `true` if the server resumed a previous session.
    #[must_use]
    pub fn session_present(&self) -> bool {
        self.session_present
    }
}

/// MQTT client.
///
/// The client can be shared between threads, the commands are serialized on the connection.
/// Message handlers run on the inbound thread: they must not wait for an acknowledgment, since
/// it's read by the same thread.
#[derive(Debug)]
pub struct Client {
    opts: Options,
    state: Arc<State>,
    router: Arc<router::Router>,
    link: Mutex<Option<Link>>,
}

impl Client {
    /// Creates a disconnected client.
    #[must_use]
    pub fn new(opts: Options) -> Self {
        Self {
            opts,
            state: Arc::new(State::default()),
            router: Arc::new(router::Router::default()),
            link: Mutex::new(None),
        }
    }

    fn lock_link(&self) -> MutexGuard<'_, Option<Link>> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the live connection.
    fn connection(&self) -> Result<Arc<Connection>, ClientError> {
        self.lock_link()
            .as_ref()
            .map(Link::connection)
            .filter(|conn| !conn.is_closed())
            .cloned()
            .ok_or(ClientError::NotConnected)
    }

    /// Connects to the first reachable server, in the configured order.
    ///
    /// # Errors
    ///
    /// If the client is already connected, the server refused the connection, or none of the
    /// servers could be reached before the timeout.
    #[instrument(skip(self), fields(client_id = %self.opts.client_id))]
    pub fn connect(&self, timeout: Duration) -> Result<ConnAckInfo, ClientError> {
        let deadline = Instant::now() + timeout;

        let closed = {
            let mut link = self.lock_link();

            match link.take() {
                Some(current) if !current.connection().is_closed() => {
                    *link = Some(current);

                    return Err(ClientError::AlreadyConnected);
                }
                closed => closed,
            }
        };

        // A handler of the closed link could be waiting on the lock
        if let Some(closed) = closed {
            debug!("reaping the closed connection");

            closed.join();
        }

        let mut link = self.lock_link();

        if link.is_some() {
            return Err(ClientError::AlreadyConnected);
        }

        self.state.set(ConnectionState::Connecting);

        let mut last_err = ClientError::NoServers;

        for server in &self.opts.servers {
            match Link::establish(server, &self.opts, deadline, &self.state, &self.router) {
                Ok((established, conn_ack)) => {
                    info!(%server, session_present = conn_ack.session_present(), "connected");

                    *link = Some(established);

                    return Ok(ConnAckInfo {
                        session_present: conn_ack.session_present(),
                    });
                }
                Err(EstablishError::Dial(err)) if !matches!(err, ClientError::Timeout) => {
                    warn!(%server, error = %err, "couldn't connect to the server");

                    last_err = err;
                }
                Err(err) => {
                    let err = err.into_inner();

                    warn!(%server, error = %err, "connection failed");

                    self.state.set(ConnectionState::Disconnected);

                    return Err(err);
                }
            }
        }

        self.state.set(ConnectionState::Disconnected);

        Err(last_err)
    }

    /// Sends the DISCONNECT and closes the connection.
    ///
    /// Does nothing if the client is not connected.
    ///
    /// # Errors
    ///
    /// If the DISCONNECT couldn't be written, the connection is closed anyway.
    #[instrument(skip(self))]
    pub fn disconnect(&self, timeout: Duration) -> Result<(), ClientError> {
        let Some(link) = self.lock_link().take() else {
            debug!("already disconnected");

            return Ok(());
        };

        link.disconnect(timeout)
    }

    /// Publishes a message.
    ///
    /// With [`QoS::AtLeastOnce`] waits for the PUBACK.
    ///
    /// # Errors
    ///
    /// If the topic is invalid, the QoS is [`QoS::ExactlyOnce`], the client is disconnected or the
    /// acknowledgment wasn't received before the timeout.
    #[instrument(skip(self, payload))]
    pub fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: impl Into<Vec<u8>>,
        timeout: Duration,
    ) -> Result<(), ClientError> {
        topic::validate_topic_name(topic)?;

        match qos {
            QoS::AtMostOnce => {
                let conn = self.connection()?;

                let publish = Publish::new(topic, PublishQos::AtMostOnce, retain, payload)?;

                conn.send(&publish)
            }
            QoS::AtLeastOnce => {
                let conn = self.connection()?;

                let pending = conn.inflight().register(ControlPacketType::PubAck)?;

                let qos = PublishQos::AtLeastOnce {
                    dup: false,
                    pkid: pending.pkid(),
                };
                let publish = Publish::new(topic, qos, retain, payload)?;

                conn.send(&publish)?;

                match pending.wait(timeout)? {
                    Ack::PubAck(_) => Ok(()),
                    ack => Err(ClientError::UnexpectedPacket(ack.packet_type())),
                }
            }
            QoS::ExactlyOnce => Err(ClientError::UnsupportedQos),
        }
    }

    /// Subscribes to a topic filter, returning the granted QoS.
    ///
    /// The handler, if given, is invoked for every message matching the filter.
    ///
    /// # Errors
    ///
    /// If the filter is invalid, the server refused the subscription or the SUBACK wasn't received
    /// before the timeout.
    #[instrument(skip(self, handler))]
    pub fn subscribe(
        &self,
        filter: &str,
        qos: QoS,
        handler: Option<MessageHandler>,
        timeout: Duration,
    ) -> Result<QoS, ClientError> {
        let granted = self.subscribe_multiple(&[(filter, qos)], handler, timeout)?;

        granted
            .first()
            .copied()
            .ok_or(ClientError::UnexpectedPacket(ControlPacketType::SubAck))
    }

    /// Subscribes to multiple topic filters with a single SUBSCRIBE.
    ///
    /// Returns the QoS granted for each filter. The granted filters are routed to the handler even
    /// if others were refused.
    ///
    /// # Errors
    ///
    /// If a filter is invalid, some subscriptions were refused or the SUBACK wasn't received
    /// before the timeout.
    #[instrument(skip(self, handler))]
    pub fn subscribe_multiple(
        &self,
        filters: &[(&str, QoS)],
        handler: Option<MessageHandler>,
        timeout: Duration,
    ) -> Result<Vec<QoS>, ClientError> {
        if filters.iter().any(|(_, qos)| *qos == QoS::ExactlyOnce) {
            return Err(ClientError::UnsupportedQos);
        }

        let conn = self.connection()?;

        let pending = conn.inflight().register(ControlPacketType::SubAck)?;

        let topic_filters = filters
            .iter()
            .map(|(filter, qos)| TopicFilter::new(*filter, *qos))
            .collect();
        let subscribe = Subscribe::new(pending.pkid(), topic_filters)?;

        conn.send(&subscribe)?;

        let sub_ack = match pending.wait(timeout)? {
            Ack::SubAck(sub_ack) => sub_ack,
            ack => return Err(ClientError::UnexpectedPacket(ack.packet_type())),
        };

        if sub_ack.return_codes().len() != filters.len() {
            warn!(
                expected = filters.len(),
                received = sub_ack.return_codes().len(),
                "wrong number of return codes in the SUBACK"
            );

            return Err(ClientError::UnexpectedPacket(ControlPacketType::SubAck));
        }

        let mut granted = Vec::with_capacity(filters.len());
        let mut rejected = Vec::new();

        for ((filter, _), code) in filters.iter().zip(sub_ack.return_codes()) {
            match code.granted() {
                Some(qos) => {
                    self.router.register(filter, qos, handler.clone());

                    granted.push(qos);
                }
                None => {
                    warn!(filter, "subscription refused");

                    rejected.push((*filter).to_string());
                }
            }
        }

        if !rejected.is_empty() {
            return Err(ClientError::SubscribeRejected { filters: rejected });
        }

        Ok(granted)
    }

    /// Unsubscribes from the topic filters and removes their routes.
    ///
    /// # Errors
    ///
    /// If a filter is invalid or the UNSUBACK wasn't received before the timeout.
    #[instrument(skip(self))]
    pub fn unsubscribe(&self, filters: &[&str], timeout: Duration) -> Result<(), ClientError> {
        let conn = self.connection()?;

        let pending = conn.inflight().register(ControlPacketType::UnsubAck)?;

        let topics = filters.iter().map(|filter| (*filter).to_string()).collect();
        let unsubscribe = Unsubscribe::new(pending.pkid(), topics)?;

        conn.send(&unsubscribe)?;

        match pending.wait(timeout)? {
            Ack::UnsubAck(_) => {}
            ack => return Err(ClientError::UnexpectedPacket(ack.packet_type())),
        }

        for filter in filters {
            self.router.unregister(filter);
        }

        Ok(())
    }

    /// Installs or replaces the handler for the messages matching the filter.
    ///
    /// It doesn't subscribe to the filter.
    ///
    /// # Errors
    ///
    /// If the filter is invalid.
    pub fn set_route<F>(&self, filter: &str, handler: F) -> Result<(), ClientError>
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        topic::validate_topic_filter(filter)?;

        self.router.set_route(filter, Arc::new(handler));

        Ok(())
    }

    /// Returns `true` if the client is connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Returns the state of the connection.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Returns the options of the client.
    #[must_use]
    pub fn options(&self) -> &Options {
        &self.opts
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        let link = self
            .link
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(link) = link {
            if let Err(err) = link.disconnect(self.opts.write_timeout) {
                debug!(error = %err, "couldn't disconnect on drop");
            }
        }
    }
}
