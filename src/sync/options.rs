//! Configuration of the [`Client`](super::Client).

use core::{fmt::Display, str::FromStr, time::Duration};
#[cfg(feature = "tls")]
use std::sync::Arc;

use crate::v3::{
    connect::{Connect, KeepAlive, Will},
    QoS,
};

use super::error::ClientError;

/// Scheme of a server address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// Plain TCP.
    Tcp,
    /// TLS over TCP.
    #[cfg(feature = "tls")]
    Tls,
}

impl Scheme {
    /// Default port of the scheme.
    #[must_use]
    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Tcp => 1883,
            #[cfg(feature = "tls")]
            Scheme::Tls => 8883,
        }
    }
}

/// Address of a server to connect to.
///
/// Parsed from `tcp://host:port`, `mqtt://host:port` or `host:port`. With the `tls` feature also
/// `tls://`, `ssl://` and `mqtts://` are accepted. The port is optional.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddr {
    scheme: Scheme,
    host: String,
    port: u16,
}

impl ServerAddr {
    /// Creates a plain TCP address.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: Scheme::Tcp,
            host: host.into(),
            port,
        }
    }

    /// Creates a TLS address.
    #[cfg(feature = "tls")]
    pub fn tls(host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: Scheme::Tls,
            host: host.into(),
            port,
        }
    }

    /// Returns the scheme.
    #[must_use]
    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// Returns the host name or IP.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Display for ServerAddr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let scheme = match self.scheme {
            Scheme::Tcp => "tcp",
            #[cfg(feature = "tls")]
            Scheme::Tls => "tls",
        };

        if self.host.contains(':') {
            write!(f, "{scheme}://[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{scheme}://{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for ServerAddr {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ClientError::InvalidAddress(s.to_string());

        let (scheme, rest) = match s.split_once("://") {
            Some(("tcp" | "mqtt", rest)) => (Scheme::Tcp, rest),
            #[cfg(feature = "tls")]
            Some(("tls" | "ssl" | "mqtts", rest)) => (Scheme::Tls, rest),
            Some(_) => return Err(invalid()),
            None => (Scheme::Tcp, s),
        };

        let rest = rest.trim_end_matches('/');

        let (host, port) = if let Some(ipv6) = rest.strip_prefix('[') {
            // [::1]:1883
            let (host, rest) = ipv6.split_once(']').ok_or_else(invalid)?;

            let port = match rest.strip_prefix(':') {
                Some(port) => Some(port),
                None if rest.is_empty() => None,
                None => return Err(invalid()),
            };

            (host, port)
        } else {
            match rest.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (rest, None),
            }
        };

        if host.is_empty() {
            return Err(invalid());
        }

        let port = match port {
            Some(port) => port.parse().map_err(|_| invalid())?,
            None => scheme.default_port(),
        };

        Ok(Self {
            scheme,
            host: host.to_string(),
            port,
        })
    }
}

/// Last will of the client, published by the server on an unexpected disconnection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    will: Will,
    qos: QoS,
    retain: bool,
}

/// Options for the connection.
#[derive(Clone)]
pub struct Options {
    pub(crate) servers: Vec<ServerAddr>,
    pub(crate) client_id: String,
    pub(crate) clean_session: bool,
    pub(crate) keep_alive: Duration,
    pub(crate) connect_timeout: Duration,
    pub(crate) write_timeout: Duration,
    pub(crate) username: Option<String>,
    pub(crate) password: Option<Vec<u8>>,
    pub(crate) will: Option<LastWill>,
    #[cfg(feature = "tls")]
    pub(crate) tls: Option<Arc<rustls::ClientConfig>>,
}

impl Options {
    /// Default keep alive interval.
    pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(30);
    /// Default timeout to dial a server.
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    /// Default timeout for a write to the connection.
    pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

    /// Creates the options with the given client identifier.
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            servers: Vec::new(),
            client_id: client_id.into(),
            clean_session: true,
            keep_alive: Self::DEFAULT_KEEP_ALIVE,
            connect_timeout: Self::DEFAULT_CONNECT_TIMEOUT,
            write_timeout: Self::DEFAULT_WRITE_TIMEOUT,
            username: None,
            password: None,
            will: None,
            #[cfg(feature = "tls")]
            tls: None,
        }
    }

    /// Appends a server to try, in order.
    pub fn server(&mut self, server: ServerAddr) -> &mut Self {
        self.servers.push(server);

        self
    }

    /// Parses and appends a server address.
    ///
    /// # Errors
    ///
    /// If the address is invalid.
    pub fn server_url(&mut self, url: &str) -> Result<&mut Self, ClientError> {
        let server = url.parse()?;

        Ok(self.server(server))
    }

    /// Sets the clean session flag.
    pub fn clean_session(&mut self, clean_session: bool) -> &mut Self {
        self.clean_session = clean_session;

        self
    }

    /// Sets the keep alive interval, `0` disables it.
    ///
    /// The interval is truncated to seconds, and capped at `u16::MAX` seconds.
    pub fn keep_alive(&mut self, keep_alive: Duration) -> &mut Self {
        self.keep_alive = Duration::from_secs(keep_alive.as_secs().min(u16::MAX.into()));

        self
    }

    /// Sets the timeout to dial a server.
    pub fn connect_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.connect_timeout = timeout;

        self
    }

    /// Sets the timeout for a write to the connection.
    pub fn write_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.write_timeout = timeout;

        self
    }

    /// Sets the username.
    pub fn username(&mut self, username: impl Into<String>) -> &mut Self {
        self.username = Some(username.into());

        self
    }

    /// Sets the password, it's sent only with a username.
    pub fn password(&mut self, password: impl Into<Vec<u8>>) -> &mut Self {
        self.password = Some(password.into());

        self
    }

    /// Sets the last will message.
    pub fn will(
        &mut self,
        topic: impl Into<String>,
        message: impl Into<Vec<u8>>,
        qos: QoS,
        retain: bool,
    ) -> &mut Self {
        self.will = Some(LastWill {
            will: Will::new(topic, message),
            qos,
            retain,
        });

        self
    }

    /// Sets the TLS configuration for the `tls://` servers.
    #[cfg(feature = "tls")]
    pub fn tls(&mut self, config: Arc<rustls::ClientConfig>) -> &mut Self {
        self.tls = Some(config);

        self
    }

    /// Returns the keep alive interval.
    #[must_use]
    pub fn keep_alive_interval(&self) -> Duration {
        self.keep_alive
    }

    /// Returns the configured servers.
    #[must_use]
    pub fn servers(&self) -> &[ServerAddr] {
        &self.servers
    }

    /// Builds the CONNECT packet.
    pub(crate) fn connect_packet(&self) -> Connect {
        let keep_alive = KeepAlive::try_from(self.keep_alive).unwrap_or(KeepAlive::from(u16::MAX));

        let mut connect = Connect::new(self.client_id.clone(), keep_alive);

        if self.clean_session {
            connect.clean_session();
        }

        if let Some(LastWill { will, qos, retain }) = &self.will {
            connect.will(will.clone(), *qos, *retain);
        }

        match (&self.username, &self.password) {
            (Some(username), Some(password)) => {
                connect.username_password(username.clone(), password.clone());
            }
            (Some(username), None) => {
                connect.username(username.clone());
            }
            (None, _) => {}
        }

        connect
    }
}

impl Default for Options {
    fn default() -> Self {
        Self::new("")
    }
}

impl core::fmt::Debug for Options {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut debug = f.debug_struct("Options");

        debug
            .field("servers", &self.servers)
            .field("client_id", &self.client_id)
            .field("clean_session", &self.clean_session)
            .field("keep_alive", &self.keep_alive)
            .field("connect_timeout", &self.connect_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "..."))
            .field("will", &self.will);

        #[cfg(feature = "tls")]
        debug.field("tls", &self.tls.is_some());

        debug.finish()
    }
}
