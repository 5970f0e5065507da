//! Clean shutdown of a connection by the client.

/// Last packet the client sends before closing the network connection.
///
/// The server discards the Will Message of a client that disconnects with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disconnect;

header_only_packet!(Disconnect);
