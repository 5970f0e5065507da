//! Keep alive exchange: PINGREQ from the client, PINGRESP from the server.

/// Tells the server the client is still there, and asks for a [`PingResp`].
///
/// Sent once a keep alive interval passes without any other packet from the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingReq;

header_only_packet!(PingReq);

/// Server reply to a [`PingReq`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingResp;

header_only_packet!(PingResp);
