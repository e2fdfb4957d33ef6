//! Capability traits for the entities packets are routed to

use std::{io, net::SocketAddr, sync::Arc, time::Instant};

use async_trait::async_trait;
use bytes::BytesMut;
use thiserror::Error;

use crate::{packet::Header, Side};

/// A packet delivered to a handler
///
/// Ephemeral: one is built per datagram and dropped after delivery. Handlers
/// that need the bytes beyond the call own `payload` outright; nothing is
/// shared with the receive buffer.
#[derive(Debug)]
pub struct ReceivedPacket {
    /// Sender address
    pub remote: SocketAddr,
    /// Fully parsed header
    pub header: Header,
    /// Packet payload, truncated to the declared length for long headers
    pub payload: BytesMut,
    /// When the datagram was read off the socket
    ///
    /// Recorded before any parsing; feeds the connection's RTT and ack
    /// timing, not routing.
    pub rcv_time: Instant,
}

/// Why a handler is being torn down
///
/// Shutdown never fails; the reason is fanned out to every affected handler
/// instead of being returned to the caller.
#[derive(Debug, Clone, Error)]
pub enum CloseReason {
    /// A stateless reset matching the handler's token arrived
    #[error("received a stateless reset")]
    StatelessReset,
    /// The shared socket failed; every connection on it is dead
    #[error("socket read failed: {0}")]
    SocketError(Arc<io::Error>),
    /// The application shut the endpoint down
    #[error("endpoint closed by application")]
    LocalShutdown,
}

/// An established connection, from the routing layer's point of view
///
/// Implementations run their own processing loop on their own task; the
/// registry only holds a shared handle. `handle_packet` must enqueue rather
/// than process to completion, since it is called from the receive path.
/// `close` and `destroy` must be safe to call at any point of the
/// connection's own lifecycle, including while it is already terminating,
/// and must complete: [`HandlerMap::close`](crate::HandlerMap::close) and
/// [`HandlerMap::close_server`](crate::HandlerMap::close_server) block on
/// them.
#[async_trait]
pub trait ConnectionHandler: Send + Sync {
    /// Deliver a parsed packet; must not block
    fn handle_packet(&self, packet: ReceivedPacket);

    /// Whether this connection was initiated or accepted locally
    fn side(&self) -> Side;

    /// The version negotiated for this connection, or 0 before negotiation
    fn version(&self) -> u32;

    /// Close gracefully, resolving once the connection's loop has stopped
    async fn close(&self);

    /// Tear down immediately with the given reason; idempotent
    async fn destroy(&self, reason: CloseReason);
}

/// The listening server, which receives packets no connection claims
///
/// Long-header packets with an unknown destination ID are potential new
/// connections; a registered server gets them and decides whether to spawn
/// a connection (which then registers its own IDs).
#[async_trait]
pub trait ServerHandler: Send + Sync {
    /// Deliver a packet for an unknown connection ID; must not block
    fn handle_packet(&self, packet: ReceivedPacket);

    /// Stop accepting, resolving once pending work is abandoned
    async fn close_with_error(&self, reason: CloseReason);
}
